//! Integration tests for end-to-end session synchronization.
//!
//! These tests start a real server and connect real clients (and raw
//! WebSocket peers where exact timestamps matter), verifying the full
//! mutate → broadcast → resolve pipeline.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use kvsync::client::{ClientConfig, SyncClient, SyncContext, SyncEvent};
use kvsync::protocol::SyncMessage;
use kvsync::server::SyncServer;
use kvsync::storage::{ReplicaStore, StoreConfig};
use kvsync::transport::{ReconnectingTransport, TransportConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port and its storage dir.
async fn start_test_server() -> (u16, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port().await;
    let server = Arc::new(SyncServer::with_storage(
        format!("127.0.0.1:{port}"),
        dir.path(),
    ));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, dir)
}

fn server_url(port: u16, session: &str) -> String {
    format!("ws://127.0.0.1:{port}/{session}")
}

/// Context with a fresh throwaway replica and a fast-backoff transport.
fn test_ctx(port: u16, session: &str, dir: &tempfile::TempDir) -> Arc<SyncContext> {
    let replica = ReplicaStore::open(StoreConfig::for_testing(
        dir.path().join(format!("replica-{}", uuid::Uuid::new_v4())),
    ))
    .unwrap();
    let transport = ReconnectingTransport::connect(TransportConfig::for_testing(
        server_url(port, session),
        uuid::Uuid::new_v4().to_string(),
    ));
    SyncContext::with_transport(transport, replica)
}

/// Connect a raw WebSocket peer to a session.
async fn raw_connect(port: u16, session: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(server_url(port, session))
        .await
        .unwrap();
    ws
}

async fn raw_send(ws: &mut WsStream, msg: &SyncMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn raw_recv(ws: &mut WsStream) -> SyncMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return SyncMessage::decode(text.as_str()).unwrap();
        }
    }
}

/// Wait for an event matching the predicate, draining others.
async fn wait_for_event(
    rx: &mut UnboundedReceiver<SyncEvent>,
    what: &str,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn test_client_connects_and_goes_online() {
    let (port, dir) = start_test_server().await;
    let ctx = test_ctx(port, "sess-online", &dir);

    let mut client = SyncClient::<i64>::start_with(
        ctx.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut events = client.take_event_rx().unwrap();

    wait_for_event(&mut events, "Online", |e| matches!(e, SyncEvent::Online)).await;
    assert!(client.is_online());
    ctx.transport().close();
}

#[tokio::test]
async fn test_set_propagates_to_peer() {
    let (port, dir) = start_test_server().await;
    let session = "sess-propagate";

    let ctx1 = test_ctx(port, session, &dir);
    let ctx2 = test_ctx(port, session, &dir);

    let client1 = SyncClient::<i64>::start_with(
        ctx1.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut client2 = SyncClient::<i64>::start_with(
        ctx2.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut events2 = client2.take_event_rx().unwrap();
    wait_for_event(&mut events2, "Online", |e| matches!(e, SyncEvent::Online)).await;

    client1.set(5);
    client1.force_save().unwrap();

    wait_for_event(&mut events2, "RemoteApplied", |e| {
        matches!(e, SyncEvent::RemoteApplied { .. })
    })
    .await;
    assert_eq!(client2.value(), 5);

    // The peer's replica holds the writer's timestamp.
    let stored = ctx2.replica().get("counter").unwrap().unwrap();
    assert_eq!(stored.value, "5");

    ctx1.transport().close();
    ctx2.transport().close();
}

#[tokio::test]
async fn test_broadcast_reaches_all_siblings() {
    let (port, dir) = start_test_server().await;
    let session = "sess-fanout";

    let ctx1 = test_ctx(port, session, &dir);
    let ctx2 = test_ctx(port, session, &dir);
    let ctx3 = test_ctx(port, session, &dir);

    let client1 = SyncClient::<String>::start_with(
        ctx1.clone(),
        "note",
        String::new(),
        ClientConfig::for_testing(),
        None,
    );
    let mut client2 = SyncClient::<String>::start_with(
        ctx2.clone(),
        "note",
        String::new(),
        ClientConfig::for_testing(),
        None,
    );
    let mut client3 = SyncClient::<String>::start_with(
        ctx3.clone(),
        "note",
        String::new(),
        ClientConfig::for_testing(),
        None,
    );
    let mut events2 = client2.take_event_rx().unwrap();
    let mut events3 = client3.take_event_rx().unwrap();
    wait_for_event(&mut events2, "Online", |e| matches!(e, SyncEvent::Online)).await;
    wait_for_event(&mut events3, "Online", |e| matches!(e, SyncEvent::Online)).await;

    client1.set("hello".to_string());
    client1.force_save().unwrap();

    wait_for_event(&mut events2, "RemoteApplied", |e| {
        matches!(e, SyncEvent::RemoteApplied { .. })
    })
    .await;
    wait_for_event(&mut events3, "RemoteApplied", |e| {
        matches!(e, SyncEvent::RemoteApplied { .. })
    })
    .await;

    assert_eq!(client2.value(), "hello");
    assert_eq!(client3.value(), "hello");

    ctx1.transport().close();
    ctx2.transport().close();
    ctx3.transport().close();
}

#[tokio::test]
async fn test_echo_suppression() {
    let (port, dir) = start_test_server().await;
    let session = "sess-echo";

    let ctx1 = test_ctx(port, session, &dir);
    let ctx2 = test_ctx(port, session, &dir);

    let mut client1 = SyncClient::<i64>::start_with(
        ctx1.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut client2 = SyncClient::<i64>::start_with(
        ctx2.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut events1 = client1.take_event_rx().unwrap();
    let mut events2 = client2.take_event_rx().unwrap();
    wait_for_event(&mut events1, "Online", |e| matches!(e, SyncEvent::Online)).await;
    wait_for_event(&mut events2, "Online", |e| matches!(e, SyncEvent::Online)).await;

    client1.set(42);
    client1.force_save().unwrap();

    // The peer sees it.
    wait_for_event(&mut events2, "RemoteApplied", |e| {
        matches!(e, SyncEvent::RemoteApplied { .. })
    })
    .await;

    // The writer never hears its own message back.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events1.try_recv() {
        assert!(
            !matches!(event, SyncEvent::RemoteApplied { .. }),
            "writer received an echo of its own set"
        );
    }
    assert_eq!(client1.value(), 42);

    ctx1.transport().close();
    ctx2.transport().close();
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (port, dir) = start_test_server().await;

    let ctx_a = test_ctx(port, "sess-iso-a", &dir);
    let ctx_b = test_ctx(port, "sess-iso-b", &dir);

    let client_a = SyncClient::<i64>::start_with(
        ctx_a.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut client_b = SyncClient::<i64>::start_with(
        ctx_b.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut events_b = client_b.take_event_rx().unwrap();
    wait_for_event(&mut events_b, "Online", |e| matches!(e, SyncEvent::Online)).await;

    client_a.set(99);
    client_a.force_save().unwrap();

    // Nothing crosses the session boundary.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(event) = events_b.try_recv() {
        assert!(
            !matches!(event, SyncEvent::RemoteApplied { .. }),
            "update leaked across sessions"
        );
    }
    assert_eq!(client_b.value(), 0);

    ctx_a.transport().close();
    ctx_b.transport().close();
}

#[tokio::test]
async fn test_snapshot_on_connect() {
    let (port, dir) = start_test_server().await;
    let session = "sess-snapshot";

    // Seed the authority before any sync client exists.
    let mut seeder = raw_connect(port, session).await;
    raw_send(&mut seeder, &SyncMessage::set("counter", "17", 100, "seeder")).await;
    raw_send(&mut seeder, &SyncMessage::sync("seeder")).await;
    let reply = raw_recv(&mut seeder).await;
    assert_eq!(reply.kind(), "sync_response");

    // A fresh client converges through the snapshot it requests on open.
    let ctx = test_ctx(port, session, &dir);
    let mut client = SyncClient::<i64>::start_with(
        ctx.clone(),
        "counter",
        0,
        ClientConfig::for_testing(),
        None,
    );
    let mut events = client.take_event_rx().unwrap();
    wait_for_event(&mut events, "SnapshotApplied", |e| {
        matches!(e, SyncEvent::SnapshotApplied { .. })
    })
    .await;
    assert_eq!(client.value(), 17);

    ctx.transport().close();
}

#[tokio::test]
async fn test_lww_end_to_end() {
    let (port, _dir) = start_test_server().await;
    let session = "sess-lww";

    // client2 starts with counter=0 written at t=50.
    let mut client2 = raw_connect(port, session).await;
    raw_send(&mut client2, &SyncMessage::set("counter", "0", 50, "c2")).await;

    // client1 sets counter=5 at t=100; client2 receives the broadcast.
    let mut client1 = raw_connect(port, session).await;
    raw_send(&mut client1, &SyncMessage::set("counter", "5", 100, "c1")).await;

    let broadcast = raw_recv(&mut client2).await;
    match &broadcast {
        SyncMessage::Set {
            key,
            value,
            timestamp,
            session_id,
        } => {
            assert_eq!(key, "counter");
            assert_eq!(value, "5");
            assert_eq!(*timestamp, 100);
            assert_eq!(session_id, "c1");
        }
        other => panic!("Expected broadcast Set, got {other:?}"),
    }

    // client2's own queued write at t=120 flushes afterwards: the higher
    // timestamp wins at the authority.
    raw_send(&mut client2, &SyncMessage::set("counter", "7", 120, "c2")).await;
    raw_send(&mut client2, &SyncMessage::sync("c2")).await;
    match raw_recv(&mut client2).await {
        SyncMessage::SyncResponse { data, .. } => {
            assert_eq!(data["counter"], "7");
        }
        other => panic!("Expected SyncResponse, got {other:?}"),
    }

    // And the delta since t=100 is exactly the t=120 write.
    raw_send(&mut client2, &SyncMessage::sync_request(100, "c2")).await;
    match raw_recv(&mut client2).await {
        SyncMessage::SyncChanges { changes, .. } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].key, "counter");
            assert_eq!(changes[0].value, "7");
            assert_eq!(changes[0].updated_at, 120);
        }
        other => panic!("Expected SyncChanges, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delta_request_exact_and_ordered() {
    let (port, _dir) = start_test_server().await;
    let session = "sess-delta";

    let mut peer = raw_connect(port, session).await;
    raw_send(&mut peer, &SyncMessage::set("a", "1", 10, "p")).await;
    raw_send(&mut peer, &SyncMessage::set("b", "2", 20, "p")).await;
    raw_send(&mut peer, &SyncMessage::set("c", "3", 30, "p")).await;

    raw_send(&mut peer, &SyncMessage::sync_request(10, "p")).await;
    match raw_recv(&mut peer).await {
        SyncMessage::SyncChanges { changes, .. } => {
            // Strictly greater than 10, ascending by updated_at.
            assert_eq!(changes.len(), 2);
            assert_eq!(changes[0].key, "b");
            assert_eq!(changes[0].updated_at, 20);
            assert_eq!(changes[1].key, "c");
            assert_eq!(changes[1].updated_at, 30);
        }
        other => panic!("Expected SyncChanges, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let (port, _dir) = start_test_server().await;

    let mut peer = raw_connect(port, "sess-malformed").await;
    peer.send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    match raw_recv(&mut peer).await {
        SyncMessage::Error { message, .. } => {
            assert_eq!(message, "Invalid message format");
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    // Same connection still serves queries.
    raw_send(&mut peer, &SyncMessage::sync("p")).await;
    assert_eq!(raw_recv(&mut peer).await.kind(), "sync_response");
}

#[tokio::test]
async fn test_upgrade_without_session_key_rejected() {
    let (port, _dir) = start_test_server().await;

    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/")).await;
    assert!(result.is_err(), "upgrade without a session key must fail");
}
