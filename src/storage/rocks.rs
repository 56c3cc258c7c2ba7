//! RocksDB-backed record store: an ordered key/value table with a per-entry
//! update timestamp.
//!
//! Column families:
//! - `records` — key → LZ4-compressed, bincode-encoded [`Record`]
//! - `changes` — `<updated_at:8 bytes BE><key>` → empty, a secondary index
//!   that makes `changed_since` a single forward range scan
//!
//! Every mutation rewrites the record and its index entry in one atomic
//! `WriteBatch`, so a key appears in the index exactly once and the index
//! never disagrees with the record it points at.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::protocol::{now_millis, ChangeEntry};

/// Column family names.
const CF_RECORDS: &str = "records";
const CF_CHANGES: &str = "changes";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_CHANGES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("kvsync_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-supplied directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// A stored entry: opaque caller-serialized value plus its update timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: String,
    /// Milliseconds since the Unix epoch. Non-decreasing per key for writes
    /// accepted through the owning component.
    pub updated_at: u64,
}

impl Record {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let plain = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&plain))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let plain = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&plain, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(record)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed record store.
///
/// One instance per session replica (authoritative on the server, local on
/// the client). All operations are synchronous; callers must not assume a
/// write is durable until the call returns `Ok`.
pub struct RecordStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RecordStore {
    /// Open the store at the configured path, creating the database and
    /// column families if absent.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Record values are LZ4-compressed before they reach RocksDB.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        opts
    }

    /// Fetch the record for `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(Record::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Upsert `key`. Uses the caller timestamp when given, the current time
    /// otherwise. Returns the timestamp actually stored.
    pub fn set(&self, key: &str, value: &str, timestamp: Option<u64>) -> Result<u64, StoreError> {
        let updated_at = timestamp.unwrap_or_else(now_millis);
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_changes = self.cf(CF_CHANGES)?;

        let record = Record {
            value: value.to_string(),
            updated_at,
        };

        let mut batch = WriteBatch::default();
        if let Some(old) = self.get(key)? {
            batch.delete_cf(&cf_changes, Self::change_key(old.updated_at, key));
        }
        batch.put_cf(&cf_records, key.as_bytes(), record.encode()?);
        batch.put_cf(&cf_changes, Self::change_key(updated_at, key), b"");

        self.write(batch)?;
        Ok(updated_at)
    }

    /// Remove `key`. Removing an absent key is a no-op. Deletes are not
    /// tombstoned: a later `set` recreates the key.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        let old = match self.get(key)? {
            Some(record) => record,
            None => return Ok(()),
        };
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_changes = self.cf(CF_CHANGES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_records, key.as_bytes());
        batch.delete_cf(&cf_changes, Self::change_key(old.updated_at, key));
        self.write(batch)
    }

    /// All entries as a key → value mapping.
    pub fn list_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut data = BTreeMap::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let record = Record::decode(&value)?;
            data.insert(key, record.value);
        }

        Ok(data)
    }

    /// Entries with `updated_at` strictly greater than `since`, ascending by
    /// `updated_at` (ties ordered by key).
    pub fn changed_since(&self, since: u64) -> Result<Vec<ChangeEntry>, StoreError> {
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_records = self.cf(CF_RECORDS)?;

        let start = since.saturating_add(1).to_be_bytes();
        let mut changes = Vec::new();

        let iter = self.db.iterator_cf(
            &cf_changes,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (index_key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if index_key.len() < 8 {
                continue;
            }
            let mut ts_buf = [0u8; 8];
            ts_buf.copy_from_slice(&index_key[..8]);
            let updated_at = u64::from_be_bytes(ts_buf);
            if updated_at <= since {
                continue;
            }
            let key = String::from_utf8_lossy(&index_key[8..]).into_owned();

            match self.db.get_cf(&cf_records, key.as_bytes())? {
                Some(bytes) => {
                    let record = Record::decode(&bytes)?;
                    changes.push(ChangeEntry {
                        key,
                        value: record.value,
                        updated_at,
                    });
                }
                // Index entry without a record — nothing to report.
                None => continue,
            }
        }

        Ok(changes)
    }

    /// Remove every entry.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for cf_name in COLUMN_FAMILIES {
            let cf = self.cf(cf_name)?;
            for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
                let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
                batch.delete_cf(&cf, key);
            }
        }
        self.write(batch)
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// The database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Index key: `updated_at` (8 bytes big-endian) + record key bytes.
    fn change_key(updated_at: u64, key: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + key.len());
        buf.extend_from_slice(&updated_at.to_be_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf
    }
}
