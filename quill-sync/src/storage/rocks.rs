//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents` — LZ4-compressed full snapshots, keyed `doc:<name>`
//! - `metadata`  — bincode-encoded [`DocumentMetadata`], same key
//!
//! Snapshots are overwritten wholesale; snapshot + metadata go through one
//! atomic write batch so a reader never observes them out of step.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    MultiThreaded, Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

use super::{doc_key, SnapshotStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: f64,
    /// fsync on every write (off by default; the write-back model tolerates
    /// losing the newest snapshot on abrupt termination)
    pub sync_writes: bool,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10.0,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small-footprint config for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

/// Bookkeeping stored alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document name
    pub name: String,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Number of write-backs since creation
    pub save_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last write-back timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            snapshot_size: 0,
            compressed_size: 0,
            save_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// RocksDB snapshot store.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the database at the configured path.
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

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits, false);
        opts.set_block_based_table_factory(&block_opts);
        // Values are LZ4-compressed by us already
        opts.set_compression_type(DBCompressionType::None);
        opts
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family {name}")))
    }

    /// Load bookkeeping for a document, if it has ever been saved.
    pub fn load_metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self
            .db
            .get_cf(&cf, doc_key(name))
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self
            .db
            .get_cf(&cf, doc_key(name))
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            Some(compressed) => {
                let snapshot = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn save(&self, name: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut meta = self
            .load_metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.snapshot_size = snapshot.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.save_count += 1;
        meta.updated_at = unix_now();

        let key = doc_key(name);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .write_opt(batch, &write_opts)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_load_missing_returns_none() {
        let (_dir, store) = open_temp();
        assert!(store.load("nothing").unwrap().is_none());
        assert!(store.load_metadata("nothing").unwrap().is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = open_temp();
        let snapshot = vec![7u8; 2048];
        store.save("alpha", &snapshot).unwrap();
        assert_eq!(store.load("alpha").unwrap().unwrap(), snapshot);
    }

    #[test]
    fn test_save_is_idempotent_overwrite() {
        let (_dir, store) = open_temp();
        let snapshot = vec![1, 2, 3];
        store.save("alpha", &snapshot).unwrap();
        store.save("alpha", &snapshot).unwrap();
        assert_eq!(store.load("alpha").unwrap().unwrap(), snapshot);

        let meta = store.load_metadata("alpha").unwrap().unwrap();
        assert_eq!(meta.save_count, 2);
        assert_eq!(meta.snapshot_size, 3);
    }

    #[test]
    fn test_overwrite_replaces_wholesale() {
        let (_dir, store) = open_temp();
        store.save("alpha", &[1; 100]).unwrap();
        store.save("alpha", &[2; 10]).unwrap();
        assert_eq!(store.load("alpha").unwrap().unwrap(), vec![2; 10]);
    }

    #[test]
    fn test_documents_are_isolated_by_name() {
        let (_dir, store) = open_temp();
        store.save("alpha", &[1]).unwrap();
        store.save("beta", &[2]).unwrap();
        assert_eq!(store.load("alpha").unwrap().unwrap(), vec![1]);
        assert_eq!(store.load("beta").unwrap().unwrap(), vec![2]);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.save("alpha", &[9; 64]).unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.load("alpha").unwrap().unwrap(), vec![9; 64]);
    }

    #[test]
    fn test_empty_snapshot_allowed() {
        let (_dir, store) = open_temp();
        store.save("empty", &[]).unwrap();
        assert_eq!(store.load("empty").unwrap().unwrap(), Vec::<u8>::new());
    }
}
