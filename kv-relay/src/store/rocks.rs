//! RocksDB-backed presence store.
//!
//! Column families:
//! - `hashes`: one row per hash key, value is the bincode-encoded field map
//! - `sets`: one row per set member, keyed `<set>\0<member>`, empty value
//!
//! Hash writes are read-modify-write, so they are serialized by `write_lock`.
//! Set operations are single puts/deletes and need no extra locking.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{PresenceStore, StoreError};

/// Column family names.
const CF_HASHES: &str = "hashes";
const CF_SETS: &str = "sets";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_HASHES, CF_SETS];

/// Separator between set name and member in `sets` keys.
const SET_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
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
            path: PathBuf::from("kv_relay_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed presence store.
pub struct RocksStore {
    /// RocksDB instance, single-threaded mode
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes hash read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened presence store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_HASHES => {
                // One small row per user, point lookups only.
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_SETS => {
                // Scanned by set-name prefix.
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn load_hash(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let cf = self.cf(CF_HASHES)?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => decode_fields(&bytes),
            None => Ok(BTreeMap::new()),
        }
    }

    fn save_hash(&self, key: &str, fields: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let cf = self.cf(CF_HASHES)?;
        if fields.is_empty() {
            self.db.delete_cf_opt(cf, key.as_bytes(), &self.write_opts())?;
        } else {
            self.db
                .put_cf_opt(cf, key.as_bytes(), encode_fields(fields)?, &self.write_opts())?;
        }
        Ok(())
    }

    /// Every `sets` row key belonging to `set`.
    fn set_keys(&self, set: &str) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_SETS)?;
        let prefix = set_prefix(set);
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }
}

#[async_trait]
impl PresenceStore for RocksStore {
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut hash = self.load_hash(key)?;
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        self.save_hash(key, &hash)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.load_hash(key)?.into_iter().collect())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut hash = self.load_hash(key)?;
        if hash.remove(field).is_some() {
            self.save_hash(key, &hash)?;
        }
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_SETS)?;
        self.db
            .put_cf_opt(cf, set_member_key(set, member), b"", &self.write_opts())?;
        Ok(())
    }

    async fn srem(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_SETS)?;
        self.db
            .delete_cf_opt(cf, set_member_key(set, member), &self.write_opts())?;
        Ok(())
    }

    async fn smembers(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let prefix_len = set_prefix(set).len();
        self.set_keys(set)?
            .into_iter()
            .map(|key| {
                String::from_utf8(key[prefix_len..].to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect()
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let cf_hashes = self.cf(CF_HASHES)?;
        let cf_sets = self.cf(CF_SETS)?;

        // Hash row and any set rows go in one atomic batch.
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_hashes, key.as_bytes());
        for member_key in self.set_keys(key)? {
            batch.delete_cf(cf_sets, member_key);
        }
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.cf(CF_HASHES).map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "rocksdb"
    }
}

fn encode_fields(fields: &BTreeMap<String, String>) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(fields, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_fields(bytes: &[u8]) -> Result<BTreeMap<String, String>, StoreError> {
    let (fields, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(fields)
}

fn set_prefix(set: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(set.len() + 1);
    prefix.extend_from_slice(set.as_bytes());
    prefix.push(SET_SEPARATOR);
    prefix
}

fn set_member_key(set: &str, member: &str) -> Vec<u8> {
    let mut key = set_prefix(set);
    key.extend_from_slice(member.as_bytes());
    key
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
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
    fn test_store_open_close() {
        let (dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.backend(), "rocksdb");
        drop(store);
        drop(dir);
    }

    #[tokio::test]
    async fn test_hash_roundtrip() {
        let (_dir, store) = open_temp();
        store
            .hset("kv:users:u1", &[("color", "#AABBCC".into()), ("connectedAt", "10".into())])
            .await
            .unwrap();
        store
            .hset("kv:users:u1", &[("landmarkKey", "tree-42".into())])
            .await
            .unwrap();

        let fields = store.hgetall("kv:users:u1").await.unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["landmarkKey"], "tree-42");

        store.hdel("kv:users:u1", "landmarkKey").await.unwrap();
        store.hdel("kv:users:u1", "landmarkKey").await.unwrap();
        let fields = store.hgetall("kv:users:u1").await.unwrap();
        assert!(!fields.contains_key("landmarkKey"));
        assert_eq!(fields["color"], "#AABBCC");
    }

    #[tokio::test]
    async fn test_sets_isolated_by_prefix() {
        let (_dir, store) = open_temp();
        store.sadd("kv:active_users", "u1").await.unwrap();
        store.sadd("kv:active_users", "u2").await.unwrap();
        store.sadd("kv:active_users", "u2").await.unwrap();
        // Shares a textual prefix but is a different set.
        store.sadd("kv:active_users_old", "zombie").await.unwrap();

        let mut members = store.smembers("kv:active_users").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["u1", "u2"]);

        store.srem("kv:active_users", "u1").await.unwrap();
        assert_eq!(store.smembers("kv:active_users").await.unwrap(), vec!["u2"]);
        assert_eq!(
            store.smembers("kv:active_users_old").await.unwrap(),
            vec!["zombie"]
        );
    }

    #[tokio::test]
    async fn test_del_removes_hash_and_set() {
        let (_dir, store) = open_temp();
        store.hset("k", &[("a", "1".into())]).await.unwrap();
        store.sadd("k", "m").await.unwrap();

        store.del("k").await.unwrap();
        store.del("k").await.unwrap();

        assert!(store.hgetall("k").await.unwrap().is_empty());
        assert!(store.smembers("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.hset("kv:users:u1", &[("color", "#010203".into())]).await.unwrap();
            store.sadd("kv:active_users", "u1").await.unwrap();
            store.sync().unwrap();
        }

        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.hgetall("kv:users:u1").await.unwrap()["color"], "#010203");
        assert_eq!(store.smembers("kv:active_users").await.unwrap(), vec!["u1"]);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("kv_relay_data"));
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
