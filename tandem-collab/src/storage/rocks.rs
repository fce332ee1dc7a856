//! RocksDB-backed op log store.
//!
//! Column families:
//! - `ops`  — serialized capture entries (LZ4 compressed, keyed by u64 big-endian)
//! - `meta` — one bincode record per log: next key, entry count, timestamps
//!
//! Big-endian keys sort numerically, so a forward scan returns entries in
//! append order.

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tandem_core::capture::{OpStore, StoreKey};
use tandem_core::error::StoreError;

const CF_OPS: &str = "ops";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_OPS, CF_META];

const META_KEY: &[u8] = b"log";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_ops"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
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

/// Bookkeeping stored next to the entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub next_key: u64,
    pub entry_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl LogMetadata {
    fn new() -> Self {
        let now = now_secs();
        Self {
            next_key: 0,
            entry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn db_error(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of the metadata record.
    meta: Mutex<LogMetadata>,
}

/// Durable [`OpStore`]. Cloning shares the database handle.
///
/// Each operation runs on the blocking pool; the capture persistence task
/// awaits them one at a time, which keeps writes in log order.
#[derive(Clone)]
pub struct RocksOpStore {
    inner: Arc<Inner>,
}

impl RocksOpStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )
        .map_err(db_error)?;

        let meta = Self::recover_metadata(&db)?;
        log::debug!(
            "Opened op store at {} ({} entries, next key {})",
            config.path.display(),
            meta.entry_count,
            meta.next_key
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                meta: Mutex::new(meta),
            }),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 framed
            CF_OPS => opts.set_compression_type(DBCompressionType::None),
            CF_META => opts.optimize_for_point_lookup(config.block_cache_size as u64),
            _ => {}
        }
        opts
    }

    /// Metadata record, or one rebuilt from the highest stored key.
    fn recover_metadata(db: &DBWithThreadMode<SingleThreaded>) -> Result<LogMetadata, StoreError> {
        let cf_meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| StoreError::Database(format!("missing column family {CF_META}")))?;
        if let Some(bytes) = db.get_cf(&cf_meta, META_KEY).map_err(db_error)? {
            return LogMetadata::decode(&bytes);
        }

        let cf_ops = db
            .cf_handle(CF_OPS)
            .ok_or_else(|| StoreError::Database(format!("missing column family {CF_OPS}")))?;
        let mut meta = LogMetadata::new();
        for item in db.iterator_cf(&cf_ops, IteratorMode::Start) {
            let (key, _) = item.map_err(db_error)?;
            meta.next_key = decode_key(&key)?.0 + 1;
            meta.entry_count += 1;
        }
        Ok(meta)
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    pub fn metadata(&self) -> LogMetadata {
        self.inner.meta.lock().clone()
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush().map_err(db_error)
    }

    fn run<T, F>(&self, op: F) -> BoxFuture<'static, Result<T, StoreError>>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        async move {
            tokio::task::spawn_blocking(move || op(&inner))
                .await
                .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
        }
        .boxed()
    }
}

impl std::fmt::Debug for RocksOpStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksOpStore")
            .field("path", &self.inner.config.path)
            .field("meta", &*self.inner.meta.lock())
            .finish()
    }
}

fn encode_key(key: StoreKey) -> [u8; 8] {
    key.0.to_be_bytes()
}

fn decode_key(bytes: &[u8]) -> Result<StoreKey, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization(format!("bad key length {}", bytes.len())))?;
    Ok(StoreKey(u64::from_be_bytes(buf)))
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts).map_err(db_error)
    }

    fn append(&self, entry: &[u8]) -> Result<StoreKey, StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_META)?;
        let mut meta = self.meta.lock();

        let key = StoreKey(meta.next_key);
        let mut next = meta.clone();
        next.next_key += 1;
        next.entry_count += 1;
        next.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, encode_key(key), lz4_flex::compress_prepend_size(entry));
        batch.put_cf(&cf_meta, META_KEY, next.encode()?);
        self.write(batch)?;

        *meta = next;
        Ok(key)
    }

    fn update(&self, key: StoreKey, entry: &[u8]) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        if self.db.get_cf(&cf_ops, encode_key(key)).map_err(db_error)?.is_none() {
            return Err(StoreError::NotFound(key.0));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, encode_key(key), lz4_flex::compress_prepend_size(entry));
        self.write(batch)
    }

    fn remove(&self, keys: &[StoreKey]) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_META)?;
        let mut meta = self.meta.lock();

        let mut removed = 0u64;
        let mut batch = WriteBatch::default();
        for key in keys {
            if self.db.get_cf(&cf_ops, encode_key(*key)).map_err(db_error)?.is_some() {
                batch.delete_cf(&cf_ops, encode_key(*key));
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(());
        }
        let mut next = meta.clone();
        next.entry_count = next.entry_count.saturating_sub(removed);
        next.updated_at = now_secs();
        batch.put_cf(&cf_meta, META_KEY, next.encode()?);
        self.write(batch)?;

        *meta = next;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let cf_meta = self.cf(CF_META)?;
        let mut meta = self.meta.lock();

        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf_ops, IteratorMode::Start) {
            let (key, _) = item.map_err(db_error)?;
            batch.delete_cf(&cf_ops, key);
        }
        // Keys keep increasing across clears
        let mut next = meta.clone();
        next.entry_count = 0;
        next.updated_at = now_secs();
        batch.put_cf(&cf_meta, META_KEY, next.encode()?);
        self.write(batch)?;

        *meta = next;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<(StoreKey, Vec<u8>)>, StoreError> {
        let cf_ops = self.cf(CF_OPS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf_ops, IteratorMode::Start) {
            let (key, value) = item.map_err(db_error)?;
            let entry = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            records.push((decode_key(&key)?, entry));
        }
        Ok(records)
    }
}

impl OpStore for RocksOpStore {
    fn append(&self, entry: Vec<u8>) -> BoxFuture<'static, Result<StoreKey, StoreError>> {
        self.run(move |inner| inner.append(&entry))
    }

    fn update(&self, key: StoreKey, entry: Vec<u8>) -> BoxFuture<'static, Result<(), StoreError>> {
        self.run(move |inner| inner.update(key, &entry))
    }

    fn remove(&self, keys: Vec<StoreKey>) -> BoxFuture<'static, Result<(), StoreError>> {
        self.run(move |inner| inner.remove(&keys))
    }

    fn clear(&self) -> BoxFuture<'static, Result<(), StoreError>> {
        self.run(|inner| inner.clear())
    }

    fn load_all(&self) -> BoxFuture<'static, Result<Vec<(StoreKey, Vec<u8>)>, StoreError>> {
        self.run(|inner| inner.load_all())
    }
}
