//! RocksDB-backed identity and page store.
//!
//! Column families:
//! - `users`: `UserRecord` (bincode), keyed by identity id
//! - `pages`: page content as JSON, LZ4 compressed, keyed by page id
//! - `page_meta`: `PageMeta` (bincode), written in the same batch as `pages`
//!
//! RocksDB calls block, so the async trait impls run them on the blocking
//! pool. Content writes are a single `WriteBatch` (content + metadata), which
//! gives the atomic per-page write the realtime core relies on. A content
//! write reads `page_meta` before committing, so page writes and deletes are
//! serialized on `Inner::page_lock`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{IdentityStore, PageStore, StoreError};
use crate::protocol::{Identity, IdentityId, RoomId};

const CF_USERS: &str = "users";
const CF_PAGES: &str = "pages";
const CF_PAGE_META: &str = "page_meta";

const COLUMN_FAMILIES: &[&str] = &[CF_USERS, CF_PAGES, CF_PAGE_META];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync every content write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl RocksConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pagehive_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

/// A user as stored by the account layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl From<UserRecord> for Identity {
    fn from(r: UserRecord) -> Self {
        Identity::new(r.id, r.name)
    }
}

/// Bookkeeping stored next to each page's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageMeta {
    /// Incremented by every content write
    pub version: u64,
    /// Uncompressed JSON size in bytes
    pub content_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl PageMeta {
    fn new() -> Self {
        let now = unix_now();
        Self {
            version: 0,
            content_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

struct Inner {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Serializes page read-modify-write against page deletion.
    page_lock: Mutex<()>,
}

/// RocksDB store. Cheap to clone; clones share one database handle.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<Inner>,
}

impl RocksStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: RocksConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened page store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                page_lock: Mutex::new(()),
            }),
        })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4 framed
            CF_PAGES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    // ─── Users ────────────────────────────────────────────────────────

    pub fn put_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        let cf = self.inner.cf(CF_USERS)?;
        self.inner.db.put_cf(cf, user.id.as_bytes(), encode(user)?)?;
        Ok(())
    }

    pub fn delete_user(&self, id: &IdentityId) -> Result<(), StoreError> {
        let cf = self.inner.cf(CF_USERS)?;
        self.inner.db.delete_cf(cf, id.as_str().as_bytes())?;
        Ok(())
    }

    pub fn get_user(&self, id: &IdentityId) -> Result<Option<UserRecord>, StoreError> {
        self.inner.get_user(id)
    }

    // ─── Pages ────────────────────────────────────────────────────────

    /// Create a page with initial content. Overwrites an existing page.
    pub fn create_page(&self, page: &RoomId, content: &Value) -> Result<PageMeta, StoreError> {
        let _guard = self.inner.lock_pages();
        self.inner.write_content(page, content, PageMeta::new())
    }

    /// Create `page` only if it does not exist yet. Returns `None` when it
    /// was already there.
    pub fn create_page_if_missing(
        &self,
        page: &RoomId,
        content: &Value,
    ) -> Result<Option<PageMeta>, StoreError> {
        let _guard = self.inner.lock_pages();
        if self.inner.page_meta(page)?.is_some() {
            return Ok(None);
        }
        self.inner.write_content(page, content, PageMeta::new()).map(Some)
    }

    pub fn delete_page(&self, page: &RoomId) -> Result<(), StoreError> {
        let _guard = self.inner.lock_pages();
        let cf_pages = self.inner.cf(CF_PAGES)?;
        let cf_meta = self.inner.cf(CF_PAGE_META)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_pages, page.as_str().as_bytes());
        batch.delete_cf(cf_meta, page.as_str().as_bytes());
        self.inner.db.write(batch)?;
        Ok(())
    }

    pub fn load_content(&self, page: &RoomId) -> Result<Value, StoreError> {
        let cf = self.inner.cf(CF_PAGES)?;
        match self.inner.db.get_cf(cf, page.as_str().as_bytes())? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                serde_json::from_slice(&raw).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            None => Err(StoreError::PageNotFound(page.clone())),
        }
    }

    pub fn page_meta(&self, page: &RoomId) -> Result<PageMeta, StoreError> {
        self.inner.page_meta(page)?.ok_or_else(|| StoreError::PageNotFound(page.clone()))
    }

    /// All page ids, in key order.
    pub fn list_pages(&self) -> Result<Vec<RoomId>, StoreError> {
        let cf = self.inner.cf(CF_PAGE_META)?;
        let mut pages = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            pages.push(RoomId::new(id));
        }
        Ok(pages)
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }
}

impl Inner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    /// The guarded value is `()`, so a poisoned lock carries no broken state.
    fn lock_pages(&self) -> MutexGuard<'_, ()> {
        self.page_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get_user(&self, id: &IdentityId) -> Result<Option<UserRecord>, StoreError> {
        let cf = self.cf(CF_USERS)?;
        self.db
            .get_cf(cf, id.as_str().as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn page_meta(&self, page: &RoomId) -> Result<Option<PageMeta>, StoreError> {
        let cf = self.cf(CF_PAGE_META)?;
        self.db
            .get_cf(cf, page.as_str().as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Overwrite an existing page's content.
    fn persist_content(&self, page: &RoomId, content: &Value) -> Result<PageMeta, StoreError> {
        let _guard = self.lock_pages();
        let meta = self
            .page_meta(page)?
            .ok_or_else(|| StoreError::PageNotFound(page.clone()))?;
        self.write_content(page, content, meta)
    }

    /// Caller holds `page_lock`.
    fn write_content(
        &self,
        page: &RoomId,
        content: &Value,
        mut meta: PageMeta,
    ) -> Result<PageMeta, StoreError> {
        let cf_pages = self.cf(CF_PAGES)?;
        let cf_meta = self.cf(CF_PAGE_META)?;

        let raw =
            serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&raw);

        meta.version += 1;
        meta.content_size = raw.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let key = page.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_pages, key, &compressed);
        batch.put_cf(cf_meta, key, encode(&meta)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }
}

#[async_trait]
impl IdentityStore for RocksStore {
    async fn lookup_identity(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        let inner = self.inner.clone();
        let id = id.clone();
        let record = tokio::task::spawn_blocking(move || inner.get_user(&id))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        Ok(record.map(Identity::from))
    }
}

#[async_trait]
impl PageStore for RocksStore {
    async fn persist_content(&self, page: &RoomId, content: &Value) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        let page = page.clone();
        let content = content.clone();
        tokio::task::spawn_blocking(move || inner.persist_content(&page, &content))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(value)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
