//! Reference cache for resolving cross-element references
//!
//! Maps `(element type, id)` to the last written representation of that
//! element. The pipeline writes every element twice: once as received, before
//! any hook sees it, and once per routed record afterwards. The last write wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;

use crate::core::element::{Element, ElementType, Record};
use crate::core::error::Result;

/// Derive the cache key for an element type and id
///
/// Returns `None` for an empty type or a zero id; there is nothing sensible
/// to store such an element under.
pub fn cache_key(kind: &str, id: i64) -> Option<String> {
    if kind.is_empty() || id == 0 {
        return None;
    }
    Some(format!("{kind}_{id}"))
}

/// Derive the cache key for an arbitrary record from its `type` and `id` fields
pub fn record_key(record: &Record) -> Option<String> {
    let kind = record.get("type")?.as_str()?;
    let id = record.get("id")?.as_i64()?;
    let kind = kind
        .parse::<ElementType>()
        .map(|k| k.as_str())
        .unwrap_or(kind);
    cache_key(kind, id)
}

/// Minimal key-value store backing the reference cache
///
/// A missing key is `Ok(None)`, never an error.
pub trait CacheStore: Send + Sync {
    fn put(&self, key: &str, value: &Record) -> impl Future<Output = Result<()>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Record>>> + Send;

    /// Irreversibly remove all cached state
    fn destroy(self) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized;
}

/// In-memory store, the default backend
///
/// Cloning yields another handle to the same entries, so a caller can keep a
/// handle around and inspect the store after the pipeline has consumed its own.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Record>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CacheStore for MemoryStore {
    async fn put(&self, key: &str, value: &Record) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn destroy(self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
pub use self::rocks::RocksStore;

#[cfg(feature = "rocksdb")]
mod rocks {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use log::info;
    use rocksdb::{Options, DB};

    use super::CacheStore;
    use crate::core::element::Record;
    use crate::core::error::{Error, Result};

    /// On-disk store for extracts too large to cache in memory
    ///
    /// RocksDB calls block, so every operation runs on the blocking pool.
    pub struct RocksStore {
        path: PathBuf,
        db: Option<Arc<DB>>,
    }

    impl RocksStore {
        /// Open a fresh store at `path`, destroying whatever a previous run left
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            if path.exists() {
                DB::destroy(&Options::default(), &path)?;
            }

            let mut options = Options::default();
            options.create_if_missing(true);
            let db = DB::open(&options, &path)?;
            info!("Opened reference cache at {}", path.display());

            Ok(Self {
                path,
                db: Some(Arc::new(db)),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn db(&self) -> Result<Arc<DB>> {
            self.db
                .clone()
                .ok_or_else(|| Error::Cache(format!("store at {} is closed", self.path.display())))
        }
    }

    async fn blocking<T, F>(task: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(task)
            .await
            .map_err(|e| Error::Cache(format!("cache task failed: {e}")))?
    }

    impl CacheStore for RocksStore {
        async fn put(&self, key: &str, value: &Record) -> Result<()> {
            let db = self.db()?;
            let key = key.to_string();
            let bytes = serde_json::to_vec(value)?;
            blocking(move || Ok(db.put(key.as_bytes(), bytes)?)).await
        }

        async fn get(&self, key: &str) -> Result<Option<Record>> {
            let db = self.db()?;
            let key = key.to_string();
            blocking(move || match db.get(key.as_bytes())? {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|e| Error::Cache(format!("corrupt entry '{key}': {e}"))),
                None => Ok(None),
            })
            .await
        }

        async fn destroy(mut self) -> Result<()> {
            let db = self.db.take();
            let path = self.path.clone();
            blocking(move || {
                // The handle must be closed before the files can go
                drop(db);
                if path.exists() {
                    DB::destroy(&Options::default(), &path)?;
                }
                info!("Destroyed reference cache at {}", path.display());
                Ok(())
            })
            .await
        }
    }

    impl Drop for RocksStore {
        fn drop(&mut self) {
            if let Some(db) = self.db.take() {
                if let Err(e) = db.flush() {
                    log::warn!("Failed to flush reference cache: {e}");
                }
            }
        }
    }
}

/// Reference cache over a [`CacheStore`], owning key derivation
pub struct ReferenceCache<S> {
    store: S,
}

impl<S: CacheStore> ReferenceCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Write `value` under `type_id`; a no-op when no key can be derived
    pub async fn put(&self, kind: &str, id: i64, value: &Record) -> Result<()> {
        match cache_key(kind, id) {
            Some(key) => self.store.put(&key, value).await,
            None => {
                debug!("Skipping cache write without a key (type '{kind}', id {id})");
                Ok(())
            }
        }
    }

    /// Look up an element; `Ok(None)` when absent or when no key can be derived
    pub async fn get(&self, kind: ElementType, id: i64) -> Result<Option<Record>> {
        match cache_key(kind.as_str(), id) {
            Some(key) => self.store.get(&key).await,
            None => {
                debug!("Skipping cache lookup without a key (type '{kind}', id {id})");
                Ok(None)
            }
        }
    }

    /// Phase one: snapshot the element as received, before any hook runs
    pub async fn write_received(&self, element: &Element) -> Result<()> {
        trace!("cache pre-hook {}_{}", element.kind(), element.id());
        let record = element.to_record()?;
        self.put(element.kind().as_str(), element.id(), &record).await
    }

    /// Phase two: snapshot a record the hook emitted, overwriting phase one
    pub async fn write_routed(&self, record: &Record) -> Result<()> {
        match record_key(record) {
            Some(key) => {
                trace!("cache post-hook {key}");
                self.store.put(&key, record).await
            }
            None => {
                debug!("Routed record has no type/id, not caching it");
                Ok(())
            }
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// End the cache lifetime, wiping the store
    pub async fn destroy(self) -> Result<()> {
        self.store.destroy().await
    }

    /// End the cache lifetime, keeping the store for the caller
    pub fn into_store(self) -> S {
        self.store
    }
}
