//! Plug-in contract for external storage backends and the caching layer
//! that sits in front of them.
//!
//! A backend only has to speak the five store operations; the wrapper
//! adds TTL/LRU memoization with negative caching, write-through updates,
//! and single-flight loads so a slow backend is hit at most once per key.

use crate::store::{AllData, DataKind, Store, StoreItem};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
#[error("persistent store failure: {0}")]
pub struct PersistenceError(pub String);

/// A synchronous storage backend.
///
/// Unlike [Store], reads surface tombstones and every operation can fail;
/// the caching wrapper absorbs both.
pub trait PersistentDataStore: Send + Sync {
    fn init(&self, data: AllData) -> Result<(), PersistenceError>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, PersistenceError>;

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, PersistenceError>;

    /// Apply the version-monotonic upsert rule and return the item now
    /// stored.
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem)
        -> Result<StoreItem, PersistenceError>;

    fn initialized(&self) -> Result<bool, PersistenceError>;
}

/// The same contract for backends with an async client library.
#[async_trait]
pub trait AsyncPersistentDataStore: Send + Sync {
    async fn init(&self, data: AllData) -> Result<(), PersistenceError>;

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, PersistenceError>;

    async fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, PersistenceError>;

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: StoreItem,
    ) -> Result<StoreItem, PersistenceError>;

    async fn initialized(&self) -> Result<bool, PersistenceError>;
}

/// Adapts an async backend to the synchronous contract.
///
/// Each call runs the future on the runtime and parks the calling thread
/// on a channel until it resolves, so only a worker blocks.
pub struct BlockingStoreAdapter<T> {
    inner: Arc<T>,
    handle: tokio::runtime::Handle,
}

impl<T: AsyncPersistentDataStore + 'static> BlockingStoreAdapter<T> {
    pub fn new(inner: Arc<T>, handle: tokio::runtime::Handle) -> Self {
        Self { inner, handle }
    }

    fn wait_for<R, F, Fut>(&self, run: F) -> Result<R, PersistenceError>
    where
        R: Send + 'static,
        Fut: std::future::Future<Output = Result<R, PersistenceError>> + Send + 'static,
        F: FnOnce(Arc<T>) -> Fut,
    {
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let future = run(Arc::clone(&self.inner));
        self.handle.spawn(async move {
            let _ = result_tx.send(future.await);
        });
        result_rx
            .recv()
            .map_err(|_| PersistenceError("store task stopped unexpectedly".into()))?
    }
}

impl<T: AsyncPersistentDataStore + 'static> PersistentDataStore for BlockingStoreAdapter<T> {
    fn init(&self, data: AllData) -> Result<(), PersistenceError> {
        self.wait_for(move |inner| async move { inner.init(data).await })
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>, PersistenceError> {
        let key = key.to_string();
        self.wait_for(move |inner| async move { inner.get(kind, &key).await })
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>, PersistenceError> {
        self.wait_for(move |inner| async move { inner.all(kind).await })
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: StoreItem,
    ) -> Result<StoreItem, PersistenceError> {
        let key = key.to_string();
        self.wait_for(move |inner| async move { inner.upsert(kind, &key, item).await })
    }

    fn initialized(&self) -> Result<bool, PersistenceError> {
        self.wait_for(move |inner| async move { inner.initialized().await })
    }
}

/// How long and how much the wrapper may cache.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// `None` disables caching entirely; every read reaches the backend.
    pub ttl: Option<Duration>,
    /// Bound on cached items; unbounded when absent.
    pub capacity: Option<NonZeroUsize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(15)),
            capacity: None,
        }
    }
}

struct CacheEntry<T> {
    stored: Instant,
    value: T,
}

type ItemKey = (DataKind, String);

/// [Store] implementation backed by a [PersistentDataStore].
pub struct CachingStoreWrapper<P> {
    backend: P,
    config: CacheConfig,
    items: Mutex<LruCache<ItemKey, CacheEntry<Option<StoreItem>>>>,
    all_items: Mutex<HashMap<DataKind, CacheEntry<HashMap<String, StoreItem>>>>,
    inflight: Mutex<HashMap<ItemKey, Arc<Mutex<()>>>>,
    // initialization is sticky; once observed true we stop asking
    initialized: AtomicBool,
}

impl<P: PersistentDataStore> CachingStoreWrapper<P> {
    pub fn new(backend: P, config: CacheConfig) -> Self {
        let items = match config.capacity {
            Some(capacity) => LruCache::new(capacity),
            None => LruCache::unbounded(),
        };
        Self {
            backend,
            config,
            items: Mutex::new(items),
            all_items: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        }
    }

    fn fresh(&self, stored: Instant) -> bool {
        match self.config.ttl {
            Some(ttl) => stored.elapsed() < ttl,
            None => false,
        }
    }

    fn cache_item(&self, kind: DataKind, key: &str, item: Option<StoreItem>) {
        if self.config.ttl.is_none() {
            return;
        }
        self.items.lock().put(
            (kind, key.to_string()),
            CacheEntry {
                stored: Instant::now(),
                value: item,
            },
        );
    }

    fn cached_item(&self, kind: DataKind, key: &str) -> Option<Option<StoreItem>> {
        let mut items = self.items.lock();
        match items.get(&(kind, key.to_string())) {
            Some(entry) if self.fresh(entry.stored) => Some(entry.value.clone()),
            _ => None,
        }
    }

    fn load_item(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        // single flight per key; losers of the race reuse the winner's
        // cache entry
        let loader = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry((kind, key.to_string()))
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _load_guard = loader.lock();
        let item = match self.cached_item(kind, key) {
            Some(cached) => cached,
            None => match self.backend.get(kind, key) {
                Ok(item) => {
                    self.cache_item(kind, key, item.clone());
                    item
                }
                Err(error) => {
                    warn!(%error, kind = kind.name(), %key, "failed reading from the persistent store");
                    None
                }
            },
        };
        self.inflight.lock().remove(&(kind, key.to_string()));
        item
    }

    fn visible(item: Option<StoreItem>) -> Option<StoreItem> {
        item.filter(|item| !item.is_deleted())
    }
}

impl<P: PersistentDataStore> Store for CachingStoreWrapper<P> {
    fn init(&self, data: AllData) {
        if let Err(error) = self.backend.init(data.clone()) {
            warn!(%error, "failed initializing the persistent store");
            return;
        }
        // seed the caches from the fresh data set
        {
            let mut items = self.items.lock();
            let mut all_items = self.all_items.lock();
            items.clear();
            all_items.clear();
            if self.config.ttl.is_some() {
                for (kind, entries) in data {
                    let mut by_key = HashMap::new();
                    for (key, item) in entries {
                        items.put(
                            (kind, key.clone()),
                            CacheEntry {
                                stored: Instant::now(),
                                value: Some(item.clone()),
                            },
                        );
                        by_key.insert(key, item);
                    }
                    all_items.insert(
                        kind,
                        CacheEntry {
                            stored: Instant::now(),
                            value: by_key,
                        },
                    );
                }
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!("persistent store initialized");
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        if self.config.ttl.is_none() {
            return match self.backend.get(kind, key) {
                Ok(item) => Self::visible(item),
                Err(error) => {
                    warn!(%error, kind = kind.name(), %key, "failed reading from the persistent store");
                    None
                }
            };
        }
        if let Some(cached) = self.cached_item(kind, key) {
            return Self::visible(cached);
        }
        Self::visible(self.load_item(kind, key))
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        if self.config.ttl.is_some() {
            let all_items = self.all_items.lock();
            if let Some(entry) = all_items.get(&kind) {
                if self.fresh(entry.stored) {
                    return entry
                        .value
                        .iter()
                        .filter(|(_, item)| !item.is_deleted())
                        .map(|(key, item)| (key.clone(), item.clone()))
                        .collect();
                }
            }
        }
        let loaded = match self.backend.all(kind) {
            Ok(items) => items,
            Err(error) => {
                warn!(%error, kind = kind.name(), "failed listing the persistent store");
                return HashMap::new();
            }
        };
        if self.config.ttl.is_some() {
            self.all_items.lock().insert(
                kind,
                CacheEntry {
                    stored: Instant::now(),
                    value: loaded.clone(),
                },
            );
        }
        loaded
            .into_iter()
            .filter(|(_, item)| !item.is_deleted())
            .collect()
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreItem {
        match self.backend.upsert(kind, key, item.clone()) {
            Ok(stored) => {
                // memoize the post-write state and drop the stale listing
                self.cache_item(kind, key, Some(stored.clone()));
                self.all_items.lock().remove(&kind);
                stored
            }
            Err(error) => {
                warn!(%error, kind = kind.name(), %key, "failed writing to the persistent store");
                // drop cached state we can no longer vouch for
                self.items.lock().pop(&(kind, key.to_string()));
                self.all_items.lock().remove(&kind);
                item
            }
        }
    }

    fn initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        match self.backend.initialized() {
            Ok(true) => {
                self.initialized.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(error) => {
                warn!(%error, "failed querying persistent store initialization");
                false
            }
        }
    }
}
