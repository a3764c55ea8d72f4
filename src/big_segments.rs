//! Membership lookups for segments too large to ship in the snapshot.
//!
//! The external store is queried per user and the result cached; a
//! background poller watches the store's freshness metadata so evaluation
//! can annotate results that relied on possibly-outdated data.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::watch, task, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Membership of one user: external segment reference to
/// included (`true`) / excluded (`false`). References absent from the map
/// are unknown and fall back to the segment's own rules.
pub type Membership = HashMap<String, bool>;

#[derive(Clone, Debug, Default)]
pub struct BigSegmentStoreMetadata {
    /// When the store contents were last synchronized, in unix ms.
    pub last_up_to_date: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("big segment store failure: {0}")]
pub struct BigSegmentStoreError(pub String);

/// External membership storage.
///
/// Queries block the calling task; implementations are expected to apply
/// their own request timeout.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata, BigSegmentStoreError>;

    /// Membership for a user, addressed by [`hash_for_user_key`].
    fn get_membership(&self, user_hash: &str)
        -> Result<Option<Membership>, BigSegmentStoreError>;
}

/// Health of the external store as last observed by the poller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

/// Per-query status attached to evaluation reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    Healthy,
    Stale,
    NotConfigured,
    StoreError,
}

impl BigSegmentsStatus {
    fn severity(&self) -> u8 {
        match self {
            BigSegmentsStatus::Healthy => 0,
            BigSegmentsStatus::Stale => 1,
            BigSegmentsStatus::NotConfigured => 2,
            BigSegmentsStatus::StoreError => 3,
        }
    }

    /// When several lookups happen in one evaluation, the worst status
    /// wins.
    pub fn worst(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// How the wrapper caches and polls.
#[derive(Clone)]
pub struct BigSegmentsConfig {
    pub store: Arc<dyn BigSegmentStore>,
    pub user_cache_size: NonZeroUsize,
    pub user_cache_time: Duration,
    pub status_poll_interval: Duration,
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    pub fn new(store: Arc<dyn BigSegmentStore>) -> Self {
        Self {
            store,
            user_cache_size: NonZeroUsize::new(1000).unwrap(),
            user_cache_time: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

struct CachedMembership {
    fetched: Instant,
    membership: Option<Arc<Membership>>,
}

/// Caching front for a [`BigSegmentStore`] plus its status poller.
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    user_cache_time: Duration,
    cache: Mutex<LruCache<String, CachedMembership>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status_rx: watch::Receiver<BigSegmentStoreStatus>,
    shutdown: CancellationToken,
}

impl BigSegmentStoreWrapper {
    /// Build the wrapper and spawn its status poller. Must be called from
    /// within the async runtime.
    pub fn new(config: BigSegmentsConfig) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(BigSegmentStoreStatus {
            available: true,
            stale: true,
        });
        let shutdown = CancellationToken::new();
        task::spawn(poll_store_status(
            Arc::clone(&config.store),
            status_tx,
            config.status_poll_interval,
            config.stale_after,
            shutdown.child_token(),
        ));
        Arc::new(Self {
            store: config.store,
            user_cache_time: config.user_cache_time,
            cache: Mutex::new(LruCache::new(config.user_cache_size)),
            inflight: Mutex::new(HashMap::new()),
            status_rx,
            shutdown,
        })
    }

    /// Last status published by the poller.
    pub fn status(&self) -> BigSegmentStoreStatus {
        *self.status_rx.borrow()
    }

    /// Watch status transitions.
    pub fn subscribe(&self) -> watch::Receiver<BigSegmentStoreStatus> {
        self.status_rx.clone()
    }

    /// Membership for a user, from cache or the store, plus the status the
    /// evaluator attaches to its reason.
    pub fn get_user_membership(
        &self,
        user_key: &str,
    ) -> (Option<Arc<Membership>>, BigSegmentsStatus) {
        match self.membership_for(user_key) {
            Err(error) => {
                warn!(%error, "big segment membership query failed");
                (None, BigSegmentsStatus::StoreError)
            }
            Ok(membership) => {
                let status = self.status();
                let status = if !status.available {
                    BigSegmentsStatus::StoreError
                } else if status.stale {
                    BigSegmentsStatus::Stale
                } else {
                    BigSegmentsStatus::Healthy
                };
                (membership, status)
            }
        }
    }

    fn membership_for(
        &self,
        user_key: &str,
    ) -> Result<Option<Arc<Membership>>, BigSegmentStoreError> {
        if let Some(cached) = self.cached_membership(user_key) {
            return Ok(cached);
        }

        // single flight: one store round-trip per user key
        let loader = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(user_key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _load_guard = loader.lock();
        let result = match self.cached_membership(user_key) {
            // another caller finished the load while we waited
            Some(cached) => Ok(cached),
            None => {
                let fetched = self
                    .store
                    .get_membership(&hash_for_user_key(user_key))
                    .map(|membership| membership.map(Arc::new));
                if let Ok(membership) = &fetched {
                    debug!(user = %user_key, found = membership.is_some(), "caching big segment membership");
                    self.cache.lock().put(
                        user_key.to_string(),
                        CachedMembership {
                            fetched: Instant::now(),
                            membership: membership.clone(),
                        },
                    );
                }
                fetched
            }
        };
        self.inflight.lock().remove(user_key);
        result
    }

    /// A fresh cache hit, `Some(None)` included: a user known to be in no
    /// big segment is cached just like any other answer.
    fn cached_membership(&self, user_key: &str) -> Option<Option<Arc<Membership>>> {
        let mut cache = self.cache.lock();
        match cache.get(user_key) {
            Some(entry) if entry.fetched.elapsed() < self.user_cache_time => {
                Some(entry.membership.clone())
            }
            _ => None,
        }
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for BigSegmentStoreWrapper {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Address under which a user's membership is stored externally.
pub fn hash_for_user_key(user_key: &str) -> String {
    base64::encode(Sha256::digest(user_key.as_bytes()))
}

async fn poll_store_status(
    store: Arc<dyn BigSegmentStore>,
    status_tx: watch::Sender<BigSegmentStoreStatus>,
    poll_interval: Duration,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = time::interval_at(time::Instant::now() + poll_interval, poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let poll_store = Arc::clone(&store);
        let metadata = task::spawn_blocking(move || poll_store.get_metadata()).await;
        let status = match metadata {
            Ok(Ok(metadata)) => BigSegmentStoreStatus {
                available: true,
                stale: is_stale(&metadata, stale_after),
            },
            Ok(Err(error)) => {
                warn!(%error, "failed reading big segment store metadata");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
            Err(join_error) => {
                warn!(%join_error, "big segment metadata poll did not finish");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };
        if *status_tx.borrow() != status {
            info!(
                available = status.available,
                stale = status.stale,
                "big segment store status changed"
            );
        }
        if status_tx.send(status).is_err() {
            return;
        }
    }
}

fn is_stale(metadata: &BigSegmentStoreMetadata, stale_after: Duration) -> bool {
    let now = chrono::Utc::now().timestamp_millis() as u64;
    match metadata.last_up_to_date {
        Some(last) => now.saturating_sub(last) > stale_after.as_millis() as u64,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        queries: AtomicUsize,
        membership: Membership,
    }

    impl CountingStore {
        fn new(membership: Membership) -> Arc<Self> {
            Arc::new(Self {
                queries: AtomicUsize::new(0),
                membership,
            })
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    impl BigSegmentStore for CountingStore {
        fn get_metadata(&self) -> Result<BigSegmentStoreMetadata, BigSegmentStoreError> {
            Ok(BigSegmentStoreMetadata {
                last_up_to_date: Some(chrono::Utc::now().timestamp_millis() as u64),
            })
        }

        fn get_membership(
            &self,
            _user_hash: &str,
        ) -> Result<Option<Membership>, BigSegmentStoreError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(Some(self.membership.clone()))
        }
    }

    fn wrapper_over(
        store: Arc<CountingStore>,
        cache_size: usize,
    ) -> Arc<BigSegmentStoreWrapper> {
        BigSegmentStoreWrapper::new(BigSegmentsConfig {
            user_cache_size: NonZeroUsize::new(cache_size).unwrap(),
            user_cache_time: Duration::from_secs(60),
            status_poll_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(120),
            store,
        })
    }

    #[tokio::test]
    async fn membership_is_cached_per_user() {
        let store = CountingStore::new(Membership::new());
        let wrapper = wrapper_over(Arc::clone(&store), 10);

        wrapper.get_user_membership("u1");
        wrapper.get_user_membership("u1");
        wrapper.get_user_membership("u1");
        assert_eq!(store.queries(), 1);
    }

    #[tokio::test]
    async fn lru_evicts_the_least_recent_user() {
        let store = CountingStore::new(Membership::new());
        let wrapper = wrapper_over(Arc::clone(&store), 2);

        wrapper.get_user_membership("u1");
        wrapper.get_user_membership("u2");
        wrapper.get_user_membership("u3");
        assert_eq!(store.queries(), 3);

        // u2 and u3 are still cached
        wrapper.get_user_membership("u2");
        wrapper.get_user_membership("u3");
        assert_eq!(store.queries(), 3);

        // u1 was evicted and must hit the store exactly once more
        wrapper.get_user_membership("u1");
        assert_eq!(store.queries(), 4);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let store = CountingStore::new(Membership::new());
        let wrapper = BigSegmentStoreWrapper::new(BigSegmentsConfig {
            user_cache_size: NonZeroUsize::new(10).unwrap(),
            user_cache_time: Duration::from_millis(0),
            status_poll_interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(120),
            store: Arc::clone(&store) as Arc<dyn BigSegmentStore>,
        });

        wrapper.get_user_membership("u1");
        wrapper.get_user_membership("u1");
        assert_eq!(store.queries(), 2);
    }

    #[tokio::test]
    async fn store_errors_report_store_error_status() {
        struct FailingStore;
        impl BigSegmentStore for FailingStore {
            fn get_metadata(&self) -> Result<BigSegmentStoreMetadata, BigSegmentStoreError> {
                Err(BigSegmentStoreError("down".into()))
            }
            fn get_membership(
                &self,
                _user_hash: &str,
            ) -> Result<Option<Membership>, BigSegmentStoreError> {
                Err(BigSegmentStoreError("down".into()))
            }
        }

        let wrapper = BigSegmentStoreWrapper::new(BigSegmentsConfig::new(Arc::new(FailingStore)));
        let (membership, status) = wrapper.get_user_membership("u1");
        assert!(membership.is_none());
        assert_eq!(status, BigSegmentsStatus::StoreError);
    }

    #[test]
    fn user_hash_is_stable() {
        assert_eq!(hash_for_user_key("userkey"), hash_for_user_key("userkey"));
        assert_ne!(hash_for_user_key("userkey"), hash_for_user_key("other"));
        // base64 of a sha-256 digest
        assert_eq!(hash_for_user_key("userkey").len(), 44);
    }

    #[test]
    fn staleness_follows_metadata_age() {
        let fresh = BigSegmentStoreMetadata {
            last_up_to_date: Some(chrono::Utc::now().timestamp_millis() as u64),
        };
        assert!(!is_stale(&fresh, Duration::from_secs(120)));

        let old = BigSegmentStoreMetadata {
            last_up_to_date: Some(0),
        };
        assert!(is_stale(&old, Duration::from_secs(120)));
        assert!(is_stale(&BigSegmentStoreMetadata::default(), Duration::from_secs(120)));
    }
}
