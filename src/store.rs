//! Versioned in-memory storage for flag and segment data.

use crate::models::{FeatureFlag, Segment};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

/// The two kinds of data the store holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Features => "features",
            DataKind::Segments => "segments",
        }
    }
}

/// A stored item: live data or the tombstone left behind by a deletion.
#[derive(Clone, Debug)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
    Tombstone(u64),
}

impl StoreItem {
    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(flag) => flag.version,
            StoreItem::Segment(segment) => segment.version,
            StoreItem::Tombstone(version) => *version,
        }
    }

    /// Tombstones and items carrying the deleted marker are invisible to
    /// readers but keep occupying their version slot.
    pub fn is_deleted(&self) -> bool {
        match self {
            StoreItem::Flag(flag) => flag.deleted,
            StoreItem::Segment(segment) => segment.deleted,
            StoreItem::Tombstone(_) => true,
        }
    }

    pub fn into_flag(self) -> Option<FeatureFlag> {
        match self {
            StoreItem::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    pub fn into_segment(self) -> Option<Segment> {
        match self {
            StoreItem::Segment(segment) => Some(segment),
            _ => None,
        }
    }
}

/// An ordered full data set, as handed to [`Store::init`].
///
/// Order is meaningful: segments are listed before features, and features
/// are listed with prerequisites ahead of their dependents, so a backend
/// that applies entries one by one never sees a dangling reference.
pub type AllData = Vec<(DataKind, Vec<(String, StoreItem)>)>;

/// Versioned key/value storage over the two data kinds.
///
/// Reads filter deleted items to `None`; writes follow the
/// version-monotonic rule, so replaying updates in any order converges.
pub trait Store: Send + Sync {
    /// Atomically replace all contents and mark the store initialized.
    fn init(&self, data: AllData);

    /// Current visible item, or `None` for missing and deleted keys.
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem>;

    /// All current visible items of one kind.
    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem>;

    /// Insert or update an item, unless the store already holds the same
    /// key at an equal or newer version. Returns the item now in the
    /// store. Deletions are upserts of [`StoreItem::Tombstone`].
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreItem;

    /// True once any init has succeeded.
    fn initialized(&self) -> bool;

    fn flag(&self, key: &str) -> Option<FeatureFlag> {
        self.get(DataKind::Features, key).and_then(StoreItem::into_flag)
    }

    fn segment(&self, key: &str) -> Option<Segment> {
        self.get(DataKind::Segments, key).and_then(StoreItem::into_segment)
    }
}

impl<T: Store + ?Sized> Store for Arc<T> {
    fn init(&self, data: AllData) {
        self.as_ref().init(data)
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        self.as_ref().get(kind, key)
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        self.as_ref().all(kind)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreItem {
        self.as_ref().upsert(kind, key, item)
    }

    fn initialized(&self) -> bool {
        self.as_ref().initialized()
    }
}

#[derive(Clone, Default)]
struct Contents {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
}

impl Contents {
    fn of_kind(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Features => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }

    fn of_kind_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Features => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }
}

/// The default, fully in-memory store.
///
/// Reads never block: the whole data set lives behind an atomic pointer
/// swap. Writes clone the current snapshot under a mutex, so concurrent
/// upserts serialize while readers keep going.
pub struct MemoryStore {
    contents: ArcSwap<Contents>,
    init: AtomicBool,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            contents: ArcSwap::new(Arc::new(Contents::default())),
            init: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }
}

impl Store for MemoryStore {
    fn init(&self, data: AllData) {
        let _guard = self.write_lock.lock();
        let mut contents = Contents::default();
        for (kind, items) in data {
            let map = contents.of_kind_mut(kind);
            for (key, item) in items {
                map.insert(key, item);
            }
        }
        self.contents.store(Arc::new(contents));
        self.init.store(true, Ordering::SeqCst);
    }

    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem> {
        self.contents
            .load()
            .of_kind(kind)
            .get(key)
            .filter(|item| !item.is_deleted())
            .cloned()
    }

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem> {
        self.contents
            .load()
            .of_kind(kind)
            .iter()
            .filter(|(_, item)| !item.is_deleted())
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect()
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreItem {
        let _guard = self.write_lock.lock();
        let mut updated = {
            // Drop once cloned - don't hold guard while storing
            let contents = self.contents.load();
            if let Some(existing) = contents.of_kind(kind).get(key) {
                // incoming version must beat what we have
                if item.version() <= existing.version() {
                    debug!(kind = kind.name(), %key, "ignoring stale update");
                    return existing.clone();
                }
            }
            contents.as_ref().clone()
        };
        updated.of_kind_mut(kind).insert(key.to_string(), item.clone());
        self.contents.store(Arc::new(updated));
        item
    }

    fn initialized(&self) -> bool {
        self.init.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FlagBuilder;

    fn flag_item(key: &str, version: u64) -> StoreItem {
        let mut flag = FlagBuilder::default().with_key(key).into_inner();
        flag.version = version;
        StoreItem::Flag(flag)
    }

    fn init_with(store: &MemoryStore, items: Vec<(String, StoreItem)>) {
        store.init(vec![
            (DataKind::Segments, vec![]),
            (DataKind::Features, items),
        ]);
    }

    #[test]
    fn empty_store_is_not_initialized() {
        let store = MemoryStore::new();
        assert!(!store.initialized());
        assert!(store.flag("anything").is_none());

        init_with(&store, vec![]);
        assert!(store.initialized());
        assert!(store.flag("anything").is_none());
    }

    #[test]
    fn init_replaces_everything() {
        let store = MemoryStore::new();
        init_with(&store, vec![("a".into(), flag_item("a", 1))]);
        init_with(&store, vec![("b".into(), flag_item("b", 1))]);
        assert!(store.flag("a").is_none());
        assert!(store.flag("b").is_some());
    }

    #[test]
    fn upsert_is_version_monotonic() {
        let store = MemoryStore::new();
        init_with(&store, vec![]);

        store.upsert(DataKind::Features, "f", flag_item("f", 2));
        // stale write is refused
        let kept = store.upsert(DataKind::Features, "f", flag_item("f", 1));
        assert_eq!(kept.version(), 2);
        assert_eq!(store.flag("f").map(|f| f.version), Some(2));
        // equal version is also refused
        store.upsert(DataKind::Features, "f", flag_item("f", 2));
        assert_eq!(store.flag("f").map(|f| f.version), Some(2));
        // newer version wins
        store.upsert(DataKind::Features, "f", flag_item("f", 3));
        assert_eq!(store.flag("f").map(|f| f.version), Some(3));
    }

    #[test]
    fn tombstones_hide_items_and_hold_their_version() {
        let store = MemoryStore::new();
        init_with(&store, vec![("f".into(), flag_item("f", 1))]);

        store.upsert(DataKind::Features, "f", StoreItem::Tombstone(3));
        assert!(store.flag("f").is_none());
        assert!(store.all(DataKind::Features).is_empty());

        // resurrecting below the tombstone version fails
        store.upsert(DataKind::Features, "f", flag_item("f", 2));
        assert!(store.flag("f").is_none());
        // above it succeeds
        store.upsert(DataKind::Features, "f", flag_item("f", 4));
        assert_eq!(store.flag("f").map(|f| f.version), Some(4));
    }

    #[test]
    fn kinds_do_not_collide() {
        let store = MemoryStore::new();
        init_with(&store, vec![("same-key".into(), flag_item("same-key", 1))]);
        assert!(store.flag("same-key").is_some());
        assert!(store.segment("same-key").is_none());
    }
}
