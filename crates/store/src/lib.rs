//! egress-snat store: the set of currently known objects, fed by the event source and read by resync.
//!
//! A single writer (the engine dispatcher) owns [`ObjectCache`]. Readers hold a [`CacheHandle`] and see the
//! last frozen [`CacheSnapshot`]; freezing is explicit so bursts of events do not copy the map each time.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use snat_core::{ChangeEvent, ChangeKind, ObjectKey, ObjectSnapshot};
use tokio::sync::watch;
use tracing::debug;

/// Immutable view of the cache at some epoch.
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    pub epoch: u64,
    /// True once a complete list has been received. Before that the set is partial.
    pub synced: bool,
    pub objects: FxHashMap<ObjectKey, ObjectSnapshot>,
}

impl CacheSnapshot {
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
    pub fn get(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> { self.objects.get(key) }
}

pub struct ObjectCache {
    epoch: u64,
    frozen_epoch: u64,
    synced: bool,
    objects: FxHashMap<ObjectKey, ObjectSnapshot>,
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_tx: watch::Sender<u64>,
}

/// Read side of the cache.
#[derive(Clone)]
pub struct CacheHandle {
    snap: Arc<ArcSwap<CacheSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl CacheHandle {
    pub fn current(&self) -> Arc<CacheSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

impl ObjectCache {
    pub fn new() -> (Self, CacheHandle) {
        let snap = Arc::new(ArcSwap::from_pointee(CacheSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let cache = Self {
            epoch: 0,
            frozen_epoch: 0,
            synced: false,
            objects: FxHashMap::default(),
            snap: Arc::clone(&snap),
            epoch_tx,
        };
        (cache, CacheHandle { snap, epoch_rx })
    }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }
    pub fn is_synced(&self) -> bool { self.synced }
    pub fn epoch(&self) -> u64 { self.epoch }
    pub fn get(&self, key: &ObjectKey) -> Option<&ObjectSnapshot> { self.objects.get(key) }

    /// Apply a single change and return the previous snapshot for the key, if any.
    pub fn apply(&mut self, ev: &ChangeEvent) -> Option<ObjectSnapshot> {
        self.epoch = self.epoch.saturating_add(1);
        match ev.kind {
            ChangeKind::Add | ChangeKind::Update => self.objects.insert(ev.key.clone(), ev.object.clone()),
            ChangeKind::Delete => self.objects.remove(&ev.key),
        }
    }

    /// Replace the whole set after a relist. Returns keys that vanished.
    pub fn replace(&mut self, list: Vec<(ObjectKey, ObjectSnapshot)>) -> Vec<ObjectKey> {
        let next: FxHashMap<ObjectKey, ObjectSnapshot> = list.into_iter().collect();
        let mut gone: Vec<ObjectKey> = self.objects.keys().filter(|k| !next.contains_key(*k)).cloned().collect();
        gone.sort();
        debug!(objects = next.len(), gone = gone.len(), "cache relisted");
        self.objects = next;
        self.synced = true;
        self.epoch = self.epoch.saturating_add(1);
        gone
    }

    /// Publish the current state to readers. Reuses the last snapshot when nothing changed.
    pub fn freeze(&mut self) -> Arc<CacheSnapshot> {
        if self.frozen_epoch == self.epoch && self.epoch != 0 {
            return self.snap.load_full();
        }
        let next = Arc::new(CacheSnapshot { epoch: self.epoch, synced: self.synced, objects: self.objects.clone() });
        self.snap.store(Arc::clone(&next));
        self.frozen_epoch = self.epoch;
        let _ = self.epoch_tx.send(self.epoch);
        metrics::gauge!("snat_cached_objects", self.objects.len() as f64);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(kind: ChangeKind, name: &str, ip: &str) -> ChangeEvent {
        ChangeEvent {
            kind,
            key: ObjectKey::new("ns", name),
            object: ObjectSnapshot { status_address: Some(ip.into()), ..Default::default() },
        }
    }

    #[test]
    fn apply_tracks_adds_updates_deletes() {
        let (mut c, _h) = ObjectCache::new();
        assert!(c.apply(&ev(ChangeKind::Add, "a", "1.1.1.1")).is_none());
        let prev = c.apply(&ev(ChangeKind::Update, "a", "1.1.1.2")).unwrap();
        assert_eq!(prev.status_address.as_deref(), Some("1.1.1.1"));
        assert_eq!(c.len(), 1);
        c.apply(&ev(ChangeKind::Delete, "a", ""));
        assert!(c.is_empty());
        assert_eq!(c.epoch(), 3);
    }

    #[test]
    fn replace_reports_vanished_keys_and_marks_synced() {
        let (mut c, _h) = ObjectCache::new();
        c.apply(&ev(ChangeKind::Add, "a", "1.1.1.1"));
        c.apply(&ev(ChangeKind::Add, "b", "1.1.1.2"));
        assert!(!c.is_synced());
        let gone = c.replace(vec![(ObjectKey::new("ns", "b"), ObjectSnapshot::default())]);
        assert_eq!(gone, vec![ObjectKey::new("ns", "a")]);
        assert!(c.is_synced());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn freeze_publishes_to_handle_and_reuses_unchanged() {
        let (mut c, h) = ObjectCache::new();
        assert_eq!(h.current().epoch, 0);
        c.apply(&ev(ChangeKind::Add, "a", "1.1.1.1"));
        let s1 = c.freeze();
        assert_eq!(h.current().epoch, 1);
        assert_eq!(h.current().len(), 1);
        assert_eq!(*h.subscribe_epoch().borrow(), 1);
        let s2 = c.freeze();
        assert!(Arc::ptr_eq(&s1, &s2));
        // readers keep their old view until the next freeze
        c.apply(&ev(ChangeKind::Delete, "a", ""));
        assert_eq!(s1.len(), 1);
        assert_eq!(h.current().len(), 1);
        c.freeze();
        assert!(h.current().is_empty());
    }
}
