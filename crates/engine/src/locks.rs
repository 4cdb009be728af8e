//! Per-source-address locks. Shards own disjoint keys, but two keys can still name the same pod address
//! (IP reuse, stale objects); table work on one address is serialized across shards through here.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct AddressLocks {
    inner: Mutex<FxHashMap<IpAddr, Arc<AsyncMutex<()>>>>,
}

/// Holds every requested address lock until dropped.
pub struct AddressGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl AddressLocks {
    pub fn new() -> Self { Self::default() }

    /// Lock all of `addrs`. Acquisition is in sorted order so overlapping requests cannot deadlock.
    pub async fn lock(&self, addrs: &[IpAddr]) -> AddressGuard {
        let mut sorted = addrs.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            sorted.iter().map(|a| Arc::clone(map.entry(*a).or_default())).collect()
        };
        let mut guards = Vec::with_capacity(mutexes.len());
        for m in mutexes {
            guards.push(m.lock_owned().await);
        }
        AddressGuard { _guards: guards }
    }

    /// Forget addresses nobody holds or waits on.
    pub fn prune_idle(&self) -> usize {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let before = map.len();
        map.retain(|_, m| Arc::strong_count(m) > 1);
        before - map.len()
    }

    pub fn len(&self) -> usize { self.inner.lock().unwrap_or_else(|p| p.into_inner()).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
