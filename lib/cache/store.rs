//! The entry store: process-wide key→entry address space.
//!
//! Keyed by the export-independent backend identity, so an object shared
//! by several exports resolves to one entry no matter which export
//! observed it. The map itself is a concurrent hash map; per-key claim
//! races resolve inside the bucket (the loser of a creation race drops its
//! partial entry and adopts the winner's).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::fsal::{FsKey, ObjectHandle, ObjectType};

use super::avl;
use super::entry::Entry;

pub(crate) struct EntryStore {
    map: scc::HashMap<FsKey, Arc<Entry>>,
    next_serial: AtomicU64,
}

impl EntryStore {
    pub(crate) fn new() -> Self {
        Self {
            map: scc::HashMap::new(),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Number of entries currently in the store.
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Resolve a key to its entry, if cached. No reference is taken and
    /// no reachability check is made; callers gate with
    /// [`Entry::ref_get`] as appropriate.
    pub(crate) fn lookup(&self, key: &FsKey) -> Option<Arc<Entry>> {
        self.map.read(key, |_, e| Arc::clone(e))
    }

    /// Return the entry for `key`, creating it from `sub` on first
    /// observation. The boolean reports whether a new entry was created
    /// (the caller owes it an LRU insertion). An unreachable incumbent is
    /// replaced in place: it is mid-reclaim and must not be resurrected.
    pub(crate) fn get_or_create(
        &self,
        key: FsKey,
        sub: Box<dyn ObjectHandle>,
        obj_type: ObjectType,
        lane_count: usize,
        probe_bound: u32,
    ) -> (Arc<Entry>, bool) {
        let make = |key: FsKey, sub: Box<dyn ObjectHandle>| {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            let lane = (avl::name_key(key.as_bytes()) as usize) % lane_count;
            Arc::new(Entry::new(key, serial, lane, sub, obj_type, probe_bound))
        };

        match self.map.entry(key.clone()) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                if occ.get().is_unreachable() {
                    let fresh = make(key, sub);
                    debug!(serial = fresh.serial, "replacing reclaimed entry");
                    *occ.get_mut() = Arc::clone(&fresh);
                    (fresh, true)
                } else {
                    // Creation race lost (or plain hit): drop our handle,
                    // adopt the incumbent.
                    (Arc::clone(occ.get()), false)
                }
            }
            scc::hash_map::Entry::Vacant(vac) => {
                let fresh = make(key, sub);
                debug!(serial = fresh.serial, key = ?fresh.key, "new cache entry");
                vac.insert_entry(Arc::clone(&fresh));
                (fresh, true)
            }
        }
    }

    /// Remove `entry` from the store, but only if the slot still holds
    /// this exact entry; a replacement inserted after reclaim began must
    /// survive.
    pub(crate) fn remove_exact(&self, entry: &Entry) {
        let serial = entry.serial;
        drop(self.map.remove_if(&entry.key, |e| e.serial == serial));
    }
}
