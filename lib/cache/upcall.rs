//! Upcall handling: asynchronous invalidation from the sub-backend.
//!
//! The backend calls these with no idea what the cache has; an upcall for
//! an uncached key is dropped (there is nothing to invalidate). Upcalls
//! against the same entry serialize on the entry's attr lock in write
//! mode. Nothing here calls back into the backend synchronously; work
//! the host must observe is re-raised from the delayed executor.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::fsal::{DelegationKind, FsKey, InvalidateKind, UpcallOps};

use super::CacheShared;
use super::entry::{ContentState, Entry};

/// The upcall vector handed to backends stacked under this cache.
pub struct UpcallHandler {
    shared: Arc<CacheShared>,
    super_ops: Option<Arc<dyn UpcallOps>>,
}

impl UpcallHandler {
    pub(crate) fn new(shared: Arc<CacheShared>, super_ops: Option<Arc<dyn UpcallOps>>) -> Self {
        Self { shared, super_ops }
    }

    /// Pin the entry for `key` across upcall work, if it is cached at all.
    fn pinned(&self, key: &FsKey) -> Option<Arc<Entry>> {
        let entry = self.shared.store.lookup(key)?;
        // Sentinel ref: upcalls apply to unreachable entries too (their
        // state may still be read by in-flight holders).
        entry.ref_get_sentinel();
        Some(entry)
    }

    /// Re-raise a notification to the host's upcall vector off this
    /// thread.
    fn raise(&self, f: impl FnOnce(&dyn UpcallOps) + Send + 'static) {
        if let Some(ops) = &self.super_ops {
            let ops = Arc::clone(ops);
            self.shared.exec.submit(move || f(ops.as_ref()));
        }
    }
}

impl UpcallOps for UpcallHandler {
    fn invalidate(&self, key: &FsKey, what: InvalidateKind) {
        let Some(entry) = self.pinned(key) else {
            trace!(?key, ?what, "invalidate upcall for uncached key dropped");
            return;
        };

        {
            // Held across the whole application so same-entry upcalls
            // serialize.
            let mut attr = entry.attr.write();
            if what.contains(InvalidateKind::ATTRS) {
                attr.expire();
            }
            if what.intersects(InvalidateKind::CONTENT | InvalidateKind::DIRENT) {
                let mut content = entry.content.write();
                match &mut *content {
                    ContentState::Dir(dir) => {
                        // A dirent invalidation sweeps the index; a plain
                        // content invalidation only kills enumeration
                        // state, keeping names (and tombstones) cached.
                        dir.invalidate(what.contains(InvalidateKind::DIRENT));
                    }
                    ContentState::Link(target) => *target = None,
                    ContentState::File(_) | ContentState::Other => {}
                }
            }
        }
        debug!(serial = entry.serial, ?what, "applied invalidate upcall");
        self.shared.release_ref(&entry);
    }

    fn rename(&self, old_parent: &FsKey, old_name: &[u8], new_parent: &FsKey, new_name: &[u8]) {
        if let Some(entry) = self.pinned(old_parent) {
            {
                let _attr = entry.attr.write();
                let mut content = entry.content.write();
                if let Some(dir) = content.dir_mut() {
                    dir.index.tombstone(old_name);
                    if new_parent == old_parent {
                        // Rename-over within one directory: any cached
                        // positive for the target name is stale too.
                        dir.index.tombstone(new_name);
                    }
                    dir.invalidate(false);
                }
            }
            self.shared.release_ref(&entry);
        }
        // The upcall carries no child identity, so the target side only
        // gets its enumeration invalidated; the next lookup re-observes
        // the name from the backend.
        if new_parent != old_parent {
            if let Some(entry) = self.pinned(new_parent) {
                {
                    let _attr = entry.attr.write();
                    let mut content = entry.content.write();
                    if let Some(dir) = content.dir_mut() {
                        dir.index.tombstone(new_name);
                        dir.invalidate(false);
                    }
                }
                self.shared.release_ref(&entry);
            }
        }
        trace!(?old_parent, ?new_parent, "applied rename upcall");
    }

    fn delegation_recall(&self, key: &FsKey) {
        if let Some(entry) = self.pinned(key) {
            entry.state.lock().recall_pending = true;
            self.shared.release_ref(&entry);
        }
        let key = key.clone();
        self.raise(move |ops| ops.delegation_recall(&key));
    }

    fn grant(&self, key: &FsKey, kind: DelegationKind) {
        if let Some(entry) = self.pinned(key) {
            let mut st = entry.state.lock();
            st.delegation = Some(kind);
            st.recall_pending = false;
            drop(st);
            self.shared.release_ref(&entry);
        }
        let key = key.clone();
        self.raise(move |ops| ops.grant(&key, kind));
    }
}
