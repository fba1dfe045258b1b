//! The entry↔export association map.
//!
//! Many entries are visible through many exports. Each side keeps
//! association records keyed by the other side's id, so removal is O(1)
//! from either direction, the property the unexport walk depends on
//! while it mutates the list it is iterating.
//!
//! Lock discipline: an entry's association list lives behind its
//! `attr_lock`; an export's list behind its `exp_lock`. The sanctioned
//! order is `attr_lock` before `exp_lock`; the unexport walk is the
//! reason this pair inverts the usual "coarse before fine" instinct, and
//! the inverse order is forbidden everywhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::fsal::Export;

use super::CacheShared;
use super::entry::Entry;

/// Export identifier, process-unique.
pub(crate) type ExportId = u64;

/// The cache-side core of one export: the wrapped sub-export plus the
/// export half of the association map.
pub(crate) struct ExportCore {
    /// Process-unique id.
    pub id: ExportId,
    /// `"<sub name>/MDC"`.
    pub name: String,
    /// The sub-export underneath.
    pub sub: Arc<dyn Export>,
    /// Attribute validity window for objects served through this export.
    pub attr_ttl: Duration,
    /// Fractional jitter applied to `attr_ttl`.
    pub attr_jitter: f64,
    /// Set by unexport before the association walk. A dead export
    /// accepts no new associations and fails object operations Stale, so
    /// requests racing the unexport either complete normally or observe
    /// the export as gone, never a half-torn-down state.
    pub dead: AtomicBool,
    /// Lock 4 in the global order. Export-side association records, keyed
    /// by entry serial.
    pub exp_lock: RwLock<FxHashMap<u64, Arc<ExportAssoc>>>,
}

impl ExportCore {
    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

/// One association record. Owns no data; both sides point at it.
pub(crate) struct ExportAssoc {
    /// The entry side. Weak: an association must never keep an entry
    /// alive.
    pub entry: Weak<Entry>,
    /// The export side.
    pub export: Weak<ExportCore>,
    /// Cached ids so either side can be delisted without upgrading the
    /// other.
    pub export_id: ExportId,
    /// See `export_id`.
    pub entry_serial: u64,
}

/// Ensure `entry` carries an association to `export`, creating one if
/// missing. Called on every path that makes an entry reachable through an
/// export, which is what keeps the reachability invariant (reachable ⇔
/// associated ∧ ¬unreachable) true.
pub(crate) fn ensure_mapping(export: &Arc<ExportCore>, entry: &Arc<Entry>) {
    {
        let attr = entry.attr.read();
        if attr.exports.contains_key(&export.id) {
            return;
        }
    }

    let mut attr = entry.attr.write();
    if attr.exports.contains_key(&export.id) {
        return;
    }
    // attr_lock before exp_lock: the canonical order. The dead check
    // happens inside the exp_lock critical section so it pairs exactly
    // with the unexport walk's drain: either this insert lands before
    // the walk's next acquisition (and gets drained), or it observes
    // the export as dead and backs out.
    let mut exp = export.exp_lock.write();
    if export.is_dead() {
        return;
    }
    let assoc = Arc::new(ExportAssoc {
        entry: Arc::downgrade(entry),
        export: Arc::downgrade(export),
        export_id: export.id,
        entry_serial: entry.serial,
    });
    attr.exports.insert(export.id, Arc::clone(&assoc));
    if attr.first_export.is_none() {
        attr.first_export = Some(Arc::downgrade(export));
    }
    exp.insert(entry.serial, assoc);
    trace!(export = export.id, serial = entry.serial, "mapped entry to export");
}

/// Unlink every association of `entry`. Caller holds the entry's
/// `attr_lock` in write mode (reclaim path).
pub(crate) fn unlink_all(entry: &Entry, attr: &mut super::entry::AttrState) {
    for assoc in attr.exports.values() {
        if let Some(export) = assoc.export.upgrade() {
            export.exp_lock.write().remove(&assoc.entry_serial);
        }
    }
    attr.exports.clear();
    attr.first_export = None;
}

/// Drain the export's association list, delisting each entry in turn.
///
/// For each record: take a sentinel ref on the entry so it survives its
/// own delisting, acquire `attr_lock` then `exp_lock`, remove the record
/// from both sides, swap the first-export pointer to the new list head (or
/// null), release the locks in reverse order, and (with no entry lock
/// held) push association-less entries toward the cleanup queue.
pub(crate) fn unexport_walk(shared: &CacheShared, export: &Arc<ExportCore>) {
    loop {
        let assoc = export.exp_lock.read().values().next().cloned();
        let Some(assoc) = assoc else { break };

        let Some(entry) = assoc.entry.upgrade() else {
            // The entry is already gone; drop the orphaned record.
            export.exp_lock.write().remove(&assoc.entry_serial);
            continue;
        };

        // Sentinel ref, not a lookup ref: unreachable entries still need
        // their records removed, so the Stale gate does not apply here.
        entry.ref_get_sentinel();

        let push;
        {
            let mut attr = entry.attr.write();
            let mut exp = export.exp_lock.write();
            attr.exports.remove(&assoc.export_id);
            exp.remove(&assoc.entry_serial);
            if attr.exports.is_empty() {
                attr.first_export = None;
                push = true;
            } else {
                // Keep the pointer aimed at a live member of the list.
                attr.first_export = attr
                    .exports
                    .values()
                    .next()
                    .map(|a| Weak::clone(&a.export));
                push = false;
            }
        }

        if push {
            // No entry lock may be held here: the cleanup path takes the
            // lane mutex, which orders before attr_lock.
            shared.lru.cleanup_try_push(&entry);
        }

        shared.release_ref(&entry);
    }
}
