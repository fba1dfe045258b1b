//! The metadata cache core.
//!
//! Everything process-wide lives in one cache context ([`MdCache`]):
//! the entry store, the LRU lanes, and the delayed executor. There are no
//! hidden globals, so tests instantiate as many isolated caches as they
//! like.

/// Hashed dirent index with quadratic probing.
pub mod avl;
/// Startup-only configuration.
pub mod config;

mod chunk;
mod entry;
mod export_map;
mod facade;
mod lru;
mod store;
mod upcall;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::info;

use crate::exec::DelayedExecutor;
use crate::fsal::{Export, Status, StatusResult, UpcallOps};

use config::CacheConfig;
use entry::Entry;
use lru::LruEngine;
use store::EntryStore;

pub use facade::MdcExport;
pub use lru::LruStats;
pub use upcall::UpcallHandler;

/// Shared core handed (via `Arc`) to every facade object, the reaper and
/// the upcall handler.
pub(crate) struct CacheShared {
    pub(crate) cfg: CacheConfig,
    pub(crate) store: EntryStore,
    pub(crate) lru: LruEngine,
    pub(crate) exec: DelayedExecutor,
    shutting_down: AtomicBool,
    next_export_id: AtomicU64,
}

impl CacheShared {
    /// Fail fast once teardown has begun.
    pub(crate) fn check_live(&self) -> StatusResult<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Status::Shutdown);
        }
        Ok(())
    }

    pub(crate) fn next_export_id(&self) -> u64 {
        self.next_export_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop one reference. At zero, a pending or unreachable entry goes to
    /// the cleanup queue; otherwise the reaper only gets a nudge if the
    /// store is over pressure.
    pub(crate) fn release_ref(&self, entry: &Arc<Entry>) {
        if entry.ref_release() == 0 {
            if entry.take_cleanup_pending() || entry.is_unreachable() {
                self.lru.cleanup_try_push(entry);
            } else if self.store.len() > self.cfg.entries_hiwat {
                self.lru.kick();
            }
        }
    }

    /// Make `entry` invisible to lookup and route it toward reclaim. The
    /// entry survives until in-flight references drain.
    pub(crate) fn mark_unreachable(&self, entry: &Arc<Entry>) {
        {
            // The flag's authoritative transitions happen under the attr
            // lock so they serialize with reclaim and attribute refresh.
            let _attr = entry.attr.write();
            entry.set_unreachable();
        }
        self.store.remove_exact(entry);
        self.lru.cleanup_try_push(entry);
    }
}

/// Point-in-time cache occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Entries in the store.
    pub entries: usize,
    /// LRU queue occupancy.
    pub lru: LruStats,
}

/// One metadata cache instance.
///
/// Cloning is cheap and shares the same cache. Construction spawns the
/// reaper and the delayed executor; [`MdCache::begin_shutdown`] and then
/// [`MdCache::destroy`] (or [`MdCache::emergency_cleanup`]) tear them
/// down.
#[derive(Clone)]
pub struct MdCache {
    shared: Arc<CacheShared>,
}

impl MdCache {
    /// Build a cache and start its background actors.
    #[must_use]
    pub fn new(cfg: CacheConfig) -> Self {
        let cfg = cfg.sanitized();
        info!(lanes = cfg.lanes, hiwat = cfg.entries_hiwat, "metadata cache starting");
        let shared = Arc::new(CacheShared {
            store: EntryStore::new(),
            lru: LruEngine::new(&cfg),
            exec: DelayedExecutor::start("mdc-delayed"),
            cfg,
            shutting_down: AtomicBool::new(false),
            next_export_id: AtomicU64::new(1),
        });
        shared.lru.start_reaper(Arc::downgrade(&shared));
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<CacheShared> {
        &self.shared
    }

    /// Wrap a sub-export into a cache export. The sub-export must already
    /// be fully created; stacking order here is the reverse of other
    /// stackable layers. `super_ops`, when given, receives re-raised
    /// upcalls that the host process must also observe.
    pub fn wrap_export(
        &self,
        sub: Arc<dyn Export>,
        super_ops: Option<Arc<dyn UpcallOps>>,
    ) -> StatusResult<MdcExport> {
        self.shared.check_live()?;
        Ok(MdcExport::create(Arc::clone(&self.shared), sub, super_ops))
    }

    /// Build the upcall vector backends should be given for this cache.
    /// `super_ops` receives re-raised notifications off the backend's
    /// thread.
    #[must_use]
    pub fn upcalls(&self, super_ops: Option<Arc<dyn UpcallOps>>) -> Arc<UpcallHandler> {
        Arc::new(UpcallHandler::new(Arc::clone(&self.shared), super_ops))
    }

    /// The cache's delayed executor.
    #[must_use]
    pub fn executor(&self) -> &DelayedExecutor {
        &self.shared.exec
    }

    /// Current occupancy.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.shared.store.len(),
            lru: self.shared.lru.stats(),
        }
    }

    /// Wake the reaper ahead of schedule.
    pub fn kick_reaper(&self) {
        self.shared.lru.kick();
    }

    /// Run one reaper cycle synchronously on the calling thread. The
    /// reaper itself does exactly this on its own schedule; tests and the
    /// teardown path use it for determinism.
    pub fn reap_now(&self) {
        self.shared.lru.reaper_pass(&self.shared);
    }

    /// Stage "stop accepting new requests": every facade operation from
    /// here on fails with [`Status::Shutdown`].
    pub fn begin_shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
    }

    /// Orderly teardown: stop the reaper and executor, then reclaim
    /// everything reclaimable. Entries still referenced by abandoned
    /// requests are logged and left to `Arc` reclamation.
    pub fn destroy(&self) {
        self.begin_shutdown();
        self.shared.lru.stop_reaper();
        self.shared.exec.shutdown();
        self.shared.lru.drain_all(&self.shared);
        info!("metadata cache destroyed");
    }

    /// Disorderly teardown: release what can be released without taking
    /// another entry lock. Anything more risks hanging on locks whose
    /// owners were cancelled.
    pub fn emergency_cleanup(&self) {
        self.begin_shutdown();
        self.shared.lru.stop_reaper();
        self.shared.exec.abandon();
        self.shared.lru.emergency_drain();
        info!("metadata cache emergency cleanup done");
    }
}
