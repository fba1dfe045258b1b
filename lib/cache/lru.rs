//! Multi-lane pinned LRU, the reaper, and the cleanup queue.
//!
//! The LRU is sharded into a fixed number of lanes to spread contention;
//! an entry hashes to its lane at creation and never migrates. Each lane
//! is one mutex over two queues, L1 (hot, recently touched) and L2
//! (cold, reclaim candidates), plus a cleanup deque. Promotion L2 to L1
//! happens on access; demotion L1→L2 happens when the lane-local
//! hot-counter overflows. This approximates 2Q without a global clock
//! hand.
//!
//! Reference counts pin entries: a refcounted entry keeps its LRU
//! position but is never reclaimed. Reclaim is always opportunistic: the
//! reaper uses `try_` acquisitions beyond the lane mutex and simply moves
//! on when something is busy. It must never block while holding a lane
//! mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use hashlink::LinkedHashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::CacheShared;
use super::config::CacheConfig;
use super::entry::{Entry, LruWhere};
use super::export_map;

struct LaneQueues {
    l1: LinkedHashMap<u64, Arc<Entry>>,
    l2: LinkedHashMap<u64, Arc<Entry>>,
    cleanup: VecDeque<Arc<Entry>>,
    hot_ops: u32,
}

struct Lane {
    q: Mutex<LaneQueues>,
}

impl Lane {
    fn new() -> Self {
        Self {
            q: Mutex::new(LaneQueues {
                l1: LinkedHashMap::new(),
                l2: LinkedHashMap::new(),
                cleanup: VecDeque::new(),
                hot_ops: 0,
            }),
        }
    }
}

#[derive(Default)]
struct ReaperFlags {
    kicked: bool,
    stop: bool,
}

struct ReaperCtl {
    m: Mutex<ReaperFlags>,
    cv: Condvar,
}

/// Aggregate queue occupancy, for pressure decisions and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruStats {
    /// Entries on hot queues.
    pub hot: usize,
    /// Entries on cold queues.
    pub cold: usize,
    /// Entries awaiting cleanup.
    pub cleanup: usize,
}

pub(crate) struct LruEngine {
    lanes: Box<[Lane]>,
    ctl: Arc<ReaperCtl>,
    worker: Mutex<Option<JoinHandle<()>>>,
    reindex: Mutex<Vec<Weak<Entry>>>,
    reap_batch: usize,
    demote_period: u32,
    hiwat: usize,
    interval: Duration,
}

impl LruEngine {
    pub(crate) fn new(cfg: &CacheConfig) -> Self {
        let lanes = (0..cfg.lanes).map(|_| Lane::new()).collect();
        Self {
            lanes,
            ctl: Arc::new(ReaperCtl {
                m: Mutex::new(ReaperFlags::default()),
                cv: Condvar::new(),
            }),
            worker: Mutex::new(None),
            reindex: Mutex::new(Vec::new()),
            reap_batch: cfg.reap_batch,
            demote_period: cfg.demote_period,
            hiwat: cfg.entries_hiwat,
            interval: cfg.lru_run_interval,
        }
    }

    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn lane(&self, entry: &Entry) -> &Lane {
        &self.lanes[entry.lane]
    }

    /// Place a freshly created entry on its lane's hot queue.
    pub(crate) fn insert(&self, entry: &Arc<Entry>) {
        let mut q = self.lane(entry).q.lock();
        q.l1.insert(entry.serial, Arc::clone(entry));
        entry.set_lru_where(LruWhere::L1);
        Self::account_hot_op(&mut q, self.demote_period);
    }

    /// Record an access: refresh within L1, or promote out of L2.
    pub(crate) fn touch(&self, entry: &Arc<Entry>) {
        let mut q = self.lane(entry).q.lock();
        match entry.lru_where() {
            LruWhere::L1 => {
                if let Some(e) = q.l1.remove(&entry.serial) {
                    q.l1.insert(entry.serial, e);
                }
            }
            LruWhere::L2 => {
                if let Some(e) = q.l2.remove(&entry.serial) {
                    q.l1.insert(entry.serial, e);
                    entry.set_lru_where(LruWhere::L1);
                }
            }
            // Mid-reclaim or queued for cleanup: the access raced a
            // removal and loses.
            LruWhere::Cleanup | LruWhere::Detached => {}
        }
        Self::account_hot_op(&mut q, self.demote_period);
    }

    /// Hot-counter bookkeeping; on overflow the oldest hot entry cools
    /// down to L2.
    fn account_hot_op(q: &mut LaneQueues, demote_period: u32) {
        q.hot_ops += 1;
        if q.hot_ops >= demote_period {
            q.hot_ops = 0;
            if let Some((serial, e)) = q.l1.pop_front() {
                e.set_lru_where(LruWhere::L2);
                q.l2.insert(serial, e);
            }
        }
    }

    /// Try to move `entry` to the cleanup queue, bypassing LRU age. Called
    /// when the last export association is removed. If the entry is still
    /// referenced it is only flagged, and the final `release_ref` performs
    /// the push.
    ///
    /// The caller must not hold the entry's attr lock: this path takes the
    /// lane mutex, which orders before it.
    pub(crate) fn cleanup_try_push(&self, entry: &Arc<Entry>) {
        let mut q = self.lane(entry).q.lock();
        if entry.refcount() != 0 {
            entry.set_cleanup_pending();
            return;
        }
        match entry.lru_where() {
            LruWhere::L1 => {
                q.l1.remove(&entry.serial);
            }
            LruWhere::L2 => {
                q.l2.remove(&entry.serial);
            }
            LruWhere::Cleanup => return,
            LruWhere::Detached => {}
        }
        entry.set_lru_where(LruWhere::Cleanup);
        q.cleanup.push_back(Arc::clone(entry));
        drop(q);
        self.kick();
    }

    /// Remember that `entry`'s dirent index overflowed its probe bound and
    /// owes a full reindex.
    pub(crate) fn queue_reindex(&self, entry: &Arc<Entry>) {
        self.reindex.lock().push(Arc::downgrade(entry));
        self.kick();
    }

    /// Wake the reaper ahead of its periodic schedule.
    pub(crate) fn kick(&self) {
        let mut f = self.ctl.m.lock();
        f.kicked = true;
        self.ctl.cv.notify_all();
    }

    /// Spawn the background reaper. Holds only a weak reference to the
    /// cache so the thread cannot keep a dropped cache alive.
    pub(crate) fn start_reaper(&self, shared: Weak<CacheShared>) {
        let ctl = Arc::clone(&self.ctl);
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("mdc-reaper".into())
            .spawn(move || {
                loop {
                    {
                        let mut f = ctl.m.lock();
                        if !f.stop && !f.kicked {
                            let _ = ctl.cv.wait_for(&mut f, interval);
                        }
                        if f.stop {
                            break;
                        }
                        f.kicked = false;
                    }
                    let Some(shared) = shared.upgrade() else { break };
                    shared.lru.reaper_pass(&shared);
                }
                debug!("reaper stopped");
            })
            .unwrap_or_else(|e| panic!("failed to spawn reaper thread: {e}"));
        *self.worker.lock() = Some(handle);
    }

    /// Stop and join the reaper.
    pub(crate) fn stop_reaper(&self) {
        {
            let mut f = self.ctl.m.lock();
            f.stop = true;
            self.ctl.cv.notify_all();
        }
        if let Some(h) = self.worker.lock().take() {
            if h.join().is_err() {
                warn!("reaper thread panicked before join");
            }
        }
    }

    /// One full reaper cycle: reindex debts, cleanup queues, then lane
    /// pressure if the store is over its high-water mark.
    pub(crate) fn reaper_pass(&self, shared: &CacheShared) {
        self.run_reindex();
        self.run_cleanup(shared);
        if shared.store.len() > self.hiwat {
            self.run_pressure(shared);
        }
    }

    fn run_reindex(&self) {
        let debts = std::mem::take(&mut *self.reindex.lock());
        for weak in debts {
            let Some(entry) = weak.upgrade() else { continue };
            let mut content = entry.content.write();
            if let Some(dir) = content.dir_mut() {
                if dir.needs_reindex {
                    debug!(serial = entry.serial, "reindexing dirent index");
                    dir.invalidate(true);
                }
            }
        }
    }

    fn run_cleanup(&self, shared: &CacheShared) {
        for lane in &self.lanes {
            let mut budget = {
                let q = lane.q.lock();
                q.cleanup.len()
            };
            while budget > 0 {
                budget -= 1;
                let Some(entry) = lane.q.lock().cleanup.pop_front() else {
                    break;
                };
                entry.set_lru_where(LruWhere::Detached);
                if Self::try_reclaim(shared, &entry) {
                    continue;
                }
                if entry.refcount() != 0 {
                    // Re-referenced after the push: park it on L2 with the
                    // pending flag armed; the final release re-pushes it.
                    entry.set_cleanup_pending();
                    let mut q = lane.q.lock();
                    entry.set_lru_where(LruWhere::L2);
                    q.l2.insert(entry.serial, Arc::clone(&entry));
                } else {
                    // Lock was busy: stay on the cleanup queue for the
                    // next pass. The budget keeps one wedged entry from
                    // spinning this pass.
                    let mut q = lane.q.lock();
                    entry.set_lru_where(LruWhere::Cleanup);
                    q.cleanup.push_back(Arc::clone(&entry));
                }
            }
        }
    }

    fn run_pressure(&self, shared: &CacheShared) {
        for lane in &self.lanes {
            let mut candidates = Vec::new();
            {
                let mut q = lane.q.lock();
                // Under pressure the reaper also rebalances: cold queues
                // refill from the oldest hot entries so a lane whose L2
                // ran dry still yields candidates.
                while q.l2.len() < self.reap_batch {
                    let Some((serial, e)) = q.l1.pop_front() else { break };
                    e.set_lru_where(LruWhere::L2);
                    q.l2.insert(serial, e);
                }
                // Tail-first: pop from the cold end. Pinned entries cycle
                // to the MRU end; they are in active use regardless of
                // their queue age.
                let mut scanned = 0;
                let limit = q.l2.len();
                while candidates.len() < self.reap_batch && scanned < limit {
                    let Some((serial, e)) = q.l2.pop_front() else { break };
                    scanned += 1;
                    if e.refcount() == 0 {
                        e.set_lru_where(LruWhere::Detached);
                        candidates.push(e);
                    } else {
                        q.l2.insert(serial, e);
                    }
                }
            }
            for entry in candidates {
                if !Self::try_reclaim(shared, &entry) {
                    let mut q = lane.q.lock();
                    entry.set_lru_where(LruWhere::L2);
                    q.l2.insert(entry.serial, Arc::clone(&entry));
                }
            }
        }
    }

    /// Opportunistic reclaim. Returns `false` without side effects when
    /// the entry is busy (lock held or references appeared).
    fn try_reclaim(shared: &CacheShared, entry: &Arc<Entry>) -> bool {
        let Some(mut attr) = entry.attr.try_write() else {
            return false;
        };
        if !entry.begin_reclaim() {
            return false;
        }
        // Committed: the entry is unreachable and unreferenced. Unlink
        // from exports (attr → exp order) and the store.
        export_map::unlink_all(entry, &mut attr);
        shared.store.remove_exact(entry);
        drop(attr);

        // With the entry unreachable and unreferenced, no caller can hold
        // its content lock anymore.
        {
            let mut content = entry.content.write();
            if let Some(dir) = content.dir_mut() {
                dir.invalidate(true);
            }
        }
        trace!(serial = entry.serial, key = ?entry.key, "reclaimed entry");
        // Dropping the last Arc releases the wrapped backend handle.
        true
    }

    /// Queue occupancy across all lanes.
    pub(crate) fn stats(&self) -> LruStats {
        let mut s = LruStats::default();
        for lane in &self.lanes {
            let q = lane.q.lock();
            s.hot += q.l1.len();
            s.cold += q.l2.len();
            s.cleanup += q.cleanup.len();
        }
        s
    }

    /// Orderly teardown sweep: reclaim everything reclaimable, warn about
    /// what is still pinned (in-flight requests are abandoned at
    /// shutdown, not cancelled).
    pub(crate) fn drain_all(&self, shared: &CacheShared) {
        for lane in &self.lanes {
            let entries: Vec<Arc<Entry>> = {
                let mut q = lane.q.lock();
                q.hot_ops = 0;
                let mut out = Vec::with_capacity(q.l1.len() + q.l2.len() + q.cleanup.len());
                while let Some((_, e)) = q.l1.pop_front() {
                    out.push(e);
                }
                while let Some((_, e)) = q.l2.pop_front() {
                    out.push(e);
                }
                out.extend(q.cleanup.drain(..));
                out
            };
            for entry in entries {
                entry.set_lru_where(LruWhere::Detached);
                if !Self::try_reclaim(shared, &entry) {
                    warn!(
                        serial = entry.serial,
                        refcnt = entry.refcount(),
                        "entry still referenced at teardown; abandoning"
                    );
                }
            }
        }
    }

    /// Emergency sweep: drop every queue without touching entry locks.
    /// Used on the disorderly shutdown path, where taking potentially
    /// invalid locks risks hanging the process.
    pub(crate) fn emergency_drain(&self) {
        for lane in &self.lanes {
            let mut q = lane.q.lock();
            q.l1.clear();
            q.l2.clear();
            q.cleanup.clear();
        }
    }
}
