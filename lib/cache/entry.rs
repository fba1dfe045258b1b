//! The cache entry: one cached file-system object.
//!
//! An entry wraps the sub-backend handle it was observed through and
//! carries three co-existing locks:
//!
//! - `attr` (rwlock): cached attributes, the unreachable flag's
//!   authoritative transitions, the entry-side export associations and the
//!   first-export pointer.
//! - `content` (rwlock): the dirent index and chunk bookkeeping for
//!   directories, open-state counts for regular files, the cached target
//!   for symlinks.
//! - `state` (mutex): NFS state (locks/delegations/shares) attached to the
//!   object.
//!
//! Lifetime: an entry is created on first observation and stays reachable
//! while its refcount is positive *or* it sits on an LRU lane; it is
//! reclaimed only once both conditions have failed and the reaper has
//! quiesced it. `Arc` owns the memory; "reclaim" means flipping
//! unreachable, unlinking from the store, exports and LRU, and releasing
//! the wrapped backend handle.

use std::sync::Weak;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::fsal::{
    Attributes, DelegationKind, FsKey, ObjectHandle, ObjectType, StateHandle, Status,
};

use super::avl::DirentIndex;
use super::chunk::ChunkSpace;
use super::export_map::{ExportAssoc, ExportCore, ExportId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EntryFlags: u32 {
        /// Never returned from lookup again, even while still refcounted.
        const UNREACHABLE = 1 << 0;
        /// The entry should go to the cleanup queue the moment its
        /// refcount reaches zero.
        const CLEANUP_PENDING = 1 << 1;
    }
}

/// Which LRU list the entry currently sits on. Written only under the
/// owning lane's mutex; read lock-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum LruWhere {
    /// Hot queue.
    L1 = 0,
    /// Cold queue, eligible for reclaim at refcount zero.
    L2 = 1,
    /// Cleanup queue, eviction bypassing LRU age.
    Cleanup = 2,
    /// Transiently on no list (mid-reclaim or freshly created).
    Detached = 3,
}

impl LruWhere {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::L1,
            1 => Self::L2,
            2 => Self::Cleanup,
            _ => Self::Detached,
        }
    }
}

/// State behind the attr lock.
pub(crate) struct AttrState {
    /// Last attributes the backend reported.
    pub attrs: Attributes,
    /// Whether `attrs` has ever been filled from the backend (as opposed
    /// to the minimal creation-time snapshot).
    pub fetched: bool,
    /// When `attrs` stops being authoritative.
    pub expires_at: Option<Instant>,
    /// Entry-side export association records, keyed by export id.
    pub exports: FxHashMap<ExportId, std::sync::Arc<ExportAssoc>>,
    /// The most recently relevant export, always a member of `exports`
    /// (or `None` when the list is empty). Swapped on removal.
    pub first_export: Option<Weak<ExportCore>>,
}

impl AttrState {
    /// Whether cached attributes may be served without a backend call.
    pub(crate) fn current(&self, now: Instant) -> bool {
        self.fetched && self.expires_at.is_some_and(|e| now < e)
    }

    /// Force the next reader to the backend.
    pub(crate) fn expire(&mut self) {
        self.expires_at = None;
    }
}

/// Directory-only bookkeeping behind the content lock.
pub(crate) struct DirState {
    /// Name→child index.
    pub index: DirentIndex,
    /// Populated enumeration chunks and the cookie seed.
    pub chunks: ChunkSpace,
    /// Set only when the chunks cover the backend's whole enumeration.
    pub complete: bool,
    /// Enumeration epoch, used as the readdir verifier. Bumped on every
    /// namespace change and invalidation.
    pub epoch: u64,
    /// A probe walk overflowed; the reaper owes this directory a full
    /// reindex.
    pub needs_reindex: bool,
}

impl DirState {
    pub(crate) fn new(probe_bound: u32) -> Self {
        Self {
            index: DirentIndex::new(probe_bound),
            chunks: ChunkSpace::new(),
            complete: false,
            epoch: 1,
            needs_reindex: false,
        }
    }

    /// Drop all enumeration state and invalidate outstanding cursors.
    /// Dirents survive unless `sweep_index` is set.
    pub(crate) fn invalidate(&mut self, sweep_index: bool) {
        if sweep_index {
            self.index.clean();
            self.needs_reindex = false;
        }
        self.chunks.clear();
        self.complete = false;
        self.epoch += 1;
    }
}

/// Regular-file bookkeeping behind the content lock.
#[derive(Default)]
pub(crate) struct FileState {
    /// Live open-state count created through this cache.
    pub opens: u32,
}

/// Content-lock payload, by object type.
pub(crate) enum ContentState {
    /// Directory: dirent index plus enumeration chunks.
    Dir(DirState),
    /// Regular file: open-state bookkeeping.
    File(FileState),
    /// Symlink: cached target, fetched lazily.
    Link(Option<Bytes>),
    /// Fifo/socket/device nodes carry no content state.
    Other,
}

impl ContentState {
    pub(crate) fn for_type(t: ObjectType, probe_bound: u32) -> Self {
        match t {
            ObjectType::Directory => Self::Dir(DirState::new(probe_bound)),
            ObjectType::Regular => Self::File(FileState::default()),
            ObjectType::Symlink => Self::Link(None),
            _ => Self::Other,
        }
    }

    pub(crate) fn dir(&self) -> Option<&DirState> {
        match self {
            Self::Dir(d) => Some(d),
            _ => None,
        }
    }

    pub(crate) fn dir_mut(&mut self) -> Option<&mut DirState> {
        match self {
            Self::Dir(d) => Some(d),
            _ => None,
        }
    }
}

/// NFS state attached to the object, behind the state lock.
#[derive(Default)]
pub(crate) struct NfsState {
    /// Backend-allocated state handles owned by this object.
    pub states: Vec<StateHandle>,
    /// Outstanding delegation, if any.
    pub delegation: Option<DelegationKind>,
    /// A recall for the delegation has been requested and not resolved.
    pub recall_pending: bool,
}

/// One cached object.
pub(crate) struct Entry {
    /// Export-independent backend identity.
    pub key: FsKey,
    /// Process-unique serial; the LRU lane key.
    pub serial: u64,
    /// Lane assignment, hashed from identity at creation. Never migrates.
    pub lane: usize,
    /// Object type, fixed at creation.
    pub obj_type: ObjectType,
    /// The wrapped sub-backend handle. Dropping it releases whatever the
    /// backend holds.
    pub sub: Box<dyn ObjectHandle>,

    refcnt: AtomicI64,
    flags: AtomicU32,
    lru_where: AtomicU8,

    /// Lock 2 in the global order.
    pub attr: RwLock<AttrState>,
    /// Lock 3.
    pub content: RwLock<ContentState>,
    /// Lock 5.
    pub state: Mutex<NfsState>,
}

impl Entry {
    pub(crate) fn new(
        key: FsKey,
        serial: u64,
        lane: usize,
        sub: Box<dyn ObjectHandle>,
        obj_type: ObjectType,
        probe_bound: u32,
    ) -> Self {
        Self {
            key,
            serial,
            lane,
            obj_type,
            sub,
            refcnt: AtomicI64::new(0),
            flags: AtomicU32::new(0),
            lru_where: AtomicU8::new(LruWhere::Detached as u8),
            attr: RwLock::new(AttrState {
                attrs: Attributes::minimal(obj_type),
                fetched: false,
                expires_at: None,
                exports: FxHashMap::default(),
                first_export: None,
            }),
            content: RwLock::new(ContentState::for_type(obj_type, probe_bound)),
            state: Mutex::new(NfsState::default()),
        }
    }

    /// Take a reference for a caller outside the cache.
    ///
    /// The increment-then-check order pairs with the reaper's
    /// set-unreachable-then-check in [`Entry::begin_reclaim`]: between the
    /// two SeqCst sequences, either this getter observes `UNREACHABLE` and
    /// backs off, or the reaper observes the non-zero count and aborts.
    pub(crate) fn ref_get(&self) -> Result<(), Status> {
        self.refcnt.fetch_add(1, Ordering::SeqCst);
        if self.flags.load(Ordering::SeqCst) & EntryFlags::UNREACHABLE.bits() != 0 {
            self.refcnt.fetch_sub(1, Ordering::SeqCst);
            return Err(Status::Stale);
        }
        Ok(())
    }

    /// Take a reference without the reachability gate. Used by cleanup
    /// work (unexport, upcalls) that must pin entries other callers can no
    /// longer see.
    pub(crate) fn ref_get_sentinel(&self) {
        self.refcnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a reference, returning the new count. Underflow is a fatal
    /// discipline violation.
    pub(crate) fn ref_release(&self) -> i64 {
        let prev = self.refcnt.fetch_sub(1, Ordering::SeqCst);
        assert!(
            prev > 0,
            "refcount underflow on entry {:?} (serial {})",
            self.key,
            self.serial
        );
        prev - 1
    }

    pub(crate) fn refcount(&self) -> i64 {
        self.refcnt.load(Ordering::SeqCst)
    }

    pub(crate) fn is_unreachable(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & EntryFlags::UNREACHABLE.bits() != 0
    }

    /// First half of reclaim: flip unreachable, then confirm nobody holds
    /// a reference. On `false` the flip is undone and the entry remains
    /// live. Caller must hold the entry's attr lock in write mode.
    pub(crate) fn begin_reclaim(&self) -> bool {
        self.flags
            .fetch_or(EntryFlags::UNREACHABLE.bits(), Ordering::SeqCst);
        if self.refcnt.load(Ordering::SeqCst) != 0 {
            self.flags
                .fetch_and(!EntryFlags::UNREACHABLE.bits(), Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Set unreachable unconditionally (upcall/stale paths). Caller must
    /// hold the attr lock in write mode.
    pub(crate) fn set_unreachable(&self) {
        self.flags
            .fetch_or(EntryFlags::UNREACHABLE.bits(), Ordering::SeqCst);
    }

    pub(crate) fn set_cleanup_pending(&self) {
        self.flags
            .fetch_or(EntryFlags::CLEANUP_PENDING.bits(), Ordering::SeqCst);
    }

    pub(crate) fn take_cleanup_pending(&self) -> bool {
        let prev = self
            .flags
            .fetch_and(!EntryFlags::CLEANUP_PENDING.bits(), Ordering::SeqCst);
        prev & EntryFlags::CLEANUP_PENDING.bits() != 0
    }

    pub(crate) fn lru_where(&self) -> LruWhere {
        LruWhere::from_u8(self.lru_where.load(Ordering::Relaxed))
    }

    /// Record list membership. Only call under the owning lane's mutex.
    pub(crate) fn set_lru_where(&self, w: LruWhere) {
        self.lru_where.store(w as u8, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("serial", &self.serial)
            .field("lane", &self.lane)
            .field("type", &self.obj_type)
            .field("refcnt", &self.refcount())
            .finish_non_exhaustive()
    }
}
