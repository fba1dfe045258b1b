//! mdcache: metadata-cache stacking layer for a user-space NFS server.
//!
//! The cache sits between the protocol engine and a concrete backend
//! ("sub-FSAL"). It presents the same operation surface it consumes
//! ([`fsal::Export`] / [`fsal::ObjectHandle`]), answering what it can from
//! cached metadata and directory structure, and delegating the rest. Only
//! metadata is cached; file data always goes to the backend.
//!
//! # Lock order
//!
//! Locks are acquired in this order and released in reverse:
//!
//! 1. LRU lane mutex
//! 2. entry `attr_lock`
//! 3. entry `content_lock` (a parent's `content_lock` may additionally be
//!    held while taking a *child* entry's `attr_lock` during readdir)
//! 4. export `exp_lock`
//! 5. entry `state_lock`
//!
//! The unexport walk is the one sanctioned place where an entry's
//! `attr_lock` is taken before an export's `exp_lock`; the inverse order is
//! forbidden everywhere. The LRU reaper never blocks while holding a lane
//! mutex; every acquisition it makes beyond the lane is a `try_` variant.
//!
//! Violations of the lock order or of refcount discipline are process-fatal
//! bugs, not reportable errors.

/// Grace/halt admin surface and the staged shutdown sequence.
pub mod admin;
/// The metadata cache core.
pub mod cache;
/// Delayed executor for background follow-up work.
pub mod exec;
/// Backend (sub-FSAL) contract: the operation surface the cache consumes
/// from a backend and re-presents to the protocol engine.
pub mod fsal;

pub use cache::config::CacheConfig;
pub use cache::{MdCache, MdcExport};
pub use fsal::{Status, StatusResult};
