//! The upcall vector a backend uses to notify the layer above it.

use bitflags::bitflags;

use super::attrs::FsKey;

bitflags! {
    /// What an invalidation upcall targets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InvalidateKind: u32 {
        /// Cached attributes are stale.
        const ATTRS   = 1 << 0;
        /// Cached content (directory structure, link target, file
        /// verifier) is stale.
        const CONTENT = 1 << 1;
        /// The object's dirents (it is a directory) are stale.
        const DIRENT  = 1 << 2;
    }
}

/// Delegation kinds for grant/recall upcalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelegationKind {
    /// Read delegation.
    Read,
    /// Write delegation.
    Write,
}

/// Notifications a backend delivers asynchronously to the layer above.
///
/// Every method must be cheap and non-blocking from the backend's
/// perspective; receivers offload heavy follow-up work. A receiver must
/// never call back into the notifying backend synchronously.
pub trait UpcallOps: Send + Sync {
    /// Some state of the object identified by `key` is stale.
    fn invalidate(&self, key: &FsKey, what: InvalidateKind);

    /// The object known as `old_name` under `old_parent` is now
    /// `new_name` under `new_parent`.
    fn rename(&self, old_parent: &FsKey, old_name: &[u8], new_parent: &FsKey, new_name: &[u8]);

    /// The backend needs a delegation on `key` recalled from clients.
    fn delegation_recall(&self, key: &FsKey);

    /// The backend granted a delegation on `key`.
    fn grant(&self, key: &FsKey, kind: DelegationKind);
}
