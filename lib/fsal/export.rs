//! Export-level half of the backend contract.

use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;

use super::attrs::FsKey;
use super::handle::ObjectHandle;
use super::status::StatusResult;

bitflags! {
    /// NFSv4 ACL support reported by a backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AclSupport: u32 {
        /// ALLOW ACEs are supported.
        const ALLOW = 1 << 0;
        /// DENY ACEs are supported.
        const DENY  = 1 << 1;
    }
}

/// Feature switches a backend may or may not support.
///
/// The cache interprets none of these; they are forwarded verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FsOption {
    /// Symbolic links.
    Symlinks,
    /// Hard links.
    Hardlinks,
    /// Named attributes (xattrs).
    NamedAttrs,
    /// Lock support.
    Locks,
    /// Share reservations.
    Shares,
    /// NFSv4 delegations.
    Delegations,
    /// pNFS layout operations.
    Pnfs,
    /// Case-insensitive name matching.
    CaseInsensitive,
    /// Honors `SetAttrs::atime`/`mtime`.
    ClientTimes,
}

/// pNFS layout types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LayoutType {
    /// File layouts (RFC 5661).
    File,
    /// Block volumes.
    Block,
    /// Object storage.
    Object,
    /// Flexible files.
    FlexFiles,
}

/// Which principal a quota applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaType {
    /// Per-user quota.
    User,
    /// Per-group quota.
    Group,
}

/// Quota limits and usage for one principal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    /// Hard limit in bytes.
    pub bytes_hard: u64,
    /// Soft limit in bytes.
    pub bytes_soft: u64,
    /// Bytes currently used.
    pub bytes_used: u64,
    /// Hard limit in files.
    pub files_hard: u64,
    /// Soft limit in files.
    pub files_soft: u64,
    /// Files currently used.
    pub files_used: u64,
}

/// Live file-system statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicFsInfo {
    /// Total bytes on the backing store.
    pub total_bytes: u64,
    /// Free bytes.
    pub free_bytes: u64,
    /// Bytes available to unprivileged users.
    pub avail_bytes: u64,
    /// Total file slots.
    pub total_files: u64,
    /// Free file slots.
    pub free_files: u64,
    /// File slots available to unprivileged users.
    pub avail_files: u64,
    /// Granularity of time stamps.
    pub time_delta: Duration,
}

/// Kinds of NFS state a backend can allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// Share reservation / open state.
    Share,
    /// Byte-range lock state.
    Lock,
    /// Delegation state.
    Delegation,
    /// Layout state.
    Layout,
}

/// An opaque piece of NFS state allocated by a backend.
///
/// The cache stores these on the owning entry (under its `state_lock`) but
/// never interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHandle {
    /// Backend-assigned state identifier.
    pub id: u64,
    /// What kind of state this is.
    pub kind: StateKind,
}

/// Export-level operations of a backend.
///
/// Every query here is informational and side-effect free except
/// [`unexport`](Export::unexport) and [`release`](Export::release). The
/// cache forwards all of them unchanged; it imposes no limits of its own.
pub trait Export: Send + Sync {
    /// The export's name, used for logging and admin surfaces.
    fn name(&self) -> &str;

    /// Resolve a path within the export to an object handle. Used once at
    /// export setup to obtain the root.
    fn lookup_path(&self, path: &str) -> StatusResult<Box<dyn ObjectHandle>>;

    /// Decode a wire handle into the backend's identity key.
    fn extract_handle(&self, wire: &[u8]) -> StatusResult<FsKey>;

    /// Revive an object handle from a previously extracted identity key.
    fn create_handle(&self, key: &FsKey) -> StatusResult<Box<dyn ObjectHandle>>;

    /// Tear down the export's namespace visibility. Called before the
    /// owner starts dropping cached objects that were reachable through
    /// it.
    fn unexport(&self);

    /// Final release of export resources. No operation may follow.
    fn release(&self);

    /// Maximum supported file size in bytes.
    fn maxfilesize(&self) -> u64;
    /// Maximum supported read size in bytes.
    fn maxread(&self) -> u64;
    /// Maximum supported write size in bytes.
    fn maxwrite(&self) -> u64;
    /// Maximum supported hard-link count.
    fn maxlink(&self) -> u32;
    /// Maximum supported name length in bytes.
    fn maxnamelen(&self) -> u32;
    /// Maximum supported path length in bytes.
    fn maxpathlen(&self) -> u32;
    /// Lease duration granted to clients.
    fn lease_time(&self) -> Duration;
    /// ACL capabilities.
    fn acl_support(&self) -> AclSupport;
    /// Mask of attributes the backend can report.
    fn supported_attrs(&self) -> super::AttrMask;
    /// Creation umask applied by the backend.
    fn umask(&self) -> u32;
    /// Access bits governing xattr operations.
    fn xattr_access_rights(&self) -> u32;
    /// Whether the backend supports `opt`.
    fn fs_supports(&self, opt: FsOption) -> bool;
    /// Live file-system statistics.
    fn dynamic_info(&self) -> StatusResult<DynamicFsInfo>;

    /// Supported pNFS layout types.
    fn layout_types(&self) -> Vec<LayoutType>;
    /// pNFS layout block size.
    fn layout_blocksize(&self) -> u32;
    /// Maximum pNFS segment count per layout.
    fn maximum_segments(&self) -> u32;
    /// Size the backend needs for a layout loc_body.
    fn loc_body_size(&self) -> usize;
    /// Enumerate pNFS device ids for a layout type.
    fn device_list(&self, layout: LayoutType) -> StatusResult<Vec<u64>>;

    /// The backend's write verifier, returned in unstable-write replies.
    fn write_verifier(&self) -> Bytes;

    /// Check whether an operation on `path` would exceed quota.
    fn check_quota(&self, path: &str, quota_type: QuotaType) -> StatusResult<()>;
    /// Read quota limits and usage for a principal.
    fn get_quota(&self, path: &str, quota_type: QuotaType, id: u32) -> StatusResult<Quota>;
    /// Set quota limits for a principal, returning the resulting quota.
    fn set_quota(
        &self,
        path: &str,
        quota_type: QuotaType,
        id: u32,
        quota: &Quota,
    ) -> StatusResult<Quota>;

    /// Allocate a piece of NFS state.
    fn alloc_state(&self, kind: StateKind) -> StatusResult<StateHandle>;
    /// Free a piece of NFS state.
    fn free_state(&self, state: StateHandle);
}
