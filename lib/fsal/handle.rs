//! Per-object half of the backend contract.

use bitflags::bitflags;
use bytes::Bytes;

use super::attrs::{Attributes, FsKey, ObjectType, SetAttrs};
use super::status::StatusResult;

bitflags! {
    /// Open disposition for [`ObjectHandle::open`].
    ///
    /// These are NFS-level intents, not POSIX `open(2)` flags; backends
    /// translate them to whatever their storage needs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ     = 1 << 0;
        /// Open for writing.
        const WRITE    = 1 << 1;
        /// Create if absent.
        const CREATE   = 1 << 2;
        /// Fail if the object already exists (with `CREATE`).
        const EXCLUSIVE = 1 << 3;
        /// Truncate on open.
        const TRUNCATE = 1 << 4;
    }
}

/// Verifier returned by commit/unstable writes; clients compare verifiers
/// to detect server reboots between write and commit.
pub type WriteVerifier = [u8; 8];

/// One directory entry reported by a backend enumeration.
pub struct DirentInfo {
    /// The entry's name, raw bytes.
    pub name: Bytes,
    /// A live handle to the child object.
    pub handle: Box<dyn ObjectHandle>,
    /// Attributes the backend already had on hand for the child.
    pub attrs: Attributes,
    /// The backend's own continuation cookie *after* this entry. Opaque to
    /// the cache; only ever handed back to the same backend as `whence`.
    pub cookie: u64,
}

/// Enumeration callback: return `true` to continue, `false` to stop early.
pub type ReaddirCb<'a> = dyn FnMut(DirentInfo) -> bool + 'a;

/// Per-object operations of a backend.
///
/// Handles are cheap identities, not open files: open state is created by
/// [`open`](ObjectHandle::open) and discarded by
/// [`close`](ObjectHandle::close). Dropping a handle releases whatever the
/// backend holds for it.
pub trait ObjectHandle: Send + Sync {
    /// The object's export-independent identity key.
    fn key(&self) -> FsKey;

    /// The object's type.
    fn object_type(&self) -> ObjectType;

    /// Fetch current attributes.
    fn getattrs(&self) -> StatusResult<Attributes>;

    /// Apply attribute changes, returning the refreshed attributes.
    fn setattrs(&self, set: &SetAttrs) -> StatusResult<Attributes>;

    /// Look up `name` in this directory.
    fn lookup(&self, name: &[u8]) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)>;

    /// Enumerate this directory starting after `whence` (`None` for the
    /// beginning). Returns `true` when the enumeration reached the end.
    fn readdir(&self, whence: Option<u64>, cb: &mut ReaddirCb<'_>) -> StatusResult<bool>;

    /// Create a new object named `name` in this directory.
    fn create(
        &self,
        name: &[u8],
        kind: ObjectType,
        attrs: &SetAttrs,
    ) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)>;

    /// Remove the name `name` from this directory.
    fn unlink(&self, name: &[u8]) -> StatusResult<()>;

    /// Rename `old_name` in this directory to `new_name` in `new_parent`
    /// (which may be this directory).
    fn rename(
        &self,
        old_name: &[u8],
        new_parent: &dyn ObjectHandle,
        new_name: &[u8],
    ) -> StatusResult<()>;

    /// Create a hard link to this object as `name` inside `new_parent`.
    fn link(&self, new_parent: &dyn ObjectHandle, name: &[u8]) -> StatusResult<()>;

    /// Create a symlink named `name` in this directory pointing at
    /// `target`.
    fn symlink(
        &self,
        name: &[u8],
        target: &[u8],
        attrs: &SetAttrs,
    ) -> StatusResult<(Box<dyn ObjectHandle>, Attributes)>;

    /// Read this symlink's target.
    fn readlink(&self) -> StatusResult<Bytes>;

    /// Create open state on this object.
    fn open(&self, flags: OpenFlags) -> StatusResult<()>;

    /// Read `len` bytes at `offset`.
    fn read(&self, offset: u64, len: usize) -> StatusResult<Bytes>;

    /// Write `data` at `offset`, returning the number of bytes accepted.
    fn write(&self, offset: u64, data: &[u8]) -> StatusResult<u64>;

    /// Flush previously unstable writes in `[offset, offset + len)`.
    fn commit(&self, offset: u64, len: u64) -> StatusResult<WriteVerifier>;

    /// Discard open state created by [`open`](ObjectHandle::open).
    fn close(&self) -> StatusResult<()>;

    /// Produce the wire digest for this object. Wire formats are entirely
    /// the backend's concern.
    fn handle_digest(&self) -> Bytes;
}

impl core::fmt::Debug for dyn ObjectHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectHandle").field("key", &self.key()).finish()
    }
}
