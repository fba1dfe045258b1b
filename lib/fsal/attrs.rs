//! Object identity and attribute model.

use std::fmt;
use std::time::SystemTime;

use bitflags::bitflags;
use bytes::Bytes;

/// Export-independent identity of a backend object.
///
/// Opaque bytes produced by the backend; equal keys mean the same
/// underlying object regardless of which export it was observed through.
/// Cheap to clone (`Bytes` is refcounted), hashable, and never
/// interpreted by the cache.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsKey(Bytes);

impl FsKey {
    /// Wrap raw backend identity bytes.
    #[must_use]
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    /// The raw identity bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for FsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FsKey(")?;
        for b in self.0.iter().take(16) {
            write!(f, "{b:02x}")?;
        }
        if self.0.len() > 16 {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// The type of a cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A named pipe.
    Fifo,
    /// A unix-domain socket.
    Socket,
    /// A block device node.
    Block,
    /// A character device node.
    Char,
}

bitflags! {
    /// Which fields of an [`Attributes`] carry valid data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrMask: u32 {
        /// `obj_type` is valid.
        const TYPE       = 1 << 0;
        /// `filesize` is valid.
        const SIZE       = 1 << 1;
        /// `mode` is valid.
        const MODE       = 1 << 2;
        /// `uid` is valid.
        const OWNER      = 1 << 3;
        /// `gid` is valid.
        const GROUP      = 1 << 4;
        /// `nlink` is valid.
        const NLINK      = 1 << 5;
        /// `fileid` is valid.
        const FILEID     = 1 << 6;
        /// `atime` is valid.
        const ATIME      = 1 << 7;
        /// `mtime` is valid.
        const MTIME      = 1 << 8;
        /// `ctime` is valid.
        const CTIME      = 1 << 9;
        /// `change` is valid.
        const CHANGE     = 1 << 10;
        /// `spaceused` is valid.
        const SPACEUSED  = 1 << 11;
        /// `rawdev` is valid.
        const RAWDEV     = 1 << 12;

        /// Every attribute the cache tracks.
        const ALL = Self::TYPE.bits()
            | Self::SIZE.bits()
            | Self::MODE.bits()
            | Self::OWNER.bits()
            | Self::GROUP.bits()
            | Self::NLINK.bits()
            | Self::FILEID.bits()
            | Self::ATIME.bits()
            | Self::MTIME.bits()
            | Self::CTIME.bits()
            | Self::CHANGE.bits()
            | Self::SPACEUSED.bits()
            | Self::RAWDEV.bits();
    }
}

/// A snapshot of an object's metadata as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    /// Which of the fields below are valid.
    pub valid: AttrMask,
    /// Object type.
    pub obj_type: ObjectType,
    /// Size in bytes (files and symlinks).
    pub filesize: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Hard-link count.
    pub nlink: u32,
    /// Backend file id (inode number equivalent).
    pub fileid: u64,
    /// Last access time.
    pub atime: SystemTime,
    /// Last data-modification time.
    pub mtime: SystemTime,
    /// Last attribute-change time.
    pub ctime: SystemTime,
    /// Monotonic change counter (NFSv4 `change` attribute).
    pub change: u64,
    /// Bytes of storage consumed.
    pub spaceused: u64,
    /// Device numbers for block/char nodes.
    pub rawdev: (u32, u32),
}

impl Attributes {
    /// A minimal attribute set for a freshly observed object of the given
    /// type. Everything except the type is marked invalid until the
    /// backend reports it.
    #[must_use]
    pub fn minimal(obj_type: ObjectType) -> Self {
        Self {
            valid: AttrMask::TYPE,
            obj_type,
            filesize: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 0,
            fileid: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            change: 0,
            spaceused: 0,
            rawdev: (0, 0),
        }
    }

    /// Whether this snapshot describes a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.obj_type == ObjectType::Directory
    }
}

/// Attributes a caller wants changed. `None` fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrs {
    /// Truncate/extend to this size.
    pub size: Option<u64>,
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// Explicit access time.
    pub atime: Option<SystemTime>,
    /// Explicit modification time.
    pub mtime: Option<SystemTime>,
}

impl SetAttrs {
    /// Whether no field is set at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
