//! The backend contract.
//!
//! A backend ("sub-FSAL") is a concrete file-system implementation the
//! cache stacks above: a local POSIX tree, an object-store gateway, an
//! in-memory mock. The contract is two capability records, [`Export`]
//! for export-level queries and [`ObjectHandle`] for per-object
//! operations, plus the [`UpcallOps`] vector the backend invokes to
//! notify the cache of out-of-band changes.
//!
//! The cache implements the same two traits on its own types
//! ([`crate::MdcExport`] and its handles), so stacking is plain
//! composition: a cache export owns an `Arc<dyn Export>` pointing at the
//! backend underneath it, and the protocol engine cannot tell the two
//! layers apart.

mod attrs;
mod export;
mod handle;
mod status;
mod upcall;

pub use attrs::{AttrMask, Attributes, FsKey, ObjectType, SetAttrs};
pub use export::{
    AclSupport, DynamicFsInfo, Export, FsOption, LayoutType, Quota, QuotaType, StateHandle,
    StateKind,
};
pub use handle::{DirentInfo, ObjectHandle, OpenFlags, ReaddirCb, WriteVerifier};
pub use status::{Status, StatusResult};
pub use upcall::{DelegationKind, InvalidateKind, UpcallOps};
