//! Status codes shared by every cache and backend operation.

use thiserror::Error;

/// Result alias used across the backend contract and the cache facade.
pub type StatusResult<T> = Result<T, Status>;

/// The status sum every operation returns on failure.
///
/// Transient backend errors are never retried by the cache; retries are the
/// protocol engine's job. Internal invariant violations (refcount
/// underflow, lock-order breach) are not representable here: they abort
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    /// The entry or handle no longer refers to a live backend object.
    #[error("stale object handle")]
    Stale,
    /// Authoritative lookup miss.
    #[error("no such name")]
    NoEnt,
    /// The name already exists.
    #[error("name already exists")]
    Exists,
    /// A directory operation was applied to a non-directory.
    #[error("not a directory")]
    NotDir,
    /// A non-directory operation was applied to a directory.
    #[error("is a directory")]
    IsDir,
    /// Directory removal attempted on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,
    /// The operation raced with a concurrent update and lost after one
    /// internal retry.
    #[error("conflicting concurrent update")]
    Conflict,
    /// A readdir cookie/verifier pair no longer matches the directory's
    /// enumeration epoch; the client must restart from cookie 0.
    #[error("directory cookie verifier mismatch")]
    BadCookie,
    /// Issued once teardown has begun; non-retryable.
    #[error("server is shutting down")]
    Shutdown,
    /// Transient resource shortage; the caller may retry later.
    #[error("resource temporarily unavailable")]
    Delay,
    /// Pass-through of a sub-backend status code the cache does not
    /// interpret.
    #[error("backend error {0}")]
    Backend(u32),
}

impl Status {
    /// Whether the failure indicates the referenced object is gone for
    /// good (as opposed to a transient or name-level failure).
    #[must_use]
    pub fn is_fatal_to_object(self) -> bool {
        matches!(self, Status::Stale)
    }
}
