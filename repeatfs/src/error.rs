//! Unified error taxonomy for the VDF overlay and its provenance engine.

use std::io;

/// The error taxonomy described in the design: every fallible operation in
/// the crate funnels into one of these variants so the `Filesystem` glue can
/// map them to a single POSIX errno at the syscall boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No such file, descriptor, cache entry, or provenance row.
    #[error("not found: {0}")]
    NotFound(String),

    /// An owner-write violation, or an attempt to modify a VDF structurally.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Expected a directory, found something else (or vice versa).
    #[error("not a directory: {0}")]
    NotDir(String),

    /// Malformed derived path, readlink on a VDF, or similar structural nonsense.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Wrapped OS error on the real backing store or disk overflow.
    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    /// Internal signal: the cache entry was reset and the caller must re-enter.
    #[error("cache entry reset, retry")]
    CacheReset,

    /// The backing command exited non-zero before producing any bytes.
    #[error("process failed: {0}")]
    ProcessFailed(String),

    /// Malformed or unknown control-endpoint JSON request.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A non-fatal mismatch discovered during replay verification.
    #[error("replay warning: {0}")]
    ReplayWarning(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::IoError(io::Error::other(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ProtocolError(err.to_string())
    }
}

impl Error {
    /// Map the taxonomy to a raw POSIX errno, the way the `Filesystem` glue
    /// must at every FUSE reply boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EPERM,
            Error::NotDir(_) => libc::ENOTDIR,
            Error::Invalid(_) => libc::EINVAL,
            Error::IoError(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::CacheReset => libc::EAGAIN,
            Error::ProcessFailed(_) => libc::EIO,
            Error::ProtocolError(_) => libc::EIO,
            Error::ReplayWarning(_) => libc::EIO,
        }
    }
}

impl From<&Error> for fuser::Errno {
    fn from(err: &Error) -> Self {
        fuser::Errno::from_i32(err.to_errno())
    }
}

impl From<Error> for fuser::Errno {
    fn from(err: Error) -> Self {
        fuser::Errno::from(&err)
    }
}
