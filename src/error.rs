//! Crate-wide error taxonomy.
//!
//! Internal components return `Result<_, Error>`; POSIX error numbers are
//! only produced at the [`crate::engine::FilesystemEngine`] boundary, via
//! [`Error::to_errno`]. Nothing below that boundary should know about
//! `libc`.

/// Errors produced anywhere in the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path, or a component of a path, does not resolve to any inode.
    #[error("not found")]
    NotFound,

    /// The caller lacks the permission bits required for the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// `rmdir`/`unlink` was attempted on a directory that still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// `create`/`mkdir`/`symlink` targeted a `(parent_id, filename)` pair
    /// that is already occupied.
    #[error("already exists")]
    AlreadyExists,

    /// An advisory lock could not be acquired because another holder
    /// conflicts with the request.
    #[error("locked")]
    Locked,

    /// A lock acquisition waited past `lock_access_attempt_seconds` without
    /// resolving.
    #[error("would deadlock")]
    WouldDeadlock,

    /// `lock()` was called with an unrecognized `cmd`.
    #[error("bad file descriptor")]
    BadFileDescriptor,

    /// An extended attribute lookup or removal targeted a name that is not
    /// set on the inode.
    #[error("attribute not found")]
    NoAttribute,

    /// The configuration file failed validation. Fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The store could not be reached within `mongo_access_attempt_seconds`.
    /// The mount aborts after this is raised.
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),

    /// A store operation failed for a reason other than transport loss
    /// (e.g. a malformed document). Not retried.
    #[error("store error: {0}")]
    Store(#[from] mongodb::error::Error),

    /// An inode document failed to parse back out of BSON.
    #[error("corrupt document: {0}")]
    Corrupt(String),
}

impl Error {
    /// Translate into the POSIX error number the kernel bridge expects in
    /// a FUSE reply. See spec §7.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::PermissionDenied => libc::EACCES,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::AlreadyExists => libc::EEXIST,
            Error::Locked => libc::EAGAIN,
            Error::WouldDeadlock => libc::EAGAIN,
            Error::BadFileDescriptor => libc::EBADF,
            Error::NoAttribute => {
                #[cfg(target_os = "linux")]
                {
                    libc::ENODATA
                }
                #[cfg(not(target_os = "linux"))]
                {
                    libc::ENOATTR
                }
            }
            Error::InvalidConfig(_) => libc::EINVAL,
            Error::StoreUnreachable(_) => libc::EIO,
            Error::Store(_) => libc::EIO,
            Error::Corrupt(_) => libc::EIO,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Legacy variant of [`Error::to_errno`] where lock contention surfaces as
/// `EDEADLK` rather than `EAGAIN`. Selected by `Config::legacy_lock_errno`.
/// See spec §7: "locked / would-deadlock -> EAGAIN (or EDEADLK in legacy mode)".
pub fn to_errno_legacy(err: &Error) -> libc::c_int {
    match err {
        Error::Locked | Error::WouldDeadlock => libc::EDEADLK,
        other => other.to_errno(),
    }
}
