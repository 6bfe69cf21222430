//! Error types for the filesystem boundary.
//!
//! Every handler in [`crate::fs`] returns [`FsError`]; the transport turns it
//! into an errno with [`FsError::errno`]. Compile failures are deliberately
//! absent here: they never cross the boundary and are rendered into content
//! instead (see [`crate::render`]).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to the filesystem caller.
#[derive(Debug, Error)]
pub enum FsError {
    /// The real file backing a path does not exist.
    #[error("no such file: {0}")]
    NotFound(String),

    /// Mutating operation on a read-only mount.
    #[error("operation not permitted: {op} {path}")]
    PermissionDenied {
        /// Handler name (`write`, `unlink`, ...).
        op: &'static str,
        /// Path the operation was issued against.
        path: String,
    },

    /// Operation is recognized but not supported (`chown`).
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// Directory operation on a non-directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// File operation on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Unknown or already released file handle.
    #[error("bad file handle {0}")]
    BadHandle(u64),

    /// Underlying I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Real path involved.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: io::Error,
    },

    /// Change-notification setup failed.
    #[error("watch error: {0}")]
    Watch(#[from] WatchError),

    /// Mount or unmount failed.
    #[error("mount failed: {0}")]
    Mount(String),
}

impl FsError {
    /// Build an I/O error, mapping `ENOENT` to [`FsError::NotFound`].
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if source.kind() == io::ErrorKind::NotFound {
            return Self::NotFound(path.display().to_string());
        }
        Self::Io { path, source }
    }

    /// Shorthand for a denied mutating operation.
    pub fn denied(op: &'static str, path: impl Into<String>) -> Self {
        Self::PermissionDenied {
            op,
            path: path.into(),
        }
    }

    /// Positive platform errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied { .. } => libc::EPERM,
            Self::NotImplemented(_) => libc::ENOSYS,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::BadHandle(_) => libc::EBADF,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Self::Watch(_) | Self::Mount(_) => libc::EIO,
        }
    }

    /// Whether this error means the backing file is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Change-notification and watch-pattern errors.
#[derive(Debug, Error)]
pub enum WatchError {
    /// A configured glob pattern does not parse.
    #[error("invalid watch pattern {pattern:?}: {source}")]
    Pattern {
        /// The offending pattern (after normalization).
        pattern: String,
        /// Parser error.
        #[source]
        source: glob::PatternError,
    },

    /// The platform watcher rejected a path.
    #[error("cannot watch {path}: {source}")]
    Notify {
        /// Real path that failed to register.
        path: PathBuf,
        /// Watcher error.
        #[source]
        source: notify::Error,
    },

    /// The platform watcher could not be created at all.
    #[error("watcher unavailable: {0}")]
    Unavailable(#[source] notify::Error),
}
