//! Error taxonomy shared by every file, archive and upload operation.
//!
//! Variants map one-to-one onto [`protocol::ErrorCode`]. `Internal` carries
//! the offending path and the underlying I/O error for logging, but its
//! `Display` is an opaque message so nothing about the host leaks to callers.

use std::io;
use std::path::{Path, PathBuf};

use protocol::messages::{ErrorCode, ErrorMessage};
use thiserror::Error;

/// Errors returned by the security layer and the file services.
#[derive(Debug, Error)]
pub enum FileError {
    /// No authenticated user accompanied the request.
    #[error("authentication required")]
    Unauthorized,

    /// Path outside the caller's roots, or role insufficient.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Destination exists or state does not allow the operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Path, session or entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The target volume is too full.
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Unexpected failure; details are kept for logs only.
    #[error("{message}")]
    Internal {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<io::Error>,
    },
}

/// Result alias for file operations.
pub type FileResult<T> = Result<T, FileError>;

impl FileError {
    /// Map an I/O error raised while touching `path`.
    ///
    /// `NotFound` and `AlreadyExists` become their own variants; everything
    /// else is internal.
    pub fn io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FileError::NotFound(path.display().to_string()),
            io::ErrorKind::AlreadyExists => {
                FileError::Conflict(format!("{} already exists", path.display()))
            }
            io::ErrorKind::StorageFull => {
                FileError::InsufficientStorage(format!("no space left writing {}", path.display()))
            }
            _ => FileError::Internal {
                message: "internal error".to_string(),
                path: Some(path.to_path_buf()),
                source: Some(err),
            },
        }
    }

    /// An internal error without an I/O cause.
    pub fn internal(message: impl Into<String>, path: Option<&Path>) -> Self {
        FileError::Internal {
            message: message.into(),
            path: path.map(Path::to_path_buf),
            source: None,
        }
    }

    /// Forbidden with the standard message for a path.
    pub fn forbidden(path: &Path) -> Self {
        FileError::Forbidden(format!("{} is outside your shares", path.display()))
    }

    /// Protocol error code for this variant.
    pub fn code(&self) -> ErrorCode {
        match self {
            FileError::Unauthorized => ErrorCode::Unauthorized,
            FileError::Forbidden(_) => ErrorCode::Forbidden,
            FileError::BadRequest(_) => ErrorCode::BadRequest,
            FileError::Conflict(_) => ErrorCode::Conflict,
            FileError::NotFound(_) => ErrorCode::NotFound,
            FileError::Cancelled => ErrorCode::Cancelled,
            FileError::InsufficientStorage(_) => ErrorCode::InsufficientStorage,
            FileError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FileError::Internal { .. }
                | FileError::Cancelled
                | FileError::Conflict(_)
                | FileError::InsufficientStorage(_)
        )
    }

    /// Path attached to an internal error, for logging.
    pub fn internal_path(&self) -> Option<&Path> {
        match self {
            FileError::Internal { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    /// Convert to the wire error message.
    pub fn to_error_message(&self, context: Option<String>) -> ErrorMessage {
        ErrorMessage {
            code: self.code(),
            message: self.to_string(),
            context,
            recoverable: self.is_recoverable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = FileError::io(
            io::Error::new(io::ErrorKind::NotFound, "gone"),
            Path::new("/srv/a"),
        );
        assert!(matches!(err, FileError::NotFound(_)));
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_io_already_exists_maps_to_conflict() {
        let err = FileError::io(
            io::Error::new(io::ErrorKind::AlreadyExists, "exists"),
            Path::new("/srv/a"),
        );
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_internal_display_is_opaque() {
        let err = FileError::io(
            io::Error::new(io::ErrorKind::PermissionDenied, "EACCES on /etc/shadow"),
            Path::new("/etc/shadow"),
        );
        assert_eq!(err.to_string(), "internal error");
        assert_eq!(err.internal_path(), Some(Path::new("/etc/shadow")));

        let msg = err.to_error_message(None);
        assert_eq!(msg.code, ErrorCode::InternalError);
        assert!(!msg.message.contains("shadow"));
        assert!(msg.recoverable);
    }

    #[test]
    fn test_forbidden_not_recoverable() {
        let err = FileError::forbidden(Path::new("/mnt/data/eng"));
        let msg = err.to_error_message(Some("/mnt/data/eng".to_string()));
        assert_eq!(msg.code, ErrorCode::Forbidden);
        assert!(!msg.recoverable);
        assert_eq!(msg.context.as_deref(), Some("/mnt/data/eng"));
    }

    #[test]
    fn test_storage_full_maps_to_insufficient_storage() {
        let err = FileError::io(
            io::Error::new(io::ErrorKind::StorageFull, "ENOSPC"),
            Path::new("/srv/a"),
        );
        assert_eq!(err.code(), ErrorCode::InsufficientStorage);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_cancelled_code() {
        assert_eq!(FileError::Cancelled.code(), ErrorCode::Cancelled);
        assert_eq!(FileError::Unauthorized.code(), ErrorCode::Unauthorized);
    }
}
