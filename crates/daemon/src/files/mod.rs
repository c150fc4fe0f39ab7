//! File, archive and upload operations scoped to the caller's shares.
//!
//! # Security
//!
//! Nothing in this module touches the filesystem before the path has passed
//! through [`crate::security::PathAuthorizer`]. Uploads are the exception that
//! proves it: chunks land in a private quarantine directory and the real
//! destination is authorized only at finalize.

pub mod archive;
pub mod names;
pub mod service;
pub mod upload;

pub use archive::ArchiveEngine;
pub use names::{parse_mode, validate_file_name};
pub use service::{FileService, PermissionChange, DEFAULT_DIR_MODE};
pub use upload::{hash_file, UploadSessionManager, DEFAULT_UPLOAD_MODE};
