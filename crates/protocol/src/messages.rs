//! Request and response definitions for Sharegate.
//!
//! This module defines every message exchanged between the daemon and a
//! client front-end. Messages can be serialized as JSON (for HTTP style
//! transports) or MessagePack (for compact binary transports).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
///
/// The envelope carries the protocol version and a caller-chosen request id
/// so that responses can be correlated with requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Request identifier, echoed in the response envelope.
    pub request_id: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(request_id: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id,
            payload,
        }
    }

    /// Build the response envelope for this request.
    pub fn reply(&self, payload: Message) -> Self {
        Self::new(self.request_id, payload)
    }

    /// Serialize the envelope to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize an envelope from JSON bytes, rejecting unknown versions.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.check_version()?;
        Ok(envelope)
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes, rejecting unknown versions.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;
        envelope.check_version()?;
        Ok(envelope)
    }

    fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

/// Top-level message enum containing all request and response types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // File requests
    /// List a directory.
    Browse(BrowseRequest),
    /// Stat a single path.
    GetFileInfo(PathRequest),
    /// Create a directory.
    CreateDirectory(CreateDirectoryRequest),
    /// Delete one or more paths.
    Delete(DeleteRequest),
    /// Rename an entry within its directory.
    Rename(RenameRequest),
    /// Copy a file or directory tree.
    Copy(CopyMoveRequest),
    /// Move a file or directory tree.
    Move(CopyMoveRequest),
    /// Read ownership and mode bits.
    GetPermissions(PathRequest),
    /// Change mode bits and/or ownership.
    ChangePermissions(ChangePermissionsRequest),
    /// Sum the size of a directory tree.
    GetDiskUsage(PathRequest),

    // Archive requests
    /// Pack sources into an archive.
    CreateArchive(CreateArchiveRequest),
    /// Unpack an archive into a directory.
    ExtractArchive(ExtractArchiveRequest),

    // Upload requests
    /// Open a chunked upload session.
    StartUpload(StartUploadRequest),
    /// Send one chunk of an upload.
    UploadChunk(UploadChunkRequest),
    /// Commit a complete upload to its destination.
    FinalizeUpload(FinalizeUploadRequest),
    /// Abandon an upload.
    CancelUpload(UploadSessionRequest),
    /// Poll upload progress.
    GetUploadSession(UploadSessionRequest),
    /// Write a small file in one request.
    UploadFile(UploadFileRequest),

    // Responses
    /// Directory listing.
    BrowseResult(BrowseResponse),
    /// Single entry metadata.
    FileInfo(FileEntry),
    /// Operation completed on the given path.
    PathResult(PathResponse),
    /// Per-path delete outcomes.
    DeleteResult(DeleteResponse),
    /// Copy statistics.
    CopyResult(TransferSummary),
    /// Ownership and mode bits.
    Permissions(PermissionsInfo),
    /// Recursive usage totals.
    DiskUsage(DiskUsageInfo),
    /// Archive creation statistics.
    ArchiveResult(ArchiveSummary),
    /// Per-entry extraction outcomes.
    ExtractResult(ExtractSummary),
    /// Upload session progress.
    UploadStatus(UploadStatus),

    /// Error response.
    Error(ErrorMessage),
}

// ============================================================================
// Identity and shares
// ============================================================================

/// Role of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full administrative access.
    Admin,
    /// Regular account.
    #[default]
    User,
    /// Anonymous or guest account.
    Guest,
}

/// An authenticated user, as supplied by the request-handling layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user identifier.
    pub id: u64,
    /// Login name, matched against share `valid_users`.
    pub username: String,
    /// Role of the account.
    pub role: Role,
    /// Group memberships, matched against share `valid_groups`.
    #[serde(default)]
    pub groups: Vec<String>,
}

impl User {
    /// Create a user with the given role and no groups.
    pub fn new(id: u64, username: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            username: username.into(),
            role,
            groups: Vec::new(),
        }
    }

    /// Add group memberships.
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    /// Whether this user has the admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A named, path-rooted unit of exposed storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Share identifier.
    pub id: u64,
    /// Unique share name.
    pub name: String,
    /// Absolute root path of the share.
    pub path: PathBuf,
    /// Whether any authenticated user may access the share.
    #[serde(default)]
    pub guest_ok: bool,
    /// Users explicitly granted access.
    #[serde(default)]
    pub valid_users: Vec<String>,
    /// Groups explicitly granted access.
    #[serde(default)]
    pub valid_groups: Vec<String>,
    /// Whether the share rejects mutations for non-admins.
    #[serde(default)]
    pub read_only: bool,
    /// Disabled shares are invisible to non-admins.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Share {
    /// Create an enabled, writable share with no grants.
    pub fn new(id: u64, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            guest_ok: false,
            valid_users: Vec::new(),
            valid_groups: Vec::new(),
            read_only: false,
            enabled: true,
        }
    }
}

// ============================================================================
// File requests and responses
// ============================================================================

/// Request carrying a single absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    /// Absolute path.
    pub path: String,
}

/// Request to list a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BrowseRequest {
    /// Absolute path, or a path relative to `share` when it is set.
    pub path: String,
    /// Optional share name the path is relative to.
    #[serde(default)]
    pub share: Option<String>,
    /// Include dotfiles.
    #[serde(default)]
    pub show_hidden: bool,
}

/// Directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseResponse {
    /// Canonical path of the listed directory.
    pub path: String,
    /// Entries, directories first then files, each sorted case-insensitively.
    pub entries: Vec<FileEntry>,
    /// Sum of file sizes in this directory (not recursive).
    pub total_size: u64,
    /// Number of non-directory entries.
    pub total_files: usize,
    /// Number of directory entries.
    pub total_dirs: usize,
}

/// A single file or directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Full path of the entry.
    pub path: String,
    /// Entry type.
    pub entry_type: FileEntryType,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix permissions mode.
    pub mode: u32,
    /// Last modified timestamp (Unix epoch seconds).
    pub modified: u64,
    /// Whether the entry itself is a symbolic link.
    pub is_symlink: bool,
    /// Lowercased extension without the dot, if any.
    pub extension: Option<String>,
}

impl FileEntry {
    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.entry_type == FileEntryType::Directory
    }
}

/// Type of file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEntryType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Other (device, socket, etc.).
    Other,
}

/// Request to create a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDirectoryRequest {
    /// Existing parent directory.
    pub path: String,
    /// Name of the new directory.
    pub name: String,
    /// Octal mode such as `"0750"`; defaults to `0755`.
    #[serde(default)]
    pub mode: Option<String>,
}

/// Request to delete paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Paths to delete; each one is handled independently.
    pub paths: Vec<String>,
    /// Remove non-empty directories.
    #[serde(default)]
    pub recursive: bool,
}

/// Per-path delete outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// One result per requested path, in request order.
    pub results: Vec<PathOutcome>,
}

impl DeleteResponse {
    /// Number of paths that were removed.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_none()).count()
    }
}

/// Outcome for one path of a multi-path operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOutcome {
    /// The path as requested.
    pub path: String,
    /// `None` on success.
    pub error: Option<ErrorMessage>,
}

/// Request to rename an entry in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    /// Existing entry.
    pub old_path: String,
    /// New name within the same directory.
    pub new_name: String,
}

/// Request to copy or move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyMoveRequest {
    /// Existing source path.
    pub source: String,
    /// Full destination path, which must not exist.
    pub destination: String,
}

/// Operation completed on the given path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResponse {
    /// Resulting path.
    pub path: String,
}

/// Statistics of a recursive copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TransferSummary {
    /// Regular files copied.
    pub files: u64,
    /// Directories created.
    pub directories: u64,
    /// Bytes of file content copied.
    pub bytes: u64,
    /// Entries left out (unauthorized symlinks, special files).
    pub skipped: Vec<String>,
}

/// Request to change mode bits and/or ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChangePermissionsRequest {
    /// Target path.
    pub path: String,
    /// Octal mode such as `"0644"`.
    #[serde(default)]
    pub mode: Option<String>,
    /// User name or numeric uid.
    #[serde(default)]
    pub owner: Option<String>,
    /// Group name or numeric gid.
    #[serde(default)]
    pub group: Option<String>,
    /// Apply to the whole tree.
    #[serde(default)]
    pub recursive: bool,
}

/// Ownership and mode bits of a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionsInfo {
    /// Canonical path.
    pub path: String,
    /// Octal permission bits, e.g. `"0644"`.
    pub permissions: String,
    /// `ls`-style mode string, e.g. `"-rw-r--r--"`.
    pub mode: String,
    /// Owner name, or `uid:N` when unknown.
    pub owner: String,
    /// Group name, or `gid:N` when unknown.
    pub group: String,
    /// Numeric owner.
    pub uid: u32,
    /// Numeric group.
    pub gid: u32,
}

/// Recursive usage of a path plus filesystem capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsageInfo {
    /// Canonical path.
    pub path: String,
    /// Sum of file sizes below the path.
    pub used_bytes: u64,
    /// Number of non-directory entries visited.
    pub files: u64,
    /// Number of directories visited, including the path itself.
    pub directories: u64,
    /// Capacity of the containing filesystem.
    pub filesystem: Option<FilesystemStats>,
}

impl Eq for DiskUsageInfo {}

/// Capacity of a mounted filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemStats {
    /// Total size in bytes.
    pub total_bytes: u64,
    /// Free bytes (including reserved blocks).
    pub free_bytes: u64,
    /// Bytes available to unprivileged users.
    pub available_bytes: u64,
    /// Used percentage of the total size.
    pub usage_percent: f64,
}

// ============================================================================
// Archives
// ============================================================================

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// ZIP with deflate compression.
    #[serde(rename = "zip")]
    Zip,
    /// Uncompressed tarball.
    #[serde(rename = "tar")]
    Tar,
    /// Gzip-compressed tarball.
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from a file name extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zip => write!(f, "zip"),
            Self::Tar => write!(f, "tar"),
            Self::TarGz => write!(f, "tar.gz"),
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zip" => Ok(Self::Zip),
            "tar" => Ok(Self::Tar),
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            other => Err(ProtocolError::UnknownArchiveFormat(other.to_string())),
        }
    }
}

/// Request to create an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateArchiveRequest {
    /// Files and directories to pack, in archive order.
    pub sources: Vec<String>,
    /// Archive file to create; must not exist.
    pub destination: String,
    /// Archive format.
    pub format: ArchiveFormat,
}

/// Request to extract an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractArchiveRequest {
    /// Archive file; the format is detected from its extension.
    pub archive: String,
    /// Existing directory to extract into.
    pub destination: String,
}

/// Statistics of archive creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArchiveSummary {
    /// Canonical path of the archive written.
    pub path: String,
    /// Entries written (files and directories).
    pub entries: u64,
    /// Bytes of file content packed.
    pub bytes: u64,
    /// Entries left out because they were not authorized or not regular.
    pub skipped: Vec<String>,
}

/// Per-entry outcome of an extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExtractSummary {
    /// Entry names written to disk.
    pub extracted: Vec<String>,
    /// Entries refused, with the reason.
    pub rejected: Vec<RejectedEntry>,
}

/// An archive entry that was not extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEntry {
    /// Entry name as stored in the archive.
    pub name: String,
    /// Why it was refused.
    pub reason: String,
}

// ============================================================================
// Uploads
// ============================================================================

/// Request to open an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartUploadRequest {
    /// Name of the file being uploaded.
    pub file_name: String,
    /// Total size in bytes.
    pub total_size: u64,
}

/// One chunk of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkRequest {
    /// Session identifier.
    pub session_id: String,
    /// Zero-based chunk index.
    pub chunk_index: u32,
    /// Chunk body.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Request to commit an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeUploadRequest {
    /// Session identifier.
    pub session_id: String,
    /// Absolute destination file path.
    pub destination: String,
    /// Optional expected SHA-256 of the whole file, hex encoded.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Single-request upload of a whole file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFileRequest {
    /// Existing directory to write into.
    pub directory: String,
    /// Name of the new file.
    pub file_name: String,
    /// File body.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Request naming an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionRequest {
    /// Session identifier.
    pub session_id: String,
}

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// Created, no chunk received yet.
    Pending,
    /// At least one chunk received.
    Receiving,
    /// Finalize in progress.
    Finalizing,
    /// Committed to its destination.
    Completed,
    /// Cancelled by the client or by a failed finalize.
    Cancelled,
    /// Reaped after the session TTL.
    Expired,
}

impl UploadState {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Receiving => "receiving",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Progress snapshot of an upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    /// Session identifier.
    pub session_id: String,
    /// Current state.
    pub state: UploadState,
    /// Size of each chunk except possibly the last.
    pub chunk_size: u64,
    /// Number of chunks expected.
    pub total_chunks: u32,
    /// Number of distinct chunks received.
    pub received_chunks: u32,
    /// Bytes received so far.
    pub received_bytes: u64,
    /// Total bytes expected.
    pub total_size: u64,
}

// ============================================================================
// Errors
// ============================================================================

/// Error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Optional context (e.g., session_id, requested path).
    pub context: Option<String>,
    /// Whether retrying the request may succeed.
    pub recoverable: bool,
}

/// Error codes for the failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No valid authenticated user.
    Unauthorized,
    /// Path outside permitted roots, or role insufficient.
    Forbidden,
    /// Malformed request.
    BadRequest,
    /// Destination exists, or the session is already terminal.
    Conflict,
    /// Path, session or entry does not exist.
    NotFound,
    /// Unexpected failure not attributable to the caller.
    InternalError,
    /// The request was cancelled before completing.
    Cancelled,
    /// Not enough free space on the target volume.
    InsufficientStorage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_envelope(msg: Message) {
        let envelope = Envelope::new(42, msg);

        let bytes = envelope.to_msgpack().expect("msgpack serialization failed");
        let decoded = Envelope::from_msgpack(&bytes).expect("msgpack deserialization failed");
        assert_eq!(envelope, decoded);

        let json = envelope.to_json().expect("json serialization failed");
        let decoded = Envelope::from_json(&json).expect("json deserialization failed");
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn test_envelope_version() {
        let envelope = Envelope::new(1, Message::GetFileInfo(PathRequest {
            path: "/srv/public".to_string(),
        }));
        assert_eq!(envelope.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_reply_keeps_request_id() {
        let request = Envelope::new(77, Message::CancelUpload(UploadSessionRequest {
            session_id: "abc".to_string(),
        }));
        let reply = request.reply(Message::PathResult(PathResponse {
            path: "/srv".to_string(),
        }));
        assert_eq!(reply.request_id, 77);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = Envelope::new(1, Message::GetDiskUsage(PathRequest {
            path: "/srv".to_string(),
        }));
        envelope.version = PROTOCOL_VERSION + 1;
        let json = serde_json::to_vec(&envelope).unwrap();

        let result = Envelope::from_json(&json);
        assert!(matches!(result, Err(ProtocolError::VersionMismatch { .. })));
    }

    #[test]
    fn test_json_tagging() {
        let msg = Message::Browse(BrowseRequest {
            path: "docs".to_string(),
            share: Some("public".to_string()),
            show_hidden: false,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "Browse");
        assert_eq!(value["data"]["share"], "public");
    }

    #[test]
    fn test_upload_chunk_roundtrip() {
        roundtrip_envelope(Message::UploadChunk(UploadChunkRequest {
            session_id: "0f3a".to_string(),
            chunk_index: 3,
            data: vec![0, 1, 2, 255],
        }));
    }

    #[test]
    fn test_upload_file_roundtrip() {
        roundtrip_envelope(Message::UploadFile(UploadFileRequest {
            directory: "public/docs".to_string(),
            file_name: "notes.txt".to_string(),
            data: b"hello".to_vec(),
        }));
    }

    #[test]
    fn test_delete_result_roundtrip() {
        roundtrip_envelope(Message::DeleteResult(DeleteResponse {
            results: vec![
                PathOutcome {
                    path: "/srv/public/a.txt".to_string(),
                    error: None,
                },
                PathOutcome {
                    path: "/srv/eng/b.txt".to_string(),
                    error: Some(ErrorMessage {
                        code: ErrorCode::Forbidden,
                        message: "access denied".to_string(),
                        context: None,
                        recoverable: false,
                    }),
                },
            ],
        }));
    }

    #[test]
    fn test_delete_response_succeeded() {
        let response = DeleteResponse {
            results: vec![
                PathOutcome {
                    path: "a".to_string(),
                    error: None,
                },
                PathOutcome {
                    path: "b".to_string(),
                    error: Some(ErrorMessage {
                        code: ErrorCode::NotFound,
                        message: "gone".to_string(),
                        context: None,
                        recoverable: false,
                    }),
                },
            ],
        };
        assert_eq!(response.succeeded(), 1);
    }

    #[test]
    fn test_share_defaults_from_json() {
        let share: Share =
            serde_json::from_str(r#"{"id": 1, "name": "public", "path": "/srv/public"}"#).unwrap();
        assert!(share.enabled);
        assert!(!share.guest_ok);
        assert!(!share.read_only);
        assert!(share.valid_users.is_empty());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        let role: Role = serde_json::from_str("\"guest\"").unwrap();
        assert_eq!(role, Role::Guest);
    }

    #[test]
    fn test_archive_format_parsing() {
        assert_eq!("zip".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zip);
        assert_eq!("TGZ".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert_eq!("tar.gz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert!("rar".parse::<ArchiveFormat>().is_err());

        let format: ArchiveFormat = serde_json::from_str("\"tgz\"").unwrap();
        assert_eq!(format, ArchiveFormat::TarGz);
        assert_eq!(serde_json::to_string(&ArchiveFormat::TarGz).unwrap(), "\"tar.gz\"");
    }

    #[test]
    fn test_archive_format_from_file_name() {
        assert_eq!(ArchiveFormat::from_file_name("a.ZIP"), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::from_file_name("a.tar"), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::from_file_name("a.tar.gz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("a.tgz"), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::from_file_name("a.gz"), None);
    }

    #[test]
    fn test_upload_state_terminal() {
        assert!(!UploadState::Pending.is_terminal());
        assert!(!UploadState::Receiving.is_terminal());
        assert!(!UploadState::Finalizing.is_terminal());
        assert!(UploadState::Completed.is_terminal());
        assert!(UploadState::Cancelled.is_terminal());
        assert!(UploadState::Expired.is_terminal());
        assert_eq!(
            serde_json::to_string(&UploadState::Receiving).unwrap(),
            "\"receiving\""
        );
    }
}
