//! # Sharegate Protocol Library
//!
//! Request and response types exchanged between the Sharegate daemon and
//! whatever transport fronts it.
//!
//! ## Overview
//!
//! - **Identity and shares**: [`User`], [`Role`] and [`Share`] describe who is
//!   asking and what storage is exposed.
//! - **Messages**: one [`Message`] enum with a request and a response variant
//!   per file, archive and upload operation.
//! - **Envelope**: [`Envelope`] carries the protocol version and a request id,
//!   and encodes to JSON or MessagePack.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Message};
//! use protocol::messages::PathRequest;
//!
//! let request = Message::GetFileInfo(PathRequest {
//!     path: "/srv/public/readme.txt".to_string(),
//! });
//! let envelope = Envelope::new(1, request);
//!
//! let bytes = envelope.to_msgpack().unwrap();
//! let decoded = Envelope::from_msgpack(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ArchiveFormat, Envelope, ErrorCode, ErrorMessage, FileEntry, FileEntryType, Message, Role,
    Share, UploadState, UploadStatus, User, PROTOCOL_VERSION,
};
