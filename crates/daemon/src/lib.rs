//! # Sharegate Daemon Library
//!
//! Share-scoped file access for a multi-user file sharing service.
//!
//! ## Overview
//!
//! Every request carries an authenticated [`protocol::User`]. The router
//! resolves a [`SecurityContext`] from that user and the current share list,
//! and every file, archive and upload operation checks its paths against the
//! context before touching the filesystem.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Gateway                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                    Request Router                      │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │ File Service │  │   Archive    │  │  Upload Sessions   │  │
//! │  │              │  │   Engine     │  │  (+ reaper task)   │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │     Security Context + Path Authorizer (per request)   │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                   Share Registry                       │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Gateway};
//! use protocol::messages::PathRequest;
//! use protocol::{Message, Role, User};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gateway = Gateway::new(Config::load_default()?)?;
//!     gateway.start().await?;
//!
//!     let user = User::new(1, "alice", Role::User);
//!     let request = Message::GetDiskUsage(PathRequest { path: "/srv/eng".into() });
//!     let response = gateway
//!         .router()
//!         .route(Some(&user), request, &CancellationToken::new())
//!         .await;
//!     println!("{response:?}");
//!
//!     gateway.stop().await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`error`]: Error taxonomy shared by all operations
//! - [`shares`]: Share registry
//! - [`security`]: Security context resolution and path authorization
//! - [`files`]: File service, archive engine and upload sessions
//! - [`router`]: Message routing to the services
//! - [`orchestrator`]: Composition root

pub mod config;
pub mod error;
pub mod files;
pub mod orchestrator;
pub mod router;
pub mod security;
pub mod shares;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use error::{FileError, FileResult};
pub use files::{ArchiveEngine, FileService, PermissionChange, UploadSessionManager};
pub use orchestrator::{Gateway, GatewayState};
pub use router::RequestRouter;
pub use security::{Access, AllowedRoot, PathAuthorizer, SecurityContext};
pub use shares::{JsonShareRegistry, MemoryShareRegistry, ShareRegistry};
