//! Share-scoped access control.
//!
//! A [`SecurityContext`] is resolved per request from the authenticated user
//! and the current share list. A [`PathAuthorizer`] built on it validates every
//! path before the filesystem is touched.

mod authorizer;
mod context;

pub use authorizer::{normalize_lexically, Access, PathAuthorizer};
pub use context::{AllowedRoot, SecurityContext};
