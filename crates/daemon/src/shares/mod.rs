//! Share definitions consumed by the security layer.
//!
//! The core only ever reads shares through [`ShareRegistry::list_shares`].
//! [`JsonShareRegistry`] persists them to a JSON file for the CLI and the
//! gateway; [`MemoryShareRegistry`] backs tests and embedders that manage
//! shares themselves.

mod store;

use std::sync::RwLock;

use anyhow::Result;
use protocol::Share;

pub use store::JsonShareRegistry;

/// Source of the current share list.
pub trait ShareRegistry: Send + Sync {
    /// Snapshot of all shares, enabled or not.
    fn list_shares(&self) -> Result<Vec<Share>>;
}

/// Share registry held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryShareRegistry {
    shares: RwLock<Vec<Share>>,
}

impl MemoryShareRegistry {
    /// Create a registry holding `shares`.
    pub fn new(shares: Vec<Share>) -> Self {
        Self {
            shares: RwLock::new(shares),
        }
    }

    /// Replace the share list.
    pub fn replace(&self, shares: Vec<Share>) -> Result<()> {
        let mut guard = self
            .shares
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on share registry"))?;
        *guard = shares;
        Ok(())
    }
}

impl ShareRegistry for MemoryShareRegistry {
    fn list_shares(&self) -> Result<Vec<Share>> {
        let guard = self
            .shares
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on share registry"))?;
        Ok(guard.clone())
    }
}
