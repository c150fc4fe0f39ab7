//! JSON-file share registry.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use protocol::Share;
use serde::{Deserialize, Serialize};

use super::ShareRegistry;

/// On-disk layout of the registry file.
#[derive(Debug, Serialize, Deserialize)]
struct ShareStoreData {
    version: u32,
    shares: Vec<Share>,
}

impl Default for ShareStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            shares: Vec::new(),
        }
    }
}

/// Identity of the registry file as last loaded or saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    inode: u64,
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            inode: metadata.ino(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Thread-safe share registry persisted as pretty JSON.
///
/// Shares are keyed by name. Writes go to a temp file first and are renamed
/// into place, so another process editing the file always replaces it
/// whole. [`list_shares`](ShareRegistry::list_shares) reloads the file when
/// it changed since this registry last loaded or saved it.
pub struct JsonShareRegistry {
    path: PathBuf,
    shares: RwLock<BTreeMap<String, Share>>,
    stamp: Mutex<Option<FileStamp>>,
}

impl JsonShareRegistry {
    /// Create an empty registry backed by `path`. Call [`load`](Self::load) to read it.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            shares: RwLock::new(BTreeMap::new()),
            stamp: Mutex::new(None),
        }
    }

    /// Create a registry and load it from `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let registry = Self::new(path);
        registry.load()?;
        Ok(registry)
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load shares from the file. A missing file means no shares.
    pub fn load(&self) -> Result<()> {
        // Taken before reading so a write racing the read is seen next time.
        let stamp = FileStamp::of(&self.path);
        if stamp.is_none() {
            tracing::debug!("Share registry not found at {:?}, starting empty", self.path);
            self.shares
                .write()
                .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on share registry"))?
                .clear();
            self.set_stamp(None)?;
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read share registry: {}", self.path.display()))?;

        let data: ShareStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse share registry: {}", self.path.display()))?;

        let mut shares = self
            .shares
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on share registry"))?;

        shares.clear();
        for share in data.shares {
            shares.insert(share.name.clone(), share);
        }

        tracing::info!(count = shares.len(), path = %self.path.display(), "Loaded share registry");
        drop(shares);
        self.set_stamp(stamp)?;
        Ok(())
    }

    /// Reload the file if it changed on disk. Returns whether it reloaded.
    pub fn refresh(&self) -> Result<bool> {
        let current = FileStamp::of(&self.path);
        let known = *self
            .stamp
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire share registry stamp"))?;
        if current == known {
            return Ok(false);
        }
        tracing::debug!(path = %self.path.display(), "Share registry changed on disk, reloading");
        self.load()?;
        Ok(true)
    }

    fn set_stamp(&self, stamp: Option<FileStamp>) -> Result<()> {
        *self
            .stamp
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to acquire share registry stamp"))? = stamp;
        Ok(())
    }

    /// Save shares to the file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }

        let shares = self
            .shares
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on share registry"))?;

        let data = ShareStoreData {
            version: 1,
            shares: shares.values().cloned().collect(),
        };

        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize share registry")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp registry file: {}", temp_path.display())
        })?;

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp registry file {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!(count = shares.len(), path = %self.path.display(), "Saved share registry");
        self.set_stamp(FileStamp::of(&self.path))?;
        Ok(())
    }

    /// Insert or replace a share by name.
    ///
    /// A share with id 0 gets the next free id; replacing keeps the old id.
    pub fn upsert(&self, mut share: Share) -> Result<Share> {
        let name = share.name.trim().to_string();
        if name.is_empty() {
            bail!("share name must not be empty");
        }
        if !share.path.is_absolute() {
            bail!("share path must be absolute: {}", share.path.display());
        }
        share.name = name;
        share.valid_users = normalize_names(share.valid_users);
        share.valid_groups = normalize_names(share.valid_groups);

        let mut shares = self
            .shares
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on share registry"))?;

        if let Some(existing) = shares.get(&share.name) {
            share.id = existing.id;
        } else if share.id == 0 {
            share.id = shares.values().map(|s| s.id).max().unwrap_or(0) + 1;
        }

        tracing::info!(share = %share.name, path = %share.path.display(), "Upserting share");
        shares.insert(share.name.clone(), share.clone());
        Ok(share)
    }

    /// Remove a share by name.
    pub fn remove(&self, name: &str) -> Result<Option<Share>> {
        let mut shares = self
            .shares
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on share registry"))?;
        Ok(shares.remove(name))
    }

    /// Look up a share by name.
    pub fn get(&self, name: &str) -> Result<Option<Share>> {
        let shares = self
            .shares
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on share registry"))?;
        Ok(shares.get(name).cloned())
    }
}

impl ShareRegistry for JsonShareRegistry {
    fn list_shares(&self) -> Result<Vec<Share>> {
        self.refresh()?;
        let shares = self
            .shares
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on share registry"))?;
        Ok(shares.values().cloned().collect())
    }
}

fn normalize_names(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = names
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
