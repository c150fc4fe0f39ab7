//! Path canonicalization and containment checks.
//!
//! Every path a file, archive or upload operation touches goes through one
//! of the three entry points here before the filesystem is modified:
//!
//! - [`PathAuthorizer::authorize`] for paths that must already exist,
//! - [`PathAuthorizer::authorize_for_creation`] for paths about to be created,
//! - [`PathAuthorizer::authorize_entry`] for operations on a directory entry
//!   itself (delete, rename, move source), where a symlink must be acted on as
//!   a link rather than through its target.
//!
//! Containment is decided on canonical paths with component-wise
//! `Path::starts_with`, never on string prefixes.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::SecurityContext;
use crate::error::{FileError, FileResult};

/// What the caller intends to do with a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read or list.
    Read,
    /// Create, modify or delete.
    Write,
}

/// Validates candidate paths against a [`SecurityContext`].
#[derive(Debug, Clone, Copy)]
pub struct PathAuthorizer<'a> {
    ctx: &'a SecurityContext,
}

impl<'a> PathAuthorizer<'a> {
    /// Create an authorizer for one request.
    pub fn new(ctx: &'a SecurityContext) -> Self {
        Self { ctx }
    }

    /// The context this authorizer checks against.
    pub fn context(&self) -> &'a SecurityContext {
        self.ctx
    }

    /// Turn a client-supplied path into an absolute path.
    ///
    /// With a share the path is joined onto that share's root (a leading `/`
    /// is ignored). Without one the path is either absolute or starts with
    /// the name of a share the caller can see, as in `public/docs`. The result
    /// is not yet authorized.
    pub fn resolve_request_path(&self, requested: &str, share: Option<&str>) -> FileResult<PathBuf> {
        if requested.contains('\0') {
            return Err(FileError::BadRequest("path contains a NUL byte".to_string()));
        }

        match share {
            Some(name) => {
                let root = self.ctx.root_for_share(name).ok_or_else(|| {
                    FileError::Forbidden(format!("share {name} is not available"))
                })?;
                let relative = requested.trim_start_matches('/');
                if relative.is_empty() {
                    Ok(root.path.clone())
                } else {
                    Ok(root.path.join(relative))
                }
            }
            None => {
                if requested.is_empty() {
                    return Err(FileError::BadRequest("path is required".to_string()));
                }
                let path = PathBuf::from(requested);
                if path.is_absolute() {
                    return Ok(path);
                }

                let mut components = path.components();
                let root = match components.next() {
                    Some(Component::Normal(first)) => {
                        first.to_str().and_then(|name| self.ctx.root_for_share(name))
                    }
                    _ => None,
                };
                match root {
                    Some(root) if components.as_path().as_os_str().is_empty() => {
                        Ok(root.path.clone())
                    }
                    Some(root) => Ok(root.path.join(components.as_path())),
                    None => Err(FileError::BadRequest(format!(
                        "path must be absolute or start with a share name: {requested}"
                    ))),
                }
            }
        }
    }

    /// Authorize an existing path and return its canonical form.
    ///
    /// Symlinks are resolved, so a link inside a share that points outside
    /// every share is rejected.
    pub fn authorize(&self, path: &Path, access: Access) -> FileResult<PathBuf> {
        check_absolute(path)?;

        let canonical = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(err) => return Err(self.canonicalize_failure(err, path)),
        };

        self.check_canonical(&canonical, path, access)?;
        Ok(canonical)
    }

    /// Authorize a path that may not exist yet.
    ///
    /// The deepest existing ancestor is canonicalized and the remaining
    /// components appended. The final component must be a plain name.
    pub fn authorize_for_creation(&self, path: &Path) -> FileResult<PathBuf> {
        check_absolute(path)?;
        let name = plain_file_name(path)?;
        let parent = path
            .parent()
            .ok_or_else(|| FileError::BadRequest("path has no parent".to_string()))?;

        let mut existing = parent;
        let mut missing: Vec<&OsStr> = Vec::new();
        let canonical_parent = loop {
            match fs::canonicalize(existing) {
                Ok(p) => break p,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    match existing.components().next_back() {
                        Some(Component::Normal(part)) => missing.push(part),
                        Some(Component::CurDir) => {}
                        _ => {
                            return Err(FileError::BadRequest(format!(
                                "cannot resolve {}",
                                path.display()
                            )))
                        }
                    }
                    existing = existing.parent().ok_or_else(|| FileError::forbidden(path))?;
                }
                Err(err) => return Err(self.canonicalize_failure(err, path)),
            }
        };

        let mut target = canonical_parent;
        for part in missing.iter().rev() {
            target.push(part);
        }
        target.push(name);

        self.check_canonical(&target, path, Access::Write)?;
        Ok(target)
    }

    /// Authorize an operation on the directory entry at `path` itself.
    ///
    /// Returns `canonical(parent)/name`, so a symlink entry is addressed as the
    /// link. A link whose target resolves outside every share is still
    /// rejected. With [`Access::Write`], non-admins may not touch a share root.
    pub fn authorize_entry(&self, path: &Path, access: Access) -> FileResult<PathBuf> {
        check_absolute(path)?;
        let name = plain_file_name(path)?;
        let parent = path.parent().ok_or_else(|| FileError::forbidden(path))?;

        let canonical_parent = self.authorize(parent, Access::Read)?;
        let entry = canonical_parent.join(name);

        let metadata = fs::symlink_metadata(&entry).map_err(|e| FileError::io(e, path))?;
        if metadata.file_type().is_symlink() {
            match fs::canonicalize(&entry) {
                Ok(target) => self.check_canonical(&target, path, Access::Read)?,
                // Dangling links can only be removed or renamed.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(FileError::io(err, path)),
            }
        }

        self.check_canonical(&entry, path, access)?;

        if access == Access::Write && !self.ctx.is_admin() {
            if self.ctx.is_root(&entry) {
                return Err(FileError::Forbidden(format!(
                    "{} is a share root",
                    path.display()
                )));
            }
            // Removing or moving the entry would take a nested share with it.
            if let Some(root) = self.ctx.roots_below(&entry).next() {
                return Err(FileError::Forbidden(format!(
                    "{} contains share {}",
                    path.display(),
                    root.share
                )));
            }
        }

        Ok(entry)
    }

    /// Refuse a recursive change below `canonical` that would reach into a
    /// nested read-only share.
    pub fn check_subtree_writable(&self, canonical: &Path, requested: &Path) -> FileResult<()> {
        if self.ctx.is_admin() {
            return Ok(());
        }
        let nested = self.ctx.roots_below(canonical).find(|r| {
            self.ctx
                .matching_root(&r.path)
                .is_some_and(|effective| effective.read_only)
        });
        match nested {
            Some(root) => Err(FileError::Forbidden(format!(
                "{} contains read-only share {}",
                requested.display(),
                root.share
            ))),
            None => Ok(()),
        }
    }

    /// Check an already canonical path.
    ///
    /// `requested` is only used for error messages so canonical targets of
    /// symlinks are never echoed back.
    pub fn check_canonical(
        &self,
        canonical: &Path,
        requested: &Path,
        access: Access,
    ) -> FileResult<()> {
        if self.ctx.is_admin() {
            return Ok(());
        }

        let root = self
            .ctx
            .matching_root(canonical)
            .ok_or_else(|| FileError::forbidden(requested))?;

        if access == Access::Write && root.read_only {
            return Err(FileError::Forbidden(format!(
                "share {} is read-only",
                root.share
            )));
        }
        Ok(())
    }

    /// Whether `canonical` may be read, without building an error.
    pub fn can_read(&self, canonical: &Path) -> bool {
        self.check_canonical(canonical, canonical, Access::Read).is_ok()
    }

    fn canonicalize_failure(&self, err: io::Error, path: &Path) -> FileError {
        // Existence is only disclosed inside the caller's shares.
        if self.ctx.is_admin() || self.ctx.matching_root(&normalize_lexically(path)).is_some() {
            FileError::io(err, path)
        } else {
            FileError::forbidden(path)
        }
    }
}

fn check_absolute(path: &Path) -> FileResult<()> {
    if !path.is_absolute() {
        return Err(FileError::BadRequest(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }
    if path.as_os_str().as_encoded_bytes().contains(&0) {
        return Err(FileError::BadRequest("path contains a NUL byte".to_string()));
    }
    Ok(())
}

fn plain_file_name(path: &Path) -> FileResult<&OsStr> {
    match path.components().next_back() {
        Some(Component::Normal(name)) => Ok(name),
        _ => Err(FileError::BadRequest(format!(
            "{} does not name an entry",
            path.display()
        ))),
    }
}

/// Resolve `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
