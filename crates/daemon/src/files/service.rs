//! Share-scoped file operations.
//!
//! Every operation takes the caller's [`SecurityContext`] and authorizes each
//! path it touches before doing any I/O. Operations are synchronous; the
//! router runs them on the blocking pool.

use std::cmp::Ordering;
use std::fs::{self, DirBuilder, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{symlink, DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::sys::statvfs::statvfs;
use nix::unistd::{self, Gid, Group, Uid, User};
use protocol::messages::{
    BrowseResponse, DiskUsageInfo, FileEntry, FileEntryType, FilesystemStats, PermissionsInfo,
    TransferSummary,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::names::{parse_mode, validate_file_name};
use crate::error::{FileError, FileResult};
use crate::security::{Access, PathAuthorizer, SecurityContext};

/// Mode for directories created without an explicit mode.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Requested permission change.
#[derive(Debug, Clone, Default)]
pub struct PermissionChange {
    /// Octal mode string.
    pub mode: Option<String>,
    /// User name or numeric uid.
    pub owner: Option<String>,
    /// Group name or numeric gid.
    pub group: Option<String>,
    /// Apply below directories too.
    pub recursive: bool,
}

/// File operations gated by a [`PathAuthorizer`].
#[derive(Debug, Clone, Default)]
pub struct FileService;

impl FileService {
    /// Create a file service.
    pub fn new() -> Self {
        Self
    }

    /// List a directory.
    ///
    /// Directories come first, then everything else, each group ordered by
    /// case-insensitive name with exact-name ties. Symlinks are reported as
    /// links and not followed.
    pub fn browse(
        &self,
        ctx: &SecurityContext,
        path: &Path,
        show_hidden: bool,
    ) -> FileResult<BrowseResponse> {
        let auth = PathAuthorizer::new(ctx);
        let canonical = auth.authorize(path, Access::Read)?;

        let metadata = fs::metadata(&canonical).map_err(|e| FileError::io(e, path))?;
        if !metadata.is_dir() {
            return Err(FileError::BadRequest(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&canonical).map_err(|e| FileError::io(e, path))? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(path = %canonical.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && name.starts_with('.') {
                continue;
            }

            let entry_path = canonical.join(&name);
            match fs::symlink_metadata(&entry_path) {
                Ok(meta) => entries.push(build_entry(name, &entry_path, &meta)),
                Err(e) => {
                    debug!(path = %entry_path.display(), error = %e, "Skipping entry we cannot stat");
                }
            }
        }

        entries.sort_by(compare_entries);

        let total_dirs = entries.iter().filter(|e| e.is_dir()).count();
        let total_files = entries.len() - total_dirs;
        let total_size = entries
            .iter()
            .filter(|e| e.entry_type == FileEntryType::File)
            .map(|e| e.size)
            .sum();

        Ok(BrowseResponse {
            path: canonical.to_string_lossy().to_string(),
            entries,
            total_size,
            total_files,
            total_dirs,
        })
    }

    /// Metadata of a single path.
    pub fn file_info(&self, ctx: &SecurityContext, path: &Path) -> FileResult<FileEntry> {
        let canonical = PathAuthorizer::new(ctx).authorize(path, Access::Read)?;
        let metadata = fs::metadata(&canonical).map_err(|e| FileError::io(e, path))?;

        let name = path
            .file_name()
            .or_else(|| canonical.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());

        let mut entry = build_entry(name, &canonical, &metadata);
        entry.is_symlink = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        Ok(entry)
    }

    /// Create `parent/name` as a directory.
    pub fn create_directory(
        &self,
        ctx: &SecurityContext,
        parent: &Path,
        name: &str,
        mode: Option<&str>,
    ) -> FileResult<PathBuf> {
        validate_file_name(name)?;
        let mode = mode.map(parse_mode).transpose()?.unwrap_or(DEFAULT_DIR_MODE);

        let auth = PathAuthorizer::new(ctx);
        let canonical_parent = auth.authorize(parent, Access::Write)?;
        if !canonical_parent.is_dir() {
            return Err(FileError::BadRequest(format!(
                "{} is not a directory",
                parent.display()
            )));
        }

        let target = auth.authorize_for_creation(&canonical_parent.join(name))?;
        DirBuilder::new()
            .mode(mode)
            .create(&target)
            .map_err(|e| FileError::io(e, &target))?;
        // The umask may have narrowed the requested mode.
        fs::set_permissions(&target, Permissions::from_mode(mode))
            .map_err(|e| FileError::io(e, &target))?;

        info!(
            user = %ctx.user().username,
            path = %target.display(),
            mode = %format!("{mode:04o}"),
            "Created directory"
        );
        Ok(target)
    }

    /// Delete each path independently.
    ///
    /// Every path is attempted; one failure does not stop the others.
    pub fn delete(
        &self,
        ctx: &SecurityContext,
        paths: &[PathBuf],
        recursive: bool,
    ) -> Vec<(PathBuf, FileResult<()>)> {
        let auth = PathAuthorizer::new(ctx);
        paths
            .iter()
            .map(|path| {
                let result = delete_one(&auth, path, recursive);
                match &result {
                    Ok(()) => info!(user = %ctx.user().username, path = %path.display(), "Deleted"),
                    Err(e) => debug!(path = %path.display(), error = %e, "Delete failed"),
                }
                (path.clone(), result)
            })
            .collect()
    }

    /// Rename an entry within its directory.
    pub fn rename(&self, ctx: &SecurityContext, old_path: &Path, new_name: &str) -> FileResult<PathBuf> {
        validate_file_name(new_name)?;

        let auth = PathAuthorizer::new(ctx);
        let source = auth.authorize_entry(old_path, Access::Write)?;
        let parent = source
            .parent()
            .ok_or_else(|| FileError::BadRequest("cannot rename /".to_string()))?;
        let target = auth.authorize_for_creation(&parent.join(new_name))?;

        if target == source {
            return Ok(target);
        }
        ensure_absent(&target)?;

        fs::rename(&source, &target).map_err(|e| FileError::io(e, &source))?;
        info!(
            user = %ctx.user().username,
            from = %source.display(),
            to = %target.display(),
            "Renamed"
        );
        Ok(target)
    }

    /// Copy a file or directory tree to a destination that must not exist.
    ///
    /// A failure midway leaves the partial copy in place.
    pub fn copy(
        &self,
        ctx: &SecurityContext,
        source: &Path,
        destination: &Path,
    ) -> FileResult<TransferSummary> {
        let auth = PathAuthorizer::new(ctx);
        let source = auth.authorize(source, Access::Read)?;
        let target = auth.authorize_for_creation(destination)?;
        check_transfer_target(&source, &target)?;

        let mut summary = TransferSummary::default();
        copy_entry(&auth, &source, &target, &mut summary)?;

        info!(
            user = %ctx.user().username,
            from = %source.display(),
            to = %target.display(),
            files = summary.files,
            bytes = summary.bytes,
            skipped = summary.skipped.len(),
            "Copied"
        );
        Ok(summary)
    }

    /// Move an entry, falling back to copy and delete across filesystems.
    pub fn move_entry(
        &self,
        ctx: &SecurityContext,
        source: &Path,
        destination: &Path,
    ) -> FileResult<PathBuf> {
        let auth = PathAuthorizer::new(ctx);
        let source = auth.authorize_entry(source, Access::Write)?;
        let target = auth.authorize_for_creation(destination)?;
        check_transfer_target(&source, &target)?;

        match fs::rename(&source, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!(from = %source.display(), to = %target.display(), "Cross-device move, copying");
                let mut summary = TransferSummary::default();
                copy_entry(&auth, &source, &target, &mut summary)?;
                if !summary.skipped.is_empty() {
                    return Err(FileError::Conflict(format!(
                        "{} entries could not be moved; source left in place",
                        summary.skipped.len()
                    )));
                }
                remove_entry(&source, true)?;
            }
            Err(e) => return Err(FileError::io(e, &source)),
        }

        info!(
            user = %ctx.user().username,
            from = %source.display(),
            to = %target.display(),
            "Moved"
        );
        Ok(target)
    }

    /// Ownership and mode bits of a path.
    pub fn permissions(&self, ctx: &SecurityContext, path: &Path) -> FileResult<PermissionsInfo> {
        let canonical = PathAuthorizer::new(ctx).authorize(path, Access::Read)?;
        permissions_info(&canonical)
    }

    /// Change mode bits and/or ownership. Ownership changes are admin-only.
    pub fn change_permissions(
        &self,
        ctx: &SecurityContext,
        path: &Path,
        change: &PermissionChange,
    ) -> FileResult<PermissionsInfo> {
        if change.mode.is_none() && change.owner.is_none() && change.group.is_none() {
            return Err(FileError::BadRequest(
                "one of mode, owner or group is required".to_string(),
            ));
        }
        if (change.owner.is_some() || change.group.is_some()) && !ctx.is_admin() {
            return Err(FileError::Forbidden(
                "changing ownership requires admin".to_string(),
            ));
        }

        let mode = change.mode.as_deref().map(parse_mode).transpose()?;
        let uid = change.owner.as_deref().map(resolve_uid).transpose()?;
        let gid = change.group.as_deref().map(resolve_gid).transpose()?;

        let auth = PathAuthorizer::new(ctx);
        let canonical = auth.authorize(path, Access::Write)?;
        if change.recursive {
            auth.check_subtree_writable(&canonical, path)?;
        }
        apply_permissions(&canonical, mode, uid, gid)?;
        if change.recursive && canonical.is_dir() {
            apply_permissions_below(&canonical, mode, uid, gid)?;
        }

        info!(
            user = %ctx.user().username,
            path = %canonical.display(),
            mode = ?change.mode,
            owner = ?change.owner,
            group = ?change.group,
            recursive = change.recursive,
            "Changed permissions"
        );
        permissions_info(&canonical)
    }

    /// Recursive size of a path, without following symlinks.
    pub fn disk_usage(
        &self,
        ctx: &SecurityContext,
        path: &Path,
        cancel: &CancellationToken,
    ) -> FileResult<DiskUsageInfo> {
        let canonical = PathAuthorizer::new(ctx).authorize(path, Access::Read)?;

        let mut usage = Usage::default();
        let metadata = fs::symlink_metadata(&canonical).map_err(|e| FileError::io(e, path))?;
        if metadata.is_dir() {
            usage.directories += 1;
            walk_usage(&canonical, cancel, &mut usage)?;
        } else {
            usage.files += 1;
            usage.bytes += metadata.len();
        }

        let filesystem = match statvfs(&canonical) {
            Ok(stats) => {
                let fragment = stats.fragment_size() as u64;
                let total = stats.blocks() as u64 * fragment;
                let free = stats.blocks_free() as u64 * fragment;
                let available = stats.blocks_available() as u64 * fragment;
                let usage_percent = if total > 0 {
                    (total - free) as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                Some(FilesystemStats {
                    total_bytes: total,
                    free_bytes: free,
                    available_bytes: available,
                    usage_percent,
                })
            }
            Err(e) => {
                warn!(path = %canonical.display(), error = %e, "statvfs failed");
                None
            }
        };

        Ok(DiskUsageInfo {
            path: canonical.to_string_lossy().to_string(),
            used_bytes: usage.bytes,
            files: usage.files,
            directories: usage.directories,
            filesystem,
        })
    }
}

fn build_entry(name: String, path: &Path, metadata: &Metadata) -> FileEntry {
    let file_type = metadata.file_type();
    let entry_type = if file_type.is_symlink() {
        FileEntryType::Symlink
    } else if file_type.is_dir() {
        FileEntryType::Directory
    } else if file_type.is_file() {
        FileEntryType::File
    } else {
        FileEntryType::Other
    };

    let size = if entry_type == FileEntryType::Directory {
        0
    } else {
        metadata.len()
    };

    let modified = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let extension = if entry_type == FileEntryType::Directory {
        None
    } else {
        Path::new(&name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    };

    FileEntry {
        name,
        path: path.to_string_lossy().to_string(),
        entry_type,
        size,
        mode: metadata.mode(),
        modified,
        is_symlink: file_type.is_symlink(),
        extension,
    }
}

fn compare_entries(a: &FileEntry, b: &FileEntry) -> Ordering {
    b.is_dir()
        .cmp(&a.is_dir())
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.name.cmp(&b.name))
}

fn ensure_absent(path: &Path) -> FileResult<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => Err(FileError::Conflict(format!("{} already exists", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FileError::io(e, path)),
    }
}

fn check_transfer_target(source: &Path, target: &Path) -> FileResult<()> {
    ensure_absent(target)?;
    if target.starts_with(source) {
        return Err(FileError::BadRequest(format!(
            "cannot place {} inside itself",
            source.display()
        )));
    }
    match target.parent() {
        Some(parent) if parent.is_dir() => Ok(()),
        _ => Err(FileError::NotFound(format!(
            "destination directory for {} does not exist",
            target.display()
        ))),
    }
}

fn delete_one(auth: &PathAuthorizer<'_>, path: &Path, recursive: bool) -> FileResult<()> {
    let entry = auth.authorize_entry(path, Access::Write)?;
    remove_entry(&entry, recursive)
}

fn remove_entry(entry: &Path, recursive: bool) -> FileResult<()> {
    let metadata = fs::symlink_metadata(entry).map_err(|e| FileError::io(e, entry))?;
    if metadata.is_dir() {
        let result = if recursive {
            fs::remove_dir_all(entry)
        } else {
            fs::remove_dir(entry)
        };
        result.map_err(|e| match e.kind() {
            io::ErrorKind::DirectoryNotEmpty => FileError::BadRequest(format!(
                "{} is not empty; use recursive delete",
                entry.display()
            )),
            _ => FileError::io(e, entry),
        })
    } else {
        fs::remove_file(entry).map_err(|e| FileError::io(e, entry))
    }
}

/// Copy `source` to `target`, recreating directories and authorized symlinks.
pub(crate) fn copy_entry(
    auth: &PathAuthorizer<'_>,
    source: &Path,
    target: &Path,
    summary: &mut TransferSummary,
) -> FileResult<()> {
    let metadata = fs::symlink_metadata(source).map_err(|e| FileError::io(e, source))?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        match fs::canonicalize(source) {
            Ok(resolved) if auth.can_read(&resolved) => {
                symlink(&resolved, target).map_err(|e| FileError::io(e, target))?;
            }
            _ => {
                debug!(path = %source.display(), "Skipping symlink with unauthorized target");
                summary.skipped.push(source.to_string_lossy().to_string());
            }
        }
    } else if file_type.is_dir() {
        fs::create_dir(target).map_err(|e| FileError::io(e, target))?;
        summary.directories += 1;

        let mut children: Vec<PathBuf> = fs::read_dir(source)
            .map_err(|e| FileError::io(e, source))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<_>>()
            .map_err(|e| FileError::io(e, source))?;
        children.sort();

        for child in children {
            if let Some(name) = child.file_name() {
                copy_entry(auth, &child, &target.join(name), summary)?;
            }
        }

        if let Err(e) = fs::set_permissions(target, metadata.permissions()) {
            warn!(path = %target.display(), error = %e, "Failed to preserve directory permissions");
        }
    } else if file_type.is_file() {
        summary.bytes += fs::copy(source, target).map_err(|e| FileError::io(e, source))?;
        summary.files += 1;
    } else {
        debug!(path = %source.display(), "Skipping special file");
        summary.skipped.push(source.to_string_lossy().to_string());
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Usage {
    bytes: u64,
    files: u64,
    directories: u64,
}

fn walk_usage(dir: &Path, cancel: &CancellationToken, usage: &mut Usage) -> FileResult<()> {
    if cancel.is_cancelled() {
        return Err(FileError::Cancelled);
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Skipping unreadable directory");
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        if cancel.is_cancelled() {
            return Err(FileError::Cancelled);
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            usage.directories += 1;
            walk_usage(&entry.path(), cancel, usage)?;
        } else {
            usage.files += 1;
            usage.bytes += metadata.len();
        }
    }
    Ok(())
}

fn permissions_info(path: &Path) -> FileResult<PermissionsInfo> {
    let metadata = fs::symlink_metadata(path).map_err(|e| FileError::io(e, path))?;
    let uid = metadata.uid();
    let gid = metadata.gid();

    let owner = User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| format!("uid:{uid}"));
    let group = Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_else(|| format!("gid:{gid}"));

    Ok(PermissionsInfo {
        path: path.to_string_lossy().to_string(),
        permissions: format!("{:04o}", metadata.mode() & 0o7777),
        mode: mode_string(&metadata),
        owner,
        group,
        uid,
        gid,
    })
}

/// `ls -l` style mode string.
fn mode_string(metadata: &Metadata) -> String {
    let file_type = metadata.file_type();
    let kind = if file_type.is_dir() {
        'd'
    } else if file_type.is_symlink() {
        'l'
    } else if file_type.is_file() {
        '-'
    } else {
        '?'
    };

    let mode = metadata.mode();
    let mut out = String::with_capacity(10);
    out.push(kind);
    for (shift, special, special_char) in [(6, 0o4000, 's'), (3, 0o2000, 's'), (0, 0o1000, 't')] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        out.push(match (mode & special != 0, exec) {
            (true, true) => special_char,
            (true, false) => special_char.to_ascii_uppercase(),
            (false, true) => 'x',
            (false, false) => '-',
        });
    }
    out
}

fn resolve_uid(owner: &str) -> FileResult<Uid> {
    if let Ok(id) = owner.parse::<u32>() {
        return Ok(Uid::from_raw(id));
    }
    match User::from_name(owner) {
        Ok(Some(user)) => Ok(user.uid),
        _ => Err(FileError::BadRequest(format!("unknown user: {owner}"))),
    }
}

fn resolve_gid(group: &str) -> FileResult<Gid> {
    if let Ok(id) = group.parse::<u32>() {
        return Ok(Gid::from_raw(id));
    }
    match Group::from_name(group) {
        Ok(Some(group)) => Ok(group.gid),
        _ => Err(FileError::BadRequest(format!("unknown group: {group}"))),
    }
}

fn apply_permissions(
    path: &Path,
    mode: Option<u32>,
    uid: Option<Uid>,
    gid: Option<Gid>,
) -> FileResult<()> {
    if let Some(mode) = mode {
        fs::set_permissions(path, Permissions::from_mode(mode))
            .map_err(|e| FileError::io(e, path))?;
    }
    if uid.is_some() || gid.is_some() {
        unistd::chown(path, uid, gid).map_err(|e| FileError::io(io::Error::from(e), path))?;
    }
    Ok(())
}

fn apply_permissions_below(
    dir: &Path,
    mode: Option<u32>,
    uid: Option<Uid>,
    gid: Option<Gid>,
) -> FileResult<()> {
    for entry in fs::read_dir(dir).map_err(|e| FileError::io(e, dir))? {
        let entry = entry.map_err(|e| FileError::io(e, dir))?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| FileError::io(e, &path))?;
        // Links are left alone so a change never escapes through one.
        if file_type.is_symlink() {
            continue;
        }
        apply_permissions(&path, mode, uid, gid)?;
        if file_type.is_dir() {
            apply_permissions_below(&path, mode, uid, gid)?;
        }
    }
    Ok(())
}
