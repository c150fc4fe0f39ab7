//! Archive creation and extraction inside the caller's shares.
//!
//! Supported formats are zip (deflate), tar and gzip-compressed tar. Creation
//! walks sources depth-first with directory entries sorted by name, so the
//! same tree always produces the same entry order. Extraction validates every
//! entry on its own: an entry that would land outside the destination, or
//! overwrite an existing file, is rejected while the rest still extract.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use protocol::messages::{ArchiveFormat, ArchiveSummary, ExtractSummary, RejectedEntry};
use tar::EntryType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{FileError, FileResult};
use crate::security::{Access, PathAuthorizer, SecurityContext};

/// Mode for extracted files whose entry carries no permissions.
const DEFAULT_FILE_MODE: u32 = 0o644;

/// Name reported when an archive stops being readable partway through.
const ARCHIVE_TAIL: &str = "<remaining entries>";

/// Creates and extracts archives, authorizing every path it touches.
#[derive(Debug, Clone, Default)]
pub struct ArchiveEngine;

impl ArchiveEngine {
    /// Create an archive engine.
    pub fn new() -> Self {
        Self
    }

    /// Pack `sources` into a new archive at `destination`.
    ///
    /// The partial archive is removed if anything fails or the request is
    /// cancelled.
    pub fn create_archive(
        &self,
        ctx: &SecurityContext,
        sources: &[PathBuf],
        destination: &Path,
        format: ArchiveFormat,
        cancel: &CancellationToken,
    ) -> FileResult<ArchiveSummary> {
        if sources.is_empty() {
            return Err(FileError::BadRequest("no sources given".to_string()));
        }

        let auth = PathAuthorizer::new(ctx);
        let mut roots = Vec::with_capacity(sources.len());
        for source in sources {
            let canonical = auth.authorize(source, Access::Read)?;
            let name = canonical
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| FileError::BadRequest("cannot archive /".to_string()))?;
            if roots.iter().any(|(_, existing)| existing == &name) {
                return Err(FileError::BadRequest(format!(
                    "two sources are both named {name}"
                )));
            }
            roots.push((canonical, name));
        }

        let target = auth.authorize_for_creation(destination)?;
        if !target.parent().is_some_and(Path::is_dir) {
            return Err(FileError::NotFound(format!(
                "destination directory for {} does not exist",
                destination.display()
            )));
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| FileError::io(e, &target))?;

        let mut summary = ArchiveSummary {
            path: target.to_string_lossy().to_string(),
            ..Default::default()
        };

        let result = (|| {
            let mut packer = Packer::new(file, format);
            for (source, name) in &roots {
                add_tree(&auth, &mut packer, source, name, &target, &mut summary, cancel)?;
            }
            packer.finish().map_err(|e| FileError::io(e, &target))
        })();

        if let Err(err) = result {
            if let Err(e) = fs::remove_file(&target) {
                warn!(path = %target.display(), error = %e, "Failed to remove partial archive");
            }
            return Err(err);
        }

        info!(
            user = %ctx.user().username,
            path = %target.display(),
            format = %format,
            entries = summary.entries,
            bytes = summary.bytes,
            skipped = summary.skipped.len(),
            "Created archive"
        );
        Ok(summary)
    }

    /// Extract `archive` into the existing directory `destination`.
    ///
    /// The format is detected from the archive's file name.
    pub fn extract_archive(
        &self,
        ctx: &SecurityContext,
        archive: &Path,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> FileResult<ExtractSummary> {
        let auth = PathAuthorizer::new(ctx);
        let archive = auth.authorize(archive, Access::Read)?;
        let dest = auth.authorize(destination, Access::Write)?;
        if !dest.is_dir() {
            return Err(FileError::BadRequest(format!(
                "{} is not a directory",
                destination.display()
            )));
        }

        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let format = ArchiveFormat::from_file_name(&file_name).ok_or_else(|| {
            FileError::BadRequest(format!("unsupported archive type: {file_name}"))
        })?;

        let file = File::open(&archive).map_err(|e| FileError::io(e, &archive))?;
        let mut extractor = Extractor {
            auth,
            dest: dest.clone(),
            summary: ExtractSummary::default(),
        };

        match format {
            ArchiveFormat::Zip => extractor.extract_zip(file, cancel)?,
            ArchiveFormat::Tar => extractor.extract_tar(file, cancel)?,
            ArchiveFormat::TarGz => extractor.extract_tar(GzDecoder::new(file), cancel)?,
        }

        let summary = extractor.summary;
        info!(
            user = %ctx.user().username,
            archive = %archive.display(),
            destination = %dest.display(),
            extracted = summary.extracted.len(),
            rejected = summary.rejected.len(),
            "Extracted archive"
        );
        Ok(summary)
    }
}

/// Archive writer for one of the supported formats.
enum Packer {
    Zip(ZipWriter<File>),
    Tar(tar::Builder<File>),
    TarGz(tar::Builder<GzEncoder<File>>),
}

impl Packer {
    fn new(file: File, format: ArchiveFormat) -> Self {
        match format {
            ArchiveFormat::Zip => Packer::Zip(ZipWriter::new(file)),
            ArchiveFormat::Tar => Packer::Tar(tar::Builder::new(file)),
            ArchiveFormat::TarGz => {
                Packer::TarGz(tar::Builder::new(GzEncoder::new(file, Compression::default())))
            }
        }
    }

    fn add_dir(&mut self, name: &str, path: &Path, mode: u32) -> io::Result<()> {
        match self {
            Packer::Zip(zip) => {
                let options = SimpleFileOptions::default().unix_permissions(mode & 0o7777);
                zip.add_directory(format!("{name}/"), options)?;
                Ok(())
            }
            Packer::Tar(builder) => builder.append_dir(name, path),
            Packer::TarGz(builder) => builder.append_dir(name, path),
        }
    }

    fn add_file(&mut self, name: &str, path: &Path, mode: u32) -> io::Result<u64> {
        match self {
            Packer::Zip(zip) => {
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(mode & 0o7777)
                    .large_file(true);
                zip.start_file(name, options)?;
                let mut source = File::open(path)?;
                io::copy(&mut source, zip)
            }
            Packer::Tar(builder) => {
                builder.append_path_with_name(path, name)?;
                Ok(fs::metadata(path)?.len())
            }
            Packer::TarGz(builder) => {
                builder.append_path_with_name(path, name)?;
                Ok(fs::metadata(path)?.len())
            }
        }
    }

    fn finish(self) -> io::Result<()> {
        let file = match self {
            Packer::Zip(zip) => zip.finish()?,
            Packer::Tar(builder) => builder.into_inner()?,
            Packer::TarGz(builder) => builder.into_inner()?.finish()?,
        };
        file.sync_all()
    }
}

fn add_tree(
    auth: &PathAuthorizer<'_>,
    packer: &mut Packer,
    path: &Path,
    name: &str,
    archive_path: &Path,
    summary: &mut ArchiveSummary,
    cancel: &CancellationToken,
) -> FileResult<()> {
    if cancel.is_cancelled() {
        return Err(FileError::Cancelled);
    }

    let metadata = fs::symlink_metadata(path).map_err(|e| FileError::io(e, path))?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        match fs::canonicalize(path) {
            Ok(target) if target.is_file() && auth.can_read(&target) => {
                let mode = fs::metadata(&target).map(|m| m.mode()).unwrap_or(DEFAULT_FILE_MODE);
                summary.bytes += packer
                    .add_file(name, &target, mode)
                    .map_err(|e| FileError::io(e, &target))?;
                summary.entries += 1;
            }
            _ => {
                debug!(path = %path.display(), "Skipping symlink while archiving");
                summary.skipped.push(name.to_string());
            }
        }
        return Ok(());
    }

    if !auth.can_read(path) {
        summary.skipped.push(name.to_string());
        return Ok(());
    }

    if file_type.is_dir() {
        packer
            .add_dir(name, path, metadata.mode())
            .map_err(|e| FileError::io(e, path))?;
        summary.entries += 1;

        let mut children: Vec<String> = fs::read_dir(path)
            .map_err(|e| FileError::io(e, path))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        children.sort();

        for child in children {
            add_tree(
                auth,
                packer,
                &path.join(&child),
                &format!("{name}/{child}"),
                archive_path,
                summary,
                cancel,
            )?;
        }
    } else if file_type.is_file() {
        if path == archive_path {
            return Ok(());
        }
        summary.bytes += packer
            .add_file(name, path, metadata.mode())
            .map_err(|e| FileError::io(e, path))?;
        summary.entries += 1;
    } else {
        summary.skipped.push(name.to_string());
    }
    Ok(())
}

/// Per-entry extraction state.
struct Extractor<'a> {
    auth: PathAuthorizer<'a>,
    dest: PathBuf,
    summary: ExtractSummary,
}

impl Extractor<'_> {
    fn extract_zip(&mut self, file: File, cancel: &CancellationToken) -> FileResult<()> {
        let mut zip = ZipArchive::new(file)
            .map_err(|e| FileError::BadRequest(format!("unreadable zip archive: {e}")))?;

        for index in 0..zip.len() {
            if cancel.is_cancelled() {
                return Err(FileError::Cancelled);
            }
            let mut entry = match zip.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    self.reject(&format!("entry {index}"), &format!("corrupt entry: {e}"));
                    continue;
                }
            };
            let name = entry.name().to_string();
            let mode = entry.unix_mode();
            let size = entry.size();

            if entry.is_symlink() {
                self.reject(&name, "unsupported entry type");
            } else if entry.is_dir() {
                self.extract_dir(&name);
            } else {
                self.extract_file(&name, &mut entry, mode, size)?;
            }
        }
        Ok(())
    }

    fn extract_tar<R: Read>(&mut self, reader: R, cancel: &CancellationToken) -> FileResult<()> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive
            .entries()
            .map_err(|e| FileError::BadRequest(format!("unreadable tar archive: {e}")))?;

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(FileError::Cancelled);
            }
            // A tar stream cannot be resynchronized after a bad header.
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.reject(ARCHIVE_TAIL, &format!("unreadable archive data: {e}"));
                    break;
                }
            };
            let name = String::from_utf8_lossy(&entry.path_bytes()).to_string();
            let mode = entry.header().mode().ok();
            let size = entry.size();

            match entry.header().entry_type() {
                EntryType::Directory => self.extract_dir(&name),
                EntryType::Regular | EntryType::Continuous => {
                    self.extract_file(&name, &mut entry, mode, size)?
                }
                // Global and per-file metadata headers carry no content.
                EntryType::XGlobalHeader | EntryType::XHeader => {}
                _ => self.reject(&name, "unsupported entry type"),
            }
        }
        Ok(())
    }

    fn extract_dir(&mut self, name: &str) {
        let relative = match safe_relative(name) {
            Some(r) => r,
            None => return self.reject(name, "path escapes destination"),
        };
        match self.ensure_dir(&relative) {
            Ok(_) => self.summary.extracted.push(name.to_string()),
            Err(reason) => self.reject(name, &reason),
        }
    }

    /// Write one regular file entry of `size` bytes.
    ///
    /// A short or failed copy removes the partial file and rejects the entry.
    fn extract_file<R: Read>(
        &mut self,
        name: &str,
        reader: &mut R,
        mode: Option<u32>,
        size: u64,
    ) -> FileResult<()> {
        let relative = match safe_relative(name) {
            Some(r) => r,
            None => {
                self.reject(name, "path escapes destination");
                return Ok(());
            }
        };
        let Some(file_name) = relative.file_name().map(|n| n.to_os_string()) else {
            self.reject(name, "invalid entry name");
            return Ok(());
        };

        let parent = match self.ensure_dir(relative.parent().unwrap_or(Path::new(""))) {
            Ok(p) => p,
            Err(reason) => {
                self.reject(name, &reason);
                return Ok(());
            }
        };

        let target = parent.join(file_name);
        let mut out = match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                self.reject(name, "already exists");
                return Ok(());
            }
            Err(e) => return Err(FileError::io(e, &target)),
        };

        let copied = io::copy(reader, &mut out).and_then(|n| out.flush().map(|()| n));
        let failure = match copied {
            Ok(n) if n == size => None,
            Ok(n) => Some(format!("truncated entry: {n} of {size} bytes")),
            Err(e) => Some(format!("cannot extract: {e}")),
        };
        if let Some(reason) = failure {
            drop(out);
            if let Err(e) = fs::remove_file(&target) {
                warn!(path = %target.display(), error = %e, "Failed to remove partial extracted file");
            }
            self.reject(name, &reason);
            return Ok(());
        }

        let mode = mode.map(|m| m & 0o777).filter(|m| *m != 0).unwrap_or(DEFAULT_FILE_MODE);
        if let Err(e) = fs::set_permissions(&target, fs::Permissions::from_mode(mode)) {
            warn!(path = %target.display(), error = %e, "Failed to set extracted file mode");
        }

        self.summary.extracted.push(name.to_string());
        Ok(())
    }

    /// Walk `relative` below the destination, creating missing directories.
    ///
    /// Existing symlinks along the way must resolve inside the destination,
    /// and every directory reached is re-authorized for writing.
    fn ensure_dir(&self, relative: &Path) -> Result<PathBuf, String> {
        let mut current = self.dest.clone();
        for component in relative.components() {
            let next = current.join(component);
            match fs::symlink_metadata(&next) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let resolved = fs::canonicalize(&next)
                        .map_err(|_| "dangling symlink in path".to_string())?;
                    if !resolved.starts_with(&self.dest) || !resolved.is_dir() {
                        return Err("path escapes destination".to_string());
                    }
                    current = resolved;
                }
                Ok(meta) if meta.is_dir() => current = next,
                Ok(_) => return Err("parent is not a directory".to_string()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&next).map_err(|e| format!("cannot create directory: {e}"))?;
                    current = next;
                }
                Err(e) => return Err(format!("cannot inspect path: {e}")),
            }

            self.auth
                .check_canonical(&current, &current, Access::Write)
                .map_err(|_| "not authorized".to_string())?;
        }
        Ok(current)
    }

    fn reject(&mut self, name: &str, reason: &str) {
        debug!(entry = %name, reason, "Rejected archive entry");
        self.summary.rejected.push(RejectedEntry {
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Entry name as a relative path of plain components.
///
/// Absolute names and any `..` are refused outright.
fn safe_relative(name: &str) -> Option<PathBuf> {
    if name.contains('\0') || name.contains('\\') {
        return None;
    }
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Role, Share, User};
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        base: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let base = fs::canonicalize(temp.path()).unwrap();
            fs::create_dir_all(base.join("public/project/src")).unwrap();
            fs::create_dir_all(base.join("public/out")).unwrap();
            fs::create_dir_all(base.join("eng")).unwrap();
            fs::write(base.join("public/project/b.txt"), b"bbb").unwrap();
            fs::write(base.join("public/project/a.txt"), b"aa").unwrap();
            fs::write(base.join("public/project/src/main.rs"), b"fn main() {}").unwrap();
            fs::write(base.join("eng/secret.txt"), b"secret").unwrap();
            Self { _temp: temp, base }
        }

        fn ctx(&self) -> SecurityContext {
            let shares = vec![
                Share {
                    guest_ok: true,
                    ..Share::new(1, "public", self.base.join("public"))
                },
                Share {
                    valid_users: vec!["alice".to_string()],
                    ..Share::new(2, "eng", self.base.join("eng"))
                },
            ];
            SecurityContext::resolve(&User::new(1, "bob", Role::User), &shares)
        }
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let mut zip = ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn tar_names<R: Read>(reader: R) -> Vec<String> {
        let mut archive = tar::Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let name = entry.path().unwrap().to_string_lossy().to_string();
                name.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_create_zip_deterministic_order() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let dest = fx.base.join("public/out/project.zip");

        let summary = ArchiveEngine::new()
            .create_archive(
                &ctx,
                &[fx.base.join("public/project")],
                &dest,
                ArchiveFormat::Zip,
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(summary.entries, 5);
        assert_eq!(summary.bytes, 17);
        assert_eq!(
            zip_names(&dest),
            vec![
                "project/",
                "project/a.txt",
                "project/b.txt",
                "project/src/",
                "project/src/main.rs"
            ]
        );
    }

    #[test]
    fn test_create_tar_gz() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let dest = fx.base.join("public/out/project.tar.gz");

        ArchiveEngine::new()
            .create_archive(
                &ctx,
                &[fx.base.join("public/project/a.txt"), fx.base.join("public/project/src")],
                &dest,
                ArchiveFormat::TarGz,
                &CancellationToken::new(),
            )
            .unwrap();

        let names = tar_names(GzDecoder::new(File::open(&dest).unwrap()));
        assert_eq!(names, vec!["a.txt", "src", "src/main.rs"]);
    }

    #[test]
    fn test_create_rejects_unauthorized_source_and_existing_destination() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let engine = ArchiveEngine::new();
        let dest = fx.base.join("public/out/x.tar");

        let err = engine
            .create_archive(
                &ctx,
                &[fx.base.join("eng/secret.txt")],
                &dest,
                ArchiveFormat::Tar,
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FileError::Forbidden(_)));
        assert!(!dest.exists());

        fs::write(&dest, b"").unwrap();
        let err = engine
            .create_archive(
                &ctx,
                &[fx.base.join("public/project")],
                &dest,
                ArchiveFormat::Tar,
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FileError::Conflict(_)));
    }

    #[test]
    fn test_create_skips_unauthorized_symlink() {
        let fx = Fixture::new();
        symlink(
            fx.base.join("eng/secret.txt"),
            fx.base.join("public/project/leak"),
        )
        .unwrap();
        let ctx = fx.ctx();
        let dest = fx.base.join("public/out/p.zip");

        let summary = ArchiveEngine::new()
            .create_archive(
                &ctx,
                &[fx.base.join("public/project")],
                &dest,
                ArchiveFormat::Zip,
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(summary.skipped, vec!["project/leak".to_string()]);
        assert!(!zip_names(&dest).iter().any(|n| n.contains("leak")));
    }

    #[test]
    fn test_create_cancelled_removes_partial_archive() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let dest = fx.base.join("public/out/p.zip");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ArchiveEngine::new()
            .create_archive(
                &ctx,
                &[fx.base.join("public/project")],
                &dest,
                ArchiveFormat::Zip,
                &cancel,
            )
            .unwrap_err();
        assert!(matches!(err, FileError::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn test_zip_roundtrip_extract() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let engine = ArchiveEngine::new();
        let dest = fx.base.join("public/out/p.zip");
        engine
            .create_archive(
                &ctx,
                &[fx.base.join("public/project")],
                &dest,
                ArchiveFormat::Zip,
                &CancellationToken::new(),
            )
            .unwrap();

        fs::create_dir(fx.base.join("public/restore")).unwrap();
        let summary = engine
            .extract_archive(
                &ctx,
                &dest,
                &fx.base.join("public/restore"),
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(summary.rejected.is_empty());
        assert_eq!(summary.extracted.len(), 5);
        assert_eq!(
            fs::read(fx.base.join("public/restore/project/src/main.rs")).unwrap(),
            b"fn main() {}"
        );
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_extract_rejects_zip_slip_per_entry() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let archive = fx.base.join("public/evil.zip");
        write_zip(
            &archive,
            &[
                ("../outside.txt", b"nope"),
                ("/abs.txt", b"nope"),
                ("good/inside.txt", b"ok"),
            ],
        );

        let summary = ArchiveEngine::new()
            .extract_archive(
                &ctx,
                &archive,
                &fx.base.join("public/out"),
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(summary.extracted, vec!["good/inside.txt".to_string()]);
        assert_eq!(summary.rejected.len(), 2);
        assert!(!fx.base.join("public/outside.txt").exists());
        assert_eq!(
            fs::read(fx.base.join("public/out/good/inside.txt")).unwrap(),
            b"ok"
        );
    }

    #[test]
    fn test_extract_does_not_follow_escaping_symlink() {
        let fx = Fixture::new();
        symlink(fx.base.join("eng"), fx.base.join("public/out/link")).unwrap();
        let ctx = fx.ctx();
        let archive = fx.base.join("public/a.zip");
        write_zip(&archive, &[("link/planted.txt", b"x")]);

        let summary = ArchiveEngine::new()
            .extract_archive(
                &ctx,
                &archive,
                &fx.base.join("public/out"),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(summary.rejected.len(), 1);
        assert!(!fx.base.join("eng/planted.txt").exists());
    }

    #[test]
    fn test_extract_never_overwrites() {
        let fx = Fixture::new();
        fs::write(fx.base.join("public/out/keep.txt"), b"original").unwrap();
        let ctx = fx.ctx();
        let archive = fx.base.join("public/a.zip");
        write_zip(&archive, &[("keep.txt", b"replaced"), ("new.txt", b"n")]);

        let summary = ArchiveEngine::new()
            .extract_archive(
                &ctx,
                &archive,
                &fx.base.join("public/out"),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(summary.extracted, vec!["new.txt".to_string()]);
        assert_eq!(summary.rejected[0].reason, "already exists");
        assert_eq!(
            fs::read(fx.base.join("public/out/keep.txt")).unwrap(),
            b"original"
        );
    }

    #[test]
    fn test_extract_tar_skips_symlink_entries() {
        let fx = Fixture::new();
        let archive = fx.base.join("public/links.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, "passwd", "/etc/passwd")
                .unwrap();

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_size(2);
            header.set_mode(0o600);
            header.set_cksum();
            builder
                .append_data(&mut header, "notes.txt", &b"hi"[..])
                .unwrap();
            builder.finish().unwrap();
        }

        let ctx = fx.ctx();
        let summary = ArchiveEngine::new()
            .extract_archive(
                &ctx,
                &archive,
                &fx.base.join("public/out"),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(summary.extracted, vec!["notes.txt".to_string()]);
        assert_eq!(summary.rejected[0].reason, "unsupported entry type");
        assert!(fs::symlink_metadata(fx.base.join("public/out/passwd")).is_err());
        let mode = fs::metadata(fx.base.join("public/out/notes.txt"))
            .unwrap()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_extract_truncated_tar_keeps_summary() {
        let fx = Fixture::new();
        let archive = fx.base.join("public/cut.tar");
        {
            let mut builder = tar::Builder::new(File::create(&archive).unwrap());
            for (name, body) in [("small.txt", vec![b's'; 10]), ("big.bin", vec![b'b'; 4096])] {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(EntryType::Regular);
                header.set_size(body.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, &body[..]).unwrap();
            }
            builder.finish().unwrap();
        }
        // Header and one block for small.txt, then big.bin's header and 1000 bytes.
        OpenOptions::new()
            .write(true)
            .open(&archive)
            .unwrap()
            .set_len(512 * 3 + 1000)
            .unwrap();

        let ctx = fx.ctx();
        let summary = ArchiveEngine::new()
            .extract_archive(
                &ctx,
                &archive,
                &fx.base.join("public/out"),
                &CancellationToken::new(),
            )
            .unwrap();

        assert_eq!(summary.extracted, vec!["small.txt".to_string()]);
        assert_eq!(summary.rejected[0].name, "big.bin");
        assert!(summary.rejected[0].reason.starts_with("truncated entry"));
        assert!(summary.rejected.iter().skip(1).all(|r| r.name == ARCHIVE_TAIL));
        assert!(!fx.base.join("public/out/big.bin").exists());
        assert_eq!(fs::read(fx.base.join("public/out/small.txt")).unwrap(), vec![b's'; 10]);
    }

    #[test]
    fn test_extract_into_other_share_forbidden() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let archive = fx.base.join("public/a.zip");
        write_zip(&archive, &[("x.txt", b"x")]);

        let err = ArchiveEngine::new()
            .extract_archive(&ctx, &archive, &fx.base.join("eng"), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, FileError::Forbidden(_)));
    }

    #[test]
    fn test_extract_unknown_format() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let archive = fx.base.join("public/a.rar");
        fs::write(&archive, b"Rar!").unwrap();

        let err = ArchiveEngine::new()
            .extract_archive(
                &ctx,
                &archive,
                &fx.base.join("public/out"),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, FileError::BadRequest(_)));
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(safe_relative("a/b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(safe_relative("./a"), Some(PathBuf::from("a")));
        assert_eq!(safe_relative("a/../../b"), None);
        assert_eq!(safe_relative("/etc/passwd"), None);
        assert_eq!(safe_relative("a\\..\\b"), None);
        assert_eq!(safe_relative(""), None);
    }
}
