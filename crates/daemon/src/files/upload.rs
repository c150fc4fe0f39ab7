//! Resumable chunked uploads.
//!
//! A session accumulates fixed-size chunks in a private file under the
//! quarantine directory. Nothing is authorized until finalize, which checks
//! the destination against the caller's shares at that moment and then
//! commits the file without replacing anything already there.
//!
//! Session metadata sits behind a per-session async mutex. Chunk bodies are
//! written with positional writes after the lock is released, so retries and
//! out-of-order chunks for disjoint ranges proceed in parallel.
//!
//! Small files can skip the session entirely with
//! [`UploadSessionManager::upload_file`].

use std::collections::BTreeSet;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::sys::statvfs::statvfs;
use protocol::messages::{UploadState, UploadStatus};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::names::validate_file_name;
use crate::config::UploadConfig;
use crate::error::{FileError, FileResult};
use crate::security::{Access, PathAuthorizer, SecurityContext};

/// Mode given to committed uploads.
pub const DEFAULT_UPLOAD_MODE: u32 = 0o644;

/// Extension of partial upload files in the quarantine directory.
const PART_EXTENSION: &str = "part";

#[derive(Debug)]
struct UploadSession {
    id: String,
    owner: String,
    file_name: String,
    total_size: u64,
    chunk_size: u64,
    total_chunks: u32,
    temp_path: PathBuf,
    received: BTreeSet<u32>,
    received_bytes: u64,
    state: UploadState,
    created_at: Instant,
    updated_at: Instant,
    finished_at: Option<Instant>,
    in_flight: Arc<AtomicU32>,
}

/// Counts one chunk write for as long as its blocking task runs.
///
/// The guard moves into the blocking closure, so the count drops when the
/// write ends even if the request that started it was abandoned.
struct InFlightWrite(Arc<AtomicU32>);

impl InFlightWrite {
    fn start(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightWrite {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UploadSession {
    fn expected_len(&self, index: u32) -> u64 {
        let offset = u64::from(index) * self.chunk_size;
        self.chunk_size.min(self.total_size - offset)
    }

    fn is_complete(&self) -> bool {
        self.received.len() as u64 == u64::from(self.total_chunks)
            && self.received_bytes == self.total_size
    }

    fn check_owner(&self, ctx: &SecurityContext) -> FileResult<()> {
        if ctx.is_admin() || ctx.user().username == self.owner {
            Ok(())
        } else {
            Err(FileError::Forbidden(
                "upload session belongs to another user".to_string(),
            ))
        }
    }

    fn check_writable(&self) -> FileResult<()> {
        match self.state {
            UploadState::Pending | UploadState::Receiving => Ok(()),
            state => Err(FileError::Conflict(format!("upload is {state}"))),
        }
    }

    /// Move to a terminal state and drop the partial data.
    fn finish(&mut self, state: UploadState) {
        discard_temp(&self.temp_path);
        self.state = state;
        let now = Instant::now();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    fn status(&self) -> UploadStatus {
        UploadStatus {
            session_id: self.id.clone(),
            state: self.state,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            received_chunks: self.received.len() as u32,
            received_bytes: self.received_bytes,
            total_size: self.total_size,
        }
    }
}

/// How a failed finalize leaves the session.
enum FinalizeError {
    /// Session goes back to receiving and may be finalized again.
    Retry(FileError),
    /// Session is cancelled and its data deleted.
    Abort(FileError),
}

/// Owns every upload session and its quarantined data.
pub struct UploadSessionManager {
    sessions: DashMap<String, Arc<Mutex<UploadSession>>>,
    temp_dir: PathBuf,
    chunk_size: u64,
    max_size: u64,
    min_free_space: u64,
    ttl: Duration,
}

impl UploadSessionManager {
    /// Create a manager storing partial uploads under `temp_dir`.
    ///
    /// The directory is created if needed and restricted to the daemon user.
    pub fn new(temp_dir: PathBuf, config: &UploadConfig) -> FileResult<Self> {
        if config.chunk_size == 0 {
            return Err(FileError::BadRequest("chunk size must be positive".to_string()));
        }
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&temp_dir)
            .map_err(|e| FileError::io(e, &temp_dir))?;
        fs::set_permissions(&temp_dir, Permissions::from_mode(0o700))
            .map_err(|e| FileError::io(e, &temp_dir))?;

        Ok(Self {
            sessions: DashMap::new(),
            temp_dir,
            chunk_size: config.chunk_size,
            max_size: config.max_size,
            min_free_space: config.min_free_space,
            ttl: config.session_ttl(),
        })
    }

    /// Quarantine directory.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Fixed chunk size of every session.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of tracked sessions, tombstones included.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn check_size(&self, total_size: u64) -> FileResult<()> {
        if total_size > self.max_size {
            return Err(FileError::BadRequest(format!(
                "upload of {total_size} bytes exceeds the {} byte limit",
                self.max_size
            )));
        }
        Ok(())
    }

    fn session(&self, id: &str) -> FileResult<Arc<Mutex<UploadSession>>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FileError::NotFound(format!("upload session {id}")))
    }

    /// Open a new session for `file_name` of `total_size` bytes.
    pub async fn start(
        &self,
        ctx: &SecurityContext,
        file_name: &str,
        total_size: u64,
    ) -> FileResult<UploadStatus> {
        validate_file_name(file_name)?;
        self.check_size(total_size)?;
        ensure_free_space(&self.temp_dir, total_size.saturating_add(self.min_free_space))?;

        // An empty file is a single empty chunk.
        let total_chunks = total_size.div_ceil(self.chunk_size).max(1);
        let total_chunks = u32::try_from(total_chunks)
            .map_err(|_| FileError::BadRequest("upload has too many chunks".to_string()))?;

        let id = hex::encode(rand::random::<[u8; 16]>());
        let temp_path = self.temp_dir.join(format!("{id}.{PART_EXTENSION}"));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&temp_path)
            .map_err(|e| FileError::io(e, &temp_path))?;

        let now = Instant::now();
        let session = UploadSession {
            id: id.clone(),
            owner: ctx.user().username.clone(),
            file_name: file_name.to_string(),
            total_size,
            chunk_size: self.chunk_size,
            total_chunks,
            temp_path,
            received: BTreeSet::new(),
            received_bytes: 0,
            state: UploadState::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
            in_flight: Arc::new(AtomicU32::new(0)),
        };
        let status = session.status();
        self.sessions.insert(id.clone(), Arc::new(Mutex::new(session)));

        info!(
            session_id = %id,
            user = %ctx.user().username,
            file_name = %file_name,
            total_size,
            total_chunks,
            "Upload started"
        );
        Ok(status)
    }

    /// Store chunk `index`. Re-sending a chunk overwrites it.
    pub async fn upload_chunk(
        &self,
        ctx: &SecurityContext,
        id: &str,
        index: u32,
        data: Vec<u8>,
    ) -> FileResult<UploadStatus> {
        let session = self.session(id)?;

        let (temp_path, offset, guard) = {
            let mut s = session.lock().await;
            s.check_owner(ctx)?;
            s.check_writable()?;
            if index >= s.total_chunks {
                return Err(FileError::BadRequest(format!(
                    "chunk {index} out of range (0..{})",
                    s.total_chunks
                )));
            }
            let expected = s.expected_len(index);
            if data.len() as u64 != expected {
                return Err(FileError::BadRequest(format!(
                    "chunk {index} must be {expected} bytes, got {}",
                    data.len()
                )));
            }
            let guard = InFlightWrite::start(&s.in_flight);
            s.state = UploadState::Receiving;
            (s.temp_path.clone(), u64::from(index) * s.chunk_size, guard)
        };

        let len = data.len() as u64;
        let path = temp_path.clone();
        let written = tokio::task::spawn_blocking(move || -> io::Result<()> {
            let _guard = guard;
            // Never created here: a cancelled session's file stays gone.
            let file = OpenOptions::new().write(true).open(&path)?;
            file.write_all_at(&data, offset)
        })
        .await;

        let mut s = session.lock().await;
        if s.state.is_terminal() {
            return Err(FileError::Conflict(format!("upload is {}", s.state)));
        }
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(FileError::io(e, &temp_path)),
            Err(e) => {
                return Err(FileError::internal(
                    format!("chunk writer failed: {e}"),
                    Some(&temp_path),
                ))
            }
        }

        if s.received.insert(index) {
            s.received_bytes += len;
        }
        s.updated_at = Instant::now();
        debug!(session_id = %id, chunk = index, received = s.received.len(), "Chunk stored");
        Ok(s.status())
    }

    /// Commit a complete upload to `destination`.
    ///
    /// The destination is authorized now, not when the session started. An
    /// authorization failure, checksum mismatch or commit error cancels the
    /// session. An existing destination leaves it receiving.
    pub async fn finalize(
        &self,
        ctx: &SecurityContext,
        id: &str,
        destination: &Path,
        sha256: Option<&str>,
    ) -> FileResult<PathBuf> {
        let session = self.session(id)?;
        let mut s = session.lock().await;
        s.check_owner(ctx)?;
        s.check_writable()?;
        if s.in_flight.load(Ordering::SeqCst) > 0 {
            return Err(FileError::Conflict(
                "chunks are still being written".to_string(),
            ));
        }
        if !s.is_complete() {
            return Err(FileError::BadRequest(format!(
                "upload incomplete: {} of {} chunks, {} of {} bytes",
                s.received.len(),
                s.total_chunks,
                s.received_bytes,
                s.total_size
            )));
        }

        s.state = UploadState::Finalizing;
        s.updated_at = Instant::now();

        let ctx_owned = ctx.clone();
        let temp_path = s.temp_path.clone();
        let destination = destination.to_path_buf();
        let expected = sha256.map(str::to_string);
        let reserve = self.min_free_space;
        let outcome = tokio::task::spawn_blocking(move || {
            commit(&ctx_owned, &temp_path, &destination, expected.as_deref(), reserve)
        })
        .await
        .unwrap_or_else(|e| {
            Err(FinalizeError::Abort(FileError::internal(
                format!("finalize task failed: {e}"),
                None,
            )))
        });

        match outcome {
            Ok(target) => {
                s.finish(UploadState::Completed);
                info!(
                    session_id = %id,
                    user = %ctx.user().username,
                    file_name = %s.file_name,
                    path = %target.display(),
                    bytes = s.total_size,
                    "Upload completed"
                );
                Ok(target)
            }
            Err(FinalizeError::Retry(err)) => {
                s.state = UploadState::Receiving;
                debug!(session_id = %id, error = %err, "Finalize rejected, session kept");
                Err(err)
            }
            Err(FinalizeError::Abort(err)) => {
                s.finish(UploadState::Cancelled);
                warn!(session_id = %id, user = %ctx.user().username, error = %err, "Upload aborted during finalize");
                Err(err)
            }
        }
    }

    /// Abandon a session and delete its data.
    ///
    /// Cancelling an already cancelled or expired session succeeds.
    pub async fn cancel(&self, ctx: &SecurityContext, id: &str) -> FileResult<UploadStatus> {
        let session = self.session(id)?;
        let mut s = session.lock().await;
        s.check_owner(ctx)?;
        match s.state {
            UploadState::Cancelled | UploadState::Expired => {}
            UploadState::Completed => {
                return Err(FileError::Conflict("upload already completed".to_string()))
            }
            _ => {
                s.finish(UploadState::Cancelled);
                info!(session_id = %id, user = %ctx.user().username, "Upload cancelled");
            }
        }
        Ok(s.status())
    }

    /// Progress of a session.
    pub async fn status(&self, ctx: &SecurityContext, id: &str) -> FileResult<UploadStatus> {
        let session = self.session(id)?;
        let s = session.lock().await;
        s.check_owner(ctx)?;
        Ok(s.status())
    }

    /// Write `data` as a new file `file_name` inside `directory` in one step.
    ///
    /// The directory is authorized for writing up front. An existing file is
    /// never replaced, and a failed write leaves nothing behind.
    pub async fn upload_file(
        &self,
        ctx: &SecurityContext,
        directory: &Path,
        file_name: &str,
        data: Vec<u8>,
    ) -> FileResult<PathBuf> {
        validate_file_name(file_name)?;
        self.check_size(data.len() as u64)?;

        let ctx_owned = ctx.clone();
        let directory = directory.to_path_buf();
        let file_name = file_name.to_string();
        let reserve = self.min_free_space;
        let target = tokio::task::spawn_blocking(move || {
            write_new_file(&ctx_owned, &directory, &file_name, &data, reserve)
        })
        .await
        .map_err(|e| FileError::internal(format!("upload task failed: {e}"), None))??;

        info!(
            user = %ctx.user().username,
            path = %target.display(),
            "File uploaded"
        );
        Ok(target)
    }

    /// Expire sessions started more than the TTL before `now` and forget
    /// tombstones that have been terminal for longer than the TTL.
    ///
    /// Sessions busy finalizing are left for the next pass. Returns the
    /// number of sessions expired.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        let sessions: Vec<(String, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut expired = 0;
        let mut forget = Vec::new();
        for (id, session) in sessions {
            let Ok(mut s) = session.try_lock() else {
                continue;
            };
            match s.finished_at {
                Some(finished) => {
                    if now.saturating_duration_since(finished) >= self.ttl {
                        forget.push(id);
                    }
                }
                None if now.saturating_duration_since(s.created_at) >= self.ttl => {
                    let idle_secs = now.saturating_duration_since(s.updated_at).as_secs();
                    s.finish(UploadState::Expired);
                    s.finished_at = Some(now);
                    expired += 1;
                    info!(session_id = %id, owner = %s.owner, idle_secs, "Upload session expired");
                }
                None => {}
            }
        }

        for id in forget {
            if self.sessions.remove(&id).is_some() {
                debug!(session_id = %id, "Dropped finished upload session");
            }
        }
        expired
    }

    /// Run one reaper pass now.
    pub async fn cleanup(&self) -> usize {
        self.reap_expired(Instant::now()).await
    }

    /// Spawn the periodic reaper. It stops when `shutdown` is cancelled.
    pub fn start_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Upload reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired = manager.cleanup().await;
                        if expired > 0 {
                            info!(expired, "Reaped stale uploads");
                        }
                    }
                }
            }
        })
    }

    /// Delete partial files in the quarantine directory that no live session
    /// owns. Returns how many were removed.
    pub fn purge_orphans(&self) -> FileResult<usize> {
        let entries = fs::read_dir(&self.temp_dir).map_err(|e| FileError::io(e, &self.temp_dir))?;
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| FileError::io(e, &self.temp_dir))?;
            let path = entry.path();
            let owned = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|id| self.sessions.contains_key(id));
            if owned {
                continue;
            }

            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            let result = if is_dir {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = ?path, error = %e, "Failed to remove orphaned upload data"),
            }
        }
        if removed > 0 {
            info!(removed, dir = %self.temp_dir.display(), "Purged orphaned upload data");
        }
        Ok(removed)
    }
}

/// Authorize, verify and commit the quarantined file.
fn commit(
    ctx: &SecurityContext,
    temp_path: &Path,
    destination: &Path,
    expected_sha256: Option<&str>,
    reserve: u64,
) -> Result<PathBuf, FinalizeError> {
    let auth = PathAuthorizer::new(ctx);
    let target = auth.authorize_for_creation(destination).map_err(|e| match e {
        FileError::Forbidden(_) => FinalizeError::Abort(e),
        other => FinalizeError::Retry(other),
    })?;

    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FinalizeError::Retry(FileError::BadRequest("invalid destination name".to_string())))?;
    validate_file_name(name).map_err(FinalizeError::Retry)?;

    let parent = target.parent().unwrap_or(Path::new("/"));
    let parent_meta = match fs::metadata(parent) {
        Ok(meta) if meta.is_dir() => meta,
        Ok(_) => {
            return Err(FinalizeError::Retry(FileError::BadRequest(format!(
                "{} is not a directory",
                parent.display()
            ))))
        }
        Err(e) => return Err(FinalizeError::Retry(FileError::io(e, parent))),
    };
    if fs::symlink_metadata(&target).is_ok() {
        return Err(FinalizeError::Retry(FileError::Conflict(format!(
            "{} already exists",
            target.display()
        ))));
    }

    if let Some(expected) = expected_sha256 {
        let actual = hash_file(temp_path)
            .map_err(|e| FinalizeError::Abort(FileError::io(e, temp_path)))?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(FinalizeError::Abort(FileError::BadRequest(format!(
                "checksum mismatch: expected {expected}, got {actual}"
            ))));
        }
    }

    // A link on the quarantine volume needs no new space; a copy does.
    let temp_meta =
        fs::metadata(temp_path).map_err(|e| FinalizeError::Abort(FileError::io(e, temp_path)))?;
    if temp_meta.dev() != parent_meta.dev() {
        ensure_free_space(parent, temp_meta.len().saturating_add(reserve))
            .map_err(FinalizeError::Retry)?;
    }

    fs::set_permissions(temp_path, Permissions::from_mode(DEFAULT_UPLOAD_MODE))
        .map_err(|e| FinalizeError::Abort(FileError::io(e, temp_path)))?;

    // A hard link never replaces an existing entry.
    match fs::hard_link(temp_path, &target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(FinalizeError::Retry(FileError::Conflict(format!(
                "{} already exists",
                target.display()
            ))));
        }
        Err(e) => {
            debug!(to = %target.display(), error = %e, "Link failed, copying upload");
            copy_no_clobber(temp_path, &target)?;
        }
    }
    discard_temp(temp_path);
    Ok(target)
}

fn copy_no_clobber(from: &Path, to: &Path) -> Result<(), FinalizeError> {
    let mut source = File::open(from).map_err(|e| FinalizeError::Abort(FileError::io(e, from)))?;
    let mut dest = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(DEFAULT_UPLOAD_MODE)
        .open(to)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(FinalizeError::Retry(FileError::Conflict(format!(
                "{} already exists",
                to.display()
            ))));
        }
        Err(e) => return Err(FinalizeError::Abort(FileError::io(e, to))),
    };

    if let Err(e) = io::copy(&mut source, &mut dest).and_then(|_| dest.sync_all()) {
        drop(dest);
        if let Err(cleanup) = fs::remove_file(to) {
            warn!(path = ?to, error = %cleanup, "Failed to remove partial upload copy");
        }
        return Err(FinalizeError::Abort(FileError::io(e, to)));
    }
    Ok(())
}

/// Create `directory/file_name` with `data`, refusing to replace anything.
fn write_new_file(
    ctx: &SecurityContext,
    directory: &Path,
    file_name: &str,
    data: &[u8],
    reserve: u64,
) -> FileResult<PathBuf> {
    let auth = PathAuthorizer::new(ctx);
    let directory = auth.authorize(directory, Access::Write)?;
    if !directory.is_dir() {
        return Err(FileError::BadRequest(format!(
            "{} is not a directory",
            directory.display()
        )));
    }
    let target = auth.authorize_for_creation(&directory.join(file_name))?;
    ensure_free_space(&directory, (data.len() as u64).saturating_add(reserve))?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(DEFAULT_UPLOAD_MODE)
        .open(&target)
        .map_err(|e| FileError::io(e, &target))?;
    if let Err(e) = file.write_all(data).and_then(|()| file.sync_all()) {
        drop(file);
        discard_temp(&target);
        return Err(FileError::io(e, &target));
    }
    Ok(target)
}

/// Refuse when the volume holding `path` has fewer than `required` bytes
/// available to unprivileged users.
fn ensure_free_space(path: &Path, required: u64) -> FileResult<()> {
    let stats = statvfs(path).map_err(|e| FileError::io(io::Error::from(e), path))?;
    let available = (stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64);
    if available < required {
        warn!(path = %path.display(), required, available, "Not enough free space for upload");
        return Err(FileError::InsufficientStorage(format!(
            "{required} bytes required, {available} available"
        )));
    }
    Ok(())
}

fn discard_temp(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to cleanup upload temp file"),
    }
}

/// Hex-encoded SHA-256 of a file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
