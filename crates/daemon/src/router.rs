//! Request router for dispatching file, archive and upload messages.
//!
//! The router resolves a fresh [`SecurityContext`] for every request from the
//! authenticated user and the current share list, then hands the typed
//! request to [`FileService`], [`ArchiveEngine`] or
//! [`UploadSessionManager`]. Synchronous services run on the blocking pool.
//! Every failure comes back as [`Message::Error`].

use std::path::PathBuf;
use std::sync::Arc;

use protocol::messages::{
    ChangePermissionsRequest, CopyMoveRequest, CreateArchiveRequest, CreateDirectoryRequest,
    DeleteRequest, DeleteResponse, ExtractArchiveRequest, FinalizeUploadRequest, PathOutcome,
    PathResponse, RenameRequest, UploadFileRequest,
};
use protocol::{Envelope, Message, User};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{FileError, FileResult};
use crate::files::{ArchiveEngine, FileService, PermissionChange, UploadSessionManager};
use crate::security::{PathAuthorizer, SecurityContext};
use crate::shares::ShareRegistry;

/// Dispatches request messages to the file services.
pub struct RequestRouter {
    registry: Arc<dyn ShareRegistry>,
    files: FileService,
    archives: ArchiveEngine,
    uploads: Arc<UploadSessionManager>,
}

impl RequestRouter {
    /// Create a router over the given share registry and upload manager.
    pub fn new(registry: Arc<dyn ShareRegistry>, uploads: Arc<UploadSessionManager>) -> Self {
        Self {
            registry,
            files: FileService::new(),
            archives: ArchiveEngine::new(),
            uploads,
        }
    }

    /// Upload manager shared with the reaper.
    pub fn uploads(&self) -> &Arc<UploadSessionManager> {
        &self.uploads
    }

    /// Resolve the caller's context against the current share list.
    pub fn security_context(&self, user: &User) -> FileResult<SecurityContext> {
        let shares = self.registry.list_shares().map_err(|e| {
            error!(error = %e, "Failed to list shares");
            FileError::internal("share registry unavailable", None)
        })?;
        Ok(SecurityContext::resolve(user, &shares))
    }

    /// Route one request and produce its response.
    ///
    /// `user` is the authenticated caller; `None` yields `Unauthorized`.
    /// `cancel` is tied to the request and aborts long-running operations.
    pub async fn route(
        &self,
        user: Option<&User>,
        message: Message,
        cancel: &CancellationToken,
    ) -> Message {
        let context = request_context(&message);
        let Some(user) = user else {
            return Message::Error(FileError::Unauthorized.to_error_message(context));
        };
        debug!(user = %user.username, request = request_kind(&message), "Routing request");

        let result = match self.security_context(user) {
            Ok(ctx) => self.dispatch(Arc::new(ctx), message, cancel).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(response) => response,
            Err(err) => {
                log_failure(user, &err);
                Message::Error(err.to_error_message(context))
            }
        }
    }

    /// Route an enveloped request, answering with the same request id.
    pub async fn handle_envelope(
        &self,
        user: Option<&User>,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Envelope {
        let request_id = envelope.request_id;
        let response = self.route(user, envelope.payload, cancel).await;
        Envelope::new(request_id, response)
    }

    async fn dispatch(
        &self,
        ctx: Arc<SecurityContext>,
        message: Message,
        cancel: &CancellationToken,
    ) -> FileResult<Message> {
        match message {
            Message::Browse(req) => {
                let path = PathAuthorizer::new(&ctx).resolve_request_path(&req.path, req.share.as_deref())?;
                let files = self.files.clone();
                let listing =
                    blocking(ctx, move |ctx| files.browse(ctx, &path, req.show_hidden)).await?;
                Ok(Message::BrowseResult(listing))
            }
            Message::GetFileInfo(req) => {
                let path = resolve(&ctx, &req.path)?;
                let files = self.files.clone();
                let entry = blocking(ctx, move |ctx| files.file_info(ctx, &path)).await?;
                Ok(Message::FileInfo(entry))
            }
            Message::CreateDirectory(CreateDirectoryRequest { path, name, mode }) => {
                let parent = resolve(&ctx, &path)?;
                let files = self.files.clone();
                let created = blocking(ctx, move |ctx| {
                    files.create_directory(ctx, &parent, &name, mode.as_deref())
                })
                .await?;
                Ok(path_result(created))
            }
            Message::Delete(req) => self.delete(ctx, req).await,
            Message::Rename(RenameRequest { old_path, new_name }) => {
                let old_path = resolve(&ctx, &old_path)?;
                let files = self.files.clone();
                let renamed =
                    blocking(ctx, move |ctx| files.rename(ctx, &old_path, &new_name)).await?;
                Ok(path_result(renamed))
            }
            Message::Copy(CopyMoveRequest { source, destination }) => {
                let source = resolve(&ctx, &source)?;
                let destination = resolve(&ctx, &destination)?;
                let files = self.files.clone();
                let summary =
                    blocking(ctx, move |ctx| files.copy(ctx, &source, &destination)).await?;
                Ok(Message::CopyResult(summary))
            }
            Message::Move(CopyMoveRequest { source, destination }) => {
                let source = resolve(&ctx, &source)?;
                let destination = resolve(&ctx, &destination)?;
                let files = self.files.clone();
                let moved =
                    blocking(ctx, move |ctx| files.move_entry(ctx, &source, &destination)).await?;
                Ok(path_result(moved))
            }
            Message::GetPermissions(req) => {
                let path = resolve(&ctx, &req.path)?;
                let files = self.files.clone();
                let info = blocking(ctx, move |ctx| files.permissions(ctx, &path)).await?;
                Ok(Message::Permissions(info))
            }
            Message::ChangePermissions(ChangePermissionsRequest {
                path,
                mode,
                owner,
                group,
                recursive,
            }) => {
                let path = resolve(&ctx, &path)?;
                let change = PermissionChange {
                    mode,
                    owner,
                    group,
                    recursive,
                };
                let files = self.files.clone();
                let info =
                    blocking(ctx, move |ctx| files.change_permissions(ctx, &path, &change)).await?;
                Ok(Message::Permissions(info))
            }
            Message::GetDiskUsage(req) => {
                let path = resolve(&ctx, &req.path)?;
                let files = self.files.clone();
                let cancel = cancel.clone();
                let usage = blocking(ctx, move |ctx| files.disk_usage(ctx, &path, &cancel)).await?;
                Ok(Message::DiskUsage(usage))
            }
            Message::CreateArchive(CreateArchiveRequest {
                sources,
                destination,
                format,
            }) => {
                let sources = sources
                    .iter()
                    .map(|s| resolve(&ctx, s))
                    .collect::<FileResult<Vec<_>>>()?;
                let destination = resolve(&ctx, &destination)?;
                let archives = self.archives.clone();
                let cancel = cancel.clone();
                let summary = blocking(ctx, move |ctx| {
                    archives.create_archive(ctx, &sources, &destination, format, &cancel)
                })
                .await?;
                Ok(Message::ArchiveResult(summary))
            }
            Message::ExtractArchive(ExtractArchiveRequest {
                archive,
                destination,
            }) => {
                let archive = resolve(&ctx, &archive)?;
                let destination = resolve(&ctx, &destination)?;
                let archives = self.archives.clone();
                let cancel = cancel.clone();
                let summary = blocking(ctx, move |ctx| {
                    archives.extract_archive(ctx, &archive, &destination, &cancel)
                })
                .await?;
                Ok(Message::ExtractResult(summary))
            }
            Message::StartUpload(req) => {
                let status = self.uploads.start(&ctx, &req.file_name, req.total_size).await?;
                Ok(Message::UploadStatus(status))
            }
            Message::UploadChunk(req) => {
                let status = self
                    .uploads
                    .upload_chunk(&ctx, &req.session_id, req.chunk_index, req.data)
                    .await?;
                Ok(Message::UploadStatus(status))
            }
            Message::FinalizeUpload(FinalizeUploadRequest {
                session_id,
                destination,
                sha256,
            }) => {
                let destination = resolve(&ctx, &destination)?;
                let committed = self
                    .uploads
                    .finalize(&ctx, &session_id, &destination, sha256.as_deref())
                    .await?;
                Ok(path_result(committed))
            }
            Message::CancelUpload(req) => {
                let status = self.uploads.cancel(&ctx, &req.session_id).await?;
                Ok(Message::UploadStatus(status))
            }
            Message::GetUploadSession(req) => {
                let status = self.uploads.status(&ctx, &req.session_id).await?;
                Ok(Message::UploadStatus(status))
            }
            Message::UploadFile(UploadFileRequest {
                directory,
                file_name,
                data,
            }) => {
                let directory = resolve(&ctx, &directory)?;
                let written = self
                    .uploads
                    .upload_file(&ctx, &directory, &file_name, data)
                    .await?;
                Ok(path_result(written))
            }
            Message::BrowseResult(_)
            | Message::FileInfo(_)
            | Message::PathResult(_)
            | Message::DeleteResult(_)
            | Message::CopyResult(_)
            | Message::Permissions(_)
            | Message::DiskUsage(_)
            | Message::ArchiveResult(_)
            | Message::ExtractResult(_)
            | Message::UploadStatus(_)
            | Message::Error(_) => Err(FileError::BadRequest(
                "response messages cannot be used as requests".to_string(),
            )),
        }
    }

    async fn delete(&self, ctx: Arc<SecurityContext>, req: DeleteRequest) -> FileResult<Message> {
        if req.paths.is_empty() {
            return Err(FileError::BadRequest("no paths given".to_string()));
        }

        let mut outcomes: Vec<Option<FileError>> = Vec::with_capacity(req.paths.len());
        let mut resolved = Vec::new();
        for requested in &req.paths {
            match resolve(&ctx, requested) {
                Ok(path) => {
                    resolved.push(path);
                    outcomes.push(None);
                }
                Err(e) => outcomes.push(Some(e)),
            }
        }

        let files = self.files.clone();
        let recursive = req.recursive;
        let user = ctx.user().clone();
        let mut deleted =
            blocking(ctx, move |ctx| Ok(files.delete(ctx, &resolved, recursive))).await?.into_iter();

        let results = req
            .paths
            .into_iter()
            .zip(outcomes)
            .map(|(path, resolve_error)| {
                let error = match resolve_error {
                    Some(e) => Some(e),
                    None => deleted.next().and_then(|(_, result)| result.err()),
                };
                if let Some(e) = &error {
                    log_failure(&user, e);
                }
                PathOutcome {
                    error: error.map(|e| e.to_error_message(Some(path.clone()))),
                    path,
                }
            })
            .collect();

        Ok(Message::DeleteResult(DeleteResponse { results }))
    }
}

/// Run a synchronous service call on the blocking pool.
async fn blocking<T, F>(ctx: Arc<SecurityContext>, f: F) -> FileResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SecurityContext) -> FileResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&ctx))
        .await
        .map_err(|e| FileError::internal(format!("worker task failed: {e}"), None))?
}

fn resolve(ctx: &SecurityContext, requested: &str) -> FileResult<PathBuf> {
    PathAuthorizer::new(ctx).resolve_request_path(requested, None)
}

fn path_result(path: PathBuf) -> Message {
    Message::PathResult(PathResponse {
        path: path.to_string_lossy().to_string(),
    })
}

fn log_failure(user: &User, err: &FileError) {
    match err {
        FileError::Internal {
            message,
            path,
            source,
        } => error!(
            user = %user.username,
            path = ?path,
            error = ?source,
            message = %message,
            "Internal error"
        ),
        FileError::Forbidden(reason) => {
            warn!(user = %user.username, reason = %reason, "Access denied")
        }
        other => debug!(user = %user.username, error = %other, "Request rejected"),
    }
}

/// Path or session id the request is about, echoed in error responses.
fn request_context(message: &Message) -> Option<String> {
    match message {
        Message::Browse(req) => Some(req.path.clone()),
        Message::GetFileInfo(req) | Message::GetPermissions(req) | Message::GetDiskUsage(req) => {
            Some(req.path.clone())
        }
        Message::CreateDirectory(req) => Some(req.path.clone()),
        Message::Rename(req) => Some(req.old_path.clone()),
        Message::Copy(req) | Message::Move(req) => Some(req.source.clone()),
        Message::ChangePermissions(req) => Some(req.path.clone()),
        Message::CreateArchive(req) => Some(req.destination.clone()),
        Message::ExtractArchive(req) => Some(req.archive.clone()),
        Message::UploadChunk(req) => Some(req.session_id.clone()),
        Message::FinalizeUpload(req) => Some(req.session_id.clone()),
        Message::CancelUpload(req) | Message::GetUploadSession(req) => {
            Some(req.session_id.clone())
        }
        Message::UploadFile(req) => Some(req.directory.clone()),
        _ => None,
    }
}

fn request_kind(message: &Message) -> &'static str {
    match message {
        Message::Browse(_) => "browse",
        Message::GetFileInfo(_) => "get_file_info",
        Message::CreateDirectory(_) => "create_directory",
        Message::Delete(_) => "delete",
        Message::Rename(_) => "rename",
        Message::Copy(_) => "copy",
        Message::Move(_) => "move",
        Message::GetPermissions(_) => "get_permissions",
        Message::ChangePermissions(_) => "change_permissions",
        Message::GetDiskUsage(_) => "get_disk_usage",
        Message::CreateArchive(_) => "create_archive",
        Message::ExtractArchive(_) => "extract_archive",
        Message::StartUpload(_) => "start_upload",
        Message::UploadChunk(_) => "upload_chunk",
        Message::FinalizeUpload(_) => "finalize_upload",
        Message::CancelUpload(_) => "cancel_upload",
        Message::GetUploadSession(_) => "get_upload_session",
        Message::UploadFile(_) => "upload_file",
        _ => "response",
    }
}
