//! File management endpoints.
//!
//! Paths are relative to the session root; `~/x` and absolute paths under the
//! root are accepted as well. Each path is checked lexically, then again with
//! symlinks resolved inside the handle, before the backend touches it. Every
//! accepted path is written to the `audit` target.

use std::path::{Path, PathBuf};

use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use termhub_protocol::http::{
    FileInfo, FilePathQuery, ListFilesResponse, MessageResponse, PathMessageResponse,
    SESSION_ID_HEADER, UploadResponse,
};
use tracing::{debug, info, instrument};

use super::error::{ApiError, ApiResult};
use super::handlers::{header, parse_body};
use super::state::AppState;
use crate::error::Error;
use crate::exec::builtins::resolve_lexical;
use crate::exec::check_real_paths;
use crate::isolation::FileKind;
use crate::session::Session;

/// Request body limit of `POST /files/upload`.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

async fn file_session(state: &AppState, headers: &HeaderMap) -> ApiResult<Session> {
    let session_id = header(headers, SESSION_ID_HEADER)
        .ok_or_else(|| ApiError::bad_request("Session ID is required"))?;
    Ok(state.registry().touch(session_id).await?)
}

fn denied(err: Error) -> ApiError {
    match err {
        Error::AccessDenied(_) => {
            ApiError::Forbidden("Access denied: path outside user directory".to_string())
        }
        other => other.into(),
    }
}

/// Resolve a client path under the session root and record the access.
async fn resolve(
    state: &AppState,
    session: &Session,
    arg: &str,
    method: &str,
) -> ApiResult<PathBuf> {
    let root = &session.handle.root;
    let path = resolve_lexical(root, root, arg).map_err(denied)?;
    contain(state, session, &path).await?;
    info!(
        target: "audit",
        session_id = %session.id,
        user_id = %session.user_id,
        method,
        path = %path.display(),
        "file access"
    );
    Ok(path)
}

async fn contain(state: &AppState, session: &Session, path: &Path) -> ApiResult<()> {
    let backend = state.registry().backend();
    check_real_paths(backend.as_ref(), &session.handle, &[path.to_path_buf()])
        .await
        .map_err(denied)
}

/// `path` relative to `root`, `""` for the root itself.
fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .map(|rel| rel.display().to_string())
        .unwrap_or_default()
}

/// Keep the last path component and drop characters that are unsafe in file
/// names. `None` when nothing usable is left.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// List a directory.
///
/// GET /files?path=
#[instrument(skip(state, headers))]
pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FilePathQuery>,
) -> ApiResult<Json<ListFilesResponse>> {
    let session = file_session(&state, &headers).await?;
    let path = resolve(&state, &session, &query.path, "GET").await?;
    let backend = state.registry().backend();

    match backend.file_kind(&session.handle, &path).await? {
        None => return Err(ApiError::not_found("Path does not exist")),
        Some(FileKind::File) => {
            return Err(ApiError::bad_request("Path is a file, not a directory"));
        }
        Some(FileKind::Dir) => {}
    }

    let root = &session.handle.root;
    let files = backend
        .list_dir(&session.handle, &path)
        .await?
        .into_iter()
        .map(|entry| FileInfo {
            path: relative(root, &path.join(&entry.name)),
            is_dir: entry.kind == FileKind::Dir,
            size: entry.size,
            modified: entry.modified.to_rfc3339(),
            name: entry.name,
        })
        .collect();

    Ok(Json(ListFilesResponse {
        path: query.path,
        files,
    }))
}

/// Download a file as an attachment.
///
/// GET /files/download?path=
#[instrument(skip(state, headers))]
pub async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FilePathQuery>,
) -> ApiResult<Response> {
    let session = file_session(&state, &headers).await?;
    if query.path.is_empty() {
        return Err(ApiError::bad_request("Path is required"));
    }
    let path = resolve(&state, &session, &query.path, "GET").await?;
    let backend = state.registry().backend();

    match backend.file_kind(&session.handle, &path).await? {
        None => return Err(ApiError::not_found("File does not exist")),
        Some(FileKind::Dir) => return Err(ApiError::bad_request("Path is not a file")),
        Some(FileKind::File) => {}
    }

    let data = backend.read_file(&session.handle, &path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().replace('"', "'"))
        .unwrap_or_else(|| "download".to_string());
    debug!(bytes = data.len(), path = %path.display(), "Sending file");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        data,
    )
        .into_response())
}

/// Store an uploaded file in a directory, creating the directory if needed.
///
/// POST /files/upload (multipart: `path`, `file`)
#[instrument(skip(state, headers, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let session = file_session(&state, &headers).await?;

    let mut dir = String::new();
    let mut upload: Option<(String, Bytes)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid upload: {e}")))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("path") => {
                dir = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid upload: {e}")))?;
            }
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid upload: {e}")))?;
                upload = Some((name, data));
            }
            _ => {}
        }
    }

    let (raw_name, data) = upload.ok_or_else(|| ApiError::bad_request("No file part"))?;
    let name = sanitize_filename(&raw_name).ok_or_else(|| ApiError::bad_request("No selected file"))?;

    let dir = resolve(&state, &session, &dir, "POST").await?;
    let target = dir.join(&name);
    contain(&state, &session, &target).await?;

    let backend = state.registry().backend();
    if backend.file_kind(&session.handle, &target).await? == Some(FileKind::Dir) {
        return Err(ApiError::bad_request("Path is not a file"));
    }
    backend.write_file(&session.handle, &target, &data).await?;

    info!(session_id = %session.id, path = %target.display(), bytes = data.len(), "Uploaded file");
    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
        path: relative(&session.handle.root, &target),
        name,
        size: data.len() as u64,
    }))
}

/// Delete a file or a directory tree.
///
/// DELETE /files?path=
#[instrument(skip(state, headers))]
pub async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FilePathQuery>,
) -> ApiResult<Json<MessageResponse>> {
    let session = file_session(&state, &headers).await?;
    if query.path.is_empty() {
        return Err(ApiError::bad_request("Path is required"));
    }
    let path = resolve(&state, &session, &query.path, "DELETE").await?;
    if path == session.handle.root {
        return Err(ApiError::bad_request("Refusing to remove the home directory"));
    }

    let backend = state.registry().backend();
    let message = match backend.file_kind(&session.handle, &path).await? {
        None => return Err(ApiError::not_found("Path does not exist")),
        Some(FileKind::File) => "File deleted successfully",
        Some(FileKind::Dir) => "Directory deleted successfully",
    };
    backend.remove_path(&session.handle, &path).await?;

    Ok(Json(MessageResponse {
        message: message.to_string(),
    }))
}

/// Create a directory and any missing parents.
///
/// POST /files/mkdir
#[instrument(skip(state, headers, body))]
pub async fn make_directory(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<PathMessageResponse>> {
    let session = file_session(&state, &headers).await?;
    let request: FilePathQuery = parse_body(&body)?;
    let path = resolve(&state, &session, &request.path, "POST").await?;

    state
        .registry()
        .backend()
        .create_dir(&session.handle, &path)
        .await?;

    Ok(Json(PathMessageResponse {
        message: "Directory created successfully".to_string(),
        path: relative(&session.handle.root, &path),
    }))
}
