//! Request/response bodies for the buffered HTTP surface.
//!
//! The shapes here are a fixed contract; clients match on the exact field
//! names and status codes.

use serde::{Deserialize, Serialize};

/// Header carrying the session id on execute/get/delete requests.
pub const SESSION_ID_HEADER: &str = "X-Session-Id";

/// Optional header identifying the client device when no user id is supplied.
pub const DEVICE_ID_HEADER: &str = "X-Device-Id";

/// Header carrying the API key when authentication is enabled.
pub const API_KEY_HEADER: &str = "X-API-Key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// `200` body of `POST /create-session`. `expires_in` is in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub user_id: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandRequest {
    pub command: String,
}

/// `200` body of `POST /execute-command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandResponse {
    pub output: String,
    pub exit_code: i32,
}

/// `400` body of `POST /execute-command` when the command exits non-zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailedResponse {
    pub error: String,
    pub exit_code: i32,
}

/// Bare error body (`503` on pool exhaustion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error body that tells the client whether retrying can help.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryableErrorResponse {
    pub error: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// `200` body of `GET /session`. Timestamps are RFC 3339, `expires_in` is the
/// remaining idle time in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub user_id: String,
    pub created: String,
    pub last_accessed: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub version: String,
}

/// One container slot as reported by `GET /pool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSummary {
    pub container_id: String,
    pub state: String,
    pub load: usize,
    pub capacity: usize,
    pub accounts: usize,
}

/// `path` parameter of the file endpoints, relative to the session root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePathQuery {
    #[serde(default)]
    pub path: String,
}

/// One entry of a directory listing. `modified` is RFC 3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: String,
}

/// `200` body of `GET /files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub path: String,
    pub files: Vec<FileInfo>,
}

/// `200` body of `POST /files/upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub path: String,
    pub name: String,
    pub size: u64,
}

/// `200` body of `POST /files/mkdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMessageResponse {
    pub message: String,
    pub path: String,
}
