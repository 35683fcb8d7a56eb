//! API key middleware.

use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use termhub_protocol::http::API_KEY_HEADER;
use tracing::debug;

use super::error::ApiError;
use super::state::AppState;
use crate::error::Error;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyQuery {
    api_key: Option<String>,
}

/// Require the configured API key in the `X-API-Key` header, or in the
/// `apiKey` query parameter for WebSocket upgrades.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(ref expected) = state.api_key else {
        return Ok(next.run(req).await);
    };

    let header_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let query_key = Query::<ApiKeyQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.api_key);

    match header_key.or(query_key) {
        Some(ref provided) if keys_match(provided, expected) => Ok(next.run(req).await),
        Some(_) => {
            debug!("Rejected request to {} with wrong API key", req.uri().path());
            Err(Error::Auth("wrong API key".to_string()).into())
        }
        None => Err(Error::Auth("missing API key".to_string()).into()),
    }
}

/// Compares SHA-256 digests of both keys.
fn keys_match(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}
