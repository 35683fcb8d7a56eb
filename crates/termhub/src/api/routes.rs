use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Router, middleware};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::auth::require_api_key;
use super::files::{self, MAX_UPLOAD_BYTES};
use super::handlers;
use super::state::AppState;
use crate::gateway::ws_handler;

/// HTTP fallback API, file management, the `/ws` channel and the operator
/// pool endpoints.
///
/// Everything except `/health` sits behind the API key check.
pub fn create_router(state: AppState) -> Router {
    let keyed = Router::new()
        .route("/create-session", post(handlers::create_session))
        .route("/execute-command", post(handlers::execute_command))
        .route(
            "/session",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/files",
            get(files::list_files).delete(files::delete_file),
        )
        .route("/files/download", get(files::download_file))
        .route(
            "/files/upload",
            post(files::upload_file).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/files/mkdir", post(files::make_directory))
        .route("/ws", get(ws_handler))
        .route("/pool", get(handlers::list_pool))
        .route("/pool/{container_id}/drain", post(handlers::drain_slot))
        .route("/pool/{container_id}/recover", post(handlers::recover_slot))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(keyed)
        .layer(cors(&state.allowed_origins))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Any origin when none are configured; unparsable entries are skipped.
fn cors(allowed: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("x-session-id"),
            HeaderName::from_static("x-device-id"),
            HeaderName::from_static("x-api-key"),
        ]);
    if allowed.is_empty() {
        return layer.allow_origin(Any);
    }

    let mut origins = Vec::with_capacity(allowed.len());
    for origin in allowed {
        match HeaderValue::from_str(origin) {
            Ok(value) => origins.push(value),
            Err(_) => tracing::warn!(%origin, "ignoring malformed CORS origin"),
        }
    }
    if origins.is_empty() {
        tracing::error!("no usable CORS origin configured; cross-origin requests will fail");
    }
    layer.allow_origin(AllowOrigin::list(origins))
}
