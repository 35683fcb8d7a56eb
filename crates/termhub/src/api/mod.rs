//! HTTP API module.
//!
//! The request/response surface, file management, the WebSocket upgrade and
//! the operator pool endpoints.

mod auth;
mod error;
pub mod files;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
