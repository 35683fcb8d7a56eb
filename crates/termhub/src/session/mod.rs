//! Session management module.
//!
//! Handles the lifecycle of user sessions: creation (optionally from
//! pre-warmed handles), liveness, expiry, renewal and cleanup.

mod models;
mod registry;

pub use models::{Expiration, Session, SessionState};
pub use registry::{RegistryConfig, SessionRegistry};
