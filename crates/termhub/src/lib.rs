//! termhub: multi-tenant command execution over isolated user environments.
//!
//! Users get sessions ([`session`]) bound to an isolated environment
//! ([`isolation`], backed by a container [`pool`] or host directories), run
//! commands in them ([`exec`]) and receive output over a WebSocket channel
//! ([`gateway`]) or a buffered HTTP surface ([`api`]).

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod container;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod isolation;
pub mod pool;
pub mod session;

pub use error::{Error, Result};
