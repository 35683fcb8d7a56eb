//! Wire types for termhub.
//!
//! Two surfaces share these definitions:
//!
//! ```text
//! Client <--[WS: ClientEvent / ServerEvent]--> termhub <--> isolation backend
//! Client <--[HTTP: request/response bodies]--> termhub
//! ```
//!
//! The persistent channel streams command output as it is produced. The HTTP
//! surface performs the same create/execute/destroy operations but only returns
//! the fully buffered result.

pub mod events;
pub mod http;

pub use events::{ClientEvent, ServerEvent};
