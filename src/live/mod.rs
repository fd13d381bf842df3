//! Transport to the remote conversational audio service.

pub mod client;
pub mod protocol;

pub use client::{Connector, GeminiConnector, SessionHandle};
pub use protocol::{Blob, MediaInput, ServerEvent, Setup};
