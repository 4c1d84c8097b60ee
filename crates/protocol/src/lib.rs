//! DomLens Protocol
//!
//! Shared types for communication between the DomLens broker and the
//! browser extension. These types are serialized as JSON over WebSocket.

use uuid::Uuid;

pub mod command;
pub mod extension;
pub mod types;

pub use command::ExtensionCommand;
pub use extension::ExtensionMessage;
pub use types::*;

/// Generate a new unique ID (correlation ids, snapshot ids)
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
