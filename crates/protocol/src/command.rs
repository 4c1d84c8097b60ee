//! Broker → Extension commands

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Commands sent from the broker to the browser extension.
/// Capture commands carry a correlation id that the response echoes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionCommand {
    /// Capture a specific element and its context
    Inspect {
        id: String,
        params: Value,
    },
    /// Enter click-to-select mode and capture whatever the user picks
    FreeSelect {
        id: String,
        params: Value,
    },
    /// Collect page-level diagnostics (errors, failed requests, vitals)
    Diagnostics {
        id: String,
        params: Value,
    },
    /// Capture a DOM snapshot for later diffing
    Snapshot {
        id: String,
        params: Value,
    },

    // Recording lifecycle notifications (fire-and-forget, no response expected)
    StartRecording {
        id: String,
    },
    StopRecording {
        id: String,
    },

    /// Keepalive answer
    Pong,
}

impl ExtensionCommand {
    /// Correlation id for commands that expect a response
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ExtensionCommand::Inspect { id, .. }
            | ExtensionCommand::FreeSelect { id, .. }
            | ExtensionCommand::Diagnostics { id, .. }
            | ExtensionCommand::Snapshot { id, .. } => Some(id),
            ExtensionCommand::StartRecording { .. }
            | ExtensionCommand::StopRecording { .. }
            | ExtensionCommand::Pong => None,
        }
    }
}
