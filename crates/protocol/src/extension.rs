//! Extension → Broker messages

use serde::{Deserialize, Serialize};

use crate::types::{CaptureResult, ConsoleEntry, FlowEvent, NetworkEntry};

/// Messages sent from the browser extension to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionMessage {
    /// Reply to a broker command; `id` echoes the command's correlation id
    Response {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<CaptureResult>,
    },

    // Unsolicited capture events
    ConsoleEvent {
        entry: ConsoleEntry,
    },
    NetworkEvent {
        entry: NetworkEntry,
    },
    FlowEvent {
        event: FlowEvent,
    },

    /// Keepalive; answered at the socket layer with `pong`
    Ping,
}

#[cfg(test)]
mod tests {
    use super::ExtensionMessage;
    use crate::types::ConsoleLevel;

    #[test]
    fn deserializes_response() {
        let json = r#"{
          "type":"response",
          "id":"req-1",
          "result":{"text":"captured <button.submit>","selector":".submit"}
        }"#;

        let parsed: ExtensionMessage = serde_json::from_str(json).expect("parse response");
        match parsed {
            ExtensionMessage::Response { id, error, result } => {
                assert_eq!(id, "req-1");
                assert!(error.is_none());
                let result = result.expect("result present");
                assert_eq!(result.selector.as_deref(), Some(".submit"));
            }
            other => panic!("unexpected message variant: {:?}", other),
        }
    }

    #[test]
    fn deserializes_error_response_without_result() {
        let json = r#"{"type":"response","id":"req-2","error":"element not found"}"#;
        let parsed: ExtensionMessage = serde_json::from_str(json).expect("parse error response");
        match parsed {
            ExtensionMessage::Response { id, error, result } => {
                assert_eq!(id, "req-2");
                assert_eq!(error.as_deref(), Some("element not found"));
                assert!(result.is_none());
            }
            other => panic!("unexpected message variant: {:?}", other),
        }
    }

    #[test]
    fn roundtrip_console_event() {
        let json = r#"{
          "type":"console_event",
          "entry":{"level":"warn","message":"deprecated API","timestamp_ms":7}
        }"#;

        let parsed: ExtensionMessage = serde_json::from_str(json).expect("parse console event");
        match &parsed {
            ExtensionMessage::ConsoleEvent { entry } => {
                assert_eq!(entry.level, ConsoleLevel::Warn);
                assert_eq!(entry.message, "deprecated API");
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let serialized = serde_json::to_string(&parsed).expect("serialize");
        let _: ExtensionMessage = serde_json::from_str(&serialized).expect("reparse");
    }

    #[test]
    fn deserializes_flow_event() {
        let json = r#"{
          "type":"flow_event",
          "event":{"kind":"click","timestamp_ms":120,"target":"button#save"}
        }"#;

        let parsed: ExtensionMessage = serde_json::from_str(json).expect("parse flow event");
        match parsed {
            ExtensionMessage::FlowEvent { event } => {
                assert_eq!(event.target.as_deref(), Some("button#save"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
