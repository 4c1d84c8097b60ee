//! Broker error kinds surfaced to the assistant.
//!
//! Display strings are written for assistant consumption: each one names the
//! condition and what to do about it, since tool failures are returned as
//! `is_error` tool responses rather than transport errors.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("no browser extension is connected; open the target page and click the DomLens extension icon, then retry")]
    NoExtensionConnected,

    #[error("the browser connection was lost before a response arrived; reconnect the extension and retry")]
    ConnectionLost,

    #[error("the page reconnected (reload or navigation) while the request was in flight; retry on the new connection")]
    ConnectionSuperseded,

    #[error("the extension did not respond within {0} ms")]
    RequestTimeout(u64),

    #[error("a flow recording is already active; stop it before starting a new one")]
    RecordingAlreadyActive,

    #[error("no flow recording is active")]
    NoActiveRecording,

    #[error("no DOM snapshot with id `{0}`; call snapshot_dom first")]
    SnapshotNotFound(String),

    #[error("invalid tool parameters: {0}")]
    InvalidToolParams(String),

    #[error("the extension could not complete the capture: {0}")]
    CaptureFailed(String),
}
