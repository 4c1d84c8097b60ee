//! Capture payload types shared across the protocol

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Console entry severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    Debug,
    Log,
    Info,
    Warn,
    Error,
}

/// A single console message captured in the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub message: String,
    /// Script location that emitted the message (file:line), when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp_ms: u64,
    /// Repeat count for coalesced duplicates
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

impl ConsoleEntry {
    /// Duplicate key: same message from the same source
    pub fn same_origin(&self, other: &ConsoleEntry) -> bool {
        self.message == other.message && self.source == other.source
    }

    pub fn is_error(&self) -> bool {
        self.level == ConsoleLevel::Error
    }
}

/// A network request observed by the extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Transport-level failure (request never produced a status)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl NetworkEntry {
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status.is_some_and(|s| s >= 400)
    }
}

/// What kind of user-flow event was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowEventKind {
    Click,
    Input,
    Submit,
    Navigation,
    LayoutShift,
    ConsoleError,
    NetworkError,
}

/// A timestamped event in a user flow (clicks, navigations, failures)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub kind: FlowEventKind,
    /// Time reported by the page itself, not arrival time at the broker
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Rendered size of an element in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementSize {
    pub width: f64,
    pub height: f64,
}

/// Captured state of a single element within a DOM snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    #[serde(default)]
    pub classes: Vec<String>,
    pub size: ElementSize,
    /// Raw `style` attribute text; parsed into a property map when diffing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_style: Option<String>,
}

/// Immutable capture of a page's element tree, keyed by selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomSnapshot {
    /// Assigned by the broker when the snapshot is stored
    #[serde(default)]
    pub id: String,
    pub timestamp_ms: u64,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_selector: Option<String>,
    pub elements: BTreeMap<String, ElementSnapshot>,
}

/// Base64-encoded screenshot returned by a capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub data: String,
    pub mime_type: String,
}

/// Framework source location detected for a captured element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
}

/// Payload of a successful capture response from the extension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Human-readable capture summary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Selector of the captured element, when a single element was targeted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ElementSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<DomSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Screenshot>,
}
