//! Signal-correlation diagnosis.
//!
//! Pure, state-free transforms over buffered signals. Nothing observed is
//! silently dropped: events that fall outside the correlation window, or
//! that cannot be tied to the captured element, are reported as `unusual`
//! instead of being discarded. Ambiguity downgrades output, never fails it.

use domlens_protocol::{ConsoleEntry, ElementSource, FlowEvent, FlowEventKind, NetworkEntry};
use serde::Serialize;

/// Trailing window before a capture in which signals are considered related
pub const CAPTURE_WINDOW_MS: u64 = 5_000;

/// Window after a click in which a failure counts as a probable consequence
pub const CONSEQUENCE_WINDOW_MS: u64 = 2_000;

/// Diagnosis attached to a single element capture
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureDiagnosis {
    /// Signals inside the window that plausibly relate to the element
    pub suspected: Vec<String>,
    /// Error messages backing the suspected signals
    pub related_errors: Vec<String>,
    /// Everything else observed: outside the window, or unrelated
    pub unusual: Vec<String>,
}

impl CaptureDiagnosis {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.related_errors.is_empty() && self.unusual.is_empty()
    }
}

/// Diagnosis of a finished flow recording
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowDiagnosis {
    /// Ordered human-readable digest of the recording
    pub timeline: Vec<String>,
    /// Set only when exactly one plausible trigger exists for the terminal
    /// failure; ambiguity leaves it unset rather than guessed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
}

/// Correlate buffered browser-context signals with a capture at
/// `captured_at_ms`. `source` carries the captured element's detected
/// framework source attributes, when the extension found any.
pub fn diagnose_capture(
    captured_at_ms: u64,
    source: Option<&ElementSource>,
    console: &[ConsoleEntry],
    network: &[NetworkEntry],
    activity: &[FlowEvent],
) -> CaptureDiagnosis {
    let mut diagnosis = CaptureDiagnosis::default();
    let window_start = captured_at_ms.saturating_sub(CAPTURE_WINDOW_MS);
    let in_window = |ts: u64| ts >= window_start && ts <= captured_at_ms;

    for entry in console.iter().filter(|e| e.is_error()) {
        let desc = format!(
            "console error {}: {}{}",
            offset_to_capture(entry.timestamp_ms, captured_at_ms),
            entry.message,
            entry
                .source
                .as_deref()
                .map(|s| format!(" ({s})"))
                .unwrap_or_default(),
        );
        if in_window(entry.timestamp_ms) && references_source(source, entry) {
            diagnosis.suspected.push(desc);
            diagnosis.related_errors.push(entry.message.clone());
        } else {
            diagnosis.unusual.push(desc);
        }
    }

    for entry in network.iter().filter(|e| e.is_failure()) {
        let reason = entry
            .error
            .clone()
            .or_else(|| entry.status.map(|s| format!("HTTP {s}")))
            .unwrap_or_else(|| "failed".to_string());
        let desc = format!(
            "network failure {}: {} {} ({reason})",
            offset_to_capture(entry.timestamp_ms, captured_at_ms),
            entry.method,
            entry.url,
        );
        if in_window(entry.timestamp_ms) {
            diagnosis.suspected.push(desc);
            diagnosis.related_errors.push(format!(
                "{} {} failed: {reason}",
                entry.method, entry.url
            ));
        } else {
            diagnosis.unusual.push(desc);
        }
    }

    for event in activity
        .iter()
        .filter(|e| e.kind == FlowEventKind::LayoutShift)
    {
        let desc = format!(
            "layout shift {}{}",
            offset_to_capture(event.timestamp_ms, captured_at_ms),
            event
                .target
                .as_deref()
                .map(|t| format!(" near {t}"))
                .unwrap_or_default(),
        );
        if in_window(event.timestamp_ms) {
            diagnosis.suspected.push(desc);
        } else {
            diagnosis.unusual.push(desc);
        }
    }

    diagnosis
}

/// Does a console entry reference the captured element's source attributes?
/// With no source hints there is nothing to correlate against, so temporal
/// proximity alone qualifies the entry.
fn references_source(source: Option<&ElementSource>, entry: &ConsoleEntry) -> bool {
    let Some(source) = source else { return true };
    let file_stem = source.file.as_deref().map(file_stem);
    let component = source.component.as_deref();
    if file_stem.is_none() && component.is_none() {
        return true;
    }

    let haystacks = [Some(entry.message.as_str()), entry.source.as_deref()];
    haystacks.into_iter().flatten().any(|text| {
        file_stem.is_some_and(|stem| text.contains(stem))
            || component.is_some_and(|c| text.contains(c))
    })
}

fn file_stem(path: &str) -> &str {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    name.split_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

fn offset_to_capture(ts: u64, captured_at_ms: u64) -> String {
    if ts <= captured_at_ms {
        format!("{:.1}s before capture", (captured_at_ms - ts) as f64 / 1000.0)
    } else {
        format!("{:.1}s after capture", (ts - captured_at_ms) as f64 / 1000.0)
    }
}

/// Walk a recording's events (already sorted by time) and produce a timeline
/// digest plus an optional root cause for the terminal failure.
pub fn diagnose_flow(events: &[FlowEvent]) -> FlowDiagnosis {
    let Some(first) = events.first() else {
        return FlowDiagnosis::default();
    };
    let start = first.timestamp_ms;

    let mut timeline = Vec::with_capacity(events.len());
    for event in events {
        let mut line = format!(
            "+{}ms {}",
            event.timestamp_ms.saturating_sub(start),
            kind_label(event.kind)
        );
        if let Some(target) = &event.target {
            line.push_str(&format!(" {target}"));
        }
        if let Some(detail) = &event.detail {
            line.push_str(&format!(": {detail}"));
        }
        if is_consequence_kind(event.kind) {
            if let Some(trigger) = nearest_trigger(events, event) {
                line.push_str(&format!(
                    " (follows {} at +{}ms)",
                    kind_label(trigger.kind),
                    trigger.timestamp_ms.saturating_sub(start)
                ));
            }
        }
        timeline.push(line);
    }

    let root_cause = events
        .iter()
        .rev()
        .find(|e| is_failure_kind(e.kind))
        .and_then(|failure| {
            let candidates: Vec<&FlowEvent> = events
                .iter()
                .filter(|e| is_trigger_kind(e.kind))
                .filter(|e| {
                    e.timestamp_ms <= failure.timestamp_ms
                        && failure.timestamp_ms - e.timestamp_ms <= CONSEQUENCE_WINDOW_MS
                })
                .collect();
            match candidates.as_slice() {
                [only] => Some(format!(
                    "{} at +{}ms{} likely triggered the {} at +{}ms",
                    kind_label(only.kind),
                    only.timestamp_ms.saturating_sub(start),
                    only.target
                        .as_deref()
                        .map(|t| format!(" on {t}"))
                        .unwrap_or_default(),
                    kind_label(failure.kind),
                    failure.timestamp_ms.saturating_sub(start),
                )),
                _ => None,
            }
        });

    FlowDiagnosis {
        timeline,
        root_cause,
    }
}

fn is_trigger_kind(kind: FlowEventKind) -> bool {
    matches!(kind, FlowEventKind::Click | FlowEventKind::Submit)
}

fn is_failure_kind(kind: FlowEventKind) -> bool {
    matches!(kind, FlowEventKind::ConsoleError | FlowEventKind::NetworkError)
}

fn is_consequence_kind(kind: FlowEventKind) -> bool {
    matches!(
        kind,
        FlowEventKind::Navigation | FlowEventKind::ConsoleError | FlowEventKind::NetworkError
    )
}

fn nearest_trigger<'a>(events: &'a [FlowEvent], consequence: &FlowEvent) -> Option<&'a FlowEvent> {
    events
        .iter()
        .filter(|e| is_trigger_kind(e.kind))
        .filter(|e| {
            e.timestamp_ms <= consequence.timestamp_ms
                && consequence.timestamp_ms - e.timestamp_ms <= CONSEQUENCE_WINDOW_MS
        })
        .last()
}

fn kind_label(kind: FlowEventKind) -> &'static str {
    match kind {
        FlowEventKind::Click => "click",
        FlowEventKind::Input => "input",
        FlowEventKind::Submit => "submit",
        FlowEventKind::Navigation => "navigation",
        FlowEventKind::LayoutShift => "layout shift",
        FlowEventKind::ConsoleError => "console error",
        FlowEventKind::NetworkError => "network error",
    }
}
