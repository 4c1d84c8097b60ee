//! Flow recording state machine.
//!
//! At most one session exists at a time. Events are appended while
//! Recording; finalization sorts them by self-reported timestamp (ties
//! broken by arrival order, since the socket transport may reorder
//! client-reported times), computes a per-kind summary and a diagnosis,
//! then the session is discarded and the broker returns to Idle.

use domlens_protocol::{FlowEvent, FlowEventKind};
use serde::Serialize;

use crate::diagnosis::{diagnose_flow, FlowDiagnosis};
use crate::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Recording,
    Finalizing,
    Completed,
}

#[derive(Debug)]
pub struct FlowRecordingSession {
    state: RecordingState,
    started_at_ms: u64,
    events: Vec<FlowEvent>,
}

/// Per-kind counts computed when a recording stops
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowSummary {
    pub clicks: u32,
    pub inputs: u32,
    pub submits: u32,
    pub navigations: u32,
    pub layout_shifts: u32,
    pub console_errors: u32,
    pub network_errors: u32,
    pub total_events: u32,
}

/// Result of a successful stop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowReport {
    pub started_at_ms: u64,
    pub summary: FlowSummary,
    pub diagnosis: FlowDiagnosis,
}

impl FlowRecordingSession {
    pub fn start(started_at_ms: u64) -> Self {
        Self {
            state: RecordingState::Recording,
            started_at_ms,
            events: Vec::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Append an event. Ignored unless the session is Recording.
    pub fn append(&mut self, event: FlowEvent) {
        if self.state == RecordingState::Recording {
            self.events.push(event);
        }
    }

    /// Finalize the recording: sort by self-reported time (stable, so ties
    /// keep arrival order), summarize, diagnose. Consumes the session.
    pub fn finalize(mut self) -> Result<FlowReport, BrokerError> {
        if self.state != RecordingState::Recording {
            return Err(BrokerError::NoActiveRecording);
        }
        self.state = RecordingState::Finalizing;

        self.events.sort_by_key(|e| e.timestamp_ms);
        let summary = summarize(&self.events);
        let diagnosis = diagnose_flow(&self.events);
        self.state = RecordingState::Completed;

        Ok(FlowReport {
            started_at_ms: self.started_at_ms,
            summary,
            diagnosis,
        })
    }
}

fn summarize(events: &[FlowEvent]) -> FlowSummary {
    let mut summary = FlowSummary {
        total_events: events.len() as u32,
        ..FlowSummary::default()
    };
    for event in events {
        match event.kind {
            FlowEventKind::Click => summary.clicks += 1,
            FlowEventKind::Input => summary.inputs += 1,
            FlowEventKind::Submit => summary.submits += 1,
            FlowEventKind::Navigation => summary.navigations += 1,
            FlowEventKind::LayoutShift => summary.layout_shifts += 1,
            FlowEventKind::ConsoleError => summary.console_errors += 1,
            FlowEventKind::NetworkError => summary.network_errors += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(kind: FlowEventKind, timestamp_ms: u64) -> FlowEvent {
        FlowEvent {
            kind,
            timestamp_ms,
            target: None,
            detail: None,
        }
    }

    #[test]
    fn finalize_counts_per_kind() {
        let mut session = FlowRecordingSession::start(0);
        session.append(FlowEvent {
            target: Some("button#save".into()),
            ..flow(FlowEventKind::Click, 0)
        });
        session.append(flow(FlowEventKind::NetworkError, 500));
        session.append(flow(FlowEventKind::ConsoleError, 700));

        let report = session.finalize().unwrap();
        assert_eq!(report.summary.clicks, 1);
        assert_eq!(report.summary.network_errors, 1);
        assert_eq!(report.summary.console_errors, 1);
        assert_eq!(report.summary.total_events, 3);
        assert!(report.diagnosis.root_cause.is_some());
    }

    #[test]
    fn finalize_sorts_by_self_reported_time() {
        // Events arrive out of order over the socket; diagnosis must see
        // them in page time.
        let mut session = FlowRecordingSession::start(0);
        session.append(flow(FlowEventKind::NetworkError, 500));
        session.append(flow(FlowEventKind::Click, 0));

        let report = session.finalize().unwrap();
        assert!(report.diagnosis.timeline[0].starts_with("+0ms click"));
        assert!(report.diagnosis.root_cause.is_some());
    }

    #[test]
    fn ties_keep_arrival_order() {
        let mut session = FlowRecordingSession::start(0);
        session.append(FlowEvent {
            detail: Some("first".into()),
            ..flow(FlowEventKind::Input, 100)
        });
        session.append(FlowEvent {
            detail: Some("second".into()),
            ..flow(FlowEventKind::Input, 100)
        });

        let report = session.finalize().unwrap();
        assert!(report.diagnosis.timeline[0].contains("first"));
        assert!(report.diagnosis.timeline[1].contains("second"));
    }

    #[test]
    fn session_tracks_state_and_event_count() {
        let mut session = FlowRecordingSession::start(0);
        session.append(flow(FlowEventKind::Click, 0));
        assert_eq!(session.event_count(), 1);
        assert!(session.is_recording());
    }
}
