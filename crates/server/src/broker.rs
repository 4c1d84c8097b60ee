//! Session broker — owns the authoritative extension connection and all
//! mutable capture state, processing commands sequentially.
//!
//! The broker runs as a single tokio task. External callers (the MCP tool
//! layer, the WebSocket handler) communicate via `BrokerHandle`, which sends
//! `BrokerCommand` messages over an mpsc channel. All mutation happens on
//! that one ordered stream, so no internal locking is needed.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use domlens_protocol::{
    new_id, CaptureResult, ElementSource, ExtensionCommand, ExtensionMessage, FlowEvent,
    FlowEventKind,
};

use crate::buffers::{ActivityBuffer, RingBuffer};
use crate::config::Settings;
use crate::diagnosis::{diagnose_capture, CaptureDiagnosis};
use crate::error::BrokerError;
use crate::recording::{FlowRecordingSession, FlowReport};
use crate::snapshots::{DomDiff, SnapshotStore};

/// Wall-clock milliseconds, the time base shared with the extension
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The capture commands the broker can forward to the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Inspect,
    FreeSelect,
    Diagnostics,
    Snapshot,
}

impl CaptureKind {
    fn into_command(self, id: String, params: Value) -> ExtensionCommand {
        match self {
            CaptureKind::Inspect => ExtensionCommand::Inspect { id, params },
            CaptureKind::FreeSelect => ExtensionCommand::FreeSelect { id, params },
            CaptureKind::Diagnostics => ExtensionCommand::Diagnostics { id, params },
            CaptureKind::Snapshot => ExtensionCommand::Snapshot { id, params },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CaptureKind::Inspect => "inspect",
            CaptureKind::FreeSelect => "free_select",
            CaptureKind::Diagnostics => "diagnostics",
            CaptureKind::Snapshot => "snapshot",
        }
    }
}

/// A command sent to the broker task
pub enum BrokerCommand {
    /// Forward a capture command and register a pending request under `id`
    Capture {
        id: String,
        kind: CaptureKind,
        params: Value,
        timeout_ms: u64,
        reply: oneshot::Sender<Result<CaptureResult, BrokerError>>,
    },
    /// Drop a pending request whose caller gave up waiting
    ExpireRequest {
        id: String,
    },

    StartRecording {
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
    StopRecording {
        reply: oneshot::Sender<Result<FlowReport, BrokerError>>,
    },

    DiffSnapshots {
        before_id: String,
        after_id: String,
        reply: oneshot::Sender<Result<DomDiff, BrokerError>>,
    },
    /// Explicitly destroy all stored snapshots
    ClearSnapshots {
        reply: oneshot::Sender<usize>,
    },
    /// Correlate buffered signals with a capture that just resolved
    DiagnoseCapture {
        captured_at_ms: u64,
        source: Option<ElementSource>,
        reply: oneshot::Sender<CaptureDiagnosis>,
    },

    // Connection lifecycle, driven by the WebSocket handler
    ConnectionOpened {
        connection_id: u64,
        outbound: mpsc::Sender<ExtensionCommand>,
    },
    ConnectionClosed {
        connection_id: u64,
    },
    ExtensionMessage {
        connection_id: u64,
        message: ExtensionMessage,
    },
}

/// A tool call suspended on an extension response.
/// Invariant: every PendingRequest completes exactly once, by matching
/// response, caller-side timeout (via ExpireRequest), or connection
/// loss/supersession.
struct PendingRequest {
    kind: CaptureKind,
    connection_id: u64,
    created_at_ms: u64,
    timeout_ms: u64,
    reply: oneshot::Sender<Result<CaptureResult, BrokerError>>,
}

/// The single connection currently trusted to receive commands
struct ExtensionConnection {
    connection_id: u64,
    connected_at_ms: u64,
    outbound: mpsc::Sender<ExtensionCommand>,
}

pub struct SessionBroker {
    capture_console: bool,
    capture_network: bool,
    authoritative: Option<ExtensionConnection>,
    pending: HashMap<String, PendingRequest>,
    console: RingBuffer<domlens_protocol::ConsoleEntry>,
    network: RingBuffer<domlens_protocol::NetworkEntry>,
    activity: ActivityBuffer,
    snapshots: SnapshotStore,
    recording: Option<FlowRecordingSession>,
}

impl SessionBroker {
    fn new(settings: &Settings) -> Self {
        Self {
            capture_console: settings.capture_console,
            capture_network: settings.capture_network,
            authoritative: None,
            pending: HashMap::new(),
            console: RingBuffer::with_capacity(settings.console_capacity),
            network: RingBuffer::with_capacity(settings.network_capacity),
            activity: ActivityBuffer::new(Duration::from_secs(settings.activity_window_secs)),
            snapshots: SnapshotStore::with_capacity(settings.snapshot_capacity),
            recording: None,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<BrokerCommand>) {
        // The activity buffer must shrink even with no traffic, so sweep on
        // a timer alongside command processing. Both arms mutate state from
        // this one task only.
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => self.activity.sweep(now_ms()),
            }
        }

        debug!(component = "broker", event = "broker.stopped", "Broker task exiting");
    }

    fn handle(&mut self, command: BrokerCommand) {
        match command {
            BrokerCommand::Capture {
                id,
                kind,
                params,
                timeout_ms,
                reply,
            } => self.handle_capture(id, kind, params, timeout_ms, reply),
            BrokerCommand::ExpireRequest { id } => {
                if self.pending.remove(&id).is_some() {
                    debug!(
                        component = "broker",
                        event = "broker.request.expired",
                        request_id = %id,
                        "Pending request expired by caller timeout"
                    );
                }
            }
            BrokerCommand::StartRecording { reply } => {
                let _ = reply.send(self.start_recording());
            }
            BrokerCommand::StopRecording { reply } => {
                let _ = reply.send(self.stop_recording());
            }
            BrokerCommand::DiffSnapshots {
                before_id,
                after_id,
                reply,
            } => {
                let _ = reply.send(self.snapshots.diff(&before_id, &after_id));
            }
            BrokerCommand::ClearSnapshots { reply } => {
                let dropped = self.snapshots.clear();
                info!(
                    component = "broker",
                    event = "broker.snapshots.cleared",
                    dropped,
                );
                let _ = reply.send(dropped);
            }
            BrokerCommand::DiagnoseCapture {
                captured_at_ms,
                source,
                reply,
            } => {
                let console: Vec<_> = self.console.iter().cloned().collect();
                let network: Vec<_> = self.network.iter().cloned().collect();
                let activity: Vec<_> = self.activity.events().cloned().collect();
                let _ = reply.send(diagnose_capture(
                    captured_at_ms,
                    source.as_ref(),
                    &console,
                    &network,
                    &activity,
                ));
            }
            BrokerCommand::ConnectionOpened {
                connection_id,
                outbound,
            } => self.connection_opened(connection_id, outbound),
            BrokerCommand::ConnectionClosed { connection_id } => {
                self.connection_closed(connection_id)
            }
            BrokerCommand::ExtensionMessage {
                connection_id,
                message,
            } => self.extension_message(connection_id, message),
        }
    }

    fn handle_capture(
        &mut self,
        id: String,
        kind: CaptureKind,
        params: Value,
        timeout_ms: u64,
        reply: oneshot::Sender<Result<CaptureResult, BrokerError>>,
    ) {
        let Some(connection) = &self.authoritative else {
            let _ = reply.send(Err(BrokerError::NoExtensionConnected));
            return;
        };

        let command = kind.into_command(id.clone(), params);
        match connection.outbound.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Local backpressure, not a dropped browser connection.
                warn!(
                    component = "broker",
                    event = "broker.request.backpressure",
                    connection_id = connection.connection_id,
                    tool = kind.name(),
                    "Outbound command queue is full, failing request"
                );
                let _ = reply.send(Err(BrokerError::CaptureFailed(
                    "the extension is not consuming commands (outbound queue full); retry shortly"
                        .into(),
                )));
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    component = "broker",
                    event = "broker.request.send_failed",
                    connection_id = connection.connection_id,
                    tool = kind.name(),
                    "Outbound channel closed, failing request"
                );
                let _ = reply.send(Err(BrokerError::ConnectionLost));
                return;
            }
        }

        debug!(
            component = "broker",
            event = "broker.request.sent",
            request_id = %id,
            tool = kind.name(),
            connection_id = connection.connection_id,
        );
        self.pending.insert(
            id,
            PendingRequest {
                kind,
                connection_id: connection.connection_id,
                created_at_ms: now_ms(),
                timeout_ms,
                reply,
            },
        );
    }

    fn connection_opened(&mut self, connection_id: u64, outbound: mpsc::Sender<ExtensionCommand>) {
        let connection = ExtensionConnection {
            connection_id,
            connected_at_ms: now_ms(),
            outbound,
        };
        if let Some(previous) = self.authoritative.replace(connection) {
            info!(
                component = "broker",
                event = "ws.connection.superseded",
                superseded_id = previous.connection_id,
                connection_id,
                "New extension connection supersedes the previous one"
            );
            // Never silently drop: the assistant must be able to retry.
            self.fail_pending_for(previous.connection_id, BrokerError::ConnectionSuperseded);
        } else {
            info!(
                component = "broker",
                event = "ws.connection.authoritative",
                connection_id,
                "Extension connection installed as authoritative"
            );
        }
    }

    fn connection_closed(&mut self, connection_id: u64) {
        let authoritative = self
            .authoritative
            .as_ref()
            .is_some_and(|c| c.connection_id == connection_id);
        if !authoritative {
            // A superseded connection closing late is expected.
            debug!(
                component = "broker",
                event = "ws.connection.closed_stale",
                connection_id,
            );
            return;
        }

        let connection = self.authoritative.take();
        self.fail_pending_for(connection_id, BrokerError::ConnectionLost);
        // Buffered and recorded data stay intact: liveness and retained
        // history are independent.
        info!(
            component = "broker",
            event = "ws.connection.closed",
            connection_id,
            uptime_ms = connection
                .map(|c| now_ms().saturating_sub(c.connected_at_ms))
                .unwrap_or(0),
            "Authoritative extension connection closed"
        );
    }

    fn fail_pending_for(&mut self, connection_id: u64, error: BrokerError) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.connection_id == connection_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(
                    component = "broker",
                    event = "broker.request.failed",
                    request_id = %id,
                    tool = pending.kind.name(),
                    error = %error,
                    age_ms = now_ms().saturating_sub(pending.created_at_ms),
                    timeout_ms = pending.timeout_ms,
                );
                let _ = pending.reply.send(Err(error.clone()));
            }
        }
    }

    fn extension_message(&mut self, connection_id: u64, message: ExtensionMessage) {
        match message {
            ExtensionMessage::Response { id, error, result } => {
                let Some(pending) = self.pending.remove(&id) else {
                    // Expected during connection handover: a stale duplicate
                    // connection may still flush responses.
                    warn!(
                        component = "broker",
                        event = "broker.response.unmatched",
                        request_id = %id,
                        connection_id,
                        "Response for unknown correlation id, dropping"
                    );
                    return;
                };

                let outcome = match error {
                    Some(message) => Err(BrokerError::CaptureFailed(message)),
                    None => {
                        let mut result = result.unwrap_or_default();
                        if let Some(mut snapshot) = result.snapshot.take() {
                            if snapshot.id.is_empty() {
                                snapshot.id = new_id();
                            }
                            result.snapshot = Some(snapshot.clone());
                            let snapshot_id = self.snapshots.store(snapshot);
                            debug!(
                                component = "broker",
                                event = "broker.snapshot.stored",
                                snapshot_id = %snapshot_id,
                            );
                        }
                        Ok(result)
                    }
                };
                let _ = pending.reply.send(outcome);
            }
            _ if !self.is_authoritative(connection_id) => {
                debug!(
                    component = "broker",
                    event = "broker.event.stale_connection",
                    connection_id,
                    "Event from non-authoritative connection, dropping"
                );
            }
            ExtensionMessage::ConsoleEvent { entry } => {
                if !self.capture_console {
                    return;
                }
                if entry.is_error() {
                    self.route_flow_event(FlowEvent {
                        kind: FlowEventKind::ConsoleError,
                        timestamp_ms: entry.timestamp_ms,
                        target: entry.source.clone(),
                        detail: Some(entry.message.clone()),
                    });
                }
                self.console.push_console(entry);
            }
            ExtensionMessage::NetworkEvent { entry } => {
                if !self.capture_network {
                    return;
                }
                if entry.is_failure() {
                    self.route_flow_event(FlowEvent {
                        kind: FlowEventKind::NetworkError,
                        timestamp_ms: entry.timestamp_ms,
                        target: Some(entry.url.clone()),
                        detail: entry.error.clone(),
                    });
                }
                self.network.push(entry);
            }
            ExtensionMessage::FlowEvent { event } => self.route_flow_event(event),
            // Answered at the socket layer; nothing to do here.
            ExtensionMessage::Ping => {}
        }
    }

    fn is_authoritative(&self, connection_id: u64) -> bool {
        self.authoritative
            .as_ref()
            .is_some_and(|c| c.connection_id == connection_id)
    }

    fn route_flow_event(&mut self, event: FlowEvent) {
        self.activity.push(event.clone(), now_ms());
        if let Some(recording) = &mut self.recording {
            recording.append(event);
        }
    }

    fn start_recording(&mut self) -> Result<(), BrokerError> {
        if self.recording.is_some() {
            // No-op: the active session keeps its start time and events.
            return Err(BrokerError::RecordingAlreadyActive);
        }
        self.recording = Some(FlowRecordingSession::start(now_ms()));
        self.notify_extension(ExtensionCommand::StartRecording { id: new_id() });
        info!(component = "broker", event = "recording.started");
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<FlowReport, BrokerError> {
        let session = self.recording.take().ok_or(BrokerError::NoActiveRecording)?;
        self.notify_extension(ExtensionCommand::StopRecording { id: new_id() });
        let report = session.finalize()?;
        info!(
            component = "broker",
            event = "recording.stopped",
            events = report.summary.total_events,
        );
        Ok(report)
    }

    /// Fire-and-forget notification; recording state lives broker-side, so
    /// a missing connection is not an error.
    fn notify_extension(&self, command: ExtensionCommand) {
        if let Some(connection) = &self.authoritative {
            let _ = connection.outbound.try_send(command);
        }
    }
}

/// Handle to the running broker task (cheap to Clone)
#[derive(Clone)]
pub struct BrokerHandle {
    command_tx: mpsc::Sender<BrokerCommand>,
}

impl BrokerHandle {
    pub fn spawn(settings: &Settings) -> BrokerHandle {
        let (command_tx, command_rx) = mpsc::channel(256);
        tokio::spawn(SessionBroker::new(settings).run(command_rx));
        BrokerHandle { command_tx }
    }

    /// Submit a capture tool call and suspend until a matching response,
    /// timeout, or connection event resolves it.
    pub async fn capture(
        &self,
        kind: CaptureKind,
        params: Value,
        timeout: Duration,
    ) -> Result<CaptureResult, BrokerError> {
        let id = new_id();
        let timeout_ms = timeout.as_millis() as u64;
        let (reply, response) = oneshot::channel();
        self.send(BrokerCommand::Capture {
            id: id.clone(),
            kind,
            params,
            timeout_ms,
            reply,
        })
        .await?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::ConnectionLost),
            Err(_) => {
                // Clean the correlation table; the broker may still receive
                // a late response for this id, which it will drop.
                let _ = self
                    .command_tx
                    .send(BrokerCommand::ExpireRequest { id })
                    .await;
                Err(BrokerError::RequestTimeout(timeout_ms))
            }
        }
    }

    pub async fn start_recording(&self) -> Result<(), BrokerError> {
        let (reply, response) = oneshot::channel();
        self.send(BrokerCommand::StartRecording { reply }).await?;
        response.await.map_err(|_| BrokerError::ConnectionLost)?
    }

    pub async fn stop_recording(&self) -> Result<FlowReport, BrokerError> {
        let (reply, response) = oneshot::channel();
        self.send(BrokerCommand::StopRecording { reply }).await?;
        response.await.map_err(|_| BrokerError::ConnectionLost)?
    }

    pub async fn diff_snapshots(
        &self,
        before_id: String,
        after_id: String,
    ) -> Result<DomDiff, BrokerError> {
        let (reply, response) = oneshot::channel();
        self.send(BrokerCommand::DiffSnapshots {
            before_id,
            after_id,
            reply,
        })
        .await?;
        response.await.map_err(|_| BrokerError::ConnectionLost)?
    }

    pub async fn clear_snapshots(&self) -> usize {
        let (reply, response) = oneshot::channel();
        if self
            .send(BrokerCommand::ClearSnapshots { reply })
            .await
            .is_err()
        {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    pub async fn diagnose_capture(
        &self,
        captured_at_ms: u64,
        source: Option<ElementSource>,
    ) -> CaptureDiagnosis {
        let (reply, response) = oneshot::channel();
        if self
            .send(BrokerCommand::DiagnoseCapture {
                captured_at_ms,
                source,
                reply,
            })
            .await
            .is_err()
        {
            return CaptureDiagnosis::default();
        }
        response.await.unwrap_or_default()
    }

    pub async fn connection_opened(&self, connection_id: u64, outbound: mpsc::Sender<ExtensionCommand>) {
        let _ = self
            .command_tx
            .send(BrokerCommand::ConnectionOpened {
                connection_id,
                outbound,
            })
            .await;
    }

    pub async fn connection_closed(&self, connection_id: u64) {
        let _ = self
            .command_tx
            .send(BrokerCommand::ConnectionClosed { connection_id })
            .await;
    }

    pub async fn extension_message(&self, connection_id: u64, message: ExtensionMessage) {
        let _ = self
            .command_tx
            .send(BrokerCommand::ExtensionMessage {
                connection_id,
                message,
            })
            .await;
    }

    async fn send(&self, command: BrokerCommand) -> Result<(), BrokerError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| BrokerError::ConnectionLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domlens_protocol::{ConsoleEntry, ConsoleLevel, DomSnapshot, NetworkEntry};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn spawn_broker() -> BrokerHandle {
        BrokerHandle::spawn(&Settings::default())
    }

    async fn connect(broker: &BrokerHandle, connection_id: u64) -> mpsc::Receiver<ExtensionCommand> {
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        broker.connection_opened(connection_id, outbound_tx).await;
        outbound_rx
    }

    fn console_error(message: &str, timestamp_ms: u64) -> ExtensionMessage {
        ExtensionMessage::ConsoleEvent {
            entry: ConsoleEntry {
                level: ConsoleLevel::Error,
                message: message.to_string(),
                source: None,
                timestamp_ms,
                count: 1,
            },
        }
    }

    fn flow_event(kind: FlowEventKind, timestamp_ms: u64, target: Option<&str>) -> ExtensionMessage {
        ExtensionMessage::FlowEvent {
            event: FlowEvent {
                kind,
                timestamp_ms,
                target: target.map(str::to_string),
                detail: None,
            },
        }
    }

    #[tokio::test]
    async fn capture_without_connection_fails_fast() {
        let broker = spawn_broker();
        let err = broker
            .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoExtensionConnected);
    }

    #[tokio::test]
    async fn capture_resolves_on_matching_response() {
        let broker = spawn_broker();
        let mut outbound = connect(&broker, 1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(
                    CaptureKind::Inspect,
                    json!({"selector": "#x"}),
                    Duration::from_secs(2),
                )
                .await
        });

        let command = outbound.recv().await.expect("command forwarded");
        let id = command.correlation_id().expect("capture has id").to_string();

        broker
            .extension_message(
                1,
                ExtensionMessage::Response {
                    id,
                    error: None,
                    result: Some(CaptureResult {
                        text: Some("captured #x".into()),
                        ..CaptureResult::default()
                    }),
                },
            )
            .await;

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.text.as_deref(), Some("captured #x"));
    }

    #[tokio::test]
    async fn capture_times_out_without_response() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        let err = broker
            .capture(CaptureKind::Diagnostics, json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::RequestTimeout(50));
    }

    #[tokio::test]
    async fn extension_error_response_surfaces_as_capture_failed() {
        let broker = spawn_broker();
        let mut outbound = connect(&broker, 1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(2))
                .await
        });

        let command = outbound.recv().await.unwrap();
        let id = command.correlation_id().unwrap().to_string();
        broker
            .extension_message(
                1,
                ExtensionMessage::Response {
                    id,
                    error: Some("element not found".into()),
                    result: None,
                },
            )
            .await;

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, BrokerError::CaptureFailed("element not found".into()));
    }

    #[tokio::test]
    async fn supersession_fails_pending_and_new_connection_serves_calls() {
        let broker = spawn_broker();
        let mut old_outbound = connect(&broker, 1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(5))
                .await
        });
        old_outbound.recv().await.expect("sent on old connection");

        // Tab reload: a new connection supersedes the old one.
        let mut new_outbound = connect(&broker, 2).await;
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, BrokerError::ConnectionSuperseded);

        // The new connection serves subsequent calls normally.
        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(2))
                .await
        });
        let command = new_outbound.recv().await.unwrap();
        let id = command.correlation_id().unwrap().to_string();
        broker
            .extension_message(
                2,
                ExtensionMessage::Response {
                    id,
                    error: None,
                    result: None,
                },
            )
            .await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_then_submit_fails_fast() {
        let broker = spawn_broker();
        let mut outbound = connect(&broker, 1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(5))
                .await
        });
        outbound.recv().await.unwrap();

        broker.connection_closed(1).await;
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, BrokerError::ConnectionLost);

        let err = broker
            .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::NoExtensionConnected);
    }

    #[tokio::test]
    async fn stale_close_of_superseded_connection_is_a_noop() {
        let broker = spawn_broker();
        let _old = connect(&broker, 1).await;
        let mut new_outbound = connect(&broker, 2).await;

        // Old connection's socket loop winds down after supersession.
        broker.connection_closed(1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(2))
                .await
        });
        let command = new_outbound.recv().await.unwrap();
        let id = command.correlation_id().unwrap().to_string();
        broker
            .extension_message(
                2,
                ExtensionMessage::Response {
                    id,
                    error: None,
                    result: None,
                },
            )
            .await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped_silently() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        broker
            .extension_message(
                1,
                ExtensionMessage::Response {
                    id: "never-issued".into(),
                    error: None,
                    result: None,
                },
            )
            .await;

        // Broker is still healthy afterwards.
        assert!(broker.start_recording().await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_response_is_stored_and_diffable() {
        let broker = spawn_broker();
        let mut outbound = connect(&broker, 1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Snapshot, json!({}), Duration::from_secs(2))
                .await
        });

        let command = outbound.recv().await.unwrap();
        let id = command.correlation_id().unwrap().to_string();
        broker
            .extension_message(
                1,
                ExtensionMessage::Response {
                    id,
                    error: None,
                    result: Some(CaptureResult {
                        snapshot: Some(DomSnapshot {
                            id: String::new(),
                            timestamp_ms: 1,
                            url: "https://example.test/".into(),
                            root_selector: None,
                            elements: BTreeMap::new(),
                        }),
                        ..CaptureResult::default()
                    }),
                },
            )
            .await;

        let result = task.await.unwrap().unwrap();
        let snapshot_id = result.snapshot.expect("snapshot returned").id;
        assert!(!snapshot_id.is_empty());

        let diff = broker
            .diff_snapshots(snapshot_id.clone(), snapshot_id)
            .await
            .unwrap();
        assert!(diff.is_empty());
    }

    #[tokio::test]
    async fn clear_snapshots_drops_stored_history() {
        let broker = spawn_broker();
        let mut outbound = connect(&broker, 1).await;

        let caller = broker.clone();
        let task = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Snapshot, json!({}), Duration::from_secs(2))
                .await
        });

        let command = outbound.recv().await.unwrap();
        let id = command.correlation_id().unwrap().to_string();
        broker
            .extension_message(
                1,
                ExtensionMessage::Response {
                    id,
                    error: None,
                    result: Some(CaptureResult {
                        snapshot: Some(DomSnapshot {
                            id: String::new(),
                            timestamp_ms: 1,
                            url: "https://example.test/".into(),
                            root_selector: None,
                            elements: BTreeMap::new(),
                        }),
                        ..CaptureResult::default()
                    }),
                },
            )
            .await;

        let snapshot_id = task.await.unwrap().unwrap().snapshot.unwrap().id;

        assert_eq!(broker.clear_snapshots().await, 1);
        let err = broker
            .diff_snapshots(snapshot_id.clone(), snapshot_id.clone())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::SnapshotNotFound(snapshot_id));
    }

    #[tokio::test]
    async fn full_outbound_queue_fails_as_backpressure_not_disconnect() {
        let broker = spawn_broker();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
        broker.connection_opened(1, outbound_tx).await;

        // Occupy the single queue slot without draining it.
        let caller = broker.clone();
        let parked = tokio::spawn(async move {
            caller
                .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(2))
                .await
        });
        // Let the first command land in the queue before issuing the second.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = broker
            .capture(CaptureKind::Inspect, json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CaptureFailed(_)));

        // The queued request is still live and resolvable.
        let command = outbound_rx.recv().await.unwrap();
        let id = command.correlation_id().unwrap().to_string();
        broker
            .extension_message(
                1,
                ExtensionMessage::Response {
                    id,
                    error: None,
                    result: Some(CaptureResult::default()),
                },
            )
            .await;
        assert!(parked.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn diff_of_unknown_snapshot_fails() {
        let broker = spawn_broker();
        let err = broker
            .diff_snapshots("a".into(), "b".into())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::SnapshotNotFound("a".into()));
    }

    #[tokio::test]
    async fn recording_lifecycle_with_summary_and_root_cause() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        broker.start_recording().await.unwrap();
        broker
            .extension_message(1, flow_event(FlowEventKind::Click, 0, Some("button#save")))
            .await;
        broker
            .extension_message(1, flow_event(FlowEventKind::NetworkError, 500, None))
            .await;
        broker
            .extension_message(1, flow_event(FlowEventKind::ConsoleError, 700, None))
            .await;

        let report = broker.stop_recording().await.unwrap();
        assert_eq!(report.summary.clicks, 1);
        assert_eq!(report.summary.network_errors, 1);
        assert_eq!(report.summary.console_errors, 1);
        assert!(report.diagnosis.root_cause.is_some());

        let err = broker.stop_recording().await.unwrap_err();
        assert_eq!(err, BrokerError::NoActiveRecording);
    }

    #[tokio::test]
    async fn starting_while_recording_fails_without_resetting() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        broker.start_recording().await.unwrap();
        broker
            .extension_message(1, flow_event(FlowEventKind::Click, 0, None))
            .await;

        let err = broker.start_recording().await.unwrap_err();
        assert_eq!(err, BrokerError::RecordingAlreadyActive);

        // The session kept its buffered events.
        let report = broker.stop_recording().await.unwrap();
        assert_eq!(report.summary.clicks, 1);
    }

    #[tokio::test]
    async fn console_errors_are_mirrored_into_an_active_recording() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        broker.start_recording().await.unwrap();
        broker.extension_message(1, console_error("boom", 100)).await;

        let report = broker.stop_recording().await.unwrap();
        assert_eq!(report.summary.console_errors, 1);
    }

    #[tokio::test]
    async fn network_failures_are_mirrored_into_an_active_recording() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        broker.start_recording().await.unwrap();
        broker
            .extension_message(
                1,
                ExtensionMessage::NetworkEvent {
                    entry: NetworkEntry {
                        method: "POST".into(),
                        url: "https://api.test/save".into(),
                        status: Some(500),
                        error: None,
                        timestamp_ms: 100,
                        duration_ms: Some(30),
                    },
                },
            )
            .await;

        let report = broker.stop_recording().await.unwrap();
        assert_eq!(report.summary.network_errors, 1);
    }

    #[tokio::test]
    async fn buffered_signals_survive_disconnect_and_feed_diagnosis() {
        let broker = spawn_broker();
        let _outbound = connect(&broker, 1).await;

        broker.extension_message(1, console_error("boom", 9_500)).await;
        broker.connection_closed(1).await;

        // History is retained independently of liveness.
        let diagnosis = broker.diagnose_capture(10_000, None).await;
        assert_eq!(diagnosis.suspected.len(), 1);
        assert_eq!(diagnosis.related_errors, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn events_from_non_authoritative_connections_are_dropped() {
        let broker = spawn_broker();
        let _old = connect(&broker, 1).await;
        let _new = connect(&broker, 2).await;

        // Connection 1 is superseded; its events no longer count.
        broker.extension_message(1, console_error("stale", 9_500)).await;
        let diagnosis = broker.diagnose_capture(10_000, None).await;
        assert!(diagnosis.is_empty());
    }
}
