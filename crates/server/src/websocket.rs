//! WebSocket handling for the extension socket.
//!
//! Each accepted socket gets a connection id and an outbound channel; the
//! broker decides which connection is authoritative. The socket loop only
//! parses frames and forwards them — all state lives in the broker task.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use domlens_protocol::{ExtensionCommand, ExtensionMessage};

use crate::broker::BrokerHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames that can be sent through the WebSocket
enum OutboundFrame {
    /// JSON-serialized broker command
    Command(ExtensionCommand),
    /// Raw pong response to a transport-level ping
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(broker): State<BrokerHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
}

/// Handle one extension connection
async fn handle_socket(socket: WebSocket, broker: BrokerHandle) {
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id,
        "Extension WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound frames funnel through one channel so the broker and the
    // socket loop can both send without sharing the sink.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(100);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                OutboundFrame::Command(command) => match serde_json::to_string(&command) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        warn!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id,
                            error = %e,
                            "Failed to serialize extension command"
                        );
                        continue;
                    }
                },
                OutboundFrame::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id,
                    "WebSocket send failed, extension disconnected"
                );
                break;
            }
        }
    });

    // The broker gets a command-only view of the outbound channel.
    let (command_tx, mut command_rx) = mpsc::channel::<ExtensionCommand>(100);
    let forward_tx = outbound_tx.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            if forward_tx.send(OutboundFrame::Command(command)).await.is_err() {
                break;
            }
        }
    });

    broker.connection_opened(connection_id, command_tx).await;

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundFrame::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id,
                    "Extension sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let message: ExtensionMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                // Never fatal: a malformed frame from a mismatched extension
                // version is skipped, the connection stays up.
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id,
                    error = %e,
                    "Ignoring unparseable extension message"
                );
                continue;
            }
        };

        // Keepalives are answered here; everything else is broker state.
        if matches!(message, ExtensionMessage::Ping) {
            let _ = outbound_tx
                .send(OutboundFrame::Command(ExtensionCommand::Pong))
                .await;
            continue;
        }

        broker.extension_message(connection_id, message).await;
    }

    broker.connection_closed(connection_id).await;
    forward_task.abort();
    send_task.abort();

    info!(
        component = "websocket",
        event = "ws.connection.finished",
        connection_id,
        "Extension WebSocket connection finished"
    );
}
