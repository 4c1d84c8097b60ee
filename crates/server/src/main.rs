//! DomLens broker
//!
//! Sits between an AI assistant's synchronous tool-call protocol (MCP over
//! stdio) and an intermittently-connected browser extension (JSON over a
//! local WebSocket), reconciling the two peers' independent lifecycles.

mod broker;
mod buffers;
mod config;
mod diagnosis;
mod error;
mod logging;
mod mcp;
mod recording;
mod snapshots;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::BrokerHandle;
use crate::config::Settings;
use crate::mcp::DomLensMcp;
use crate::websocket::ws_handler;

#[derive(Debug, Parser)]
#[command(name = "domlens", about = "Live-page vision broker for AI coding assistants")]
struct Args {
    /// WebSocket port for the browser extension (overrides settings file)
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _logging = logging::init_logging()?;

    let mut settings = Settings::load(args.settings.as_deref())?;
    if let Some(port) = args.port {
        settings.port = port;
    }
    info!(
        component = "main",
        event = "server.starting",
        port = settings.port,
        "Starting DomLens broker"
    );

    let broker = BrokerHandle::spawn(&settings);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(broker.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        component = "main",
        event = "server.listening",
        addr = %addr,
        "Extension WebSocket listening"
    );
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(
                component = "main",
                event = "server.failed",
                error = %e,
                "WebSocket server exited"
            );
        }
    });

    // Serves until the assistant closes stdio; dropping the process then
    // releases all pending requests and timers with it.
    let mcp = DomLensMcp::new(broker, &settings);
    if let Err(e) = mcp.serve_stdio().await {
        error!(
            component = "main",
            event = "mcp.failed",
            error = %e,
            "MCP stdio transport exited with error"
        );
        return Err(e.into());
    }

    info!(component = "main", event = "server.stopped", "Assistant disconnected, exiting");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
