//! MCP tool surface served over stdio.
//!
//! Tool failures are returned as `is_error` tool responses with an
//! actionable explanation, never as protocol-level errors, so the assistant
//! can react (e.g. ask the user to reload the extension).

use std::time::Duration;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use domlens_protocol::CaptureResult;

use crate::broker::{now_ms, BrokerHandle, CaptureKind};
use crate::config::Settings;
use crate::error::BrokerError;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectParams {
    /// CSS selector of the element to capture
    pub selector: String,
    /// Capture a screenshot of the element (defaults to the configured
    /// screenshot setting)
    #[serde(default)]
    pub screenshot: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FreeSelectParams {
    #[serde(default)]
    pub screenshot: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SnapshotDomParams {
    /// Restrict the snapshot to the subtree under this selector
    #[serde(default)]
    pub root_selector: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DiffDomSnapshotsParams {
    pub before_id: String,
    pub after_id: String,
}

#[derive(Clone)]
pub struct DomLensMcp {
    broker: BrokerHandle,
    request_timeout: Duration,
    screenshot_enabled: bool,
    screenshot_format: String,
    screenshot_quality: u8,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl DomLensMcp {
    pub fn new(broker: BrokerHandle, settings: &Settings) -> Self {
        Self {
            broker,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            screenshot_enabled: settings.screenshot.enabled,
            screenshot_format: settings.screenshot.format.clone(),
            screenshot_quality: settings.screenshot.quality,
            tool_router: Self::tool_router(),
        }
    }

    pub async fn serve_stdio(self) -> Result<(), rmcp::RmcpError> {
        let service = self.serve((tokio::io::stdin(), tokio::io::stdout())).await?;
        service.waiting().await?;
        Ok(())
    }

    /// Capture a specific element: structure, styles, framework source
    /// location, plus a diagnosis of recent related errors.
    #[tool(name = "inspect")]
    async fn inspect(
        &self,
        params: Parameters<InspectParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let InspectParams {
            selector,
            screenshot,
        } = params.0;
        let selector = selector.trim().to_string();
        if selector.is_empty() {
            return Ok(error_response(&BrokerError::InvalidToolParams(
                "selector must not be empty".into(),
            )));
        }

        let params = json!({
            "selector": selector,
            "screenshot": self.screenshot_params(screenshot),
        });
        match self
            .broker
            .capture(CaptureKind::Inspect, params, self.request_timeout)
            .await
        {
            Ok(result) => self.capture_response(result, true).await,
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Enter click-to-select mode in the page and capture whatever element
    /// the user picks.
    #[tool(name = "free_select")]
    async fn free_select(
        &self,
        params: Parameters<FreeSelectParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let params = json!({
            "screenshot": self.screenshot_params(params.0.screenshot),
        });
        match self
            .broker
            .capture(CaptureKind::FreeSelect, params, self.request_timeout)
            .await
        {
            Ok(result) => self.capture_response(result, true).await,
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Collect page-level diagnostics: recent errors, failed requests,
    /// layout instability.
    #[tool(name = "audit")]
    async fn audit(&self) -> Result<CallToolResult, ErrorData> {
        match self
            .broker
            .capture(CaptureKind::Diagnostics, json!({}), self.request_timeout)
            .await
        {
            Ok(result) => self.capture_response(result, false).await,
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Capture an immutable DOM snapshot and return its id for later
    /// diffing with `diff_dom_snapshots`.
    #[tool(name = "snapshot_dom")]
    async fn snapshot_dom(
        &self,
        params: Parameters<SnapshotDomParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let mut wire_params = serde_json::Map::new();
        if let Some(root) = params.0.root_selector.as_deref().map(str::trim) {
            if root.is_empty() {
                return Ok(error_response(&BrokerError::InvalidToolParams(
                    "root_selector must not be empty when provided".into(),
                )));
            }
            wire_params.insert("rootSelector".into(), json!(root));
        }

        match self
            .broker
            .capture(
                CaptureKind::Snapshot,
                serde_json::Value::Object(wire_params),
                self.request_timeout,
            )
            .await
        {
            Ok(result) => {
                let Some(snapshot) = result.snapshot else {
                    return Ok(error_response(&BrokerError::CaptureFailed(
                        "the extension returned no snapshot".into(),
                    )));
                };
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "Stored DOM snapshot `{}` of {} ({} elements{})",
                    snapshot.id,
                    snapshot.url,
                    snapshot.elements.len(),
                    snapshot
                        .root_selector
                        .as_deref()
                        .map(|r| format!(", rooted at {r}"))
                        .unwrap_or_default(),
                ))]))
            }
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Compute the sparse diff between two stored DOM snapshots.
    #[tool(name = "diff_dom_snapshots")]
    async fn diff_dom_snapshots(
        &self,
        params: Parameters<DiffDomSnapshotsParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let DiffDomSnapshotsParams {
            before_id,
            after_id,
        } = params.0;
        match self.broker.diff_snapshots(before_id, after_id).await {
            Ok(diff) if diff.is_empty() => Ok(CallToolResult::success(vec![Content::text(
                "No differences between the two snapshots".to_string(),
            )])),
            Ok(diff) => Ok(CallToolResult::success(vec![Content::text(
                to_pretty_json(&diff)?,
            )])),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Begin recording an ordered user-flow event sequence.
    #[tool(name = "start_recording")]
    async fn start_recording(&self) -> Result<CallToolResult, ErrorData> {
        match self.broker.start_recording().await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text(
                "Flow recording started; interact with the page, then call stop_recording"
                    .to_string(),
            )])),
            Err(e) => Ok(error_response(&e)),
        }
    }

    /// Stop the active recording and return its summary and diagnosis.
    #[tool(name = "stop_recording")]
    async fn stop_recording(&self) -> Result<CallToolResult, ErrorData> {
        match self.broker.stop_recording().await {
            Ok(report) => Ok(CallToolResult::success(vec![Content::text(
                to_pretty_json(&report)?,
            )])),
            Err(e) => Ok(error_response(&e)),
        }
    }

    fn screenshot_params(&self, requested: Option<bool>) -> serde_json::Value {
        json!({
            "enabled": requested.unwrap_or(self.screenshot_enabled),
            "format": self.screenshot_format,
            "quality": self.screenshot_quality,
        })
    }

    /// Turn a capture result into tool content, optionally enriched with a
    /// single-capture diagnosis computed from the buffers at response time.
    async fn capture_response(
        &self,
        result: CaptureResult,
        diagnose: bool,
    ) -> Result<CallToolResult, ErrorData> {
        let mut text = result
            .text
            .clone()
            .unwrap_or_else(|| "Capture completed".to_string());

        if diagnose {
            let diagnosis = self
                .broker
                .diagnose_capture(now_ms(), result.source.clone())
                .await;
            if !diagnosis.is_empty() {
                text.push_str("\n\nDiagnosis:\n");
                text.push_str(&to_pretty_json(&diagnosis)?);
            }
        }

        let mut contents = vec![Content::text(text)];
        if let Some(screenshot) = &result.screenshot {
            contents.push(Content::image(
                screenshot.data.clone(),
                screenshot.mime_type.clone(),
            ));
        }
        Ok(CallToolResult::success(contents))
    }
}

fn error_response(error: &BrokerError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(error.to_string())])
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> Result<String, ErrorData> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ErrorData::internal_error(format!("failed to serialize tool output: {e}"), None))
}

#[tool_handler]
impl ServerHandler for DomLensMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "DomLens gives you live-page vision through a companion browser extension \
                 (tools: inspect, free_select, audit, snapshot_dom, diff_dom_snapshots, \
                 start_recording, stop_recording). Captures require the extension to be \
                 connected; snapshot diffing and recording summaries are served locally."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
