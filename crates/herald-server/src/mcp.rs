use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use herald_contracts::{
    error_codes, tool_definitions, JsonRpcRequest, JsonRpcResponse, ToolCallError, ToolInvocation,
    ToolResult, JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::BridgeError;

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// JSON-RPC front for the bridge tools.
#[derive(Clone)]
pub struct McpHandler {
    bridge: Bridge,
    server_name: String,
}

impl McpHandler {
    pub fn new(bridge: Bridge, server_name: impl Into<String>) -> Self {
        Self {
            bridge,
            server_name: server_name.into(),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Handles one raw frame. `None` means nothing goes back (notification).
    pub async fn handle_message(&self, raw: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "unparseable frame");
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {err}"),
                ));
            }
        };
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(err) => {
                return Some(JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {err}"),
                ))
            }
        };
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(JsonRpcResponse::failure(
                id,
                error_codes::INVALID_REQUEST,
                "Invalid request: jsonrpc must be \"2.0\"",
            ));
        }
        self.handle(request).await
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let Some(id) = request.id else {
            debug!(method = %request.method, "notification received");
            return None;
        };

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": {
                        "name": self.server_name,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
            "tools/call" => self.call_tool(id, request.params).await,
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };
        Some(response)
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params: CallParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            Some(Err(err)) => {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Invalid params: {err}"),
                )
            }
            None => {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Invalid params: missing tool name",
                )
            }
        };

        let result = match ToolInvocation::parse(&params.name, params.arguments) {
            Ok(invocation) => {
                info!(tool = %params.name, "tool call");
                self.bridge.call(invocation).await.into_tool_result()
            }
            Err(ToolCallError::UnknownTool(name)) => {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Unknown tool: {name}"),
                )
            }
            Err(err @ ToolCallError::InvalidArguments { .. }) => {
                ToolResult::error(format!("Error: {err}"))
            }
        };

        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(err) => JsonRpcResponse::failure(
                id,
                error_codes::INTERNAL_ERROR,
                format!("Internal error: {err}"),
            ),
        }
    }
}

/// Serves newline-delimited JSON-RPC until EOF or `shutdown`.
///
/// Each line is handled on its own task so a blocking approval does not stall
/// `ping` or other calls. Reaching EOF cancels `shutdown`.
pub async fn serve_lines<R, W>(
    handler: McpHandler,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<(), BridgeError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = rx.recv().await {
            let written = async {
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                warn!(error = %err, "mcp output closed");
                break;
            }
        }
    });

    let tracker = TaskTracker::new();
    let mut lines = reader.lines();
    let mut read_error = None;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let handler = handler.clone();
                let tx = tx.clone();
                tracker.spawn(async move {
                    let Some(response) = handler.handle_message(&line).await else {
                        return;
                    };
                    match serde_json::to_string(&response) {
                        Ok(frame) => {
                            let _ = tx.send(frame);
                        }
                        Err(err) => warn!(error = %err, "response not serializable"),
                    }
                });
            }
            Ok(None) => {
                info!("mcp input closed");
                break;
            }
            Err(err) => {
                read_error = Some(err);
                break;
            }
        }
    }

    shutdown.cancel();
    tracker.close();
    tracker.wait().await;
    drop(tx);
    let _ = writer_task.await;

    match read_error {
        Some(err) => Err(BridgeError::InvalidInput(format!("mcp input: {err}"))),
        None => Ok(()),
    }
}

pub async fn serve_stdio(handler: McpHandler, shutdown: CancellationToken) -> Result<(), BridgeError> {
    info!("mcp listening on stdio");
    serve_lines(
        handler,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}

pub fn build_app(handler: McpHandler) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/mcp", post(rpc))
        .with_state(handler)
}

pub async fn serve_http(
    handler: McpHandler,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), BridgeError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::Startup(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "mcp listening on http");
    axum::serve(listener, build_app(handler))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| BridgeError::Startup(format!("http server failed: {e}")))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn rpc(State(handler): State<McpHandler>, body: String) -> Response {
    match handler.handle_message(&body).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}
