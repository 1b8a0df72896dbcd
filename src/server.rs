//! MCP server implementation.
//!
//! Handles JSON-RPC 2.0 according to the MCP protocol specification. The
//! request handling is transport-independent; [`McpServer::run_stdio`] serves
//! one session over stdin/stdout and the HTTP transport lives in `http.rs`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{rpc_codes, BridgeError, Result};
use crate::session::{RequestContext, SessionManager};

/// MCP protocol version we support.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server information.
const SERVER_NAME: &str = "kb-model-bridge";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<JsonValue>,
    pub method: String,
    #[serde(default)]
    pub params: Option<JsonValue>,
}

impl JsonRpcRequest {
    /// Notifications carry no id and get no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl JsonRpcResponse {
    /// Create a success response.
    pub fn success(id: Option<JsonValue>, result: JsonValue) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<JsonValue>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }

    /// Create an error response from a BridgeError.
    pub fn from_error(id: Option<JsonValue>, err: BridgeError) -> Self {
        Self::error(id, err.rpc_code(), err.to_string())
    }
}

/// One client connection: its fixed context and, once initialized, its session.
#[derive(Debug, Clone, Default)]
pub struct Connection {
    pub context: RequestContext,
    pub session_id: Option<String>,
}

impl Connection {
    pub fn new(context: RequestContext) -> Self {
        Self {
            context,
            session_id: None,
        }
    }
}

/// MCP server. Cheap to clone; clones share the session registry.
#[derive(Clone)]
pub struct McpServer {
    sessions: Arc<SessionManager>,
}

impl McpServer {
    /// Create a new MCP server over the given session registry.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Run the server, reading from stdin and writing to stdout.
    pub async fn run_stdio(&self, context: RequestContext) -> Result<()> {
        self.run(context, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve one newline-delimited JSON-RPC session until `reader` hits EOF.
    ///
    /// Tool calls run concurrently; `notifications/cancelled` aborts the
    /// matching in-flight call.
    pub async fn run<R, W>(&self, context: RequestContext, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(response) = out_rx.recv().await {
                let response_json = serde_json::to_string(&response)?;
                writer.write_all(response_json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<(), BridgeError>(())
        });

        let mut conn = Connection::new(context);
        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF - client disconnected
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => request,
                Err(e) => {
                    let _ = out_tx.send(JsonRpcResponse::error(
                        None,
                        rpc_codes::PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ));
                    continue;
                }
            };

            in_flight.retain(|_, handle| !handle.is_finished());

            if request.method == "notifications/cancelled" {
                if let Some(key) = cancelled_request_key(&request) {
                    if let Some(handle) = in_flight.remove(&key) {
                        tracing::debug!(request_id = %key, "cancelling tool call");
                        handle.abort();
                    }
                }
                continue;
            }

            if request.method == "tools/call" && !request.is_notification() {
                let key = request_key(request.id.as_ref());
                let server = self.clone();
                let mut snapshot = conn.clone();
                let tx = out_tx.clone();
                let handle = tokio::spawn(async move {
                    if let Some(response) = server.handle_request(&mut snapshot, request).await {
                        let _ = tx.send(response);
                    }
                });
                in_flight.insert(key, handle);
                continue;
            }

            if let Some(response) = self.handle_request(&mut conn, request).await {
                let _ = out_tx.send(response);
            }
        }

        if let Some(session_id) = conn.session_id.take() {
            self.sessions.close(&session_id);
        }
        drop(out_tx);
        writer
            .await
            .map_err(|e| BridgeError::Internal(format!("response writer failed: {}", e)))??;
        Ok(())
    }

    /// Handle a single JSON-RPC request. Returns `None` for notifications.
    pub async fn handle_request(
        &self,
        conn: &mut Connection,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        // Validate JSON-RPC version
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id,
                rpc_codes::INVALID_REQUEST,
                "Invalid JSON-RPC version".to_string(),
            ));
        }

        if request.is_notification() {
            tracing::trace!(method = %request.method, "notification");
            return None;
        }

        // Route to appropriate handler
        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(conn, request).await,
            // Older clients send the acknowledgment as a request.
            "initialized" => JsonRpcResponse::success(request.id, JsonValue::Null),
            "tools/list" => self.handle_tools_list(conn, request),
            "tools/call" => self.handle_tools_call(conn, request).await,
            "ping" => JsonRpcResponse::success(request.id, serde_json::json!({})),
            _ => JsonRpcResponse::error(
                request.id,
                rpc_codes::METHOD_NOT_FOUND,
                format!("Unknown method: {}", request.method),
            ),
        };
        Some(response)
    }

    /// Handle the initialize request: registers the session and binds its tool.
    async fn handle_initialize(
        &self,
        conn: &mut Connection,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        if let Some(old) = conn.session_id.take() {
            self.sessions.close(&old);
        }
        let binding = self.sessions.register(conn.context.clone()).await;
        conn.session_id = Some(binding.session_id.clone());

        JsonRpcResponse::success(
            request.id,
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": true }
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION
                }
            }),
        )
    }

    /// Handle the tools/list request.
    fn handle_tools_list(&self, conn: &Connection, request: JsonRpcRequest) -> JsonRpcResponse {
        let tools = match self.session_id(conn).and_then(|id| self.sessions.tools(id)) {
            Ok(tools) => tools,
            Err(err) => return JsonRpcResponse::from_error(request.id, err),
        };
        let tools: Vec<JsonValue> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema
                })
            })
            .collect();

        JsonRpcResponse::success(request.id, serde_json::json!({ "tools": tools }))
    }

    /// Handle the tools/call request.
    async fn handle_tools_call(
        &self,
        conn: &Connection,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        let session_id = match self.session_id(conn) {
            Ok(id) => id.to_string(),
            Err(err) => return JsonRpcResponse::from_error(request.id, err),
        };

        // Extract name and arguments from params
        let params = match &request.params {
            Some(JsonValue::Object(obj)) => obj,
            _ => {
                return JsonRpcResponse::error(
                    request.id,
                    rpc_codes::INVALID_PARAMS,
                    "Missing params object".to_string(),
                )
            }
        };

        let name = match params.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    rpc_codes::INVALID_PARAMS,
                    "Missing 'name' in params".to_string(),
                )
            }
        };

        let arguments = match params.get("arguments") {
            Some(JsonValue::Object(obj)) => obj.clone(),
            Some(JsonValue::Null) | None => Map::new(),
            _ => {
                return JsonRpcResponse::error(
                    request.id,
                    rpc_codes::INVALID_PARAMS,
                    "'arguments' must be an object".to_string(),
                )
            }
        };

        let token = conn.context.token.as_deref();
        match self.sessions.call_tool(&session_id, token, &name, arguments).await {
            Ok(result) => {
                // MCP tool responses are wrapped in content array
                let text = match serde_json::to_string(&result) {
                    Ok(text) => text,
                    Err(e) => return JsonRpcResponse::from_error(request.id, e.into()),
                };
                JsonRpcResponse::success(
                    request.id,
                    serde_json::json!({
                        "content": [{
                            "type": "text",
                            "text": text
                        }]
                    }),
                )
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    tool = %name,
                    error = %err,
                    "tool call failed"
                );
                JsonRpcResponse::from_error(request.id, err)
            }
        }
    }

    fn session_id<'a>(&self, conn: &'a Connection) -> Result<&'a str> {
        conn.session_id
            .as_deref()
            .ok_or_else(|| BridgeError::Protocol("session not initialized".to_string()))
    }
}

fn request_key(id: Option<&JsonValue>) -> String {
    id.map(|v| v.to_string()).unwrap_or_default()
}

fn cancelled_request_key(request: &JsonRpcRequest) -> Option<String> {
    request
        .params
        .as_ref()
        .and_then(|p| p.get("requestId"))
        .map(|id| request_key(Some(id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_response_success() {
        let response = JsonRpcResponse::success(
            Some(JsonValue::Number(1.into())),
            serde_json::json!({"ok": true}),
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));
    }

    #[test]
    fn test_json_rpc_response_error() {
        let response = JsonRpcResponse::error(
            Some(JsonValue::Number(1.into())),
            -32600,
            "Invalid".to_string(),
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"error\""));
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn cancelled_key_matches_request_key() {
        let call: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"method":"tools/call"}"#).unwrap();
        let cancel: JsonRpcRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":7}}"#,
        )
        .unwrap();
        assert!(cancel.is_notification());
        assert_eq!(request_key(call.id.as_ref()), cancelled_request_key(&cancel).unwrap());
    }
}
