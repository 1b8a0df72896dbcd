//! HTTP transport: the `/mcp` endpoint and the model administration routes.
//!
//! A session's knowledge base comes from the `X-KB-ID` header sent with
//! `initialize`, which answers with an `Mcp-Session-Id` header that later
//! requests must echo. The bearer token is read from `Authorization` on every
//! request. Sessions unused for longer than the idle limit are dropped.

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::ModelMode;
use crate::error::{rpc_codes, BridgeError, Result};
use crate::model::ModelManager;
use crate::server::{Connection, JsonRpcRequest, JsonRpcResponse, McpServer};
use crate::session::RequestContext;

pub const KB_ID_HEADER: &str = "x-kb-id";
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub server: McpServer,
    pub models: Arc<ModelManager>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post).delete(mcp_delete))
        .route("/api/v1/model/mode", get(get_mode))
        .route("/api/v1/model/switch-mode", post(switch_mode))
        .route("/api/v1/model/auto-mode", post(update_auto_mode))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(addr: SocketAddr, state: AppState, session_idle: Duration) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, idle_secs = session_idle.as_secs(), "listening");

    let server = state.server.clone();
    let sweeper = tokio::spawn(async move {
        let mut tick = tokio::time::interval((session_idle / 2).max(Duration::from_secs(1)));
        loop {
            tick.tick().await;
            server.sessions().evict_idle(session_idle);
        }
    });

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    sweeper.abort();
    served?;
    Ok(())
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    let token = header(headers, axum::http::header::AUTHORIZATION.as_str()).map(|auth| {
        auth.strip_prefix("Bearer ")
            .map(str::to_string)
            .unwrap_or(auth)
    });
    RequestContext::new(header(headers, KB_ID_HEADER), token)
}

async fn mcp_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            let resp =
                JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, format!("Parse error: {}", e));
            return (StatusCode::BAD_REQUEST, Json(resp)).into_response();
        }
    };

    let context = request_context(&headers);
    let session_id = header(&headers, SESSION_HEADER);
    let mut conn = match session_id {
        Some(id) if request.method == "initialize" => {
            // Re-initializing replaces the session the client was using.
            state.server.sessions().close(&id);
            Connection::new(context)
        }
        Some(id) => match state.server.sessions().binding(&id) {
            Ok(binding) => Connection {
                context: RequestContext {
                    kb_id: binding.context.kb_id.clone(),
                    token: context.token,
                },
                session_id: Some(id),
            },
            Err(err) => {
                let resp = JsonRpcResponse::from_error(request.id, err);
                return (StatusCode::NOT_FOUND, Json(resp)).into_response();
            }
        },
        None => Connection::new(context),
    };

    let Some(resp) = state.server.handle_request(&mut conn, request).await else {
        return StatusCode::ACCEPTED.into_response();
    };

    let mut response = Json(resp).into_response();
    if let Some(id) = conn.session_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
        response.headers_mut().insert(SESSION_HEADER, id);
    }
    response
}

async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    match header(&headers, SESSION_HEADER) {
        Some(id) if state.server.sessions().close(&id) => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

async fn health() -> Json<JsonValue> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Error wrapper turning [`BridgeError`] into an HTTP response.
struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::MissingArg(_) | BridgeError::InvalidArg { .. } => {
                StatusCode::BAD_REQUEST
            }
            BridgeError::ConfigInvalid(_) => StatusCode::CONFLICT,
            BridgeError::Upstream { .. } | BridgeError::QueueUnreachable(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn get_mode(
    State(state): State<AppState>,
) -> std::result::Result<Json<JsonValue>, ApiError> {
    let body = match state.models.get_model_mode_setting().await {
        Ok(setting) => serde_json::json!({
            "mode": setting.mode,
            "chat_model": setting.chat_model,
            "has_api_key": !setting.auto_mode_api_key.is_empty(),
        }),
        Err(BridgeError::ConfigInvalid(reason)) => {
            tracing::debug!(%reason, "reporting manual mode");
            serde_json::json!({
                "mode": ModelMode::Manual,
                "chat_model": "",
                "has_api_key": false,
            })
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct SwitchModeReq {
    mode: String,
}

async fn switch_mode(
    State(state): State<AppState>,
    Json(req): Json<SwitchModeReq>,
) -> std::result::Result<Json<JsonValue>, ApiError> {
    let mode: ModelMode = req.mode.parse()?;
    let report = state.models.switch_mode(mode).await?;
    Ok(Json(serde_json::json!({
        "changed": report.is_some(),
        "report": report,
    })))
}

#[derive(Debug, Deserialize)]
struct AutoModeReq {
    api_key: String,
    #[serde(default)]
    chat_model: Option<String>,
}

async fn update_auto_mode(
    State(state): State<AppState>,
    Json(req): Json<AutoModeReq>,
) -> std::result::Result<Json<JsonValue>, ApiError> {
    let report = state
        .models
        .update_auto_model_setting(&req.api_key, req.chat_model.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "report": report })))
}
