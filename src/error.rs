//! Error types for the model manager and the MCP bridge.
//!
//! Maps stratadb errors and upstream failures to MCP-friendly error responses.

use serde::{Deserialize, Serialize};
use stratadb::Error as StrataError;

/// Bridge errors.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum BridgeError {
    /// The model mode setting is absent or does not validate.
    ///
    /// Callers degrade to manual mode on this error.
    #[error("invalid model mode setting: {0}")]
    ConfigInvalid(String),

    /// Error from the embedded Strata store.
    #[error("store error: {message}")]
    Store {
        /// The error code from strata
        code: String,
        /// Human-readable error message
        message: String,
    },

    /// A remote collaborator (retrieval service, chat pipeline) failed or is unreachable.
    #[error("{service} unavailable: {message}")]
    Upstream {
        /// Which collaborator failed
        service: String,
        /// Human-readable error message
        message: String,
    },

    /// The async indexing queue rejected the message.
    #[error("index queue unreachable: {0}")]
    QueueUnreachable(String),

    /// No knowledge base id was bound to the request.
    #[error("kb_id is required")]
    KbRequired,

    /// The MCP server feature is switched off for the knowledge base.
    #[error("mcp server is not enabled")]
    NotEnabled,

    /// Missing or wrong bearer token.
    #[error("unauthorized: invalid token")]
    Unauthorized,

    /// The chat pipeline emitted an error event.
    #[error("chat error: {0}")]
    Pipeline(String),

    /// The chat pipeline finished without producing any text.
    #[error("no response received from chat")]
    EmptyResponse,

    /// Unknown tool requested.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Request referenced a session that is not registered.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Missing required argument.
    #[error("missing required argument: {0}")]
    MissingArg(String),

    /// Invalid argument value.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArg {
        /// Argument name
        name: String,
        /// Reason why it's invalid
        reason: String,
    },

    /// JSON-RPC protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Build an upstream error for the named collaborator.
    pub fn upstream(service: &str, message: impl std::fmt::Display) -> Self {
        BridgeError::Upstream {
            service: service.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<StrataError> for BridgeError {
    fn from(err: StrataError) -> Self {
        let code = match &err {
            StrataError::KeyNotFound { .. } => "KEY_NOT_FOUND",
            StrataError::BranchNotFound { .. } => "BRANCH_NOT_FOUND",
            StrataError::WrongType { .. } => "WRONG_TYPE",
            StrataError::InvalidKey { .. } => "INVALID_KEY",
            StrataError::InvalidInput { .. } => "INVALID_INPUT",
            StrataError::VersionConflict { .. } => "VERSION_CONFLICT",
            StrataError::Conflict { .. } => "CONFLICT",
            StrataError::AccessDenied { .. } => "ACCESS_DENIED",
            StrataError::Io { .. } => "IO_ERROR",
            StrataError::Serialization { .. } => "SERIALIZATION_ERROR",
            _ => "INTERNAL_ERROR",
        };

        BridgeError::Store {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::upstream("http", err)
    }
}

/// JSON-RPC error codes.
pub mod rpc_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server-defined: caller is not allowed to use the tool.
    pub const UNAUTHORIZED: i32 = -32001;
}

impl BridgeError {
    /// Convert to JSON-RPC error code.
    pub fn rpc_code(&self) -> i32 {
        match self {
            BridgeError::UnknownTool(_) => rpc_codes::METHOD_NOT_FOUND,
            BridgeError::MissingArg(_) | BridgeError::InvalidArg { .. } => {
                rpc_codes::INVALID_PARAMS
            }
            BridgeError::KbRequired | BridgeError::UnknownSession(_) => rpc_codes::INVALID_PARAMS,
            BridgeError::NotEnabled | BridgeError::Unauthorized => rpc_codes::UNAUTHORIZED,
            BridgeError::Protocol(_) => rpc_codes::INVALID_REQUEST,
            BridgeError::Store { code, .. } => match code.as_str() {
                "KEY_NOT_FOUND" | "INVALID_KEY" | "INVALID_INPUT" | "WRONG_TYPE" => {
                    rpc_codes::INVALID_PARAMS
                }
                _ => rpc_codes::INTERNAL_ERROR,
            },
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_share_a_code() {
        assert_eq!(BridgeError::Unauthorized.rpc_code(), rpc_codes::UNAUTHORIZED);
        assert_eq!(BridgeError::NotEnabled.rpc_code(), rpc_codes::UNAUTHORIZED);
    }

    #[test]
    fn validation_failures_are_invalid_params() {
        let err = BridgeError::MissingArg("message".to_string());
        assert_eq!(err.rpc_code(), rpc_codes::INVALID_PARAMS);
        assert_eq!(err.to_string(), "missing required argument: message");
    }

    #[test]
    fn pipeline_errors_keep_the_event_text() {
        let err = BridgeError::Pipeline("model overloaded".to_string());
        assert_eq!(err.to_string(), "chat error: model overloaded");
        assert_eq!(err.rpc_code(), rpc_codes::INTERNAL_ERROR);
    }
}
