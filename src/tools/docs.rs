//! The document retrieval tool.
//!
//! Answers a free-text `message` by running the knowledge base's chat
//! pipeline to completion and returning `{"response": "<text>"}`.

use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

use crate::chat::{collect_response, ChatPipeline};
use crate::domain::{AppType, ChatRequest, McpServerSettings};
use crate::error::{BridgeError, Result};
use crate::schema;
use crate::store::AppSettingsSource;
use crate::tools::{get_string_arg, ToolDef};

/// Tool name used when the knowledge base does not override it.
pub const DEFAULT_TOOL_NAME: &str = "get_docs";

/// Tool description used when the knowledge base does not override it.
pub const DEFAULT_TOOL_DESC: &str =
    "Retrieve documents from the knowledge base to answer the user's question";

/// Build the tool definition, applying non-empty overrides.
pub fn tool_def(settings: Option<&McpServerSettings>) -> ToolDef {
    let (name, desc) = match settings {
        Some(s) => (
            non_empty_or(&s.docs_tool.name, DEFAULT_TOOL_NAME),
            non_empty_or(&s.docs_tool.desc, DEFAULT_TOOL_DESC),
        ),
        None => (DEFAULT_TOOL_NAME, DEFAULT_TOOL_DESC),
    };
    ToolDef::new(
        name,
        desc,
        schema!(object {
            required: { "message": (string, "User message") }
        }),
    )
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// Collaborators of the tool handler.
#[derive(Clone)]
pub struct DocsTool {
    pub app_settings: Arc<dyn AppSettingsSource>,
    pub chat: Arc<dyn ChatPipeline>,
}

impl DocsTool {
    /// Run one invocation.
    ///
    /// Settings are read fresh on every call. Auth and argument checks run
    /// before the pipeline is touched.
    pub async fn call(
        &self,
        kb_id: Option<&str>,
        token: Option<&str>,
        args: &Map<String, JsonValue>,
    ) -> Result<JsonValue> {
        let kb_id = kb_id.filter(|id| !id.is_empty()).ok_or(BridgeError::KbRequired)?;

        let settings = self
            .app_settings
            .mcp_server_settings(kb_id)
            .await
            .map_err(|e| BridgeError::Internal(format!("failed to get mcp settings: {}", e)))?;
        authorize(&settings, token)?;

        let message = get_string_arg(args, "message")?;

        let request = ChatRequest {
            kb_id: kb_id.to_string(),
            message,
            app_type: AppType::McpServer,
        };
        let events = self.chat.submit(request).await?;
        let response = collect_response(events).await?;

        tracing::debug!(kb_id, chars = response.len(), "docs tool answered");
        Ok(serde_json::json!({ "response": response }))
    }
}

/// Check enablement and the optional shared secret.
pub fn authorize(settings: &McpServerSettings, token: Option<&str>) -> Result<()> {
    if !settings.is_enabled {
        return Err(BridgeError::NotEnabled);
    }
    if settings.sample_auth.enabled {
        let token = token.unwrap_or_default();
        let secret = settings.sample_auth.password.as_bytes();
        if token.is_empty() || !constant_time_eq(token.as_bytes(), secret) {
            return Err(BridgeError::Unauthorized);
        }
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DocsToolSettings, SampleAuth};

    fn settings(enabled: bool, auth: Option<&str>) -> McpServerSettings {
        McpServerSettings {
            is_enabled: enabled,
            docs_tool: DocsToolSettings::default(),
            sample_auth: SampleAuth {
                enabled: auth.is_some(),
                password: auth.unwrap_or_default().to_string(),
            },
        }
    }

    #[test]
    fn overrides_only_when_non_empty() {
        let mut s = settings(true, None);
        s.docs_tool.name = "search_handbook".to_string();
        let def = tool_def(Some(&s));
        assert_eq!(def.name, "search_handbook");
        assert_eq!(def.description, DEFAULT_TOOL_DESC);
        assert_eq!(def.input_schema["required"], serde_json::json!(["message"]));

        assert_eq!(tool_def(None).name, DEFAULT_TOOL_NAME);
    }

    #[test]
    fn auth_rules() {
        assert!(matches!(authorize(&settings(false, None), None), Err(BridgeError::NotEnabled)));
        assert!(authorize(&settings(true, None), None).is_ok());

        let locked = settings(true, Some("s3cret"));
        assert!(matches!(authorize(&locked, None), Err(BridgeError::Unauthorized)));
        assert!(matches!(authorize(&locked, Some("")), Err(BridgeError::Unauthorized)));
        assert!(matches!(authorize(&locked, Some("s3cre")), Err(BridgeError::Unauthorized)));
        assert!(authorize(&locked, Some("s3cret")).is_ok());
    }

    #[test]
    fn empty_configured_secret_never_matches() {
        let locked = settings(true, Some(""));
        assert!(matches!(authorize(&locked, Some("")), Err(BridgeError::Unauthorized)));
    }
}
