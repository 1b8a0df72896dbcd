//! Domain types shared by the model manager, the stores and the MCP bridge.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Settings key of the global model mode blob.
pub const SETTING_MODEL_MODE: &str = "model_setting_mode";

/// Settings key of the per-knowledge-base MCP server settings.
pub const SETTING_MCP_SERVER: &str = "mcp_server_settings";

/// Scope of global settings.
pub const GLOBAL_SCOPE: &str = "";

/// Provider name of auto-provisioned models.
pub const MANAGED_PROVIDER: &str = "BaiZhiCloud";

/// Default endpoint of auto-provisioned models.
pub const DEFAULT_MANAGED_BASE_URL: &str = "https://model-square.app.baizhi.cloud";

/// Analysis model seeded into an empty retrieval service. Smaller than the
/// auto mode analysis model, which only takes over once auto mode is on.
pub const SEED_ANALYSIS_MODEL: &str = "qwen2.5-3b-instruct";

/// Logical model type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    Chat,
    Embedding,
    Rerank,
    Analysis,
    AnalysisVl,
}

impl ModelType {
    /// Types mirrored into the retrieval service, in propagation order.
    pub const RAG: [ModelType; 4] = [
        ModelType::Embedding,
        ModelType::Rerank,
        ModelType::Analysis,
        ModelType::AnalysisVl,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Chat => "chat",
            ModelType::Embedding => "embedding",
            ModelType::Rerank => "rerank",
            ModelType::Analysis => "analysis",
            ModelType::AnalysisVl => "analysis-vl",
        }
    }

    pub fn is_rag(&self) -> bool {
        Self::RAG.contains(self)
    }

    /// Model name used for this type in auto mode.
    pub fn auto_mode_default(&self) -> &'static str {
        match self {
            ModelType::Chat => "deepseek-v3.1",
            ModelType::Embedding => "bge-m3",
            ModelType::Rerank => "bge-reranker-v2-m3",
            ModelType::Analysis => "deepseek-v3.1",
            ModelType::AnalysisVl => "qwen-vl-max-latest",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(ModelType::Chat),
            "embedding" => Ok(ModelType::Embedding),
            "rerank" => Ok(ModelType::Rerank),
            "analysis" => Ok(ModelType::Analysis),
            "analysis-vl" => Ok(ModelType::AnalysisVl),
            other => Err(BridgeError::InvalidArg {
                name: "type".to_string(),
                reason: format!("unknown model type '{}'", other),
            }),
        }
    }
}

/// Who picks the RAG models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    /// Administrator-curated models from the registry.
    Manual,
    /// Managed models sharing one API key.
    Auto,
}

impl ModelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelMode::Manual => "manual",
            ModelMode::Auto => "auto",
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ModelMode::Manual),
            "auto" => Ok(ModelMode::Auto),
            other => Err(BridgeError::InvalidArg {
                name: "mode".to_string(),
                reason: format!("expected 'manual' or 'auto', got '{}'", other),
            }),
        }
    }
}

/// Persisted model mode blob.
///
/// Stored as raw JSON with a string `mode` so that an empty or unknown mode can
/// be told apart from a valid one; [`ModelModeSetting::mode`] does the check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelModeSetting {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub auto_mode_api_key: String,
    #[serde(default)]
    pub chat_model: String,
    /// Fields this crate does not know about, written back untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ModelModeSetting {
    /// The blob written when the setting is first created.
    pub fn initial() -> Self {
        Self {
            mode: ModelMode::Manual.as_str().to_string(),
            ..Default::default()
        }
    }

    /// Parsed mode; fails if empty or unknown.
    pub fn mode(&self) -> Result<ModelMode, BridgeError> {
        if self.mode.is_empty() {
            return Err(BridgeError::ConfigInvalid("mode is empty".to_string()));
        }
        self.mode
            .parse()
            .map_err(|_| BridgeError::ConfigInvalid(format!("unknown mode '{}'", self.mode)))
    }

    /// A setting is usable when its mode parses and auto mode carries an API key.
    pub fn validate(&self) -> Result<ModelMode, BridgeError> {
        let mode = self.mode()?;
        if mode == ModelMode::Auto && self.auto_mode_api_key.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "auto mode requires an API key".to_string(),
            ));
        }
        Ok(mode)
    }

    /// Chat model name for auto mode, honoring the override.
    pub fn auto_chat_model(&self) -> &str {
        if self.chat_model.is_empty() {
            ModelType::Chat.auto_mode_default()
        } else {
            &self.chat_model
        }
    }
}

/// A configured model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub provider: String,
    /// Model name at the provider.
    pub model: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_header: String,
    #[serde(default)]
    pub api_version: String,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Model {
    /// Descriptor for an auto-provisioned model on the managed endpoint.
    pub fn managed(model_type: ModelType, name: &str, base_url: &str, api_key: &str) -> Self {
        Self {
            id: String::new(),
            model_type,
            provider: MANAGED_PROVIDER.to_string(),
            model: name.to_string(),
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            api_header: String::new(),
            api_version: String::new(),
            is_active: true,
            parameters: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }
}

/// Token counts reported for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Model {
    /// Add `usage` to the running counters.
    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
    }
}

/// Partial update of a registry model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateModelReq {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: Option<ModelType>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api_header: Option<String>,
    pub api_version: Option<String>,
    pub is_active: Option<bool>,
    pub parameters: Option<serde_json::Value>,
}

impl UpdateModelReq {
    /// Apply the present fields onto `model`.
    pub fn apply(&self, model: &mut Model) {
        if let Some(t) = self.model_type {
            model.model_type = t;
        }
        if let Some(v) = &self.provider {
            model.provider = v.clone();
        }
        if let Some(v) = &self.model {
            model.model = v.clone();
        }
        if let Some(v) = &self.base_url {
            model.base_url = v.clone();
        }
        if let Some(v) = &self.api_key {
            model.api_key = v.clone();
        }
        if let Some(v) = &self.api_header {
            model.api_header = v.clone();
        }
        if let Some(v) = &self.api_version {
            model.api_version = v.clone();
        }
        if let Some(v) = self.is_active {
            model.is_active = v;
        }
        if let Some(v) = &self.parameters {
            model.parameters = Some(v.clone());
        }
    }
}

/// A knowledge base and its retrieval dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub dataset_id: String,
}

/// A published node revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: String,
    pub kb_id: String,
    #[serde(default = "default_published")]
    pub published: bool,
}

fn default_published() -> bool {
    true
}

/// Action carried by an indexing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorAction {
    Upsert,
    Delete,
}

/// Asynchronous "refresh the vector for this unit" message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorRequest {
    pub kb_id: String,
    #[serde(rename = "node_release_id")]
    pub unit_id: String,
    pub action: VectorAction,
}

impl VectorRequest {
    pub fn upsert(unit: &ContentUnit) -> Self {
        Self {
            kb_id: unit.kb_id.clone(),
            unit_id: unit.id.clone(),
            action: VectorAction::Upsert,
        }
    }
}

/// Which surface a chat request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    Web,
    Widget,
    McpServer,
}

/// Request submitted to the chat pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub kb_id: String,
    pub message: String,
    pub app_type: AppType,
}

/// Kind of a chat stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatEventKind {
    Data,
    Done,
    Error,
}

/// One event of a streaming answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type")]
    pub kind: ChatEventKind,
    #[serde(default)]
    pub content: String,
}

impl ChatEvent {
    pub fn data(content: impl Into<String>) -> Self {
        Self {
            kind: ChatEventKind::Data,
            content: content.into(),
        }
    }

    pub fn done() -> Self {
        Self {
            kind: ChatEventKind::Done,
            content: String::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            kind: ChatEventKind::Error,
            content: content.into(),
        }
    }
}

/// Per-knowledge-base MCP server settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerSettings {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub docs_tool: DocsToolSettings,
    #[serde(default)]
    pub sample_auth: SampleAuth,
}

/// Overrides for the exposed tool's identity. Empty means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocsToolSettings {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
}

/// Shared-secret bearer authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleAuth {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_without_key_is_invalid() {
        let setting = ModelModeSetting {
            mode: "auto".to_string(),
            ..Default::default()
        };
        assert!(matches!(setting.validate(), Err(BridgeError::ConfigInvalid(_))));
    }

    #[test]
    fn manual_ignores_key() {
        let setting = ModelModeSetting {
            mode: "manual".to_string(),
            ..Default::default()
        };
        assert_eq!(setting.validate().unwrap(), ModelMode::Manual);

        let with_key = ModelModeSetting {
            auto_mode_api_key: "k".to_string(),
            ..setting
        };
        assert_eq!(with_key.validate().unwrap(), ModelMode::Manual);
    }

    #[test]
    fn empty_mode_is_not_a_third_state() {
        assert!(ModelModeSetting::default().validate().is_err());
        let bogus = ModelModeSetting {
            mode: "hybrid".to_string(),
            ..Default::default()
        };
        assert!(bogus.validate().is_err());
    }

    #[test]
    fn chat_override() {
        let mut setting = ModelModeSetting::initial();
        assert_eq!(setting.auto_chat_model(), "deepseek-v3.1");
        setting.chat_model = "gpt-x".to_string();
        assert_eq!(setting.auto_chat_model(), "gpt-x");
    }

    #[test]
    fn model_type_wire_names() {
        let json = serde_json::to_string(&ModelType::AnalysisVl).unwrap();
        assert_eq!(json, "\"analysis-vl\"");
        assert_eq!("analysis-vl".parse::<ModelType>().unwrap(), ModelType::AnalysisVl);
        assert!("vision".parse::<ModelType>().is_err());
    }

    #[test]
    fn unknown_setting_fields_survive_a_roundtrip() {
        let raw = r#"{"mode":"manual","auto_mode_api_key":"","chat_model":"","legacy_flag":true}"#;
        let mut setting: ModelModeSetting = serde_json::from_str(raw).unwrap();
        setting.mode = "auto".to_string();
        let written = serde_json::to_value(&setting).unwrap();
        assert_eq!(written["legacy_flag"], true);
        assert_eq!(written["mode"], "auto");
    }

    #[test]
    fn usage_accumulates() {
        let mut model = Model::managed(ModelType::Chat, "gpt-x", "https://m", "k");
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        model.add_usage(&usage);
        model.add_usage(&usage);
        assert_eq!(model.total_tokens, 30);
        assert_eq!(model.prompt_tokens, 20);
    }

    #[test]
    fn chat_event_wire_shape() {
        let event: ChatEvent = serde_json::from_str(r#"{"type":"data","content":"hi"}"#).unwrap();
        assert_eq!(event, ChatEvent::data("hi"));
        let done: ChatEvent = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert_eq!(done, ChatEvent::done());
    }
}
