//! Tool definitions and argument helpers.
//!
//! The bridge exposes exactly one tool per session, whose name and
//! description come from the knowledge base's settings. Definitions are built
//! with the [`schema!`](crate::schema) macro.

pub mod docs;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{BridgeError, Result};

/// A tool definition for the MCP tools/list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool name (e.g., "get_docs")
    pub name: String,
    /// Tool description
    pub description: String,
    /// JSON Schema for the input parameters
    #[serde(rename = "inputSchema")]
    pub input_schema: JsonValue,
}

impl ToolDef {
    /// Create a new tool definition.
    pub fn new(name: &str, description: &str, input_schema: JsonValue) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}

/// Helper to get a required, non-empty string argument.
pub fn get_string_arg(args: &Map<String, JsonValue>, name: &str) -> Result<String> {
    match args.get(name) {
        Some(JsonValue::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(JsonValue::String(_)) | Some(JsonValue::Null) | None => {
            Err(BridgeError::MissingArg(name.to_string()))
        }
        Some(_) => Err(BridgeError::InvalidArg {
            name: name.to_string(),
            reason: "expected a string".to_string(),
        }),
    }
}

/// Helper macro for creating JSON Schema for tool input parameters.
#[macro_export]
macro_rules! schema {
    // Object whose properties are all required
    (object {
        required: { $($req_name:literal : $req_type:tt),* $(,)? }
    }) => {{
        let required: Vec<&str> = vec![$($req_name),*];

        let mut props = serde_json::Map::new();
        $(props.insert($req_name.to_string(), $crate::schema!(@type $req_type));)*

        serde_json::json!({
            "type": "object",
            "properties": props,
            "required": required
        })
    }};

    // Type mappings, optionally with a description
    (@type ($ty:ident, $desc:literal)) => {{
        let mut t = $crate::schema!(@type $ty);
        t["description"] = serde_json::json!($desc);
        t
    }};
    (@type string) => { serde_json::json!({"type": "string"}) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_lists_required_fields() {
        let schema = crate::schema!(object {
            required: { "message": (string, "User message"), "topic": string }
        });
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["message", "topic"]));
        assert_eq!(schema["properties"]["message"]["description"], "User message");
        assert_eq!(schema["properties"]["topic"], json!({"type": "string"}));
    }

    #[test]
    fn empty_string_counts_as_missing() {
        let args = json!({"message": ""});
        let args = args.as_object().unwrap();
        assert!(matches!(
            get_string_arg(args, "message"),
            Err(BridgeError::MissingArg(_))
        ));
        assert!(matches!(
            get_string_arg(&json!({"message": 3}).as_object().unwrap().clone(), "message"),
            Err(BridgeError::InvalidArg { .. })
        ));
    }
}
