//! MCP session management.
//!
//! Each client session gets one [`ToolBinding`], created when the session
//! registers and dropped when it closes or sits idle too long. Bindings are
//! immutable; tool calls only read them, so concurrent calls share nothing
//! mutable.

use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::{BridgeError, Result};
use crate::tools::docs::{self, DocsTool};
use crate::tools::ToolDef;

/// Connection-level context, fixed by the transport when the client connects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Knowledge base the connection is scoped to.
    pub kb_id: Option<String>,
    /// Bearer token presented by the client.
    pub token: Option<String>,
}

impl RequestContext {
    pub fn new(kb_id: Option<String>, token: Option<String>) -> Self {
        Self {
            kb_id: kb_id.filter(|s| !s.is_empty()),
            token: token.filter(|s| !s.is_empty()),
        }
    }
}

/// The tool a session sees, resolved once at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolBinding {
    pub session_id: String,
    pub context: RequestContext,
    pub tool: ToolDef,
}

struct Entry {
    binding: Arc<ToolBinding>,
    last_seen: Instant,
}

type Bindings = HashMap<String, Entry>;

/// Registry of live sessions and the tool handler they share.
pub struct SessionManager {
    bindings: RwLock<Bindings>,
    docs: DocsTool,
}

impl SessionManager {
    pub fn new(docs: DocsTool) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            docs,
        }
    }

    /// Register a new session with a generated id.
    pub async fn register(&self, context: RequestContext) -> Arc<ToolBinding> {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.register_with_id(session_id, context).await
    }

    /// Register a session under a caller-chosen id.
    ///
    /// The tool name and description come from the knowledge base's settings;
    /// when there is no knowledge base or the lookup fails the defaults are used.
    pub async fn register_with_id(
        &self,
        session_id: String,
        context: RequestContext,
    ) -> Arc<ToolBinding> {
        let tool = match context.kb_id.as_deref() {
            Some(kb_id) => match self.docs.app_settings.mcp_server_settings(kb_id).await {
                Ok(settings) => docs::tool_def(Some(&settings)),
                Err(e) => {
                    tracing::warn!(
                        kb_id,
                        error = %e,
                        "failed to get mcp settings, using default tool name and description"
                    );
                    docs::tool_def(None)
                }
            },
            None => {
                tracing::warn!("no kb_id on connection, using default tool name and description");
                docs::tool_def(None)
            }
        };

        let binding = Arc::new(ToolBinding {
            session_id: session_id.clone(),
            context,
            tool,
        });
        let entry = Entry {
            binding: binding.clone(),
            last_seen: Instant::now(),
        };
        self.write().insert(session_id.clone(), entry);
        tracing::debug!(session_id = %session_id, tool = %binding.tool.name, "session registered");
        binding
    }

    /// Look up a live session and mark it as used.
    pub fn binding(&self, session_id: &str) -> Result<Arc<ToolBinding>> {
        let mut bindings = self.write();
        let entry = bindings
            .get_mut(session_id)
            .ok_or_else(|| BridgeError::UnknownSession(session_id.to_string()))?;
        entry.last_seen = Instant::now();
        Ok(entry.binding.clone())
    }

    /// Drop a session. Returns false if it was not registered.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.write().remove(session_id).is_some();
        if removed {
            tracing::debug!(session_id, "session closed");
        }
        removed
    }

    /// Drop every session unused for longer than `max_idle`. Returns how many
    /// were dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut bindings = self.write();
        let before = bindings.len();
        bindings.retain(|_, entry| entry.last_seen.elapsed() <= max_idle);
        let evicted = before - bindings.len();
        if evicted > 0 {
            tracing::debug!(evicted, "idle sessions evicted");
        }
        evicted
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tools visible to a session.
    pub fn tools(&self, session_id: &str) -> Result<Vec<ToolDef>> {
        Ok(vec![self.binding(session_id)?.tool.clone()])
    }

    /// Dispatch a tool call within a session.
    ///
    /// The knowledge base is the one the session registered with; `token` is
    /// whatever the current request presented.
    pub async fn call_tool(
        &self,
        session_id: &str,
        token: Option<&str>,
        name: &str,
        args: Map<String, JsonValue>,
    ) -> Result<JsonValue> {
        let binding = self.binding(session_id)?;
        if name != binding.tool.name {
            return Err(BridgeError::UnknownTool(name.to_string()));
        }
        self.docs
            .call(binding.context.kb_id.as_deref(), token, &args)
            .await
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Bindings> {
        self.bindings.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Bindings> {
        self.bindings.write().unwrap_or_else(|e| e.into_inner())
    }
}
