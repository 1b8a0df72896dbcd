//! Storage collaborators consumed by the model manager and the bridge.
//!
//! Each trait is a narrow view onto durable state. [`StrataStore`] implements
//! all of them on one embedded database; tests substitute their own doubles
//! where failure injection is needed.

pub mod strata;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::domain::{
    ContentUnit, KnowledgeBase, McpServerSettings, Model, ModelType, TokenUsage, UpdateModelReq,
    VectorRequest,
};
use crate::error::Result;

pub use strata::StrataStore;

/// One configuration blob per (scope, key).
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Raw blob, or `None` if the setting was never written.
    async fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;

    /// Create or replace the blob.
    async fn upsert(&self, scope: &str, key: &str, value: &str, description: &str) -> Result<()>;
}

/// Catalog of configured models.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn create(&self, model: &Model) -> Result<()>;

    /// Apply a partial update; returns the stored model after the update.
    async fn update(&self, req: &UpdateModelReq) -> Result<Model>;

    /// The single active model of `model_type`.
    ///
    /// Returns `None` when there is no active model or more than one.
    async fn get_active_by_type(&self, model_type: ModelType) -> Result<Option<Model>>;

    async fn list_models(&self) -> Result<Vec<Model>>;

    /// Add to a model's token counters; returns the updated model.
    async fn update_usage(&self, model_id: &str, usage: &TokenUsage) -> Result<Model>;
}

/// Knowledge bases and their dataset references.
#[async_trait]
pub trait KnowledgeBaseRepo: Send + Sync {
    async fn list_knowledge_bases(&self) -> Result<Vec<KnowledgeBase>>;

    async fn update_dataset_id(&self, kb_id: &str, dataset_id: &str) -> Result<()>;
}

/// Callback invoked per published unit by [`ContentCursor::for_each_published`].
///
/// The returned future owns what it needs, so visits can await I/O.
pub type UnitVisitor<'a> = dyn FnMut(ContentUnit) -> BoxFuture<'static, Result<()>> + Send + 'a;

/// Resumable traversal over every published content unit.
#[async_trait]
pub trait ContentCursor: Send + Sync {
    /// Visit each published unit once. Stops at the first error from `visit`.
    async fn for_each_published(&self, visit: &mut UnitVisitor<'_>) -> Result<()>;
}

/// Fire-and-forget queue of vector refresh messages.
#[async_trait]
pub trait IndexQueue: Send + Sync {
    /// Fails only when the queue itself cannot accept messages.
    async fn enqueue(&self, requests: Vec<VectorRequest>) -> Result<()>;
}

/// App-level MCP settings per knowledge base.
#[async_trait]
pub trait AppSettingsSource: Send + Sync {
    async fn mcp_server_settings(&self, kb_id: &str) -> Result<McpServerSettings>;
}
