//! # kb-model-bridge
//!
//! Model configuration manager and MCP tool bridge for a knowledge-base chat
//! service.
//!
//! Two responsibilities live here:
//!
//! - **Model configuration** ([`ModelManager`]): switches between manual
//!   (administrator-picked) and auto (managed, single API key) model modes and
//!   pushes the result to the retrieval service. When the embedding model may
//!   have changed, every knowledge base gets a fresh dataset and every
//!   published unit is queued for re-embedding.
//! - **Tool bridge** ([`McpServer`], [`SessionManager`]): exposes the chat
//!   pipeline as one synchronous MCP tool per session, named and secured by the
//!   session's knowledge base settings.
//!
//! ## Usage
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "handbook": {
//!       "command": "/path/to/kb-model-bridge",
//!       "args": ["--db", "/path/to/data", "--kb-id", "kb-123"]
//!     }
//!   }
//! }
//! ```
//!
//! ## Library Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use kb_model_bridge::{DocsTool, HttpChatPipeline, McpServer, SessionManager, StrataStore};
//!
//! let store = Arc::new(StrataStore::cache().expect("Failed to create database"));
//! let chat = Arc::new(HttpChatPipeline::new("http://127.0.0.1:8000/chat").expect("client"));
//! let sessions = SessionManager::new(DocsTool { app_settings: store, chat });
//! let server = McpServer::new(Arc::new(sessions));
//! // server.run_stdio(Default::default()).await
//! ```

pub mod chat;
pub mod config;
pub mod domain;
mod error;
pub mod http;
pub mod model;
pub mod rag;
mod server;
mod session;
pub mod store;
mod tools;

pub use chat::{collect_response, ChatPipeline, HttpChatPipeline};
pub use config::Config;
pub use error::{rpc_codes, BridgeError, Result};
pub use model::{ModelDeps, ModelManager, ReindexReport, SyncReport, TypeOutcome, TypeReport};
pub use rag::{HttpRetrievalClient, RagModel, RetrievalService};
pub use server::{Connection, JsonRpcRequest, JsonRpcResponse, McpServer};
pub use session::{RequestContext, SessionManager, ToolBinding};
pub use store::StrataStore;
pub use tools::docs::{DocsTool, DEFAULT_TOOL_DESC, DEFAULT_TOOL_NAME};
pub use tools::ToolDef;
