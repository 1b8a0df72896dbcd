//! Model configuration manager and MCP tool bridge.
//!
//! Run with `kb-model-bridge --db /path/to/data` for a stdio session, or add
//! `--listen 0.0.0.0:8090` to serve HTTP.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use kb_model_bridge::http::{self, AppState};
use kb_model_bridge::{
    Config, DocsTool, HttpChatPipeline, HttpRetrievalClient, McpServer, ModelDeps, ModelManager,
    RequestContext, SessionManager, StrataStore,
};

#[tokio::main]
async fn main() {
    let config = Config::parse();

    // Set up logging; stdout carries the protocol.
    let mut filter = EnvFilter::from_default_env();
    if config.verbose {
        if let Ok(directive) = "kb_model_bridge=debug".parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> kb_model_bridge::Result<()> {
    let store = match &config.db {
        Some(path) => StrataStore::open(path)?,
        None => StrataStore::cache()?,
    };
    let store = Arc::new(store);

    let rag = Arc::new(HttpRetrievalClient::new(&config.rag_url, config.rag_timeout())?);
    let chat = Arc::new(HttpChatPipeline::new(&config.chat_url)?);

    let models = Arc::new(ModelManager::with_managed_base_url(
        ModelDeps {
            settings: store.clone(),
            models: store.clone(),
            knowledge_bases: store.clone(),
            nodes: store.clone(),
            queue: store.clone(),
            rag,
        },
        &config.managed_url,
    ));
    models.ensure_model_mode_setting().await?;

    if config.seed_models {
        // Best-effort: the bridge still serves tool calls without the retrieval service.
        let seeded = models
            .init_rag_models(config.seed_api_key.as_deref(), 60, Duration::from_secs(1))
            .await;
        if let Err(e) = seeded {
            tracing::error!(error = %e, "init embedding, rerank and analysis models failed");
        }
    }

    let sessions = SessionManager::new(DocsTool {
        app_settings: store.clone(),
        chat,
    });
    let server = McpServer::new(Arc::new(sessions));

    match config.listen {
        Some(addr) => http::serve(addr, AppState { server, models }, config.session_idle()).await,
        None => {
            let context = RequestContext::new(config.kb_id.clone(), config.token.clone());
            server.run_stdio(context).await
        }
    }
}
