//! Command-line and environment configuration.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::DEFAULT_MANAGED_BASE_URL;

/// Model configuration manager and MCP tool bridge.
///
/// Serves MCP over stdio (one session) or HTTP (many sessions plus the
/// model administration routes).
#[derive(Debug, Parser)]
#[command(name = "kb-model-bridge")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Path to the database directory.
    /// Mutually exclusive with --cache.
    #[arg(long, value_name = "PATH", env = "KB_BRIDGE_DB")]
    pub db: Option<PathBuf>,

    /// Use an in-memory (cache) database.
    /// Data is not persisted. Mutually exclusive with --db.
    #[arg(long)]
    pub cache: bool,

    /// Serve HTTP on this address instead of stdio.
    #[arg(long, value_name = "ADDR", env = "KB_BRIDGE_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Knowledge base bound to the stdio session.
    #[arg(long, value_name = "ID", env = "KB_BRIDGE_KB_ID")]
    pub kb_id: Option<String>,

    /// Bearer token presented by the stdio session.
    #[arg(long, value_name = "TOKEN", env = "KB_BRIDGE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Base URL of the retrieval service.
    #[arg(
        long,
        value_name = "URL",
        env = "KB_BRIDGE_RAG_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    pub rag_url: String,

    /// Timeout for retrieval service calls, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    pub rag_timeout: u64,

    /// Endpoint that streams chat answers as server-sent events.
    #[arg(
        long,
        value_name = "URL",
        env = "KB_BRIDGE_CHAT_URL",
        default_value = "http://127.0.0.1:8000/share/v1/chat/message"
    )]
    pub chat_url: String,

    /// Endpoint of the managed models used in auto mode.
    #[arg(
        long,
        value_name = "URL",
        env = "KB_BRIDGE_MANAGED_URL",
        default_value = DEFAULT_MANAGED_BASE_URL
    )]
    pub managed_url: String,

    /// Seed default models into an empty retrieval service at startup.
    #[arg(long)]
    pub seed_models: bool,

    /// API key for the seeded models. Falls back to the stored auto-mode key;
    /// seeding is skipped when neither is set.
    #[arg(long, value_name = "KEY", env = "KB_BRIDGE_SEED_API_KEY", hide_env_values = true)]
    pub seed_api_key: Option<String>,

    /// Drop HTTP sessions unused for this many seconds.
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    pub session_idle: u64,

    /// Enable debug logging to stderr.
    #[arg(long, short)]
    pub verbose: bool,
}

impl Config {
    /// Check flag combinations clap cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.db.is_some() && self.cache {
            return Err("--db and --cache are mutually exclusive".to_string());
        }
        if self.db.is_none() && !self.cache {
            return Err("Must specify either --db <PATH> or --cache".to_string());
        }
        Ok(())
    }

    pub fn rag_timeout(&self) -> Duration {
        Duration::from_secs(self.rag_timeout)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_exactly_one_store() {
        let cfg = Config::parse_from(["kb-model-bridge", "--cache"]);
        assert!(cfg.validate().is_ok());
        assert!(cfg.listen.is_none());

        let both = Config::parse_from(["kb-model-bridge", "--cache", "--db", "/tmp/x"]);
        assert!(both.validate().is_err());
    }

    #[test]
    fn http_flags() {
        let cfg = Config::parse_from([
            "kb-model-bridge",
            "--db",
            "/var/lib/bridge",
            "--listen",
            "127.0.0.1:9000",
            "--managed-url",
            "https://models.example",
        ]);
        assert_eq!(cfg.listen.unwrap().port(), 9000);
        assert_eq!(cfg.managed_url, "https://models.example");
        assert_eq!(cfg.rag_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.session_idle(), Duration::from_secs(3600));
    }

    #[test]
    fn seeding_flags() {
        let cfg = Config::parse_from([
            "kb-model-bridge",
            "--cache",
            "--seed-models",
            "--seed-api-key",
            "sk-seed",
        ]);
        assert!(cfg.seed_models);
        assert_eq!(cfg.seed_api_key.as_deref(), Some("sk-seed"));
    }
}
