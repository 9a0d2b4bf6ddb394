//! Configuration
//!
//! Two layers: `Settings` reads deployment-wide values from the environment
//! once at startup; `MemoryConfig` is the per-request tuning struct loaded by
//! `config_id` from the relational store and threaded explicitly through the
//! pipeline. Neither is process-global mutable state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// PER-REQUEST MEMORY CONFIG
// ============================================================================

/// Per-request tuning knobs, loaded by `config_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Chat model reference used for extraction / summarization
    pub llm_model_id: String,
    /// Embedding model reference; fixes the vector dimension per index
    pub embedding_model_id: String,
    /// BM25 weight in the content score; embedding gets `1 - alpha`
    pub rerank_alpha: f64,
    /// Activation contribution to memory strength in the forgetting weight
    pub activation_boost_factor: f64,
    /// Nodes below this activation are fusion candidates
    pub forgetting_threshold: f64,
    /// Access history cap per node, oldest dropped first
    pub access_history_cap: usize,
    /// ACT-R decay exponent
    pub activation_decay_d: f64,
    /// Stage-1 candidate set size = limit * candidate_multiplier
    pub candidate_multiplier: usize,
    /// Same tool called this many times consecutively yields a give-up result
    pub max_tool_consecutive_calls: usize,
    /// Base for auto-computed LLM-node iteration budget
    pub auto_max_iterations_base: usize,
    /// Extra iterations per attached tool
    pub auto_max_iterations_per_tool: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            llm_model_id: "default-chat".to_string(),
            embedding_model_id: "default-embedding".to_string(),
            rerank_alpha: 0.6,
            activation_boost_factor: 0.8,
            forgetting_threshold: 0.3,
            access_history_cap: 50,
            activation_decay_d: 0.5,
            candidate_multiplier: 3,
            max_tool_consecutive_calls: 3,
            auto_max_iterations_base: 5,
            auto_max_iterations_per_tool: 2,
        }
    }
}

impl MemoryConfig {
    /// Validate value ranges; alpha outside [0,1] is caller error.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.rerank_alpha) {
            return Err(crate::error::MemoryError::InvalidInput(format!(
                "rerank_alpha must be in [0, 1], got {}",
                self.rerank_alpha
            )));
        }
        if self.access_history_cap == 0 {
            return Err(crate::error::MemoryError::InvalidInput(
                "access_history_cap must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// DEPLOYMENT SETTINGS (ENVIRONMENT)
// ============================================================================

/// Deployment-wide settings read from the environment at startup
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database path; `None` resolves the platform data directory
    pub db_path: Option<PathBuf>,
    /// Redis host for health cache and job locks
    pub redis_host: String,
    /// Redis port
    pub redis_port: u16,
    /// Redis logical database
    pub redis_db: i64,
    /// Redis password, if the deployment requires one
    pub redis_password: Option<String>,
    /// Soft timeout applied to each workflow node
    pub workflow_node_timeout: Duration,
    /// TTL of the health-probe hash in Redis
    pub health_check_seconds: u64,
    /// Keepalive interval for long-lived log streams
    pub log_stream_keepalive_interval: Duration,
    /// Per-provider call timeout for embed/chat requests
    pub provider_timeout: Duration,
    /// Per-query timeout for graph-store calls
    pub graph_query_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: None,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_db: 0,
            redis_password: None,
            workflow_node_timeout: Duration::from_secs(120),
            health_check_seconds: 300,
            log_stream_keepalive_interval: Duration::from_secs(300),
            provider_timeout: Duration::from_secs(60),
            graph_query_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    ///
    /// Reads a `.env` file when present (development convenience), then the
    /// process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Self {
            db_path: std::env::var("MNEMO_DB_PATH").ok().map(PathBuf::from),
            redis_host: env_or("REDIS_HOST", defaults.redis_host),
            redis_port: env_parse("REDIS_PORT", defaults.redis_port),
            redis_db: env_parse("REDIS_DB", defaults.redis_db),
            redis_password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            workflow_node_timeout: Duration::from_secs(env_parse(
                "WORKFLOW_NODE_TIMEOUT",
                defaults.workflow_node_timeout.as_secs(),
            )),
            health_check_seconds: env_parse("HEALTH_CHECK_SECONDS", defaults.health_check_seconds),
            log_stream_keepalive_interval: Duration::from_secs(env_parse(
                "LOG_STREAM_KEEPALIVE_INTERVAL",
                defaults.log_stream_keepalive_interval.as_secs(),
            )),
            provider_timeout: Duration::from_secs(env_parse(
                "PROVIDER_TIMEOUT_SECONDS",
                defaults.provider_timeout.as_secs(),
            )),
            graph_query_timeout: Duration::from_secs(env_parse(
                "GRAPH_QUERY_TIMEOUT_SECONDS",
                defaults.graph_query_timeout.as_secs(),
            )),
        }
    }

    /// Redis connection URL assembled from host/port/db/password.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// TESTS
// ============================================================================
