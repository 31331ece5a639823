// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

/// Resolved configuration for the whole routing core.
///
/// Parsed from layered YAML files (see [`crate::load`]); the core never reads
/// config files or raw environment variables itself — it receives this struct
/// fully resolved.  API keys are the one exception: only the *name* of the
/// environment variable is carried here, and adapters read it at construction
/// time so that secrets never land in serialized config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub vector_stores: VectorStoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub cli_agents: CliAgentConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Per-provider connection settings keyed by provider id
    /// ("openai" | "gemini" | "xai" | "anthropic" | "ollama").
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Project directory this server instance serves.  The basename becomes
    /// the `project` component of every session key.
    #[serde(default)]
    pub project_path: Option<PathBuf>,
}

impl Config {
    /// Provider settings by id, falling back to an all-default entry.
    pub fn provider(&self, id: &str) -> ProviderConfig {
        self.providers.get(id).cloned().unwrap_or_default()
    }

    /// The `project` key component: basename of `project_path`, or the
    /// current directory's basename when unset.
    pub fn project_name(&self) -> String {
        let path = self
            .project_path
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Connection settings for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Environment variable holding the API key (read at adapter construction).
    pub api_key_env: Option<String>,
    /// Base URL override.  Hosted providers auto-select the correct default.
    pub base_url: Option<String>,
    /// GCP project id (Vertex-hosted Gemini only).
    pub project: Option<String>,
    /// GCP location (Vertex-hosted Gemini only).
    pub location: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: None,
            base_url: None,
            project: None,
            location: None,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Session persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Path to the session database.  Relative paths resolve against the
    /// project directory.
    #[serde(default = "SessionConfig::default_db_path")]
    pub db_path: PathBuf,
    /// Row time-to-live in seconds.  Expired sessions read as absent.
    #[serde(default = "SessionConfig::default_ttl")]
    pub ttl_seconds: u64,
    /// Probability that any single save triggers a background sweep of
    /// expired rows.  Amortizes reaping without a dedicated timer.
    #[serde(default = "SessionConfig::default_cleanup_probability")]
    pub cleanup_probability: f64,
}

impl SessionConfig {
    fn default_db_path() -> PathBuf {
        PathBuf::from(".mcp_sessions.sqlite3")
    }
    fn default_ttl() -> u64 {
        15 * 24 * 3600
    }
    fn default_cleanup_probability() -> f64 {
        0.01
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: Self::default_db_path(),
            ttl_seconds: Self::default_ttl(),
            cleanup_probability: Self::default_cleanup_probability(),
        }
    }
}

/// Vector store lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// Preferred provider for new stores; falls back to "local" on failure.
    #[serde(default = "VectorStoreConfig::default_provider")]
    pub provider: String,
    /// Store lease in seconds; `renew_lease` extends it.
    #[serde(default = "VectorStoreConfig::default_ttl")]
    pub ttl_seconds: u64,
    /// Number of parallel upload batches for large file sets.
    #[serde(default = "VectorStoreConfig::default_parallel_batches")]
    pub parallel_batches: usize,
    /// Retry attempts per failed batch before giving up.
    #[serde(default = "VectorStoreConfig::default_max_retries")]
    pub max_retries: u32,
    /// Per-batch upload-and-poll timeout in seconds.
    #[serde(default = "VectorStoreConfig::default_poll_timeout")]
    pub upload_poll_timeout: u64,
    /// File count above which a store is summarized and rolled over.
    #[serde(default = "VectorStoreConfig::default_rollover")]
    pub rollover_threshold: usize,
    /// Directory for local store persistence.  Defaults to a `mux` state dir.
    #[serde(default)]
    pub local_store_dir: Option<PathBuf>,
}

impl VectorStoreConfig {
    fn default_provider() -> String {
        "openai".into()
    }
    fn default_ttl() -> u64 {
        7 * 24 * 3600
    }
    fn default_parallel_batches() -> usize {
        10
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_poll_timeout() -> u64 {
        15
    }
    fn default_rollover() -> usize {
        500
    }
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            ttl_seconds: Self::default_ttl(),
            parallel_batches: Self::default_parallel_batches(),
            max_retries: Self::default_max_retries(),
            upload_poll_timeout: Self::default_poll_timeout(),
            rollover_threshold: Self::default_rollover(),
            local_store_dir: None,
        }
    }
}

/// Top-level request driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Fraction of the model context window handed to the token optimizer
    /// as the initial inline budget.
    #[serde(default = "ExecutorConfig::default_context_percentage")]
    pub context_percentage: f64,
    /// Budget multiplier applied on a `max_output_tokens` incomplete signal.
    #[serde(default = "ExecutorConfig::default_reduction_factor")]
    pub context_reduction_factor: f64,
    /// Total adapter attempts (initial + retries) for the reduced-context loop.
    #[serde(default = "ExecutorConfig::default_max_attempts")]
    pub max_attempts: u32,
    /// Fallback per-call deadline in seconds when a blueprint sets none.
    #[serde(default = "ExecutorConfig::default_timeout")]
    pub default_timeout_seconds: u64,
    /// Bound on concurrently executing server-side tool calls within a turn.
    #[serde(default = "ExecutorConfig::default_tool_concurrency")]
    pub tool_concurrency: usize,
    /// Blueprint used by `describe_session` to summarize transcripts.
    #[serde(default = "ExecutorConfig::default_summarizer")]
    pub default_summarization_model: String,
    /// Suppress the project-memory search tool for every call.
    #[serde(default)]
    pub disable_memory_search: bool,
}

impl ExecutorConfig {
    fn default_context_percentage() -> f64 {
        0.85
    }
    fn default_reduction_factor() -> f64 {
        0.75
    }
    fn default_max_attempts() -> u32 {
        2
    }
    fn default_timeout() -> u64 {
        300
    }
    fn default_tool_concurrency() -> usize {
        8
    }
    fn default_summarizer() -> String {
        "chat_with_gemini_2_5_flash".into()
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            context_percentage: Self::default_context_percentage(),
            context_reduction_factor: Self::default_reduction_factor(),
            max_attempts: Self::default_max_attempts(),
            default_timeout_seconds: Self::default_timeout(),
            tool_concurrency: Self::default_tool_concurrency(),
            default_summarization_model: Self::default_summarizer(),
            disable_memory_search: false,
        }
    }
}

/// CLI coding-agent subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliAgentConfig {
    /// Kill a subprocess when it produces no output for this many seconds
    /// (armed only after the first output byte).  Coding CLIs legitimately
    /// think for minutes, but can also hang indefinitely.
    #[serde(default = "CliAgentConfig::default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Environment variable names forwarded into the subprocess on top of
    /// PATH and HOME.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    /// Override HOME for subprocesses (per-tenant credential isolation).
    #[serde(default)]
    pub cli_home: Option<PathBuf>,
    /// Outputs above this approximate token count are summarized; the full
    /// transcript is written next to the session DB and referenced by path.
    #[serde(default = "CliAgentConfig::default_summary_threshold")]
    pub output_summary_token_threshold: usize,
}

impl CliAgentConfig {
    fn default_idle_timeout() -> u64 {
        600
    }
    fn default_summary_threshold() -> usize {
        20_000
    }
}

impl Default for CliAgentConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: Self::default_idle_timeout(),
            env_allowlist: Vec::new(),
            cli_home: None,
            output_summary_token_threshold: Self::default_summary_threshold(),
        }
    }
}

/// Transport-level timeouts.  "No timeout" is treated as a bug; every HTTP
/// client in the workspace is built from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_connect")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "HttpConfig::default_read")]
    pub read_timeout_seconds: u64,
    #[serde(default = "HttpConfig::default_pool_idle")]
    pub pool_idle_timeout_seconds: u64,
    #[serde(default = "HttpConfig::default_pool_max_idle")]
    pub pool_max_idle_per_host: usize,
}

impl HttpConfig {
    fn default_connect() -> u64 {
        20
    }
    fn default_read() -> u64 {
        180
    }
    fn default_pool_idle() -> u64 {
        60
    }
    fn default_pool_max_idle() -> usize {
        20
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: Self::default_connect(),
            read_timeout_seconds: Self::default_read(),
            pool_idle_timeout_seconds: Self::default_pool_idle(),
            pool_max_idle_per_host: Self::default_pool_max_idle(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.session.cleanup_probability, 0.01);
        assert_eq!(cfg.vector_stores.parallel_batches, 10);
        assert_eq!(cfg.vector_stores.max_retries, 3);
        assert_eq!(cfg.executor.context_reduction_factor, 0.75);
        assert_eq!(cfg.executor.max_attempts, 2);
        assert_eq!(cfg.cli_agents.idle_timeout_seconds, 600);
        assert_eq!(cfg.http.connect_timeout_seconds, 20);
    }

    #[test]
    fn provider_lookup_falls_back_to_default() {
        let cfg = Config::default();
        let p = cfg.provider("openai");
        assert!(p.enabled);
        assert!(p.api_key_env.is_none());
    }

    #[test]
    fn api_key_resolves_from_env() {
        std::env::set_var("MUX_TEST_KEY_XYZ", "sk-test");
        let p = ProviderConfig {
            api_key_env: Some("MUX_TEST_KEY_XYZ".into()),
            ..Default::default()
        };
        assert_eq!(p.api_key().as_deref(), Some("sk-test"));
        std::env::remove_var("MUX_TEST_KEY_XYZ");
    }

    #[test]
    fn api_key_empty_env_is_none() {
        std::env::set_var("MUX_TEST_KEY_EMPTY", "");
        let p = ProviderConfig {
            api_key_env: Some("MUX_TEST_KEY_EMPTY".into()),
            ..Default::default()
        };
        assert!(p.api_key().is_none());
        std::env::remove_var("MUX_TEST_KEY_EMPTY");
    }

    #[test]
    fn config_deserializes_partial_yaml() {
        let cfg: Config = serde_yaml::from_str(
            "session:\n  ttl_seconds: 60\nexecutor:\n  max_attempts: 5\n",
        )
        .unwrap();
        assert_eq!(cfg.session.ttl_seconds, 60);
        assert_eq!(cfg.executor.max_attempts, 5);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.vector_stores.rollover_threshold, 500);
    }

    #[test]
    fn project_name_from_path() {
        let cfg = Config {
            project_path: Some(PathBuf::from("/home/user/src/myproj")),
            ..Default::default()
        };
        assert_eq!(cfg.project_name(), "myproj");
    }
}
