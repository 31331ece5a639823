// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use mux_config::CliAgentConfig;

use crate::bridge::SessionBridge;
use crate::executor::{CliExecutor, CliResult};
use crate::plugin::PluginRegistry;

/// Trailing stderr bytes included in failure reports.
const STDERR_TAIL: usize = 2_000;

/// Summarizes oversize CLI outputs through a small model.
///
/// Implemented by the executor layer; injected here to avoid a dependency
/// cycle between the CLI service and the provider adapters.
#[async_trait]
pub trait OutputSummarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> anyhow::Result<String>;
}

/// One request against a CLI coding agent.
#[derive(Debug, Clone)]
pub struct CliAgentRequest {
    /// Registry key: "claude" | "gemini" | "codex".
    pub cli_name: String,
    pub task: String,
    pub project_dir: PathBuf,
    pub role: Option<String>,
    pub reasoning_effort: Option<String>,
    pub extra_flags: Option<String>,
    pub timeout: Duration,
    /// Unified session key components.
    pub project: String,
    pub tool: String,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct CliAgentResponse {
    pub content: String,
    /// Native CLI session id recorded for the next resume.
    pub cli_session_id: Option<String>,
    /// Full transcript on disk when the output was summarized or truncated.
    pub transcript_path: Option<PathBuf>,
    pub summarized: bool,
}

/// Subprocess failure modes, surfaced with the stderr tail.  CLI runs are
/// never retried by the executor.
#[derive(Debug, thiserror::Error)]
pub enum CliAgentError {
    #[error("unknown CLI agent {0:?}")]
    UnknownCli(String),
    #[error("CLI agent timed out after {timeout:?}: {stderr_tail}")]
    TimedOut {
        timeout: Duration,
        stderr_tail: String,
    },
    #[error("CLI agent produced no output for {idle:?} and was killed: {stderr_tail}")]
    IdleTimeout {
        idle: Duration,
        stderr_tail: String,
    },
    #[error("CLI agent exited with code {code}: {stderr_tail}")]
    Failed { code: i32, stderr_tail: String },
    #[error(transparent)]
    Store(#[from] mux_store::StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Orchestrates external coding-agent subprocesses while presenting them as
/// just another tool to the host.
pub struct CliAgentService {
    executor: CliExecutor,
    registry: PluginRegistry,
    bridge: SessionBridge,
    config: CliAgentConfig,
    /// Where oversize transcripts are written.
    state_dir: PathBuf,
    summarizer: Option<Arc<dyn OutputSummarizer>>,
}

impl CliAgentService {
    pub fn new(
        registry: PluginRegistry,
        bridge: SessionBridge,
        config: CliAgentConfig,
        state_dir: PathBuf,
    ) -> Self {
        let executor = CliExecutor::new(Duration::from_secs(config.idle_timeout_seconds));
        Self {
            executor,
            registry,
            bridge,
            config,
            state_dir,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn OutputSummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Fresh subprocess environment: PATH + HOME + allowlisted keys + the
    /// plugin's reasoning variables.  The host environment never leaks in
    /// wholesale; `cli_home` redirects credential discovery per tenant.
    fn build_env(&self, reasoning_vars: HashMap<String, String>) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_string(), path);
        }
        let home = match &self.config.cli_home {
            Some(dir) => Some(dir.to_string_lossy().into_owned()),
            None => std::env::var("HOME").ok(),
        };
        if let Some(home) = home {
            env.insert("HOME".to_string(), home);
        }
        for key in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }
        env.extend(reasoning_vars);
        env
    }

    /// Working directories that carry no project context get no preamble.
    fn is_ephemeral_dir(dir: &std::path::Path) -> bool {
        dir == std::path::Path::new("/") || dir.starts_with(std::env::temp_dir())
    }

    pub async fn run(&self, req: &CliAgentRequest) -> Result<CliAgentResponse, CliAgentError> {
        let plugin = self
            .registry
            .get(&req.cli_name)
            .ok_or_else(|| CliAgentError::UnknownCli(req.cli_name.clone()))?;

        // CWD injection happens here, once, before the plugin sees the task.
        let task = if Self::is_ephemeral_dir(&req.project_dir) {
            req.task.clone()
        } else {
            format!(
                "Work from this directory: {}\n\n{}",
                req.project_dir.display(),
                req.task
            )
        };

        let existing = self
            .bridge
            .cli_session_id(&req.project, &req.tool, &req.session_id, &req.cli_name)
            .await?;

        let context_dirs = vec![req.project_dir.to_string_lossy().into_owned()];
        let args = match &existing {
            Some(native_id) => {
                debug!(cli = %req.cli_name, native_id, "resuming CLI session");
                plugin.build_resume_args(
                    native_id,
                    &task,
                    req.extra_flags.as_deref(),
                    req.reasoning_effort.as_deref(),
                )
            }
            None => plugin.build_new_session_args(
                &task,
                &context_dirs,
                req.role.as_deref(),
                req.extra_flags.as_deref(),
                req.reasoning_effort.as_deref(),
            ),
        };

        let mut command = vec![plugin.executable().to_string()];
        command.extend(args);
        let env = self.build_env(plugin.reasoning_env_vars(req.reasoning_effort.as_deref()));

        let result = self
            .executor
            .execute(&command, &env, req.timeout, Some(&req.project_dir), None)
            .await;
        self.check_result(&result, req)?;

        let parsed = plugin.parse_output(&result.stdout);
        if let Some(native_id) = &parsed.session_id {
            if existing.as_deref() != Some(native_id.as_str()) {
                self.bridge
                    .store_cli_session_id(
                        &req.project,
                        &req.tool,
                        &req.session_id,
                        &req.cli_name,
                        native_id,
                    )
                    .await?;
            }
        }

        self.clean_output(parsed.content, parsed.session_id, req)
            .await
    }

    fn check_result(
        &self,
        result: &CliResult,
        req: &CliAgentRequest,
    ) -> Result<(), CliAgentError> {
        let tail = || {
            let s = &result.stderr;
            s[s.len().saturating_sub(STDERR_TAIL)..].to_string()
        };
        if result.timed_out {
            return Err(CliAgentError::TimedOut {
                timeout: req.timeout,
                stderr_tail: tail(),
            });
        }
        if result.idle_timeout_triggered {
            return Err(CliAgentError::IdleTimeout {
                idle: Duration::from_secs(self.config.idle_timeout_seconds),
                stderr_tail: tail(),
            });
        }
        if result.return_code != 0 {
            return Err(CliAgentError::Failed {
                code: result.return_code,
                stderr_tail: tail(),
            });
        }
        Ok(())
    }

    /// Very large outputs are written to disk and replaced by a summary (or
    /// a truncation when no summarizer is wired), with a pointer to the full
    /// transcript.
    async fn clean_output(
        &self,
        content: String,
        cli_session_id: Option<String>,
        req: &CliAgentRequest,
    ) -> Result<CliAgentResponse, CliAgentError> {
        let approx_tokens = content.len() / 4;
        if approx_tokens <= self.config.output_summary_token_threshold {
            return Ok(CliAgentResponse {
                content,
                cli_session_id,
                transcript_path: None,
                summarized: false,
            });
        }

        let dir = self.state_dir.join("transcripts");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CliAgentError::Other(e.into()))?;
        let path = dir.join(format!("{}-{}.txt", req.cli_name, req.session_id));
        tokio::fs::write(&path, &content)
            .await
            .map_err(|e| CliAgentError::Other(e.into()))?;
        info!(path = %path.display(), approx_tokens, "CLI output exceeds threshold");

        let (short, summarized) = match &self.summarizer {
            Some(s) => match s.summarize(&content).await {
                Ok(summary) => (summary, true),
                Err(e) => {
                    warn!(error = %e, "output summarization failed, truncating instead");
                    (truncate_tokens(&content, self.config.output_summary_token_threshold), false)
                }
            },
            None => (
                truncate_tokens(&content, self.config.output_summary_token_threshold),
                false,
            ),
        };

        Ok(CliAgentResponse {
            content: format!("{short}\n\n[full transcript: {}]", path.display()),
            cli_session_id,
            transcript_path: Some(path),
            summarized,
        })
    }
}

fn truncate_tokens(text: &str, max_tokens: usize) -> String {
    let max_bytes = max_tokens * 4;
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated]", &text[..cut])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
