// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Claude Code CLI plugin.
//!
//! Command formats:
//! - New session: `claude --print --output-format json
//!   --dangerously-skip-permissions [--add-dir <d>]* [--system-prompt <r>]
//!   [extra] <task>`
//! - Resume: `claude --print --output-format json
//!   --dangerously-skip-permissions --resume <id> [extra] <task>`
//!
//! Reasoning effort rides in the `MAX_THINKING_TOKENS` environment
//! variable, not CLI flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::plugin::{CliPlugin, ParsedCliResponse};

/// Thinking-token budgets per effort level.  "medium" is the CLI's own
/// default and is therefore omitted entirely.
const REASONING_EFFORT_TO_TOKENS: &[(&str, u64)] = &[
    ("low", 16_000),
    ("medium", 31_999),
    ("high", 63_999),
    ("xhigh", 127_999),
];

pub struct ClaudePlugin;

impl ClaudePlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClaudePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CliPlugin for ClaudePlugin {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn executable(&self) -> &'static str {
        "claude"
    }

    fn build_new_session_args(
        &self,
        task: &str,
        context_dirs: &[String],
        role: Option<&str>,
        extra_flags: Option<&str>,
        _reasoning_effort: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--output-format".into(),
            "json".into(),
            "--dangerously-skip-permissions".into(),
        ];
        for dir in context_dirs {
            args.push("--add-dir".into());
            args.push(dir.clone());
        }
        if let Some(role) = role {
            args.push("--system-prompt".into());
            args.push(role.to_string());
        }
        if let Some(extra) = extra_flags {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push(task.to_string());
        args
    }

    fn build_resume_args(
        &self,
        session_id: &str,
        task: &str,
        extra_flags: Option<&str>,
        _reasoning_effort: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--output-format".into(),
            "json".into(),
            "--dangerously-skip-permissions".into(),
            "--resume".into(),
            session_id.to_string(),
        ];
        if let Some(extra) = extra_flags {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push(task.to_string());
        args
    }

    fn reasoning_env_vars(&self, reasoning_effort: Option<&str>) -> HashMap<String, String> {
        let Some(effort) = reasoning_effort else {
            return HashMap::new();
        };
        if effort == "medium" {
            // The CLI default; setting it would be a no-op.
            return HashMap::new();
        }
        match REASONING_EFFORT_TO_TOKENS
            .iter()
            .find(|(level, _)| *level == effort)
        {
            Some((_, tokens)) => {
                info!(effort, tokens, "setting MAX_THINKING_TOKENS");
                HashMap::from([("MAX_THINKING_TOKENS".to_string(), tokens.to_string())])
            }
            None => {
                warn!(effort, "unknown reasoning effort, using CLI default");
                HashMap::new()
            }
        }
    }

    /// Output is either a single JSON object or a JSON array of events:
    /// `{"type":"system","subtype":"init","session_id":…}` carries the id,
    /// `{"type":"result","result":…}` the content (and also the id).
    fn parse_output(&self, raw: &str) -> ParsedCliResponse {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ParsedCliResponse::default();
        }
        let parsed: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            // Not JSON at all: pass the text through untouched.
            Err(_) => {
                return ParsedCliResponse {
                    session_id: None,
                    content: trimmed.to_string(),
                }
            }
        };
        let events: Vec<Value> = match parsed {
            Value::Array(events) => events,
            obj @ Value::Object(_) => vec![obj],
            _ => {
                return ParsedCliResponse {
                    session_id: None,
                    content: trimmed.to_string(),
                }
            }
        };

        let mut session_id = None;
        let mut content = String::new();
        for event in &events {
            let ty = event["type"].as_str().unwrap_or_default();
            if ty == "system" && event["subtype"] == "init" {
                if let Some(id) = event["session_id"].as_str() {
                    session_id = Some(id.to_string());
                }
            }
            if ty == "result" {
                if let Some(id) = event["session_id"].as_str() {
                    session_id = Some(id.to_string());
                }
                content = event["result"].as_str().unwrap_or_default().to_string();
            }
        }
        ParsedCliResponse {
            session_id,
            content,
        }
    }

    /// Transcripts live under `~/.claude/projects/<path-with-slashes-as-dashes>/`.
    fn locate_transcript(
        &self,
        cli_session_id: Option<&str>,
        project_dir: &Path,
    ) -> Option<PathBuf> {
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        let hashed = project_dir.to_string_lossy().replace('/', "-");
        let sessions_dir = home.join(".claude").join("projects").join(hashed);
        if !sessions_dir.is_dir() {
            return None;
        }

        if let Some(id) = cli_session_id {
            let exact = sessions_dir.join(format!("{id}.jsonl"));
            if exact.is_file() {
                return Some(exact);
            }
            let agent = sessions_dir.join(format!("agent-{id}.jsonl"));
            if agent.is_file() {
                return Some(agent);
            }
            if let Ok(entries) = std::fs::read_dir(&sessions_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "jsonl")
                        && path.file_stem().is_some_and(|s| {
                            s.to_string_lossy().contains(id)
                        })
                    {
                        return Some(path);
                    }
                }
            }
        }

        // No id (or not found): most recently modified transcript.
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(&sessions_dir).ok()?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "jsonl") {
                let mtime = entry.metadata().ok()?.modified().ok()?;
                if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                    newest = Some((mtime, path));
                }
            }
        }
        newest.map(|(_, p)| p)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
