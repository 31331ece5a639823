// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gemini CLI plugin.
//!
//! Command formats:
//! - New session: `gemini --output-format json --yolo
//!   [--include-directories <d>]* [extra] <task>`
//! - Resume: `gemini --resume <id> --output-format json --yolo [extra] <task>`
//!
//! The CLI has no system-prompt flag, so a role is prepended to the task
//! text.  It also has no reasoning-effort mechanism; a warning is logged
//! once per process when one is requested.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Once;

use serde_json::Value;
use tracing::warn;

use crate::plugin::{CliPlugin, ParsedCliResponse};

static REASONING_WARNING: Once = Once::new();

pub struct GeminiCliPlugin;

impl GeminiCliPlugin {
    pub fn new() -> Self {
        Self
    }

    fn warn_reasoning_unsupported(reasoning_effort: Option<&str>) {
        if let Some(effort) = reasoning_effort {
            if effort != "medium" {
                REASONING_WARNING.call_once(|| {
                    warn!(
                        effort,
                        "reasoning_effort ignored: the Gemini CLI does not expose it"
                    );
                });
            }
        }
    }
}

impl Default for GeminiCliPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CliPlugin for GeminiCliPlugin {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn executable(&self) -> &'static str {
        "gemini"
    }

    fn build_new_session_args(
        &self,
        task: &str,
        context_dirs: &[String],
        role: Option<&str>,
        extra_flags: Option<&str>,
        reasoning_effort: Option<&str>,
    ) -> Vec<String> {
        Self::warn_reasoning_unsupported(reasoning_effort);
        let mut args: Vec<String> =
            vec!["--output-format".into(), "json".into(), "--yolo".into()];
        for dir in context_dirs {
            args.push("--include-directories".into());
            args.push(dir.clone());
        }
        let task = match role {
            Some(role) => format!("Role: {role}\n\n{task}"),
            None => task.to_string(),
        };
        if let Some(extra) = extra_flags {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push(task);
        args
    }

    fn build_resume_args(
        &self,
        session_id: &str,
        task: &str,
        extra_flags: Option<&str>,
        reasoning_effort: Option<&str>,
    ) -> Vec<String> {
        Self::warn_reasoning_unsupported(reasoning_effort);
        let mut args: Vec<String> = vec![
            "--resume".into(),
            session_id.to_string(),
            "--output-format".into(),
            "json".into(),
            "--yolo".into(),
        ];
        if let Some(extra) = extra_flags {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push(task.to_string());
        args
    }

    fn reasoning_env_vars(&self, _reasoning_effort: Option<&str>) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Output is a single JSON object: `{"session_id":…, "response":…}`.
    fn parse_output(&self, raw: &str) -> ParsedCliResponse {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ParsedCliResponse::default();
        }
        let Ok(data) = serde_json::from_str::<Value>(trimmed) else {
            return ParsedCliResponse::default();
        };
        if !data.is_object() {
            return ParsedCliResponse::default();
        }
        ParsedCliResponse {
            session_id: data["session_id"].as_str().map(str::to_string),
            content: data["response"].as_str().unwrap_or_default().to_string(),
        }
    }

    fn locate_transcript(
        &self,
        _cli_session_id: Option<&str>,
        _project_dir: &Path,
    ) -> Option<PathBuf> {
        // The Gemini CLI keeps no per-project transcript files to follow.
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> GeminiCliPlugin {
        GeminiCliPlugin::new()
    }

    #[test]
    fn new_session_args_match_the_command_table() {
        let args = plugin().build_new_session_args(
            "task text",
            &["/repo".to_string()],
            None,
            None,
            None,
        );
        assert_eq!(
            args,
            vec![
                "--output-format",
                "json",
                "--yolo",
                "--include-directories",
                "/repo",
                "task text",
            ]
        );
    }

    #[test]
    fn role_is_prepended_to_task() {
        let args = plugin().build_new_session_args("do it", &[], Some("tester"), None, None);
        let task = args.last().unwrap();
        assert_eq!(task, "Role: tester\n\ndo it");
    }

    #[test]
    fn resume_args_lead_with_resume() {
        let args = plugin().build_resume_args("sess-3", "more", None, None);
        assert_eq!(
            args,
            vec!["--resume", "sess-3", "--output-format", "json", "--yolo", "more"]
        );
    }

    #[test]
    fn parses_single_object_output() {
        let out = plugin()
            .parse_output(r#"{"session_id":"g-1","response":"answer","stats":{"turns":1}}"#);
        assert_eq!(out.session_id.as_deref(), Some("g-1"));
        assert_eq!(out.content, "answer");
    }

    #[test]
    fn malformed_output_is_empty() {
        assert_eq!(plugin().parse_output("not json"), ParsedCliResponse::default());
        assert_eq!(plugin().parse_output("[1,2]"), ParsedCliResponse::default());
    }

    #[test]
    fn no_reasoning_env_vars() {
        assert!(plugin().reasoning_env_vars(Some("high")).is_empty());
    }
}
