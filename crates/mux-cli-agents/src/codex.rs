// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Codex CLI plugin.
//!
//! Command formats:
//! - New session: `codex exec --json --skip-git-repo-check --yolo
//!   [-c model_reasoning_effort="<e>"] [extra] <task>`
//! - Resume: `codex exec resume <thread_id> --json --skip-git-repo-check
//!   --yolo [-c model_reasoning_effort="<e>"] [extra] <task>`
//!
//! Note the resume form: `exec resume`, never a `--resume` flag.  Codex
//! identifies conversations by `thread_id`; the service layer exposes it as
//! the session id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::info;

use crate::plugin::{CliPlugin, ParsedCliResponse};

pub struct CodexPlugin;

impl CodexPlugin {
    pub fn new() -> Self {
        Self
    }

    fn reasoning_args(reasoning_effort: Option<&str>) -> Vec<String> {
        match reasoning_effort {
            // "medium" is the CLI default; only deviations are passed.
            Some(effort) if effort != "medium" => {
                info!(effort, "setting codex model_reasoning_effort");
                vec![
                    "-c".into(),
                    format!("model_reasoning_effort=\"{effort}\""),
                ]
            }
            _ => vec![],
        }
    }
}

impl Default for CodexPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CliPlugin for CodexPlugin {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn executable(&self) -> &'static str {
        "codex"
    }

    fn build_new_session_args(
        &self,
        task: &str,
        _context_dirs: &[String],
        _role: Option<&str>,
        extra_flags: Option<&str>,
        reasoning_effort: Option<&str>,
    ) -> Vec<String> {
        // Codex takes context from its working directory and has no role
        // flag; both are ignored here.
        let mut args: Vec<String> = vec![
            "exec".into(),
            "--json".into(),
            "--skip-git-repo-check".into(),
            "--yolo".into(),
        ];
        args.extend(Self::reasoning_args(reasoning_effort));
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
        reasoning_effort: Option<&str>,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "exec".into(),
            "resume".into(),
            session_id.to_string(),
            "--json".into(),
            "--skip-git-repo-check".into(),
            "--yolo".into(),
        ];
        args.extend(Self::reasoning_args(reasoning_effort));
        if let Some(extra) = extra_flags {
            args.extend(extra.split_whitespace().map(str::to_string));
        }
        args.push(task.to_string());
        args
    }

    fn reasoning_env_vars(&self, _reasoning_effort: Option<&str>) -> HashMap<String, String> {
        // Codex is configured via `-c` overrides, not the environment.
        HashMap::new()
    }

    /// Output is JSONL.  `thread_id` comes from the `thread.started` event;
    /// content aggregates the `agent_message` items of the LAST
    /// `turn.started…turn.completed` bracket only — earlier turns belong to
    /// the resumed conversation's replay, and reasoning/command_execution
    /// items are never user-facing.
    fn parse_output(&self, raw: &str) -> ParsedCliResponse {
        let mut thread_id: Option<String> = None;
        let mut completed_brackets: Vec<Vec<String>> = Vec::new();
        let mut current: Option<Vec<String>> = None;
        let mut loose: Vec<String> = Vec::new();

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            match event["type"].as_str().unwrap_or_default() {
                "thread.started" => {
                    if let Some(id) = event["thread_id"].as_str() {
                        thread_id = Some(id.to_string());
                    }
                }
                "turn.started" => current = Some(Vec::new()),
                "turn.completed" => {
                    if let Some(bucket) = current.take() {
                        completed_brackets.push(bucket);
                    }
                }
                "item.completed" => {
                    let item = &event["item"];
                    if item["type"] == "agent_message" {
                        if let Some(text) = item["text"].as_str() {
                            if !text.is_empty() {
                                match &mut current {
                                    Some(bucket) => bucket.push(text.to_string()),
                                    None => loose.push(text.to_string()),
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // A trailing unterminated bracket still counts as the last turn.
        if let Some(bucket) = current.take() {
            if !bucket.is_empty() {
                completed_brackets.push(bucket);
            }
        }

        let content = completed_brackets
            .last()
            .cloned()
            .or_else(|| (!loose.is_empty()).then_some(loose))
            .map(|parts| parts.join("\n"))
            .unwrap_or_default();

        ParsedCliResponse {
            session_id: thread_id,
            content,
        }
    }

    fn locate_transcript(
        &self,
        cli_session_id: Option<&str>,
        _project_dir: &Path,
    ) -> Option<PathBuf> {
        // Codex stores rollouts under ~/.codex/sessions/<date>/ with the
        // thread id embedded in the filename.
        let id = cli_session_id?;
        let home = std::env::var_os("HOME").map(PathBuf::from)?;
        let sessions = home.join(".codex").join("sessions");
        let mut stack = vec![sessions];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir).ok()?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().contains(id))
                {
                    return Some(path);
                }
            }
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin() -> CodexPlugin {
        CodexPlugin::new()
    }

    #[test]
    fn new_session_args_match_the_command_table() {
        let args = plugin().build_new_session_args("fix the bug", &[], None, None, None);
        assert_eq!(
            args,
            vec!["exec", "--json", "--skip-git-repo-check", "--yolo", "fix the bug"]
        );
    }

    #[test]
    fn resume_uses_exec_resume_and_never_the_resume_flag() {
        let args = plugin().build_resume_args("thread-7", "continue", None, None);
        assert!(args.contains(&"exec".to_string()));
        assert!(args.contains(&"resume".to_string()));
        assert!(
            !args.iter().any(|a| a == "--resume"),
            "codex resume must not use --resume: {args:?}"
        );
        assert_eq!(args[..3], ["exec", "resume", "thread-7"]);
    }

    #[test]
    fn reasoning_effort_becomes_config_override() {
        let args = plugin().build_new_session_args("t", &[], None, None, Some("xhigh"));
        let pos = args.iter().position(|a| a == "-c").unwrap();
        assert_eq!(args[pos + 1], "model_reasoning_effort=\"xhigh\"");
        // Medium is the default: no override emitted.
        let args = plugin().build_new_session_args("t", &[], None, None, Some("medium"));
        assert!(!args.iter().any(|a| a == "-c"));
    }

    #[test]
    fn parses_thread_id_and_agent_messages() {
        let out = plugin().parse_output(concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th-1\"}\n",
            "{\"type\":\"turn.started\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"hello\"}}\n",
            "{\"type\":\"turn.completed\"}\n",
        ));
        assert_eq!(out.session_id.as_deref(), Some("th-1"));
        assert_eq!(out.content, "hello");
    }

    #[test]
    fn only_the_last_turn_bracket_is_aggregated() {
        // Three brackets; earlier agent messages and non-message items in
        // the last bracket must all be excluded.
        let out = plugin().parse_output(concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"th-9\"}\n",
            "{\"type\":\"turn.started\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Old1\"}}\n",
            "{\"type\":\"turn.completed\"}\n",
            "{\"type\":\"turn.started\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Old2\"}}\n",
            "{\"type\":\"turn.completed\"}\n",
            "{\"type\":\"turn.started\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"reasoning\",\"text\":\"…internal…\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"command_execution\",\"text\":\"done\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Part A\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Part B\"}}\n",
            "{\"type\":\"turn.completed\"}\n",
        ));
        assert_eq!(out.session_id.as_deref(), Some("th-9"));
        assert_eq!(out.content, "Part A\nPart B");
        assert!(!out.content.contains("Old1"));
        assert!(!out.content.contains("internal"));
        assert!(!out.content.contains("done"));
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let out = plugin().parse_output(concat!(
            "not json at all\n",
            "{\"type\":\"thread.started\",\"thread_id\":\"t\"}\n",
            "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"x\"}}\n",
        ));
        assert_eq!(out.session_id.as_deref(), Some("t"));
        assert_eq!(out.content, "x");
    }

    #[test]
    fn empty_output_is_empty_response() {
        assert_eq!(plugin().parse_output(""), ParsedCliResponse::default());
    }
}
