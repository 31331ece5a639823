// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Output of a CLI run after format-specific parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedCliResponse {
    /// The CLI's native session/thread id, when the transcript carried one.
    pub session_id: Option<String>,
    /// Aggregated agent-facing text (raw transcript framing stripped).
    pub content: String,
}

/// One supported coding-agent CLI.
///
/// Plugins are pure command builders and parsers; process spawning, env
/// isolation, and cwd injection live in the service layer.  In particular,
/// plugins must NOT prepend working-directory preambles to the task.
pub trait CliPlugin: Send + Sync {
    /// Registry key ("claude" | "gemini" | "codex").
    fn name(&self) -> &'static str;

    /// Command name resolved on $PATH.
    fn executable(&self) -> &'static str;

    fn build_new_session_args(
        &self,
        task: &str,
        context_dirs: &[String],
        role: Option<&str>,
        extra_flags: Option<&str>,
        reasoning_effort: Option<&str>,
    ) -> Vec<String>;

    fn build_resume_args(
        &self,
        session_id: &str,
        task: &str,
        extra_flags: Option<&str>,
        reasoning_effort: Option<&str>,
    ) -> Vec<String>;

    /// Environment variables that carry the reasoning-effort setting, for
    /// CLIs configured through env rather than flags.
    fn reasoning_env_vars(&self, reasoning_effort: Option<&str>) -> HashMap<String, String>;

    fn parse_output(&self, raw: &str) -> ParsedCliResponse;

    /// Locate the CLI's own transcript file for live-follow UIs.
    fn locate_transcript(&self, cli_session_id: Option<&str>, project_dir: &Path)
        -> Option<PathBuf>;
}

/// Explicitly constructed plugin registry.
///
/// Built once at process init — no import-time side effects — so the
/// dependency graph stays static and testable.
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry with all built-in plugins.
    pub fn with_builtin_plugins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::claude::ClaudePlugin::new()));
        registry.register(Arc::new(crate::gemini::GeminiCliPlugin::new()));
        registry.register(Arc::new(crate::codex::CodexPlugin::new()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn CliPlugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CliPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.plugins.keys().copied().collect();
        names.sort();
        names
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtin_plugins()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_all_three_clis() {
        let registry = PluginRegistry::with_builtin_plugins();
        assert_eq!(registry.names(), vec!["claude", "codex", "gemini"]);
        for name in ["claude", "gemini", "codex"] {
            assert!(registry.get(name).is_some(), "{name} must be registered");
        }
    }

    #[test]
    fn unknown_cli_is_absent() {
        let registry = PluginRegistry::with_builtin_plugins();
        assert!(registry.get("aider").is_none());
    }
}
