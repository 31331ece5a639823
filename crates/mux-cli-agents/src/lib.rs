// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! CLI coding-agent orchestration.
//!
//! Spawns external coding-agent CLIs (Claude Code, Gemini CLI, Codex CLI)
//! as subprocesses, enforces wall-clock and idle timeouts, parses each
//! CLI's transcript format, and bridges native session ids into the unified
//! session store.

mod bridge;
mod claude;
mod codex;
mod executor;
mod gemini;
mod plugin;
mod service;

pub use bridge::SessionBridge;
pub use claude::ClaudePlugin;
pub use codex::CodexPlugin;
pub use executor::{CliExecutor, CliResult};
pub use gemini::GeminiCliPlugin;
pub use plugin::{CliPlugin, ParsedCliResponse, PluginRegistry};
pub use service::{
    CliAgentError, CliAgentRequest, CliAgentResponse, CliAgentService, OutputSummarizer,
};
