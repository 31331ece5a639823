// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Multi-provider AI model routing core.
///
/// The host transport (tool registration, JSON-RPC framing) lives outside
/// this binary; these subcommands drive the request-execution core directly
/// for local use and smoke testing.
#[derive(Parser, Debug)]
#[command(name = "mux", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List every tool blueprint the core exposes.
    ListTools,

    /// Invoke one tool with JSON parameters and print the result.
    Invoke {
        /// Tool name, e.g. `chat_with_gpt_5` or `list_sessions`.
        tool: String,
        /// JSON object with the tool parameters.
        #[arg(long, short = 'p', default_value = "{}")]
        params: String,
    },

    /// List stored sessions for the current project.
    Sessions {
        /// Substring filter on session id / tool name.
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Include cached summaries.
        #[arg(long)]
        summaries: bool,
    },

    /// Sweep expired sessions and vector-store leases now.
    Reap,
}
