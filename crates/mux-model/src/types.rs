// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transient per-invocation record threaded through adapters and tool
/// dispatch.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub project: String,
    pub tool: String,
    pub session_id: String,
    pub vector_store_ids: Vec<String>,
}

impl CallContext {
    pub fn tool_context(&self) -> mux_tools::ToolContext {
        mux_tools::ToolContext {
            project: self.project.clone(),
            tool: self.tool.clone(),
            session_id: self.session_id.clone(),
            vector_store_ids: self.vector_store_ids.clone(),
        }
    }
}

/// Uniform request shape handed to every adapter.
///
/// `prompt` is the finalized user message produced by the token optimizer
/// (instructions + inline context); `system` carries the stable system
/// prompt, kept out of the durable history.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// "low" | "medium" | "high" | "xhigh".
    pub reasoning_effort: Option<String>,
    /// Explicit thinking-token budget; overrides the effort mapping.
    pub max_reasoning_tokens: Option<i64>,
    /// Restricted JSON Schema the response must conform to.
    pub structured_output_schema: Option<Value>,
    /// Live Search mode: "auto" | "on" | "off".
    pub search_mode: Option<String>,
    pub vector_store_ids: Vec<String>,
    pub disable_memory_search: bool,
    /// Optimizer's estimate for the outgoing prompt, used by the
    /// context-window guard.
    pub estimated_prompt_tokens: usize,
    /// Per-call deadline; the executor enforces it, adapters size their
    /// polling against it.
    pub timeout: Duration,
    pub return_debug: bool,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            system: None,
            temperature: None,
            max_output_tokens: None,
            reasoning_effort: None,
            max_reasoning_tokens: None,
            structured_output_schema: None,
            search_mode: None,
            vector_store_ids: Vec::new(),
            disable_memory_search: false,
            estimated_prompt_tokens: 0,
            timeout: Duration::from_secs(300),
            return_debug: false,
        }
    }
}

/// A citation attached to a completion (Live Search and similar features).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
}

/// A finished generate call.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub response_id: Option<String>,
    pub sources: Vec<SourceRef>,
    pub usage: Option<Usage>,
    /// Tool declarations actually sent, when `return_debug` was requested.
    pub debug: Option<Value>,
}

/// Adapter-boundary result.
///
/// The reduced-context retry is an explicit variant rather than error
/// control flow: the executor matches on it and re-runs the optimizer with
/// a smaller budget.
#[derive(Debug, Clone)]
pub enum GenerateOutcome {
    Done(Completion),
    RetryWithReducedContext { reason: String },
}

impl GenerateOutcome {
    pub fn done(content: impl Into<String>) -> Self {
        Self::Done(Completion {
            content: content.into(),
            ..Default::default()
        })
    }
}
