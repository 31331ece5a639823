// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// One tool invocation recorded inside an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Opaque identifier issued by the provider (forwarded verbatim).
    pub call_id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// One entry in a session's history.
///
/// This is the canonical on-disk representation; each provider adapter
/// reconstructs its native turn objects from these variants (Gemini
/// `Content`/`Part`s, chat-completions message rows, Responses-API input
/// items) and converts back when appending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    User {
        text: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolInvocation>,
        /// Provider-specific reasoning payload, kept opaque.  The OpenAI
        /// Responses API retains reasoning server-side, so this stays empty
        /// there; chat-style providers may stash reasoning text here.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<serde_json::Value>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            text: Some(text.into()),
            tool_calls: Vec::new(),
            reasoning: None,
        }
    }

    pub fn assistant_tool_calls(calls: Vec<ToolInvocation>) -> Self {
        Self::Assistant {
            text: None,
            tool_calls: calls,
            reasoning: None,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolResult {
            call_id: call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    /// `true` for an assistant turn carrying nonempty text.
    ///
    /// A successful generate call must leave the history ending in such a
    /// turn — never dangling on an unanswered tool call.
    pub fn is_terminal_assistant(&self) -> bool {
        matches!(self, Self::Assistant { text: Some(t), .. } if !t.is_empty())
    }

    /// Approximate token count used for budget accounting.
    ///
    /// Uses the 4-chars-per-token heuristic; tool calls count name + args.
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::User { text } => text.len(),
            Self::Assistant {
                text, tool_calls, ..
            } => {
                text.as_deref().map(str::len).unwrap_or(0)
                    + tool_calls
                        .iter()
                        .map(|c| c.name.len() + c.arguments.len())
                        .sum::<usize>()
            }
            Self::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
