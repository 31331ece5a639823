// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Static per-model capability table.
//!
//! The single source of truth for which models exist, which adapter drives
//! them, and the feature flags that steer request construction (streaming vs
//! background, reasoning defaults, thinking budgets, native tools).
//! Ollama entries are synthesized at runtime from discovery instead.

use serde::{Deserialize, Serialize};

/// Thinking-token budgets per reasoning-effort level.
///
/// A budget of `0` maps to the provider's `-1` sentinel ("automatic").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingBudgets {
    pub low: i64,
    pub medium: i64,
    pub high: i64,
}

impl ThinkingBudgets {
    pub fn for_effort(&self, effort: &str) -> Option<i64> {
        match effort {
            "low" => Some(self.low),
            "medium" => Some(self.medium),
            "high" | "xhigh" => Some(self.high),
            _ => None,
        }
    }
}

/// Everything the request builders need to know about one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    /// Model identifier forwarded to the provider API.
    pub model: String,
    /// Adapter key: "openai" | "gemini" | "grok" | "anthropic" | "ollama" | "mock".
    pub provider: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    /// Always run through background polling regardless of timeout.
    pub force_background: bool,
    pub supports_tools: bool,
    pub supports_reasoning_effort: bool,
    pub default_reasoning_effort: Option<String>,
    pub supports_thinking_budget: bool,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub supports_live_search: bool,
    pub supports_structured_output: bool,
    /// Native web-search tool type, when the provider has one.
    pub web_search_tool: Option<String>,
    /// Which vector-store provider the model can search natively.
    pub native_vector_store_provider: Option<String>,
    /// Companion terminal CLI, for models that have one.
    pub cli_name: Option<String>,
    pub description: String,
}

impl ModelCapability {
    /// Baseline entry: tools + streaming, nothing fancy.
    pub fn base(model: &str, provider: &str, context_window: u32) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            context_window,
            max_output_tokens: 65_536,
            supports_streaming: true,
            force_background: false,
            supports_tools: true,
            supports_reasoning_effort: false,
            default_reasoning_effort: None,
            supports_thinking_budget: false,
            thinking_budgets: None,
            supports_live_search: false,
            supports_structured_output: true,
            web_search_tool: None,
            native_vector_store_provider: None,
            cli_name: None,
            description: String::new(),
        }
    }
}

/// All statically known models.
pub fn builtin_capabilities() -> Vec<ModelCapability> {
    vec![
        // ── OpenAI (Responses API) ───────────────────────────────────────────
        ModelCapability {
            max_output_tokens: 128_000,
            supports_reasoning_effort: true,
            default_reasoning_effort: Some("medium".into()),
            native_vector_store_provider: Some("openai".into()),
            web_search_tool: Some("web_search".into()),
            description: "Flagship reasoning generalist".into(),
            ..ModelCapability::base("gpt-5", "openai", 400_000)
        },
        ModelCapability {
            max_output_tokens: 128_000,
            supports_reasoning_effort: true,
            default_reasoning_effort: Some("medium".into()),
            native_vector_store_provider: Some("openai".into()),
            cli_name: Some("codex".into()),
            description: "Coding-tuned flagship with a companion terminal CLI".into(),
            ..ModelCapability::base("gpt-5-codex", "openai", 400_000)
        },
        ModelCapability {
            supports_streaming: false,
            supports_reasoning_effort: true,
            default_reasoning_effort: Some("high".into()),
            native_vector_store_provider: Some("openai".into()),
            description: "Deep reasoner; background mode only".into(),
            ..ModelCapability::base("o3", "openai", 200_000)
        },
        ModelCapability {
            supports_streaming: false,
            force_background: true,
            supports_reasoning_effort: true,
            default_reasoning_effort: Some("high".into()),
            web_search_tool: Some("web_search_preview".into()),
            native_vector_store_provider: Some("openai".into()),
            description: "Long-horizon research jobs; always polled".into(),
            ..ModelCapability::base("o3-deep-research", "openai", 200_000)
        },
        // ── Gemini ───────────────────────────────────────────────────────────
        ModelCapability {
            supports_thinking_budget: true,
            thinking_budgets: Some(ThinkingBudgets {
                low: 4_096,
                medium: 16_384,
                high: 32_768,
            }),
            cli_name: Some("gemini".into()),
            description: "Deep multimodal reasoner".into(),
            ..ModelCapability::base("gemini-2.5-pro", "gemini", 1_048_576)
        },
        ModelCapability {
            supports_thinking_budget: true,
            thinking_budgets: Some(ThinkingBudgets {
                low: 1_024,
                medium: 8_192,
                high: 24_576,
            }),
            description: "Fast summary sprinter".into(),
            ..ModelCapability::base("gemini-2.5-flash", "gemini", 1_048_576)
        },
        // ── Grok ─────────────────────────────────────────────────────────────
        ModelCapability {
            supports_live_search: true,
            description: "Advanced multi-agent reasoning, large documents".into(),
            ..ModelCapability::base("grok-4", "grok", 256_000)
        },
        ModelCapability {
            supports_live_search: true,
            supports_reasoning_effort: true,
            description: "Quick responses, supports reasoning effort".into(),
            ..ModelCapability::base("grok-3-mini", "grok", 32_000)
        },
        // ── Anthropic ────────────────────────────────────────────────────────
        ModelCapability {
            cli_name: Some("claude".into()),
            description: "Frontier coder with a companion terminal CLI".into(),
            ..ModelCapability::base("claude-opus-4", "anthropic", 200_000)
        },
        ModelCapability {
            description: "Balanced daily driver".into(),
            ..ModelCapability::base("claude-sonnet-4", "anthropic", 200_000)
        },
        // ── Testing ──────────────────────────────────────────────────────────
        ModelCapability {
            description: "Scripted adapter for tests; no network".into(),
            ..ModelCapability::base("mock-model", "mock", 32_000)
        },
    ]
}

/// Look up a model by id.  Returns `None` for unknown models (Ollama models
/// are resolved dynamically by the discovery layer instead).
pub fn lookup_capability(model: &str) -> Option<ModelCapability> {
    builtin_capabilities().into_iter().find(|c| c.model == model)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
