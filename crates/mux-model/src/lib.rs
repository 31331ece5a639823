// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider adapter layer: uniform generate-contract semantics over
//! heterogeneous model backends.
//!
//! Every adapter implements [`ProviderAdapter::generate`] with the same
//! obligations — context-window guard, session continuity, bounded tool-call
//! loop, cancellation propagation, and the common error taxonomy — while
//! speaking its backend's native wire format underneath.

pub mod capabilities;
pub mod schema;
mod anthropic;
mod error;
mod gemini;
mod grok;
mod mock;
mod ollama;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicAdapter;
pub use capabilities::{lookup_capability, ModelCapability, ThinkingBudgets};
pub use error::{AdapterError, ErrorCategory};
pub use gemini::GeminiAdapter;
pub use grok::GrokAdapter;
pub use mock::{MockAdapter, Scripted};
pub use ollama::{DiscoveredModel, OllamaAdapter, OllamaDiscovery};
pub use openai::OpenAiAdapter;
pub use provider::{ensure_context_fits, ProviderAdapter, TOO_MANY_FUNCTION_CALLS};
pub use types::{CallContext, Completion, GenerateOutcome, GenerateRequest, SourceRef, Usage};

use std::sync::Arc;

use mux_config::Config;
use mux_tools::ToolDispatcher;

/// Construct the adapter for a capability entry.
///
/// Fails with [`ErrorCategory::Configuration`] when the provider is disabled
/// or missing credentials, and [`ErrorCategory::InvalidModel`] for unknown
/// adapter keys.
pub fn from_capability(
    capability: ModelCapability,
    config: &Config,
    dispatcher: Arc<ToolDispatcher>,
) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
    let provider = capability.provider.clone();
    let provider_cfg = config.provider(&provider);
    if !provider_cfg.enabled {
        return Err(AdapterError::new(
            ErrorCategory::Configuration,
            format!("provider {provider} is disabled"),
        ));
    }
    match provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiAdapter::new(
            capability,
            &provider_cfg,
            &config.http,
            dispatcher,
        )?)),
        "gemini" => Ok(Arc::new(GeminiAdapter::new(
            capability,
            &provider_cfg,
            &config.http,
            dispatcher,
        )?)),
        "grok" => Ok(Arc::new(GrokAdapter::new(
            capability,
            &provider_cfg,
            &config.http,
            dispatcher,
        )?)),
        "anthropic" => Ok(Arc::new(AnthropicAdapter::new(
            capability,
            &provider_cfg,
            &config.http,
            dispatcher,
        )?)),
        "ollama" => Ok(Arc::new(OllamaAdapter::new(
            capability,
            &provider_cfg,
            &config.http,
            dispatcher,
        )?)),
        "mock" => Ok(Arc::new(MockAdapter::new(capability))),
        other => Err(AdapterError::new(
            ErrorCategory::InvalidModel,
            format!("unknown adapter key {other:?}"),
        )),
    }
}
