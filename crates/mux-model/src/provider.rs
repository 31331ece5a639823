// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;

use mux_store::Session;

use crate::capabilities::ModelCapability;
use crate::error::{AdapterError, ErrorCategory};
use crate::types::{CallContext, GenerateOutcome, GenerateRequest};

/// Terminal content returned when the per-call tool-round cap is exhausted.
pub const TOO_MANY_FUNCTION_CALLS: &str = "TooManyFunctionCalls";

/// Maximum tool-call rounds within one generate call.
pub const MAX_FUNCTION_CALLS: u32 = 500;

/// Tokens held back from the context window as a safety margin for message
/// framing and provider-side accounting drift.
const CONTEXT_SAFETY_BUFFER: usize = 1_024;

/// Uniform `generate` contract over heterogeneous backends.
///
/// Implementations append the turns produced by the call to `session` —
/// the caller persists the session only after a successful outcome, so a
/// failed call never mutates durable state.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable adapter key ("openai" | "gemini" | "grok" | …).
    fn provider(&self) -> &'static str;

    fn model(&self) -> &str;

    fn capability(&self) -> &ModelCapability;

    async fn generate(
        &self,
        req: &GenerateRequest,
        session: &mut Session,
        ctx: &CallContext,
    ) -> Result<GenerateOutcome, AdapterError>;
}

/// Context-window guard shared by all adapters: refuse requests whose
/// estimate plus safety buffer exceeds the model's configured window.
pub fn ensure_context_fits(
    capability: &ModelCapability,
    estimated_prompt_tokens: usize,
) -> Result<(), AdapterError> {
    let window = capability.context_window as usize;
    if estimated_prompt_tokens + CONTEXT_SAFETY_BUFFER > window {
        return Err(AdapterError::new(
            ErrorCategory::FatalClient,
            format!(
                "prompt estimate {estimated_prompt_tokens} tokens exceeds the \
                 {window}-token context window of {}",
                capability.model
            ),
        )
        .with_provider(capability.provider.clone()));
    }
    Ok(())
}

/// Poll-delay schedule for background jobs: exponential with jitter, capped.
pub(crate) struct PollBackoff {
    delay: Duration,
}

pub(crate) const INITIAL_POLL_DELAY: Duration = Duration::from_secs(3);
pub(crate) const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

impl PollBackoff {
    pub fn new() -> Self {
        Self {
            delay: INITIAL_POLL_DELAY,
        }
    }

    /// Current delay, then advance: `delay * 1.8 + jitter`, capped at 30s.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        let jitter = Duration::from_millis((rand::random::<f64>() * 200.0) as u64);
        let advanced = self.delay.mul_f64(1.8) + jitter;
        self.delay = advanced.min(MAX_POLL_INTERVAL);
        current
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ModelCapability;

    #[test]
    fn guard_accepts_fitting_prompt() {
        let cap = ModelCapability::base("m", "mock", 10_000);
        assert!(ensure_context_fits(&cap, 1_000).is_ok());
    }

    #[test]
    fn guard_rejects_oversized_prompt() {
        let cap = ModelCapability::base("m", "mock", 10_000);
        let err = ensure_context_fits(&cap, 9_500).unwrap_err();
        assert_eq!(err.category, ErrorCategory::FatalClient);
        assert!(err.to_string().contains("context window"));
    }

    #[test]
    fn guard_counts_the_safety_buffer() {
        let cap = ModelCapability::base("m", "mock", 10_000);
        // 10_000 - 1_024 = 8_976 is the largest acceptable estimate.
        assert!(ensure_context_fits(&cap, 8_976).is_ok());
        assert!(ensure_context_fits(&cap, 8_977).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut b = PollBackoff::new();
        let first = b.next_delay();
        assert_eq!(first, INITIAL_POLL_DELAY);
        let mut last = first;
        for _ in 0..10 {
            last = b.next_delay();
        }
        assert!(last <= MAX_POLL_INTERVAL);
        assert!(last > first);
    }
}
