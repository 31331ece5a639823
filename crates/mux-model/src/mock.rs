// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scripted adapter for tests: no network, deterministic outcomes.
//!
//! Scripts are consumed front-to-back, one item per round.  A `ToolCall`
//! item round-trips through the dispatcher exactly like a real adapter
//! round, so executor- and session-level behavior can be exercised end to
//! end without a provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use mux_store::{Session, ToolInvocation, Turn};
use mux_tools::{ToolCallRequest, ToolDispatcher};

use crate::capabilities::ModelCapability;
use crate::error::AdapterError;
use crate::provider::{ensure_context_fits, ProviderAdapter};
use crate::types::{CallContext, GenerateOutcome, GenerateRequest};

/// One scripted round.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Terminal text response.  `{tool_result}` is replaced with the output
    /// of the most recent scripted tool call.
    Done(String),
    /// Ask the executor to retry with a reduced budget.
    Retry(String),
    /// Fail the call.
    Fail(AdapterError),
    /// Emit one function call, dispatch it, and continue with the next item.
    ToolCall { name: String, arguments: Value },
}

pub struct MockAdapter {
    capability: ModelCapability,
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<GenerateRequest>>,
    dispatcher: Option<Arc<ToolDispatcher>>,
}

impl MockAdapter {
    pub fn new(capability: ModelCapability) -> Self {
        Self {
            capability,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<ToolDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn push(&self, item: Scripted) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(item);
    }

    /// Requests seen so far, in order.
    pub fn recorded(&self) -> Vec<GenerateRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn next_item(&self) -> Scripted {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Scripted::Done("ok".into()))
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.capability.model
    }

    fn capability(&self) -> &ModelCapability {
        &self.capability
    }

    async fn generate(
        &self,
        req: &GenerateRequest,
        session: &mut Session,
        ctx: &CallContext,
    ) -> Result<GenerateOutcome, AdapterError> {
        ensure_context_fits(&self.capability, req.estimated_prompt_tokens)?;
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(req.clone());

        session.history.push(Turn::user(&req.prompt));
        let mut last_tool_result = String::new();

        loop {
            match self.next_item() {
                Scripted::Done(template) => {
                    let content = template.replace("{tool_result}", &last_tool_result);
                    session.history.push(Turn::assistant(&content));
                    return Ok(GenerateOutcome::done(content));
                }
                Scripted::Retry(reason) => {
                    return Ok(GenerateOutcome::RetryWithReducedContext { reason });
                }
                Scripted::Fail(err) => return Err(err),
                Scripted::ToolCall { name, arguments } => {
                    let call_id = format!("call_{}", session.history.len());
                    let result = match &self.dispatcher {
                        Some(d) => {
                            let calls = [ToolCallRequest {
                                call_id: call_id.clone(),
                                name: name.clone(),
                                arguments: arguments.clone(),
                            }];
                            d.execute_batch(&calls, &ctx.tool_context())
                                .await
                                .into_iter()
                                .next()
                                .unwrap_or_default()
                        }
                        None => format!("no dispatcher configured for {name}"),
                    };
                    session.history.push(Turn::assistant_tool_calls(vec![
                        ToolInvocation {
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        },
                    ]));
                    session
                        .history
                        .push(Turn::tool_result(&call_id, &name, &result));
                    last_tool_result = result;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mock() -> MockAdapter {
        MockAdapter::new(ModelCapability::base("mock-model", "mock", 32_000))
    }

    #[tokio::test]
    async fn default_script_answers_ok() {
        let m = mock();
        let mut session = Session::new("p", "t", "s");
        let out = m
            .generate(&GenerateRequest::default(), &mut session, &CallContext::default())
            .await
            .unwrap();
        match out {
            GenerateOutcome::Done(c) => assert_eq!(c.content, "ok"),
            _ => panic!("expected Done"),
        }
        // Session monotonicity: user turn + terminal assistant turn.
        assert_eq!(session.history.len(), 2);
        assert!(session.history.last().unwrap().is_terminal_assistant());
    }

    #[tokio::test]
    async fn scripted_retry_surfaces_as_variant() {
        let m = mock();
        m.push(Scripted::Retry("max_output_tokens".into()));
        let mut session = Session::new("p", "t", "s");
        let out = m
            .generate(&GenerateRequest::default(), &mut session, &CallContext::default())
            .await
            .unwrap();
        assert!(matches!(
            out,
            GenerateOutcome::RetryWithReducedContext { reason } if reason == "max_output_tokens"
        ));
    }

    #[tokio::test]
    async fn recorded_requests_keep_order() {
        let m = mock();
        m.push(Scripted::Done("one".into()));
        m.push(Scripted::Done("two".into()));
        let mut session = Session::new("p", "t", "s");
        let req_a = GenerateRequest {
            prompt: "a".into(),
            ..Default::default()
        };
        let req_b = GenerateRequest {
            prompt: "b".into(),
            ..Default::default()
        };
        m.generate(&req_a, &mut session, &CallContext::default()).await.unwrap();
        m.generate(&req_b, &mut session, &CallContext::default()).await.unwrap();
        let recorded = m.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].prompt, "a");
        assert_eq!(recorded[1].prompt, "b");
    }
}
