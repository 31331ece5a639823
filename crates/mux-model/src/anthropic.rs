// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Anthropic adapter — Messages API with the shared tool loop.
//!
//! Turns map onto content blocks: assistant tool calls become `tool_use`
//! blocks, tool results ride back in a user message of `tool_result`
//! blocks, and the loop continues while `stop_reason == "tool_use"`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mux_config::{HttpConfig, ProviderConfig};
use mux_store::{Session, ToolInvocation, Turn};
use mux_tools::{DeclarationFormat, ToolCallRequest, ToolDispatcher};

use crate::capabilities::ModelCapability;
use crate::error::AdapterError;
use crate::provider::{
    ensure_context_fits, ProviderAdapter, MAX_FUNCTION_CALLS, TOO_MANY_FUNCTION_CALLS,
};
use crate::schema::validate_structured_output;
use crate::types::{CallContext, Completion, GenerateOutcome, GenerateRequest, Usage};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    capability: ModelCapability,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    dispatcher: Arc<ToolDispatcher>,
}

impl AnthropicAdapter {
    pub fn new(
        capability: ModelCapability,
        provider: &ProviderConfig,
        http: &HttpConfig,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Result<Self, AdapterError> {
        let api_key = provider.api_key().ok_or_else(|| {
            AdapterError::configuration("ANTHROPIC_API_KEY not configured")
                .with_provider("anthropic")
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_seconds))
            .timeout(Duration::from_secs(http.read_timeout_seconds))
            .pool_idle_timeout(Duration::from_secs(http.pool_idle_timeout_seconds))
            .pool_max_idle_per_host(http.pool_max_idle_per_host)
            .build()
            .map_err(|e| AdapterError::configuration(e.to_string()))?;
        Ok(Self {
            capability,
            api_key,
            base_url: provider
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".into()),
            client,
            dispatcher,
        })
    }

    async fn call_api(&self, body: &Value) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(e).with_provider("anthropic"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text).with_provider("anthropic"));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::parsing(e.to_string()).with_provider("anthropic"))
    }

    /// Dispatcher declarations reshaped to the Messages API tool format.
    fn build_tools(&self, req: &GenerateRequest) -> Vec<Value> {
        self.dispatcher
            .declarations(
                DeclarationFormat::Gemini, // bare {name, description, parameters}
                req.disable_memory_search,
                !req.vector_store_ids.is_empty(),
            )
            .into_iter()
            .map(|d| {
                json!({
                    "name": d["name"],
                    "description": d["description"],
                    "input_schema": d["parameters"],
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> &'static str {
        "anthropic"
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

        let mut messages = turns_to_messages(&session.history);
        messages.push(json!({ "role": "user", "content": req.prompt }));
        session.history.push(Turn::user(&req.prompt));

        let tools = if self.capability.supports_tools {
            self.build_tools(req)
        } else {
            vec![]
        };
        debug!(model = %self.capability.model, tools = tools.len(), "anthropic generate");

        let mut usage = None;
        for round in 0..MAX_FUNCTION_CALLS {
            let mut body = json!({
                "model": self.capability.model,
                "messages": messages,
                "max_tokens": req
                    .max_output_tokens
                    .unwrap_or(self.capability.max_output_tokens.min(32_000)),
            });
            if let Some(system) = &req.system {
                body["system"] = json!(system);
            }
            if let Some(t) = req.temperature {
                body["temperature"] = json!(t);
            }
            if !tools.is_empty() {
                body["tools"] = json!(tools);
            }

            let response = self.call_api(&body).await?;
            usage = parse_usage(&response).or(usage);

            let blocks = response["content"].as_array().cloned().unwrap_or_default();
            let text: String = blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect();
            let tool_uses: Vec<&Value> =
                blocks.iter().filter(|b| b["type"] == "tool_use").collect();

            if response["stop_reason"] != "tool_use" || tool_uses.is_empty() {
                let mut content = text;
                if let Some(schema) = &req.structured_output_schema {
                    content = validate_structured_output(&content, schema)
                        .map_err(|e| e.with_provider("anthropic"))?;
                }
                session.history.push(Turn::assistant(&content));
                return Ok(GenerateOutcome::Done(Completion {
                    content,
                    response_id: response["id"].as_str().map(str::to_string),
                    sources: vec![],
                    usage,
                    debug: req.return_debug.then(|| json!({ "tools": tools })),
                }));
            }

            info!(calls = tool_uses.len(), round, "executing anthropic tool calls");
            let invocations: Vec<ToolInvocation> = tool_uses
                .iter()
                .map(|b| ToolInvocation {
                    call_id: b["id"].as_str().unwrap_or_default().to_string(),
                    name: b["name"].as_str().unwrap_or_default().to_string(),
                    arguments: b["input"].to_string(),
                })
                .collect();
            let calls: Vec<ToolCallRequest> = invocations
                .iter()
                .map(|inv| ToolCallRequest {
                    call_id: inv.call_id.clone(),
                    name: inv.name.clone(),
                    arguments: serde_json::from_str(&inv.arguments).unwrap_or_else(|_| json!({})),
                })
                .collect();
            let results = self
                .dispatcher
                .execute_batch(&calls, &ctx.tool_context())
                .await;

            // Assistant blocks go back verbatim, then one user message with
            // all tool_result blocks.
            messages.push(json!({ "role": "assistant", "content": blocks }));
            session
                .history
                .push(Turn::assistant_tool_calls(invocations.clone()));
            let result_blocks: Vec<Value> = invocations
                .iter()
                .zip(&results)
                .map(|(inv, result)| {
                    json!({
                        "type": "tool_result",
                        "tool_use_id": inv.call_id,
                        "content": result,
                    })
                })
                .collect();
            messages.push(json!({ "role": "user", "content": result_blocks }));
            for (inv, result) in invocations.iter().zip(&results) {
                session
                    .history
                    .push(Turn::tool_result(&inv.call_id, &inv.name, result));
            }
        }

        warn!(cap = MAX_FUNCTION_CALLS, "anthropic tool-call cap exhausted");
        session.history.push(Turn::assistant(TOO_MANY_FUNCTION_CALLS));
        Ok(GenerateOutcome::done(TOO_MANY_FUNCTION_CALLS))
    }
}

/// Reconstruct Messages API rows from the canonical history.
fn turns_to_messages(history: &[Turn]) -> Vec<Value> {
    let mut messages: Vec<Value> = Vec::new();
    for turn in history {
        match turn {
            Turn::User { text } => {
                messages.push(json!({ "role": "user", "content": text }));
            }
            Turn::Assistant {
                text, tool_calls, ..
            } => {
                let mut blocks = Vec::new();
                if let Some(t) = text {
                    if !t.is_empty() {
                        blocks.push(json!({ "type": "text", "text": t }));
                    }
                }
                for call in tool_calls {
                    let input: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.call_id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                if !blocks.is_empty() {
                    messages.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Turn::ToolResult {
                call_id, content, ..
            } => {
                // Consecutive tool results merge into one user message.
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": call_id,
                    "content": content,
                });
                match messages.last_mut() {
                    Some(last)
                        if last["role"] == "user"
                            && last["content"].is_array()
                            && last["content"][0]["type"] == "tool_result" =>
                    {
                        last["content"]
                            .as_array_mut()
                            .map(|arr| arr.push(block));
                    }
                    _ => messages.push(json!({ "role": "user", "content": [block] })),
                }
            }
        }
    }
    messages
}

fn parse_usage(response: &Value) -> Option<Usage> {
    let u = response.get("usage")?;
    let input = u["input_tokens"].as_u64().unwrap_or(0);
    let output = u["output_tokens"].as_u64().unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
        reasoning_tokens: None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
