// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! xAI Grok adapter — OpenAI-compatible chat/completions with the
//! `search_parameters` Live Search extension.
//!
//! Session history is stored as plain chat rows; each tool round appends the
//! assistant turn (with its tool_calls) followed by the tool-result turns.
//! Function calls during streaming are not reliably framed by the backend,
//! so requests go out non-streaming whenever tools are registered.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use mux_config::{HttpConfig, ProviderConfig};
use mux_store::{Session, ToolInvocation, Turn};
use mux_tools::{DeclarationFormat, ToolCallRequest, ToolDispatcher};

use crate::capabilities::ModelCapability;
use crate::error::{AdapterError, ErrorCategory};
use crate::provider::{
    ensure_context_fits, ProviderAdapter, MAX_FUNCTION_CALLS, TOO_MANY_FUNCTION_CALLS,
};
use crate::schema::validate_structured_output;
use crate::types::{CallContext, Completion, GenerateOutcome, GenerateRequest, SourceRef, Usage};

pub struct GrokAdapter {
    capability: ModelCapability,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    dispatcher: Arc<ToolDispatcher>,
}

impl GrokAdapter {
    pub fn new(
        capability: ModelCapability,
        provider: &ProviderConfig,
        http: &HttpConfig,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Result<Self, AdapterError> {
        let api_key = provider.api_key().ok_or_else(|| {
            AdapterError::configuration("XAI_API_KEY not configured").with_provider("grok")
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
                .unwrap_or_else(|| "https://api.x.ai/v1".into()),
            client,
            dispatcher,
        })
    }

    async fn call_api(&self, body: &Value) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(e).with_provider("grok"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text).with_provider("grok"));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::parsing(e.to_string()).with_provider("grok"))
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GrokAdapter {
    fn provider(&self) -> &'static str {
        "grok"
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

        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(turns_to_chat_messages(&session.history));
        messages.push(json!({ "role": "user", "content": req.prompt }));
        session.history.push(Turn::user(&req.prompt));

        let tools = if self.capability.supports_tools {
            self.dispatcher.declarations(
                DeclarationFormat::ChatCompletions,
                req.disable_memory_search,
                !req.vector_store_ids.is_empty(),
            )
        } else {
            vec![]
        };
        let search_params = build_search_params(req.search_mode.as_deref())?;

        debug!(model = %self.capability.model, tools = tools.len(), "grok generate");

        let mut last_response = Value::Null;
        for round in 0..MAX_FUNCTION_CALLS {
            let mut body = json!({
                "model": self.capability.model,
                "messages": messages,
                "temperature": req.temperature.unwrap_or(1.0),
                "stream": false,
            });
            if let Some(m) = req.max_output_tokens {
                body["max_tokens"] = json!(m);
            }
            if self.capability.supports_reasoning_effort {
                if let Some(e) = &req.reasoning_effort {
                    body["reasoning_effort"] = json!(e);
                }
            }
            if !tools.is_empty() {
                body["tools"] = json!(tools);
            }
            if let Some(params) = &search_params {
                body["search_parameters"] = params.clone();
            }
            if let Some(schema) = &req.structured_output_schema {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": { "name": "structured_output", "schema": schema },
                });
            }

            let response = self.call_api(&body).await?;
            let message = response["choices"][0]["message"].clone();
            if message.is_null() {
                return Err(AdapterError::parsing("response carried no message")
                    .with_provider("grok"));
            }
            last_response = response;

            let tool_calls = message["tool_calls"].as_array().cloned().unwrap_or_default();
            if tool_calls.is_empty() {
                let mut content = message["content"].as_str().unwrap_or("").to_string();
                if let Some(schema) = &req.structured_output_schema {
                    content = validate_structured_output(&content, schema)
                        .map_err(|e| e.with_provider("grok"))?;
                }
                session.history.push(Turn::assistant(&content));

                let sources = extract_sources(&last_response);
                return Ok(GenerateOutcome::Done(Completion {
                    content,
                    response_id: last_response["id"].as_str().map(str::to_string),
                    sources,
                    usage: parse_usage(&last_response),
                    debug: req.return_debug.then(|| json!({ "tools": tools })),
                }));
            }

            info!(calls = tool_calls.len(), round, "executing grok tool calls");
            let invocations: Vec<ToolInvocation> = tool_calls
                .iter()
                .map(|tc| ToolInvocation {
                    call_id: tc["id"].as_str().unwrap_or_default().to_string(),
                    name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: tc["function"]["arguments"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| tc["function"]["arguments"].to_string()),
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

            // The assistant turn with its tool_calls rides back verbatim,
            // then one tool-role row per result.
            messages.push(message);
            session
                .history
                .push(Turn::assistant_tool_calls(invocations.clone()));
            for (inv, result) in invocations.iter().zip(&results) {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": inv.call_id,
                    "name": inv.name,
                    "content": result,
                }));
                session
                    .history
                    .push(Turn::tool_result(&inv.call_id, &inv.name, result));
            }
        }

        warn!(cap = MAX_FUNCTION_CALLS, "grok tool-call cap exhausted");
        session.history.push(Turn::assistant(TOO_MANY_FUNCTION_CALLS));
        Ok(GenerateOutcome::done(TOO_MANY_FUNCTION_CALLS))
    }
}

/// Reconstruct chat rows from the canonical history.
fn turns_to_chat_messages(history: &[Turn]) -> Vec<Value> {
    history
        .iter()
        .map(|turn| match turn {
            Turn::User { text } => json!({ "role": "user", "content": text }),
            Turn::Assistant {
                text, tool_calls, ..
            } => {
                let mut msg = json!({
                    "role": "assistant",
                    "content": text.clone().unwrap_or_default(),
                });
                if !tool_calls.is_empty() {
                    msg["tool_calls"] = json!(tool_calls
                        .iter()
                        .map(|c| json!({
                            "id": c.call_id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        }))
                        .collect::<Vec<_>>());
                }
                msg
            }
            Turn::ToolResult {
                call_id,
                name,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": call_id,
                "name": name,
                "content": content,
            }),
        })
        .collect()
}

/// Live Search block: only built when the caller opted in, with keys in the
/// snake_case form the backend expects.
fn build_search_params(mode: Option<&str>) -> Result<Option<Value>, AdapterError> {
    let Some(mode) = mode else { return Ok(None) };
    if !matches!(mode, "auto" | "on" | "off") {
        return Err(AdapterError::new(
            ErrorCategory::FatalClient,
            format!("search_mode must be 'auto', 'on', or 'off', got {mode:?}"),
        )
        .with_provider("grok"));
    }
    Ok(Some(snake_case_params(json!({
        "mode": mode,
        "returnCitations": true,
    }))))
}

/// Convert camelCase search-parameter keys to the snake_case names the xAI
/// backend expects; null values are dropped.
fn snake_case_params(params: Value) -> Value {
    const MAPPING: &[(&str, &str)] = &[
        ("returnCitations", "return_citations"),
        ("fromDate", "from_date"),
        ("toDate", "to_date"),
        ("maxSearchResults", "max_search_results"),
        ("allowedWebsites", "allowed_websites"),
        ("excludedWebsites", "excluded_websites"),
        ("safeSearch", "safe_search"),
        ("xHandles", "x_handles"),
    ];
    let Some(obj) = params.as_object() else { return params };
    let mut out = Map::new();
    for (k, v) in obj {
        if v.is_null() {
            continue;
        }
        let key = MAPPING
            .iter()
            .find(|(camel, _)| camel == k)
            .map(|(_, snake)| snake.to_string())
            .unwrap_or_else(|| k.clone());
        out.insert(key, v.clone());
    }
    Value::Object(out)
}

/// Citations from Live Search, normalized: strings become `{url}`.
fn extract_sources(response: &Value) -> Vec<SourceRef> {
    let raw = response
        .get("citations")
        .or_else(|| response.get("sources"))
        .and_then(Value::as_array);
    let Some(raw) = raw else { return vec![] };
    raw.iter()
        .filter_map(|s| {
            if let Some(url) = s.as_str() {
                Some(SourceRef {
                    url: url.to_string(),
                    title: None,
                })
            } else if let Some(url) = s["url"].as_str() {
                Some(SourceRef {
                    url: url.to_string(),
                    title: s["title"].as_str().map(str::to_string),
                })
            } else {
                None
            }
        })
        .collect()
}

fn parse_usage(response: &Value) -> Option<Usage> {
    let u = response.get("usage")?;
    Some(Usage {
        input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        reasoning_tokens: u["completion_tokens_details"]["reasoning_tokens"].as_u64(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
