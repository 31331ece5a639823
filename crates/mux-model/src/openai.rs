// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-style adapter over the native Responses API.
//!
//! Two execution strategies, selected per request: single-shot streaming, or
//! background job creation with polling for long-running calls.  Function
//! calls round-trip through the tool dispatcher; the follow-up request sends
//! ONLY the `function_call_output` items with `previous_response_id` — the
//! server retains full state, including reasoning items.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mux_config::{HttpConfig, ProviderConfig};
use mux_store::{Session, ToolInvocation, Turn};
use mux_tools::{DeclarationFormat, ToolCallRequest, ToolDispatcher};

use crate::capabilities::ModelCapability;
use crate::error::{AdapterError, ErrorCategory};
use crate::provider::{
    ensure_context_fits, PollBackoff, ProviderAdapter, MAX_FUNCTION_CALLS,
    TOO_MANY_FUNCTION_CALLS,
};
use crate::schema::{massage_schema_for_openai, validate_structured_output};
use crate::types::{CallContext, Completion, GenerateOutcome, GenerateRequest, Usage};

/// Requests with a deadline beyond this run in background mode so a gateway
/// idle timeout cannot kill them mid-flight.
const STREAM_TIMEOUT_THRESHOLD: Duration = Duration::from_secs(180);

use mux_store::META_PREVIOUS_RESPONSE_ID;

pub struct OpenAiAdapter {
    capability: ModelCapability,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    dispatcher: Arc<ToolDispatcher>,
}

/// Normalized view of one Responses API response, shared by both strategies.
#[derive(Debug, Default, Clone)]
struct ParsedResponse {
    id: Option<String>,
    status: String,
    incomplete_reason: Option<String>,
    error_message: Option<String>,
    content: String,
    function_calls: Vec<ToolInvocation>,
    usage: Option<Usage>,
}

impl OpenAiAdapter {
    pub fn new(
        capability: ModelCapability,
        provider: &ProviderConfig,
        http: &HttpConfig,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Result<Self, AdapterError> {
        let api_key = provider.api_key().ok_or_else(|| {
            AdapterError::configuration("OPENAI_API_KEY not configured").with_provider("openai")
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
                .unwrap_or_else(|| "https://api.openai.com/v1".into()),
            client,
            dispatcher,
        })
    }

    fn use_background(&self, req: &GenerateRequest) -> bool {
        self.capability.force_background
            || !self.capability.supports_streaming
            || req.timeout > STREAM_TIMEOUT_THRESHOLD
    }

    /// Assemble the tool list: dispatcher declarations plus native tools.
    ///
    /// When the model can search OpenAI vector stores natively, the `vs_`
    /// stores ride in a `file_search` tool and the dispatcher's
    /// `search_task_files` is left out; otherwise the dispatcher tool covers
    /// attachment search.
    fn build_tools(&self, req: &GenerateRequest) -> Vec<Value> {
        let native_ids: Vec<&String> = if self.capability.native_vector_store_provider.as_deref()
            == Some("openai")
        {
            req.vector_store_ids
                .iter()
                .filter(|id| id.starts_with("vs_"))
                .collect()
        } else {
            Vec::new()
        };
        let use_native_search = !native_ids.is_empty();

        let mut tools = self.dispatcher.declarations(
            DeclarationFormat::Responses,
            req.disable_memory_search,
            !req.vector_store_ids.is_empty() && !use_native_search,
        );

        if let Some(ws) = &self.capability.web_search_tool {
            tools.push(json!({ "type": ws }));
        }
        if use_native_search {
            tools.push(json!({
                "type": "file_search",
                "vector_store_ids": native_ids,
            }));
        }
        tools
    }

    fn build_body(
        &self,
        req: &GenerateRequest,
        input: &Value,
        previous_response_id: Option<&str>,
        tools: &[Value],
        background: bool,
    ) -> Value {
        let mut body = json!({
            "model": self.capability.model,
            "input": input,
            "background": background,
            "stream": !background,
            "store": true,
        });
        if let Some(system) = &req.system {
            body["instructions"] = json!(system);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_output_tokens {
            body["max_output_tokens"] = json!(m);
        }
        if self.capability.supports_reasoning_effort {
            let effort = req
                .reasoning_effort
                .clone()
                .or_else(|| self.capability.default_reasoning_effort.clone());
            if let Some(e) = effort {
                body["reasoning"] = json!({ "effort": e });
            }
        }
        if let Some(schema) = &req.structured_output_schema {
            let mut massaged = schema.clone();
            massage_schema_for_openai(&mut massaged);
            body["text"] = json!({
                "format": {
                    "type": "json_schema",
                    "name": "structured_output",
                    "schema": massaged,
                    "strict": true,
                }
            });
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(prev) = previous_response_id {
            body["previous_response_id"] = json!(prev);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, AdapterError> {
        let resp = self
            .client
            .post(format!("{}/responses", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(e).with_provider("openai"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text).with_provider("openai"));
        }
        Ok(resp)
    }

    /// Background strategy: create with `background=true`, then poll
    /// `GET /responses/{id}` with exponential backoff until terminal.
    async fn run_background(
        &self,
        body: Value,
        deadline: tokio::time::Instant,
    ) -> Result<ParsedResponse, AdapterError> {
        let initial: Value = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| AdapterError::parsing(e.to_string()).with_provider("openai"))?;
        let mut parsed = parse_response(&initial);
        let response_id = parsed.id.clone().ok_or_else(|| {
            AdapterError::parsing("create response carried no id").with_provider("openai")
        })?;

        let mut backoff = PollBackoff::new();
        while matches!(parsed.status.as_str(), "queued" | "in_progress") {
            let delay = backoff.next_delay();
            if tokio::time::Instant::now() + delay >= deadline {
                return Err(AdapterError::timeout(format!(
                    "background job {response_id} did not finish before the deadline"
                ))
                .with_provider("openai"));
            }
            tokio::time::sleep(delay).await;

            let resp = self
                .client
                .get(format!(
                    "{}/responses/{}",
                    self.base_url.trim_end_matches('/'),
                    response_id
                ))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| AdapterError::from_transport(e).with_provider("openai"))?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                return Err(AdapterError::from_status(status, text).with_provider("openai"));
            }
            let v: Value = resp
                .json()
                .await
                .map_err(|e| AdapterError::parsing(e.to_string()).with_provider("openai"))?;
            parsed = parse_response(&v);
        }
        Ok(parsed)
    }

    /// Streaming strategy: consume SSE deltas, then fold in the final
    /// response object for tool-call extraction and incomplete detection.
    async fn run_streaming(&self, body: Value) -> Result<ParsedResponse, AdapterError> {
        let resp = self.post(&body).await?;
        let mut stream = resp.bytes_stream();

        let mut buf = String::new();
        let mut deltas = String::new();
        let mut response_id: Option<String> = None;
        let mut final_response: Option<Value> = None;

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| AdapterError::from_transport(e).with_provider("openai"))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events may split across TCP packets; only complete lines
            // are consumed, the remainder stays buffered.
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };
                let event_type = event["type"].as_str().unwrap_or_default();
                if response_id.is_none() {
                    if let Some(id) = event["response"]["id"].as_str() {
                        response_id = Some(id.to_string());
                    }
                }
                if event_type.ends_with(".delta") {
                    if let Some(d) = event["delta"].as_str() {
                        deltas.push_str(d);
                    }
                } else if matches!(
                    event_type,
                    "response.completed" | "response.incomplete" | "response.failed"
                ) {
                    final_response = Some(event["response"].clone());
                }
            }
        }

        match final_response {
            Some(v) => Ok(parse_response(&v)),
            None => Ok(ParsedResponse {
                id: response_id,
                status: "completed".into(),
                content: deltas,
                ..Default::default()
            }),
        }
    }

    async fn run_strategy(
        &self,
        body: Value,
        background: bool,
        deadline: tokio::time::Instant,
    ) -> Result<ParsedResponse, AdapterError> {
        if background {
            self.run_background(body, deadline).await
        } else {
            self.run_streaming(body).await
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> &'static str {
        "openai"
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

        let deadline = tokio::time::Instant::now() + req.timeout;
        let background = self.use_background(req);
        let tools = self.build_tools(req);
        debug!(
            model = %self.capability.model,
            background,
            tools = tools.len(),
            "openai generate"
        );

        // Session continuity: the server retains prior turns behind
        // `previous_response_id`, so only the new user message ships.
        let mut previous_response_id = session
            .metadata(META_PREVIOUS_RESPONSE_ID)
            .and_then(Value::as_str)
            .map(str::to_string);
        let first_turn_of_session = previous_response_id.is_none();
        if first_turn_of_session && !session.history.is_empty() {
            // A fresh server-side thread with local history (e.g. imported
            // session): replay it inline once.
            debug!(turns = session.history.len(), "replaying local history inline");
        }

        let mut input = if first_turn_of_session {
            let mut items: Vec<Value> = session.history.iter().filter_map(turn_to_input).collect();
            items.push(json!({ "role": "user", "content": req.prompt }));
            Value::Array(items)
        } else {
            json!([{ "role": "user", "content": req.prompt }])
        };

        session.history.push(Turn::user(&req.prompt));

        for round in 0..MAX_FUNCTION_CALLS {
            let body = self.build_body(
                req,
                &input,
                previous_response_id.as_deref(),
                &tools,
                background,
            );
            let parsed = self.run_strategy(body, background, deadline).await?;

            if parsed.status == "incomplete" {
                let reason = parsed
                    .incomplete_reason
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(reason, "openai response incomplete");
                if reason == "max_output_tokens" {
                    return Ok(GenerateOutcome::RetryWithReducedContext { reason });
                }
                return Err(AdapterError::new(
                    ErrorCategory::TransientApi,
                    format!("response incomplete: {reason}"),
                )
                .with_provider("openai"));
            }
            if parsed.status != "completed" {
                return Err(AdapterError::new(
                    ErrorCategory::TransientApi,
                    format!(
                        "run failed with status {}: {}",
                        parsed.status,
                        parsed.error_message.unwrap_or_else(|| "unknown error".into())
                    ),
                )
                .with_provider("openai"));
            }

            let response_id = parsed.id.clone();

            if !parsed.function_calls.is_empty() {
                info!(
                    calls = parsed.function_calls.len(),
                    round, "executing tool calls"
                );
                let calls: Vec<ToolCallRequest> = parsed
                    .function_calls
                    .iter()
                    .map(|c| ToolCallRequest {
                        call_id: c.call_id.clone(),
                        name: c.name.clone(),
                        arguments: serde_json::from_str(&c.arguments)
                            .unwrap_or_else(|_| json!({})),
                    })
                    .collect();
                let results = self
                    .dispatcher
                    .execute_batch(&calls, &ctx.tool_context())
                    .await;

                session
                    .history
                    .push(Turn::assistant_tool_calls(parsed.function_calls.clone()));
                for (call, result) in parsed.function_calls.iter().zip(&results) {
                    session.history.push(Turn::tool_result(
                        &call.call_id,
                        &call.name,
                        result,
                    ));
                }

                // Follow-up minimality: ONLY the tool outputs go back; no
                // user messages, no reasoning items, no system prompt.
                input = Value::Array(
                    parsed
                        .function_calls
                        .iter()
                        .zip(&results)
                        .map(|(call, result)| {
                            json!({
                                "type": "function_call_output",
                                "call_id": call.call_id,
                                "output": result,
                            })
                        })
                        .collect(),
                );
                previous_response_id = response_id;
                continue;
            }

            let mut content = parsed.content;
            if let Some(schema) = &req.structured_output_schema {
                content = validate_structured_output(&content, schema)
                    .map_err(|e| e.with_provider("openai"))?;
            }
            session.history.push(Turn::assistant(&content));
            if let Some(id) = &response_id {
                session.set_metadata(META_PREVIOUS_RESPONSE_ID, json!(id));
            }
            return Ok(GenerateOutcome::Done(Completion {
                content,
                response_id,
                sources: vec![],
                usage: parsed.usage,
                debug: req.return_debug.then(|| json!({ "tools": tools })),
            }));
        }

        warn!(cap = MAX_FUNCTION_CALLS, "function-call round cap exhausted");
        session.history.push(Turn::assistant(TOO_MANY_FUNCTION_CALLS));
        Ok(GenerateOutcome::done(TOO_MANY_FUNCTION_CALLS))
    }
}

/// Replay one canonical turn as a Responses API input item.
///
/// Tool traffic is omitted on replay — the API rejects dangling call ids
/// from threads it does not know about; the text turns carry the context.
fn turn_to_input(turn: &Turn) -> Option<Value> {
    match turn {
        Turn::User { text } => Some(json!({ "role": "user", "content": text })),
        Turn::Assistant { text: Some(t), .. } if !t.is_empty() => {
            Some(json!({ "role": "assistant", "content": t }))
        }
        _ => None,
    }
}

/// Normalize a raw Responses API response object.
fn parse_response(v: &Value) -> ParsedResponse {
    let mut parsed = ParsedResponse {
        id: v["id"].as_str().map(str::to_string),
        status: v["status"].as_str().unwrap_or("completed").to_string(),
        incomplete_reason: v["incomplete_details"]["reason"]
            .as_str()
            .map(str::to_string),
        error_message: v["error"]["message"].as_str().map(str::to_string),
        ..Default::default()
    };

    if let Some(text) = v["output_text"].as_str() {
        parsed.content = text.to_string();
    }

    if let Some(output) = v["output"].as_array() {
        for item in output {
            match item["type"].as_str().unwrap_or_default() {
                "message" => {
                    if let Some(parts) = item["content"].as_array() {
                        for part in parts {
                            if part["type"] == "output_text" {
                                parsed.content.push_str(part["text"].as_str().unwrap_or(""));
                            }
                        }
                    }
                }
                "function_call" => {
                    parsed.function_calls.push(ToolInvocation {
                        call_id: item["call_id"].as_str().unwrap_or_default().to_string(),
                        name: item["name"].as_str().unwrap_or_default().to_string(),
                        arguments: item["arguments"]
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| item["arguments"].to_string()),
                    });
                }
                _ => {}
            }
        }
    }

    if v["usage"].is_object() {
        parsed.usage = Some(Usage {
            input_tokens: v["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: v["usage"]["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: v["usage"]["total_tokens"].as_u64().unwrap_or(0),
            reasoning_tokens: v["usage"]["output_tokens_details"]["reasoning_tokens"].as_u64(),
        });
    }

    parsed
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_message_text() {
        let v = json!({
            "id": "resp_1",
            "status": "completed",
            "output": [{
                "type": "message",
                "content": [
                    { "type": "output_text", "text": "hello " },
                    { "type": "output_text", "text": "world" }
                ]
            }]
        });
        let p = parse_response(&v);
        assert_eq!(p.id.as_deref(), Some("resp_1"));
        assert_eq!(p.content, "hello world");
        assert!(p.function_calls.is_empty());
    }

    #[test]
    fn parse_extracts_function_calls() {
        let v = json!({
            "id": "resp_2",
            "status": "completed",
            "output": [{
                "type": "function_call",
                "call_id": "call_7",
                "name": "search_project_memory",
                "arguments": "{\"query\":\"retry\"}"
            }]
        });
        let p = parse_response(&v);
        assert_eq!(p.function_calls.len(), 1);
        assert_eq!(p.function_calls[0].call_id, "call_7");
        assert_eq!(p.function_calls[0].name, "search_project_memory");
    }

    #[test]
    fn parse_surfaces_incomplete_reason() {
        let v = json!({
            "id": "resp_3",
            "status": "incomplete",
            "incomplete_details": { "reason": "max_output_tokens" }
        });
        let p = parse_response(&v);
        assert_eq!(p.status, "incomplete");
        assert_eq!(p.incomplete_reason.as_deref(), Some("max_output_tokens"));
    }

    #[test]
    fn parse_reads_usage_with_reasoning_tokens() {
        let v = json!({
            "id": "r",
            "status": "completed",
            "usage": {
                "input_tokens": 10,
                "output_tokens": 5,
                "total_tokens": 15,
                "output_tokens_details": { "reasoning_tokens": 3 }
            }
        });
        let p = parse_response(&v);
        let u = p.usage.unwrap();
        assert_eq!(u.input_tokens, 10);
        assert_eq!(u.reasoning_tokens, Some(3));
    }

    #[test]
    fn replay_skips_tool_turns() {
        assert!(turn_to_input(&Turn::user("q")).is_some());
        assert!(turn_to_input(&Turn::assistant("a")).is_some());
        assert!(turn_to_input(&Turn::tool_result("c", "n", "out")).is_none());
        assert!(turn_to_input(&Turn::assistant_tool_calls(vec![])).is_none());
    }

    fn adapter(capability: ModelCapability) -> OpenAiAdapter {
        OpenAiAdapter {
            capability,
            api_key: "test-key".into(),
            base_url: "https://api.openai.com/v1".into(),
            client: reqwest::Client::new(),
            dispatcher: Arc::new(ToolDispatcher::new(8)),
        }
    }

    #[test]
    fn native_file_search_attached_only_for_openai_stores() {
        let mut cap = ModelCapability::base("gpt-5", "openai", 400_000);
        cap.native_vector_store_provider = Some("openai".into());
        let a = adapter(cap);

        let req = GenerateRequest {
            vector_store_ids: vec!["vs_abc".into(), "local_x".into()],
            ..Default::default()
        };
        let tools = a.build_tools(&req);
        let fs = tools
            .iter()
            .find(|t| t["type"] == "file_search")
            .expect("file_search tool present");
        assert_eq!(fs["vector_store_ids"], json!(["vs_abc"]));
    }

    #[test]
    fn no_native_support_means_no_file_search_tool() {
        let a = adapter(ModelCapability::base("gpt-5", "openai", 400_000));
        let req = GenerateRequest {
            vector_store_ids: vec!["vs_abc".into()],
            ..Default::default()
        };
        let tools = a.build_tools(&req);
        assert!(tools.iter().all(|t| t["type"] != "file_search"));
    }

    #[test]
    fn follow_up_body_preserves_previous_response_id() {
        let a = adapter(ModelCapability::base("gpt-5", "openai", 400_000));
        let input = json!([{
            "type": "function_call_output",
            "call_id": "call_1",
            "output": "result"
        }]);
        let body = a.build_body(&GenerateRequest::default(), &input, Some("resp_1"), &[], true);
        assert_eq!(body["previous_response_id"], "resp_1");
        // Follow-up minimality: every input item is a function_call_output.
        for item in body["input"].as_array().unwrap() {
            assert_eq!(item["type"], "function_call_output");
        }
        assert!(body.get("instructions").is_none());
    }

    #[test]
    fn first_turn_omits_previous_response_id() {
        let a = adapter(ModelCapability::base("gpt-5", "openai", 400_000));
        let body = a.build_body(
            &GenerateRequest::default(),
            &json!([{ "role": "user", "content": "hi" }]),
            None,
            &[],
            false,
        );
        assert!(body.get("previous_response_id").is_none());
    }

    #[test]
    fn body_carries_massaged_structured_output_schema() {
        let a = adapter(ModelCapability::base("gpt-5", "openai", 400_000));
        let req = GenerateRequest {
            structured_output_schema: Some(json!({
                "type": "object",
                "properties": { "x": { "type": "string" } }
            })),
            ..Default::default()
        };
        let body = a.build_body(&req, &json!([]), None, &[], false);
        let schema = &body["text"]["format"]["schema"];
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["required"], json!(["x"]));
    }

    #[test]
    fn background_selected_by_capability_and_timeout() {
        let fast = GenerateRequest {
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let slow = GenerateRequest {
            timeout: Duration::from_secs(600),
            ..Default::default()
        };

        let mut cap = ModelCapability::base("o3-deep-research", "openai", 200_000);
        cap.force_background = true;
        assert!(adapter(cap).use_background(&fast));

        let a = adapter(ModelCapability::base("gpt-5", "openai", 400_000));
        assert!(!a.use_background(&fast));
        assert!(a.use_background(&slow));
    }
}
