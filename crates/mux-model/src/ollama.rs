// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Ollama-backed local adapter.
//!
//! The model catalog is discovered at startup: `GET /api/tags` lists models,
//! `POST /api/show` reads each model's context length and parameter size.
//! The advertised context window may be clamped below the model's maximum
//! when system memory cannot hold the KV cache.
//!
//! Structured-output schemas are rejected (local models do not enforce
//! schema validation); free-form JSON via `format: "json"` is supported.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use mux_config::{HttpConfig, ProviderConfig};
use mux_store::{Session, ToolInvocation, Turn};
use mux_tools::{DeclarationFormat, ToolCallRequest, ToolDispatcher};

use crate::capabilities::ModelCapability;
use crate::error::{AdapterError, ErrorCategory};
use crate::provider::{
    ensure_context_fits, ProviderAdapter, MAX_FUNCTION_CALLS, TOO_MANY_FUNCTION_CALLS,
};
use crate::types::{CallContext, Completion, GenerateOutcome, GenerateRequest, Usage};

const DEFAULT_CONTEXT_WINDOW: u32 = 16_384;
/// Memory held back for the OS and other processes, in GiB.
const RESERVED_MEMORY_GB: f64 = 20.0;
/// Rough KV-cache cost for large models, GiB per 1k context tokens.
const GB_PER_1K_CONTEXT: f64 = 0.55;
const STANDARD_CONTEXT_SIZES: &[u32] = &[4_096, 8_192, 16_384, 32_768, 65_536, 131_072];

/// One locally available model, as reported by discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredModel {
    pub name: String,
    pub context_window: u32,
    pub parameter_size: String,
    pub quantization: String,
}

/// Startup (and optionally periodic) model discovery against a local
/// Ollama host.
pub struct OllamaDiscovery {
    host: String,
    client: reqwest::Client,
}

impl OllamaDiscovery {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(2))
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// `GET /api/tags` — names of locally pulled models.  Failures degrade
    /// to an empty catalog; a missing local daemon is not an error.
    pub async fn list_models(&self) -> Vec<String> {
        let url = format!("{}/api/tags", self.host.trim_end_matches('/'));
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "ollama not reachable");
                return vec![];
            }
        };
        let Ok(body) = resp.json::<Value>().await else { return vec![] };
        body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `POST /api/show` — context length and size details for one model.
    pub async fn model_details(&self, name: &str) -> DiscoveredModel {
        let fallback = DiscoveredModel {
            name: name.to_string(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            parameter_size: "unknown".into(),
            quantization: "unknown".into(),
        };
        let url = format!("{}/api/show", self.host.trim_end_matches('/'));
        let resp = match self
            .client
            .post(&url)
            .json(&json!({ "name": name }))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(model = name, error = %e, "ollama show failed");
                return fallback;
            }
        };
        let Ok(body) = resp.json::<Value>().await else { return fallback };

        let context_window = context_window_from_show(&body).unwrap_or(DEFAULT_CONTEXT_WINDOW);
        DiscoveredModel {
            name: name.to_string(),
            context_window,
            parameter_size: body["details"]["parameter_size"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            quantization: body["details"]["quantization_level"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
        }
    }

    /// Full discovery pass: list, detail, and clamp each model's context to
    /// what system memory can actually hold.
    pub async fn discover(&self) -> Vec<ModelCapability> {
        let names = self.list_models().await;
        let available_gb = available_memory_gb();
        let mut caps = Vec::with_capacity(names.len());
        for name in names {
            let details = self.model_details(&name).await;
            let model_gb = estimate_model_memory_gb(&details.name, &details.parameter_size);
            let viable = viable_context_tokens(available_gb, model_gb);
            let context_window = details.context_window.min(viable);
            if context_window < details.context_window {
                info!(
                    model = %name,
                    advertised = details.context_window,
                    clamped = context_window,
                    "clamping context window to available memory"
                );
            }
            caps.push(ModelCapability {
                max_output_tokens: 8_192,
                supports_streaming: true,
                supports_structured_output: false,
                description: format!(
                    "Local {} ({}, {})",
                    details.name, details.parameter_size, details.quantization
                ),
                ..ModelCapability::base(&name, "ollama", context_window)
            });
        }
        caps
    }
}

/// Context length out of an `/api/show` body: the `<family>.context_length`
/// key when present, else a `num_ctx` line in the parameters dump.
fn context_window_from_show(body: &Value) -> Option<u32> {
    if let Some(info) = body["model_info"].as_object() {
        for (key, value) in info {
            if key.ends_with(".context_length") {
                if let Some(n) = value.as_u64() {
                    return Some(n as u32);
                }
            }
        }
    }
    let params = body["parameters"].as_str()?;
    let re = Regex::new(r"num_ctx\s+(\d+)").ok()?;
    re.captures(params)?
        .get(1)?
        .as_str()
        .parse::<u32>()
        .ok()
}

/// Model RAM estimate from parameter count and quantization.
///
/// 4-bit ≈ 0.5 GiB per billion parameters, 8-bit ≈ 1 GiB, else assume 4-bit
/// (the common Ollama default).
pub fn estimate_model_memory_gb(model_name: &str, parameter_size: &str) -> f64 {
    let re = Regex::new(r"(\d+(?:\.\d+)?)\s*[bB]").expect("static regex");
    let billions = re
        .captures(parameter_size)
        .or_else(|| re.captures(model_name))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(7.0);

    let lower = model_name.to_ascii_lowercase();
    let gb_per_billion = if lower.contains("q8") || lower.contains("8bit") {
        1.0
    } else {
        0.5
    };
    billions * gb_per_billion
}

/// Largest standard context size whose KV cache fits in what is left after
/// the model itself and the OS reservation.
pub fn viable_context_tokens(available_gb: f64, model_gb: f64) -> u32 {
    let for_kv = (available_gb - model_gb - RESERVED_MEMORY_GB).max(0.0) * 0.8;
    let max_context = (for_kv / GB_PER_1K_CONTEXT * 1000.0) as u32;
    STANDARD_CONTEXT_SIZES
        .iter()
        .rev()
        .find(|&&size| size <= max_context)
        .copied()
        .unwrap_or(STANDARD_CONTEXT_SIZES[0])
}

/// MemAvailable from /proc/meminfo, in GiB.  Conservative fallback when the
/// file is unreadable (non-Linux hosts).
fn available_memory_gb() -> f64 {
    let Ok(text) = std::fs::read_to_string("/proc/meminfo") else {
        return 32.0;
    };
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: f64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0.0);
            return kb / (1024.0 * 1024.0);
        }
    }
    32.0
}

pub struct OllamaAdapter {
    capability: ModelCapability,
    base_url: String,
    client: reqwest::Client,
    dispatcher: Arc<ToolDispatcher>,
}

impl OllamaAdapter {
    pub fn new(
        capability: ModelCapability,
        provider: &ProviderConfig,
        http: &HttpConfig,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(http.connect_timeout_seconds))
            .timeout(Duration::from_secs(http.read_timeout_seconds))
            .build()
            .map_err(|e| AdapterError::configuration(e.to_string()))?;
        Ok(Self {
            capability,
            base_url: provider
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".into()),
            client,
            dispatcher,
        })
    }

    async fn call_api(&self, body: &Value) -> Result<Value, AdapterError> {
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(body)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(e).with_provider("ollama"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text).with_provider("ollama"));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::parsing(e.to_string()).with_provider("ollama"))
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn provider(&self) -> &'static str {
        "ollama"
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
        // Local models run free-form JSON mode only; schema enforcement
        // would silently not happen, so reject instead.
        if req.structured_output_schema.is_some() {
            return Err(AdapterError::new(
                ErrorCategory::InvalidModel,
                format!(
                    "{} does not support structured_output_schema; use plain JSON mode",
                    self.capability.model
                ),
            )
            .with_provider("ollama"));
        }
        ensure_context_fits(&self.capability, req.estimated_prompt_tokens)?;

        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(turns_to_flat_messages(&session.history));
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
        debug!(model = %self.capability.model, num_ctx = self.capability.context_window,
            "ollama generate");

        for round in 0..MAX_FUNCTION_CALLS {
            let mut body = json!({
                "model": self.capability.model,
                "messages": messages,
                "stream": false,
                "options": {
                    // Always pinned from the resolved capability; never left
                    // to the daemon's (small) default.
                    "num_ctx": self.capability.context_window,
                    "temperature": req.temperature.unwrap_or(0.7),
                },
            });
            if let Some(m) = req.max_output_tokens {
                body["options"]["num_predict"] = json!(m);
            }
            if !tools.is_empty() {
                body["tools"] = json!(tools);
            }

            let response = self.call_api(&body).await?;
            let message = &response["message"];
            let tool_calls = message["tool_calls"].as_array().cloned().unwrap_or_default();

            if tool_calls.is_empty() {
                let content = message["content"].as_str().unwrap_or("").to_string();
                session.history.push(Turn::assistant(&content));
                return Ok(GenerateOutcome::Done(Completion {
                    content,
                    response_id: None,
                    sources: vec![],
                    usage: parse_usage(&response),
                    debug: req.return_debug.then(|| json!({ "tools": tools })),
                }));
            }

            info!(calls = tool_calls.len(), round, "executing ollama tool calls");
            let invocations: Vec<ToolInvocation> = tool_calls
                .iter()
                .enumerate()
                .map(|(i, tc)| ToolInvocation {
                    // The daemon emits no call ids; synthesize stable ones.
                    call_id: format!("call_{round}_{i}"),
                    name: tc["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: tc["function"]["arguments"].to_string(),
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

            messages.push(message.clone());
            session
                .history
                .push(Turn::assistant_tool_calls(invocations.clone()));
            for (inv, result) in invocations.iter().zip(&results) {
                messages.push(json!({ "role": "tool", "content": result }));
                session
                    .history
                    .push(Turn::tool_result(&inv.call_id, &inv.name, result));
            }
        }

        warn!(cap = MAX_FUNCTION_CALLS, "ollama tool-call cap exhausted");
        session.history.push(Turn::assistant(TOO_MANY_FUNCTION_CALLS));
        Ok(GenerateOutcome::done(TOO_MANY_FUNCTION_CALLS))
    }
}

/// Ollama rejects structured content arrays; everything is flattened to
/// plain strings before sending.
fn turns_to_flat_messages(history: &[Turn]) -> Vec<Value> {
    history
        .iter()
        .filter_map(|turn| match turn {
            Turn::User { text } => Some(json!({ "role": "user", "content": text })),
            Turn::Assistant { text, .. } => text.as_ref().map(|t| {
                json!({ "role": "assistant", "content": t })
            }),
            Turn::ToolResult { content, .. } => {
                Some(json!({ "role": "tool", "content": content }))
            }
        })
        .collect()
}

fn parse_usage(response: &Value) -> Option<Usage> {
    let input = response["prompt_eval_count"].as_u64()?;
    let output = response["eval_count"].as_u64().unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
        reasoning_tokens: None,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_from_model_info_key() {
        let body = json!({
            "model_info": { "llama.context_length": 131072 },
            "parameters": ""
        });
        assert_eq!(context_window_from_show(&body), Some(131_072));
    }

    #[test]
    fn context_from_num_ctx_parameter_fallback() {
        let body = json!({
            "model_info": {},
            "parameters": "stop \"<|end|>\"\nnum_ctx 8192\ntemperature 0.7"
        });
        assert_eq!(context_window_from_show(&body), Some(8_192));
    }

    #[test]
    fn context_missing_everywhere_is_none() {
        assert_eq!(context_window_from_show(&json!({})), None);
    }

    #[test]
    fn memory_estimate_reads_parameter_size() {
        assert_eq!(estimate_model_memory_gb("llama3:latest", "8.0B"), 4.0);
        assert_eq!(estimate_model_memory_gb("llama3:70b", "70B"), 35.0);
    }

    #[test]
    fn memory_estimate_falls_back_to_model_name() {
        assert_eq!(estimate_model_memory_gb("mixtral-13b", "unknown"), 6.5);
    }

    #[test]
    fn q8_quantization_doubles_the_estimate() {
        assert_eq!(estimate_model_memory_gb("llama3-q8", "8B"), 8.0);
    }

    #[test]
    fn viable_context_subtracts_model_and_reservation() {
        // 64 GiB available, 4 GiB model → (64-4-20)*0.8/0.55 ≈ 58k → 32768.
        assert_eq!(viable_context_tokens(64.0, 4.0), 32_768);
        // Memory-starved host bottoms out at the smallest standard size.
        assert_eq!(viable_context_tokens(8.0, 4.0), 4_096);
        // A bigger model shrinks the viable context.
        assert!(viable_context_tokens(64.0, 35.0) < viable_context_tokens(64.0, 4.0));
    }

    #[test]
    fn flat_messages_have_plain_string_content() {
        let history = vec![
            Turn::user("hi"),
            Turn::assistant_tool_calls(vec![]),
            Turn::tool_result("c", "n", "out"),
            Turn::assistant("reply"),
        ];
        let msgs = turns_to_flat_messages(&history);
        // The content-less tool-call turn is dropped; all others flatten.
        assert_eq!(msgs.len(), 3);
        for m in &msgs {
            assert!(m["content"].is_string());
        }
    }

    #[tokio::test]
    async fn structured_output_schema_is_rejected() {
        let cap = ModelCapability {
            supports_structured_output: false,
            ..ModelCapability::base("llama3:latest", "ollama", 16_384)
        };
        let adapter = OllamaAdapter {
            capability: cap,
            base_url: "http://localhost:11434".into(),
            client: reqwest::Client::new(),
            dispatcher: Arc::new(ToolDispatcher::new(8)),
        };
        let req = GenerateRequest {
            structured_output_schema: Some(json!({ "type": "object" })),
            ..Default::default()
        };
        let mut session = Session::new("p", "t", "s");
        let err = adapter
            .generate(&req, &mut session, &CallContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidModel);
        assert!(session.history.is_empty(), "failed call must not mutate history");
    }
}
