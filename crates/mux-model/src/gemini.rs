// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini adapter — native `generateContent` endpoint.
//!
//! Builds typed `Content`/`Part` structures from the canonical turn history,
//! declares tools in `FunctionDeclaration` shape, and drives function-call
//! rounds by appending the model content plus a user-role `functionResponse`
//! content per round.  Safety settings are permissive (`OFF`) on all
//! categories — this server fronts trusted engineering traffic.

use std::sync::Arc;
use std::time::Duration;

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
use crate::schema::extract_json;
use crate::types::{CallContext, Completion, GenerateOutcome, GenerateRequest, Usage};

const SAFETY_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_HARASSMENT",
];

const JSON_COMPLIANCE_INSTRUCTION: &str =
    "Your response must be a valid JSON object conforming to the provided schema.";

pub struct GeminiAdapter {
    capability: ModelCapability,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    dispatcher: Arc<ToolDispatcher>,
}

impl GeminiAdapter {
    pub fn new(
        capability: ModelCapability,
        provider: &ProviderConfig,
        http: &HttpConfig,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Result<Self, AdapterError> {
        let api_key = provider.api_key().ok_or_else(|| {
            AdapterError::configuration("GEMINI_API_KEY not configured").with_provider("gemini")
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
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            client,
            dispatcher,
        })
    }

    /// Resolve the thinking budget: explicit override wins, then the
    /// per-model effort map.  `0` becomes the `-1` "automatic" sentinel.
    fn thinking_budget(&self, req: &GenerateRequest) -> Option<i64> {
        if !self.capability.supports_thinking_budget {
            return None;
        }
        let budget = req.max_reasoning_tokens.or_else(|| {
            let effort = req.reasoning_effort.as_deref()?;
            let budgets = self.capability.thinking_budgets.as_ref()?;
            match budgets.for_effort(effort) {
                Some(b) => Some(b),
                None => {
                    warn!(effort, model = %self.capability.model,
                        "unknown reasoning effort, falling back to medium");
                    Some(budgets.medium)
                }
            }
        })?;
        Some(if budget == 0 { -1 } else { budget })
    }

    fn build_config(&self, req: &GenerateRequest) -> Value {
        let mut config = json!({
            "temperature": req.temperature.unwrap_or(0.2),
            "topP": 0.95,
            "maxOutputTokens": req
                .max_output_tokens
                .unwrap_or(self.capability.max_output_tokens),
            "safetySettings": SAFETY_CATEGORIES
                .iter()
                .map(|c| json!({ "category": c, "threshold": "OFF" }))
                .collect::<Vec<_>>(),
        });

        let mut system = req.system.clone();
        if let Some(schema) = &req.structured_output_schema {
            config["responseSchema"] = to_gemini_schema(schema);
            config["responseMimeType"] = json!("application/json");
            system = Some(match system {
                Some(s) => format!("{s}\n{JSON_COMPLIANCE_INSTRUCTION}"),
                None => JSON_COMPLIANCE_INSTRUCTION.to_string(),
            });
        }
        if let Some(s) = system {
            config["systemInstruction"] = json!({ "parts": [{ "text": s }] });
        }
        if let Some(budget) = self.thinking_budget(req) {
            config["thinkingConfig"] = json!({ "thinkingBudget": budget });
        }
        config
    }

    async fn call_api(&self, contents: &[Value], config: &Value, tools: &[Value])
        -> Result<Value, AdapterError>
    {
        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": config["temperature"],
                "topP": config["topP"],
                "maxOutputTokens": config["maxOutputTokens"],
            },
            "safetySettings": config["safetySettings"],
        });
        if !config["responseSchema"].is_null() {
            body["generationConfig"]["responseSchema"] = config["responseSchema"].clone();
            body["generationConfig"]["responseMimeType"] = config["responseMimeType"].clone();
        }
        if !config["thinkingConfig"].is_null() {
            body["generationConfig"]["thinkingConfig"] = config["thinkingConfig"].clone();
        }
        if !config["systemInstruction"].is_null() {
            body["systemInstruction"] = config["systemInstruction"].clone();
        }
        if !tools.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": tools }]);
        }

        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.capability.model
        );
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::from_transport(e).with_provider("gemini"))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status, text).with_provider("gemini"));
        }
        resp.json()
            .await
            .map_err(|e| AdapterError::parsing(e.to_string()).with_provider("gemini"))
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> &'static str {
        "gemini"
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

        let mut contents = turns_to_contents(&session.history);
        contents.push(json!({ "role": "user", "parts": [{ "text": req.prompt }] }));
        session.history.push(Turn::user(&req.prompt));

        let tools = if self.capability.supports_tools {
            self.dispatcher.declarations(
                DeclarationFormat::Gemini,
                req.disable_memory_search,
                !req.vector_store_ids.is_empty(),
            )
        } else {
            vec![]
        };
        let config = self.build_config(req);
        debug!(model = %self.capability.model, tools = tools.len(), "gemini generate");

        let mut usage = None;
        for round in 0..MAX_FUNCTION_CALLS {
            let response = self.call_api(&contents, &config, &tools).await?;
            usage = parse_usage(&response).or(usage);

            let candidate = &response["candidates"][0];
            let model_content = candidate["content"].clone();
            let (text, function_calls) = parse_parts(&model_content);

            if function_calls.is_empty() {
                let mut content = text;
                if req.structured_output_schema.is_some() {
                    // The provider enforces the schema during constrained
                    // generation; only unwrap markdown fencing here.
                    if let Ok(clean) = extract_json(&content) {
                        content = clean;
                    }
                }
                if content.is_empty() {
                    let finish = candidate["finishReason"].as_str().unwrap_or("UNKNOWN");
                    if finish != "STOP" {
                        return Err(AdapterError::new(
                            ErrorCategory::TransientApi,
                            format!("generation stopped without text: {finish}"),
                        )
                        .with_provider("gemini"));
                    }
                }
                session.history.push(Turn::assistant(&content));
                return Ok(GenerateOutcome::Done(Completion {
                    content,
                    response_id: response["responseId"].as_str().map(str::to_string),
                    sources: vec![],
                    usage,
                    debug: req.return_debug.then(|| json!({ "tools": tools })),
                }));
            }

            info!(calls = function_calls.len(), round, "executing gemini function calls");
            let calls: Vec<ToolCallRequest> = function_calls
                .iter()
                .map(|(name, args)| ToolCallRequest {
                    call_id: name.clone(),
                    name: name.clone(),
                    arguments: args.clone(),
                })
                .collect();
            let results = self
                .dispatcher
                .execute_batch(&calls, &ctx.tool_context())
                .await;

            session.history.push(Turn::assistant_tool_calls(
                function_calls
                    .iter()
                    .map(|(name, args)| ToolInvocation {
                        call_id: name.clone(),
                        name: name.clone(),
                        arguments: args.to_string(),
                    })
                    .collect(),
            ));
            for ((name, _), result) in function_calls.iter().zip(&results) {
                session.history.push(Turn::tool_result(name, name, result));
            }

            // Wire protocol: the model turn goes back verbatim, then the
            // function responses ride in a user-role content.
            contents.push(model_content);
            contents.push(json!({
                "role": "user",
                "parts": function_calls
                    .iter()
                    .zip(&results)
                    .map(|((name, _), result)| json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "result": result },
                        }
                    }))
                    .collect::<Vec<_>>(),
            }));
        }

        warn!(cap = MAX_FUNCTION_CALLS, "gemini function-call cap exhausted");
        session.history.push(Turn::assistant(TOO_MANY_FUNCTION_CALLS));
        Ok(GenerateOutcome::done(TOO_MANY_FUNCTION_CALLS))
    }
}

/// Reconstruct Gemini `Content` objects from the canonical history.
pub(crate) fn turns_to_contents(history: &[Turn]) -> Vec<Value> {
    let mut contents = Vec::new();
    for turn in history {
        match turn {
            Turn::User { text } => {
                contents.push(json!({ "role": "user", "parts": [{ "text": text }] }));
            }
            Turn::Assistant {
                text, tool_calls, ..
            } => {
                let mut parts = Vec::new();
                if let Some(t) = text {
                    if !t.is_empty() {
                        parts.push(json!({ "text": t }));
                    }
                }
                for call in tool_calls {
                    let args: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    parts.push(json!({
                        "functionCall": { "name": call.name, "args": args }
                    }));
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Turn::ToolResult { name, content, .. } => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": { "result": content },
                        }
                    }]
                }));
            }
        }
    }
    contents
}

/// Convert Gemini `Content` objects back into canonical turns.
pub(crate) fn contents_to_turns(contents: &[Value]) -> Vec<Turn> {
    let mut turns = Vec::new();
    for content in contents {
        let role = content["role"].as_str().unwrap_or("user");
        let parts = content["parts"].as_array().cloned().unwrap_or_default();
        if role == "model" {
            let mut text = String::new();
            let mut calls = Vec::new();
            for part in &parts {
                if let Some(t) = part["text"].as_str() {
                    text.push_str(t);
                }
                if part["functionCall"].is_object() {
                    calls.push(ToolInvocation {
                        call_id: part["functionCall"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        name: part["functionCall"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        arguments: part["functionCall"]["args"].to_string(),
                    });
                }
            }
            turns.push(Turn::Assistant {
                text: (!text.is_empty()).then_some(text),
                tool_calls: calls,
                reasoning: None,
            });
        } else {
            for part in &parts {
                if let Some(t) = part["text"].as_str() {
                    turns.push(Turn::user(t));
                } else if part["functionResponse"].is_object() {
                    let name = part["functionResponse"]["name"]
                        .as_str()
                        .unwrap_or_default();
                    let result = part["functionResponse"]["response"]["result"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            part["functionResponse"]["response"].to_string()
                        });
                    turns.push(Turn::tool_result(name, name, result));
                }
            }
        }
    }
    turns
}

/// Convert a JSON-Schema dict to the provider's typed `Schema` shape.
///
/// Supported subset: types, enum, required, properties, items,
/// minItems/maxItems.  Type names are canonicalized to uppercase enums;
/// all other fields pass through untouched.
pub fn to_gemini_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };
    let mut out = serde_json::Map::new();
    for (key, value) in obj {
        match key.as_str() {
            "type" => {
                let ty = value.as_str().unwrap_or("STRING").to_ascii_uppercase();
                out.insert("type".into(), json!(ty));
            }
            "properties" => {
                let props: serde_json::Map<String, Value> = value
                    .as_object()
                    .map(|p| {
                        p.iter()
                            .map(|(k, v)| (k.clone(), to_gemini_schema(v)))
                            .collect()
                    })
                    .unwrap_or_default();
                out.insert("properties".into(), Value::Object(props));
            }
            "items" => {
                out.insert("items".into(), to_gemini_schema(value));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(out)
}

fn parse_parts(content: &Value) -> (String, Vec<(String, Value)>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    if let Some(parts) = content["parts"].as_array() {
        for part in parts {
            // Thought parts are reasoning, not output.
            if part["thought"].as_bool() == Some(true) {
                continue;
            }
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
            if let Some(fc) = part.get("functionCall") {
                calls.push((
                    fc["name"].as_str().unwrap_or_default().to_string(),
                    fc["args"].clone(),
                ));
            }
        }
    }
    (text, calls)
}

fn parse_usage(response: &Value) -> Option<Usage> {
    let meta = response.get("usageMetadata")?;
    Some(Usage {
        input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
        output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
        total_tokens: meta["totalTokenCount"].as_u64().unwrap_or(0),
        reasoning_tokens: meta["thoughtsTokenCount"].as_u64(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turns_round_trip_through_contents() {
        let history = vec![
            Turn::user("find the retry policy"),
            Turn::assistant_tool_calls(vec![ToolInvocation {
                call_id: "search_project_memory".into(),
                name: "search_project_memory".into(),
                arguments: r#"{"query":"retry"}"#.into(),
            }]),
            Turn::tool_result("search_project_memory", "search_project_memory", "HIT"),
            Turn::assistant("found it"),
        ];
        let contents = turns_to_contents(&history);
        let back = contents_to_turns(&contents);
        assert_eq!(back.len(), history.len());
        assert_eq!(back[0], history[0]);
        assert_eq!(back[3], history[3]);
        match (&back[1], &history[1]) {
            (
                Turn::Assistant { tool_calls: a, .. },
                Turn::Assistant { tool_calls: b, .. },
            ) => {
                assert_eq!(a[0].name, b[0].name);
                // Argument JSON survives semantically.
                let av: Value = serde_json::from_str(&a[0].arguments).unwrap();
                let bv: Value = serde_json::from_str(&b[0].arguments).unwrap();
                assert_eq!(av, bv);
            }
            _ => panic!("expected assistant tool-call turns"),
        }
        assert_eq!(back[2], history[2]);
    }

    #[test]
    fn schema_conversion_uppercases_type_and_recurses() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": { "type": "string" },
                "tags": {
                    "type": "array",
                    "items": { "type": "string", "enum": ["a", "b"] },
                    "minItems": 1,
                    "maxItems": 5
                }
            }
        });
        let converted = to_gemini_schema(&schema);
        assert_eq!(converted["type"], "OBJECT");
        assert_eq!(converted["properties"]["name"]["type"], "STRING");
        assert_eq!(converted["properties"]["tags"]["type"], "ARRAY");
        assert_eq!(converted["properties"]["tags"]["items"]["type"], "STRING");
        // Non-type fields pass through untouched.
        assert_eq!(converted["required"], json!(["name"]));
        assert_eq!(converted["properties"]["tags"]["minItems"], 1);
        assert_eq!(converted["properties"]["tags"]["items"]["enum"], json!(["a", "b"]));
    }

    #[test]
    fn schema_conversion_preserves_all_fields_round_trip() {
        // dict → typed → dict: only `type` changes (to uppercase).
        let schema = json!({ "type": "STRING", "enum": ["x"] });
        assert_eq!(to_gemini_schema(&schema), schema);
    }

    #[test]
    fn parse_parts_separates_text_and_calls() {
        let content = json!({
            "role": "model",
            "parts": [
                { "text": "thinking…", "thought": true },
                { "text": "visible" },
                { "functionCall": { "name": "search_task_files", "args": { "query": "x" } } }
            ]
        });
        let (text, calls) = parse_parts(&content);
        assert_eq!(text, "visible");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "search_task_files");
    }

    #[test]
    fn usage_metadata_parsed() {
        let resp = json!({
            "usageMetadata": {
                "promptTokenCount": 100,
                "candidatesTokenCount": 20,
                "totalTokenCount": 120,
                "thoughtsTokenCount": 7
            }
        });
        let u = parse_usage(&resp).unwrap();
        assert_eq!(u.input_tokens, 100);
        assert_eq!(u.reasoning_tokens, Some(7));
    }

    fn adapter_with(capability: ModelCapability) -> GeminiAdapter {
        GeminiAdapter {
            capability,
            api_key: "test".into(),
            base_url: "https://generativelanguage.googleapis.com".into(),
            client: reqwest::Client::new(),
            dispatcher: Arc::new(ToolDispatcher::new(8)),
        }
    }

    #[test]
    fn thinking_budget_maps_effort_and_zero_sentinel() {
        let cap = crate::capabilities::lookup_capability("gemini-2.5-pro").unwrap();
        let a = adapter_with(cap);

        let req = GenerateRequest {
            reasoning_effort: Some("low".into()),
            ..Default::default()
        };
        assert_eq!(a.thinking_budget(&req), Some(4_096));

        // Explicit zero requests automatic budgeting.
        let req = GenerateRequest {
            max_reasoning_tokens: Some(0),
            ..Default::default()
        };
        assert_eq!(a.thinking_budget(&req), Some(-1));

        // No effort, no override → no thinking config.
        assert_eq!(a.thinking_budget(&GenerateRequest::default()), None);
    }

    #[test]
    fn structured_output_forces_json_mime_and_instruction() {
        let cap = crate::capabilities::lookup_capability("gemini-2.5-flash").unwrap();
        let a = adapter_with(cap);
        let req = GenerateRequest {
            structured_output_schema: Some(json!({ "type": "object" })),
            ..Default::default()
        };
        let config = a.build_config(&req);
        assert_eq!(config["responseMimeType"], "application/json");
        assert_eq!(config["responseSchema"]["type"], "OBJECT");
        let instruction = config["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(instruction.contains("valid JSON"));
    }

    #[test]
    fn safety_settings_are_off_on_all_categories() {
        let cap = crate::capabilities::lookup_capability("gemini-2.5-flash").unwrap();
        let a = adapter_with(cap);
        let config = a.build_config(&GenerateRequest::default());
        let settings = config["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 4);
        for s in settings {
            assert_eq!(s["threshold"], "OFF");
        }
    }
}
