// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error};

/// One tool invocation extracted from a provider response.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Opaque id issued by the provider; echoed back with the result.
    pub call_id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

/// Per-invocation context handed to tool handlers.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub project: String,
    pub tool: String,
    pub session_id: String,
    pub vector_store_ids: Vec<String>,
}

/// A server-side tool the model may invoke.
#[async_trait]
pub trait ServerTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String>;
}

/// Wire shape for tool declarations — each provider family wants the same
/// three fields arranged differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationFormat {
    /// `{"type":"function","function":{name,description,parameters}}`
    ChatCompletions,
    /// `{"type":"function",name,description,parameters}` (Responses API)
    Responses,
    /// Bare `{name,description,parameters}` (`FunctionDeclaration`)
    Gemini,
}

/// Central registry of callable server-side tools.
///
/// Tool executions across ALL concurrent requests share one semaphore so a
/// single chatty model cannot monopolize local resources.  A handler error
/// never aborts the batch: the failing call gets an error-string payload the
/// model can recover from, and the error is logged.
pub struct ToolDispatcher {
    tools: HashMap<String, Arc<dyn ServerTool>>,
    limiter: Arc<Semaphore>,
}

impl ToolDispatcher {
    pub fn new(concurrency: usize) -> Self {
        Self {
            tools: HashMap::new(),
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn ServerTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServerTool>> {
        self.tools.get(name).cloned()
    }

    /// Declarations for the current call, in the provider's preferred shape.
    ///
    /// The memory-search tool is included unless suppressed; the task-files
    /// tool only when the call actually has vector stores attached.  Any
    /// other registered tool is always declared.
    pub fn declarations(
        &self,
        format: DeclarationFormat,
        disable_memory_search: bool,
        has_vector_stores: bool,
    ) -> Vec<Value> {
        let mut names: Vec<&String> = self
            .tools
            .keys()
            .filter(|n| {
                match n.as_str() {
                    "search_project_memory" => !disable_memory_search,
                    "search_task_files" => has_vector_stores,
                    _ => true,
                }
            })
            .collect();
        names.sort();

        names
            .into_iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| {
                let (name, desc, params) =
                    (t.name(), t.description(), t.parameters_schema());
                match format {
                    DeclarationFormat::ChatCompletions => json!({
                        "type": "function",
                        "function": {
                            "name": name,
                            "description": desc,
                            "parameters": params,
                        }
                    }),
                    DeclarationFormat::Responses => json!({
                        "type": "function",
                        "name": name,
                        "description": desc,
                        "parameters": params,
                    }),
                    DeclarationFormat::Gemini => json!({
                        "name": name,
                        "description": desc,
                        "parameters": params,
                    }),
                }
            })
            .collect()
    }

    /// Execute a batch of tool calls with bounded concurrency.
    ///
    /// Returns one result string per call, in call order.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallRequest],
        ctx: &ToolContext,
    ) -> Vec<String> {
        let tasks = calls.iter().map(|call| {
            let limiter = Arc::clone(&self.limiter);
            let tool = self.tools.get(&call.name).cloned();
            let ctx = ctx.clone();
            let call = call.clone();
            async move {
                // A closed semaphore never happens here; treat it as busy.
                let _permit = limiter.acquire().await;
                let Some(tool) = tool else {
                    return format!("Error executing tool '{}': unknown tool", call.name);
                };
                debug!(tool = %call.name, call_id = %call.call_id, "executing tool call");
                match tool.execute(&call.arguments, &ctx).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(tool = %call.name, error = %e, "tool handler failed");
                        format!("Error executing tool '{}': {e}", call.name)
                    }
                }
            }
        });
        join_all(tasks).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct EchoTool;

    #[async_trait]
    impl ServerTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its query argument"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type":"object","properties":{"query":{"type":"string"}},"required":["query"]})
        }
        async fn execute(&self, args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            Ok(format!("echo:{}", args["query"].as_str().unwrap_or("")))
        }
    }

    struct FailTool;

    #[async_trait]
    impl ServerTool for FailTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type":"object"})
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            anyhow::bail!("intentional failure")
        }
    }

    /// Tracks the maximum number of concurrently running executions.
    struct GaugeTool {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServerTool for GaugeTool {
        fn name(&self) -> &str {
            "gauge"
        }
        fn description(&self) -> &str {
            "records concurrency"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type":"object"})
        }
        async fn execute(&self, _args: &Value, _ctx: &ToolContext) -> anyhow::Result<String> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok("ok".into())
        }
    }

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            call_id: format!("call_{name}"),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let mut d = ToolDispatcher::new(8);
        d.register(Arc::new(EchoTool));
        let out = d
            .execute_batch(&[call("echo", json!({"query":"hi"}))], &ToolContext::default())
            .await;
        assert_eq!(out, vec!["echo:hi"]);
    }

    #[tokio::test]
    async fn handler_error_becomes_payload_not_abort() {
        let mut d = ToolDispatcher::new(8);
        d.register(Arc::new(EchoTool));
        d.register(Arc::new(FailTool));
        let out = d
            .execute_batch(
                &[
                    call("boom", json!({})),
                    call("echo", json!({"query":"still runs"})),
                ],
                &ToolContext::default(),
            )
            .await;
        assert!(out[0].contains("Error executing tool 'boom'"));
        assert!(out[0].contains("intentional failure"));
        assert_eq!(out[1], "echo:still runs");
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_string() {
        let d = ToolDispatcher::new(8);
        let out = d
            .execute_batch(&[call("missing", json!({}))], &ToolContext::default())
            .await;
        assert!(out[0].contains("unknown tool"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_semaphore() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut d = ToolDispatcher::new(2);
        d.register(Arc::new(GaugeTool {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        }));
        let calls: Vec<_> = (0..6).map(|_| call("gauge", json!({}))).collect();
        d.execute_batch(&calls, &ToolContext::default()).await;
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn declaration_formats_differ_per_provider() {
        let mut d = ToolDispatcher::new(8);
        d.register(Arc::new(EchoTool));

        let chat = d.declarations(DeclarationFormat::ChatCompletions, false, false);
        assert_eq!(chat[0]["type"], "function");
        assert_eq!(chat[0]["function"]["name"], "echo");

        let responses = d.declarations(DeclarationFormat::Responses, false, false);
        assert_eq!(responses[0]["type"], "function");
        assert_eq!(responses[0]["name"], "echo");

        let gemini = d.declarations(DeclarationFormat::Gemini, false, false);
        assert!(gemini[0].get("type").is_none());
        assert_eq!(gemini[0]["name"], "echo");
    }

    #[tokio::test]
    async fn memory_tool_suppressed_and_task_files_gated() {
        struct Named(&'static str);
        #[async_trait]
        impl ServerTool for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> &str {
                "x"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type":"object"})
            }
            async fn execute(&self, _a: &Value, _c: &ToolContext) -> anyhow::Result<String> {
                Ok("".into())
            }
        }
        let mut d = ToolDispatcher::new(8);
        d.register(Arc::new(Named("search_project_memory")));
        d.register(Arc::new(Named("search_task_files")));

        let names = |decls: Vec<Value>| {
            decls
                .iter()
                .map(|d| d["name"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        };

        // No stores, memory enabled → only memory search.
        let a = names(d.declarations(DeclarationFormat::Gemini, false, false));
        assert_eq!(a, vec!["search_project_memory"]);

        // Stores attached → both.
        let b = names(d.declarations(DeclarationFormat::Gemini, false, true));
        assert_eq!(b, vec!["search_project_memory", "search_task_files"]);

        // Memory disabled → only task files.
        let c = names(d.declarations(DeclarationFormat::Gemini, true, true));
        assert_eq!(c, vec!["search_task_files"]);
    }
}
