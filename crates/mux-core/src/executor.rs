// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use mux_cli_agents::{CliAgentError, CliAgentRequest, CliAgentService};
use mux_config::Config;
use mux_model::{
    lookup_capability, AdapterError, CallContext, ErrorCategory, GenerateOutcome,
    GenerateRequest, ProviderAdapter,
};
use mux_store::{validate_session_id, SessionCache, StoreError, Turn};
use mux_tools::ToolDispatcher;
use mux_vector::VectorStoreManager;

use crate::blueprint::{Blueprint, BlueprintKind, BlueprintRegistry};
use crate::optimizer::TokenBudgetOptimizer;
use crate::params::ToolParams;
use crate::services;

/// Executor-level failure, convertible into the machine-parseable error
/// payload returned to the host.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    CliAgent(#[from] CliAgentError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecError {
    /// `{"error": {"category", "provider"?, "message"}}`.
    pub fn payload(&self) -> Value {
        let (category, provider) = match self {
            Self::UnknownTool(_) => ("INVALID_MODEL", None),
            Self::InvalidParams(_) => ("FATAL_CLIENT", None),
            Self::Adapter(e) => (e.category.as_str(), e.provider.clone()),
            Self::Store(_) => ("TRANSIENT_API", None),
            Self::CliAgent(_) => ("TOOL_EXECUTION", None),
            Self::Other(_) => ("TRANSIENT_API", None),
        };
        let mut error = json!({
            "category": category,
            "message": self.to_string(),
        });
        if let Some(p) = provider {
            error["provider"] = json!(p);
        }
        json!({ "error": error })
    }
}

/// Top-level request driver: one instance per server process.
pub struct Executor {
    config: Config,
    cache: SessionCache,
    vector_manager: Arc<VectorStoreManager>,
    dispatcher: Arc<ToolDispatcher>,
    optimizer: Arc<dyn TokenBudgetOptimizer>,
    blueprints: BlueprintRegistry,
    cli_service: Arc<CliAgentService>,
    /// Per-model adapter singletons, built lazily behind a lock.
    adapters: Mutex<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        cache: SessionCache,
        vector_manager: Arc<VectorStoreManager>,
        dispatcher: Arc<ToolDispatcher>,
        optimizer: Arc<dyn TokenBudgetOptimizer>,
        blueprints: BlueprintRegistry,
        cli_service: Arc<CliAgentService>,
    ) -> Self {
        Self {
            config,
            cache,
            vector_manager,
            dispatcher,
            optimizer,
            blueprints,
            cli_service,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn blueprints(&self) -> &BlueprintRegistry {
        &self.blueprints
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pre-register an adapter for a model (tests, dynamic discovery).
    pub async fn register_adapter(&self, model: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.lock().await.insert(model.to_string(), adapter);
    }

    async fn adapter_for(&self, model: &str) -> Result<Arc<dyn ProviderAdapter>, ExecError> {
        let mut adapters = self.adapters.lock().await;
        if let Some(adapter) = adapters.get(model) {
            return Ok(Arc::clone(adapter));
        }
        let capability = lookup_capability(model).ok_or_else(|| {
            AdapterError::invalid_model(
                model,
                &mux_model::capabilities::builtin_capabilities()
                    .iter()
                    .map(|c| c.model.clone())
                    .collect::<Vec<_>>(),
            )
        })?;
        let adapter =
            mux_model::from_capability(capability, &self.config, Arc::clone(&self.dispatcher))?;
        adapters.insert(model.to_string(), Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Run one tool invocation end to end.
    pub async fn execute(&self, tool_name: &str, params: &Value) -> Result<Value, ExecError> {
        let blueprint = self
            .blueprints
            .get(tool_name)
            .ok_or_else(|| ExecError::UnknownTool(tool_name.to_string()))?
            .clone();
        let params = ToolParams::parse(params)?;

        match blueprint.kind {
            BlueprintKind::Chat => self.execute_chat(&blueprint, params).await,
            BlueprintKind::CliAgent => self.execute_cli_agent(&blueprint, params).await,
            BlueprintKind::LocalService => match blueprint.tool_name.as_str() {
                "list_sessions" => services::list_sessions(self, &params).await,
                "describe_session" => services::describe_session(self, &params).await,
                other => Err(ExecError::UnknownTool(other.to_string())),
            },
        }
    }

    /// The §4.6 algorithm: optimize → vector stores → generate under a
    /// deadline → reduced-context retry → persist on success.
    async fn execute_chat(
        &self,
        blueprint: &Blueprint,
        params: ToolParams,
    ) -> Result<Value, ExecError> {
        if params.instructions.is_empty() {
            return Err(ExecError::InvalidParams("instructions are required".into()));
        }
        if params.session_id.is_empty() {
            return Err(ExecError::InvalidParams("session_id is required".into()));
        }
        validate_session_id(&params.session_id)?;

        let model = blueprint
            .model
            .clone()
            .ok_or_else(|| ExecError::InvalidParams("chat blueprint without model".into()))?;
        let adapter = self.adapter_for(&model).await?;
        let capability = adapter.capability().clone();
        let project = self.config.project_name();

        let exec_cfg = &self.config.executor;
        let max_attempts = exec_cfg.max_attempts.max(1);
        let mut budget =
            (exec_cfg.context_percentage * capability.context_window as f64) as usize;
        let mut vector_store_ids = params.vector_store_ids.clone();

        for attempt in 1..=max_attempts {
            // Fresh working copy each attempt: a failed or retried call must
            // never leave partial turns behind.
            let mut session = self
                .cache
                .load_or_new(&project, &blueprint.tool_name, &params.session_id)
                .await?;

            let optimized = self
                .optimizer
                .optimize(
                    &params.instructions,
                    &params.output_format,
                    &params.context,
                    &params.priority_context,
                    &session.history,
                    budget,
                )
                .await?;

            // Overflow (or pre-existing stores) ⇒ make sure the session has
            // a store and the overflow files are in it.  Stores created on a
            // previous attempt are intentionally reused: they already hold
            // the overflow.
            if !optimized.overflow_paths.is_empty() || !params.vector_store_ids.is_empty() {
                // A store that already accumulated too many files rolls over
                // into a fresh one (seeded with a transcript digest) BEFORE
                // this turn's overflow lands, so new files live in the
                // successor.
                if let Some(bound) = self
                    .vector_manager
                    .bound_store(&project, &blueprint.tool_name, &params.session_id)
                    .await?
                {
                    if self.vector_manager.needs_rollover(&bound.store_id).await? {
                        let digest = transcript_digest(&session.history);
                        self.vector_manager
                            .summarize_and_rollover(
                                &project,
                                &blueprint.tool_name,
                                &params.session_id,
                                &digest,
                            )
                            .await?;
                        vector_store_ids.retain(|id| id != &bound.store_id);
                    }
                }

                let (info, outcome) = self
                    .vector_manager
                    .ensure_store_with_files(
                        &project,
                        &blueprint.tool_name,
                        &params.session_id,
                        &optimized.overflow_paths,
                        &[],
                        None,
                    )
                    .await?;
                debug!(
                    store_id = %info.store_id,
                    uploaded = outcome.uploaded.len(),
                    skipped = outcome.skipped.len(),
                    "overflow files attached"
                );
                if !vector_store_ids.contains(&info.store_id) {
                    vector_store_ids.push(info.store_id);
                }
                self.vector_manager.renew_lease(&params.session_id).await?;
                // The store binding just updated session metadata; reload so
                // this attempt's working copy carries it.
                session = self
                    .cache
                    .load_or_new(&project, &blueprint.tool_name, &params.session_id)
                    .await?;
            }

            let request = GenerateRequest {
                prompt: optimized.prompt.clone(),
                system: params.role.clone(),
                temperature: params.temperature,
                max_output_tokens: None,
                reasoning_effort: params.reasoning_effort.clone(),
                max_reasoning_tokens: params.max_reasoning_tokens,
                structured_output_schema: params.structured_output_schema.clone(),
                search_mode: params.search_mode.clone(),
                vector_store_ids: vector_store_ids.clone(),
                disable_memory_search: params.disable_memory_search
                    || exec_cfg.disable_memory_search,
                estimated_prompt_tokens: optimized.token_count,
                timeout: blueprint.timeout,
                return_debug: params.return_debug,
            };
            let ctx = CallContext {
                project: project.clone(),
                tool: blueprint.tool_name.clone(),
                session_id: params.session_id.clone(),
                vector_store_ids: vector_store_ids.clone(),
            };

            info!(
                tool = %blueprint.tool_name,
                model = %model,
                attempt,
                budget,
                "executing generate"
            );
            let outcome = tokio::time::timeout(
                blueprint.timeout,
                adapter.generate(&request, &mut session, &ctx),
            )
            .await
            .map_err(|_| {
                AdapterError::timeout(format!(
                    "call exceeded the {}s deadline",
                    blueprint.timeout.as_secs()
                ))
                .with_provider(capability.provider.clone())
            })??;

            match outcome {
                GenerateOutcome::Done(completion) => {
                    self.cache.save(&session).await?;
                    let mut result = json!({
                        "content": completion.content,
                        "session_id": params.session_id,
                    });
                    if !completion.sources.is_empty() {
                        result["sources"] = serde_json::to_value(&completion.sources)
                            .unwrap_or(Value::Null);
                    }
                    if let Some(debug_info) = completion.debug {
                        result["debug"] = debug_info;
                    }
                    return Ok(result);
                }
                GenerateOutcome::RetryWithReducedContext { reason } => {
                    // `max_output_tokens` is the only retriable reason.
                    if reason != "max_output_tokens" || attempt >= max_attempts {
                        return Err(AdapterError::new(
                            ErrorCategory::TransientApi,
                            format!("response incomplete: {reason} (after {attempt} attempts)"),
                        )
                        .with_provider(capability.provider.clone())
                        .into());
                    }
                    budget = (budget as f64 * exec_cfg.context_reduction_factor) as usize;
                    warn!(reason, attempt, new_budget = budget, "retrying with reduced context");
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    /// `work_with`: delegate to a subprocess coding agent, then record the
    /// exchange in the unified session.
    async fn execute_cli_agent(
        &self,
        blueprint: &Blueprint,
        params: ToolParams,
    ) -> Result<Value, ExecError> {
        if params.instructions.is_empty() {
            return Err(ExecError::InvalidParams("instructions are required".into()));
        }
        if params.session_id.is_empty() {
            return Err(ExecError::InvalidParams("session_id is required".into()));
        }
        validate_session_id(&params.session_id)?;

        // Model → CLI resolution: an explicit `cli` wins, else the target
        // model's blueprint attribute.  Models without one are API-only.
        let cli_name = match (&params.cli, &params.model) {
            (Some(cli), _) => cli.clone(),
            (None, Some(model)) => lookup_capability(model)
                .and_then(|c| c.cli_name)
                .ok_or_else(|| {
                    ExecError::InvalidParams(format!(
                        "model {model:?} has no companion CLI; it is API-only"
                    ))
                })?,
            (None, None) => {
                return Err(ExecError::InvalidParams(
                    "work_with requires a `cli` or `model` parameter".into(),
                ))
            }
        };

        let project = self.config.project_name();
        let project_dir = self
            .config
            .project_path
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        let request = CliAgentRequest {
            cli_name: cli_name.clone(),
            task: params.instructions.clone(),
            project_dir,
            role: params.role.clone(),
            reasoning_effort: params.reasoning_effort.clone(),
            extra_flags: params.extra_flags.clone(),
            timeout: blueprint.timeout,
            project: project.clone(),
            tool: blueprint.tool_name.clone(),
            session_id: params.session_id.clone(),
        };
        let response = self.cli_service.run(&request).await?;

        let mut session = self
            .cache
            .load_or_new(&project, &blueprint.tool_name, &params.session_id)
            .await?;
        session.history.push(Turn::user(&params.instructions));
        session.history.push(Turn::assistant(&response.content));
        self.cache.save(&session).await?;

        let mut result = json!({
            "content": response.content,
            "session_id": params.session_id,
        });
        if let Some(path) = response.transcript_path {
            result["transcript_path"] = json!(path.to_string_lossy());
        }
        Ok(result)
    }
}

/// Plain-text digest of a transcript, used to seed rollover stores.
///
/// Recent turns first would lose narrative order; this keeps chronological
/// order and trims each turn to a line.
fn transcript_digest(history: &[Turn]) -> String {
    let mut lines = Vec::with_capacity(history.len());
    for turn in history {
        let (who, text) = match turn {
            Turn::User { text } => ("user", text.as_str()),
            Turn::Assistant { text, .. } => ("assistant", text.as_deref().unwrap_or("")),
            Turn::ToolResult { name, content, .. } => (name.as_str(), content.as_str()),
        };
        let line = text.lines().next().unwrap_or("");
        if !line.is_empty() {
            let mut entry = format!("{who}: {line}");
            entry.truncate(entry.char_indices().nth(200).map(|(i, _)| i).unwrap_or(entry.len()));
            lines.push(entry);
        }
    }
    lines.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use mux_cli_agents::{PluginRegistry, SessionBridge};
    use mux_config::VectorStoreConfig;
    use mux_model::{MockAdapter, ModelCapability, Scripted};
    use mux_store::SessionStore;
    use mux_tools::builtin::{ProjectMemorySearchTool, TaskFilesSearchTool};
    use mux_vector::LocalVectorStore;

    use super::*;
    use crate::blueprint::BlueprintRegistry;
    use crate::optimizer::InlineFileOptimizer;

    struct Harness {
        executor: Executor,
        mock: Arc<MockAdapter>,
        _tmp: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with_rollover(VectorStoreConfig::default().rollover_threshold).await
    }

    async fn harness_with_rollover(rollover_threshold: usize) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.project_path = Some(tmp.path().to_path_buf());
        config.vector_stores = VectorStoreConfig {
            provider: "local".into(),
            rollover_threshold,
            ..Default::default()
        };

        let cache = SessionCache::new(SessionStore::open_in_memory(3600).unwrap());
        let mut manager = VectorStoreManager::new(cache.clone(), config.vector_stores.clone());
        manager.register(Arc::new(
            LocalVectorStore::new(tmp.path().join("stores")).unwrap(),
        ));
        let manager = Arc::new(manager);

        let mut dispatcher = ToolDispatcher::new(config.executor.tool_concurrency);
        dispatcher.register(Arc::new(ProjectMemorySearchTool::new(cache.clone())));
        dispatcher.register(Arc::new(TaskFilesSearchTool::new(Arc::clone(&manager))));
        let dispatcher = Arc::new(dispatcher);

        let mut blueprints = BlueprintRegistry::with_builtin_blueprints();
        // Mock chat tool with a small context window for guard tests.
        let cap = ModelCapability::base("mock-model", "mock", 32_000);
        blueprints.register_discovered(std::slice::from_ref(&cap));

        let cli_service = Arc::new(CliAgentService::new(
            PluginRegistry::with_builtin_plugins(),
            SessionBridge::new(cache.clone()),
            config.cli_agents.clone(),
            tmp.path().to_path_buf(),
        ));

        let executor = Executor::new(
            config,
            cache,
            manager,
            Arc::clone(&dispatcher),
            Arc::new(InlineFileOptimizer),
            blueprints,
            cli_service,
        );

        let mock = Arc::new(
            MockAdapter::new(cap).with_dispatcher(dispatcher),
        );
        executor
            .register_adapter("mock-model", Arc::clone(&mock) as Arc<dyn ProviderAdapter>)
            .await;

        Harness {
            executor,
            mock,
            _tmp: tmp,
        }
    }

    #[tokio::test]
    async fn single_turn_chat_no_tools() {
        let h = harness().await;
        h.mock.push(Scripted::Done("ok".into()));
        let result = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({
                    "session_id": "s1",
                    "instructions": "Say 'ok'.",
                    "output_format": "text",
                    "context": [],
                }),
            )
            .await
            .unwrap();
        assert_eq!(result["content"], "ok");

        // One provider call, one appended assistant turn, no vector store.
        assert_eq!(h.mock.recorded().len(), 1);
        let project = h.executor.config().project_name();
        let session = h
            .executor
            .cache()
            .store()
            .load(&project, "chat_with_mock_model", "s1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.history.len(), 2);
        assert!(session.history.last().unwrap().is_terminal_assistant());
        assert!(h
            .executor
            .cache()
            .store()
            .active_store_for_session("s1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn agentic_memory_search_round_trips_through_dispatcher() {
        let h = harness().await;
        let project = h.executor.config().project_name();
        // Seed prior discussion so the memory tool has something to find.
        h.executor
            .cache()
            .set_history(
                &project,
                "chat_with_mock_model",
                "s-prior",
                vec![
                    Turn::user("What about the retry policy?"),
                    Turn::assistant("HIT: retry policy doc"),
                ],
            )
            .await
            .unwrap();

        h.mock.push(Scripted::ToolCall {
            name: "search_project_memory".into(),
            arguments: json!({ "query": "retry policy" }),
        });
        h.mock.push(Scripted::Done("Found: {tool_result}".into()));

        let result = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({
                    "session_id": "s2",
                    "instructions": "Find prior discussion of 'retry policy'.",
                }),
            )
            .await
            .unwrap();
        assert!(
            result["content"].as_str().unwrap().contains("retry policy doc"),
            "{result}"
        );

        // user → assistant(tool_call) → tool_result → assistant, in order.
        let session = h
            .executor
            .cache()
            .store()
            .load(&project, "chat_with_mock_model", "s2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.history.len(), 4);
        assert!(matches!(session.history[0], Turn::User { .. }));
        assert!(matches!(
            session.history[1],
            Turn::Assistant { ref tool_calls, .. } if !tool_calls.is_empty()
        ));
        assert!(matches!(session.history[2], Turn::ToolResult { .. }));
        assert!(session.history[3].is_terminal_assistant());
    }

    #[tokio::test]
    async fn incomplete_retries_once_with_reduced_budget() {
        let h = harness().await;
        h.mock.push(Scripted::Retry("max_output_tokens".into()));
        h.mock.push(Scripted::Done("second try".into()));

        let result = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "s3", "instructions": "long prompt" }),
            )
            .await
            .unwrap();
        assert_eq!(result["content"], "second try");
        assert_eq!(h.mock.recorded().len(), 2, "exactly two adapter attempts");

        // First attempt's partial turns were discarded.
        let project = h.executor.config().project_name();
        let session = h
            .executor
            .cache()
            .store()
            .load(&project, "chat_with_mock_model", "s3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.history.len(), 2);
    }

    #[tokio::test]
    async fn retry_budget_shrinks_by_the_reduction_factor() {
        let h = harness().await;
        h.mock.push(Scripted::Retry("max_output_tokens".into()));
        h.mock.push(Scripted::Retry("max_output_tokens".into()));

        // Two attempts configured; both incomplete → terminal error.
        let err = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "s4", "instructions": "x" }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max_output_tokens"), "{err}");
        assert_eq!(h.mock.recorded().len(), 2);

        // No session was persisted along the failed path.
        let project = h.executor.config().project_name();
        assert!(h
            .executor
            .cache()
            .store()
            .load(&project, "chat_with_mock_model", "s4")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn non_retriable_incomplete_reason_is_surfaced() {
        let h = harness().await;
        h.mock.push(Scripted::Retry("content_filter".into()));
        let err = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "s5", "instructions": "x" }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("content_filter"));
        assert_eq!(h.mock.recorded().len(), 1, "no retry for other reasons");
    }

    #[tokio::test]
    async fn overflow_context_creates_store_and_dedups_second_turn() {
        let h = harness().await;
        // Files too large for a tiny budget have to overflow.
        let dir = h._tmp.path().join("ctx");
        std::fs::create_dir_all(&dir).unwrap();
        let mut paths = Vec::new();
        for i in 0..5 {
            let p = dir.join(format!("f{i}.md"));
            std::fs::write(&p, "data ".repeat(2_000)).unwrap();
            paths.push(p.to_string_lossy().into_owned());
        }

        // mock-model's 32k window gives a ~27k budget; each file is ~50k
        // tokens, so all five must overflow into the store.
        for p in &paths {
            std::fs::write(p, "data ".repeat(40_000)).unwrap();
        }

        h.mock.push(Scripted::Done("turn one".into()));
        h.executor
            .execute(
                "chat_with_mock_model",
                &json!({
                    "session_id": "s6",
                    "instructions": "use the context",
                    "context": paths,
                }),
            )
            .await
            .unwrap();

        let record = h
            .executor
            .cache()
            .store()
            .active_store_for_session("s6")
            .await
            .unwrap()
            .expect("store created for overflow");
        assert_eq!(record.file_paths.len(), 5);

        // Second turn with the same paths uploads nothing new.
        h.mock.push(Scripted::Done("turn two".into()));
        h.executor
            .execute(
                "chat_with_mock_model",
                &json!({
                    "session_id": "s6",
                    "instructions": "again",
                    "context": paths,
                }),
            )
            .await
            .unwrap();
        let record2 = h
            .executor
            .cache()
            .store()
            .active_store_for_session("s6")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record2.store_id, record.store_id, "store reused");
        assert_eq!(record2.file_paths.len(), 5, "no duplicate uploads");

        // The adapter saw the store id on both turns.
        for req in h.mock.recorded() {
            assert!(req.vector_store_ids.contains(&record.store_id));
        }
    }

    #[tokio::test]
    async fn full_store_rolls_over_before_new_uploads() {
        let h = harness_with_rollover(3).await;
        let dir = h._tmp.path().join("ctx");
        std::fs::create_dir_all(&dir).unwrap();
        let paths: Vec<String> = (0..5)
            .map(|i| {
                let p = dir.join(format!("f{i}.md"));
                std::fs::write(&p, "data ".repeat(40_000)).unwrap();
                p.to_string_lossy().into_owned()
            })
            .collect();

        h.mock.push(Scripted::Done("one".into()));
        h.executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "s9", "instructions": "go", "context": paths }),
            )
            .await
            .unwrap();
        let first = h
            .executor
            .cache()
            .store()
            .active_store_for_session("s9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.file_paths.len(), 5);

        // 5 files > threshold 3 ⇒ the next turn must roll the store over
        // and land its (new) overflow in the successor.
        let extra = dir.join("extra.md");
        std::fs::write(&extra, "more ".repeat(40_000)).unwrap();
        h.mock.push(Scripted::Done("two".into()));
        h.executor
            .execute(
                "chat_with_mock_model",
                &json!({
                    "session_id": "s9",
                    "instructions": "again",
                    "context": [extra.to_string_lossy()],
                }),
            )
            .await
            .unwrap();

        let second = h
            .executor
            .cache()
            .store()
            .active_store_for_session("s9")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(second.store_id, first.store_id, "store rolled over");
        assert!(second
            .file_paths
            .iter()
            .any(|p| p == "session_summary.md"));
        assert!(second.file_paths.iter().any(|p| p.ends_with("extra.md")));
        // The retired store is inactive.
        let old = h
            .executor
            .cache()
            .store()
            .get_vector_store(&first.store_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!old.active);
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_params_are_rejected() {
        let h = harness().await;
        let err = h.executor.execute("no_such_tool", &json!({})).await.unwrap_err();
        assert!(matches!(err, ExecError::UnknownTool(_)));
        assert_eq!(err.payload()["error"]["category"], "INVALID_MODEL");

        let err = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "s", "instructions": "x", "bogus": 1 }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidParams(_)));

        let err = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "bad id!", "instructions": "x" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Store(_)));
    }

    #[tokio::test]
    async fn adapter_failure_does_not_mutate_session() {
        let h = harness().await;
        h.mock.push(Scripted::Fail(AdapterError::new(
            ErrorCategory::RateLimit,
            "slow down",
        )));
        let err = h
            .executor
            .execute(
                "chat_with_mock_model",
                &json!({ "session_id": "s7", "instructions": "x" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.payload()["error"]["category"], "RATE_LIMIT");
        let project = h.executor.config().project_name();
        assert!(h
            .executor
            .cache()
            .store()
            .load(&project, "chat_with_mock_model", "s7")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn work_with_requires_cli_resolution() {
        let h = harness().await;
        let err = h
            .executor
            .execute(
                "work_with",
                &json!({ "session_id": "s8", "instructions": "do", "model": "grok-4" }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API-only"), "{err}");

        let err = h
            .executor
            .execute(
                "work_with",
                &json!({ "session_id": "s8", "instructions": "do" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::InvalidParams(_)));
    }
}
