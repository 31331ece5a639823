// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios over the fully wired core, using the scripted mock
//! adapter in place of network providers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mux_cli_agents::{CliAgentService, CliExecutor, CliPlugin, CodexPlugin, PluginRegistry, SessionBridge};
use mux_config::{Config, VectorStoreConfig};
use mux_core::{BlueprintRegistry, Executor, InlineFileOptimizer};
use mux_model::{MockAdapter, ModelCapability, ProviderAdapter, Scripted};
use mux_store::{SessionCache, SessionStore, Turn};
use mux_tools::builtin::{ProjectMemorySearchTool, TaskFilesSearchTool};
use mux_tools::ToolDispatcher;
use mux_vector::{LocalVectorStore, VectorStoreManager};

struct World {
    executor: Executor,
    mock: Arc<MockAdapter>,
    tmp: tempfile::TempDir,
}

async fn world() -> World {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.project_path = Some(tmp.path().to_path_buf());
    config.vector_stores = VectorStoreConfig {
        provider: "local".into(),
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
    let mock = Arc::new(MockAdapter::new(cap).with_dispatcher(dispatcher));
    executor
        .register_adapter("mock-model", Arc::clone(&mock) as Arc<dyn ProviderAdapter>)
        .await;

    World {
        executor,
        mock,
        tmp,
    }
}

// Scenario 1: single-turn chat, no tools.
#[tokio::test]
async fn single_turn_chat_appends_one_assistant_turn_and_no_store() {
    let w = world().await;
    w.mock.push(Scripted::Done("ok".into()));
    let result = w
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
    assert!(result["content"].as_str().unwrap().contains("ok"));
    assert_eq!(w.mock.recorded().len(), 1, "provider called once");

    let project = w.executor.config().project_name();
    let session = w
        .executor
        .cache()
        .store()
        .load(&project, "chat_with_mock_model", "s1")
        .await
        .unwrap()
        .unwrap();
    assert!(session.history.last().unwrap().is_terminal_assistant());
    assert!(
        w.executor
            .cache()
            .store()
            .active_store_for_session("s1")
            .await
            .unwrap()
            .is_none(),
        "no context ⇒ no vector store"
    );
}

// Scenario 2: agentic memory search through the dispatcher.
#[tokio::test]
async fn agentic_memory_search_orders_the_session_turns() {
    let w = world().await;
    let project = w.executor.config().project_name();
    w.executor
        .cache()
        .set_history(
            &project,
            "chat_with_mock_model",
            "archive",
            vec![
                Turn::user("remind me of the retry policy"),
                Turn::assistant("HIT: retry policy doc"),
            ],
        )
        .await
        .unwrap();

    w.mock.push(Scripted::ToolCall {
        name: "search_project_memory".into(),
        arguments: json!({ "query": "retry policy" }),
    });
    w.mock.push(Scripted::Done("From memory: {tool_result}".into()));

    let result = w
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
    assert!(result["content"].as_str().unwrap().contains("retry policy doc"));

    let session = w
        .executor
        .cache()
        .store()
        .load(&project, "chat_with_mock_model", "s2")
        .await
        .unwrap()
        .unwrap();
    // user → assistant(tool call) → tool result → assistant, in that order.
    assert!(matches!(session.history[0], Turn::User { .. }));
    assert!(
        matches!(&session.history[1], Turn::Assistant { tool_calls, .. } if !tool_calls.is_empty())
    );
    assert!(matches!(session.history[2], Turn::ToolResult { .. }));
    assert!(session.history[3].is_terminal_assistant());
}

// Scenario 3: incomplete response retries once with a reduced budget.
#[tokio::test]
async fn max_output_tokens_retry_runs_exactly_twice() {
    let w = world().await;
    w.mock.push(Scripted::Retry("max_output_tokens".into()));
    w.mock.push(Scripted::Done("recovered".into()));
    let result = w
        .executor
        .execute(
            "chat_with_mock_model",
            &json!({ "session_id": "s3", "instructions": "long job" }),
        )
        .await
        .unwrap();
    assert_eq!(result["content"], "recovered");
    assert_eq!(w.mock.recorded().len(), 2);
}

// Scenario 4: vector-store dedup across consecutive turns.
#[tokio::test]
async fn overflow_files_upload_once_and_dedup_on_the_second_turn() {
    let w = world().await;
    let dir = w.tmp.path().join("big");
    std::fs::create_dir_all(&dir).unwrap();
    let paths: Vec<String> = (0..50)
        .map(|i| {
            let p = dir.join(format!("doc{i:02}.md"));
            std::fs::write(&p, "filler ".repeat(30_000)).unwrap();
            p.to_string_lossy().into_owned()
        })
        .collect();

    w.mock.push(Scripted::Done("first".into()));
    w.executor
        .execute(
            "chat_with_mock_model",
            &json!({ "session_id": "s4", "instructions": "go", "context": paths }),
        )
        .await
        .unwrap();
    let record = w
        .executor
        .cache()
        .store()
        .active_store_for_session("s4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.file_paths.len(), 50);

    w.mock.push(Scripted::Done("second".into()));
    w.executor
        .execute(
            "chat_with_mock_model",
            &json!({ "session_id": "s4", "instructions": "again", "context": paths }),
        )
        .await
        .unwrap();
    let record2 = w
        .executor
        .cache()
        .store()
        .active_store_for_session("s4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record2.store_id, record.store_id);
    assert_eq!(record2.file_paths.len(), 50, "second turn uploaded nothing");
}

// Scenario 5: codex resume parse takes only the last turn bracket.
#[test]
fn codex_transcript_parse_uses_last_bracket_only() {
    let plugin = CodexPlugin::new();
    let out = plugin.parse_output(concat!(
        "{\"type\":\"thread.started\",\"thread_id\":\"th-42\"}\n",
        "{\"type\":\"turn.started\"}\n",
        "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Old1\"}}\n",
        "{\"type\":\"turn.completed\"}\n",
        "{\"type\":\"turn.started\"}\n",
        "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Old2\"}}\n",
        "{\"type\":\"turn.completed\"}\n",
        "{\"type\":\"turn.started\"}\n",
        "{\"type\":\"item.completed\",\"item\":{\"type\":\"reasoning\",\"text\":\"…internal…\"}}\n",
        "{\"type\":\"item.completed\",\"item\":{\"type\":\"command_execution\",\"text\":\"done\"}}\n",
        "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Part A\"}}\n",
        "{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Part B\"}}\n",
        "{\"type\":\"turn.completed\"}\n",
    ));
    assert_eq!(out.session_id.as_deref(), Some("th-42"));
    assert_eq!(out.content, "Part A\nPart B");
}

// Scenario 6: idle-timeout kill with captured prefix.
#[tokio::test]
async fn idle_timeout_kills_after_first_output() {
    let executor = CliExecutor::new(Duration::from_secs(600));
    let env = std::collections::HashMap::from([(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_default(),
    )]);
    let result = executor
        .execute(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "echo hello; sleep 30".to_string(),
            ],
            &env,
            Duration::from_secs(20),
            None,
            Some(Duration::from_millis(500)),
        )
        .await;
    assert!(result.idle_timeout_triggered);
    assert!(!result.timed_out);
    assert!(result.stdout.contains("hello\n"));
}
