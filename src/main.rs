// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mux_cli_agents::{CliAgentService, PluginRegistry, SessionBridge};
use mux_config::Config;
use mux_core::{BlueprintRegistry, Executor, InlineFileOptimizer};
use mux_model::OllamaDiscovery;
use mux_store::{SessionCache, SessionStore};
use mux_tools::builtin::{ProjectMemorySearchTool, TaskFilesSearchTool};
use mux_tools::ToolDispatcher;
use mux_vector::{LocalVectorStore, OpenAiVectorStore, VectorStoreManager};

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    let config = mux_config::load(args.config.as_deref())?;
    let executor = build_executor(&config).await?;

    match args.command {
        Commands::ListTools => {
            for blueprint in executor.blueprints().all() {
                println!(
                    "{:32} {:?}  {}",
                    blueprint.tool_name, blueprint.kind, blueprint.description
                );
            }
        }
        Commands::Invoke { tool, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("parsing --params as JSON")?;
            match executor.execute(&tool, &params).await {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e.payload())?);
                    std::process::exit(1);
                }
            }
        }
        Commands::Sessions {
            search,
            limit,
            summaries,
        } => {
            let listings = executor
                .cache()
                .store()
                .list_by_project(
                    &config.project_name(),
                    search.as_deref(),
                    limit,
                    summaries,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&listings)?);
        }
        Commands::Reap => {
            let sessions = executor.cache().store().run_reaper().await?;
            info!(sessions, "reaper finished");
            println!("removed {sessions} expired session(s)");
        }
    }
    Ok(())
}

/// Wire the whole request-execution core from a resolved config.
async fn build_executor(config: &Config) -> anyhow::Result<Executor> {
    let db_path = match &config.project_path {
        Some(dir) if config.session.db_path.is_relative() => dir.join(&config.session.db_path),
        _ => config.session.db_path.clone(),
    };
    let store = SessionStore::open(
        &db_path,
        config.session.ttl_seconds,
        config.session.cleanup_probability,
    )
    .with_context(|| format!("opening session store at {}", db_path.display()))?;
    let cache = SessionCache::new(store);

    // Vector stores: the remote backend when credentials exist, the local
    // index always (it is also the fallback).
    let mut manager = VectorStoreManager::new(cache.clone(), config.vector_stores.clone());
    let local_dir = config
        .vector_stores
        .local_store_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|d| d.join("mux/vector-stores")))
        .unwrap_or_else(|| std::path::PathBuf::from(".mux-vector-stores"));
    manager.register(Arc::new(LocalVectorStore::new(local_dir)?));
    let openai_cfg = config.provider("openai");
    if let Some(key) = openai_cfg.api_key() {
        manager.register(Arc::new(OpenAiVectorStore::new(
            key,
            openai_cfg.base_url.clone(),
            Duration::from_secs(config.http.connect_timeout_seconds),
            Duration::from_secs(config.http.read_timeout_seconds),
            Duration::from_secs(config.vector_stores.upload_poll_timeout),
        )?));
    }
    let manager = Arc::new(manager);

    let mut dispatcher = ToolDispatcher::new(config.executor.tool_concurrency);
    dispatcher.register(Arc::new(ProjectMemorySearchTool::new(cache.clone())));
    dispatcher.register(Arc::new(TaskFilesSearchTool::new(Arc::clone(&manager))));
    let dispatcher = Arc::new(dispatcher);

    let mut blueprints = BlueprintRegistry::with_builtin_blueprints();
    // Local models come and go; discover what the daemon actually serves.
    let ollama_cfg = config.provider("ollama");
    if ollama_cfg.enabled {
        let host = ollama_cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".into());
        let discovered = OllamaDiscovery::new(host).discover().await;
        if !discovered.is_empty() {
            info!(models = discovered.len(), "discovered local ollama models");
            blueprints.register_discovered(&discovered);
        }
    } else {
        warn!("ollama provider disabled in config");
    }

    let cli_service = Arc::new(CliAgentService::new(
        PluginRegistry::with_builtin_plugins(),
        SessionBridge::new(cache.clone()),
        config.cli_agents.clone(),
        config
            .project_path
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from(".")),
    ));

    Ok(Executor::new(
        config.clone(),
        cache,
        manager,
        dispatcher,
        Arc::new(InlineFileOptimizer),
        blueprints,
        cli_service,
    ))
}
