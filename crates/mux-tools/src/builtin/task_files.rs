// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use mux_vector::VectorStoreManager;

use crate::dispatcher::{ServerTool, ToolContext};

const DEFAULT_MAX_RESULTS: usize = 20;

/// Search the overflow files attached to the current call.
///
/// Files that did not fit the inline prompt budget live in the session's
/// vector store; this tool is how non-OpenAI providers (and OpenAI models
/// without native file_search) reach them.
pub struct TaskFilesSearchTool {
    manager: Arc<VectorStoreManager>,
}

impl TaskFilesSearchTool {
    pub fn new(manager: Arc<VectorStoreManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ServerTool for TaskFilesSearchTool {
    fn name(&self) -> &str {
        "search_task_files"
    }

    fn description(&self) -> &str {
        "Search the files attached to this task that were too large to \
         include inline. Returns the most relevant file excerpts."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search terms"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of excerpts to return"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let query = args["query"].as_str().unwrap_or("").trim();
        if query.is_empty() {
            return Ok("No query provided.".into());
        }
        if ctx.vector_store_ids.is_empty() {
            return Ok("No task files are attached to this call.".into());
        }
        let max_results = args["max_results"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        debug!(
            stores = ctx.vector_store_ids.len(),
            query, "searching task files"
        );
        let hits = self
            .manager
            .search_stores(&ctx.vector_store_ids, query, max_results)
            .await?;

        if hits.is_empty() {
            return Ok(format!("No task files matched: {query}"));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|h| format!("{} (score {:.2}):\n{}", h.path, h.score, h.snippet))
            .collect();
        Ok(lines.join("\n\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
