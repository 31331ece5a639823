// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use mux_store::{SessionCache, Turn};

use crate::dispatcher::{ServerTool, ToolContext};

const DEFAULT_MAX_RESULTS: usize = 40;
/// Sessions scanned per query; recent sessions first.
const SCAN_LIMIT: usize = 50;

/// Search across the project's stored conversations and summaries.
///
/// The model calls this to recover prior discussion ("what did we decide
/// about X?") without the host resending old transcripts.
pub struct ProjectMemorySearchTool {
    cache: SessionCache,
}

impl ProjectMemorySearchTool {
    pub fn new(cache: SessionCache) -> Self {
        Self { cache }
    }

    fn turn_text(turn: &Turn) -> Option<&str> {
        match turn {
            Turn::User { text } => Some(text),
            Turn::Assistant { text, .. } => text.as_deref(),
            Turn::ToolResult { content, .. } => Some(content),
        }
    }
}

#[async_trait]
impl ServerTool for ProjectMemorySearchTool {
    fn name(&self) -> &str {
        "search_project_memory"
    }

    fn description(&self) -> &str {
        "Search prior conversations and session summaries in this project. \
         Use when the user refers to earlier discussions, decisions, or \
         context that is not in the current conversation."
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
                    "description": "Maximum number of matches to return"
                },
                "store_types": {
                    "type": "array",
                    "items": { "type": "string", "enum": ["conversation", "summary"] },
                    "description": "Which stores to search; both by default"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> anyhow::Result<String> {
        let query = args["query"].as_str().unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Ok("No query provided.".into());
        }
        let max_results = args["max_results"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let store_types: Vec<String> = args["store_types"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| vec!["conversation".into(), "summary".into()]);
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        debug!(project = %ctx.project, query, "searching project memory");

        let listings = self
            .cache
            .store()
            .list_by_project(&ctx.project, None, SCAN_LIMIT, true)
            .await?;

        let mut results: Vec<String> = Vec::new();
        for listing in listings {
            if results.len() >= max_results {
                break;
            }
            if store_types.iter().any(|t| t == "summary") {
                if let Some(summary) = &listing.summary {
                    let lower = summary.to_ascii_lowercase();
                    if terms.iter().any(|t| lower.contains(t.as_str())) {
                        results.push(format!(
                            "[summary {}/{}] {}",
                            listing.tool, listing.session_id, summary
                        ));
                        continue;
                    }
                }
            }
            if store_types.iter().any(|t| t == "conversation") {
                let history = self
                    .cache
                    .history(&ctx.project, &listing.tool, &listing.session_id)
                    .await
                    .unwrap_or_default();
                for turn in &history {
                    let Some(text) = Self::turn_text(turn) else { continue };
                    let lower = text.to_ascii_lowercase();
                    if terms.iter().any(|t| lower.contains(t.as_str())) {
                        let line = text
                            .lines()
                            .find(|l| {
                                let ll = l.to_ascii_lowercase();
                                terms.iter().any(|t| ll.contains(t.as_str()))
                            })
                            .unwrap_or(text);
                        results.push(format!(
                            "[{}/{}] {}",
                            listing.tool,
                            listing.session_id,
                            line.trim()
                        ));
                        break;
                    }
                }
            }
        }

        if results.is_empty() {
            Ok(format!("No project memory matched: {query}"))
        } else {
            results.truncate(max_results);
            Ok(results.join("\n"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
