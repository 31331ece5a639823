// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token-budget optimizer contract.
//!
//! Rank-and-chunk prompt construction is an external collaborator as far as
//! the executor is concerned: it receives context paths and a token budget,
//! and produces a finalized prompt, the list of overflow paths that did not
//! fit inline, and a token count.  The default implementation here inlines
//! files deterministically, priority paths first.

use async_trait::async_trait;
use tracing::debug;
use walkdir::WalkDir;

use mux_store::Turn;

/// Finalized prompt produced by the optimizer.
#[derive(Debug, Clone, Default)]
pub struct OptimizedPrompt {
    pub prompt: String,
    /// Files that exceeded the inline budget and belong in a vector store.
    pub overflow_paths: Vec<String>,
    /// Estimated tokens for the outgoing prompt plus history.
    pub token_count: usize,
}

#[async_trait]
pub trait TokenBudgetOptimizer: Send + Sync {
    async fn optimize(
        &self,
        instructions: &str,
        output_format: &str,
        context: &[String],
        priority_context: &[String],
        history: &[Turn],
        budget_tokens: usize,
    ) -> anyhow::Result<OptimizedPrompt>;
}

/// Deterministic default: walk the context paths in order (priority paths
/// first), inline whole files until the budget is spent, and overflow the
/// rest.  Token estimates use the 4-bytes-per-token heuristic.
pub struct InlineFileOptimizer;

fn approx_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Expand a path into its files: a file yields itself, a directory yields
/// its files in sorted walk order.
fn expand_path(path: &str) -> Vec<String> {
    let p = std::path::Path::new(path);
    if p.is_file() {
        return vec![path.to_string()];
    }
    if p.is_dir() {
        let mut files: Vec<String> = WalkDir::new(p)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_string_lossy().into_owned())
            .collect();
        files.sort();
        return files;
    }
    // Nonexistent paths still travel as overflow candidates so the caller
    // hears about them via the skipped list downstream.
    vec![path.to_string()]
}

#[async_trait]
impl TokenBudgetOptimizer for InlineFileOptimizer {
    async fn optimize(
        &self,
        instructions: &str,
        output_format: &str,
        context: &[String],
        priority_context: &[String],
        history: &[Turn],
        budget_tokens: usize,
    ) -> anyhow::Result<OptimizedPrompt> {
        let mut prompt = String::from(instructions);
        if !output_format.is_empty() {
            prompt.push_str("\n\nRespond in this format: ");
            prompt.push_str(output_format);
        }

        let history_tokens: usize = history.iter().map(Turn::approx_tokens).sum();
        let mut used = approx_tokens(&prompt) + history_tokens;
        let mut overflow_paths = Vec::new();

        let ordered: Vec<String> = priority_context
            .iter()
            .chain(context.iter())
            .flat_map(|p| expand_path(p))
            .collect();

        let mut inlined = 0usize;
        for path in ordered {
            if overflow_paths.contains(&path) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(&path) else {
                overflow_paths.push(path);
                continue;
            };
            let cost = approx_tokens(&content) + approx_tokens(&path) + 8;
            if used + cost > budget_tokens {
                overflow_paths.push(path);
                continue;
            }
            prompt.push_str("\n\n=== ");
            prompt.push_str(&path);
            prompt.push_str(" ===\n");
            prompt.push_str(&content);
            used += cost;
            inlined += 1;
        }

        debug!(
            inlined,
            overflow = overflow_paths.len(),
            tokens = used,
            budget = budget_tokens,
            "prompt optimized"
        );
        Ok(OptimizedPrompt {
            prompt,
            overflow_paths,
            token_count: used,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
