// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

/// One file destined for a vector store.
///
/// `path` uniquely identifies the file within a store; uploading the same
/// path twice is a no-op at the manager level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsFile {
    pub path: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

impl VsFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Read a file from disk.  Empty and unreadable files yield `None` so
    /// callers can skip them before upload.
    pub fn from_path(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        if content.is_empty() {
            return None;
        }
        Some(Self::new(path.to_string_lossy(), content))
    }
}

/// Aggregate result of one raw batch upload.
///
/// The remote batch API reports counts, not per-file identity, so a partial
/// failure can only be recovered by retrying the whole batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// One search result from a store.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    pub score: f32,
    pub snippet: String,
}

/// Capability interface over a vector-store backend.
///
/// Two conforming implementations exist: a remote REST store and an
/// in-process index with disk persistence (whose `delete` is a no-op;
/// rollover is the deletion mechanism there).
#[async_trait]
pub trait VectorStoreClient: Send + Sync {
    /// Stable provider tag persisted in session metadata ("openai" | "local").
    fn provider(&self) -> &'static str;

    /// Create an empty store and return its id.
    async fn create(&self, name: &str) -> anyhow::Result<String>;

    /// Upload one raw batch of files.  Retry/split policy lives above this
    /// call in [`crate::upload_files`].
    async fn upload_batch(
        &self,
        store_id: &str,
        files: &[VsFile],
    ) -> anyhow::Result<BatchCounts>;

    /// Query the store.
    async fn search(
        &self,
        store_id: &str,
        query: &str,
        max_results: usize,
    ) -> anyhow::Result<Vec<SearchHit>>;

    /// Remove the store from the backend.
    async fn delete(&self, store_id: &str) -> anyhow::Result<()>;
}
