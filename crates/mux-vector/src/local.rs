// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process vector store with disk persistence.
//!
//! The fallback backend when no remote provider is reachable.  Documents are
//! append-only; `delete` is a no-op because rollover (new store + summary
//! seed) is the deletion mechanism for local stores.  Scoring is tokenized
//! term-frequency cosine — good enough for "which overflow file mentions X".

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{BatchCounts, SearchHit, VectorStoreClient, VsFile};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDoc {
    path: String,
    content: String,
    /// Content hash; a re-upload of identical content is dropped silently.
    digest: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalIndex {
    docs: Vec<StoredDoc>,
}

pub struct LocalVectorStore {
    dir: PathBuf,
    indexes: Mutex<HashMap<String, LocalIndex>>,
}

impl LocalVectorStore {
    pub fn new(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating local store dir {}", dir.display()))?;
        Ok(Self {
            dir,
            indexes: Mutex::new(HashMap::new()),
        })
    }

    fn index_path(&self, store_id: &str) -> PathBuf {
        self.dir.join(format!("{store_id}.json"))
    }

    async fn load_index(&self, store_id: &str) -> anyhow::Result<()> {
        let mut indexes = self.indexes.lock().await;
        if indexes.contains_key(store_id) {
            return Ok(());
        }
        let path = self.index_path(store_id);
        let index = if path.is_file() {
            let text = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            LocalIndex::default()
        };
        indexes.insert(store_id.to_string(), index);
        Ok(())
    }

    async fn persist(&self, store_id: &str) -> anyhow::Result<()> {
        let indexes = self.indexes.lock().await;
        let index = match indexes.get(store_id) {
            Some(i) => i,
            None => return Ok(()),
        };
        let text = serde_json::to_string(index)?;
        tokio::fs::write(self.index_path(store_id), text).await?;
        Ok(())
    }
}

fn digest(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Term-frequency cosine between a query and a document.
fn score(query_terms: &[String], doc: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_terms = tokenize(doc);
    if doc_terms.is_empty() {
        return 0.0;
    }
    let mut tf: HashMap<&str, f32> = HashMap::new();
    for t in &doc_terms {
        *tf.entry(t.as_str()).or_default() += 1.0;
    }
    let hit: f32 = query_terms
        .iter()
        .map(|q| tf.get(q.as_str()).copied().unwrap_or(0.0))
        .sum();
    hit / (doc_terms.len() as f32).sqrt()
}

/// First line of the document containing any query term.
fn snippet_for(query_terms: &[String], doc: &str) -> String {
    for line in doc.lines() {
        let lower = line.to_ascii_lowercase();
        if query_terms.iter().any(|t| lower.contains(t.as_str())) {
            return line.trim().to_string();
        }
    }
    doc.lines().next().unwrap_or_default().trim().to_string()
}

#[async_trait]
impl VectorStoreClient for LocalVectorStore {
    fn provider(&self) -> &'static str {
        "local"
    }

    async fn create(&self, name: &str) -> anyhow::Result<String> {
        let store_id = format!("local_{}", uuid::Uuid::new_v4().simple());
        self.indexes
            .lock()
            .await
            .insert(store_id.clone(), LocalIndex::default());
        self.persist(&store_id).await?;
        debug!(store_id, name, "created local vector store");
        Ok(store_id)
    }

    async fn upload_batch(
        &self,
        store_id: &str,
        files: &[VsFile],
    ) -> anyhow::Result<BatchCounts> {
        self.load_index(store_id).await?;
        {
            let mut indexes = self.indexes.lock().await;
            let index = indexes
                .get_mut(store_id)
                .with_context(|| format!("unknown local store {store_id}"))?;
            for f in files {
                let d = digest(&f.content);
                if index
                    .docs
                    .iter()
                    .any(|doc| doc.path == f.path && doc.digest == d)
                {
                    continue;
                }
                // Same path, new content: replace in place (append-only on disk
                // history is not kept; the latest content wins for search).
                if let Some(existing) = index.docs.iter_mut().find(|doc| doc.path == f.path) {
                    existing.content = f.content.clone();
                    existing.digest = d;
                } else {
                    index.docs.push(StoredDoc {
                        path: f.path.clone(),
                        content: f.content.clone(),
                        digest: d,
                    });
                }
            }
        }
        self.persist(store_id).await?;
        Ok(BatchCounts {
            completed: files.len(),
            failed: 0,
            total: files.len(),
        })
    }

    async fn search(
        &self,
        store_id: &str,
        query: &str,
        max_results: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        self.load_index(store_id).await?;
        let indexes = self.indexes.lock().await;
        let index = match indexes.get(store_id) {
            Some(i) => i,
            None => return Ok(vec![]),
        };
        let terms = tokenize(query);
        let mut hits: Vec<SearchHit> = index
            .docs
            .iter()
            .filter_map(|doc| {
                let s = score(&terms, &doc.content);
                (s > 0.0).then(|| SearchHit {
                    path: doc.path.clone(),
                    score: s,
                    snippet: snippet_for(&terms, &doc.content),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(max_results);
        Ok(hits)
    }

    /// No-op: local stores are append-only; rollover replaces them.
    async fn delete(&self, _store_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
