// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Remote vector-store client over the OpenAI REST surface.
//!
//! Endpoints: `POST /v1/files` (multipart), `POST /v1/vector_stores`,
//! `POST /v1/vector_stores/{id}/file_batches` + poll, `POST
//! /v1/vector_stores/{id}/search`, `DELETE /v1/vector_stores/{id}`.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::client::{BatchCounts, SearchHit, VectorStoreClient, VsFile};

pub struct OpenAiVectorStore {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    /// Per-batch upload-and-poll deadline.
    poll_timeout: Duration,
}

impl OpenAiVectorStore {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
        poll_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(20)
            .build()
            .context("building vector-store HTTP client")?;
        Ok(Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            client,
            poll_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_json(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("vector store API error {status}: {text}");
        }
        Ok(resp.json().await?)
    }

    /// Upload one file's bytes and return its file id.
    async fn upload_file(&self, file: &VsFile) -> anyhow::Result<String> {
        // The files endpoint wants multipart form data with a filename.
        let name = std::path::Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.path.clone());
        let part = reqwest::multipart::Part::text(file.content.clone()).file_name(name);
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let resp = self
            .client
            .post(self.url("files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("file upload failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("file upload error {status}: {text}");
        }
        let body: Value = resp.json().await?;
        body["id"]
            .as_str()
            .map(str::to_string)
            .context("file upload response missing id")
    }
}

#[async_trait]
impl VectorStoreClient for OpenAiVectorStore {
    fn provider(&self) -> &'static str {
        "openai"
    }

    async fn create(&self, name: &str) -> anyhow::Result<String> {
        let body = self
            .post_json("vector_stores", json!({ "name": name }))
            .await?;
        let id = body["id"]
            .as_str()
            .context("vector store create response missing id")?;
        debug!(store_id = id, "created remote vector store");
        Ok(id.to_string())
    }

    async fn upload_batch(
        &self,
        store_id: &str,
        files: &[VsFile],
    ) -> anyhow::Result<BatchCounts> {
        if files.is_empty() {
            return Ok(BatchCounts::default());
        }

        // Phase 1: upload raw files; count upload-layer failures here.
        let mut file_ids = Vec::with_capacity(files.len());
        let mut upload_failed = 0usize;
        for f in files {
            match self.upload_file(f).await {
                Ok(id) => file_ids.push(id),
                Err(e) => {
                    warn!(path = %f.path, error = %e, "raw file upload failed");
                    upload_failed += 1;
                }
            }
        }
        if file_ids.is_empty() {
            return Ok(BatchCounts {
                completed: 0,
                failed: files.len(),
                total: files.len(),
            });
        }

        // Phase 2: attach as a batch, then poll until terminal or deadline.
        let batch = self
            .post_json(
                &format!("vector_stores/{store_id}/file_batches"),
                json!({ "file_ids": file_ids }),
            )
            .await?;
        let batch_id = batch["id"]
            .as_str()
            .context("file batch response missing id")?
            .to_string();

        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        let mut status = batch["status"].as_str().unwrap_or("in_progress").to_string();
        let mut counts = batch["file_counts"].clone();
        while status == "in_progress" {
            if tokio::time::Instant::now() >= deadline {
                bail!("file batch {batch_id} timed out after {:?}", self.poll_timeout);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            let resp = self
                .client
                .get(self.url(&format!(
                    "vector_stores/{store_id}/file_batches/{batch_id}"
                )))
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let body: Value = resp.json().await?;
            status = body["status"].as_str().unwrap_or("in_progress").to_string();
            counts = body["file_counts"].clone();
        }

        let completed = counts["completed"].as_u64().unwrap_or(0) as usize;
        let failed = counts["failed"].as_u64().unwrap_or(0) as usize + upload_failed;
        Ok(BatchCounts {
            completed,
            failed,
            total: files.len(),
        })
    }

    async fn search(
        &self,
        store_id: &str,
        query: &str,
        max_results: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let body = self
            .post_json(
                &format!("vector_stores/{store_id}/search"),
                json!({ "query": query, "max_num_results": max_results }),
            )
            .await?;
        let mut hits = Vec::new();
        if let Some(data) = body["data"].as_array() {
            for item in data {
                let snippet = item["content"]
                    .as_array()
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p["text"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                hits.push(SearchHit {
                    path: item["filename"].as_str().unwrap_or_default().to_string(),
                    score: item["score"].as_f64().unwrap_or(0.0) as f32,
                    snippet,
                });
            }
        }
        Ok(hits)
    }

    async fn delete(&self, store_id: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("vector_stores/{store_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("vector store delete failed: {status}");
        }
        debug!(store_id, "deleted remote vector store");
        Ok(())
    }
}
