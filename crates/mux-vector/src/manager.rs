// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::json;
use tracing::{debug, info, warn};

use mux_config::VectorStoreConfig;
use mux_store::{SessionCache, VectorStoreRecord};

use crate::batch::upload_files;
use crate::client::{SearchHit, VectorStoreClient, VsFile};
use crate::filter::split_supported;
use crate::CancelReceiver;

/// Metadata key under which a session's store binding is persisted.
const META_VECTOR_STORE: &str = "vector_store";
/// Seed file name for rollover stores.
const ROLLOVER_SUMMARY_PATH: &str = "session_summary.md";

/// The store binding persisted per session: which backend and which id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub store_id: String,
    pub provider: String,
}

/// Outcome of an add-files call: paths actually sent vs. paths skipped
/// (duplicates, unsupported extensions, unreadable files).
#[derive(Debug, Default, Clone)]
pub struct AddFilesOutcome {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: usize,
    pub exhausted_retries: bool,
}

/// Allocates one store per session, remembers it across turns, dedups
/// uploads, and handles lease renewal and rollover.
pub struct VectorStoreManager {
    clients: HashMap<&'static str, Arc<dyn VectorStoreClient>>,
    cache: SessionCache,
    cfg: VectorStoreConfig,
}

impl VectorStoreManager {
    pub fn new(cache: SessionCache, cfg: VectorStoreConfig) -> Self {
        Self {
            clients: HashMap::new(),
            cache,
            cfg,
        }
    }

    /// Register a backend.  The preferred provider comes from config; "local"
    /// serves as the fallback and should always be registered.
    pub fn register(&mut self, client: Arc<dyn VectorStoreClient>) {
        self.clients.insert(client.provider(), client);
    }

    fn client(&self, provider: &str) -> anyhow::Result<Arc<dyn VectorStoreClient>> {
        self.clients
            .get(provider)
            .cloned()
            .with_context(|| format!("no vector store client registered for {provider:?}"))
    }

    fn lease_expiry(&self) -> i64 {
        chrono::Utc::now().timestamp() + self.cfg.ttl_seconds as i64
    }

    /// Provider owning a store id: the persisted record when available,
    /// otherwise inferred from the id shape (`vs_…` is remote).
    async fn provider_for(&self, store_id: &str) -> String {
        if let Ok(Some(rec)) = self.cache.store().get_vector_store(store_id).await {
            return rec.provider;
        }
        if store_id.starts_with("vs_") {
            "openai".into()
        } else {
            "local".into()
        }
    }

    /// Return the session's store, creating one when absent.
    ///
    /// Creation tries the configured provider first and falls back to the
    /// local backend; both the chosen provider tag and the store id are
    /// persisted in session metadata so later turns reuse them.
    pub async fn get_or_create(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> anyhow::Result<StoreInfo> {
        if let Some(info) = self.bound_store(project, tool, session_id).await? {
            debug!(session_id, store_id = %info.store_id, "reusing session vector store");
            return Ok(info);
        }
        self.create_store(project, tool, session_id).await
    }

    /// The session's currently bound active store, if any.
    pub async fn bound_store(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> anyhow::Result<Option<StoreInfo>> {
        let meta = self
            .cache
            .get_metadata(project, tool, session_id, META_VECTOR_STORE)
            .await?;
        let Some(meta) = meta else { return Ok(None) };
        let (Some(store_id), Some(provider)) = (
            meta["store_id"].as_str().map(str::to_string),
            meta["provider"].as_str().map(str::to_string),
        ) else {
            return Ok(None);
        };
        // The binding must point at a live lease row.
        match self.cache.store().get_vector_store(&store_id).await? {
            Some(rec) if rec.active => Ok(Some(StoreInfo { store_id, provider })),
            _ => Ok(None),
        }
    }

    async fn create_store(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> anyhow::Result<StoreInfo> {
        let name = format!("mux-{session_id}");
        let preferred = self.cfg.provider.clone();

        let info = match self.client(&preferred) {
            Ok(client) => match client.create(&name).await {
                Ok(id) => StoreInfo {
                    store_id: id,
                    provider: preferred,
                },
                Err(e) => {
                    warn!(session_id, provider = %preferred, error = %e,
                        "preferred vector store creation failed, falling back to local");
                    let local = self.client("local")?;
                    StoreInfo {
                        store_id: local.create(&name).await?,
                        provider: "local".into(),
                    }
                }
            },
            Err(_) => {
                let local = self.client("local")?;
                StoreInfo {
                    store_id: local.create(&name).await?,
                    provider: "local".into(),
                }
            }
        };

        self.cache
            .store()
            .upsert_vector_store(&VectorStoreRecord {
                store_id: info.store_id.clone(),
                provider: info.provider.clone(),
                session_id: session_id.to_string(),
                file_paths: vec![],
                ttl_expiry: self.lease_expiry(),
                active: true,
            })
            .await?;
        self.cache
            .set_metadata(
                project,
                tool,
                session_id,
                META_VECTOR_STORE,
                json!({ "store_id": info.store_id, "provider": info.provider }),
            )
            .await?;
        info!(session_id, store_id = %info.store_id, provider = %info.provider,
            "created session vector store");
        Ok(info)
    }

    /// Add files to a store, skipping paths already present.
    ///
    /// `already_present` augments the persisted path set (callers may know
    /// about paths uploaded out-of-band).  Unsupported and unreadable paths
    /// are skipped, not failed.
    pub async fn add_files(
        &self,
        info: &StoreInfo,
        new_paths: &[String],
        already_present: &[String],
    ) -> anyhow::Result<AddFilesOutcome> {
        let mut outcome = AddFilesOutcome::default();
        if new_paths.is_empty() {
            return Ok(outcome);
        }

        let record = self.cache.store().get_vector_store(&info.store_id).await?;
        let mut known: HashSet<String> = already_present.iter().cloned().collect();
        if let Some(rec) = &record {
            known.extend(rec.file_paths.iter().cloned());
        }

        let fresh: Vec<String> = new_paths
            .iter()
            .filter(|p| {
                if known.contains(*p) {
                    outcome.skipped.push((*p).clone());
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            debug!(store_id = %info.store_id, "all paths already present, nothing to upload");
            return Ok(outcome);
        }

        let (supported, unsupported) = split_supported(&fresh);
        outcome.skipped.extend(unsupported);

        let mut files = Vec::with_capacity(supported.len());
        let mut readable = Vec::with_capacity(supported.len());
        for path in supported {
            match VsFile::from_path(std::path::Path::new(&path)) {
                Some(f) => {
                    files.push(f);
                    readable.push(path);
                }
                None => outcome.skipped.push(path),
            }
        }
        if files.is_empty() {
            return Ok(outcome);
        }

        let client = self.client(&info.provider)?;
        let report = upload_files(
            client.as_ref(),
            &info.store_id,
            files,
            self.cfg.parallel_batches,
            self.cfg.max_retries,
        )
        .await;
        outcome.failed = report.failed;
        outcome.exhausted_retries = report.exhausted_retries;

        if report.completed > 0 {
            outcome.uploaded = readable;
            if let Some(mut rec) = record {
                rec.file_paths.extend(outcome.uploaded.iter().cloned());
                rec.ttl_expiry = self.lease_expiry();
                self.cache.store().upsert_vector_store(&rec).await?;
            }
        } else {
            outcome.skipped.extend(readable);
        }
        Ok(outcome)
    }

    /// Cancellable create-and-upload used on the request path.
    ///
    /// When `cancel` fires mid-flight, a store created by this call is
    /// deleted (never leaked) and the cancellation is re-raised as an error.
    pub async fn ensure_store_with_files(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        paths: &[String],
        already_present: &[String],
        cancel: Option<&mut CancelReceiver>,
    ) -> anyhow::Result<(StoreInfo, AddFilesOutcome)> {
        let pre_existing = self.bound_store(project, tool, session_id).await?;

        let work = async {
            let info = match pre_existing.clone() {
                Some(info) => info,
                None => self.create_store(project, tool, session_id).await?,
            };
            let outcome = self.add_files(&info, paths, already_present).await?;
            Ok::<_, anyhow::Error>((info, outcome))
        };

        match cancel {
            None => work.await,
            Some(rx) => {
                tokio::select! {
                    biased;
                    _ = &mut *rx => {
                        // The work future is dropped here; if it got far enough
                        // to create a store this turn, reap it so nothing leaks.
                        if pre_existing.is_none() {
                            if let Ok(Some(info)) =
                                self.bound_store(project, tool, session_id).await
                            {
                                warn!(store_id = %info.store_id,
                                    "upload cancelled, deleting freshly created store");
                                if let Ok(client) = self.client(&info.provider) {
                                    let _ = client.delete(&info.store_id).await;
                                }
                                let _ = self
                                    .cache
                                    .store()
                                    .deactivate_vector_store(&info.store_id)
                                    .await;
                            }
                        }
                        bail!("vector store upload cancelled")
                    }
                    result = work => result,
                }
            }
        }
    }

    /// Bump the lease of the session's active store.
    pub async fn renew_lease(&self, session_id: &str) -> anyhow::Result<()> {
        if let Some(rec) = self
            .cache
            .store()
            .active_store_for_session(session_id)
            .await?
        {
            self.cache
                .store()
                .touch_vector_store(&rec.store_id, self.lease_expiry())
                .await?;
        }
        Ok(())
    }

    /// Replace a full store: create a successor seeded with `summary` as its
    /// first file, mark the old store inactive, and rebind the session.
    pub async fn summarize_and_rollover(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        summary: &str,
    ) -> anyhow::Result<StoreInfo> {
        let old = self.bound_store(project, tool, session_id).await?;
        if let Some(old) = &old {
            self.cache
                .store()
                .deactivate_vector_store(&old.store_id)
                .await?;
        }
        // Clear the stale binding so create_store binds fresh.
        self.cache
            .set_metadata(project, tool, session_id, META_VECTOR_STORE, json!(null))
            .await?;
        let info = self.create_store(project, tool, session_id).await?;

        let client = self.client(&info.provider)?;
        client
            .upload_batch(
                &info.store_id,
                &[VsFile::new(ROLLOVER_SUMMARY_PATH, summary)],
            )
            .await?;
        if let Some(mut rec) = self.cache.store().get_vector_store(&info.store_id).await? {
            rec.file_paths.push(ROLLOVER_SUMMARY_PATH.to_string());
            self.cache.store().upsert_vector_store(&rec).await?;
        }
        info!(session_id, old = ?old.map(|o| o.store_id), new = %info.store_id,
            "rolled over session vector store");
        Ok(info)
    }

    /// `true` when a store accumulated enough files to warrant rollover.
    pub async fn needs_rollover(&self, store_id: &str) -> anyhow::Result<bool> {
        Ok(self
            .cache
            .store()
            .get_vector_store(store_id)
            .await?
            .map(|r| r.file_paths.len() > self.cfg.rollover_threshold)
            .unwrap_or(false))
    }

    /// Search across several stores, merging hits by score.
    pub async fn search_stores(
        &self,
        store_ids: &[String],
        query: &str,
        max_results: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let mut hits = Vec::new();
        for store_id in store_ids {
            let provider = self.provider_for(store_id).await;
            let client = match self.client(&provider) {
                Ok(c) => c,
                Err(e) => {
                    warn!(store_id = %store_id, error = %e, "skipping store without client");
                    continue;
                }
            };
            match client.search(store_id, query, max_results).await {
                Ok(mut h) => hits.append(&mut h),
                Err(e) => warn!(store_id = %store_id, error = %e, "store search failed"),
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(max_results);
        Ok(hits)
    }

    /// Delete expired stores at the backend and mark their leases inactive.
    pub async fn reap_expired(&self) -> anyhow::Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let expired = self.cache.store().expired_vector_stores(now).await?;
        let mut reaped = 0;
        for rec in expired {
            if let Ok(client) = self.client(&rec.provider) {
                if let Err(e) = client.delete(&rec.store_id).await {
                    warn!(store_id = %rec.store_id, error = %e, "backend delete failed");
                }
            }
            self.cache
                .store()
                .deactivate_vector_store(&rec.store_id)
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use mux_store::SessionStore;

    use super::*;
    use crate::local::LocalVectorStore;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "{content}").unwrap();
        path.to_string_lossy().into_owned()
    }

    fn manager(tmp: &tempfile::TempDir) -> VectorStoreManager {
        let cache = SessionCache::new(SessionStore::open_in_memory(3600).unwrap());
        let cfg = VectorStoreConfig {
            provider: "local".into(),
            ..Default::default()
        };
        let mut m = VectorStoreManager::new(cache, cfg);
        m.register(Arc::new(
            LocalVectorStore::new(tmp.path().join("stores")).unwrap(),
        ));
        m
    }

    #[tokio::test]
    async fn get_or_create_is_stable_across_turns() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let a = m.get_or_create("p", "t", "s1").await.unwrap();
        let b = m.get_or_create("p", "t", "s1").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unknown_preferred_provider_falls_back_to_local() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = SessionCache::new(SessionStore::open_in_memory(3600).unwrap());
        let cfg = VectorStoreConfig {
            provider: "openai".into(), // not registered in this test
            ..Default::default()
        };
        let mut m = VectorStoreManager::new(cache, cfg);
        m.register(Arc::new(
            LocalVectorStore::new(tmp.path().join("stores")).unwrap(),
        ));
        let info = m.get_or_create("p", "t", "s1").await.unwrap();
        assert_eq!(info.provider, "local");
    }

    #[tokio::test]
    async fn add_files_skips_already_present_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let info = m.get_or_create("p", "t", "s1").await.unwrap();
        let paths: Vec<String> = (0..3)
            .map(|i| write_file(&tmp, &format!("f{i}.md"), "content"))
            .collect();

        let first = m.add_files(&info, &paths, &[]).await.unwrap();
        assert_eq!(first.uploaded.len(), 3);
        assert!(first.skipped.is_empty());

        // Dedup invariant: same paths again → uploaded=[], skipped=paths.
        let second = m.add_files(&info, &paths, &[]).await.unwrap();
        assert!(second.uploaded.is_empty());
        assert_eq!(second.skipped.len(), 3);
    }

    #[tokio::test]
    async fn add_files_honors_caller_supplied_already_present() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let info = m.get_or_create("p", "t", "s1").await.unwrap();
        let path = write_file(&tmp, "known.md", "x");
        let out = m
            .add_files(&info, std::slice::from_ref(&path), std::slice::from_ref(&path))
            .await
            .unwrap();
        assert!(out.uploaded.is_empty());
        assert_eq!(out.skipped, vec![path]);
    }

    #[tokio::test]
    async fn add_files_filters_unsupported_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let info = m.get_or_create("p", "t", "s1").await.unwrap();
        let good = write_file(&tmp, "ok.md", "x");
        let bad = write_file(&tmp, "blob.bin", "x");
        let out = m.add_files(&info, &[good, bad.clone()], &[]).await.unwrap();
        assert_eq!(out.uploaded.len(), 1);
        assert!(out.skipped.contains(&bad));
    }

    #[tokio::test]
    async fn rollover_creates_new_store_seeded_with_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let old = m.get_or_create("p", "t", "s1").await.unwrap();
        let new = m
            .summarize_and_rollover("p", "t", "s1", "What happened so far.")
            .await
            .unwrap();
        assert_ne!(old.store_id, new.store_id);
        // Old lease is inactive; the session now binds the new store.
        let bound = m.bound_store("p", "t", "s1").await.unwrap().unwrap();
        assert_eq!(bound.store_id, new.store_id);
        let hits = m
            .search_stores(&[new.store_id], "happened", 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "session_summary.md");
    }

    #[tokio::test]
    async fn cancelled_upload_deletes_fresh_store_binding() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let (tx, mut rx) = tokio::sync::oneshot::channel::<()>();
        drop(tx); // already cancelled on entry
        let paths = vec![write_file(&tmp, "f.md", "x")];
        let err = m
            .ensure_store_with_files("p", "t", "s1", &paths, &[], Some(&mut rx))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(m.bound_store("p", "t", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn renew_lease_extends_expiry() {
        let tmp = tempfile::tempdir().unwrap();
        let m = manager(&tmp);
        let info = m.get_or_create("p", "t", "s1").await.unwrap();
        let before = m
            .cache
            .store()
            .get_vector_store(&info.store_id)
            .await
            .unwrap()
            .unwrap()
            .ttl_expiry;
        m.cache
            .store()
            .touch_vector_store(&info.store_id, before - 1000)
            .await
            .unwrap();
        m.renew_lease("s1").await.unwrap();
        let after = m
            .cache
            .store()
            .get_vector_store(&info.store_id)
            .await
            .unwrap()
            .unwrap()
            .ttl_expiry;
        assert!(after >= before);
    }
}
