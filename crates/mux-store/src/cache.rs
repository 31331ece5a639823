// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{Session, SessionStore, StoreError};
use crate::turns::Turn;

/// Metadata key under which the OpenAI Responses API response id is stashed.
pub const META_PREVIOUS_RESPONSE_ID: &str = "previous_response_id";
/// Metadata key prefix for native CLI session ids (`cli_session_id.<cli>`).
const META_CLI_PREFIX: &str = "cli_session_id.";

/// Typed wrapper over [`SessionStore`] with a small read-through LRU.
///
/// Adapters go through this for history and for their provider-specific
/// metadata fragments; the cache keeps hot sessions out of SQLite on
/// multi-round tool loops.  Entries are invalidated on every save.
#[derive(Clone)]
pub struct SessionCache {
    store: SessionStore,
    hot: Arc<Mutex<LruCache<(String, String, String), Session>>>,
}

impl SessionCache {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            hot: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(64).unwrap_or(NonZeroUsize::MIN),
            ))),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Load a session, creating an empty in-memory one when absent.
    pub async fn load_or_new(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> Result<Session, StoreError> {
        let key = (
            project.to_string(),
            tool.to_string(),
            session_id.to_string(),
        );
        if let Some(hit) = self.hot.lock().await.get(&key) {
            return Ok(hit.clone());
        }
        let session = match self.store.load(project, tool, session_id).await? {
            Some(s) => s,
            None => Session::new(project, tool, session_id),
        };
        self.hot.lock().await.put(key, session.clone());
        Ok(session)
    }

    /// Persist the session and refresh the cached copy.
    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.store.save(session).await?;
        let key = (
            session.project.clone(),
            session.tool.clone(),
            session.session_id.clone(),
        );
        self.hot.lock().await.put(key, session.clone());
        Ok(())
    }

    pub async fn delete(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        self.store.delete_session(project, tool, session_id).await?;
        let key = (
            project.to_string(),
            tool.to_string(),
            session_id.to_string(),
        );
        self.hot.lock().await.pop(&key);
        Ok(())
    }

    /// Conversation history for a session; empty when absent.
    pub async fn history(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> Result<Vec<Turn>, StoreError> {
        Ok(self.load_or_new(project, tool, session_id).await?.history)
    }

    /// Replace a session's history wholesale and persist.
    pub async fn set_history(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        history: Vec<Turn>,
    ) -> Result<(), StoreError> {
        let mut session = self.load_or_new(project, tool, session_id).await?;
        session.history = history;
        self.save(&session).await
    }

    // ── Metadata fragments ────────────────────────────────────────────────────

    pub async fn get_metadata(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let session = self.load_or_new(project, tool, session_id).await?;
        Ok(session.metadata(key).cloned())
    }

    pub async fn set_metadata(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut session = self.load_or_new(project, tool, session_id).await?;
        debug!(session_id, key, "updating session metadata");
        session.set_metadata(key, value);
        self.save(&session).await
    }

    /// Native CLI session id for a given CLI name, if recorded.
    pub async fn cli_session_id(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        cli_name: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = format!("{META_CLI_PREFIX}{cli_name}");
        Ok(self
            .get_metadata(project, tool, session_id, &key)
            .await?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    pub async fn set_cli_session_id(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        cli_name: &str,
        cli_id: &str,
    ) -> Result<(), StoreError> {
        let key = format!("{META_CLI_PREFIX}{cli_name}");
        self.set_metadata(project, tool, session_id, &key, Value::String(cli_id.into()))
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
