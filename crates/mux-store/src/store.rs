// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::turns::Turn;
use crate::validate::validate_session_id;

/// Storage-layer error taxonomy.
///
/// `InvalidSessionId` is raised before any database work; `Storage` wraps
/// per-call SQLite failures so the caller can fail the request instead of
/// silently losing history.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("transient storage failure: {0}")]
    Storage(String),
    #[error("session serialization failure: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// One durable conversation transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub project: String,
    pub tool: String,
    pub session_id: String,
    /// Seconds since epoch; stamped on every save.
    pub updated_at: i64,
    pub history: Vec<Turn>,
    /// Opaque per-provider state: `previous_response_id`, native CLI session
    /// ids, vector-store info.  Keys are provider-chosen strings.
    pub provider_metadata: Map<String, Value>,
}

impl Session {
    pub fn new(
        project: impl Into<String>,
        tool: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            tool: tool.into(),
            session_id: session_id.into(),
            updated_at: 0,
            history: Vec::new(),
            provider_metadata: Map::new(),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.provider_metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.provider_metadata.insert(key.into(), value);
    }
}

/// Row returned by [`SessionStore::list_by_project`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionListing {
    pub tool: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Lease-tracking row for one vector store.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStoreRecord {
    pub store_id: String,
    pub provider: String,
    pub session_id: String,
    pub file_paths: Vec<String>,
    pub ttl_expiry: i64,
    pub active: bool,
}

/// Durable transcript cache keyed by `(project, tool, session_id)`.
///
/// All statements run on the blocking pool behind one mutex-guarded
/// connection, so concurrent callers are safe and no task holds the writer
/// across an await point.  Opening the database is fatal on failure; per-call
/// failures surface as [`StoreError::Storage`].
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    ttl_seconds: i64,
    cleanup_probability: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS unified_sessions(
    project            TEXT NOT NULL,
    tool               TEXT NOT NULL,
    session_id         TEXT NOT NULL,
    updated_at         INTEGER NOT NULL,
    history            TEXT NOT NULL,
    provider_metadata  TEXT NOT NULL,
    PRIMARY KEY (project, tool, session_id)
);
CREATE TABLE IF NOT EXISTS session_summaries(
    project            TEXT NOT NULL,
    tool               TEXT NOT NULL,
    session_id         TEXT NOT NULL,
    summary            TEXT NOT NULL,
    PRIMARY KEY (project, tool, session_id)
);
CREATE TABLE IF NOT EXISTS vector_stores(
    store_id           TEXT PRIMARY KEY,
    provider           TEXT NOT NULL,
    session_id         TEXT NOT NULL,
    file_paths         TEXT NOT NULL,
    ttl_expiry         INTEGER NOT NULL,
    active             INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_sessions_updated
    ON unified_sessions(project, updated_at DESC);
";

impl SessionStore {
    /// Open (or create) the session database.  Fatal on failure.
    pub fn open(
        path: &Path,
        ttl_seconds: u64,
        cleanup_probability: f64,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, ttl_seconds, cleanup_probability)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(ttl_seconds: u64) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, ttl_seconds, 0.0)
    }

    fn init(
        conn: Connection,
        ttl_seconds: u64,
        cleanup_probability: f64,
    ) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_seconds: ttl_seconds as i64,
            cleanup_probability,
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Run `f` with the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Storage(format!("storage task failed: {e}")))?
    }

    /// Load a session.  Returns `None` when absent or expired; an expired
    /// row is deleted on the way out.
    pub async fn load(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> Result<Option<Session>, StoreError> {
        validate_session_id(session_id)?;
        let (project, tool, session_id) =
            (project.to_string(), tool.to_string(), session_id.to_string());
        let ttl = self.ttl_seconds;
        self.with_conn(move |conn| {
            let row: Option<(i64, String, String)> = conn
                .query_row(
                    "SELECT updated_at, history, provider_metadata
                     FROM unified_sessions
                     WHERE project = ?1 AND tool = ?2 AND session_id = ?3",
                    params![project, tool, session_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;

            let (updated_at, history_json, metadata_json) = match row {
                Some(r) => r,
                None => return Ok(None),
            };

            if Self::now() - updated_at >= ttl {
                conn.execute(
                    "DELETE FROM unified_sessions
                     WHERE project = ?1 AND tool = ?2 AND session_id = ?3",
                    params![project, tool, session_id],
                )?;
                return Ok(None);
            }

            let history: Vec<Turn> = serde_json::from_str(&history_json)?;
            let provider_metadata: Map<String, Value> = serde_json::from_str(&metadata_json)?;
            Ok(Some(Session {
                project,
                tool,
                session_id,
                updated_at,
                history,
                provider_metadata,
            }))
        })
        .await
    }

    /// REPLACE the session row by composite key and stamp `updated_at = now`.
    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        validate_session_id(&session.session_id)?;
        let history_json = serde_json::to_string(&session.history)?;
        let metadata_json = serde_json::to_string(&session.provider_metadata)?;
        let (project, tool, session_id) = (
            session.project.clone(),
            session.tool.clone(),
            session.session_id.clone(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "REPLACE INTO unified_sessions
                 (project, tool, session_id, updated_at, history, provider_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![project, tool, session_id, Self::now(), history_json, metadata_json],
            )?;
            Ok(())
        })
        .await?;
        self.maybe_reap();
        Ok(())
    }

    pub async fn delete_session(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        let (project, tool, session_id) =
            (project.to_string(), tool.to_string(), session_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM unified_sessions
                 WHERE project = ?1 AND tool = ?2 AND session_id = ?3",
                params![project, tool, session_id],
            )?;
            conn.execute(
                "DELETE FROM session_summaries
                 WHERE project = ?1 AND tool = ?2 AND session_id = ?3",
                params![project, tool, session_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_summary(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
        summary: &str,
    ) -> Result<(), StoreError> {
        validate_session_id(session_id)?;
        let (project, tool, session_id, summary) = (
            project.to_string(),
            tool.to_string(),
            session_id.to_string(),
            summary.to_string(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "REPLACE INTO session_summaries (project, tool, session_id, summary)
                 VALUES (?1, ?2, ?3, ?4)",
                params![project, tool, session_id, summary],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_summary(
        &self,
        project: &str,
        tool: &str,
        session_id: &str,
    ) -> Result<Option<String>, StoreError> {
        validate_session_id(session_id)?;
        let (project, tool, session_id) =
            (project.to_string(), tool.to_string(), session_id.to_string());
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT summary FROM session_summaries
                     WHERE project = ?1 AND tool = ?2 AND session_id = ?3",
                    params![project, tool, session_id],
                    |r| r.get(0),
                )
                .optional()?)
        })
        .await
    }

    /// Sessions for one project, most recently updated first.  `search`
    /// filters by substring on the session id or tool name.
    pub async fn list_by_project(
        &self,
        project: &str,
        search: Option<&str>,
        limit: usize,
        include_summary: bool,
    ) -> Result<Vec<SessionListing>, StoreError> {
        let project = project.to_string();
        let like = search.map(|s| format!("%{s}%"));
        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT s.tool, s.session_id, ss.summary
                 FROM unified_sessions s
                 LEFT JOIN session_summaries ss
                   ON s.project = ss.project AND s.tool = ss.tool
                  AND s.session_id = ss.session_id
                 WHERE s.project = ?1",
            );
            if like.is_some() {
                sql.push_str(" AND (s.session_id LIKE ?2 OR s.tool LIKE ?2)");
                sql.push_str(" ORDER BY s.updated_at DESC LIMIT ?3");
            } else {
                sql.push_str(" ORDER BY s.updated_at DESC LIMIT ?2");
            }

            let mut stmt = conn.prepare(&sql)?;
            let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<SessionListing> {
                Ok(SessionListing {
                    tool: r.get(0)?,
                    session_id: r.get(1)?,
                    summary: r.get::<_, Option<String>>(2)?,
                })
            };
            let rows = match &like {
                Some(pat) => stmt
                    .query_map(params![project, pat, limit as i64], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map(params![project, limit as i64], map_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            let rows = rows
                .into_iter()
                .map(|mut l| {
                    if !include_summary {
                        l.summary = None;
                    }
                    l
                })
                .collect();
            Ok(rows)
        })
        .await
    }

    /// Find the `(project, tool)` owning a session id, searching across
    /// projects.  Used by `describe_session` which only receives the id.
    pub async fn find_session(
        &self,
        session_id: &str,
    ) -> Result<Option<(String, String)>, StoreError> {
        validate_session_id(session_id)?;
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT project, tool FROM unified_sessions
                     WHERE session_id = ?1 LIMIT 1",
                    params![session_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?)
        })
        .await
    }

    /// Delete sessions and summaries older than the TTL.  Returns the number
    /// of session rows removed.
    pub async fn run_reaper(&self) -> Result<u64, StoreError> {
        let cutoff = Self::now() - self.ttl_seconds;
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM unified_sessions WHERE updated_at < ?1",
                params![cutoff],
            )?;
            conn.execute(
                "DELETE FROM session_summaries
                 WHERE NOT EXISTS (
                     SELECT 1 FROM unified_sessions s
                     WHERE s.project = session_summaries.project
                       AND s.tool = session_summaries.tool
                       AND s.session_id = session_summaries.session_id)",
                [],
            )?;
            Ok(n as u64)
        })
        .await
    }

    /// With probability `cleanup_probability`, sweep expired rows in the
    /// background.  Amortizes reaping cost across writes.
    fn maybe_reap(&self) {
        if self.cleanup_probability <= 0.0 {
            return;
        }
        if rand::random::<f64>() >= self.cleanup_probability {
            return;
        }
        let store = self.clone();
        tokio::spawn(async move {
            match store.run_reaper().await {
                Ok(n) if n > 0 => debug!(removed = n, "session reaper swept expired rows"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "session reaper failed"),
            }
        });
    }

    // ── Vector store lease tracking ───────────────────────────────────────────

    pub async fn upsert_vector_store(
        &self,
        record: &VectorStoreRecord,
    ) -> Result<(), StoreError> {
        let r = record.clone();
        let paths_json = serde_json::to_string(&r.file_paths)?;
        self.with_conn(move |conn| {
            conn.execute(
                "REPLACE INTO vector_stores
                 (store_id, provider, session_id, file_paths, ttl_expiry, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![r.store_id, r.provider, r.session_id, paths_json, r.ttl_expiry, r.active],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_vector_store(
        &self,
        store_id: &str,
    ) -> Result<Option<VectorStoreRecord>, StoreError> {
        let store_id = store_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT store_id, provider, session_id, file_paths, ttl_expiry, active
                     FROM vector_stores WHERE store_id = ?1",
                    params![store_id],
                    Self::map_store_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Active store for a session, if any.
    pub async fn active_store_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<VectorStoreRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT store_id, provider, session_id, file_paths, ttl_expiry, active
                     FROM vector_stores
                     WHERE session_id = ?1 AND active = 1
                     ORDER BY ttl_expiry DESC LIMIT 1",
                    params![session_id],
                    Self::map_store_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    /// Extend a store's lease.
    pub async fn touch_vector_store(
        &self,
        store_id: &str,
        new_expiry: i64,
    ) -> Result<(), StoreError> {
        let store_id = store_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE vector_stores SET ttl_expiry = ?2 WHERE store_id = ?1",
                params![store_id, new_expiry],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn deactivate_vector_store(&self, store_id: &str) -> Result<(), StoreError> {
        let store_id = store_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE vector_stores SET active = 0 WHERE store_id = ?1",
                params![store_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Stores whose lease expired before `now` and are still active.
    pub async fn expired_vector_stores(
        &self,
        now: i64,
    ) -> Result<Vec<VectorStoreRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT store_id, provider, session_id, file_paths, ttl_expiry, active
                 FROM vector_stores WHERE active = 1 AND ttl_expiry < ?1",
            )?;
            let rows = stmt
                .query_map(params![now], Self::map_store_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    fn map_store_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<VectorStoreRecord> {
        let paths_json: String = r.get(3)?;
        Ok(VectorStoreRecord {
            store_id: r.get(0)?,
            provider: r.get(1)?,
            session_id: r.get(2)?,
            file_paths: serde_json::from_str(&paths_json).unwrap_or_default(),
            ttl_expiry: r.get(4)?,
            active: r.get::<_, i64>(5)? != 0,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
