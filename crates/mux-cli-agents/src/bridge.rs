// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use mux_store::{SessionCache, StoreError};

/// Maps unified session ids to native CLI session/thread ids.
///
/// The unified `session_id` is the only identifier the host ever sees;
/// native ids live in session metadata keyed by CLI name.  The first turn
/// of a session builds new-session args; once a native id is recorded,
/// subsequent turns resume.
#[derive(Clone)]
pub struct SessionBridge {
    cache: SessionCache,
}

impl SessionBridge {
    pub fn new(cache: SessionCache) -> Self {
        Self { cache }
    }

    pub async fn cli_session_id(
        &self,
        project: &str,
        tool: &str,
        unified_session_id: &str,
        cli_name: &str,
    ) -> Result<Option<String>, StoreError> {
        self.cache
            .cli_session_id(project, tool, unified_session_id, cli_name)
            .await
    }

    pub async fn store_cli_session_id(
        &self,
        project: &str,
        tool: &str,
        unified_session_id: &str,
        cli_name: &str,
        cli_id: &str,
    ) -> Result<(), StoreError> {
        self.cache
            .set_cli_session_id(project, tool, unified_session_id, cli_name, cli_id)
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use mux_store::SessionStore;

    use super::*;

    #[tokio::test]
    async fn round_trips_native_ids_per_cli() {
        let bridge = SessionBridge::new(SessionCache::new(
            SessionStore::open_in_memory(3600).unwrap(),
        ));
        assert!(bridge
            .cli_session_id("p", "work_with", "s1", "codex")
            .await
            .unwrap()
            .is_none());

        bridge
            .store_cli_session_id("p", "work_with", "s1", "codex", "thread-1")
            .await
            .unwrap();
        bridge
            .store_cli_session_id("p", "work_with", "s1", "claude", "cc-2")
            .await
            .unwrap();

        assert_eq!(
            bridge
                .cli_session_id("p", "work_with", "s1", "codex")
                .await
                .unwrap()
                .as_deref(),
            Some("thread-1")
        );
        assert_eq!(
            bridge
                .cli_session_id("p", "work_with", "s1", "claude")
                .await
                .unwrap()
                .as_deref(),
            Some("cc-2")
        );
    }
}
