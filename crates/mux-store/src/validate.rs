// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use crate::store::StoreError;

pub const MAX_SESSION_ID_LEN: usize = 128;

/// Reject pathological session ids before they reach the database.
///
/// Allowed: ASCII letters, digits, `_`, `-`, `.`; length 1..=128.
pub fn validate_session_id(session_id: &str) -> Result<(), StoreError> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(StoreError::InvalidSessionId(format!(
            "session_id must be 1..={MAX_SESSION_ID_LEN} characters, got {}",
            session_id.len()
        )));
    }
    if let Some(bad) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(StoreError::InvalidSessionId(format!(
            "session_id contains disallowed character {bad:?}"
        )));
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        for id in ["s1", "my-session_2.b", "A".repeat(128).as_str()] {
            assert!(validate_session_id(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_session_id("").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let id = "a".repeat(129);
        assert!(validate_session_id(&id).is_err());
    }

    #[test]
    fn rejects_disallowed_characters() {
        for id in ["a b", "a/b", "a;b", "über", "a\nb", "sess'--"] {
            assert!(validate_session_id(id).is_err(), "{id:?} should be invalid");
        }
    }
}
