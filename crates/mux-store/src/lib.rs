// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable session persistence for the routing core.
//!
//! One embedded SQLite database per process holds every conversation
//! transcript, keyed by `(project, tool, session_id)`, plus session summaries
//! and vector-store lease rows.  Writes are serialized through a single
//! connection; reads go through the same connection but never hold it across
//! an await point.

mod cache;
mod store;
mod turns;
mod validate;

pub use cache::{SessionCache, META_PREVIOUS_RESPONSE_ID};
pub use store::{
    Session, SessionListing, SessionStore, StoreError, VectorStoreRecord,
};
pub use turns::{ToolInvocation, Turn};
pub use validate::validate_session_id;
