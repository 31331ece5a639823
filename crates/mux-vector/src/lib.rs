// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Vector-store lifecycle for overflow file content.
//!
//! Files that do not fit the inline prompt budget are uploaded into a
//! searchable store — a remote provider when available, an in-process index
//! otherwise — and exposed to models through the `search_task_files` tool.

mod batch;
mod client;
mod filter;
mod local;
mod manager;
mod openai;

pub use batch::{upload_files, BatchUploadReport};
pub use client::{BatchCounts, SearchHit, VectorStoreClient, VsFile};
pub use filter::{is_supported_path, split_supported};
pub use local::LocalVectorStore;
pub use manager::{AddFilesOutcome, StoreInfo, VectorStoreManager};
pub use openai::OpenAiVectorStore;

/// Cancellation signal: callers drop or fire the sender half to abort.
pub type CancelReceiver = tokio::sync::oneshot::Receiver<()>;
