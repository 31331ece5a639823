// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::client::{BatchCounts, VectorStoreClient, VsFile};

/// Single-batch threshold: at or below this count the upload goes out as one
/// batch; above it the file set is spread across parallel batches.
const SINGLE_BATCH_MAX: usize = 20;
/// Backoff base for per-batch retries (2s, 4s, 8s…).
const BACKOFF_BASE_SECS: u64 = 2;
/// Upper bound on the sub-batch split factor during retries.
const MAX_SPLIT: usize = 4;

/// Outcome of a full upload pipeline run.
///
/// Partial success is NOT failure — the caller is told how many files made
/// it and whether the retry budget ran out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchUploadReport {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub retry_attempts: u32,
    pub exhausted_retries: bool,
}

impl BatchUploadReport {
    fn absorb(&mut self, other: BatchUploadReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.total += other.total;
        self.retry_attempts = self.retry_attempts.max(other.retry_attempts);
        self.exhausted_retries |= other.exhausted_retries;
    }
}

/// Upload `files` into `store_id` with the standard batching policy:
///
/// 1. ≤ 20 files → one batch (with retry).
/// 2. Else split into `parallel_batches` batches and gather.
/// 3. A batch reporting any failed files is retried with exponential backoff
///    up to `max_retries` attempts; from the second retry on, the failed set
///    is split into `min(attempt + 1, 4)` sub-batches uploaded in parallel.
pub async fn upload_files(
    client: &dyn VectorStoreClient,
    store_id: &str,
    files: Vec<VsFile>,
    parallel_batches: usize,
    max_retries: u32,
) -> BatchUploadReport {
    if files.is_empty() {
        return BatchUploadReport::default();
    }

    if files.len() <= SINGLE_BATCH_MAX {
        return upload_batch_with_retry(client, store_id, files, 1, max_retries).await;
    }

    let batches = split_into_batches(files, parallel_batches);
    debug!(
        store_id,
        batches = batches.len(),
        "parallel batch upload"
    );
    let tasks = batches
        .into_iter()
        .enumerate()
        .map(|(i, batch)| upload_batch_with_retry(client, store_id, batch, i + 1, max_retries));
    let results = join_all(tasks).await;

    let mut report = BatchUploadReport::default();
    for r in results {
        report.absorb(r);
    }
    info!(
        store_id,
        completed = report.completed,
        failed = report.failed,
        total = report.total,
        "batch upload finished"
    );
    report
}

/// Split `files` into at most `parallel` batches of roughly equal size.
fn split_into_batches(files: Vec<VsFile>, parallel: usize) -> Vec<Vec<VsFile>> {
    let parallel = parallel.max(1);
    let batch_size = (files.len() / parallel).max(1);
    let mut batches: Vec<Vec<VsFile>> = files
        .chunks(batch_size)
        .map(|c| c.to_vec())
        .collect();
    // Remainder chunks fold into the last batch so the bound holds.
    while batches.len() > parallel {
        let tail = batches.pop().unwrap_or_default();
        if let Some(last) = batches.last_mut() {
            last.extend(tail);
        }
    }
    batches
}

/// Retry loop for one batch.  The backend reports aggregate counts but not
/// per-file identity on partial failure, so every retry re-sends the whole
/// remaining set; exponentially splitting it is the least-waste recovery.
async fn upload_batch_with_retry(
    client: &dyn VectorStoreClient,
    store_id: &str,
    files: Vec<VsFile>,
    batch_num: usize,
    max_retries: u32,
) -> BatchUploadReport {
    let total = files.len();
    let mut current = files;
    let mut completed_total = 0usize;

    for attempt in 0..max_retries {
        if attempt > 0 {
            let wait = BACKOFF_BASE_SECS.saturating_pow(attempt);
            debug!(batch_num, attempt, wait, "retrying batch after backoff");
            tokio::time::sleep(Duration::from_secs(wait)).await;
        }

        if attempt == 0 || current.len() <= 3 {
            match client.upload_batch(store_id, &current).await {
                Ok(counts) if counts.failed == 0 => {
                    return BatchUploadReport {
                        completed: completed_total + counts.completed,
                        failed: 0,
                        total,
                        retry_attempts: attempt + 1,
                        exhausted_retries: false,
                    };
                }
                Ok(counts) => {
                    completed_total += counts.completed;
                    warn!(
                        batch_num,
                        completed = counts.completed,
                        failed = counts.failed,
                        "partial batch failure, will retry whole batch"
                    );
                    // No per-file identity: the whole current set goes again.
                }
                Err(e) => {
                    warn!(batch_num, attempt, error = %e, "batch upload attempt failed");
                }
            }
        } else {
            // Split the failing set and upload sub-batches in parallel.
            let split = (attempt as usize + 1).min(MAX_SPLIT);
            let chunk = (current.len() / split).max(1);
            let subs: Vec<Vec<VsFile>> = current.chunks(chunk).map(|c| c.to_vec()).collect();
            debug!(batch_num, subs = subs.len(), "splitting failed batch for retry");

            let results = join_all(
                subs.iter()
                    .map(|s| client.upload_batch(store_id, s)),
            )
            .await;

            let mut still_failing: Vec<VsFile> = Vec::new();
            for (sub, result) in subs.into_iter().zip(results) {
                match result {
                    Ok(BatchCounts { failed: 0, completed, .. }) => {
                        completed_total += completed;
                    }
                    Ok(counts) => {
                        completed_total += counts.completed;
                        still_failing.extend(sub);
                    }
                    Err(e) => {
                        warn!(batch_num, error = %e, "sub-batch failed");
                        still_failing.extend(sub);
                    }
                }
            }

            if still_failing.is_empty() {
                return BatchUploadReport {
                    completed: completed_total,
                    failed: 0,
                    total,
                    retry_attempts: attempt + 1,
                    exhausted_retries: false,
                };
            }
            current = still_failing;
        }
    }

    BatchUploadReport {
        completed: completed_total,
        failed: current.len(),
        total,
        retry_attempts: max_retries,
        exhausted_retries: true,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
