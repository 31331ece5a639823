// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Local services: tools dispatched directly by the executor, without a
//! provider call.  `describe_session` is the exception that proves the
//! rule — it recurses through the executor to run a summarizer model.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::executor::{ExecError, Executor};
use crate::params::ToolParams;

const DEFAULT_LIST_LIMIT: usize = 5;

/// `list_sessions`: recent sessions for the current project, newest first.
pub(crate) async fn list_sessions(
    executor: &Executor,
    params: &ToolParams,
) -> Result<Value, ExecError> {
    let project = executor.config().project_name();
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let listings = executor
        .cache()
        .store()
        .list_by_project(
            &project,
            params.search.as_deref(),
            limit,
            params.include_summary,
        )
        .await?;
    debug!(project, count = listings.len(), "listed sessions");
    Ok(serde_json::to_value(listings).unwrap_or_else(|_| json!([])))
}

/// `describe_session`: cached summary when available, otherwise summarize
/// through the configured summarizer model on a temporary copy of the
/// session (so the original transcript is never mutated), cache the result,
/// and clean the copy up.
pub(crate) async fn describe_session(
    executor: &Executor,
    params: &ToolParams,
) -> Result<Value, ExecError> {
    if params.session_id.is_empty() {
        return Err(ExecError::InvalidParams("session_id is required".into()));
    }

    let summarizer_tool = params
        .summarization_model
        .clone()
        .unwrap_or_else(|| executor.config().executor.default_summarization_model.clone());
    if summarizer_tool == "describe_session" {
        return Err(ExecError::InvalidParams(
            "recursive summarization is not allowed".into(),
        ));
    }

    let Some((project, tool)) = executor
        .cache()
        .store()
        .find_session(&params.session_id)
        .await?
    else {
        return Err(ExecError::InvalidParams(format!(
            "session {:?} not found",
            params.session_id
        )));
    };

    if let Some(cached) = executor
        .cache()
        .store()
        .get_summary(&project, &tool, &params.session_id)
        .await?
    {
        debug!(session_id = %params.session_id, "returning cached summary");
        return Ok(json!(cached));
    }

    let original = executor
        .cache()
        .store()
        .load(&project, &tool, &params.session_id)
        .await?
        .ok_or_else(|| {
            ExecError::InvalidParams(format!("session {:?} expired", params.session_id))
        })?;

    // Work on a duplicate so the summarizer's own turns never land in the
    // transcript being described.
    let temp_session_id = format!(
        "temp-summary-{}-{}",
        params.session_id,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let mut temp = original.clone();
    temp.tool = summarizer_tool.clone();
    temp.session_id = temp_session_id.clone();
    // The copy must not inherit provider threading state; the summarizer
    // starts a fresh server-side conversation over the replayed turns.
    temp.provider_metadata.clear();
    executor.cache().save(&temp).await?;

    let mut instructions = "Summarize this conversation.".to_string();
    if let Some(extra) = &params.extra_instructions {
        instructions.push(' ');
        instructions.push_str(extra);
    }

    let result = Box::pin(executor.execute(
        &summarizer_tool,
        &json!({
            "session_id": temp_session_id,
            "instructions": instructions,
            "output_format": "A concise summary of the conversation",
        }),
    ))
    .await;

    // The temp copy goes away on every path.
    let cleanup = executor
        .cache()
        .delete(&project, &summarizer_tool, &temp_session_id)
        .await;
    if let Err(e) = cleanup {
        tracing::warn!(error = %e, "failed to delete temporary summary session");
    }

    let summary = result?["content"].as_str().unwrap_or_default().to_string();
    executor
        .cache()
        .store()
        .set_summary(&project, &tool, &params.session_id, &summary)
        .await?;
    info!(session_id = %params.session_id, "cached new session summary");
    Ok(json!(summary))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
