// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt;

/// Error categories shared by every adapter, driving recovery decisions in
/// the executor and SDK-level retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 5xx or retryable server issue.
    TransientApi,
    /// 4xx malformed request; never retried.
    FatalClient,
    /// 429.
    RateLimit,
    /// Local deadline or upstream gateway timeout (504/524).
    Timeout,
    /// A server-side tool handler failed (returned to the model as text,
    /// normally never surfaced to the caller).
    ToolExecution,
    /// Structured output failed schema validation or response parsing.
    Parsing,
    /// 401/403.
    Authentication,
    /// Unknown or unsupported model.
    InvalidModel,
    /// Missing credentials or disabled provider.
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientApi => "TRANSIENT_API",
            Self::FatalClient => "FATAL_CLIENT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::ToolExecution => "TOOL_EXECUTION",
            Self::Parsing => "PARSING",
            Self::Authentication => "AUTHENTICATION",
            Self::InvalidModel => "INVALID_MODEL",
            Self::Configuration => "CONFIGURATION",
        }
    }
}

/// Common adapter error: category + short human message, optionally tagged
/// with the provider and the upstream HTTP status.
#[derive(Debug, Clone, thiserror::Error)]
pub struct AdapterError {
    pub category: ErrorCategory,
    pub message: String,
    pub status_code: u16,
    pub provider: Option<String>,
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(p) => write!(f, "[{p}] [{}] {}", self.category.as_str(), self.message),
            None => write!(f, "[{}] {}", self.category.as_str(), self.message),
        }
    }
}

impl AdapterError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            status_code: 0,
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = status;
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Parsing, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    pub fn invalid_model(model: &str, supported: &[String]) -> Self {
        Self::new(
            ErrorCategory::InvalidModel,
            format!(
                "Unsupported model: {model}. Supported models: {}",
                supported.join(", ")
            ),
        )
        .with_status(400)
    }

    /// Map an upstream HTTP status to the right category.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        let category = match status {
            401 | 403 => ErrorCategory::Authentication,
            429 => ErrorCategory::RateLimit,
            504 | 524 => ErrorCategory::Timeout,
            s if s >= 500 => ErrorCategory::TransientApi,
            s if s >= 400 => ErrorCategory::FatalClient,
            _ => ErrorCategory::TransientApi,
        };
        Self::new(category, message).with_status(status)
    }

    /// Translate transport failures: timeouts stay timeouts, everything else
    /// is a transient server issue.
    pub fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(ErrorCategory::Timeout, format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(ErrorCategory::TransientApi, format!("connection failed: {e}"))
        } else {
            Self::new(ErrorCategory::TransientApi, e.to_string())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
