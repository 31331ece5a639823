// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

/// Extensions accepted by the remote vector-store backend.
///
/// Anything else is filtered out before upload and reported back to the
/// caller as skipped.
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "c", "cpp", "css", "csv", "doc", "docx", "go", "html", "java", "js", "json", "md",
    "pdf", "php", "pptx", "py", "rb", "rs", "sh", "tex", "toml", "ts", "txt", "xml",
    "yaml", "yml",
];

/// `true` when the path carries a supported extension.  Files without an
/// extension are unsupported.
pub fn is_supported_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Partition paths into (supported, skipped).
pub fn split_supported<S: AsRef<str>>(paths: &[S]) -> (Vec<String>, Vec<String>) {
    let mut supported = Vec::new();
    let mut skipped = Vec::new();
    for p in paths {
        let p = p.as_ref();
        if is_supported_path(p) {
            supported.push(p.to_string());
        } else {
            skipped.push(p.to_string());
        }
    }
    (supported, skipped)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
