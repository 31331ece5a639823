// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use crate::executor::ExecError;

/// Parameter names accepted by chat and CLI-agent tools.
///
/// Anything outside this list is rejected before any work happens, so typos
/// fail loudly instead of being silently ignored.
const KNOWN_PARAMS: &[&str] = &[
    "instructions",
    "output_format",
    "context",
    "priority_context",
    "session_id",
    "role",
    "temperature",
    "reasoning_effort",
    "max_reasoning_tokens",
    "search_mode",
    "structured_output_schema",
    "vector_store_ids",
    "disable_memory_search",
    "return_debug",
    "model",
    "cli",
    "extra_flags",
    "limit",
    "search",
    "include_summary",
    "summarization_model",
    "extra_instructions",
];

/// Validated flat parameter map for one tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolParams {
    pub instructions: String,
    pub output_format: String,
    pub context: Vec<String>,
    pub priority_context: Vec<String>,
    pub session_id: String,
    pub role: Option<String>,
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<String>,
    pub max_reasoning_tokens: Option<i64>,
    pub search_mode: Option<String>,
    pub structured_output_schema: Option<Value>,
    pub vector_store_ids: Vec<String>,
    pub disable_memory_search: bool,
    pub return_debug: bool,
    /// `work_with` only: target model or CLI name.
    pub model: Option<String>,
    pub cli: Option<String>,
    pub extra_flags: Option<String>,
    /// `list_sessions` / `describe_session` extras.
    pub limit: Option<usize>,
    pub search: Option<String>,
    pub include_summary: bool,
    pub summarization_model: Option<String>,
    pub extra_instructions: Option<String>,
}

fn type_error(name: &str, expected: &str) -> ExecError {
    ExecError::InvalidParams(format!("parameter {name:?} must be {expected}"))
}

fn string_field(obj: &serde_json::Map<String, Value>, name: &str) -> Result<Option<String>, ExecError> {
    match obj.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(type_error(name, "a string")),
    }
}

fn string_list_field(
    obj: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Vec<String>, ExecError> {
    match obj.get(name) {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| type_error(name, "a list of strings"))
            })
            .collect(),
        Some(_) => Err(type_error(name, "a list of strings")),
    }
}

fn bool_field(obj: &serde_json::Map<String, Value>, name: &str) -> Result<bool, ExecError> {
    match obj.get(name) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(type_error(name, "a boolean")),
    }
}

impl ToolParams {
    /// Validate a caller-supplied flat parameter map.
    ///
    /// Unknown keys are rejected; types are enforced; `session_id` and
    /// `instructions` presence is checked by the executor per blueprint
    /// kind (local services need neither).
    pub fn parse(params: &Value) -> Result<Self, ExecError> {
        let obj = params
            .as_object()
            .ok_or_else(|| ExecError::InvalidParams("parameters must be an object".into()))?;

        for key in obj.keys() {
            if !KNOWN_PARAMS.contains(&key.as_str()) {
                return Err(ExecError::InvalidParams(format!("unknown parameter {key:?}")));
            }
        }

        let temperature = match obj.get("temperature") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| type_error("temperature", "a number"))?,
            ),
        };
        let max_reasoning_tokens = match obj.get("max_reasoning_tokens") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_i64()
                    .ok_or_else(|| type_error("max_reasoning_tokens", "an integer"))?,
            ),
        };
        let limit = match obj.get("limit") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| type_error("limit", "an integer"))?,
            ),
        };
        let structured_output_schema = match obj.get("structured_output_schema") {
            None | Some(Value::Null) => None,
            Some(v @ Value::Object(_)) => Some(v.clone()),
            Some(_) => return Err(type_error("structured_output_schema", "an object")),
        };

        Ok(Self {
            instructions: string_field(obj, "instructions")?.unwrap_or_default(),
            output_format: string_field(obj, "output_format")?.unwrap_or_default(),
            context: string_list_field(obj, "context")?,
            priority_context: string_list_field(obj, "priority_context")?,
            session_id: string_field(obj, "session_id")?.unwrap_or_default(),
            role: string_field(obj, "role")?,
            temperature,
            reasoning_effort: string_field(obj, "reasoning_effort")?,
            max_reasoning_tokens,
            search_mode: string_field(obj, "search_mode")?,
            structured_output_schema,
            vector_store_ids: string_list_field(obj, "vector_store_ids")?,
            disable_memory_search: bool_field(obj, "disable_memory_search")?,
            return_debug: bool_field(obj, "return_debug")?,
            model: string_field(obj, "model")?,
            cli: string_field(obj, "cli")?,
            extra_flags: string_field(obj, "extra_flags")?,
            limit,
            search: string_field(obj, "search")?,
            include_summary: bool_field(obj, "include_summary")?,
            summarization_model: string_field(obj, "summarization_model")?,
            extra_instructions: string_field(obj, "extra_instructions")?,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_typical_chat_params() {
        let p = ToolParams::parse(&json!({
            "instructions": "Say hi",
            "output_format": "text",
            "context": ["/src"],
            "priority_context": [],
            "session_id": "s1",
            "temperature": 0.5,
        }))
        .unwrap();
        assert_eq!(p.instructions, "Say hi");
        assert_eq!(p.context, vec!["/src"]);
        assert_eq!(p.temperature, Some(0.5));
        assert!(!p.disable_memory_search);
    }

    #[test]
    fn rejects_unknown_parameter() {
        let err = ToolParams::parse(&json!({ "instrucshuns": "typo" })).unwrap_err();
        assert!(err.to_string().contains("instrucshuns"));
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(ToolParams::parse(&json!({ "instructions": 42 })).is_err());
        assert!(ToolParams::parse(&json!({ "context": "not-a-list" })).is_err());
        assert!(ToolParams::parse(&json!({ "context": [1, 2] })).is_err());
        assert!(ToolParams::parse(&json!({ "disable_memory_search": "yes" })).is_err());
        assert!(ToolParams::parse(&json!({ "structured_output_schema": "str" })).is_err());
        assert!(ToolParams::parse(&json!("not an object")).is_err());
    }

    #[test]
    fn null_values_read_as_absent() {
        let p = ToolParams::parse(&json!({ "temperature": null, "role": null })).unwrap();
        assert!(p.temperature.is_none());
        assert!(p.role.is_none());
    }
}
