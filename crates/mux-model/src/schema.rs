// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured-output schema handling.
//!
//! Providers accept slightly different JSON-Schema dialects; this module
//! holds the shared massaging, extraction, and validation pieces.

use serde_json::Value;

use crate::error::AdapterError;

/// Prepare a caller schema for the OpenAI structured-output endpoint:
/// every `object` subschema gets `additionalProperties: false` and, when
/// missing, a `required` array listing all declared properties.
///
/// Recurses through `properties.*`, `items`, and `anyOf`/`allOf`/`oneOf`.
/// Idempotent: applying it twice equals applying it once.
pub fn massage_schema_for_openai(node: &mut Value) {
    let Some(obj) = node.as_object_mut() else { return };

    if obj.get("type").and_then(Value::as_str) == Some("object") {
        if !obj.contains_key("additionalProperties") {
            obj.insert("additionalProperties".into(), Value::Bool(false));
        }
        if obj.contains_key("properties") && !obj.contains_key("required") {
            let keys: Vec<Value> = obj["properties"]
                .as_object()
                .map(|p| p.keys().cloned().map(Value::String).collect())
                .unwrap_or_default();
            obj.insert("required".into(), Value::Array(keys));
        }
    }

    if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
        for sub in props.values_mut() {
            massage_schema_for_openai(sub);
        }
    }
    if let Some(items) = obj.get_mut("items") {
        massage_schema_for_openai(items);
    }
    for key in ["anyOf", "allOf", "oneOf"] {
        if let Some(subs) = obj.get_mut(key).and_then(Value::as_array_mut) {
            for sub in subs {
                massage_schema_for_openai(sub);
            }
        }
    }
}

/// Extract clean JSON from model output that may be fenced or surrounded by
/// prose.  Returns the JSON substring, or an error when nothing parses.
pub fn extract_json(content: &str) -> Result<String, AdapterError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(AdapterError::parsing("empty content"));
    }

    // Best case: already clean JSON.
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return Ok(trimmed.to_string());
    }

    // Fenced code block, with or without a language tag.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let candidate = body[..end].trim();
            if serde_json::from_str::<Value>(candidate).is_ok() {
                return Ok(candidate.to_string());
            }
        }
    }

    // First balanced object or array in the text.
    if let Some(candidate) = first_balanced_json(trimmed) {
        if serde_json::from_str::<Value>(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let preview: String = trimmed.chars().take(200).collect();
    Err(AdapterError::parsing(format!(
        "could not extract valid JSON from content: {preview}…"
    )))
}

/// Scan for the first `{…}` or `[…]` with balanced brackets, string-aware.
fn first_balanced_json(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => depth += 1,
            b'}' | b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Validate a value against the restricted schema subset providers enforce:
/// `type`, `required`, `properties`, `items`, `enum`, `minItems`, `maxItems`.
///
/// Deliberately not a full JSON-Schema implementation — the subset matches
/// what the providers themselves enforce during constrained generation.
pub fn validate_against_schema(value: &Value, schema: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        let ok = match expected.to_ascii_lowercase().as_str() {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !ok {
            return Err(format!("expected type {expected}, got {value}"));
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("value {value} not in enum"));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return Err(format!("missing required property {key:?}"));
                }
            }
        }
        if let Some(props) = schema_obj.get("properties").and_then(Value::as_object) {
            for (key, sub) in props {
                if let Some(v) = obj.get(key) {
                    validate_against_schema(v, sub)
                        .map_err(|e| format!("property {key:?}: {e}"))?;
                }
            }
        }
    }

    if let Some(arr) = value.as_array() {
        if let Some(min) = schema_obj.get("minItems").and_then(Value::as_u64) {
            if (arr.len() as u64) < min {
                return Err(format!("array has {} items, minItems {min}", arr.len()));
            }
        }
        if let Some(max) = schema_obj.get("maxItems").and_then(Value::as_u64) {
            if (arr.len() as u64) > max {
                return Err(format!("array has {} items, maxItems {max}", arr.len()));
            }
        }
        if let Some(items) = schema_obj.get("items") {
            for (i, v) in arr.iter().enumerate() {
                validate_against_schema(v, items).map_err(|e| format!("item {i}: {e}"))?;
            }
        }
    }

    Ok(())
}

/// Validate structured output end-to-end: extract the JSON payload, parse
/// it, check it against the caller's schema, and return the clean JSON.
pub fn validate_structured_output(
    content: &str,
    schema: &Value,
) -> Result<String, AdapterError> {
    let clean = extract_json(content)?;
    let parsed: Value = serde_json::from_str(&clean)
        .map_err(|e| AdapterError::parsing(format!("structured output is not JSON: {e}")))?;
    validate_against_schema(&parsed, schema)
        .map_err(|e| AdapterError::parsing(format!("structured output validation failed: {e}")))?;
    Ok(clean)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn massage_adds_additional_properties_and_required() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "age": { "type": "integer" }
            }
        });
        massage_schema_for_openai(&mut schema);
        assert_eq!(schema["additionalProperties"], json!(false));
        let req = schema["required"].as_array().unwrap();
        assert_eq!(req.len(), 2);
    }

    #[test]
    fn massage_recurses_into_items_and_any_of() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "list": {
                    "type": "array",
                    "items": { "type": "object", "properties": { "x": { "type": "string" } } }
                },
                "choice": {
                    "anyOf": [
                        { "type": "object", "properties": { "a": { "type": "string" } } },
                        { "type": "string" }
                    ]
                }
            }
        });
        massage_schema_for_openai(&mut schema);
        assert_eq!(
            schema["properties"]["list"]["items"]["additionalProperties"],
            json!(false)
        );
        assert_eq!(
            schema["properties"]["choice"]["anyOf"][0]["additionalProperties"],
            json!(false)
        );
    }

    #[test]
    fn massage_is_idempotent() {
        let mut once = json!({
            "type": "object",
            "properties": { "a": { "type": "object", "properties": {} } }
        });
        massage_schema_for_openai(&mut once);
        let mut twice = once.clone();
        massage_schema_for_openai(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn massage_preserves_existing_required() {
        let mut schema = json!({
            "type": "object",
            "properties": { "a": {}, "b": {} },
            "required": ["a"]
        });
        massage_schema_for_openai(&mut schema);
        assert_eq!(schema["required"], json!(["a"]));
    }

    #[test]
    fn extract_passes_clean_json_through() {
        assert_eq!(extract_json(r#"{"a":1}"#).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn extract_unwraps_fenced_block() {
        let content = "Here you go:\n```json\n{\"a\": 1}\n```\nEnjoy.";
        assert_eq!(extract_json(content).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn extract_finds_embedded_object() {
        let content = "The result is {\"ok\": true} as requested.";
        assert_eq!(extract_json(content).unwrap(), "{\"ok\": true}");
    }

    #[test]
    fn extract_handles_braces_inside_strings() {
        let content = r#"prefix {"text": "a } inside"} suffix"#;
        assert_eq!(extract_json(content).unwrap(), r#"{"text": "a } inside"}"#);
    }

    #[test]
    fn extract_rejects_non_json() {
        assert!(extract_json("no json here").is_err());
        assert!(extract_json("").is_err());
    }

    #[test]
    fn validation_accepts_conforming_value() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
            }
        });
        let out = validate_structured_output(
            r#"{"name": "x", "tags": ["a"]}"#,
            &schema,
        );
        assert!(out.is_ok());
    }

    #[test]
    fn validation_rejects_missing_required() {
        let schema = json!({ "type": "object", "required": ["name"] });
        let err = validate_structured_output("{}", &schema).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn validation_rejects_wrong_type_and_enum() {
        let schema = json!({ "type": "object", "properties": { "n": { "type": "integer" } } });
        assert!(validate_structured_output(r#"{"n": "not a number"}"#, &schema).is_err());

        let schema = json!({ "type": "string", "enum": ["a", "b"] });
        assert!(validate_structured_output(r#""c""#, &schema).is_err());
        assert!(validate_structured_output(r#""a""#, &schema).is_ok());
    }

    #[test]
    fn validation_accepts_uppercase_types() {
        // Gemini-converted schemas canonicalize type to uppercase.
        let schema = json!({ "type": "OBJECT", "required": ["x"] });
        assert!(validate_structured_output(r#"{"x": 1}"#, &schema).is_ok());
    }
}
