//! Shared helpers for loosely-typed JSON and log-and-skip iteration.
//!
//! Generated content arrives as `serde_json::Value`; these helpers keep the
//! `v.get("key")?.as_str()` chains out of agent code.

use serde_json::Value;
use std::fmt::Display;

// =============================================================================
// JSON Value Extraction Helpers
// =============================================================================

/// Extract string from JSON value by key.
#[inline]
pub fn json_string(value: &Value, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(String::from)
}

/// Extract string with default value.
#[inline]
pub fn json_string_or(value: &Value, key: &str, default: &str) -> String {
    json_string(value, key).unwrap_or_else(|| default.to_string())
}

/// Extract string array from JSON value by key, skipping non-strings.
#[inline]
pub fn json_string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Short JSON-type name used in validation messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// String Utilities
// =============================================================================

/// Truncate to at most `max_chars` characters, appending an ellipsis.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

// =============================================================================
// Result Filtering
// =============================================================================

/// Convert a `Result` to an `Option`, logging the discarded error at warn level.
pub fn log_filter_warn<T, E: Display>(result: Result<T, E>, context: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("{}: {}", context, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_helpers() {
        let v = json!({"title": "Cells", "tags": ["a", 1, "b"]});
        assert_eq!(json_string(&v, "title").as_deref(), Some("Cells"));
        assert_eq!(json_string_or(&v, "missing", "x"), "x");
        assert_eq!(json_string_array(&v, "tags"), vec!["a", "b"]);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 5), "abcd…");
    }

    #[test]
    fn test_log_filter_warn() {
        let ok: Result<u8, String> = Ok(1);
        let err: Result<u8, String> = Err("bad".into());
        assert_eq!(log_filter_warn(ok, "ctx"), Some(1));
        assert_eq!(log_filter_warn(err, "ctx"), None);
    }
}
