//! Bounding and cleaning of tool output before it re-enters model context or a
//! durable trace.

use serde_json::Value;

const ELLIPSIS: &str = "...";

/// Truncate `text` to at most `limit` characters, appending `...` when cut.
///
/// Counts `char`s, never splits a code point. A `limit` smaller than the
/// ellipsis yields a hard cut without a suffix.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    if limit <= ELLIPSIS.len() {
        return text.chars().take(limit).collect();
    }
    let mut out: String = text.chars().take(limit - ELLIPSIS.len()).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Decode bytes as UTF-8 (lossy) and strip NUL and other non-printing control
/// characters except newline and tab.
pub fn sanitize_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}

/// Prepare tool output for the next model turn.
pub fn observation(bytes: &[u8], limit: usize) -> String {
    truncate_chars(&sanitize_text(bytes), limit)
}

/// Recursively cap every string in a JSON value at `limit` characters.
pub fn sanitize_json(value: &Value, limit: usize) -> Value {
    match value {
        Value::String(text) => Value::String(truncate_chars(text, limit)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| sanitize_json(v, limit)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, v)| (key.clone(), sanitize_json(v, limit)))
                .collect(),
        ),
        other => other.clone(),
    }
}
