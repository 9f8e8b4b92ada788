//! Shared utility functions used across multiple modules.

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Replace every JSON string equal to `from` inside `value`, recursively.
///
/// Returns whether anything changed.
pub fn replace_json_string(value: &mut serde_json::Value, from: &str, to: &str) -> bool {
    use serde_json::Value;

    match value {
        Value::String(text) if text == from => {
            *text = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| replace_json_string(item, from, to) | changed),
        Value::Object(object) => object
            .values_mut()
            .fold(false, |changed, item| replace_json_string(item, from, to) | changed),
        _ => false,
    }
}
