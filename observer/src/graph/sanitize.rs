//! Masking and truncation for caller-supplied node data.
//!
//! Keys are compared after normalizing to snake_case, so `apiKey`,
//! `X-Api-Key` and `api_key` are treated alike.

use once_cell::sync::Lazy;
use regex::Regex;

/// Replacement for sensitive values.
pub const MASK: &str = "***";

/// Strings longer than this are cut to `MAX_VALUE_CHARS - 3` chars plus "...".
pub const MAX_VALUE_CHARS: usize = 100;

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(passw(or)?d|secret|credential|(^|_)api_?key(_|$)|(^|_)token(_|$)|(^|_)auth(orization)?(_|$)|(^|_)key(_|$))",
    )
    .expect("valid regex")
});

fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        match ch {
            '-' | '.' | ' ' => out.push('_'),
            _ => out.push(ch.to_ascii_lowercase()),
        }
    }
    out
}

pub fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEY.is_match(&normalize_key(key))
}

/// Cut `text` to at most `max_chars` characters, marking the cut with "...".
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// First `max_chars` characters of `text`, with "..." appended if anything
/// was left out.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Recursively mask sensitive keys and truncate long strings.
pub fn sanitize_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(sanitize_map(map)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize_value).collect())
        }
        serde_json::Value::String(text) => {
            serde_json::Value::String(truncate_chars(text, MAX_VALUE_CHARS))
        }
        other => other.clone(),
    }
}

pub fn sanitize_map(
    map: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.iter()
        .map(|(key, value)| {
            let clean = if is_sensitive_key(key) {
                serde_json::Value::String(MASK.to_string())
            } else {
                sanitize_value(value)
            };
            (key.clone(), clean)
        })
        .collect()
}
