use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

const REDACT_PATTERNS: [&str; 10] = [
    r"Bearer\s+[A-Za-z0-9\-._~+/]+=*",
    r"sk-[A-Za-z0-9]{20,}",
    r#"(?i)token[=:]\s*["']?[A-Za-z0-9\-._~+/]{16,}["']?"#,
    r#"(?i)api[_-]?key[=:]\s*["']?[A-Za-z0-9\-._~+/]{16,}["']?"#,
    r#"(?i)secret[=:]\s*["']?[A-Za-z0-9\-._~+/]{16,}["']?"#,
    r#"/home/[^\s"',;)}\]]+"#,
    r#"/Users/[^\s"',;)}\]]+"#,
    r#"[A-Z]:\\[^\s"',;)}\]]+"#,
    r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
    r"\.env(?:\.[a-zA-Z]+)?",
];

fn patterns() -> &'static [Regex] {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        REDACT_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect()
    })
}

/// Applies every redaction pattern in order.
pub fn redact_string(text: &str) -> String {
    patterns().iter().fold(text.to_string(), |acc, pattern| {
        pattern.replace_all(&acc, REDACTED).into_owned()
    })
}

/// Deep copy with every string value redacted. Object keys are kept.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(redact_string(text)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_payload).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), sanitize_payload(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}
