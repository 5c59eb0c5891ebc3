//! Payload redaction applied before persistence.
//!
//! Works on the free-form map representation at the wire boundary; typed
//! payloads inside the core are serialized first, so redaction sees every
//! nested field regardless of origin.

use serde_json::Value;

/// Sentinel written in place of a redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Key substrings that mark a field as sensitive, matched case-insensitively.
const SENSITIVE_KEYS: &[&str] = &[
    "auth",
    "token",
    "password",
    "passwd",
    "secret",
    "api_key",
    "apikey",
    "private_key",
    "access_key",
    "session_key",
    "credential",
];

/// Value prefixes that mark a string as sensitive regardless of its key:
/// common cloud/API key shapes and database connection URLs.
const SENSITIVE_VALUE_PREFIXES: &[&str] = &[
    "sk-",
    "ghp_",
    "gho_",
    "github_pat_",
    "xoxb-",
    "xoxp-",
    "AKIA",
    "AIza",
    "Bearer ",
    "postgres://",
    "postgresql://",
    "mysql://",
    "mongodb://",
    "redis://",
    "amqp://",
];

fn key_is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|p| lower.contains(p))
}

fn value_is_sensitive(value: &str) -> bool {
    SENSITIVE_VALUE_PREFIXES.iter().any(|p| value.starts_with(p))
}

/// Recursively replace sensitive fields with [`REDACTED`].
///
/// Objects are scanned by key; arrays and nested objects are descended
/// into; bare strings are checked against the value-prefix list.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key_is_sensitive(key) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact_value(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        Value::String(s) => {
            if value_is_sensitive(s) {
                *value = Value::String(REDACTED.to_string());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let mut payload = json!({
            "task": "deploy",
            "api_key": "sk-abc123",
            "nested": { "db_password": "hunter2", "note": "fine" },
            "list": [{ "auth_header": "Basic xyz" }],
        });
        redact_value(&mut payload);

        assert_eq!(payload["api_key"], REDACTED);
        assert_eq!(payload["nested"]["db_password"], REDACTED);
        assert_eq!(payload["nested"]["note"], "fine");
        assert_eq!(payload["list"][0]["auth_header"], REDACTED);
        assert_eq!(payload["task"], "deploy");
    }

    #[test]
    fn redacts_key_shaped_values_under_innocent_keys() {
        let mut payload = json!({
            "connection": "postgres://user:pw@db/prod",
            "note": "sk-live-key-in-a-comment",
            "count": 3,
        });
        redact_value(&mut payload);

        assert_eq!(payload["connection"], REDACTED);
        assert_eq!(payload["note"], REDACTED);
        assert_eq!(payload["count"], 3);
    }
}
