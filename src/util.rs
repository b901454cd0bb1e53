//! First-of-keys readers for unknown-shape venue rows.
//!
//! Venue payloads rename fields across endpoint versions; each reader walks
//! a preference list and returns the first usable value instead of failing.

use serde_json::Value;

pub fn value_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
}

pub fn first_f64(row: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| row.get(*key).and_then(value_f64))
}

pub fn first_i64(row: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| {
        row.get(*key).and_then(|value| {
            value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()))
        })
    })
}

pub fn first_str(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        row.get(*key).and_then(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    })
}

/// Epoch timestamp in seconds; values above 1e12 are milliseconds.
pub fn first_ts(row: &Value, keys: &[&str]) -> Option<f64> {
    first_f64(row, keys).map(|ts| if ts > 1e12 { ts / 1000.0 } else { ts })
}
