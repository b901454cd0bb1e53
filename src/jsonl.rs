//! Append-only JSONL event sinks.
//!
//! Every record carries the same required field set so downstream log
//! validation never sees a missing key. Records are flushed line by line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

pub const REQUIRED_FIELDS: [&str; 11] = [
    "ts",
    "event",
    "intent",
    "source",
    "mode",
    "reason",
    "leg",
    "cycle_id",
    "data",
    "res",
    "simulated",
];

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn now_s() -> f64 {
    now_ms() as f64 / 1000.0
}

/// Coerce `data`/`res` into objects so a stray scalar can't break strict
/// consumers.
fn coerce_object(value: Value) -> Value {
    match value {
        Value::Null => json!({}),
        Value::Object(_) => value,
        other => json!({ "value": other }),
    }
}

fn ensure_required(record: Value) -> Map<String, Value> {
    let mut map = match record {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    map.entry("ts").or_insert_with(|| json!(now_ms()));
    map.entry("event").or_insert_with(|| json!("unknown"));
    map.entry("intent").or_insert_with(|| json!("unknown"));
    map.entry("source").or_insert_with(|| json!("unknown"));
    map.entry("mode").or_insert_with(|| json!("UNKNOWN"));
    map.entry("reason").or_insert_with(|| json!("unknown"));
    map.entry("leg").or_insert_with(|| json!("unknown"));
    map.entry("cycle_id").or_insert_with(|| json!("-"));
    map.entry("simulated").or_insert_with(|| json!(false));

    let data = map.remove("data").unwrap_or(Value::Null);
    map.insert("data".to_string(), coerce_object(data));
    let res = map.remove("res").unwrap_or(Value::Null);
    map.insert("res".to_string(), coerce_object(res));

    map
}

#[derive(Clone)]
pub struct JsonlLogger {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl JsonlLogger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating log dir {}", dir.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log sink {}", path.display()))?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, defaulting any missing required field.
    /// Sink errors are reported to stderr, never propagated: losing a log
    /// line must not take the trading loop down.
    pub fn log(&self, record: Value) {
        let map = ensure_required(record);
        let line = Value::Object(map).to_string();
        if let Ok(mut file) = self.file.lock() {
            if let Err(err) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                eprintln!("jsonl sink write failed ({}): {err}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_required_fields_are_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlLogger::open(dir.path().join("system.jsonl")).unwrap();
        sink.log(json!({ "event": "start" }));

        let lines = read_lines(sink.path());
        assert_eq!(lines.len(), 1);
        for key in REQUIRED_FIELDS {
            assert!(lines[0].get(key).is_some(), "missing {key}");
        }
        assert_eq!(lines[0]["event"], "start");
        assert_eq!(lines[0]["intent"], "unknown");
        assert_eq!(lines[0]["cycle_id"], "-");
        assert_eq!(lines[0]["simulated"], false);
        assert!(lines[0]["data"].is_object());
    }

    #[test]
    fn test_scalar_data_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlLogger::open(dir.path().join("orders.jsonl")).unwrap();
        sink.log(json!({ "event": "x", "data": 7, "res": null }));

        let lines = read_lines(sink.path());
        assert_eq!(lines[0]["data"], json!({ "value": 7 }));
        assert_eq!(lines[0]["res"], json!({}));
    }

    #[test]
    fn test_appends_across_clones() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlLogger::open(dir.path().join("fills.jsonl")).unwrap();
        let clone = sink.clone();
        sink.log(json!({ "event": "a" }));
        clone.log(json!({ "event": "b" }));
        let lines = read_lines(sink.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["event"], "b");
    }
}
