//! Shared in-process store for WebSocket push data.
//!
//! WS handler tasks mutate it; the market-data view, OMS fill monitor, and
//! positions sync read it. Reads always copy, so no reader ever observes a
//! partially applied update.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use serde_json::Value;

/// Bound on retained private fill rows. The OMS dedup index makes repeated
/// polls over the same rows harmless.
const FILL_ROWS_CAP: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub inst_type: String,
    pub channel: String,
    pub inst_id: String,
}

#[derive(Debug, Clone, Default)]
struct BookEntry {
    bids: Vec<(f64, f64)>,
    asks: Vec<(f64, f64)>,
    ts_ms: Option<f64>,
}

/// A copied, sorted view of one book: bids descending, asks ascending.
#[derive(Debug, Clone, Default)]
pub struct SortedBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub ts_ms: Option<f64>,
}

impl SortedBook {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() || self.asks.is_empty()
    }
}

#[derive(Default)]
pub struct DataStore {
    books: RwLock<HashMap<BookKey, BookEntry>>,
    fills: RwLock<VecDeque<Value>>,
    positions: RwLock<Vec<Value>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────
    // Books
    // ─────────────────────────────────────────────────

    /// Apply one public book push. `action` is the venue's
    /// "snapshot"/"update"; an update with size 0 deletes the level.
    pub fn apply_book(&self, key: &BookKey, action: &str, rows: &[Value]) {
        let mut books = match self.books.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let entry = books.entry(key.clone()).or_default();
        let snapshot = action != "update";

        for row in rows {
            let bids = parse_levels(row.get("bids"));
            let asks = parse_levels(row.get("asks"));
            if snapshot {
                entry.bids = bids;
                entry.asks = asks;
            } else {
                merge_levels(&mut entry.bids, bids);
                merge_levels(&mut entry.asks, asks);
            }
            if let Some(ts) = row.get("ts").and_then(value_f64) {
                entry.ts_ms = Some(entry.ts_ms.map_or(ts, |prev| prev.max(ts)));
            }
        }
    }

    /// Sorted copy of the book for (inst_type, inst_id), optionally filtered
    /// by channel. Without a channel filter, rows from every channel that
    /// carried this instrument are merged. Returns `None` when nothing
    /// usable is stored under the query.
    pub fn sorted_book(
        &self,
        inst_type: &str,
        inst_id: &str,
        channel: Option<&str>,
    ) -> Option<SortedBook> {
        let books = self.books.read().ok()?;
        let mut out = SortedBook::default();
        for (key, entry) in books.iter() {
            if key.inst_type != inst_type || key.inst_id != inst_id {
                continue;
            }
            if let Some(channel) = channel {
                if key.channel != channel {
                    continue;
                }
            }
            out.bids.extend_from_slice(&entry.bids);
            out.asks.extend_from_slice(&entry.asks);
            if let Some(ts) = entry.ts_ms {
                out.ts_ms = Some(out.ts_ms.map_or(ts, |prev: f64| prev.max(ts)));
            }
        }
        if out.is_empty() {
            return None;
        }
        out.bids.sort_by(|a, b| b.0.total_cmp(&a.0));
        out.asks.sort_by(|a, b| a.0.total_cmp(&b.0));
        Some(out)
    }

    /// Wipe every stored book. Used by the channel-fallback protocol so
    /// rows from the abandoned channel cannot satisfy later reads.
    pub fn clear_books(&self) {
        if let Ok(mut books) = self.books.write() {
            books.clear();
        }
    }

    // ─────────────────────────────────────────────────
    // Private fills
    // ─────────────────────────────────────────────────

    pub fn push_fills(&self, rows: Vec<Value>) {
        if let Ok(mut fills) = self.fills.write() {
            for row in rows {
                fills.push_back(row);
            }
            while fills.len() > FILL_ROWS_CAP {
                fills.pop_front();
            }
        }
    }

    pub fn fills_snapshot(&self) -> Vec<Value> {
        self.fills
            .read()
            .map(|fills| fills.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────
    // Private positions
    // ─────────────────────────────────────────────────

    pub fn set_positions(&self, rows: Vec<Value>) {
        if let Ok(mut positions) = self.positions.write() {
            *positions = rows;
        }
    }

    pub fn positions_snapshot(&self) -> Vec<Value> {
        self.positions
            .read()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────
// Row parsing
// ─────────────────────────────────────────────────────────

fn value_f64(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse::<f64>().ok()))
}

/// Parse a `[["price","size"], ...]` side array; malformed levels are
/// skipped rather than failing the whole push.
fn parse_levels(side: Option<&Value>) -> Vec<(f64, f64)> {
    let mut out = Vec::new();
    let Some(levels) = side.and_then(|v| v.as_array()) else {
        return out;
    };
    for level in levels {
        let Some(parts) = level.as_array() else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        if let (Some(price), Some(size)) = (value_f64(&parts[0]), value_f64(&parts[1])) {
            out.push((price, size));
        }
    }
    out
}

fn merge_levels(existing: &mut Vec<(f64, f64)>, updates: Vec<(f64, f64)>) {
    for (price, size) in updates {
        existing.retain(|(px, _)| *px != price);
        if size > 0.0 {
            existing.push((price, size));
        }
    }
}
