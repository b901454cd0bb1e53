//! Market-data view: pure derivations over the shared store.

use crate::jsonl::now_s;
use crate::store::DataStore;
use crate::types::{Bbo, BookSnapshot, InstrumentKind};

/// Build a depth-limited snapshot for one instrument.
///
/// The channel-filtered query is preferred; when it comes back empty the
/// unfiltered query is retried and the snapshot is marked
/// `used_channel_filter = false` so the caller can surface the missing
/// filter support exactly once.
pub fn snapshot_from_store(
    store: &DataStore,
    kind: InstrumentKind,
    symbol: &str,
    levels: usize,
    channel: &str,
) -> Option<BookSnapshot> {
    let (book, used_channel_filter) =
        match store.sorted_book(kind.as_str(), symbol, Some(channel)) {
            Some(book) => (book, true),
            None => (store.sorted_book(kind.as_str(), symbol, None)?, false),
        };

    let mut bids = book.bids;
    let mut asks = book.asks;
    if bids.is_empty() || asks.is_empty() {
        return None;
    }
    if levels > 0 {
        bids.truncate(levels);
        asks.truncate(levels);
    }

    let ts = book.ts_ms.map(normalize_ts).unwrap_or_else(now_s);
    Some(BookSnapshot {
        bids,
        asks,
        ts,
        used_channel_filter,
    })
}

pub fn bbo_from_snapshot(snapshot: &BookSnapshot) -> Bbo {
    let (bid, bid_size) = snapshot.bids[0];
    let (ask, ask_size) = snapshot.asks[0];
    Bbo {
        bid,
        ask,
        bid_size,
        ask_size,
        ts: snapshot.ts,
    }
}

pub fn calc_mid(bbo: &Bbo) -> f64 {
    (bbo.bid + bbo.ask) / 2.0
}

/// Order-book imbalance over the snapshot depth, in [-1, 1].
pub fn calc_obi(snapshot: &BookSnapshot) -> f64 {
    let bid_qty: f64 = snapshot.bids.iter().map(|(_, size)| size).sum();
    let ask_qty: f64 = snapshot.asks.iter().map(|(_, size)| size).sum();
    let denom = bid_qty + ask_qty;
    if denom <= 0.0 {
        return 0.0;
    }
    (bid_qty - ask_qty) / denom
}

pub fn calc_microprice(bbo: &Bbo) -> f64 {
    let denom = bbo.bid_size + bbo.ask_size;
    if denom <= 0.0 {
        return calc_mid(bbo);
    }
    (bbo.ask * bbo.bid_size + bbo.bid * bbo.ask_size) / denom
}

/// Normalize epoch timestamps: values above 1e12 are milliseconds.
pub fn normalize_ts(ts: f64) -> f64 {
    if ts > 1e12 {
        ts / 1000.0
    } else {
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BookKey;
    use serde_json::json;

    fn seeded_store(channel: &str) -> DataStore {
        let store = DataStore::new();
        store.apply_book(
            &BookKey {
                inst_type: "USDT-FUTURES".to_string(),
                channel: channel.to_string(),
                inst_id: "ETHUSDT".to_string(),
            },
            "snapshot",
            &[json!({
                "bids": [["2000.0", "3.0"], ["1999.5", "1.0"]],
                "asks": [["2000.5", "1.0"], ["2001.0", "2.0"]],
                "ts": "1700000000000"
            })],
        );
        store
    }

    fn snap(store: &DataStore, channel: &str) -> Option<BookSnapshot> {
        snapshot_from_store(store, InstrumentKind::PerpUsdt, "ETHUSDT", 5, channel)
    }

    #[test]
    fn test_snapshot_orders_and_normalizes_ts() {
        let store = seeded_store("books");
        let snapshot = snap(&store, "books").unwrap();
        assert!(snapshot.used_channel_filter);
        assert_eq!(snapshot.bids[0].0, 2000.0);
        assert_eq!(snapshot.asks[0].0, 2000.5);
        assert!((snapshot.ts - 1_700_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_channel_fallback_is_flagged() {
        let store = seeded_store("books5");
        let snapshot = snap(&store, "books").unwrap();
        assert!(!snapshot.used_channel_filter);
    }

    #[test]
    fn test_missing_book_is_none() {
        let store = DataStore::new();
        assert!(snap(&store, "books").is_none());
    }

    #[test]
    fn test_obi_sign_and_bounds() {
        let store = seeded_store("books");
        let snapshot = snap(&store, "books").unwrap();
        // bid qty 4.0 vs ask qty 3.0 -> positive imbalance
        let obi = calc_obi(&snapshot);
        assert!(obi > 0.0 && obi <= 1.0);
        assert!((obi - (4.0 - 3.0) / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_mid_and_microprice() {
        let store = seeded_store("books");
        let snapshot = snap(&store, "books").unwrap();
        let bbo = bbo_from_snapshot(&snapshot);
        assert!((calc_mid(&bbo) - 2000.25).abs() < 1e-9);
        // microprice leans toward the heavier side's opposite quote
        let micro = calc_microprice(&bbo);
        assert!((micro - (2000.5 * 3.0 + 2000.0 * 1.0) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_depth_truncation() {
        let store = seeded_store("books");
        let snapshot =
            snapshot_from_store(&store, InstrumentKind::PerpUsdt, "ETHUSDT", 1, "books").unwrap();
        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.asks.len(), 1);
    }
}
