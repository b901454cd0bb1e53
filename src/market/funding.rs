//! Funding-rate cache: periodic REST polling with a tolerant parser.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use crate::exchange::gateway::Gateway;
use crate::jsonl::{now_s, JsonlLogger};
use crate::market::book::normalize_ts;
use crate::types::FundingInfo;
use crate::util::first_f64;

pub struct FundingCache {
    gateway: Arc<Gateway>,
    log: JsonlLogger,
    poll_sec: f64,
    last: Mutex<Option<FundingInfo>>,
}

impl FundingCache {
    pub fn new(gateway: Arc<Gateway>, log: JsonlLogger, poll_sec: f64) -> Self {
        Self {
            gateway,
            log,
            poll_sec,
            last: Mutex::new(None),
        }
    }

    /// Last successfully parsed funding observation. `None` until the first
    /// successful poll.
    pub fn last(&self) -> Option<FundingInfo> {
        self.last.lock().ok().and_then(|guard| *guard)
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(err) = self.update_once().await {
                self.log.log(json!({
                    "event": "funding_error",
                    "intent": "SYSTEM",
                    "source": "rest",
                    "mode": "RUN",
                    "reason": "funding_poll_failed",
                    "leg": "perp",
                    "data": { "error": err.to_string() },
                }));
            }
            tokio::time::sleep(Duration::from_secs_f64(self.poll_sec)).await;
        }
    }

    /// One poll. A fetch or parse failure keeps the previous value.
    pub async fn update_once(&self) -> Result<()> {
        let payload = self.gateway.fetch_funding().await?;
        let info = parse_funding(&payload)?;
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(info);
        }
        self.log.log(json!({
            "event": "funding",
            "intent": "SYSTEM",
            "source": "rest",
            "mode": "RUN",
            "reason": "funding_poll",
            "leg": "perp",
            "data": {
                "funding_rate": info.funding_rate,
                "next_update_time": info.next_update_time,
                "interval_sec": info.interval_sec,
            },
        }));
        Ok(())
    }
}

/// Parse the venue's funding payload. `data` may be a single row or a list;
/// field names vary by endpoint version, so each value is read first-of-keys.
pub fn parse_funding(payload: &Value) -> Result<FundingInfo> {
    let data = payload.get("data").unwrap_or(&Value::Null);
    let row = match data {
        Value::Array(rows) => rows.first(),
        Value::Object(_) => Some(data),
        _ => None,
    };
    let row = row.ok_or_else(|| anyhow::anyhow!("funding payload has no data row"))?;

    let rate = first_f64(row, &["fundingRate", "funding_rate", "rate"])
        .ok_or_else(|| anyhow::anyhow!("funding payload has no rate"))?;
    let next_update_time = first_f64(row, &["nextUpdateTime", "nextSettleTime", "fundingTime"])
        .map(normalize_ts);
    let interval_sec = first_f64(row, &["fundingInterval", "intervalSec", "interval"]);

    Ok(FundingInfo {
        funding_rate: rate,
        next_update_time,
        interval_sec,
        ts: now_s(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_shape() {
        let payload = json!({
            "code": "00000",
            "data": [{ "symbol": "ETHUSDT", "fundingRate": "0.0001", "nextUpdateTime": "1700000000000" }]
        });
        let info = parse_funding(&payload).unwrap();
        assert!((info.funding_rate - 0.0001).abs() < 1e-12);
        assert!((info.next_update_time.unwrap() - 1_700_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_object_shape_with_alt_keys() {
        let payload = json!({
            "data": { "rate": -0.00005, "intervalSec": 28800 }
        });
        let info = parse_funding(&payload).unwrap();
        assert!((info.funding_rate + 0.00005).abs() < 1e-12);
        assert_eq!(info.interval_sec, Some(28800.0));
        assert!(info.next_update_time.is_none());
    }

    #[test]
    fn test_parse_failure_shapes() {
        assert!(parse_funding(&json!({ "data": [] })).is_err());
        assert!(parse_funding(&json!({ "data": [{ "symbol": "ETHUSDT" }] })).is_err());
        assert!(parse_funding(&json!({ "code": "00000" })).is_err());
    }
}
