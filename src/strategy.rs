//! Funding market-making strategy: one deterministic decision per cycle.
//!
//! Gather market data, run the risk gates, compute the reservation quote
//! pair, drive the OMS, and record a `tick` decision row.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::config::AppConfig;
use crate::exchange::gateway::Gateway;
use crate::jsonl::{now_s, JsonlLogger};
use crate::market::book;
use crate::market::funding::FundingCache;
use crate::oms::Oms;
use crate::risk::RiskGuards;
use crate::store::DataStore;
use crate::types::{Bbo, BookSnapshot, InstrumentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyState {
    Stopped,
    Quoting,
    Hedging,
    Flattening,
    Cooldown,
    Halted,
}

impl StrategyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyState::Stopped => "STOPPED",
            StrategyState::Quoting => "QUOTING",
            StrategyState::Hedging => "HEDGING",
            StrategyState::Flattening => "FLATTENING",
            StrategyState::Cooldown => "COOLDOWN",
            StrategyState::Halted => "HALTED",
        }
    }
}

/// Everything one decision row can carry; gates that stop early leave the
/// unknown fields empty.
#[derive(Debug, Clone, Copy, Default)]
struct DecisionRow {
    funding_rate: Option<f64>,
    basis: Option<f64>,
    obi_spot: Option<f64>,
    obi_perp: Option<f64>,
    mid_spot: Option<f64>,
    mid_perp: Option<f64>,
    target_q: Option<f64>,
    edge: Option<f64>,
    unhedged_notional: Option<f64>,
    unhedged_qty: Option<f64>,
    pos_spot: Option<f64>,
    pos_perp: Option<f64>,
}

pub struct MmFundingStrategy {
    config: Arc<AppConfig>,
    funding: Arc<FundingCache>,
    oms: Arc<tokio::sync::Mutex<Oms>>,
    risk: Arc<Mutex<RiskGuards>>,
    gateway: Arc<Gateway>,
    store: Arc<DataStore>,
    decision_log: JsonlLogger,
    state: StrategyState,
    cycle_id: u64,
    /// One-shot latch so the post-halt cleanup runs on a single cycle.
    halt_handled: bool,
}

impl MmFundingStrategy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AppConfig>,
        funding: Arc<FundingCache>,
        oms: Arc<tokio::sync::Mutex<Oms>>,
        risk: Arc<Mutex<RiskGuards>>,
        gateway: Arc<Gateway>,
        store: Arc<DataStore>,
        decision_log: JsonlLogger,
    ) -> Self {
        Self {
            config,
            funding,
            oms,
            risk,
            gateway,
            store,
            decision_log,
            state: StrategyState::Stopped,
            cycle_id: 0,
            halt_handled: false,
        }
    }

    pub async fn run(mut self) {
        let interval = Duration::from_millis(self.config.strategy.quote_refresh_ms);
        loop {
            self.step().await;
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn step(&mut self) {
        self.cycle_id += 1;
        let now = now_s();
        let channel = self.gateway.public_book_channel();

        if self.risk.lock().map(|risk| risk.is_halted()).unwrap_or(false) {
            self.state = StrategyState::Halted;
            if !self.halt_handled {
                self.halt_handled = true;
                let mut oms = self.oms.lock().await;
                oms.cancel_all("halted").await;
                oms.abort_open_tickets("halted");
            }
            self.log_decision(now, &channel, DecisionRow::default(), "halted");
            return;
        }

        let spot_snapshot = self.snapshot(InstrumentKind::Spot, &channel);
        let perp_snapshot = self.snapshot(InstrumentKind::PerpUsdt, &channel);
        let spot_bbo = spot_snapshot.as_ref().map(book::bbo_from_snapshot);
        let perp_bbo = perp_snapshot.as_ref().map(book::bbo_from_snapshot);

        // Ticket deadlines keep advancing regardless of the quote gates.
        {
            let mut oms = self.oms.lock().await;
            oms.process_hedge_tickets(now, spot_bbo.as_ref(), self.cycle_id)
                .await;
        }

        let mut row = DecisionRow {
            funding_rate: None,
            basis: None,
            obi_spot: spot_snapshot.as_ref().map(book::calc_obi),
            obi_perp: perp_snapshot.as_ref().map(book::calc_obi),
            mid_spot: spot_bbo.as_ref().map(book::calc_mid),
            mid_perp: perp_bbo.as_ref().map(book::calc_mid),
            ..DecisionRow::default()
        };

        let (Some(spot_snapshot), Some(perp_snapshot)) = (&spot_snapshot, &perp_snapshot) else {
            self.stop_cycle(now, &channel, row, "no_book", StrategyState::Stopped)
                .await;
            return;
        };
        let (Some(spot_bbo), Some(perp_bbo)) = (spot_bbo, perp_bbo) else {
            return; // unreachable: snapshots imply BBOs
        };

        let stale = self
            .risk
            .lock()
            .map(|risk| {
                risk.stale(Some(spot_snapshot.ts), now) || risk.stale(Some(perp_snapshot.ts), now)
            })
            .unwrap_or(true);
        if stale {
            self.decision_log.log(json!({
                "event": "risk",
                "intent": "SYSTEM",
                "source": "risk",
                "mode": self.state.as_str(),
                "reason": "stale_book",
                "leg": "books",
                "cycle_id": self.cycle_id,
                "data": { "spot_ts": spot_snapshot.ts, "perp_ts": perp_snapshot.ts },
            }));
            self.stop_cycle(now, &channel, row, "stale", StrategyState::Stopped)
                .await;
            return;
        }

        let in_cooldown = self
            .risk
            .lock()
            .map(|risk| risk.in_cooldown(now))
            .unwrap_or(false);
        if in_cooldown {
            self.stop_cycle(now, &channel, row, "cooldown", StrategyState::Cooldown)
                .await;
            return;
        }

        let funding = self.funding.last().filter(|info| {
            self.config.risk.funding_stale_sec <= 0.0
                || (now - info.ts) <= self.config.risk.funding_stale_sec
        });
        let Some(funding) = funding else {
            self.stop_cycle(now, &channel, row, "no_funding", StrategyState::Stopped)
                .await;
            return;
        };
        row.funding_rate = Some(funding.funding_rate);

        let mid_spot = book::calc_mid(&spot_bbo);
        let mid_perp = book::calc_mid(&perp_bbo);
        row.basis = Some(mid_perp - mid_spot);

        let (positions, unhedged_qty, unhedged_since) = {
            let oms = self.oms.lock().await;
            (oms.positions(), oms.unhedged_qty(), oms.unhedged_since())
        };
        let delta = positions.delta();
        row.pos_spot = Some(positions.spot_pos);
        row.pos_perp = Some(positions.perp_pos);
        row.unhedged_qty = Some(unhedged_qty);

        let target_q = self.config.strategy.target_notional / mid_perp;
        let target_perp = -target_q;
        row.target_q = Some(target_q);
        let unhedged_notional = unhedged_qty.abs() * mid_spot;
        row.unhedged_notional = Some(unhedged_notional);

        let max_position = self.config.risk.max_position_notional;
        if max_position > 0.0
            && (positions.spot_pos.abs() * mid_spot > max_position
                || positions.perp_pos.abs() * mid_perp > max_position)
        {
            self.decision_log.log(json!({
                "event": "risk",
                "intent": "FLATTEN",
                "source": "risk",
                "mode": "FLATTENING",
                "reason": "max_position",
                "leg": "both",
                "cycle_id": self.cycle_id,
                "data": {
                    "spot_notional": positions.spot_pos.abs() * mid_spot,
                    "perp_notional": positions.perp_pos.abs() * mid_perp,
                    "max": max_position,
                },
            }));
            self.flatten_cycle(now, &channel, row, "max_position", &spot_bbo)
                .await;
            return;
        }

        if self.config.strategy.enable_only_positive_funding
            && funding.funding_rate < self.config.strategy.min_funding_rate
        {
            self.stop_cycle(now, &channel, row, "funding_off", StrategyState::Stopped)
                .await;
            return;
        }

        let edge = expected_edge(&self.config, funding.funding_rate);
        row.edge = Some(edge);
        if edge <= 0.0 {
            self.stop_cycle(now, &channel, row, "edge_negative", StrategyState::Stopped)
                .await;
            return;
        }

        let unhedged_breach = self
            .risk
            .lock()
            .map(|risk| risk.unhedged_exceeded(unhedged_notional, unhedged_since, now))
            .unwrap_or(false);
        if unhedged_breach {
            self.decision_log.log(json!({
                "event": "risk",
                "intent": "FLATTEN",
                "source": "risk",
                "mode": "FLATTENING",
                "reason": "unhedged_timeout",
                "leg": "both",
                "cycle_id": self.cycle_id,
                "data": {
                    "unhedged_notional": unhedged_notional,
                    "unhedged_since": unhedged_since,
                    "max_notional": self.config.risk.max_unhedged_notional,
                    "max_sec": self.config.risk.max_unhedged_sec,
                },
            }));
            self.flatten_cycle(now, &channel, row, "flatten", &spot_bbo).await;
            return;
        }

        // ── Quote computation ──
        let obi_perp = row.obi_perp.unwrap_or(0.0);
        let alpha_px = mid_perp * (self.config.strategy.alpha_obi_bps / 1e4) * obi_perp;
        let inv_ratio = if target_q != 0.0 {
            (positions.perp_pos - target_perp) / target_q
        } else {
            0.0
        };
        let gamma_px = mid_perp * (self.config.strategy.gamma_inventory_bps / 1e4) * inv_ratio;
        let reservation = mid_perp + alpha_px - gamma_px;

        let mut half_bps = self.config.strategy.base_half_spread_bps;
        if unhedged_qty.abs() > 0.0 || delta.abs() > self.config.strategy.delta_tolerance {
            half_bps *= 2.0;
            self.state = StrategyState::Hedging;
        } else {
            self.state = StrategyState::Quoting;
        }

        let bid_px = reservation * (1.0 - half_bps / 1e4);
        let ask_px = reservation * (1.0 + half_bps / 1e4);

        let base_size = target_q.max(0.0);
        let mut bid_size = base_size;
        let mut ask_size = base_size;
        if positions.perp_pos > target_perp {
            ask_size *= 1.2; // accelerate the unwind upward
        } else if positions.perp_pos < target_perp {
            bid_size *= 1.2;
        }

        debug!(
            cycle = self.cycle_id,
            reservation, bid_px, ask_px, obi_perp, inv_ratio, "quote computed"
        );
        {
            let mut oms = self.oms.lock().await;
            oms.update_quotes(bid_px, ask_px, bid_size, ask_size, self.cycle_id, "quote")
                .await;
        }
        self.log_decision(now, &channel, row, "quote");
    }

    fn snapshot(&self, kind: InstrumentKind, channel: &str) -> Option<BookSnapshot> {
        let symbol = match kind {
            InstrumentKind::Spot => &self.config.symbols.spot.symbol,
            InstrumentKind::PerpUsdt => &self.config.symbols.perp.symbol,
        };
        let snapshot = book::snapshot_from_store(
            &self.store,
            kind,
            symbol,
            self.config.strategy.obi_levels,
            channel,
        )?;
        if !snapshot.used_channel_filter {
            self.gateway
                .note_book_channel_filter_unavailable(kind, symbol, channel);
        }
        Some(snapshot)
    }

    /// A gate stopped the cycle: pull the quotes and record why.
    async fn stop_cycle(
        &mut self,
        now: f64,
        channel: &str,
        row: DecisionRow,
        action: &str,
        state: StrategyState,
    ) {
        self.state = state;
        {
            let mut oms = self.oms.lock().await;
            oms.cancel_all(action).await;
        }
        self.log_decision(now, channel, row, action);
    }

    async fn flatten_cycle(
        &mut self,
        now: f64,
        channel: &str,
        row: DecisionRow,
        action: &str,
        spot_bbo: &Bbo,
    ) {
        self.state = StrategyState::Flattening;
        {
            let mut oms = self.oms.lock().await;
            oms.flatten(Some(spot_bbo), self.cycle_id, action).await;
        }
        if let Ok(mut risk) = self.risk.lock() {
            risk.set_cooldown(now);
        }
        self.log_decision(now, channel, row, action);
    }

    fn log_decision(&self, now: f64, channel: &str, row: DecisionRow, action: &str) {
        self.decision_log.log(json!({
            "event": "tick",
            "intent": "SYSTEM",
            "source": "strategy",
            "mode": self.state.as_str(),
            "reason": action,
            "leg": "both",
            "ts": (now * 1000.0) as i64,
            "cycle_id": self.cycle_id,
            "state": self.state.as_str(),
            "book_channel": channel,
            "funding_rate": row.funding_rate,
            "basis": row.basis,
            "obi_spot": row.obi_spot,
            "obi_perp": row.obi_perp,
            "mid_spot": row.mid_spot,
            "mid_perp": row.mid_perp,
            "target_q": row.target_q,
            "edge": row.edge,
            "unhedged_notional": row.unhedged_notional,
            "unhedged_qty": row.unhedged_qty,
            "pos_spot": row.pos_spot,
            "pos_perp": row.pos_perp,
            "delta": row.pos_spot.zip(row.pos_perp).map(|(s, p)| s + p),
            "action": action,
        }));
    }
}

/// Expected round-trip edge for one target-notional cycle: funding income
/// minus two maker perp crossings and two taker spot crossings with
/// slippage.
pub fn expected_edge(config: &AppConfig, funding_rate: f64) -> f64 {
    let notional = config.strategy.target_notional;
    let cost_bps = 2.0 * config.cost.fee_maker_perp_bps
        + 2.0 * (config.cost.fee_taker_spot_bps + config.cost.slippage_bps);
    notional * funding_rate - notional * (cost_bps / 1e4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn config() -> AppConfig {
        let yaml = r#"
exchange:
  name: bitget
  base_url: https://api.bitget.com
  ws_public: wss://example/public
  ws_private: wss://example/private
symbols:
  spot: { instType: SPOT, symbol: ETHUSDT }
  perp: { instType: USDT-FUTURES, symbol: ETHUSDT, productType: USDT-FUTURES, marginMode: isolated, marginCoin: USDT }
risk:
  stale_sec: 2.0
  max_unhedged_sec: 2.0
  max_unhedged_notional: 200.0
  max_position_notional: 1000.0
  cooldown_sec: 5.0
strategy:
  enable_only_positive_funding: true
  min_funding_rate: 0.00001
  target_notional: 100.0
  delta_tolerance: 0.001
  obi_levels: 5
  alpha_obi_bps: 0.8
  gamma_inventory_bps: 1.0
  base_half_spread_bps: 2.0
  quote_refresh_ms: 500
  dry_run: true
hedge:
  use_spot_limit_ioc: true
  hedge_aggressive_bps: 5.0
cost:
  fee_maker_perp_bps: 2.0
  fee_taker_spot_bps: 10.0
  slippage_bps: 2.0
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_expected_edge_sign() {
        let config = config();
        // cost = 2*2 + 2*(10+2) = 28 bps -> 0.28 on 100 notional
        let breakeven = 28.0 / 1e4;
        assert!(expected_edge(&config, breakeven + 0.0001) > 0.0);
        assert!(expected_edge(&config, breakeven) <= 0.0);
        assert!(expected_edge(&config, 0.0) < 0.0);
    }

    #[test]
    fn test_reservation_math_matches_formula() {
        // alpha/gamma shifts as used in step(): symmetric spread around the
        // shifted reservation price.
        let mid_perp: f64 = 2000.0;
        let alpha_obi_bps: f64 = 0.8;
        let gamma_inventory_bps: f64 = 1.0;
        let obi: f64 = 0.5;
        let target_q: f64 = 0.05;
        let perp_pos: f64 = 0.0;
        let target_perp = -target_q;

        let alpha_px = mid_perp * (alpha_obi_bps / 1e4) * obi;
        let inv_ratio = (perp_pos - target_perp) / target_q;
        let gamma_px = mid_perp * (gamma_inventory_bps / 1e4) * inv_ratio;
        let reservation = mid_perp + alpha_px - gamma_px;

        // flat book bias up from OBI, pulled down by the inventory penalty
        // of being at zero instead of short target
        assert!((alpha_px - 0.08).abs() < 1e-12);
        assert!((inv_ratio - 1.0).abs() < 1e-12);
        assert!((gamma_px - 0.2).abs() < 1e-12);
        assert!((reservation - 1999.88).abs() < 1e-9);

        let half_bps = 2.0;
        let bid = reservation * (1.0 - half_bps / 1e4);
        let ask = reservation * (1.0 + half_bps / 1e4);
        assert!(bid < reservation && reservation < ask);
        assert!(((ask - bid) / reservation - 2.0 * half_bps / 1e4).abs() < 1e-9);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(StrategyState::Halted.as_str(), "HALTED");
        assert_eq!(StrategyState::Quoting.as_str(), "QUOTING");
    }
}
