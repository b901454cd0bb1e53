//! Order Management Subsystem.
//!
//! Owns the quote slots (at most one resting order per side), the hedge
//! ticket book, the fill dedup index, and the position/unhedged trackers.
//! Every mutating operation runs to completion under the caller's lock, so
//! ticket transitions are totally ordered per ticket.

pub mod tickets;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::exchange::gateway::Gateway;
use crate::jsonl::{now_s, JsonlLogger};
use crate::market::book;
use crate::risk::RiskGuards;
use crate::store::DataStore;
use crate::types::{
    Bbo, ExecutionEvent, InstrumentKind, Intent, OrderRequest, OrderType, Side, TimeInForce,
};
use crate::util::{first_f64, first_str, first_ts};

use tickets::{HedgeTicket, TicketBook, TicketStatus, QTY_EPS};

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEDUP_CAP: usize = 10_000;

// ─────────────────────────────────────────────────────────
// Small owned structures
// ─────────────────────────────────────────────────────────

/// Bounded insert-ordered set for fill dedup. Oldest entry is evicted once
/// the cap is exceeded.
pub struct LruSet {
    cap: usize,
    seq: u64,
    map: HashMap<String, u64>,
}

impl LruSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            seq: 0,
            map: HashMap::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn insert(&mut self, key: String) {
        self.seq += 1;
        self.map.insert(key, self.seq);
        if self.map.len() > self.cap {
            if let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, seq)| **seq)
                .map(|(key, _)| key.clone())
            {
                self.map.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub order_id: String,
    pub client_oid: String,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    pub intent: Intent,
    pub created_ts: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PositionTracker {
    pub spot_pos: f64,
    pub perp_pos: f64,
}

impl PositionTracker {
    pub fn apply_fill(&mut self, event: &ExecutionEvent) {
        let delta = event.size * event.side.sign();
        match event.kind {
            InstrumentKind::Spot => self.spot_pos += delta,
            InstrumentKind::PerpUsdt => self.perp_pos += delta,
        }
    }

    pub fn delta(&self) -> f64 {
        self.spot_pos + self.perp_pos
    }
}

// ─────────────────────────────────────────────────────────
// OMS
// ─────────────────────────────────────────────────────────

pub struct Oms {
    gateway: Arc<Gateway>,
    config: Arc<AppConfig>,
    risk: Arc<Mutex<RiskGuards>>,
    orders_log: JsonlLogger,
    fills_log: JsonlLogger,
    dry_run: bool,

    positions: PositionTracker,
    seen_fills: LruSet,
    quote_bid: Option<ActiveOrder>,
    quote_ask: Option<ActiveOrder>,
    tickets: TicketBook,
    /// order_id -> client_oid for every live submission. Spot fill pushes
    /// omit the client_oid, so this map is load-bearing for classification.
    order_client: HashMap<String, String>,
    unhedged_qty: f64,
    unhedged_since: Option<f64>,
}

impl Oms {
    pub fn new(
        gateway: Arc<Gateway>,
        config: Arc<AppConfig>,
        risk: Arc<Mutex<RiskGuards>>,
        orders_log: JsonlLogger,
        fills_log: JsonlLogger,
    ) -> Self {
        let dry_run = config.strategy.dry_run;
        Self {
            gateway,
            config,
            risk,
            orders_log,
            fills_log,
            dry_run,
            positions: PositionTracker::default(),
            seen_fills: LruSet::new(DEDUP_CAP),
            quote_bid: None,
            quote_ask: None,
            tickets: TicketBook::default(),
            order_client: HashMap::new(),
            unhedged_qty: 0.0,
            unhedged_since: None,
        }
    }

    pub fn positions(&self) -> PositionTracker {
        self.positions
    }

    pub fn unhedged_qty(&self) -> f64 {
        self.unhedged_qty
    }

    pub fn unhedged_since(&self) -> Option<f64> {
        self.unhedged_since
    }

    pub fn open_ticket_count(&self) -> usize {
        self.tickets.open_ids().len()
    }

    /// Clones of the open tickets, for the test-mode fill injector.
    pub fn open_tickets(&self) -> Vec<HedgeTicket> {
        self.tickets
            .open_ids()
            .iter()
            .filter_map(|id| self.tickets.get(id).cloned())
            .collect()
    }

    pub fn quote_order(&self, intent: Intent) -> Option<ActiveOrder> {
        match intent {
            Intent::QuoteBid => self.quote_bid.clone(),
            Intent::QuoteAsk => self.quote_ask.clone(),
            _ => None,
        }
    }

    fn new_client_oid(&self, intent: Intent, cycle_id: u64) -> String {
        let uniq = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", intent.as_str(), cycle_id, &uniq[..10])
    }

    // ─────────────────────────────────────────────────
    // Quote upsert
    // ─────────────────────────────────────────────────

    pub async fn update_quotes(
        &mut self,
        bid_px: f64,
        ask_px: f64,
        bid_size: f64,
        ask_size: f64,
        cycle_id: u64,
        reason: &str,
    ) {
        if !self.gateway.constraints().ready() {
            self.orders_log.log(json!({
                "event": "order_skip",
                "intent": "quote",
                "source": "oms",
                "mode": "QUOTING",
                "reason": "constraints_not_ready",
                "leg": "perp",
                "cycle_id": cycle_id,
                "state": "blocked_constraints",
            }));
            return;
        }
        self.upsert_quote(Intent::QuoteBid, Side::Buy, bid_px, bid_size, cycle_id, reason)
            .await;
        self.upsert_quote(Intent::QuoteAsk, Side::Sell, ask_px, ask_size, cycle_id, reason)
            .await;
    }

    async fn upsert_quote(
        &mut self,
        intent: Intent,
        side: Side,
        price: f64,
        size: f64,
        cycle_id: u64,
        reason: &str,
    ) {
        let existing = self.quote_order(intent);

        if price <= 0.0 || size <= 0.0 {
            if existing.is_some() {
                self.cancel_quote(intent, reason, "cancel").await;
            }
            return;
        }

        let constraints = match self.gateway.constraints_for(InstrumentKind::PerpUsdt) {
            Some(c) if c.is_ready() => c,
            _ => return,
        };
        let price = constraints.adjust_price(price);
        let size = constraints.adjust_qty(size);
        if size <= 0.0 {
            if existing.is_some() {
                self.cancel_quote(intent, reason, "cancel").await;
            }
            return;
        }
        // Too small for the venue: drop without touching the resting order.
        if !constraints.validate(price, size) {
            return;
        }

        if let Some(existing) = &existing {
            if !needs_replace(existing, price, size, constraints.qty_step, constraints.tick_size) {
                return;
            }
        }
        if existing.is_some() {
            self.cancel_quote(intent, reason, "replace").await;
        }

        let req = OrderRequest {
            kind: InstrumentKind::PerpUsdt,
            symbol: self.config.symbols.perp.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            size,
            force: TimeInForce::PostOnly,
            client_oid: self.new_client_oid(intent, cycle_id),
            intent,
            cycle_id,
            price: Some(price),
            reduce_only: None,
        };
        let client_oid = req.client_oid.clone();
        if let Some(order_id) = self.submit_order(req, reason, "QUOTING").await {
            let slot = match intent {
                Intent::QuoteBid => &mut self.quote_bid,
                Intent::QuoteAsk => &mut self.quote_ask,
                _ => return,
            };
            *slot = Some(ActiveOrder {
                order_id,
                client_oid,
                price,
                size,
                side,
                intent,
                created_ts: now_s(),
            });
        }
    }

    // ─────────────────────────────────────────────────
    // Submission / cancel
    // ─────────────────────────────────────────────────

    /// Final re-validation and the actual POST. Returns the exchange order
    /// id, or `None` for dry-run, skip, transport failure, or reject.
    async fn submit_order(&mut self, mut req: OrderRequest, reason: &str, mode: &str) -> Option<String> {
        let constraints = match self.gateway.constraints_for(req.kind) {
            Some(c) if c.is_ready() => c,
            _ => {
                self.log_order("order_skip", &req, reason, mode, "blocked_constraints", None);
                return None;
            }
        };
        if let Some(price) = req.price {
            req.price = Some(constraints.adjust_price(price));
        }
        req.size = constraints.adjust_qty(req.size);
        if req.size < constraints.min_qty {
            self.log_order("order_skip", &req, reason, mode, "blocked_constraints", None);
            return None;
        }
        if let Some(price) = req.price {
            if !constraints.validate(price, req.size) {
                self.log_order("order_skip", &req, reason, mode, "blocked_constraints", None);
                return None;
            }
        }

        if self.dry_run {
            self.log_order("order_new", &req, reason, mode, "dry_run", None);
            return None;
        }

        let now = now_s();
        match self.gateway.place_order(&req).await {
            Ok(response) => {
                let resp_code = response
                    .get("code")
                    .map(|code| code.to_string().trim_matches('"').to_string())
                    .unwrap_or_default();
                let ok = resp_code == "00000";
                self.log_order("order_new", &req, reason, mode, "sent", Some(&response));
                let (streak, newly_halted) = self
                    .risk
                    .lock()
                    .map(|mut risk| risk.record_order_result(ok, now))
                    .unwrap_or((0, false));
                if !ok {
                    warn!(client_oid = %req.client_oid, %resp_code, streak, "order rejected");
                    self.orders_log.log(json!({
                        "event": "risk",
                        "intent": req.intent.as_str(),
                        "source": "oms",
                        "mode": mode,
                        "reason": "order_reject",
                        "leg": req.kind.leg(),
                        "cycle_id": req.cycle_id,
                        "client_oid": req.client_oid,
                        "reject_streak": streak,
                        "data": { "resp_code": resp_code },
                    }));
                    if newly_halted {
                        self.on_halt_latched("reject_streak");
                    }
                    return None;
                }
                let order_id = extract_order_id(&response);
                if let Some(order_id) = &order_id {
                    self.order_client
                        .insert(order_id.clone(), req.client_oid.clone());
                }
                order_id
            }
            Err(err) => {
                warn!(client_oid = %req.client_oid, error = %err, "order submit failed");
                self.log_order("order_new", &req, reason, mode, "http_error", None);
                let (streak, newly_halted) = self
                    .risk
                    .lock()
                    .map(|mut risk| risk.record_order_result(false, now))
                    .unwrap_or((0, false));
                self.orders_log.log(json!({
                    "event": "risk",
                    "intent": req.intent.as_str(),
                    "source": "oms",
                    "mode": mode,
                    "reason": "order_reject",
                    "leg": req.kind.leg(),
                    "cycle_id": req.cycle_id,
                    "client_oid": req.client_oid,
                    "reject_streak": streak,
                    "data": { "error": err.to_string() },
                }));
                if newly_halted {
                    self.on_halt_latched("reject_streak");
                }
                None
            }
        }
    }

    fn log_order(
        &self,
        event: &str,
        req: &OrderRequest,
        reason: &str,
        mode: &str,
        state: &str,
        response: Option<&Value>,
    ) {
        let resp_code = response
            .and_then(|res| res.get("code"))
            .map(|code| code.to_string().trim_matches('"').to_string());
        self.orders_log.log(json!({
            "event": event,
            "intent": req.intent.as_str(),
            "source": "oms",
            "mode": mode,
            "reason": reason,
            "leg": req.kind.leg(),
            "cycle_id": req.cycle_id,
            "inst_type": req.kind.as_str(),
            "symbol": req.symbol,
            "side": req.side.as_str(),
            "type": req.order_type.as_str(),
            "price": req.price,
            "size": req.size,
            "force": req.force.as_str(),
            "client_oid": req.client_oid,
            "state": state,
            "resp_code": resp_code,
            "res": response.cloned().unwrap_or(Value::Null),
            "simulated": self.dry_run,
        }));
    }

    async fn cancel_quote(&mut self, intent: Intent, reason: &str, state: &str) -> bool {
        let order = match intent {
            Intent::QuoteBid => self.quote_bid.take(),
            Intent::QuoteAsk => self.quote_ask.take(),
            _ => None,
        };
        let Some(order) = order else {
            return true;
        };

        let mut record = json!({
            "event": "order_cancel",
            "intent": order.intent.as_str(),
            "source": "oms",
            "mode": "QUOTING",
            "reason": reason,
            "leg": "perp",
            "symbol": self.config.symbols.perp.symbol,
            "side": order.side.as_str(),
            "type": "cancel",
            "price": order.price,
            "size": order.size,
            "client_oid": order.client_oid,
            "order_id": order.order_id,
            "state": state,
            "simulated": self.dry_run,
        });
        if self.dry_run {
            self.orders_log.log(record);
            return true;
        }
        let result = self
            .gateway
            .cancel_order(
                InstrumentKind::PerpUsdt,
                &self.config.symbols.perp.symbol,
                Some(&order.order_id),
                Some(&order.client_oid),
            )
            .await;
        let ok = match result {
            Ok(response) => {
                if let Some(map) = record.as_object_mut() {
                    map.insert("res".to_string(), response);
                }
                true
            }
            Err(err) => {
                if let Some(map) = record.as_object_mut() {
                    map.insert("data".to_string(), json!({ "error": err.to_string() }));
                }
                false
            }
        };
        self.orders_log.log(record);
        ok
    }

    /// Cancel both quote slots. Called at startup, on halt, on risk gates,
    /// and during flatten/unwind. Returns false when any cancel request
    /// failed at the transport level.
    pub async fn cancel_all(&mut self, reason: &str) -> bool {
        let bid_ok = self.cancel_quote(Intent::QuoteBid, reason, "cancel").await;
        let ask_ok = self.cancel_quote(Intent::QuoteAsk, reason, "cancel").await;
        bid_ok && ask_ok
    }

    // ─────────────────────────────────────────────────
    // Flatten
    // ─────────────────────────────────────────────────

    /// Cancel everything, then take both positions back to zero:
    /// reduce-only market on the perp, IOC limit at the touch on spot.
    pub async fn flatten(&mut self, spot_bbo: Option<&Bbo>, cycle_id: u64, reason: &str) {
        self.cancel_all(reason).await;
        if !self.gateway.constraints().ready() {
            return;
        }

        if self.positions.perp_pos.abs() > QTY_EPS {
            let side = if self.positions.perp_pos < 0.0 {
                Side::Buy
            } else {
                Side::Sell
            };
            let req = OrderRequest {
                kind: InstrumentKind::PerpUsdt,
                symbol: self.config.symbols.perp.symbol.clone(),
                side,
                order_type: OrderType::Market,
                size: self.positions.perp_pos.abs(),
                force: TimeInForce::Ioc,
                client_oid: self.new_client_oid(Intent::Flatten, cycle_id),
                intent: Intent::Flatten,
                cycle_id,
                price: None,
                reduce_only: Some(true),
            };
            self.submit_order(req, reason, "FLATTENING").await;
        }

        if let Some(bbo) = spot_bbo {
            if self.positions.spot_pos.abs() > QTY_EPS {
                let side = if self.positions.spot_pos > 0.0 {
                    Side::Sell
                } else {
                    Side::Buy
                };
                let price = if side == Side::Buy { bbo.ask } else { bbo.bid };
                let req = OrderRequest {
                    kind: InstrumentKind::Spot,
                    symbol: self.config.symbols.spot.symbol.clone(),
                    side,
                    order_type: OrderType::Limit,
                    size: self.positions.spot_pos.abs(),
                    force: TimeInForce::Ioc,
                    client_oid: self.new_client_oid(Intent::Flatten, cycle_id),
                    intent: Intent::Flatten,
                    cycle_id,
                    price: Some(price),
                    reduce_only: None,
                };
                self.submit_order(req, reason, "FLATTENING").await;
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Fill ingestion
    // ─────────────────────────────────────────────────

    pub fn parse_fill(row: &Value) -> Option<ExecutionEvent> {
        let kind = InstrumentKind::from_inst_type(&first_str(row, &["instType"])?)?;
        let symbol = first_str(row, &["symbol", "instId"])?;
        let side = Side::parse(&first_str(row, &["side"])?)?;
        let order_id = first_str(row, &["orderId", "order_id", "ordId"]).unwrap_or_default();
        let client_oid =
            first_str(row, &["clientOid", "clientOrderId", "client_oid"]).unwrap_or_default();
        let price = first_f64(row, &["price", "priceAvg", "fillPx", "tradePrice"]).unwrap_or(0.0);
        let size = first_f64(row, &["size", "baseVolume", "fillSz", "tradeSize"]).unwrap_or(0.0);
        if size <= 0.0 {
            return None;
        }
        let fee = first_f64(row, &["fee", "fillFee"]).unwrap_or(0.0);
        let ts = first_ts(row, &["uTime", "ts", "cTime", "fillTime", "tradeTime"])
            .unwrap_or_else(now_s);
        let fill_id = first_str(row, &["tradeId", "fillId", "execId", "id"]).unwrap_or_else(|| {
            format!("{}:{}:{}:{}:{}", kind.as_str(), order_id, ts, price, size)
        });
        let simulated = row.get("simulated").and_then(Value::as_bool).unwrap_or(false);

        Some(ExecutionEvent {
            kind,
            symbol,
            order_id,
            client_oid,
            fill_id,
            side,
            price,
            size,
            fee,
            ts,
            simulated,
        })
    }

    pub async fn handle_fill(&mut self, mut event: ExecutionEvent) {
        // Spot pushes drop the client_oid; recover it through the order map.
        if event.client_oid.is_empty() && !event.order_id.is_empty() {
            if let Some(client_oid) = self
                .tickets
                .client_oid_for_order(&event.order_id)
                .cloned()
                .or_else(|| self.order_client.get(&event.order_id).cloned())
            {
                event.client_oid = client_oid;
            }
        }

        let ticket_id = self.tickets.resolve(&event.order_id, &event.client_oid);
        let intent = Intent::from_client_oid(&event.client_oid);
        // Ticket resolution wins over a stale client-oid prefix.
        let intent_str = if ticket_id.is_some() {
            Intent::Hedge.as_str()
        } else {
            intent.map(|i| i.as_str()).unwrap_or("unknown")
        };

        self.fills_log.log(json!({
            "event": "fill",
            "intent": intent_str,
            "source": "ws_private",
            "mode": "RUN",
            "reason": "fill",
            "leg": event.kind.leg(),
            "ts": (event.ts * 1000.0) as i64,
            "inst_type": event.kind.as_str(),
            "symbol": event.symbol,
            "side": event.side.as_str(),
            "fill_id": event.fill_id,
            "order_id": event.order_id,
            "client_oid": event.client_oid,
            "price": event.price,
            "size": event.size,
            "fee": event.fee,
            "ticket_id": ticket_id.clone(),
            "simulated": event.simulated,
        }));

        self.positions.apply_fill(&event);
        debug!(
            spot = self.positions.spot_pos,
            perp = self.positions.perp_pos,
            "position after fill"
        );

        match event.kind {
            InstrumentKind::Spot => {
                if let Some(ticket_id) = ticket_id {
                    self.apply_hedge_fill(&event, &ticket_id);
                }
                // Flatten and unknown spot fills only move the position.
            }
            InstrumentKind::PerpUsdt => {
                if matches!(intent, Some(i) if i.is_quote()) {
                    self.hedge_perp_fill(&event).await;
                }
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Hedge pipeline
    // ─────────────────────────────────────────────────

    fn add_unhedged(&mut self, event: &ExecutionEvent) {
        // Opposite to the perp fill's delta: a perp sell leaves +qty to buy
        // back on spot.
        let delta = if event.side == Side::Sell {
            event.size
        } else {
            -event.size
        };
        self.unhedged_qty += delta;
        if self.unhedged_qty.abs() <= QTY_EPS {
            self.unhedged_qty = 0.0;
            self.unhedged_since = None;
        } else if self.unhedged_since.is_none() {
            self.unhedged_since = Some(now_s());
        }
    }

    /// Drop a terminal ticket's residual from the unhedged counter.
    fn release_unhedged(&mut self, ticket: &HedgeTicket) {
        let remain = ticket.remain();
        if remain <= QTY_EPS {
            return;
        }
        let signed = if ticket.side == Side::Buy { remain } else { -remain };
        self.unhedged_qty -= signed;
        if self.unhedged_qty.abs() <= QTY_EPS {
            self.unhedged_qty = 0.0;
            self.unhedged_since = None;
        }
    }

    fn apply_hedge_fill(&mut self, event: &ExecutionEvent, ticket_id: &str) {
        let delta = event.size * event.side.sign();
        self.unhedged_qty -= delta;
        if self.unhedged_qty.abs() <= QTY_EPS {
            self.unhedged_qty = 0.0;
            self.unhedged_since = None;
        }

        let Some(ticket) = self.tickets.get_mut(ticket_id) else {
            return;
        };
        ticket.filled_qty += event.size;
        if ticket.status == TicketStatus::Open && ticket.is_filled() {
            ticket.status = TicketStatus::Done;
            let ticket = ticket.clone();
            info!(ticket_id, "hedge ticket done");
            self.orders_log.log(json!({
                "event": "state",
                "intent": "HEDGE",
                "source": "oms",
                "mode": "HEDGING",
                "reason": "ticket_done",
                "leg": "spot",
                "ticket_id": ticket_id,
                "tries": ticket.tries,
                "remain": 0.0,
                "want_qty": ticket.want_qty,
            }));
            self.tickets.remove(ticket_id);
        }
    }

    /// A quote fill on the perp: open a ticket, bump unhedged, and send the
    /// first IOC when the spot book is usable.
    async fn hedge_perp_fill(&mut self, event: &ExecutionEvent) {
        let now = now_s();
        let cycle_id = event.ts as u64;
        let ticket_id = self.new_client_oid(Intent::Hedge, cycle_id);
        let hedge_side = event.side.opposite();
        let ticket = HedgeTicket {
            ticket_id: ticket_id.clone(),
            symbol: self.config.symbols.spot.symbol.clone(),
            side: hedge_side,
            want_qty: event.size,
            filled_qty: 0.0,
            created_ts: now,
            deadline_ts: now + self.config.hedge.hedge_deadline_sec,
            tries: 0,
            status: TicketStatus::Open,
            reason: String::new(),
        };
        self.tickets.insert(ticket);
        self.add_unhedged(event);
        self.orders_log.log(json!({
            "event": "state",
            "intent": "HEDGE",
            "source": "oms",
            "mode": "HEDGING",
            "reason": "ticket_open",
            "leg": "spot",
            "cycle_id": cycle_id,
            "ticket_id": ticket_id,
            "client_oid": ticket_id,
            "side": hedge_side.as_str(),
            "want_qty": event.size,
            "remain": event.size,
            "tries": 0,
        }));

        // A fill can land after the halt latched; the ticket is opened for
        // accounting and immediately failed so no hedge order follows.
        let halted = self.risk.lock().map(|risk| risk.is_halted()).unwrap_or(false);
        if halted {
            self.fail_ticket(&ticket_id, "halted");
            return;
        }

        if !self.gateway.book_ready() {
            return; // process_hedge_tickets revisits after the deadline
        }
        let channel = self.gateway.public_book_channel();
        let snapshot = book::snapshot_from_store(
            self.gateway.store(),
            InstrumentKind::Spot,
            &self.config.symbols.spot.symbol,
            1,
            &channel,
        );
        let Some(snapshot) = snapshot else {
            return;
        };
        let bbo = book::bbo_from_snapshot(&snapshot);

        // First try reuses the ticket id as client_oid.
        self.send_hedge_order(
            &ticket_id,
            hedge_side,
            event.size,
            &bbo,
            self.config.hedge.hedge_aggressive_bps,
            ticket_id.clone(),
            cycle_id,
            false,
        )
        .await;
    }

    /// One hedge attempt: log the attempt, bump tries/deadline, submit the
    /// IOC, and link the routing maps.
    #[allow(clippy::too_many_arguments)]
    async fn send_hedge_order(
        &mut self,
        ticket_id: &str,
        side: Side,
        qty: f64,
        bbo: &Bbo,
        slip_bps: f64,
        client_oid: String,
        cycle_id: u64,
        chase: bool,
    ) {
        let slip = slip_bps / 1e4;
        let price = if side == Side::Buy {
            bbo.ask * (1.0 + slip)
        } else {
            bbo.bid * (1.0 - slip)
        };

        let (tries, remain) = match self.tickets.get_mut(ticket_id) {
            Some(ticket) => {
                ticket.tries += 1;
                ticket.deadline_ts = now_s() + self.config.hedge.hedge_deadline_sec;
                (ticket.tries, ticket.remain())
            }
            None => return,
        };

        // The attempt record precedes the submit so a reject-triggered halt
        // cannot reorder it past the ticket's terminal.
        let (event, reason) = if chase {
            ("risk", "hedge_chase")
        } else {
            ("state", "ticket_order")
        };
        self.orders_log.log(json!({
            "event": event,
            "intent": "HEDGE",
            "source": "oms",
            "mode": "HEDGING",
            "reason": reason,
            "leg": "spot",
            "cycle_id": cycle_id,
            "ticket_id": ticket_id,
            "client_oid": client_oid,
            "tries": tries,
            "remain": remain,
            "data": { "slip_bps": slip_bps, "price": price },
        }));

        let (order_type, price) = if self.config.hedge.use_spot_limit_ioc {
            (OrderType::Limit, Some(price))
        } else {
            (OrderType::Market, None)
        };
        let req = OrderRequest {
            kind: InstrumentKind::Spot,
            symbol: self.config.symbols.spot.symbol.clone(),
            side,
            order_type,
            size: qty,
            force: TimeInForce::Ioc,
            client_oid: client_oid.clone(),
            intent: Intent::Hedge,
            cycle_id,
            price,
            reduce_only: None,
        };
        let order_id = self.submit_order(req, "hedge", "HEDGING").await;

        if self.tickets.get(ticket_id).is_some() {
            self.tickets.link_client_oid(&client_oid, ticket_id);
            if let Some(order_id) = &order_id {
                self.tickets.link_order(order_id, &client_oid, ticket_id);
            }
        }
    }

    /// Deadline-driven ticket progress: runs every strategy cycle with the
    /// freshest spot BBO.
    pub async fn process_hedge_tickets(&mut self, now: f64, spot_bbo: Option<&Bbo>, cycle_id: u64) {
        for ticket_id in self.tickets.ids() {
            let Some(ticket) = self.tickets.get(&ticket_id).cloned() else {
                continue;
            };
            if ticket.status != TicketStatus::Open {
                self.tickets.remove(&ticket_id);
                continue;
            }
            if ticket.is_filled() {
                self.orders_log.log(json!({
                    "event": "state",
                    "intent": "HEDGE",
                    "source": "oms",
                    "mode": "HEDGING",
                    "reason": "ticket_done",
                    "leg": "spot",
                    "cycle_id": cycle_id,
                    "ticket_id": ticket_id,
                    "tries": ticket.tries,
                    "remain": 0.0,
                    "want_qty": ticket.want_qty,
                }));
                self.tickets.remove(&ticket_id);
                continue;
            }
            if now < ticket.deadline_ts {
                continue;
            }

            if ticket.tries < self.config.hedge.hedge_max_tries {
                let Some(bbo) = spot_bbo else {
                    continue; // no book to chase against; retry next cycle
                };
                let slip = self.config.hedge.hedge_aggressive_bps
                    + ticket.tries as f64 * self.config.hedge.hedge_chase_slip_bps;
                let client_oid = self.new_client_oid(Intent::Hedge, cycle_id);
                self.send_hedge_order(
                    &ticket_id,
                    ticket.side,
                    ticket.remain(),
                    bbo,
                    slip,
                    client_oid,
                    cycle_id,
                    true,
                )
                .await;
            } else if self.config.hedge.unwind_enable {
                self.unwind_ticket(&ticket, cycle_id).await;
            } else {
                self.fail_ticket(&ticket_id, "tries_exhausted");
            }
        }
    }

    /// Retry budget exhausted: close the unhedged perp leg instead of
    /// chasing spot any further.
    async fn unwind_ticket(&mut self, ticket: &HedgeTicket, cycle_id: u64) {
        let remain = ticket.remain();
        warn!(ticket_id = %ticket.ticket_id, remain, "hedge unwind");
        self.orders_log.log(json!({
            "event": "risk",
            "intent": "UNWIND",
            "source": "oms",
            "mode": "HEDGING",
            "reason": "hedge_unwind",
            "leg": "perp",
            "cycle_id": cycle_id,
            "ticket_id": ticket.ticket_id,
            "tries": ticket.tries,
            "remain": remain,
            "side": ticket.side.as_str(),
        }));

        self.cancel_all("hedge_unwind").await;

        let req = OrderRequest {
            kind: InstrumentKind::PerpUsdt,
            symbol: self.config.symbols.perp.symbol.clone(),
            side: ticket.side,
            order_type: OrderType::Market,
            size: remain,
            force: TimeInForce::Ioc,
            client_oid: self.new_client_oid(Intent::Unwind, cycle_id),
            intent: Intent::Unwind,
            cycle_id,
            price: None,
            reduce_only: Some(true),
        };
        let order_id = self.submit_order(req, "hedge_unwind", "HEDGING").await;
        let rejected = order_id.is_none() && !self.dry_run;

        if let Some(mut removed) = self.tickets.remove(&ticket.ticket_id) {
            removed.status = TicketStatus::Failed;
            removed.reason = "hedge_unwind".to_string();
            self.release_unhedged(&removed);
        }

        if rejected && self.config.hedge.halt_on_unwind_reject {
            let newly = self
                .risk
                .lock()
                .map(|mut risk| risk.halt("unwind_reject", now_s()))
                .unwrap_or(false);
            if newly {
                self.on_halt_latched("unwind_reject");
            }
        }
    }

    /// Terminal Failed transition without an unwind order.
    fn fail_ticket(&mut self, ticket_id: &str, reason: &str) {
        let Some(mut ticket) = self.tickets.remove(ticket_id) else {
            return;
        };
        ticket.status = TicketStatus::Failed;
        ticket.reason = reason.to_string();
        self.release_unhedged(&ticket);
        self.orders_log.log(json!({
            "event": "state",
            "intent": "HEDGE",
            "source": "oms",
            "mode": "HEDGING",
            "reason": "ticket_failed",
            "leg": "spot",
            "ticket_id": ticket_id,
            "tries": ticket.tries,
            "remain": ticket.remain(),
            "data": { "reason": reason },
        }));
    }

    /// Halt housekeeping: record the latch and fail every open ticket so
    /// none is left open at shutdown.
    fn on_halt_latched(&mut self, reason: &str) {
        warn!(reason, "risk halt latched");
        self.orders_log.log(json!({
            "event": "halted",
            "intent": "SYSTEM",
            "source": "oms",
            "mode": "HALTED",
            "reason": reason,
            "leg": "both",
        }));
        self.abort_open_tickets("halted");
    }

    pub fn abort_open_tickets(&mut self, reason: &str) {
        for ticket_id in self.tickets.open_ids() {
            self.fail_ticket(&ticket_id, reason);
        }
    }

    // ─────────────────────────────────────────────────
    // Position sync
    // ─────────────────────────────────────────────────

    fn apply_position_rows(&mut self, rows: &[Value]) -> f64 {
        let symbol = self.config.symbols.perp.symbol.clone();
        let mut perp_pos = 0.0;
        for row in rows {
            if first_str(row, &["symbol", "instId"]).as_deref() != Some(symbol.as_str()) {
                continue;
            }
            let size = first_f64(row, &["total", "size", "available"]).unwrap_or(0.0);
            let hold = first_str(row, &["holdSide", "posSide", "side"])
                .unwrap_or_default()
                .to_lowercase();
            let signed = if hold == "short" || hold == "sell" {
                -size
            } else {
                size
            };
            perp_pos += signed;
        }
        self.positions.perp_pos = perp_pos;
        perp_pos
    }
}

// ─────────────────────────────────────────────────────────
// Loop entrypoints (shared-OMS tasks)
// ─────────────────────────────────────────────────────────

/// Poll the private fill rows and feed new events through the OMS, at most
/// once per (inst, fill_id).
pub async fn monitor_fills(oms: Arc<tokio::sync::Mutex<Oms>>, store: Arc<DataStore>) {
    let mut tick = tokio::time::interval(FILL_POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let rows = store.fills_snapshot();
        if rows.is_empty() {
            continue;
        }
        let mut guard = oms.lock().await;
        for row in &rows {
            let Some(event) = Oms::parse_fill(row) else {
                continue;
            };
            let key = event.dedup_key();
            if guard.seen_fills.contains(&key) {
                continue;
            }
            guard.seen_fills.insert(key);
            guard.handle_fill(event).await;
        }
    }
}

/// Wait up to `timeout_sec` for the private positions stream, then fold the
/// perp rows into the tracker (short holdings count negative).
pub async fn sync_positions(
    oms: Arc<tokio::sync::Mutex<Oms>>,
    store: Arc<DataStore>,
    timeout_sec: f64,
    log: JsonlLogger,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(timeout_sec);
    loop {
        let rows = store.positions_snapshot();
        if !rows.is_empty() {
            let mut guard = oms.lock().await;
            let perp_pos = guard.apply_position_rows(&rows);
            log.log(json!({
                "event": "state",
                "intent": "SYSTEM",
                "source": "ws_private",
                "mode": "RUN",
                "reason": "positions_sync",
                "leg": "perp",
                "data": { "perp_pos": perp_pos, "rows": rows.len() },
            }));
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            log.log(json!({
                "event": "state",
                "intent": "SYSTEM",
                "source": "ws_private",
                "mode": "RUN",
                "reason": "positions_sync",
                "leg": "perp",
                "data": { "timeout": true },
            }));
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

// ─────────────────────────────────────────────────────────
// Free helpers
// ─────────────────────────────────────────────────────────

/// Replace iff the price moved a full tick or the size moved more than half
/// a step.
pub fn needs_replace(
    existing: &ActiveOrder,
    price: f64,
    size: f64,
    qty_step: f64,
    tick_size: f64,
) -> bool {
    if (size - existing.size).abs() > qty_step / 2.0 {
        return true;
    }
    if (price - existing.price).abs() >= tick_size {
        return true;
    }
    false
}

fn extract_order_id(payload: &Value) -> Option<String> {
    let data = payload.get("data")?;
    first_str(data, &["orderId", "order_id"])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(price: f64, size: f64) -> ActiveOrder {
        ActiveOrder {
            order_id: "o-1".to_string(),
            client_oid: "QUOTE_BID-1-aaaa".to_string(),
            price,
            size,
            side: Side::Buy,
            intent: Intent::QuoteBid,
            created_ts: 0.0,
        }
    }

    #[test]
    fn test_needs_replace_thresholds() {
        let existing = active(2000.0, 0.05);
        let (step, tick) = (0.01, 0.1);
        assert!(!needs_replace(&existing, 2000.0, 0.05, step, tick));
        // price just below one tick: keep
        assert!(!needs_replace(&existing, 2000.05, 0.05, step, tick));
        assert!(needs_replace(&existing, 2000.1, 0.05, step, tick));
        // size just over half a step: replace
        assert!(!needs_replace(&existing, 2000.0, 0.054, step, tick));
        assert!(needs_replace(&existing, 2000.0, 0.056, step, tick));
    }

    #[test]
    fn test_lru_set_bounds_and_evicts_oldest() {
        let mut set = LruSet::new(3);
        for key in ["a", "b", "c", "d"] {
            set.insert(key.to_string());
        }
        assert_eq!(set.len(), 3);
        assert!(!set.contains("a"));
        assert!(set.contains("d"));
    }

    #[test]
    fn test_position_tracker_signs() {
        let mut tracker = PositionTracker::default();
        tracker.apply_fill(&fill(InstrumentKind::PerpUsdt, Side::Sell, 0.05));
        tracker.apply_fill(&fill(InstrumentKind::Spot, Side::Buy, 0.05));
        assert!((tracker.perp_pos + 0.05).abs() < 1e-12);
        assert!((tracker.spot_pos - 0.05).abs() < 1e-12);
        assert!(tracker.delta().abs() < 1e-12);
    }

    #[test]
    fn test_parse_fill_perp_row() {
        let row = json!({
            "instType": "USDT-FUTURES",
            "symbol": "ETHUSDT",
            "side": "sell",
            "tradeId": "t-77",
            "orderId": "o-77",
            "clientOid": "QUOTE_ASK-9-deadbeef00",
            "price": "2000.5",
            "baseVolume": "0.05",
            "uTime": "1700000000000",
        });
        let event = Oms::parse_fill(&row).unwrap();
        assert_eq!(event.kind, InstrumentKind::PerpUsdt);
        assert_eq!(event.side, Side::Sell);
        assert_eq!(event.fill_id, "t-77");
        assert!((event.price - 2000.5).abs() < 1e-12);
        assert!((event.size - 0.05).abs() < 1e-12);
        assert!((event.ts - 1_700_000_000.0).abs() < 1e-6);
        assert_eq!(event.dedup_key(), "USDT-FUTURES:t-77");
    }

    #[test]
    fn test_parse_fill_spot_row_without_client_oid() {
        let row = json!({
            "instType": "SPOT",
            "instId": "ETHUSDT",
            "side": "buy",
            "orderId": "o-9",
            "priceAvg": "2001.0",
            "size": "0.05",
            "ts": 1700000001_i64,
        });
        let event = Oms::parse_fill(&row).unwrap();
        assert_eq!(event.kind, InstrumentKind::Spot);
        assert!(event.client_oid.is_empty());
        assert!((event.price - 2001.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_fill_composite_fallback_id() {
        let row = json!({
            "instType": "SPOT",
            "instId": "ETHUSDT",
            "side": "buy",
            "orderId": "o-9",
            "priceAvg": "2001.0",
            "size": "0.05",
            "ts": 1700000001_i64,
        });
        let event = Oms::parse_fill(&row).unwrap();
        assert!(event.fill_id.starts_with("SPOT:o-9:"));
    }

    #[test]
    fn test_parse_fill_rejects_garbage() {
        assert!(Oms::parse_fill(&json!({ "instType": "OPTIONS" })).is_none());
        assert!(Oms::parse_fill(&json!({ "instType": "SPOT", "instId": "X" })).is_none());
        assert!(Oms::parse_fill(&json!({
            "instType": "SPOT", "instId": "X", "side": "buy", "size": "0"
        }))
        .is_none());
    }

    fn fill(kind: InstrumentKind, side: Side, size: f64) -> ExecutionEvent {
        ExecutionEvent {
            kind,
            symbol: "ETHUSDT".to_string(),
            order_id: "o".to_string(),
            client_oid: String::new(),
            fill_id: "f".to_string(),
            side,
            price: 2000.0,
            size,
            fee: 0.0,
            ts: 0.0,
            simulated: false,
        }
    }

    // ─────────────────────────────────────────────────
    // Hedge pipeline scenarios (dry-run rig: submits are logged, not sent)
    // ─────────────────────────────────────────────────

    use crate::config::AppConfig;
    use crate::constraints::{ConstraintsRegistry, InstrumentConstraints};
    use crate::exchange::gateway::Gateway;
    use crate::store::BookKey;
    use std::path::{Path, PathBuf};

    struct Rig {
        oms: Oms,
        store: Arc<DataStore>,
        gateway: Arc<Gateway>,
        risk: Arc<Mutex<RiskGuards>>,
        orders_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    fn test_config(hedge_max_tries: u32) -> AppConfig {
        let yaml = format!(
            r#"
exchange:
  name: bitget
  base_url: https://api.bitget.com
  ws_public: wss://example/public
  ws_private: wss://example/private
symbols:
  spot: {{ instType: SPOT, symbol: ETHUSDT }}
  perp: {{ instType: USDT-FUTURES, symbol: ETHUSDT, productType: USDT-FUTURES, marginMode: isolated, marginCoin: USDT }}
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
  hedge_deadline_sec: 1.5
  hedge_max_tries: {hedge_max_tries}
  hedge_chase_slip_bps: 5.0
cost:
  fee_maker_perp_bps: 2.0
  fee_taker_spot_bps: 10.0
  slippage_bps: 2.0
"#
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn rig(hedge_max_tries: u32) -> Rig {
        let config = Arc::new(test_config(hedge_max_tries));
        let dir = tempfile::tempdir().unwrap();
        let system_log = JsonlLogger::open(dir.path().join("system.jsonl")).unwrap();
        let orders_log = JsonlLogger::open(dir.path().join("orders.jsonl")).unwrap();
        let fills_log = JsonlLogger::open(dir.path().join("fills.jsonl")).unwrap();
        let store = Arc::new(DataStore::new());
        let (gateway, _disconnect_rx) =
            Gateway::new(config.clone(), store.clone(), None, system_log);

        let leg = InstrumentConstraints {
            tick_size: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        };
        gateway.set_constraints_for_tests(ConstraintsRegistry {
            spot: Some(leg),
            perp: Some(leg),
        });
        gateway.set_book_ready(true);

        let risk = Arc::new(Mutex::new(RiskGuards::new(config.risk.clone())));
        let oms = Oms::new(
            gateway.clone(),
            config,
            risk.clone(),
            orders_log,
            fills_log,
        );
        Rig {
            oms,
            store,
            gateway,
            risk,
            orders_path: dir.path().join("orders.jsonl"),
            _dir: dir,
        }
    }

    fn seed_spot_book(store: &DataStore) {
        store.apply_book(
            &BookKey {
                inst_type: "SPOT".to_string(),
                channel: "books".to_string(),
                inst_id: "ETHUSDT".to_string(),
            },
            "snapshot",
            &[json!({
                "bids": [["1999.5", "2.0"]],
                "asks": [["2000.0", "2.0"]],
                "ts": now_s() * 1000.0,
            })],
        );
    }

    fn perp_quote_fill(side: Side, size: f64, client_oid: &str, fill_id: &str) -> ExecutionEvent {
        ExecutionEvent {
            kind: InstrumentKind::PerpUsdt,
            symbol: "ETHUSDT".to_string(),
            order_id: format!("po-{fill_id}"),
            client_oid: client_oid.to_string(),
            fill_id: fill_id.to_string(),
            side,
            price: 2000.0,
            size,
            fee: 0.0,
            ts: now_s(),
            simulated: true,
        }
    }

    fn spot_hedge_fill(side: Side, size: f64, client_oid: &str, fill_id: &str) -> ExecutionEvent {
        ExecutionEvent {
            kind: InstrumentKind::Spot,
            symbol: "ETHUSDT".to_string(),
            order_id: format!("so-{fill_id}"),
            client_oid: client_oid.to_string(),
            fill_id: fill_id.to_string(),
            side,
            price: 2000.0,
            size,
            fee: 0.0,
            ts: now_s(),
            simulated: true,
        }
    }

    fn read_events(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn ticket_reasons(path: &Path, ticket_id: &str) -> Vec<String> {
        read_events(path)
            .iter()
            .filter(|rec| rec.get("ticket_id").and_then(Value::as_str) == Some(ticket_id))
            .map(|rec| rec["reason"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_happy_hedge_open_to_done() {
        let mut rig = rig(2);
        seed_spot_book(&rig.store);

        rig.oms
            .handle_fill(perp_quote_fill(Side::Buy, 0.05, "QUOTE_BID-1-aaaaaaaaaa", "t-1"))
            .await;

        assert_eq!(rig.oms.open_ticket_count(), 1);
        // perp buy leaves -0.05 to sell back on spot
        assert!((rig.oms.unhedged_qty() + 0.05).abs() < 1e-12);
        assert!(rig.oms.unhedged_since().is_some());

        let ticket = rig.oms.open_tickets().pop().unwrap();
        assert_eq!(ticket.side, Side::Sell);
        assert_eq!(ticket.tries, 1, "initial IOC attempted immediately");
        assert!((ticket.want_qty - 0.05).abs() < 1e-12);

        rig.oms
            .handle_fill(spot_hedge_fill(Side::Sell, 0.05, &ticket.ticket_id, "s-1"))
            .await;

        assert_eq!(rig.oms.open_ticket_count(), 0);
        assert!(rig.oms.unhedged_qty().abs() < 1e-12);
        assert!(rig.oms.unhedged_since().is_none());

        let reasons = ticket_reasons(&rig.orders_path, &ticket.ticket_id);
        assert_eq!(reasons, vec!["ticket_open", "ticket_order", "ticket_done"]);
    }

    #[tokio::test]
    async fn test_hedge_waits_for_book_then_chases() {
        let mut rig = rig(2);
        rig.gateway.set_book_ready(false);

        rig.oms
            .handle_fill(perp_quote_fill(Side::Sell, 0.05, "QUOTE_ASK-2-bbbbbbbbbb", "t-2"))
            .await;
        let ticket = rig.oms.open_tickets().pop().unwrap();
        assert_eq!(ticket.side, Side::Buy);
        assert_eq!(ticket.tries, 0, "no order without a spot book");

        // before the deadline nothing happens
        let bbo = Bbo {
            bid: 1999.0,
            ask: 2000.0,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: now_s(),
        };
        rig.oms
            .process_hedge_tickets(ticket.deadline_ts - 0.5, Some(&bbo), 7)
            .await;
        assert_eq!(rig.oms.open_tickets().pop().unwrap().tries, 0);

        // past the deadline: chase
        rig.oms
            .process_hedge_tickets(ticket.deadline_ts + 0.1, Some(&bbo), 7)
            .await;
        assert_eq!(rig.oms.open_tickets().pop().unwrap().tries, 1);

        rig.oms
            .handle_fill(spot_hedge_fill(Side::Buy, 0.05, &ticket.ticket_id, "s-2"))
            .await;
        assert_eq!(rig.oms.open_ticket_count(), 0);
        assert!(rig.oms.unhedged_qty().abs() < 1e-12);

        let reasons = ticket_reasons(&rig.orders_path, &ticket.ticket_id);
        assert_eq!(reasons, vec!["ticket_open", "hedge_chase", "ticket_done"]);
    }

    #[tokio::test]
    async fn test_unwind_after_tries_exhausted() {
        let mut rig = rig(2);
        rig.gateway.set_book_ready(false);

        rig.oms
            .handle_fill(perp_quote_fill(Side::Sell, 0.05, "QUOTE_ASK-3-cccccccccc", "t-3"))
            .await;
        let ticket = rig.oms.open_tickets().pop().unwrap();
        let bbo = Bbo {
            bid: 1999.0,
            ask: 2000.0,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: now_s(),
        };

        // two chases consume the retry budget, then the unwind fires
        for offset in [10.0, 20.0, 30.0] {
            rig.oms
                .process_hedge_tickets(now_s() + offset, Some(&bbo), 9)
                .await;
        }

        assert_eq!(rig.oms.open_ticket_count(), 0);
        assert!(rig.oms.unhedged_qty().abs() < 1e-12, "residual released");
        assert!(!rig.risk.lock().unwrap().is_halted(), "unwind alone never halts");

        let reasons = ticket_reasons(&rig.orders_path, &ticket.ticket_id);
        assert_eq!(
            reasons,
            vec!["ticket_open", "hedge_chase", "hedge_chase", "hedge_unwind"]
        );
        // the reduce-only close is submitted with the unwind intent
        let unwind_orders: Vec<Value> = read_events(&rig.orders_path)
            .into_iter()
            .filter(|rec| {
                rec["event"] == "order_new" && rec["intent"] == "UNWIND"
            })
            .collect();
        assert_eq!(unwind_orders.len(), 1);
        assert_eq!(unwind_orders[0]["type"], "market");
        assert_eq!(unwind_orders[0]["side"], "buy");
    }

    #[tokio::test]
    async fn test_tries_never_exceed_budget() {
        let mut rig = rig(3);
        rig.gateway.set_book_ready(false);
        rig.oms
            .handle_fill(perp_quote_fill(Side::Buy, 0.05, "QUOTE_BID-4-dddddddddd", "t-4"))
            .await;
        let ticket_id = rig.oms.open_tickets().pop().unwrap().ticket_id;
        let bbo = Bbo {
            bid: 1999.0,
            ask: 2000.0,
            bid_size: 1.0,
            ask_size: 1.0,
            ts: now_s(),
        };
        for offset in [10.0, 20.0, 30.0, 40.0, 50.0] {
            rig.oms
                .process_hedge_tickets(now_s() + offset, Some(&bbo), 11)
                .await;
        }
        let events = read_events(&rig.orders_path);
        let max_tries = events
            .iter()
            .filter(|rec| rec.get("ticket_id").and_then(Value::as_str) == Some(ticket_id.as_str()))
            .filter_map(|rec| rec.get("tries").and_then(Value::as_u64))
            .max()
            .unwrap_or(0);
        assert!(max_tries <= 3);
        assert_eq!(rig.oms.open_ticket_count(), 0);
    }

    #[tokio::test]
    async fn test_fill_after_halt_opens_and_fails_ticket() {
        let mut rig = rig(2);
        seed_spot_book(&rig.store);
        rig.risk.lock().unwrap().halt("ws_disconnect", now_s());

        rig.oms
            .handle_fill(perp_quote_fill(Side::Buy, 0.05, "QUOTE_BID-5-eeeeeeeeee", "t-5"))
            .await;

        assert_eq!(rig.oms.open_ticket_count(), 0);
        assert!(rig.oms.unhedged_qty().abs() < 1e-12);
        let events = read_events(&rig.orders_path);
        let opens = events.iter().filter(|r| r["reason"] == "ticket_open").count();
        let fails = events.iter().filter(|r| r["reason"] == "ticket_failed").count();
        assert_eq!((opens, fails), (1, 1));
        // no hedge order may follow the halt
        assert!(!events
            .iter()
            .any(|r| r["event"] == "order_new" && r["intent"] == "HEDGE"));
    }

    #[tokio::test]
    async fn test_duplicate_fill_is_ignored() {
        let mut rig = rig(2);
        seed_spot_book(&rig.store);
        let row = json!({
            "instType": "USDT-FUTURES",
            "symbol": "ETHUSDT",
            "side": "buy",
            "tradeId": "dup-1",
            "orderId": "o-dup",
            "clientOid": "QUOTE_BID-6-ffffffffff",
            "price": "2000.0",
            "baseVolume": "0.05",
            "uTime": (now_s() * 1000.0) as i64,
        });

        // same polling pattern as monitor_fills
        for _ in 0..2 {
            let event = Oms::parse_fill(&row).unwrap();
            let key = event.dedup_key();
            if rig.oms.seen_fills.contains(&key) {
                continue;
            }
            rig.oms.seen_fills.insert(key);
            rig.oms.handle_fill(event).await;
        }

        assert!((rig.oms.positions().perp_pos - 0.05).abs() < 1e-12);
        assert_eq!(rig.oms.open_ticket_count(), 1, "one ticket per fill id");
    }

    #[tokio::test]
    async fn test_spot_fill_client_oid_recovered_from_order_map() {
        let mut rig = rig(2);
        seed_spot_book(&rig.store);
        rig.oms
            .handle_fill(perp_quote_fill(Side::Buy, 0.05, "QUOTE_BID-7-gggggggggg", "t-7"))
            .await;
        let ticket = rig.oms.open_tickets().pop().unwrap();
        // the venue's spot push drops the clientOid; route via order id
        rig.oms
            .tickets
            .link_order("so-known", &ticket.ticket_id, &ticket.ticket_id);

        let mut event = spot_hedge_fill(Side::Sell, 0.05, "", "s-7");
        event.order_id = "so-known".to_string();
        rig.oms.handle_fill(event).await;

        assert_eq!(rig.oms.open_ticket_count(), 0);
        assert!(rig.oms.unhedged_qty().abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_update_quotes_blocked_without_constraints() {
        let mut rig = rig(2);
        rig.gateway
            .set_constraints_for_tests(ConstraintsRegistry::default());
        rig.oms
            .update_quotes(2000.0, 2001.0, 0.05, 0.05, 1, "quote")
            .await;
        let events = read_events(&rig.orders_path);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "order_skip");
        assert_eq!(events[0]["state"], "blocked_constraints");
    }

    #[tokio::test]
    async fn test_dry_run_quote_submission_is_logged_not_sent() {
        let mut rig = rig(2);
        rig.oms
            .update_quotes(2000.0, 2001.0, 0.05, 0.05, 3, "quote")
            .await;
        let events = read_events(&rig.orders_path);
        let news: Vec<&Value> = events.iter().filter(|r| r["event"] == "order_new").collect();
        assert_eq!(news.len(), 2);
        for rec in news {
            assert_eq!(rec["state"], "dry_run");
            assert_eq!(rec["force"], "post_only");
            assert_eq!(rec["type"], "limit");
        }
        // dry-run returns no order id, so no slot is armed
        assert!(rig.oms.quote_order(Intent::QuoteBid).is_none());
    }

    #[tokio::test]
    async fn test_undersized_quote_is_dropped_silently() {
        let mut rig = rig(2);
        // notional 2000 * 0.001 = 2.0 < min_notional 5.0
        rig.oms
            .update_quotes(2000.0, 2001.0, 0.001, 0.001, 4, "quote")
            .await;
        let events = read_events(&rig.orders_path);
        assert!(events.is_empty(), "validate failure leaves no trace");
    }
}
