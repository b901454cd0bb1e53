//! Dry-run fill injector.
//!
//! Fabricates private fill rows and pushes them into the shared store so
//! the whole ingestion path (dedup, tickets, hedging) runs exactly as it
//! would on real pushes. It produces rows and nothing else.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;

use crate::config::AppConfig;
use crate::jsonl::now_ms;
use crate::market::book;
use crate::oms::Oms;
use crate::store::DataStore;
use crate::types::{InstrumentKind, Intent, Side};

pub async fn run(
    oms: Arc<tokio::sync::Mutex<Oms>>,
    store: Arc<DataStore>,
    config: Arc<AppConfig>,
    gateway: Arc<crate::exchange::gateway::Gateway>,
) {
    let interval = Duration::from_secs_f64(config.strategy.simulate_fill_interval_sec.max(0.5));
    let mut toggle = Side::Buy;
    let mut seq: u64 = 0;
    info!(
        interval_sec = config.strategy.simulate_fill_interval_sec,
        side = %config.strategy.simulate_fill_side,
        "fill injector running"
    );

    loop {
        tokio::time::sleep(interval).await;
        seq += 1;
        let ts = now_ms();

        // Complete open hedge tickets first so the pipeline can close.
        if config.strategy.simulate_hedge_success {
            let tickets = { oms.lock().await.open_tickets() };
            for ticket in tickets {
                if ticket.remain() <= 0.0 {
                    continue;
                }
                store.push_fills(vec![json!({
                    "instType": InstrumentKind::Spot.as_str(),
                    "instId": ticket.symbol,
                    "side": ticket.side.as_str(),
                    "tradeId": format!("SIMH{ts}{seq}"),
                    "orderId": format!("SIMHO{ts}{seq}"),
                    // spot pushes normally omit the clientOid; the injected
                    // row carries it so the ticket resolves without a REST
                    // round-trip having happened
                    "clientOid": ticket.ticket_id,
                    "priceAvg": 0.0,
                    "size": ticket.remain(),
                    "uTime": ts,
                    "simulated": true,
                })]);
            }
        }

        let side = match config.strategy.simulate_fill_side.as_str() {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => {
                let side = toggle;
                toggle = toggle.opposite();
                side
            }
        };
        let intent = if side == Side::Buy {
            Intent::QuoteBid
        } else {
            Intent::QuoteAsk
        };

        let quote = { oms.lock().await.quote_order(intent) };
        let (price, size, client_oid) = match quote {
            Some(order) => {
                let size = if config.strategy.simulate_fill_qty > 0.0 {
                    config.strategy.simulate_fill_qty.min(order.size)
                } else {
                    order.size
                };
                (order.price, size, order.client_oid)
            }
            None => {
                // No resting quote (dry-run submits return no id): fill at
                // the touch with a synthetic quote oid.
                let snapshot = book::snapshot_from_store(
                    &store,
                    InstrumentKind::PerpUsdt,
                    &config.symbols.perp.symbol,
                    1,
                    &gateway.public_book_channel(),
                );
                let Some(snapshot) = snapshot else {
                    continue;
                };
                let bbo = book::bbo_from_snapshot(&snapshot);
                let price = if side == Side::Buy { bbo.bid } else { bbo.ask };
                let size = config.strategy.simulate_fill_qty;
                if size <= 0.0 {
                    continue;
                }
                (price, size, format!("{}-0-sim{seq:06}", intent.as_str()))
            }
        };

        store.push_fills(vec![json!({
            "instType": InstrumentKind::PerpUsdt.as_str(),
            "symbol": config.symbols.perp.symbol,
            "side": side.as_str(),
            "tradeId": format!("SIM{ts}{seq}"),
            "orderId": format!("SIMO{ts}{seq}"),
            "clientOid": client_oid,
            "price": price,
            "baseVolume": size,
            "uTime": ts,
            "simulated": true,
        })]);
    }
}
