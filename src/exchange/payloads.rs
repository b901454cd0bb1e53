//! REST payload shapes for the two instrument kinds.
//!
//! Spot and perp disagree on field names (`force` vs `timeInForceValue`) and
//! on which margin fields exist; keeping the divergence here keeps the OMS
//! free of wire concerns.

use serde_json::{json, Map, Value};

use crate::config::SymbolConfig;
use crate::constraints::InstrumentConstraints;
use crate::types::{InstrumentKind, OrderRequest};

fn format_price(constraints: Option<&InstrumentConstraints>, price: f64) -> String {
    match constraints {
        Some(c) if c.tick_size > 0.0 => c.format_price(price),
        _ => price.to_string(),
    }
}

fn format_qty(constraints: Option<&InstrumentConstraints>, qty: f64) -> String {
    match constraints {
        Some(c) if c.qty_step > 0.0 => c.format_qty(qty),
        _ => qty.to_string(),
    }
}

pub fn place_order(
    req: &OrderRequest,
    perp: &SymbolConfig,
    constraints: Option<&InstrumentConstraints>,
) -> Value {
    let mut data = Map::new();
    data.insert("symbol".to_string(), json!(req.symbol));
    data.insert("side".to_string(), json!(req.side.as_str()));
    data.insert("orderType".to_string(), json!(req.order_type.as_str()));
    data.insert("size".to_string(), json!(format_qty(constraints, req.size)));
    data.insert("clientOid".to_string(), json!(req.client_oid));
    if let Some(price) = req.price {
        data.insert("price".to_string(), json!(format_price(constraints, price)));
    }

    match req.kind {
        InstrumentKind::Spot => {
            data.insert("force".to_string(), json!(req.force.as_str()));
        }
        InstrumentKind::PerpUsdt => {
            data.insert("productType".to_string(), json!(perp.product_type));
            data.insert("marginMode".to_string(), json!(perp.margin_mode));
            data.insert("marginCoin".to_string(), json!(perp.margin_coin));
            data.insert("timeInForceValue".to_string(), json!(req.force.as_str()));
            if let Some(reduce_only) = req.reduce_only {
                data.insert(
                    "reduceOnly".to_string(),
                    json!(if reduce_only { "YES" } else { "NO" }),
                );
            }
        }
    }
    Value::Object(data)
}

pub fn cancel_order(
    kind: InstrumentKind,
    symbol: &str,
    perp: &SymbolConfig,
    order_id: Option<&str>,
    client_oid: Option<&str>,
) -> Value {
    let mut data = Map::new();
    data.insert("symbol".to_string(), json!(symbol));
    if kind == InstrumentKind::PerpUsdt {
        data.insert("productType".to_string(), json!(perp.product_type));
    }
    if let Some(order_id) = order_id.filter(|id| !id.is_empty()) {
        data.insert("orderId".to_string(), json!(order_id));
    }
    if let Some(client_oid) = client_oid.filter(|id| !id.is_empty()) {
        data.insert("clientOid".to_string(), json!(client_oid));
    }
    Value::Object(data)
}

pub fn place_path(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Spot => "/api/v2/spot/trade/place-order",
        InstrumentKind::PerpUsdt => "/api/v2/mix/order/place-order",
    }
}

pub fn cancel_path(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Spot => "/api/v2/spot/trade/cancel-order",
        InstrumentKind::PerpUsdt => "/api/v2/mix/order/cancel-order",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Intent, OrderType, Side, TimeInForce};

    fn perp_symbol() -> SymbolConfig {
        SymbolConfig {
            inst_type: "USDT-FUTURES".to_string(),
            symbol: "ETHUSDT".to_string(),
            product_type: Some("USDT-FUTURES".to_string()),
            margin_mode: Some("isolated".to_string()),
            margin_coin: Some("USDT".to_string()),
        }
    }

    fn constraints() -> InstrumentConstraints {
        InstrumentConstraints {
            tick_size: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        }
    }

    fn req(kind: InstrumentKind) -> OrderRequest {
        OrderRequest {
            kind,
            symbol: "ETHUSDT".to_string(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            size: 0.05,
            force: TimeInForce::PostOnly,
            client_oid: "QUOTE_ASK-3-abc".to_string(),
            intent: Intent::QuoteAsk,
            cycle_id: 3,
            price: Some(2001.2),
            reduce_only: None,
        }
    }

    #[test]
    fn test_perp_place_field_shape() {
        let payload = place_order(&req(InstrumentKind::PerpUsdt), &perp_symbol(), Some(&constraints()));
        assert_eq!(payload["timeInForceValue"], "post_only");
        assert_eq!(payload["marginMode"], "isolated");
        assert_eq!(payload["marginCoin"], "USDT");
        assert_eq!(payload["price"], "2001.20");
        assert_eq!(payload["size"], "0.050");
        assert!(payload.get("force").is_none());
    }

    #[test]
    fn test_spot_place_field_shape() {
        let payload = place_order(&req(InstrumentKind::Spot), &perp_symbol(), Some(&constraints()));
        assert_eq!(payload["force"], "post_only");
        assert!(payload.get("timeInForceValue").is_none());
        assert!(payload.get("productType").is_none());
    }

    #[test]
    fn test_reduce_only_encoding() {
        let mut request = req(InstrumentKind::PerpUsdt);
        request.order_type = OrderType::Market;
        request.price = None;
        request.reduce_only = Some(true);
        let payload = place_order(&request, &perp_symbol(), Some(&constraints()));
        assert_eq!(payload["reduceOnly"], "YES");
        assert!(payload.get("price").is_none());
    }

    #[test]
    fn test_cancel_payload_skips_empty_ids() {
        let payload = cancel_order(
            InstrumentKind::PerpUsdt,
            "ETHUSDT",
            &perp_symbol(),
            Some(""),
            Some("QUOTE_BID-1-xyz"),
        );
        assert!(payload.get("orderId").is_none());
        assert_eq!(payload["clientOid"], "QUOTE_BID-1-xyz");
        assert_eq!(payload["productType"], "USDT-FUTURES");
    }
}
