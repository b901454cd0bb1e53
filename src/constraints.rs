//! Instrument trading constraints: tick/step normalization and order
//! validation, plus the registry covering both legs.

use crate::types::InstrumentKind;

/// Guards float division error when flooring to a step: a value that is an
/// exact multiple of the step must survive a second adjustment unchanged.
const STEP_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstrumentConstraints {
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_qty: f64,
    pub min_notional: f64,
}

impl InstrumentConstraints {
    pub fn is_ready(&self) -> bool {
        self.tick_size > 0.0 && self.qty_step > 0.0 && self.min_qty > 0.0 && self.min_notional > 0.0
    }

    /// Floor to the quantity step. Idempotent.
    pub fn adjust_qty(&self, qty: f64) -> f64 {
        if self.qty_step <= 0.0 {
            return qty;
        }
        (qty / self.qty_step + STEP_EPS).floor() * self.qty_step
    }

    /// Floor to the price tick. Idempotent.
    pub fn adjust_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        (price / self.tick_size + STEP_EPS).floor() * self.tick_size
    }

    pub fn validate(&self, price: f64, qty: f64) -> bool {
        if qty < self.min_qty {
            return false;
        }
        if self.min_notional > 0.0 && price * qty < self.min_notional {
            return false;
        }
        true
    }

    /// Decimal places implied by the price tick, for wire formatting.
    pub fn price_decimals(&self) -> usize {
        decimals_for_step(self.tick_size)
    }

    pub fn qty_decimals(&self) -> usize {
        decimals_for_step(self.qty_step)
    }

    pub fn format_price(&self, price: f64) -> String {
        format!("{:.*}", self.price_decimals(), price)
    }

    pub fn format_qty(&self, qty: f64) -> String {
        format!("{:.*}", self.qty_decimals(), qty)
    }
}

/// Number of decimal places needed to print a multiple of `step` exactly.
/// Steps are powers of ten or small multiples thereof on Bitget (0.01, 0.1,
/// 5.0, ...); anything coarser than 1.0 needs none.
fn decimals_for_step(step: f64) -> usize {
    if step <= 0.0 || step >= 1.0 {
        return 0;
    }
    let places = (-step.log10()).ceil() as i64;
    places.clamp(0, 12) as usize
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintsRegistry {
    pub spot: Option<InstrumentConstraints>,
    pub perp: Option<InstrumentConstraints>,
}

impl ConstraintsRegistry {
    pub fn ready(&self) -> bool {
        matches!((&self.spot, &self.perp), (Some(s), Some(p)) if s.is_ready() && p.is_ready())
    }

    pub fn get(&self, kind: InstrumentKind) -> Option<InstrumentConstraints> {
        match kind {
            InstrumentKind::Spot => self.spot,
            InstrumentKind::PerpUsdt => self.perp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c() -> InstrumentConstraints {
        InstrumentConstraints {
            tick_size: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
        }
    }

    #[test]
    fn test_ready_requires_all_positive() {
        assert!(c().is_ready());
        let mut bad = c();
        bad.min_notional = 0.0;
        assert!(!bad.is_ready());
        assert!(!InstrumentConstraints::default().is_ready());
    }

    #[test]
    fn test_adjust_floors() {
        let c = c();
        assert!((c.adjust_price(2001.239) - 2001.23).abs() < 1e-9);
        assert!((c.adjust_qty(0.0529) - 0.052).abs() < 1e-9);
    }

    #[test]
    fn test_adjust_idempotent() {
        let c = InstrumentConstraints {
            tick_size: 0.1,
            qty_step: 0.1,
            min_qty: 0.1,
            min_notional: 1.0,
        };
        for raw in [0.3, 0.7, 1.0, 123.456, 2000.05] {
            let once = c.adjust_price(raw);
            assert!((c.adjust_price(once) - once).abs() < 1e-12, "price {raw}");
            let once = c.adjust_qty(raw);
            assert!((c.adjust_qty(once) - once).abs() < 1e-12, "qty {raw}");
        }
    }

    #[test]
    fn test_validate_min_qty_and_notional() {
        let c = c();
        assert!(c.validate(2000.0, 0.01));
        assert!(!c.validate(2000.0, 0.0001)); // below min_qty
        assert!(!c.validate(10.0, 0.01)); // notional 0.1 < 5.0
    }

    #[test]
    fn test_adjusted_order_still_validates() {
        let c = c();
        let px = c.adjust_price(2000.456);
        let qty = c.adjust_qty(0.0525);
        assert!(c.validate(px, qty));
        assert!(px * qty >= c.min_notional);
    }

    #[test]
    fn test_format_uses_step_decimals() {
        let c = c();
        assert_eq!(c.format_price(2001.2), "2001.20");
        assert_eq!(c.format_qty(0.05), "0.050");
        let coarse = InstrumentConstraints {
            tick_size: 1.0,
            qty_step: 5.0,
            min_qty: 5.0,
            min_notional: 5.0,
        };
        assert_eq!(coarse.format_price(2001.0), "2001");
        assert_eq!(coarse.format_qty(10.0), "10");
    }

    #[test]
    fn test_registry_ready_needs_both_legs() {
        let mut reg = ConstraintsRegistry::default();
        assert!(!reg.ready());
        reg.spot = Some(c());
        assert!(!reg.ready());
        reg.perp = Some(c());
        assert!(reg.ready());
        assert_eq!(reg.get(InstrumentKind::Spot), Some(c()));
    }
}
