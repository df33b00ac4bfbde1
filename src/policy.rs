// ===============================
// src/policy.rs (sentiment -> action)
// ===============================
//
// Decision policy: fungsi murni (agg sentiment, last price, cash, holding)
// -> aksi buy/sell/hold + qty. Tanpa I/O, tanpa state tersembunyi.
//
// Aturan dievaluasi berurutan, first match wins:
// 1) tanpa harga           -> hold ("no_price")
// 2) sentimen >= +0.20     -> buy  0.1% dari cash / harga
// 3) sentimen <= -0.20 dan ada holding -> sell 50% holding
// 4) selain itu            -> hold ("no_signal")
//
use crate::domain::{round8, Action, Decision};

pub const BUY_THRESHOLD: f64 = 0.20;
pub const SELL_THRESHOLD: f64 = -0.20;
/// Fraksi cash per buy (0.001 = 0.1%)
pub const POSITION_FRACTION: f64 = 0.001;
/// Fraksi holding yang dijual per sinyal negatif
pub const SELL_FRACTION: f64 = 0.5;

pub fn decide(agg_sentiment: f64, last_price: f64, cash: f64, held_qty: f64) -> Decision {
    if !last_price.is_finite() || last_price <= 0.0 {
        return Decision { action: Action::Hold, qty: 0.0, reason: "no_price".to_string() };
    }

    if agg_sentiment >= BUY_THRESHOLD {
        let qty = round8(cash * POSITION_FRACTION / last_price);
        if qty > 0.0 {
            return Decision {
                action: Action::Buy,
                qty,
                reason: format!("agg_sentiment={agg_sentiment}"),
            };
        }
    }

    if agg_sentiment <= SELL_THRESHOLD && held_qty > 0.0 {
        let qty = round8(held_qty * SELL_FRACTION);
        return Decision {
            action: Action::Sell,
            qty,
            reason: format!("agg_sentiment={agg_sentiment}"),
        };
    }

    Decision { action: Action::Hold, qty: 0.0, reason: "no_signal".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buys_exactly_at_threshold() {
        let d = decide(0.20, 100.0, 100_000.0, 0.0);
        assert_eq!(d.action, Action::Buy);
        assert!((d.qty - 1.0).abs() < 1e-12);
    }

    #[test]
    fn holds_just_below_threshold() {
        let d = decide(0.1999, 100.0, 100_000.0, 0.0);
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.qty, 0.0);
        assert_eq!(d.reason, "no_signal");
    }

    #[test]
    fn sells_half_of_holdings() {
        let d = decide(-0.20, 100.0, 0.0, 5.0);
        assert_eq!(d.action, Action::Sell);
        assert!((d.qty - 2.5).abs() < 1e-12);
    }

    #[test]
    fn negative_sentiment_without_holdings_holds() {
        let d = decide(-0.9, 100.0, 50_000.0, 0.0);
        assert_eq!(d.action, Action::Hold);
    }

    #[test]
    fn missing_price_always_holds() {
        for s in [-1.0, -0.5, 0.0, 0.5, 1.0] {
            let d = decide(s, 0.0, 100_000.0, 10.0);
            assert_eq!(d.action, Action::Hold);
            assert_eq!(d.reason, "no_price");
        }
        let d = decide(0.9, f64::NAN, 100_000.0, 0.0);
        assert_eq!(d.reason, "no_price");
    }

    #[test]
    fn qty_is_rounded_to_8_decimals() {
        let d = decide(0.5, 3.0, 10_000.0, 0.0);
        assert_eq!(d.action, Action::Buy);
        // 10 / 3 dibulatkan ke 8 desimal
        assert_eq!(d.qty, round8(10.0 / 3.0));
        let s = format!("{:.10}", d.qty);
        assert!(s.ends_with("00"));
    }

    #[test]
    fn pure_same_inputs_same_output() {
        let a = decide(0.42, 123.45, 9_876.5, 1.5);
        let b = decide(0.42, 123.45, 9_876.5, 1.5);
        assert_eq!(a.action, b.action);
        assert_eq!(a.qty, b.qty);
        assert_eq!(a.reason, b.reason);
    }
}
