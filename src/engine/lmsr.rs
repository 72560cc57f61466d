//! Logarithmic market scoring rule pricing.
//!
//! Pure functions over micro-unit share quantities and a pre-scaled
//! liquidity parameter `b`. The caller scales `b` to micro-unit magnitudes;
//! rescaling here would silently desynchronize price from previously quoted
//! values, so this module never touches it.

use crate::models::Side;

/// Exponent clamp keeping e^x finite and the price well away from 0/1.
const EXP_CLAMP: f64 = 20.0;

/// Price clamp for unresolved options. Exact 0/1 prices would freeze
/// trading on one side of the book.
const PRICE_MIN: f64 = 0.001;
const PRICE_MAX: f64 = 0.999;

/// Instantaneous yes-price for an unresolved option.
///
/// `price(q_yes, q_no, b) = 1 / (1 + e^((q_no - q_yes)/b))`, clamped to
/// `[0.001, 0.999]`.
pub fn price(q_yes: i64, q_no: i64, b: f64) -> f64 {
    let exponent = ((q_no - q_yes) as f64 / b).clamp(-EXP_CLAMP, EXP_CLAMP);
    let p = 1.0 / (1.0 + exponent.exp());
    p.clamp(PRICE_MIN, PRICE_MAX)
}

/// Price of a resolved option: exactly 1 for the winning side, 0 otherwise.
pub fn resolved_price(winning_side: Side, side: Side) -> f64 {
    if winning_side == side {
        1.0
    } else {
        0.0
    }
}

/// Scoring-rule potential in micro-units, in the numerically stable form
/// `max(q_yes, q_no) + b * ln(1 + e^(-|q_yes - q_no|/b))`.
pub fn cost(q_yes: i64, q_no: i64, b: f64) -> f64 {
    let hi = q_yes.max(q_no) as f64;
    let gap = (q_yes - q_no).abs() as f64;
    hi + b * (-gap / b).exp().ln_1p()
}

/// Cost of moving quantities from `(q_yes, q_no)` to
/// `(q_yes + add_yes, q_no + add_no)`, floored at zero and rounded up to
/// whole micro-units (rounding residue goes to the platform).
pub fn buy_cost_micro(q_yes: i64, q_no: i64, add_yes: i64, add_no: i64, b: f64) -> i64 {
    let raw = cost(q_yes + add_yes, q_no + add_no, b) - cost(q_yes, q_no, b);
    if raw <= 0.0 {
        return 0;
    }
    raw.ceil() as i64
}

/// Payout for moving quantities from `(q_yes, q_no)` down to
/// `(q_yes - sub_yes, q_no - sub_no)`, floored at zero and rounded down.
pub fn sell_payout_micro(q_yes: i64, q_no: i64, sub_yes: i64, sub_no: i64, b: f64) -> i64 {
    let raw = cost(q_yes, q_no, b) - cost(q_yes - sub_yes, q_no - sub_no, b);
    if raw <= 0.0 {
        return 0;
    }
    raw.floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MICRO;

    // 10 units pre-scaled to micro-quantities; trades of a few shares sit
    // in the near-linear region of the curve.
    const B: f64 = 10_000_000.0;

    #[test]
    fn empty_market_prices_at_exactly_half() {
        assert_eq!(price(0, 0, B), 0.5);
        assert_eq!(price(0, 0, 100_000.0), 0.5);
    }

    #[test]
    fn price_stays_in_clamped_bounds() {
        for (qy, qn) in [
            (0i64, 0i64),
            (1_000_000, 0),
            (0, 1_000_000),
            (50_000_000, 10),
            (10, 50_000_000),
            (123_456, 654_321),
        ] {
            let p = price(qy, qn, B);
            assert!((0.001..=0.999).contains(&p), "price {} out of bounds", p);
        }
    }

    #[test]
    fn complementary_prices_sum_to_one() {
        for (qy, qn) in [(0i64, 0i64), (250_000, 100_000), (5_000_000, 4_000_000)] {
            let sum = price(qy, qn, B) + price(qn, qy, B);
            assert!((sum - 1.0).abs() < 1e-9, "sum {}", sum);
        }
    }

    #[test]
    fn deep_imbalance_does_not_overflow() {
        // Exponent clamp keeps the extreme regions finite.
        let p = price(i64::MAX / 4, 0, B);
        assert!(p.is_finite());
        assert!(p <= 0.999);
    }

    #[test]
    fn resolved_option_prices_at_unit_bounds() {
        assert_eq!(resolved_price(Side::Yes, Side::Yes), 1.0);
        assert_eq!(resolved_price(Side::Yes, Side::No), 0.0);
        assert_eq!(resolved_price(Side::No, Side::No), 1.0);
    }

    #[test]
    fn buy_cost_is_positive_and_grows_with_size() {
        let small = buy_cost_micro(0, 0, MICRO, 0, B);
        let large = buy_cost_micro(0, 0, 10 * MICRO, 0, B);
        assert!(small > 0);
        assert!(large > small);
        // Around an empty market the marginal price is ~0.5, so a 1-share
        // buy should cost roughly half a unit.
        assert!((small - MICRO / 2).abs() < MICRO / 10, "cost {}", small);
    }

    #[test]
    fn immediate_round_trip_never_profits() {
        let qy = 3 * MICRO;
        let qn = 2 * MICRO;
        let n = 2 * MICRO;
        let cost = buy_cost_micro(qy, qn, n, 0, B);
        let payout = sell_payout_micro(qy + n, qn, n, 0, B);
        assert!(payout <= cost, "payout {} > cost {}", payout, cost);
    }

    #[test]
    fn sell_payout_floors_at_zero() {
        // Selling the cheap side of a deeply lopsided book can price near
        // zero; the payout must never go negative.
        assert!(sell_payout_micro(0, 40 * MICRO, 0, 0, B) >= 0);
    }

    #[test]
    fn cost_is_symmetric_in_outcomes() {
        let a = cost(7 * MICRO, 2 * MICRO, B);
        let b = cost(2 * MICRO, 7 * MICRO, B);
        assert!((a - b).abs() < 1e-6);
    }
}
