//! Cubic bonding-curve pricing for creator keys.
//!
//! Integer-exact arithmetic: costs are rational in the whole-key supply, so
//! everything is computed in i128 and floored once at the micro-unit
//! boundary.

use crate::models::MICRO;

/// Curve divisor. Buying from supply `s` to `s + n` costs
/// `((s+n)^3 - s^3) / 48000` currency units.
const CURVE_DIVISOR: i128 = 48_000;

fn cubed(v: i64) -> i128 {
    let v = v as i128;
    v * v * v
}

/// Spot price of the next key at the given supply, in micro-units.
/// `key_price(s) = s^2 / 16000` (the curve's marginal rate).
pub fn key_price_micro(supply: i64) -> i64 {
    let s = supply as i128;
    ((s * s * MICRO as i128) / 16_000) as i64
}

/// Cost of buying `n` keys at `supply` outstanding, in micro-units.
pub fn key_buy_cost_micro(supply: i64, n: i64) -> i64 {
    if n <= 0 {
        return 0;
    }
    let raw = cubed(supply + n) - cubed(supply);
    ((raw * MICRO as i128) / CURVE_DIVISOR) as i64
}

/// Payout for selling `n` keys at `supply` outstanding, in micro-units.
pub fn key_sell_payout_micro(supply: i64, n: i64) -> i64 {
    if n <= 0 || n > supply {
        return 0;
    }
    let raw = cubed(supply) - cubed(supply - n);
    ((raw * MICRO as i128) / CURVE_DIVISOR) as i64
}
