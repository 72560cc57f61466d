//! String-level decimal amount parsing.
//!
//! Requested amounts arrive as decimal strings and are converted straight
//! to integer micro-units. Floating point never touches the value: a float
//! round-trip can silently shave micro-units off the user's money.

use crate::errors::{EngineError, EngineResult};
use crate::models::MICRO;

const MAX_FRACTION_DIGITS: usize = 6;

/// Parse a decimal string into micro-units.
///
/// Accepts `"12"`, `"12.5"`, `"0.000001"`. Rejects empty input, signs,
/// exponents, more than six fractional digits, and anything that would
/// lose precision.
pub fn parse_amount_micro(input: &str) -> EngineResult<i64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(EngineError::Validation("amount is empty".into()));
    }
    if s.starts_with('+') || s.starts_with('-') {
        return Err(EngineError::Validation("amount must be unsigned".into()));
    }

    let (whole, fraction) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(EngineError::Validation("amount is malformed".into()));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return Err(EngineError::Validation(format!("amount {s:?} is not a decimal number")));
    }
    if fraction.len() > MAX_FRACTION_DIGITS {
        return Err(EngineError::Precision(format!(
            "more than {MAX_FRACTION_DIGITS} fractional digits"
        )));
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse()
            .map_err(|_| EngineError::Validation("amount too large".into()))?
    };

    let mut frac_micro: i64 = 0;
    if !fraction.is_empty() {
        let parsed: i64 = fraction
            .parse()
            .map_err(|_| EngineError::Validation("amount fraction malformed".into()))?;
        frac_micro = parsed * 10_i64.pow((MAX_FRACTION_DIGITS - fraction.len()) as u32);
    }

    whole
        .checked_mul(MICRO)
        .and_then(|w| w.checked_add(frac_micro))
        .ok_or_else(|| EngineError::Validation("amount too large".into()))
}

/// Bounds check shared by the withdrawal pipeline.
pub fn check_bounds(amount_micro: i64, min: i64, max: i64) -> EngineResult<()> {
    if amount_micro < min {
        return Err(EngineError::Validation(format!(
            "amount below minimum of {} micro-units",
            min
        )));
    }
    if amount_micro > max {
        return Err(EngineError::Validation(format!(
            "amount above maximum of {} micro-units",
            max
        )));
    }
    Ok(())
}
