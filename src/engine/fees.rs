//! Basis-point fee splitting.
//!
//! The total and each component are floored independently; the component
//! sum can therefore undershoot the total by a few micro-units, and the
//! protocol bucket absorbs that residue.

use serde::Serialize;

const BPS_DENOMINATOR: i128 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct FeeRates {
    pub protocol_bps: u32,
    pub creator_bps: u32,
    pub lp_bps: u32,
}

impl FeeRates {
    pub fn total_bps(&self) -> u32 {
        self.protocol_bps + self.creator_bps + self.lp_bps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSplit {
    pub total: i64,
    pub protocol: i64,
    pub creator: i64,
    pub lp: i64,
}

fn floor_bps(amount: i64, bps: u32) -> i64 {
    ((amount as i128 * bps as i128) / BPS_DENOMINATOR) as i64
}

/// Split a gross micro-unit amount into fee components.
pub fn split(amount: i64, rates: &FeeRates) -> FeeSplit {
    let amount = amount.max(0);
    let total = floor_bps(amount, rates.total_bps());
    let creator = floor_bps(amount, rates.creator_bps);
    let lp = floor_bps(amount, rates.lp_bps);
    FeeSplit {
        total,
        protocol: total - creator - lp,
        creator,
        lp,
    }
}
