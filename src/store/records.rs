//! Row types for the settlement store.
//!
//! All currency and share fields are integer micro-units.

use crate::models::Side;
use rusqlite::Row;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct MarketRow {
    pub id: i64,
    pub title: String,
    pub liquidity_pool: i64,
    pub base_liquidity_param: i64,
    pub liquidity_param: i64,
    pub resolved: bool,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MarketRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            liquidity_pool: row.get(2)?,
            base_liquidity_param: row.get(3)?,
            liquidity_param: row.get(4)?,
            resolved: row.get::<_, i64>(5)? == 1,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OptionRow {
    pub id: i64,
    pub market_id: i64,
    pub label: String,
    pub yes_quantity: i64,
    pub no_quantity: i64,
    pub resolved: bool,
    pub winning_side: Option<Side>,
    pub dispute_deadline: Option<i64>,
    pub updated_at: i64,
}

impl OptionRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let winning: Option<String> = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            market_id: row.get(1)?,
            label: row.get(2)?,
            yes_quantity: row.get(3)?,
            no_quantity: row.get(4)?,
            resolved: row.get::<_, i64>(5)? == 1,
            winning_side: winning.as_deref().and_then(Side::parse),
            dispute_deadline: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub user_id: i64,
    pub option_id: i64,
    pub yes_shares: i64,
    pub no_shares: i64,
    pub yes_cost_basis: i64,
    pub no_cost_basis: i64,
    pub realized_pnl: i64,
    pub is_claimed: bool,
    pub updated_at: i64,
}

impl PositionRow {
    pub fn empty(user_id: i64, option_id: i64) -> Self {
        Self {
            user_id,
            option_id,
            yes_shares: 0,
            no_shares: 0,
            yes_cost_basis: 0,
            no_cost_basis: 0,
            realized_pnl: 0,
            is_claimed: false,
            updated_at: 0,
        }
    }

    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            option_id: row.get(1)?,
            yes_shares: row.get(2)?,
            no_shares: row.get(3)?,
            yes_cost_basis: row.get(4)?,
            no_cost_basis: row.get(5)?,
            realized_pnl: row.get(6)?,
            is_claimed: row.get::<_, i64>(7)? == 1,
            updated_at: row.get(8)?,
        })
    }

    pub fn shares(&self, side: Side) -> i64 {
        match side {
            Side::Yes => self.yes_shares,
            Side::No => self.no_shares,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalletRow {
    pub user_id: i64,
    pub balance: i64,
    pub deposit_address: Option<String>,
    pub custodial_account: Option<String>,
    pub last_deposit_signature: Option<String>,
    pub updated_at: i64,
}

impl WalletRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            balance: row.get(1)?,
            deposit_address: row.get(2)?,
            custodial_account: row.get(3)?,
            last_deposit_signature: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
            WithdrawalStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalRow {
    pub id: String,
    pub user_id: i64,
    pub destination: String,
    pub amount: i64,
    pub status: WithdrawalStatus,
    pub idempotency_key: String,
    pub job_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WithdrawalRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: String = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            destination: row.get(2)?,
            amount: row.get(3)?,
            status: WithdrawalStatus::parse(&status).unwrap_or(WithdrawalStatus::Failed),
            idempotency_key: row.get(5)?,
            job_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DepositRow {
    pub id: String,
    pub user_id: i64,
    pub signature: String,
    pub amount: i64,
    pub source_address: Option<String>,
    pub status: String,
    pub created_at: i64,
}

impl DepositRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            signature: row.get(2)?,
            amount: row.get(3)?,
            source_address: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStatus {
    Pending,
    Completed,
    Failed,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStatus::Pending => "pending",
            SweepStatus::Completed => "completed",
            SweepStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepRow {
    pub id: String,
    pub deposit_id: String,
    pub source_address: String,
    pub destination_address: String,
    pub amount: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SweepRow {
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            deposit_id: row.get(1)?,
            source_address: row.get(2)?,
            destination_address: row.get(3)?,
            amount: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}
