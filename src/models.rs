use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One currency unit (or one whole share) expressed in micro-units.
pub const MICRO: i64 = 1_000_000;

/// Minimum chargeable trade cost: 0.01 currency units.
pub const MIN_TRADE_COST_MICRO: i64 = 10_000;

/// Outcome side of a binary option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

/// Events pushed to websocket subscribers after a transaction commits.
/// Best-effort delivery; a dropped receiver never affects settlement.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    Trade(TradeBroadcast),
    Price(PriceBroadcast),
    Balance(BalanceBroadcast),
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeBroadcast {
    pub market_id: i64,
    pub option_id: i64,
    pub user_id: i64,
    pub kind: String,
    pub yes_amount: i64,
    pub no_amount: i64,
    pub total_micro: i64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceBroadcast {
    pub market_id: i64,
    pub option_id: i64,
    pub yes_price: f64,
    pub no_price: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceBroadcast {
    pub user_id: i64,
    pub balance_micro: i64,
    pub ts: i64,
}

/// Closed set of activity payloads. Each settlement event type has its own
/// variant so the payload contract is statically checkable instead of an
/// open JSON map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityEvent {
    Buy {
        market_id: i64,
        option_id: i64,
        yes_amount: i64,
        no_amount: i64,
        cost_micro: i64,
        fee_micro: i64,
    },
    Sell {
        market_id: i64,
        option_id: i64,
        yes_amount: i64,
        no_amount: i64,
        payout_micro: i64,
        fee_micro: i64,
        realized_pnl_micro: i64,
    },
    Claim {
        market_id: i64,
        option_id: i64,
        winning_side: Side,
        payout_micro: i64,
    },
    WithdrawalRequested {
        withdrawal_id: String,
        amount_micro: i64,
        destination: String,
    },
    WithdrawalCompleted {
        withdrawal_id: String,
        amount_micro: i64,
    },
    WithdrawalFailed {
        withdrawal_id: String,
        amount_micro: i64,
        refunded: bool,
    },
    WithdrawalCancelled {
        withdrawal_id: String,
        refunded_micro: i64,
    },
    DepositCredited {
        deposit_id: String,
        signature: String,
        amount_micro: i64,
    },
    ResolutionPayout {
        option_id: i64,
        winning_side: Side,
        payout_micro: i64,
    },
    ResolutionLoss {
        option_id: i64,
        winning_side: Side,
    },
}

/// Activity row as returned by the store.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRecord {
    pub id: String,
    pub ts: i64,
    pub user_id: i64,
    pub event: ActivityEvent,
}

/// Application configuration, environment-driven with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    // Fee rates in basis points
    pub protocol_fee_bps: u32,
    pub creator_fee_bps: u32,
    pub lp_fee_bps: u32,

    // Trade limits (settlement currency, micro-units)
    pub per_trade_limit_micro: i64,
    pub per_market_user_limit_micro: i64,
    pub trade_queue_timeout_secs: u64,

    // Withdrawal pipeline
    pub min_withdrawal_micro: i64,
    pub max_withdrawal_micro: i64,
    pub withdrawal_cooldown_secs: i64,
    pub withdrawal_duplicate_window_secs: i64,

    // Deposit monitor
    pub deposit_poll_secs: u64,
    pub deposit_min_micro: i64,
    pub deposit_hourly_cap: i64,
    pub deposit_catchup_limit: usize,
    pub deposit_page_limit: usize,

    // Resolution payout processor
    pub payout_poll_secs: u64,
    pub payout_batch_limit: usize,

    // External collaborators
    pub custodial_api_url: String,
    pub custodial_api_key: Option<String>,
    pub custodial_hot_account: String,
    pub ledger_rpc_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env_or("DB_PATH", "./oddsmill.db"),
            port: parse_or("PORT", 3000),

            protocol_fee_bps: parse_or("PROTOCOL_FEE_BPS", 100),
            creator_fee_bps: parse_or("CREATOR_FEE_BPS", 50),
            lp_fee_bps: parse_or("LP_FEE_BPS", 50),

            per_trade_limit_micro: parse_or("PER_TRADE_LIMIT_MICRO", 1_000 * MICRO),
            per_market_user_limit_micro: parse_or("PER_MARKET_USER_LIMIT_MICRO", 10_000 * MICRO),
            trade_queue_timeout_secs: parse_or("TRADE_QUEUE_TIMEOUT_SECS", 30),

            min_withdrawal_micro: parse_or("MIN_WITHDRAWAL_MICRO", MIN_TRADE_COST_MICRO),
            max_withdrawal_micro: parse_or("MAX_WITHDRAWAL_MICRO", 10_000 * MICRO),
            withdrawal_cooldown_secs: parse_or("WITHDRAWAL_COOLDOWN_SECS", 60),
            withdrawal_duplicate_window_secs: parse_or("WITHDRAWAL_DUPLICATE_WINDOW_SECS", 600),

            deposit_poll_secs: parse_or("DEPOSIT_POLL_SECS", 30),
            deposit_min_micro: parse_or("DEPOSIT_MIN_MICRO", MIN_TRADE_COST_MICRO),
            deposit_hourly_cap: parse_or("DEPOSIT_HOURLY_CAP", 12),
            deposit_catchup_limit: parse_or("DEPOSIT_CATCHUP_LIMIT", 1000),
            deposit_page_limit: parse_or("DEPOSIT_PAGE_LIMIT", 100),

            payout_poll_secs: parse_or("PAYOUT_POLL_SECS", 60),
            payout_batch_limit: parse_or("PAYOUT_BATCH_LIMIT", 25),

            custodial_api_url: env_or("CUSTODIAL_API_URL", "http://localhost:9010"),
            custodial_api_key: std::env::var("CUSTODIAL_API_KEY").ok(),
            custodial_hot_account: env_or("CUSTODIAL_HOT_ACCOUNT", "hot-account"),
            ledger_rpc_url: env_or("LEDGER_RPC_URL", "http://localhost:8899"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Format a micro-unit amount as a decimal string for logs and responses.
pub fn micro_to_display(micro: i64) -> String {
    let sign = if micro < 0 { "-" } else { "" };
    let abs = micro.unsigned_abs();
    format!("{}{}.{:06}", sign, abs / MICRO as u64, abs % MICRO as u64)
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micro_display_is_six_digit_fixed() {
        assert_eq!(micro_to_display(1_000_000), "1.000000");
        assert_eq!(micro_to_display(10_000), "0.010000");
        assert_eq!(micro_to_display(-2_500_000), "-2.500000");
    }

    #[test]
    fn activity_event_round_trips_tagged_json() {
        let event = ActivityEvent::Claim {
            market_id: 7,
            option_id: 9,
            winning_side: Side::Yes,
            payout_micro: 5 * MICRO,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"claim\""));
        let back: ActivityEvent = serde_json::from_str(&json).unwrap();
        match back {
            ActivityEvent::Claim { payout_micro, .. } => assert_eq!(payout_micro, 5 * MICRO),
            _ => panic!("wrong variant"),
        }
    }
}
