//! Settlement engine error taxonomy.
//!
//! Business rejections carry the data a caller needs to react (shortfall
//! amounts, remaining wait times, the colliding record). `Busy` is internal:
//! the store layer retries it with backoff and it never reaches a response.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input. Surfaced immediately, no retry.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Wallet balance cannot cover the debit.
    #[error("insufficient balance: short {shortfall} micro-units")]
    InsufficientBalance { shortfall: i64 },

    /// Position does not hold the requested shares.
    #[error("insufficient shares: short {shortfall} micro-shares")]
    InsufficientShares { shortfall: i64 },

    /// Market liquidity pool cannot cover the payout.
    #[error("insufficient liquidity: short {shortfall} micro-units")]
    InsufficientLiquidity { shortfall: i64 },

    /// Idempotency collision. Carries the existing record so the caller can
    /// poll it instead of retrying.
    #[error("duplicate request: existing {existing_id} is {existing_status}")]
    DuplicateRequest {
        existing_id: String,
        existing_status: String,
    },

    /// Temporary throttle with the remaining wait.
    #[error("rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },

    /// Cooldown between successive operations has not elapsed.
    #[error("cooldown active, {remaining_secs}s remaining")]
    Cooldown { remaining_secs: i64 },

    /// Claim attempted before the dispute deadline.
    #[error("dispute window open, {remaining_secs}s remaining")]
    DisputeWindowOpen { remaining_secs: i64 },

    /// The position was already claimed.
    #[error("position already claimed")]
    AlreadyClaimed,

    /// Withdrawal/sweep dependency is down.
    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),

    /// Amount cannot be represented exactly in micro-units.
    #[error("precision loss: {0}")]
    Precision(String),

    /// Trade could not enter its serialization queue within the timeout.
    #[error("trade queue timeout after {timeout_secs}s")]
    QueueTimeout { timeout_secs: u64 },

    /// Store contention. Retried transparently by the transaction helper;
    /// never surfaced to callers.
    #[error("store busy")]
    Busy,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// True for contention errors the store layer should retry.
    pub fn is_busy(&self) -> bool {
        match self {
            EngineError::Busy => true,
            EngineError::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Machine-readable code used in API responses and activity rows.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::InsufficientShares { .. } => "insufficient_shares",
            EngineError::InsufficientLiquidity { .. } => "insufficient_liquidity",
            EngineError::DuplicateRequest { .. } => "duplicate_request",
            EngineError::RateLimited { .. } => "rate_limited",
            EngineError::Cooldown { .. } => "cooldown",
            EngineError::DisputeWindowOpen { .. } => "dispute_window_open",
            EngineError::AlreadyClaimed => "already_claimed",
            EngineError::ExternalServiceUnavailable(_) => "external_service_unavailable",
            EngineError::Precision(_) => "precision_error",
            EngineError::QueueTimeout { .. } => "queue_timeout",
            EngineError::Busy => "busy",
            EngineError::Storage(_) => "storage_error",
            EngineError::Internal(_) => "internal_error",
        }
    }

    /// Structured detail payload for API responses.
    pub fn detail(&self) -> serde_json::Value {
        match self {
            EngineError::InsufficientBalance { shortfall }
            | EngineError::InsufficientShares { shortfall }
            | EngineError::InsufficientLiquidity { shortfall } => {
                serde_json::json!({ "shortfall": shortfall })
            }
            EngineError::DuplicateRequest {
                existing_id,
                existing_status,
            } => serde_json::json!({ "existing_id": existing_id, "existing_status": existing_status }),
            EngineError::RateLimited { retry_after_secs } => {
                serde_json::json!({ "retry_after_secs": retry_after_secs })
            }
            EngineError::Cooldown { remaining_secs }
            | EngineError::DisputeWindowOpen { remaining_secs } => {
                serde_json::json!({ "remaining_secs": remaining_secs })
            }
            _ => serde_json::Value::Null,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_classification_covers_sqlite_contention() {
        assert!(EngineError::Busy.is_busy());
        let locked = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(EngineError::Storage(locked).is_busy());
        assert!(!EngineError::AlreadyClaimed.is_busy());
    }

    #[test]
    fn detail_payloads_carry_shortfall() {
        let err = EngineError::InsufficientBalance { shortfall: 1_250_000 };
        assert_eq!(err.detail()["shortfall"], 1_250_000);
        assert_eq!(err.code(), "insufficient_balance");
    }
}
