//! In-process keyed locks.
//!
//! Two disciplines live here:
//!
//! - Trade locks: every trade acquires its market, option, wallet and
//!   position locks in that fixed order, so two trades touching the same
//!   rows can never deadlock each other.
//! - Advisory locks: withdrawals for one user are serialized on a lock
//!   keyed by a deterministic hash of the user id, regardless of which
//!   request task handles them.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of named async mutexes. Entries are created on first use and
/// kept for the process lifetime; the key space (markets, options, users)
/// is small enough that eviction is not worth the complexity.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn handle(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Deterministic advisory-lock key for a user: the first eight bytes of
/// SHA-256 over the decimal user id.
pub fn advisory_key(user_id: i64) -> u64 {
    let digest = Sha256::digest(user_id.to_string().as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Guards for one trade, held until the trade's transaction commits.
/// Dropping releases in reverse acquisition order.
pub struct TradeGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

pub struct LockManager {
    locks: KeyedLocks,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: KeyedLocks::default(),
        }
    }

    /// Acquire all locks a trade touches, in the fixed global order
    /// market -> option -> wallet -> position.
    pub async fn lock_trade(&self, market_id: i64, option_id: i64, user_id: i64) -> TradeGuard {
        let keys = [
            format!("market:{market_id}"),
            format!("option:{option_id}"),
            format!("wallet:{user_id}"),
            format!("position:{user_id}:{option_id}"),
        ];
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.locks.handle(&key).lock_owned().await);
        }
        TradeGuard { _guards: guards }
    }

    /// Serialize all withdrawal attempts for one user.
    pub async fn lock_withdrawals(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let key = format!("advisory:{:016x}", advisory_key(user_id));
        self.locks.handle(&key).lock_owned().await
    }

    /// Lock a single wallet, used by flows that credit balances outside a
    /// trade (deposits, resolution payouts).
    pub async fn lock_wallet(&self, user_id: i64) -> OwnedMutexGuard<()> {
        self.locks.handle(&format!("wallet:{user_id}")).lock_owned().await
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    #[test]
    fn advisory_key_is_deterministic_and_distinct() {
        assert_eq!(advisory_key(42), advisory_key(42));
        assert_ne!(advisory_key(42), advisory_key(43));
    }

    #[tokio::test]
    async fn same_user_withdrawals_are_mutually_exclusive() {
        let mgr = Arc::new(LockManager::new());
        let concurrent = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = mgr.lock_withdrawals(7).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_markets_do_not_contend() {
        let mgr = LockManager::new();
        let _a = mgr.lock_trade(1, 1, 1).await;
        // Must not block: entirely disjoint key set.
        let b = tokio::time::timeout(Duration::from_millis(100), mgr.lock_trade(2, 2, 2)).await;
        assert!(b.is_ok());
    }
}
