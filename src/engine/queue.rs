//! Per-(market, option) trade serialization.
//!
//! Concurrent trade requests for the same option are executed strictly
//! one-at-a-time, in arrival order, before they ever reach the store. This
//! sits in front of the row-lock discipline and bounds how many
//! transactions contend for the same rows at once. A request that cannot
//! start within the timeout is rejected rather than left queued.

use crate::errors::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

pub struct TradeQueue {
    slots: Mutex<HashMap<(i64, i64), Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl TradeQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn slot(&self, market_id: i64, option_id: i64) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        slots
            .entry((market_id, option_id))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Run `op` once this key's earlier submissions have finished. The
    /// tokio mutex queues waiters fairly, which preserves arrival order.
    pub async fn run<T, F, Fut>(&self, market_id: i64, option_id: i64, op: F) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let slot = self.slot(market_id, option_id);
        let _guard = tokio::time::timeout(self.timeout, slot.lock())
            .await
            .map_err(|_| EngineError::QueueTimeout {
                timeout_secs: self.timeout.as_secs(),
            })?;
        op().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn operations_on_one_key_run_serially() {
        let queue = Arc::new(TradeQueue::new(Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let running = running.clone();
            let overlap = overlap.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(1, 1, || async move {
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(3)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let queue = Arc::new(TradeQueue::new(Duration::from_secs(5)));
        let q2 = queue.clone();

        let slow = tokio::spawn(async move {
            queue
                .run(1, 1, || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        });
        // A different option must not wait behind the slow one.
        let fast = tokio::time::timeout(
            Duration::from_millis(25),
            q2.run(1, 2, || async { Ok(()) }),
        )
        .await;
        assert!(fast.is_ok());
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn queued_operation_times_out() {
        let queue = Arc::new(TradeQueue::new(Duration::from_millis(20)));
        let q2 = queue.clone();

        let holder = tokio::spawn(async move {
            queue
                .run(9, 9, || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result: EngineResult<()> = q2.run(9, 9, || async { Ok(()) }).await;
        match result {
            Err(EngineError::QueueTimeout { .. }) => {}
            other => panic!("expected queue timeout, got {:?}", other.map(|_| ())),
        }
        holder.await.unwrap().unwrap();
    }
}
