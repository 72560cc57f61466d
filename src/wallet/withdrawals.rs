//! Withdrawal pipeline.
//!
//! The debiting transaction never holds a lock across a network call: the
//! request handler validates and debits inside one transaction under the
//! user's advisory lock, then hands the external transfer to an async job.
//! Once the debit commits the system is committed to attempting the
//! transfer; the only ways back are the compensating refund paths.

use crate::engine::locks::LockManager;
use crate::errors::{EngineError, EngineResult};
use crate::models::{micro_to_display, now_ts, ActivityEvent};
use crate::notify::Notifier;
use crate::store::{self, SettlementStore, WithdrawalRow, WithdrawalStatus};
use crate::wallet::amount::{check_bounds, parse_amount_micro};
use crate::wallet::custodian::CustodialProvider;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

const JOB_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct WithdrawalReceipt {
    pub withdrawal_id: String,
    pub status: WithdrawalStatus,
    pub job_id: String,
}

/// Handle for enqueueing withdrawal jobs. Execution happens on the worker
/// task spawned via [`WithdrawalPipeline::spawn_worker`].
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<String>,
}

impl JobQueue {
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    async fn enqueue(&self, withdrawal_id: &str) -> EngineResult<()> {
        self.tx
            .send(withdrawal_id.to_string())
            .await
            .map_err(|_| EngineError::ExternalServiceUnavailable("withdrawal job queue closed".into()))
    }
}

pub struct WithdrawalPipeline {
    store: SettlementStore,
    locks: Arc<LockManager>,
    custodian: Arc<dyn CustodialProvider>,
    notifier: Notifier,
    jobs: JobQueue,
    hot_account: String,
    min_micro: i64,
    max_micro: i64,
    cooldown_secs: i64,
    duplicate_window_secs: i64,
}

impl WithdrawalPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SettlementStore,
        locks: Arc<LockManager>,
        custodian: Arc<dyn CustodialProvider>,
        notifier: Notifier,
        jobs: JobQueue,
        hot_account: String,
        min_micro: i64,
        max_micro: i64,
        cooldown_secs: i64,
        duplicate_window_secs: i64,
    ) -> Self {
        Self {
            store,
            locks,
            custodian,
            notifier,
            jobs,
            hot_account,
            min_micro,
            max_micro,
            cooldown_secs,
            duplicate_window_secs,
        }
    }

    /// Validate, debit, and queue a withdrawal.
    pub async fn request_withdrawal(
        &self,
        user_id: i64,
        destination: &str,
        amount: &str,
    ) -> EngineResult<WithdrawalReceipt> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(EngineError::Validation("destination is empty".into()));
        }
        let amount_micro = parse_amount_micro(amount)?;
        check_bounds(amount_micro, self.min_micro, self.max_micro)?;

        // All withdrawal attempts for one user serialize here, regardless
        // of which request task carries them.
        let _advisory = self.locks.lock_withdrawals(user_id).await;

        let withdrawal_id = Uuid::new_v4().to_string();
        let job_id = Uuid::new_v4().to_string();
        let now = now_ts();

        let row = self
            .store
            .with_tx(|tx| {
                let wallet = store::ensure_wallet(tx, user_id, now)?;
                if wallet.balance < amount_micro {
                    return Err(EngineError::InsufficientBalance {
                        shortfall: amount_micro - wallet.balance,
                    });
                }

                if let Some(active) = store::find_active_withdrawal(tx, user_id)? {
                    return Err(EngineError::DuplicateRequest {
                        existing_id: active.id,
                        existing_status: active.status.as_str().to_string(),
                    });
                }
                let window_start = now - self.duplicate_window_secs;
                if let Some(dup) =
                    store::find_duplicate_withdrawal(tx, user_id, destination, amount_micro, window_start)?
                {
                    return Err(EngineError::DuplicateRequest {
                        existing_id: dup.id,
                        existing_status: dup.status.as_str().to_string(),
                    });
                }
                if let Some(last) = store::latest_withdrawal_ts(tx, user_id)? {
                    let elapsed = now - last;
                    if elapsed < self.cooldown_secs {
                        return Err(EngineError::Cooldown {
                            remaining_secs: self.cooldown_secs - elapsed,
                        });
                    }
                }

                let row = WithdrawalRow {
                    id: withdrawal_id.clone(),
                    user_id,
                    destination: destination.to_string(),
                    amount: amount_micro,
                    status: WithdrawalStatus::Pending,
                    idempotency_key: Uuid::new_v4().to_string(),
                    job_id: Some(job_id.clone()),
                    created_at: now,
                    updated_at: now,
                };
                store::insert_withdrawal(tx, &row)?;
                // Debit up front: the funds leave the spendable balance the
                // moment the request is accepted.
                store::update_wallet_balance(tx, user_id, wallet.balance - amount_micro, now)?;
                store::insert_activity(
                    tx,
                    user_id,
                    &ActivityEvent::WithdrawalRequested {
                        withdrawal_id: row.id.clone(),
                        amount_micro,
                        destination: row.destination.clone(),
                    },
                    now,
                )?;
                Ok(row)
            })
            .await?;

        if let Err(enqueue_err) = self.jobs.enqueue(&row.id).await {
            error!(withdrawal_id = %row.id, "job enqueue failed, compensating");
            self.compensate(&row.id, user_id, amount_micro).await?;
            return Err(enqueue_err);
        }

        info!(
            user_id,
            withdrawal_id = %row.id,
            amount = %micro_to_display(amount_micro),
            "🏧 withdrawal accepted"
        );
        Ok(WithdrawalReceipt {
            withdrawal_id: row.id,
            status: WithdrawalStatus::Pending,
            job_id,
        })
    }

    /// Cancel a pending withdrawal, refunding the debit.
    pub async fn cancel_withdrawal(&self, user_id: i64, withdrawal_id: &str) -> EngineResult<i64> {
        let _advisory = self.locks.lock_withdrawals(user_id).await;
        let now = now_ts();

        let refunded = self
            .store
            .with_tx(|tx| {
                let row = store::get_withdrawal(tx, withdrawal_id)?
                    .ok_or_else(|| EngineError::Validation("withdrawal not found".into()))?;
                if row.user_id != user_id {
                    return Err(EngineError::Validation("withdrawal not found".into()));
                }
                if row.status != WithdrawalStatus::Pending {
                    return Err(EngineError::Validation(format!(
                        "cannot cancel withdrawal in status {}",
                        row.status.as_str()
                    )));
                }

                let wallet = store::ensure_wallet(tx, user_id, now)?;
                store::update_wallet_balance(tx, user_id, wallet.balance + row.amount, now)?;
                store::set_withdrawal_status(tx, withdrawal_id, WithdrawalStatus::Cancelled, None, now)?;
                store::insert_activity(
                    tx,
                    user_id,
                    &ActivityEvent::WithdrawalCancelled {
                        withdrawal_id: withdrawal_id.to_string(),
                        refunded_micro: row.amount,
                    },
                    now,
                )?;
                Ok(row.amount)
            })
            .await?;

        info!(user_id, withdrawal_id, refunded, "↩️ withdrawal cancelled");
        Ok(refunded)
    }

    pub async fn history(
        &self,
        user_id: i64,
        page: usize,
        limit: usize,
    ) -> EngineResult<Vec<WithdrawalRow>> {
        let limit = limit.clamp(1, 100);
        let offset = page.saturating_sub(1) * limit;
        self.store
            .read(|conn| store::list_withdrawals(conn, user_id, offset, limit))
            .await
    }

    /// Spawn the job worker consuming the queue's receiver half.
    pub fn spawn_worker(self: &Arc<Self>, mut rx: mpsc::Receiver<String>) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            info!("🏭 withdrawal worker started");
            while let Some(withdrawal_id) = rx.recv().await {
                if let Err(e) = pipeline.process_job(&withdrawal_id).await {
                    error!(withdrawal_id = %withdrawal_id, "withdrawal job failed: {e}");
                }
            }
            warn!("withdrawal worker channel closed, exiting");
        });
    }

    /// Execute one queued withdrawal: mark processing, run the external
    /// transfer with no lock held, then settle the terminal status.
    pub async fn process_job(&self, withdrawal_id: &str) -> EngineResult<()> {
        let now = now_ts();
        let row = self
            .store
            .read(|conn| store::get_withdrawal(conn, withdrawal_id))
            .await?
            .ok_or_else(|| EngineError::Validation("withdrawal not found".into()))?;

        // Re-delivered or raced jobs: only a pending row may start.
        if row.status != WithdrawalStatus::Pending {
            return Ok(());
        }

        self.store
            .with_tx(|tx| {
                store::set_withdrawal_status(tx, withdrawal_id, WithdrawalStatus::Processing, None, now)
            })
            .await?;

        let from_account = self
            .store
            .read(|conn| store::get_wallet(conn, row.user_id))
            .await?
            .and_then(|w| w.custodial_account)
            .unwrap_or_else(|| self.hot_account.clone());

        match self
            .custodian
            .transfer(&from_account, &row.destination, row.amount)
            .await
        {
            Ok(transfer_id) => {
                let done = now_ts();
                self.store
                    .with_tx(|tx| {
                        store::set_withdrawal_status(
                            tx,
                            withdrawal_id,
                            WithdrawalStatus::Completed,
                            None,
                            done,
                        )?;
                        store::insert_activity(
                            tx,
                            row.user_id,
                            &ActivityEvent::WithdrawalCompleted {
                                withdrawal_id: withdrawal_id.to_string(),
                                amount_micro: row.amount,
                            },
                            done,
                        )
                    })
                    .await?;
                info!(
                    withdrawal_id,
                    transfer_id = %transfer_id,
                    "✅ withdrawal transferred"
                );
                self.notifier.notify_user(
                    row.user_id,
                    "Withdrawal sent",
                    &format!("{} sent to {}", micro_to_display(row.amount), row.destination),
                );
                Ok(())
            }
            Err(e) => {
                warn!(withdrawal_id, "external transfer failed: {e}");
                self.compensate(withdrawal_id, row.user_id, row.amount).await?;
                self.notifier.notify_user(
                    row.user_id,
                    "Withdrawal failed",
                    &format!(
                        "{} was refunded to your balance",
                        micro_to_display(row.amount)
                    ),
                );
                Ok(())
            }
        }
    }

    /// Compensating transaction: refund the debit and mark the withdrawal
    /// failed, atomically. Used when enqueueing fails and when the external
    /// transfer fails; in both cases the debit has already committed.
    async fn compensate(
        &self,
        withdrawal_id: &str,
        user_id: i64,
        amount_micro: i64,
    ) -> EngineResult<()> {
        let now = now_ts();
        self.store
            .with_tx(|tx| {
                let wallet = store::ensure_wallet(tx, user_id, now)?;
                store::update_wallet_balance(tx, user_id, wallet.balance + amount_micro, now)?;
                store::set_withdrawal_status(tx, withdrawal_id, WithdrawalStatus::Failed, None, now)?;
                store::insert_activity(
                    tx,
                    user_id,
                    &ActivityEvent::WithdrawalFailed {
                        withdrawal_id: withdrawal_id.to_string(),
                        amount_micro,
                        refunded: true,
                    },
                    now,
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MICRO;
    use crate::wallet::custodian::MockCustodian;
    use tokio::sync::broadcast;

    struct Harness {
        _dir: tempfile::TempDir,
        store: SettlementStore,
        pipeline: Arc<WithdrawalPipeline>,
        custodian: Arc<MockCustodian>,
        rx: Option<mpsc::Receiver<String>>,
    }

    async fn harness(balance: i64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wd.db");
        let store = SettlementStore::open(path.to_str().unwrap()).unwrap();
        let now = now_ts();
        store
            .with_tx(|tx| {
                store::ensure_wallet(tx, 1, now)?;
                store::update_wallet_balance(tx, 1, balance, now)
            })
            .await
            .unwrap();

        let custodian = Arc::new(MockCustodian::new());
        let (jobs, rx) = JobQueue::channel();
        let (events, _) = broadcast::channel(16);
        let pipeline = Arc::new(WithdrawalPipeline::new(
            store.clone(),
            Arc::new(LockManager::new()),
            custodian.clone(),
            Notifier::new(events),
            jobs,
            "hot-account".into(),
            10_000,
            10_000 * MICRO,
            0, // no cooldown unless a test opts in
            600,
        ));

        Harness {
            _dir: dir,
            store,
            pipeline,
            custodian,
            rx: Some(rx),
        }
    }

    async fn balance(store: &SettlementStore, user_id: i64) -> i64 {
        store
            .read(|c| store::get_wallet(c, user_id))
            .await
            .unwrap()
            .unwrap()
            .balance
    }

    #[tokio::test]
    async fn request_debits_immediately_and_enqueues() {
        let mut h = harness(100 * MICRO).await;
        let receipt = h
            .pipeline
            .request_withdrawal(1, "dest-addr", "25.5")
            .await
            .unwrap();
        assert_eq!(receipt.status, WithdrawalStatus::Pending);
        assert_eq!(balance(&h.store, 1).await, 100 * MICRO - 25_500_000);

        let queued = h.rx.as_mut().unwrap().recv().await.unwrap();
        assert_eq!(queued, receipt.withdrawal_id);
    }

    #[tokio::test]
    async fn duplicate_request_yields_one_debit_and_one_row() {
        let h = harness(100 * MICRO).await;
        let first = h
            .pipeline
            .request_withdrawal(1, "dest-addr", "10")
            .await
            .unwrap();

        match h.pipeline.request_withdrawal(1, "dest-addr", "10").await {
            Err(EngineError::DuplicateRequest {
                existing_id,
                existing_status,
            }) => {
                assert_eq!(existing_id, first.withdrawal_id);
                assert_eq!(existing_status, "pending");
            }
            other => panic!("expected duplicate, got {:?}", other.map(|_| ())),
        }

        assert_eq!(balance(&h.store, 1).await, 90 * MICRO);
        let rows = h.pipeline.history(1, 1, 50).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn worker_completes_transfer_and_keeps_debit() {
        let mut h = harness(50 * MICRO).await;
        let receipt = h
            .pipeline
            .request_withdrawal(1, "dest-addr", "20")
            .await
            .unwrap();
        let id = h.rx.as_mut().unwrap().recv().await.unwrap();
        h.pipeline.process_job(&id).await.unwrap();

        let row = h
            .store
            .read(|c| store::get_withdrawal(c, &receipt.withdrawal_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WithdrawalStatus::Completed);
        assert_eq!(balance(&h.store, 1).await, 30 * MICRO);
        assert_eq!(h.custodian.transfers.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_transfer_refunds_and_marks_failed() {
        let mut h = harness(50 * MICRO).await;
        h.custodian.set_fail_transfers(true);

        let receipt = h
            .pipeline
            .request_withdrawal(1, "dest-addr", "20")
            .await
            .unwrap();
        assert_eq!(balance(&h.store, 1).await, 30 * MICRO);

        let id = h.rx.as_mut().unwrap().recv().await.unwrap();
        h.pipeline.process_job(&id).await.unwrap();

        let row = h
            .store
            .read(|c| store::get_withdrawal(c, &receipt.withdrawal_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WithdrawalStatus::Failed);
        assert_eq!(balance(&h.store, 1).await, 50 * MICRO, "debit refunded");
    }

    #[tokio::test]
    async fn enqueue_failure_compensates_with_refund() {
        let mut h = harness(50 * MICRO).await;
        // Close the queue: the worker half is gone.
        h.rx.take();

        match h.pipeline.request_withdrawal(1, "dest-addr", "20").await {
            Err(EngineError::ExternalServiceUnavailable(_)) => {}
            other => panic!("expected unavailable, got {:?}", other.map(|_| ())),
        }

        assert_eq!(balance(&h.store, 1).await, 50 * MICRO, "compensated");
        let rows = h.pipeline.history(1, 1, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, WithdrawalStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_refunds_only_pending() {
        let mut h = harness(50 * MICRO).await;
        let receipt = h
            .pipeline
            .request_withdrawal(1, "dest-addr", "20")
            .await
            .unwrap();

        let refunded = h
            .pipeline
            .cancel_withdrawal(1, &receipt.withdrawal_id)
            .await
            .unwrap();
        assert_eq!(refunded, 20 * MICRO);
        assert_eq!(balance(&h.store, 1).await, 50 * MICRO);

        // Cancelled rows cannot be cancelled (or processed) again.
        assert!(h
            .pipeline
            .cancel_withdrawal(1, &receipt.withdrawal_id)
            .await
            .is_err());
        let id = h.rx.as_mut().unwrap().recv().await.unwrap();
        h.pipeline.process_job(&id).await.unwrap();
        assert_eq!(balance(&h.store, 1).await, 50 * MICRO, "no double refund");
        assert!(h.custodian.transfers.lock().is_empty());
    }

    #[tokio::test]
    async fn rejects_malformed_and_out_of_range_amounts() {
        let h = harness(50 * MICRO).await;
        assert!(h.pipeline.request_withdrawal(1, "d", "0.001").await.is_err());
        assert!(h
            .pipeline
            .request_withdrawal(1, "d", "10.1234567")
            .await
            .is_err());
        assert!(h.pipeline.request_withdrawal(1, "d", "nope").await.is_err());
        assert!(h.pipeline.request_withdrawal(1, "", "10").await.is_err());
        assert_eq!(balance(&h.store, 1).await, 50 * MICRO);
    }

    #[tokio::test]
    async fn cooldown_reports_remaining_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cd.db");
        let store = SettlementStore::open(path.to_str().unwrap()).unwrap();
        let now = now_ts();
        store
            .with_tx(|tx| {
                store::ensure_wallet(tx, 1, now)?;
                store::update_wallet_balance(tx, 1, 100 * MICRO, now)
            })
            .await
            .unwrap();

        let (jobs, mut rx) = JobQueue::channel();
        let (events, _) = broadcast::channel(16);
        let pipeline = WithdrawalPipeline::new(
            store.clone(),
            Arc::new(LockManager::new()),
            Arc::new(MockCustodian::new()),
            Notifier::new(events),
            jobs,
            "hot-account".into(),
            10_000,
            10_000 * MICRO,
            300,
            0, // no duplicate window so the cooldown path is what trips
        );

        // Complete the first withdrawal so no active row masks the cooldown.
        pipeline.request_withdrawal(1, "a", "5").await.unwrap();
        let id = rx.recv().await.unwrap();
        pipeline.process_job(&id).await.unwrap();

        // Different destination, inside the cooldown.
        match pipeline.request_withdrawal(1, "b", "5").await {
            Err(EngineError::Cooldown { remaining_secs }) => {
                assert!(remaining_secs > 0 && remaining_secs <= 300);
            }
            other => panic!("expected cooldown, got {:?}", other.map(|_| ())),
        }
    }
}
