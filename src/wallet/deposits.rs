//! Deposit monitor.
//!
//! Interval-driven service polling the public ledger for inbound transfers
//! to each tracked wallet address. Crediting is exactly-once: the deposit
//! insert (unique on transfer signature) and the balance credit share one
//! transaction, so a crash between them can neither double-credit nor drop
//! a deposit. The per-wallet cursor only advances past signatures that were
//! fully handled.

use crate::engine::locks::LockManager;
use crate::errors::{EngineError, EngineResult};
use crate::models::{micro_to_display, now_ts, ActivityEvent, BalanceBroadcast, WsServerEvent};
use crate::notify::Notifier;
use crate::store::{self, DepositRow, SettlementStore, SweepRow, SweepStatus, WalletRow};
use crate::wallet::custodian::CustodialProvider;
use crate::wallet::ledger_rpc::LedgerRpc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HOUR_SECS: i64 = 3_600;

pub struct DepositMonitorConfig {
    pub poll_secs: u64,
    pub min_micro: i64,
    pub hourly_cap: i64,
    pub catchup_limit: usize,
    pub page_limit: usize,
}

pub struct DepositMonitor {
    store: SettlementStore,
    ledger: Arc<dyn LedgerRpc>,
    custodian: Arc<dyn CustodialProvider>,
    locks: Arc<LockManager>,
    notifier: Notifier,
    config: DepositMonitorConfig,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl DepositMonitor {
    pub fn new(
        store: SettlementStore,
        ledger: Arc<dyn LedgerRpc>,
        custodian: Arc<dyn CustodialProvider>,
        locks: Arc<LockManager>,
        notifier: Notifier,
        config: DepositMonitorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            ledger,
            custodian,
            locks,
            notifier,
            config,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the polling loop. `stop` ends it after the current tick.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!(
                poll_secs = monitor.config.poll_secs,
                "🛰️ deposit monitor started"
            );
            let mut ticker = interval(Duration::from_secs(monitor.config.poll_secs.max(1)));
            loop {
                ticker.tick().await;
                if monitor.stopped.load(Ordering::SeqCst) {
                    info!("deposit monitor stopped");
                    break;
                }
                match monitor.poll_once().await {
                    Ok(0) => {}
                    Ok(credited) => info!(credited, "💳 deposit sweep cycle credited deposits"),
                    Err(e) => warn!("deposit poll cycle failed: {e}"),
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// One poll cycle over every tracked wallet. Reentry-guarded: an
    /// overlapping invocation is skipped, not queued.
    pub async fn poll_once(&self) -> EngineResult<usize> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("deposit poll already in flight, skipping");
            return Ok(0);
        }
        let result = self.poll_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_inner(&self) -> EngineResult<usize> {
        let wallets = self
            .store
            .read(store::wallets_with_deposit_address)
            .await?;
        let mut credited_total = 0usize;

        for wallet in wallets {
            match self.process_wallet(&wallet).await {
                Ok(credited) => credited_total += credited,
                Err(e) => warn!(user_id = wallet.user_id, "wallet deposit scan failed: {e}"),
            }
        }
        Ok(credited_total)
    }

    async fn process_wallet(&self, wallet: &WalletRow) -> EngineResult<usize> {
        let address = wallet
            .deposit_address
            .as_deref()
            .ok_or_else(|| EngineError::Validation("wallet has no deposit address".into()))?;

        // First run has no cursor: pull a deeper back-catalog to catch up
        // after downtime.
        let limit = if wallet.last_deposit_signature.is_none() {
            self.config.catchup_limit
        } else {
            self.config.page_limit
        };
        let signatures = self
            .ledger
            .signatures_for_address(address, wallet.last_deposit_signature.as_deref(), limit)
            .await?;
        if signatures.is_empty() {
            return Ok(0);
        }

        let mut credited = 0usize;
        // Newest-first from the ledger; settle oldest-first so the cursor
        // only ever moves forward.
        for signature in signatures.iter().rev() {
            match self.settle_signature(wallet, address, signature).await {
                Ok(did_credit) => {
                    if did_credit {
                        credited += 1;
                    }
                    let now = now_ts();
                    self.store
                        .with_tx(|tx| store::set_wallet_cursor(tx, wallet.user_id, signature, now))
                        .await?;
                }
                Err(EngineError::RateLimited { retry_after_secs }) => {
                    // Leave the cursor where it is: this and newer
                    // signatures are retried on a later cycle.
                    debug!(
                        user_id = wallet.user_id,
                        retry_after_secs, "deposit rate limit reached, deferring rest of page"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(credited)
    }

    /// Handle one ledger signature. Returns true when a balance credit
    /// happened.
    async fn settle_signature(
        &self,
        wallet: &WalletRow,
        address: &str,
        signature: &str,
    ) -> EngineResult<bool> {
        let Some(detail) = self.ledger.transfer_detail(signature, address).await? else {
            return Ok(false);
        };
        if detail.delta_micro <= 0 {
            return Ok(false);
        }
        if detail.delta_micro < self.config.min_micro {
            debug!(
                signature,
                delta = detail.delta_micro,
                "deposit below minimum threshold, ignoring"
            );
            return Ok(false);
        }

        let user_id = wallet.user_id;
        let deposit_id = Uuid::new_v4().to_string();
        let amount = detail.delta_micro;
        let source = detail.source_address.clone();
        let hourly_cap = self.config.hourly_cap;

        let _wallet_lock = self.locks.lock_wallet(user_id).await;
        let now = now_ts();

        let inserted = self
            .store
            .with_tx(|tx| {
                let recent = store::deposit_count_since(tx, user_id, now - HOUR_SECS)?;
                if recent >= hourly_cap {
                    return Err(EngineError::RateLimited {
                        retry_after_secs: HOUR_SECS,
                    });
                }

                let row = DepositRow {
                    id: deposit_id.clone(),
                    user_id,
                    signature: signature.to_string(),
                    amount,
                    source_address: source.clone(),
                    status: "credited".into(),
                    created_at: now,
                };
                if !store::insert_deposit_if_new(tx, &row)? {
                    // Re-delivered signature: the unique constraint says it
                    // was already settled.
                    return Ok(false);
                }

                let current = store::ensure_wallet(tx, user_id, now)?;
                store::update_wallet_balance(tx, user_id, current.balance + amount, now)?;
                store::insert_activity(
                    tx,
                    user_id,
                    &ActivityEvent::DepositCredited {
                        deposit_id: deposit_id.clone(),
                        signature: signature.to_string(),
                        amount_micro: amount,
                    },
                    now,
                )?;
                Ok(true)
            })
            .await?;

        if !inserted {
            return Ok(false);
        }

        info!(
            user_id,
            signature,
            amount = %micro_to_display(amount),
            "💵 deposit credited"
        );
        let balance = self
            .store
            .read(|conn| store::get_wallet(conn, user_id))
            .await?
            .map(|w| w.balance)
            .unwrap_or(0);
        self.notifier.broadcast(WsServerEvent::Balance(BalanceBroadcast {
            user_id,
            balance_micro: balance,
            ts: now,
        }));
        self.notifier.notify_user(
            user_id,
            "Deposit received",
            &format!("{} credited to your balance", micro_to_display(amount)),
        );

        // Forward the funds to the custodial hot account. Runs after the
        // credit committed and outside every lock; an unavailable provider
        // leaves the sweep pending for a later retry.
        self.sweep_deposit(&deposit_id, address, amount).await;

        Ok(true)
    }

    async fn sweep_deposit(&self, deposit_id: &str, source_address: &str, amount: i64) {
        let now = now_ts();
        let sweep = SweepRow {
            id: Uuid::new_v4().to_string(),
            deposit_id: deposit_id.to_string(),
            source_address: source_address.to_string(),
            destination_address: "hot".to_string(),
            amount,
            status: SweepStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.with_tx(|tx| store::insert_sweep(tx, &sweep)).await {
            warn!(deposit_id, "failed to record sweep: {e}");
            return;
        }

        match self.custodian.sweep_to_hot(source_address, amount).await {
            Ok(transfer_id) => {
                debug!(deposit_id, transfer_id = %transfer_id, "🧹 sweep completed");
                let done = now_ts();
                if let Err(e) = self
                    .store
                    .with_tx(|tx| store::set_sweep_status(tx, &sweep.id, SweepStatus::Completed, done))
                    .await
                {
                    warn!(deposit_id, "failed to mark sweep completed: {e}");
                }
            }
            Err(EngineError::ExternalServiceUnavailable(msg)) => {
                // Keep the row pending: the provider being down is
                // retryable, the funds are still on the deposit address.
                warn!(deposit_id, "sweep deferred, provider unavailable: {msg}");
            }
            Err(e) => {
                warn!(deposit_id, "sweep failed: {e}");
                let done = now_ts();
                let _ = self
                    .store
                    .with_tx(|tx| store::set_sweep_status(tx, &sweep.id, SweepStatus::Failed, done))
                    .await;
            }
        }
    }
}
