//! Resolution payout processor.
//!
//! Timer-driven batch job with two passes: credit unclaimed winning
//! positions on resolved options whose dispute window has elapsed, and flip
//! markets to resolved once every option under them is settled. A winner
//! the pool cannot cover is skipped for manual claiming rather than failing
//! the batch.

use crate::errors::EngineResult;
use crate::models::{
    micro_to_display, now_ts, ActivityEvent, BalanceBroadcast, Side, WsServerEvent,
};
use crate::notify::Notifier;
use crate::store::{self, OptionRow, SettlementStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
pub struct PayoutSummary {
    pub options_processed: usize,
    pub winners_paid: usize,
    pub winners_skipped: usize,
    pub losers_settled: usize,
    pub markets_auto_resolved: usize,
}

/// Outcome of one option's payout batch, carried out of the transaction so
/// notifications fire only after commit.
struct OptionSettlement {
    paid: Vec<(i64, i64, i64)>, // (user_id, payout, new_balance)
    skipped: Vec<i64>,
    losers: Vec<i64>,
    winning_side: Side,
}

pub struct PayoutProcessor {
    store: SettlementStore,
    notifier: Notifier,
    poll_secs: u64,
    batch_limit: usize,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl PayoutProcessor {
    pub fn new(
        store: SettlementStore,
        notifier: Notifier,
        poll_secs: u64,
        batch_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            notifier,
            poll_secs,
            batch_limit,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move {
            info!(poll_secs = processor.poll_secs, "⚖️ payout processor started");
            let mut ticker = interval(Duration::from_secs(processor.poll_secs.max(1)));
            loop {
                ticker.tick().await;
                if processor.stopped.load(Ordering::SeqCst) {
                    info!("payout processor stopped");
                    break;
                }
                match processor.run_once().await {
                    Ok(summary) if summary.options_processed > 0 || summary.markets_auto_resolved > 0 => {
                        info!(
                            options = summary.options_processed,
                            paid = summary.winners_paid,
                            skipped = summary.winners_skipped,
                            auto_resolved = summary.markets_auto_resolved,
                            "⚖️ payout cycle complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("payout cycle failed: {e}"),
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// One processing cycle: payout pass then auto-resolve pass.
    /// Reentry-guarded like the deposit monitor.
    pub async fn run_once(&self) -> EngineResult<PayoutSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(PayoutSummary::default());
        }
        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> EngineResult<PayoutSummary> {
        let mut summary = PayoutSummary::default();
        let now = now_ts();

        let ready = self
            .store
            .read(|conn| store::options_ready_for_payout(conn, now, self.batch_limit))
            .await?;

        for option in &ready {
            match self.settle_option(option, now).await {
                Ok(settlement) => {
                    summary.options_processed += 1;
                    summary.winners_paid += settlement.paid.len();
                    summary.winners_skipped += settlement.skipped.len();
                    summary.losers_settled += settlement.losers.len();
                    self.emit_settlement(option, &settlement, now);
                }
                Err(e) => warn!(option_id = option.id, "option payout failed: {e}"),
            }
        }

        // Auto-resolve pass: market-level status catches up with its
        // options without every option resolution checking siblings.
        let markets = self
            .store
            .read(store::markets_ready_for_auto_resolve)
            .await?;
        for market_id in markets {
            self.store
                .with_tx(|tx| store::set_market_resolved(tx, market_id, now))
                .await?;
            info!(market_id, "🏁 market auto-resolved");
            summary.markets_auto_resolved += 1;
        }

        Ok(summary)
    }

    async fn settle_option(&self, option: &OptionRow, now: i64) -> EngineResult<OptionSettlement> {
        let option_id = option.id;
        let market_id = option.market_id;
        let winning_side = match option.winning_side {
            Some(side) => side,
            None => {
                warn!(option_id, "resolved option has no winning side, skipping");
                return Ok(OptionSettlement {
                    paid: Vec::new(),
                    skipped: Vec::new(),
                    losers: Vec::new(),
                    winning_side: Side::Yes,
                });
            }
        };

        self.store
            .with_tx(|tx| {
                let market = store::get_market(tx, market_id)?.ok_or_else(|| {
                    crate::errors::EngineError::Validation("market not found".into())
                })?;
                let positions = store::unclaimed_positions(tx, option_id)?;

                let mut paid = Vec::new();
                let mut skipped = Vec::new();
                let mut losers = Vec::new();
                let mut pool_remaining = market.liquidity_pool;

                for position in positions {
                    let payout = position.shares(winning_side);
                    let cost_basis = position.yes_cost_basis + position.no_cost_basis;

                    if payout > 0 {
                        if pool_remaining < payout {
                            // Not enough pooled liquidity: leave this
                            // position unclaimed for a manual claim.
                            skipped.push(position.user_id);
                            continue;
                        }
                        pool_remaining -= payout;

                        let wallet = store::ensure_wallet(tx, position.user_id, now)?;
                        let new_balance = wallet.balance + payout;
                        store::update_wallet_balance(tx, position.user_id, new_balance, now)?;
                        store::insert_activity(
                            tx,
                            position.user_id,
                            &ActivityEvent::ResolutionPayout {
                                option_id,
                                winning_side,
                                payout_micro: payout,
                            },
                            now,
                        )?;
                        paid.push((position.user_id, payout, new_balance));
                    } else {
                        store::insert_activity(
                            tx,
                            position.user_id,
                            &ActivityEvent::ResolutionLoss {
                                option_id,
                                winning_side,
                            },
                            now,
                        )?;
                        losers.push(position.user_id);
                    }

                    let mut settled = position;
                    settled.yes_shares = 0;
                    settled.no_shares = 0;
                    settled.yes_cost_basis = 0;
                    settled.no_cost_basis = 0;
                    settled.realized_pnl += payout - cost_basis;
                    settled.is_claimed = true;
                    settled.updated_at = now;
                    store::upsert_position(tx, &settled)?;
                }

                // Single pool update for the whole batch.
                store::update_market_liquidity(
                    tx,
                    market_id,
                    pool_remaining,
                    market.liquidity_param,
                    now,
                )?;

                Ok(OptionSettlement {
                    paid,
                    skipped,
                    losers,
                    winning_side,
                })
            })
            .await
    }

    fn emit_settlement(&self, option: &OptionRow, settlement: &OptionSettlement, now: i64) {
        for (user_id, payout, new_balance) in &settlement.paid {
            self.notifier.broadcast(WsServerEvent::Balance(BalanceBroadcast {
                user_id: *user_id,
                balance_micro: *new_balance,
                ts: now,
            }));
            self.notifier.notify_user(
                *user_id,
                "Market resolved — you won",
                &format!(
                    "{} paid out for option {}",
                    micro_to_display(*payout),
                    option.id
                ),
            );
        }
        for user_id in &settlement.skipped {
            warn!(
                user_id,
                option_id = option.id,
                "insufficient pooled liquidity, left for manual claim"
            );
        }
        for user_id in &settlement.losers {
            self.notifier.notify_user(
                *user_id,
                "Market resolved",
                &format!(
                    "option {} settled {}",
                    option.id,
                    settlement.winning_side.as_str()
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::executor::claim_in_tx;
    use crate::models::MICRO;
    use crate::store::PositionRow;
    use tokio::sync::broadcast;

    struct Harness {
        _dir: tempfile::TempDir,
        store: SettlementStore,
        processor: Arc<PayoutProcessor>,
        market_id: i64,
        option_id: i64,
    }

    /// Market with user 1 long yes and user 2 long no, pool pre-funded.
    async fn harness(pool: i64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payout.db");
        let store = SettlementStore::open(path.to_str().unwrap()).unwrap();
        let now = now_ts();

        let (market_id, option_id) = store
            .with_tx(|tx| {
                let m = store::create_market(tx, "m", 10 * MICRO, now)?;
                let o = store::create_option(tx, m, "o", now)?;
                store::update_option_quantities(tx, o, 3 * MICRO, 2 * MICRO, now)?;
                store::update_market_liquidity(tx, m, pool, 10 * MICRO, now)?;
                store::ensure_wallet(tx, 1, now)?;
                store::ensure_wallet(tx, 2, now)?;
                store::upsert_position(
                    tx,
                    &PositionRow {
                        yes_shares: 3 * MICRO,
                        yes_cost_basis: MICRO,
                        updated_at: now,
                        ..PositionRow::empty(1, o)
                    },
                )?;
                store::upsert_position(
                    tx,
                    &PositionRow {
                        no_shares: 2 * MICRO,
                        no_cost_basis: MICRO,
                        updated_at: now,
                        ..PositionRow::empty(2, o)
                    },
                )?;
                Ok((m, o))
            })
            .await
            .unwrap();

        let (events, _) = broadcast::channel(16);
        let processor = PayoutProcessor::new(store.clone(), Notifier::new(events), 3600, 25);

        Harness {
            _dir: dir,
            store,
            processor,
            market_id,
            option_id,
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
    async fn pays_winners_settles_losers_and_auto_resolves() {
        let h = harness(10 * MICRO).await;
        let now = now_ts();
        h.store
            .with_tx(|tx| store::resolve_option(tx, h.option_id, Side::Yes, Some(now - 10), now))
            .await
            .unwrap();

        let summary = h.processor.run_once().await.unwrap();
        assert_eq!(summary.options_processed, 1);
        assert_eq!(summary.winners_paid, 1);
        assert_eq!(summary.losers_settled, 1);
        assert_eq!(summary.markets_auto_resolved, 1);

        assert_eq!(balance(&h.store, 1).await, 3 * MICRO);
        assert_eq!(balance(&h.store, 2).await, 0);

        let winner = h
            .store
            .read(|c| store::get_position(c, 1, h.option_id))
            .await
            .unwrap()
            .unwrap();
        let loser = h
            .store
            .read(|c| store::get_position(c, 2, h.option_id))
            .await
            .unwrap()
            .unwrap();
        assert!(winner.is_claimed && loser.is_claimed);
        assert_eq!(winner.yes_shares, 0);
        assert_eq!(winner.realized_pnl, 3 * MICRO - MICRO);
        assert_eq!(loser.realized_pnl, -MICRO);

        let market = h
            .store
            .read(|c| store::get_market(c, h.market_id))
            .await
            .unwrap()
            .unwrap();
        assert!(market.resolved);
        assert_eq!(market.liquidity_pool, 7 * MICRO);

        // A second cycle finds nothing left to do.
        let again = h.processor.run_once().await.unwrap();
        assert_eq!(again.options_processed, 0);
        assert_eq!(balance(&h.store, 1).await, 3 * MICRO);
    }

    #[tokio::test]
    async fn dispute_window_blocks_the_batch() {
        let h = harness(10 * MICRO).await;
        let now = now_ts();
        h.store
            .with_tx(|tx| store::resolve_option(tx, h.option_id, Side::Yes, Some(now + 3600), now))
            .await
            .unwrap();

        let summary = h.processor.run_once().await.unwrap();
        assert_eq!(summary.options_processed, 0);
        assert_eq!(balance(&h.store, 1).await, 0);
    }

    #[tokio::test]
    async fn insufficient_pool_skips_winner_for_manual_claim() {
        // Pool covers only part of the winner's 3-share payout.
        let h = harness(MICRO).await;
        let now = now_ts();
        h.store
            .with_tx(|tx| store::resolve_option(tx, h.option_id, Side::Yes, Some(now - 10), now))
            .await
            .unwrap();

        let summary = h.processor.run_once().await.unwrap();
        assert_eq!(summary.winners_paid, 0);
        assert_eq!(summary.winners_skipped, 1);
        assert_eq!(summary.losers_settled, 1);
        assert_eq!(balance(&h.store, 1).await, 0);

        let winner = h
            .store
            .read(|c| store::get_position(c, 1, h.option_id))
            .await
            .unwrap()
            .unwrap();
        assert!(!winner.is_claimed, "skipped winner stays claimable");
        assert_eq!(winner.yes_shares, 3 * MICRO);

        // The manual claim path still settles it (pool floors at zero).
        let claim = h
            .store
            .with_tx(|tx| claim_in_tx(tx, 1, h.market_id, h.option_id, now_ts()))
            .await
            .unwrap();
        assert_eq!(claim.payout, 3 * MICRO);
        assert_eq!(balance(&h.store, 1).await, 3 * MICRO);

        let market = h
            .store
            .read(|c| store::get_market(c, h.market_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(market.liquidity_pool, 0, "pool floored, not negative");
    }
}
