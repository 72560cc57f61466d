//! End-to-end settlement flows across the engine: deposit crediting, AMM
//! trading, resolution payouts, and withdrawal egress against one store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use oddsmill_backend::engine::executor::{BuyRequest, SellRequest};
use oddsmill_backend::engine::{FeeRates, LockManager, TradeExecutor, TradeQueue};
use oddsmill_backend::errors::EngineError;
use oddsmill_backend::models::{now_ts, Side, MICRO};
use oddsmill_backend::notify::Notifier;
use oddsmill_backend::resolution::PayoutProcessor;
use oddsmill_backend::store::{self, SettlementStore};
use oddsmill_backend::wallet::custodian::MockCustodian;
use oddsmill_backend::wallet::deposits::{DepositMonitor, DepositMonitorConfig};
use oddsmill_backend::wallet::ledger_rpc::{MockLedger, TransferDetail};
use oddsmill_backend::wallet::withdrawals::{JobQueue, WithdrawalPipeline};

const FEE_RATES: FeeRates = FeeRates {
    protocol_bps: 100,
    creator_bps: 50,
    lp_bps: 50,
};

struct World {
    _dir: tempfile::TempDir,
    store: SettlementStore,
    executor: Arc<TradeExecutor>,
    withdrawals: Arc<WithdrawalPipeline>,
    monitor: Arc<DepositMonitor>,
    processor: Arc<PayoutProcessor>,
    ledger: Arc<MockLedger>,
    custodian: Arc<MockCustodian>,
    job_rx: tokio::sync::mpsc::Receiver<String>,
    market_id: i64,
    option_id: i64,
}

async fn world() -> World {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.db");
    let store = SettlementStore::open(path.to_str().unwrap()).unwrap();
    let now = now_ts();

    let (market_id, option_id) = store
        .with_tx(|tx| {
            let m = store::create_market(tx, "integration market", 10 * MICRO, now)?;
            let o = store::create_option(tx, m, "outcome", now)?;
            store::ensure_wallet(tx, 1, now)?;
            store::set_wallet_deposit_account(tx, 1, "addr-1", "acct-1", now)?;
            store::ensure_wallet(tx, 2, now)?;
            store::update_wallet_balance(tx, 2, 500 * MICRO, now)?;
            Ok((m, o))
        })
        .await
        .unwrap();

    let locks = Arc::new(LockManager::new());
    let (events, _) = broadcast::channel(256);
    let notifier = Notifier::new(events);
    let ledger = Arc::new(MockLedger::new());
    let custodian = Arc::new(MockCustodian::new());

    let executor = Arc::new(TradeExecutor::new(
        store.clone(),
        locks.clone(),
        Arc::new(TradeQueue::new(Duration::from_secs(5))),
        notifier.clone(),
        FEE_RATES,
        1_000 * MICRO,
        10_000 * MICRO,
    ));

    let (jobs, job_rx) = JobQueue::channel();
    let withdrawals = Arc::new(WithdrawalPipeline::new(
        store.clone(),
        locks.clone(),
        custodian.clone(),
        notifier.clone(),
        jobs,
        "hot-account".into(),
        10_000,
        10_000 * MICRO,
        0,
        600,
    ));

    let monitor = DepositMonitor::new(
        store.clone(),
        ledger.clone(),
        custodian.clone(),
        locks,
        notifier.clone(),
        DepositMonitorConfig {
            poll_secs: 3600,
            min_micro: 10_000,
            hourly_cap: 100,
            catchup_limit: 1000,
            page_limit: 100,
        },
    );

    let processor = PayoutProcessor::new(store.clone(), notifier, 3600, 25);

    World {
        _dir: dir,
        store,
        executor,
        withdrawals,
        monitor,
        processor,
        ledger,
        custodian,
        job_rx,
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

async fn fee_total(store: &SettlementStore) -> i64 {
    store
        .read(|c| {
            let mut stmt = c.prepare("SELECT COALESCE(SUM(amount),0) FROM fee_ledger")?;
            let v: i64 = stmt.query_row([], |row| row.get(0))?;
            Ok(v)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn deposit_trade_resolve_withdraw_lifecycle() {
    let mut w = world().await;

    // 1. Inbound ledger transfer credits user 1 exactly once.
    w.ledger.push_transfer(
        "addr-1",
        TransferDetail {
            signature: "lifecycle-sig".into(),
            source_address: Some("external-sender".into()),
            delta_micro: 100 * MICRO,
        },
    );
    assert_eq!(w.monitor.poll_once().await.unwrap(), 1);
    assert_eq!(balance(&w.store, 1).await, 100 * MICRO);
    assert_eq!(w.custodian.sweeps.lock().len(), 1, "deposit swept to hot");

    // 2. User 1 buys yes shares through the AMM; debit splits exactly into
    // pool principal + fee ledger (the pool starts at the platform's
    // scoring-rule subsidy).
    let pool_seed = w
        .store
        .read(|c| store::get_market(c, w.market_id))
        .await
        .unwrap()
        .unwrap()
        .liquidity_pool;
    let buy = w
        .executor
        .buy(BuyRequest {
            user_id: 1,
            market_id: w.market_id,
            option_id: w.option_id,
            buy_yes: 5 * MICRO,
            buy_no: 0,
            max_cost_micro: 50 * MICRO,
            slippage_bps: 100,
        })
        .await
        .unwrap();
    assert_eq!(balance(&w.store, 1).await, 100 * MICRO - buy.total_cost);

    let market = w
        .store
        .read(|c| store::get_market(c, w.market_id))
        .await
        .unwrap()
        .unwrap();
    let fees = fee_total(&w.store).await;
    assert_eq!(market.liquidity_pool - pool_seed + fees, buy.total_cost);

    // 3. Resolution: yes wins, dispute window already elapsed.
    let now = now_ts();
    w.store
        .with_tx(|tx| store::resolve_option(tx, w.option_id, Side::Yes, Some(now - 5), now))
        .await
        .unwrap();
    let summary = w.processor.run_once().await.unwrap();
    assert_eq!(summary.winners_paid, 1);
    assert_eq!(summary.markets_auto_resolved, 1);

    let after_payout = balance(&w.store, 1).await;
    assert_eq!(
        after_payout,
        100 * MICRO - buy.total_cost + 5 * MICRO,
        "1 micro-unit per winning micro-share"
    );

    // 4. Withdraw the winnings through the queued pipeline.
    let receipt = w
        .withdrawals
        .request_withdrawal(1, "user-cold-wallet", "50")
        .await
        .unwrap();
    assert_eq!(balance(&w.store, 1).await, after_payout - 50 * MICRO);

    let job = w.job_rx.recv().await.unwrap();
    assert_eq!(job, receipt.withdrawal_id);
    w.withdrawals.process_job(&job).await.unwrap();

    let row = w
        .store
        .read(|c| store::get_withdrawal(c, &receipt.withdrawal_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status.as_str(), "completed");
    assert_eq!(w.custodian.transfers.lock().len(), 1);
}

#[tokio::test]
async fn buy_conservation_within_component_rounding() {
    let w = world().await;

    for (yes, no) in [(MICRO, 0), (0, 3 * MICRO), (2 * MICRO, MICRO), (333_333, 0)] {
        let before = balance(&w.store, 2).await;
        let pool_before = w
            .store
            .read(|c| store::get_market(c, w.market_id))
            .await
            .unwrap()
            .unwrap()
            .liquidity_pool;
        let fees_before = fee_total(&w.store).await;

        let outcome = w
            .executor
            .buy(BuyRequest {
                user_id: 2,
                market_id: w.market_id,
                option_id: w.option_id,
                buy_yes: yes,
                buy_no: no,
                max_cost_micro: 100 * MICRO,
                slippage_bps: 500,
            })
            .await
            .unwrap();

        let debit = before - balance(&w.store, 2).await;
        assert_eq!(debit, outcome.total_cost, "debit equals reported cost");

        let principal = w
            .store
            .read(|c| store::get_market(c, w.market_id))
            .await
            .unwrap()
            .unwrap()
            .liquidity_pool
            - pool_before;
        let fee_delta = fee_total(&w.store).await - fees_before;
        // Fee components are floored independently; at most one micro-unit
        // per component can vanish from the recorded rows.
        assert!(debit - principal - fee_delta <= 3);
        assert!(debit - principal - fee_delta >= 0);
    }
}

#[tokio::test]
async fn immediate_round_trip_is_never_profitable() {
    let w = world().await;
    let buy = w
        .executor
        .buy(BuyRequest {
            user_id: 2,
            market_id: w.market_id,
            option_id: w.option_id,
            buy_yes: 4 * MICRO,
            buy_no: 0,
            max_cost_micro: 50 * MICRO,
            slippage_bps: 100,
        })
        .await
        .unwrap();

    let sell = w
        .executor
        .sell(SellRequest {
            user_id: 2,
            market_id: w.market_id,
            option_id: w.option_id,
            sell_yes: 4 * MICRO,
            sell_no: 0,
            min_payout_micro: 0,
            slippage_bps: 0,
        })
        .await
        .unwrap();

    assert!(sell.total_payout <= buy.total_cost);
    assert!(sell.realized_pnl <= 0);
}

#[tokio::test]
async fn concurrent_sells_against_one_position_settle_exactly_once() {
    let w = world().await;
    w.executor
        .buy(BuyRequest {
            user_id: 2,
            market_id: w.market_id,
            option_id: w.option_id,
            buy_yes: 2 * MICRO,
            buy_no: 0,
            max_cost_micro: 50 * MICRO,
            slippage_bps: 100,
        })
        .await
        .unwrap();

    let spawn_sell = |exec: Arc<TradeExecutor>, market_id: i64, option_id: i64| {
        tokio::spawn(async move {
            exec.sell(SellRequest {
                user_id: 2,
                market_id,
                option_id,
                sell_yes: (3 * MICRO) / 2,
                sell_no: 0,
                min_payout_micro: 0,
                slippage_bps: 0,
            })
            .await
        })
    };
    let first = spawn_sell(w.executor.clone(), w.market_id, w.option_id);
    let second = spawn_sell(w.executor.clone(), w.market_id, w.option_id);
    let results = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::InsufficientShares { .. })))
            .count(),
        1
    );

    let position = w
        .store
        .read(|c| store::get_position(c, 2, w.option_id))
        .await
        .unwrap()
        .unwrap();
    assert!(position.yes_shares >= 0, "share balance can never go negative");
}

#[tokio::test]
async fn duplicate_withdrawal_window_produces_single_debit() {
    let w = world().await;
    let start = balance(&w.store, 2).await;

    let first = w
        .withdrawals
        .request_withdrawal(2, "same-dest", "40")
        .await
        .unwrap();
    let dup = w.withdrawals.request_withdrawal(2, "same-dest", "40").await;

    match dup {
        Err(EngineError::DuplicateRequest { existing_id, .. }) => {
            assert_eq!(existing_id, first.withdrawal_id)
        }
        other => panic!("expected duplicate rejection, got {:?}", other.map(|_| ())),
    }
    assert_eq!(balance(&w.store, 2).await, start - 40 * MICRO);

    let history = w.withdrawals.history(2, 1, 10).await.unwrap();
    assert_eq!(history.len(), 1, "exactly one withdrawal row");
}

#[tokio::test]
async fn empty_market_prices_at_half_for_both_sides() {
    let w = world().await;
    let option = w
        .store
        .read(|c| store::get_option(c, w.option_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(option.yes_quantity, 0);
    assert_eq!(option.no_quantity, 0);

    let yes = oddsmill_backend::engine::lmsr::price(0, 0, 100_000.0);
    let no = oddsmill_backend::engine::lmsr::price(0, 0, 100_000.0);
    assert_eq!(yes, 0.5);
    assert_eq!(no, 0.5);
}
