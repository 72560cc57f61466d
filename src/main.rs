//! Oddsmill settlement engine service.
//!
//! Wires the stores, the trade executor, the withdrawal pipeline, and the
//! two background processors together, then serves the settlement API.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oddsmill_backend::{
    api::{create_router, AppState},
    engine::{FeeRates, LockManager, TradeExecutor, TradeQueue},
    models::{Config, WsServerEvent},
    notify::Notifier,
    resolution::PayoutProcessor,
    store::SettlementStore,
    wallet::{
        deposits::{DepositMonitor, DepositMonitorConfig},
        custodian::{CustodialProvider, HttpCustodian},
        ledger_rpc::HttpLedgerRpc,
        withdrawals::{JobQueue, WithdrawalPipeline},
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 Oddsmill settlement engine starting");

    let config = Config::from_env().context("load configuration")?;
    let db_path = resolve_data_path(&config.database_path);
    let store = SettlementStore::open(&db_path).context("open settlement store")?;
    info!("📊 Settlement store ready at {}", db_path);

    let (event_tx, _event_rx) = broadcast::channel::<WsServerEvent>(1000);
    let notifier = Notifier::new(event_tx);

    let locks = Arc::new(LockManager::new());
    let queue = Arc::new(TradeQueue::new(Duration::from_secs(
        config.trade_queue_timeout_secs,
    )));

    let custodian: Arc<dyn CustodialProvider> = Arc::new(HttpCustodian::new(
        config.custodial_api_url.clone(),
        config.custodial_api_key.clone(),
        config.custodial_hot_account.clone(),
    ));
    let ledger = Arc::new(HttpLedgerRpc::new(config.ledger_rpc_url.clone()));

    let executor = Arc::new(TradeExecutor::new(
        store.clone(),
        locks.clone(),
        queue,
        notifier.clone(),
        FeeRates {
            protocol_bps: config.protocol_fee_bps,
            creator_bps: config.creator_fee_bps,
            lp_bps: config.lp_fee_bps,
        },
        config.per_trade_limit_micro,
        config.per_market_user_limit_micro,
    ));

    // Withdrawal pipeline + its job worker. Debits commit before jobs run;
    // the worker owns every external transfer.
    let (jobs, job_rx) = JobQueue::channel();
    let withdrawals = Arc::new(WithdrawalPipeline::new(
        store.clone(),
        locks.clone(),
        custodian.clone(),
        notifier.clone(),
        jobs,
        config.custodial_hot_account.clone(),
        config.min_withdrawal_micro,
        config.max_withdrawal_micro,
        config.withdrawal_cooldown_secs,
        config.withdrawal_duplicate_window_secs,
    ));
    withdrawals.spawn_worker(job_rx);

    // Background processors.
    let deposit_monitor = DepositMonitor::new(
        store.clone(),
        ledger,
        custodian.clone(),
        locks,
        notifier.clone(),
        DepositMonitorConfig {
            poll_secs: config.deposit_poll_secs,
            min_micro: config.deposit_min_micro,
            hourly_cap: config.deposit_hourly_cap,
            catchup_limit: config.deposit_catchup_limit,
            page_limit: config.deposit_page_limit,
        },
    );
    deposit_monitor.start();

    let payout_processor = PayoutProcessor::new(
        store.clone(),
        notifier.clone(),
        config.payout_poll_secs,
        config.payout_batch_limit,
    );
    payout_processor.start();

    let app_state = AppState {
        store,
        executor,
        withdrawals,
        custodian,
        notifier,
    };

    let app = create_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 Settlement API listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// Initialize tracing with env-filter control.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oddsmill_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    dotenv::dotenv().ok();
}

/// Keep relative DB paths anchored next to the binary's working directory
/// so running from elsewhere doesn't silently create a fresh empty DB.
fn resolve_data_path(configured: &str) -> String {
    let path = Path::new(configured);
    if path.is_absolute() {
        return configured.to_string();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path).to_string_lossy().into_owned())
        .unwrap_or_else(|_| configured.to_string())
}
