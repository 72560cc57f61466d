//! SQLite-backed settlement store.
//!
//! One write connection behind an async mutex; WAL keeps readers cheap.
//! Mutating flows run inside `with_tx`, which retries contention errors
//! with exponential backoff and jitter — the only automatic retry in the
//! engine. Business errors roll the transaction back and surface unchanged.

pub mod records;

use crate::errors::{EngineError, EngineResult};
use crate::models::{ActivityEvent, ActivityRecord, Side};
use anyhow::Context as _;
use rand::Rng;
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub use records::{
    DepositRow, MarketRow, OptionRow, PositionRow, SweepRow, SweepStatus, WalletRow,
    WithdrawalRow, WithdrawalStatus,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS markets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    liquidity_pool INTEGER NOT NULL DEFAULT 0,
    base_liquidity_param INTEGER NOT NULL,
    liquidity_param INTEGER NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS options (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL REFERENCES markets(id),
    label TEXT NOT NULL,
    yes_quantity INTEGER NOT NULL DEFAULT 0,
    no_quantity INTEGER NOT NULL DEFAULT 0,
    resolved INTEGER NOT NULL DEFAULT 0,
    winning_side TEXT,
    dispute_deadline INTEGER,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_options_market ON options(market_id);
CREATE INDEX IF NOT EXISTS idx_options_resolved ON options(resolved, dispute_deadline);

CREATE TABLE IF NOT EXISTS positions (
    user_id INTEGER NOT NULL,
    option_id INTEGER NOT NULL REFERENCES options(id),
    yes_shares INTEGER NOT NULL DEFAULT 0,
    no_shares INTEGER NOT NULL DEFAULT 0,
    yes_cost_basis INTEGER NOT NULL DEFAULT 0,
    no_cost_basis INTEGER NOT NULL DEFAULT 0,
    realized_pnl INTEGER NOT NULL DEFAULT 0,
    is_claimed INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (user_id, option_id)
);
CREATE INDEX IF NOT EXISTS idx_positions_option_unclaimed
    ON positions(option_id, is_claimed);

CREATE TABLE IF NOT EXISTS wallets (
    user_id INTEGER PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0,
    deposit_address TEXT,
    custodial_account TEXT,
    last_deposit_signature TEXT,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS withdrawals (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    destination TEXT NOT NULL,
    amount INTEGER NOT NULL,
    status TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    job_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_withdrawals_user_created
    ON withdrawals(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_withdrawals_user_status
    ON withdrawals(user_id, status);

CREATE TABLE IF NOT EXISTS deposits (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    signature TEXT NOT NULL UNIQUE,
    amount INTEGER NOT NULL,
    source_address TEXT,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_deposits_user_created
    ON deposits(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS sweeps (
    id TEXT PRIMARY KEY,
    deposit_id TEXT NOT NULL REFERENCES deposits(id),
    source_address TEXT NOT NULL,
    destination_address TEXT NOT NULL,
    amount INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sweeps_status ON sweeps(status);

CREATE TABLE IF NOT EXISTS fee_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id INTEGER NOT NULL,
    option_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    amount INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_fee_ledger_market ON fee_ledger(market_id, created_at DESC);

CREATE TABLE IF NOT EXISTS activity (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    payload_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_activity_user_ts ON activity(user_id, ts DESC);
"#;

const MAX_TX_RETRIES: u32 = 5;
const RETRY_BASE_MS: u64 = 25;

#[derive(Clone)]
pub struct SettlementStore {
    conn: Arc<Mutex<Connection>>,
}

impl SettlementStore {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("open settlement db at {}", db_path))?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one immediate transaction. Contention errors are
    /// retried with exponential backoff + jitter up to a bounded count;
    /// everything else rolls back and propagates.
    pub async fn with_tx<T>(
        &self,
        f: impl Fn(&rusqlite::Transaction<'_>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let mut conn = self.conn.lock().await;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                match f(&tx) {
                    Ok(v) => tx.commit().map(|_| v).map_err(EngineError::from),
                    Err(e) => {
                        // Drop rolls the transaction back.
                        Err(e)
                    }
                }
            };
            match result {
                Err(e) if e.is_busy() && attempt < MAX_TX_RETRIES => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..RETRY_BASE_MS);
                    let backoff = RETRY_BASE_MS * (1 << attempt) + jitter;
                    debug!(attempt, backoff_ms = backoff, "store busy, retrying transaction");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) if e.is_busy() => {
                    warn!("store still busy after {} retries", MAX_TX_RETRIES);
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Read-only access outside any transaction.
    pub async fn read<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }
}

// ---------------------------------------------------------------------------
// Row accessors. All take &Connection so they compose inside with_tx
// closures (Transaction derefs to Connection).
// ---------------------------------------------------------------------------

const MARKET_COLS: &str =
    "id, title, liquidity_pool, base_liquidity_param, liquidity_param, resolved, status, created_at, updated_at";
const OPTION_COLS: &str =
    "id, market_id, label, yes_quantity, no_quantity, resolved, winning_side, dispute_deadline, updated_at";
const POSITION_COLS: &str =
    "user_id, option_id, yes_shares, no_shares, yes_cost_basis, no_cost_basis, realized_pnl, is_claimed, updated_at";
const WALLET_COLS: &str =
    "user_id, balance, deposit_address, custodial_account, last_deposit_signature, updated_at";
const WITHDRAWAL_COLS: &str =
    "id, user_id, destination, amount, status, idempotency_key, job_id, created_at, updated_at";
const DEPOSIT_COLS: &str = "id, user_id, signature, amount, source_address, status, created_at";

pub fn get_market(conn: &Connection, id: i64) -> EngineResult<Option<MarketRow>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {MARKET_COLS} FROM markets WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(MarketRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn get_option(conn: &Connection, id: i64) -> EngineResult<Option<OptionRow>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {OPTION_COLS} FROM options WHERE id = ?1"))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(OptionRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn get_wallet(conn: &Connection, user_id: i64) -> EngineResult<Option<WalletRow>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {WALLET_COLS} FROM wallets WHERE user_id = ?1"))?;
    let mut rows = stmt.query(params![user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(WalletRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn ensure_wallet(conn: &Connection, user_id: i64, now: i64) -> EngineResult<WalletRow> {
    conn.prepare_cached(
        "INSERT INTO wallets (user_id, balance, updated_at) VALUES (?1, 0, ?2)
         ON CONFLICT(user_id) DO NOTHING",
    )?
    .execute(params![user_id, now])?;
    get_wallet(conn, user_id)?
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("wallet vanished after upsert")))
}

pub fn update_wallet_balance(
    conn: &Connection,
    user_id: i64,
    balance: i64,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached("UPDATE wallets SET balance = ?2, updated_at = ?3 WHERE user_id = ?1")?
        .execute(params![user_id, balance, now])?;
    Ok(())
}

pub fn set_wallet_deposit_account(
    conn: &Connection,
    user_id: i64,
    deposit_address: &str,
    custodial_account: &str,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE wallets SET deposit_address = ?2, custodial_account = ?3, updated_at = ?4
         WHERE user_id = ?1",
    )?
    .execute(params![user_id, deposit_address, custodial_account, now])?;
    Ok(())
}

pub fn set_wallet_cursor(
    conn: &Connection,
    user_id: i64,
    signature: &str,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE wallets SET last_deposit_signature = ?2, updated_at = ?3 WHERE user_id = ?1",
    )?
    .execute(params![user_id, signature, now])?;
    Ok(())
}

pub fn wallets_with_deposit_address(conn: &Connection) -> EngineResult<Vec<WalletRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WALLET_COLS} FROM wallets WHERE deposit_address IS NOT NULL ORDER BY user_id"
    ))?;
    let rows = stmt
        .query_map([], WalletRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_position(
    conn: &Connection,
    user_id: i64,
    option_id: i64,
) -> EngineResult<Option<PositionRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {POSITION_COLS} FROM positions WHERE user_id = ?1 AND option_id = ?2"
    ))?;
    let mut rows = stmt.query(params![user_id, option_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(PositionRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn upsert_position(conn: &Connection, pos: &PositionRow) -> EngineResult<()> {
    conn.prepare_cached(
        "INSERT INTO positions
            (user_id, option_id, yes_shares, no_shares, yes_cost_basis, no_cost_basis,
             realized_pnl, is_claimed, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(user_id, option_id) DO UPDATE SET
            yes_shares = excluded.yes_shares,
            no_shares = excluded.no_shares,
            yes_cost_basis = excluded.yes_cost_basis,
            no_cost_basis = excluded.no_cost_basis,
            realized_pnl = excluded.realized_pnl,
            is_claimed = excluded.is_claimed,
            updated_at = excluded.updated_at",
    )?
    .execute(params![
        pos.user_id,
        pos.option_id,
        pos.yes_shares,
        pos.no_shares,
        pos.yes_cost_basis,
        pos.no_cost_basis,
        pos.realized_pnl,
        pos.is_claimed as i64,
        pos.updated_at,
    ])?;
    Ok(())
}

pub fn update_option_quantities(
    conn: &Connection,
    option_id: i64,
    yes_quantity: i64,
    no_quantity: i64,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE options SET yes_quantity = ?2, no_quantity = ?3, updated_at = ?4 WHERE id = ?1",
    )?
    .execute(params![option_id, yes_quantity, no_quantity, now])?;
    Ok(())
}

pub fn update_market_liquidity(
    conn: &Connection,
    market_id: i64,
    liquidity_pool: i64,
    liquidity_param: i64,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE markets SET liquidity_pool = ?2, liquidity_param = ?3, updated_at = ?4
         WHERE id = ?1",
    )?
    .execute(params![market_id, liquidity_pool, liquidity_param, now])?;
    Ok(())
}

pub fn set_market_resolved(conn: &Connection, market_id: i64, now: i64) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE markets SET resolved = 1, status = 'resolved', updated_at = ?2 WHERE id = ?1",
    )?
    .execute(params![market_id, now])?;
    Ok(())
}

/// Total outstanding micro-shares across a market's options, used to
/// re-derive the liquidity parameter after each trade.
pub fn market_outstanding_shares(conn: &Connection, market_id: i64) -> EngineResult<i64> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(yes_quantity + no_quantity), 0) FROM options WHERE market_id = ?1",
    )?;
    let total: i64 = stmt.query_row(params![market_id], |row| row.get(0))?;
    Ok(total)
}

/// Cumulative cost basis a user currently carries across all options of a
/// market. Input to the per-user-per-market trade ceiling.
pub fn user_market_exposure(
    conn: &Connection,
    user_id: i64,
    market_id: i64,
) -> EngineResult<i64> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(SUM(p.yes_cost_basis + p.no_cost_basis), 0)
         FROM positions p JOIN options o ON o.id = p.option_id
         WHERE p.user_id = ?1 AND o.market_id = ?2",
    )?;
    let total: i64 = stmt.query_row(params![user_id, market_id], |row| row.get(0))?;
    Ok(total)
}

pub fn insert_fee_rows(
    conn: &Connection,
    market_id: i64,
    option_id: i64,
    user_id: i64,
    fees: &crate::engine::FeeSplit,
    now: i64,
) -> EngineResult<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO fee_ledger (market_id, option_id, user_id, kind, amount, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (kind, amount) in [
        ("protocol", fees.protocol),
        ("creator", fees.creator),
        ("lp", fees.lp),
    ] {
        if amount > 0 {
            stmt.execute(params![market_id, option_id, user_id, kind, amount, now])?;
        }
    }
    Ok(())
}

pub fn insert_activity(
    conn: &Connection,
    user_id: i64,
    event: &ActivityEvent,
    now: i64,
) -> EngineResult<()> {
    let payload = serde_json::to_string(event)
        .map_err(|e| EngineError::Internal(anyhow::anyhow!("serialize activity: {e}")))?;
    conn.prepare_cached(
        "INSERT INTO activity (id, ts, user_id, payload_json) VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![Uuid::new_v4().to_string(), now, user_id, payload])?;
    Ok(())
}

pub fn list_activity(
    conn: &Connection,
    user_id: i64,
    limit: usize,
) -> EngineResult<Vec<ActivityRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, ts, user_id, payload_json FROM activity
         WHERE user_id = ?1 ORDER BY ts DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![user_id, limit as i64], |row| {
        let payload: String = row.get(3)?;
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            payload,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, ts, uid, payload) = row?;
        if let Ok(event) = serde_json::from_str(&payload) {
            out.push(ActivityRecord {
                id,
                ts,
                user_id: uid,
                event,
            });
        }
    }
    Ok(out)
}

// --- withdrawals -----------------------------------------------------------

pub fn insert_withdrawal(conn: &Connection, w: &WithdrawalRow) -> EngineResult<()> {
    conn.prepare_cached(
        "INSERT INTO withdrawals
            (id, user_id, destination, amount, status, idempotency_key, job_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?
    .execute(params![
        w.id,
        w.user_id,
        w.destination,
        w.amount,
        w.status.as_str(),
        w.idempotency_key,
        w.job_id,
        w.created_at,
        w.updated_at,
    ])?;
    Ok(())
}

pub fn get_withdrawal(conn: &Connection, id: &str) -> EngineResult<Option<WithdrawalRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WITHDRAWAL_COLS} FROM withdrawals WHERE id = ?1"
    ))?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(WithdrawalRow::from_row(row)?)),
        None => Ok(None),
    }
}

/// The user's in-flight withdrawal, if any (pending or processing).
pub fn find_active_withdrawal(
    conn: &Connection,
    user_id: i64,
) -> EngineResult<Option<WithdrawalRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WITHDRAWAL_COLS} FROM withdrawals
         WHERE user_id = ?1 AND status IN ('pending', 'processing')
         ORDER BY created_at DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query(params![user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(WithdrawalRow::from_row(row)?)),
        None => Ok(None),
    }
}

/// A recent non-cancelled request with the same destination and amount.
pub fn find_duplicate_withdrawal(
    conn: &Connection,
    user_id: i64,
    destination: &str,
    amount: i64,
    since_ts: i64,
) -> EngineResult<Option<WithdrawalRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WITHDRAWAL_COLS} FROM withdrawals
         WHERE user_id = ?1 AND destination = ?2 AND amount = ?3
           AND created_at >= ?4 AND status != 'cancelled'
         ORDER BY created_at DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query(params![user_id, destination, amount, since_ts])?;
    match rows.next()? {
        Some(row) => Ok(Some(WithdrawalRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn latest_withdrawal_ts(conn: &Connection, user_id: i64) -> EngineResult<Option<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT MAX(created_at) FROM withdrawals WHERE user_id = ?1 AND status != 'cancelled'",
    )?;
    let ts: Option<i64> = stmt.query_row(params![user_id], |row| row.get(0))?;
    Ok(ts)
}

pub fn set_withdrawal_status(
    conn: &Connection,
    id: &str,
    status: WithdrawalStatus,
    job_id: Option<&str>,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE withdrawals SET status = ?2, job_id = COALESCE(?3, job_id), updated_at = ?4
         WHERE id = ?1",
    )?
    .execute(params![id, status.as_str(), job_id, now])?;
    Ok(())
}

pub fn list_withdrawals(
    conn: &Connection,
    user_id: i64,
    offset: usize,
    limit: usize,
) -> EngineResult<Vec<WithdrawalRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {WITHDRAWAL_COLS} FROM withdrawals
         WHERE user_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt
        .query_map(params![user_id, limit as i64, offset as i64], WithdrawalRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// --- deposits and sweeps ---------------------------------------------------

/// Insert a deposit if its signature is new. Returns false when the
/// signature was already recorded (idempotent re-delivery).
pub fn insert_deposit_if_new(conn: &Connection, d: &DepositRow) -> EngineResult<bool> {
    let changed = conn
        .prepare_cached(
            "INSERT INTO deposits (id, user_id, signature, amount, source_address, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(signature) DO NOTHING",
        )?
        .execute(params![
            d.id,
            d.user_id,
            d.signature,
            d.amount,
            d.source_address,
            d.status,
            d.created_at,
        ])?;
    Ok(changed > 0)
}

pub fn get_deposit_by_signature(
    conn: &Connection,
    signature: &str,
) -> EngineResult<Option<DepositRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {DEPOSIT_COLS} FROM deposits WHERE signature = ?1"
    ))?;
    let mut rows = stmt.query(params![signature])?;
    match rows.next()? {
        Some(row) => Ok(Some(DepositRow::from_row(row)?)),
        None => Ok(None),
    }
}

pub fn deposit_count_since(conn: &Connection, user_id: i64, since_ts: i64) -> EngineResult<i64> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*) FROM deposits WHERE user_id = ?1 AND created_at >= ?2",
    )?;
    let count: i64 = stmt.query_row(params![user_id, since_ts], |row| row.get(0))?;
    Ok(count)
}

pub fn insert_sweep(conn: &Connection, s: &SweepRow) -> EngineResult<()> {
    conn.prepare_cached(
        "INSERT INTO sweeps
            (id, deposit_id, source_address, destination_address, amount, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?
    .execute(params![
        s.id,
        s.deposit_id,
        s.source_address,
        s.destination_address,
        s.amount,
        s.status,
        s.created_at,
        s.updated_at,
    ])?;
    Ok(())
}

pub fn set_sweep_status(
    conn: &Connection,
    id: &str,
    status: SweepStatus,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached("UPDATE sweeps SET status = ?2, updated_at = ?3 WHERE id = ?1")?
        .execute(params![id, status.as_str(), now])?;
    Ok(())
}

pub fn get_sweep_for_deposit(conn: &Connection, deposit_id: &str) -> EngineResult<Option<SweepRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, deposit_id, source_address, destination_address, amount, status, created_at, updated_at
         FROM sweeps WHERE deposit_id = ?1",
    )?;
    let mut rows = stmt.query(params![deposit_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(SweepRow::from_row(row)?)),
        None => Ok(None),
    }
}

// --- resolution queries ----------------------------------------------------

/// Resolved options past their dispute deadline that still have unclaimed
/// positions holding shares, up to `limit`.
pub fn options_ready_for_payout(
    conn: &Connection,
    now: i64,
    limit: usize,
) -> EngineResult<Vec<OptionRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OPTION_COLS} FROM options o
         WHERE o.resolved = 1
           AND (o.dispute_deadline IS NULL OR o.dispute_deadline <= ?1)
           AND EXISTS (
               SELECT 1 FROM positions p
               WHERE p.option_id = o.id AND p.is_claimed = 0
                 AND (p.yes_shares > 0 OR p.no_shares > 0)
           )
         ORDER BY o.id LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![now, limit as i64], OptionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn unclaimed_positions(conn: &Connection, option_id: i64) -> EngineResult<Vec<PositionRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {POSITION_COLS} FROM positions
         WHERE option_id = ?1 AND is_claimed = 0 AND (yes_shares > 0 OR no_shares > 0)
         ORDER BY user_id"
    ))?;
    let rows = stmt
        .query_map(params![option_id], PositionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Markets whose options are all resolved but which are not themselves
/// flagged resolved yet.
pub fn markets_ready_for_auto_resolve(conn: &Connection) -> EngineResult<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT m.id FROM markets m
         WHERE m.resolved = 0
           AND EXISTS (SELECT 1 FROM options o WHERE o.market_id = m.id)
           AND NOT EXISTS (
               SELECT 1 FROM options o WHERE o.market_id = m.id AND o.resolved = 0
           )",
    )?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// --- setup helpers (markets are created by the excluded moderation
// surface; these exist for bootstrap and tests) -----------------------------

pub fn create_market(
    conn: &Connection,
    title: &str,
    base_liquidity_param: i64,
    now: i64,
) -> EngineResult<i64> {
    // Platform-funded scoring-rule subsidy: worst-case AMM loss for a
    // binary option is b*ln(2), so the pool starts there instead of zero.
    let seed = (base_liquidity_param as f64 * std::f64::consts::LN_2) as i64;
    conn.prepare_cached(
        "INSERT INTO markets
            (title, liquidity_pool, base_liquidity_param, liquidity_param, resolved, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3, 0, 'active', ?4, ?4)",
    )?
    .execute(params![title, seed, base_liquidity_param, now])?;
    Ok(conn.last_insert_rowid())
}

pub fn create_option(conn: &Connection, market_id: i64, label: &str, now: i64) -> EngineResult<i64> {
    conn.prepare_cached(
        "INSERT INTO options (market_id, label, yes_quantity, no_quantity, resolved, updated_at)
         VALUES (?1, ?2, 0, 0, 0, ?3)",
    )?
    .execute(params![market_id, label, now])?;
    Ok(conn.last_insert_rowid())
}

pub fn resolve_option(
    conn: &Connection,
    option_id: i64,
    winning_side: Side,
    dispute_deadline: Option<i64>,
    now: i64,
) -> EngineResult<()> {
    conn.prepare_cached(
        "UPDATE options SET resolved = 1, winning_side = ?2, dispute_deadline = ?3, updated_at = ?4
         WHERE id = ?1",
    )?
    .execute(params![option_id, winning_side.as_str(), dispute_deadline, now])?;
    Ok(())
}
