//! Trade execution: buy, sell, claim.
//!
//! Per-trade state machine: validate -> serialize on the (market, option)
//! queue -> acquire locks in the fixed order market -> option -> wallet ->
//! position -> price -> fee-split -> limit/slippage checks -> mutate ->
//! persist side-effects. Limits are checked after pricing because they are
//! expressed in settlement currency, which is only known post-pricing.

use crate::engine::fees::{self, FeeRates};
use crate::engine::lmsr;
use crate::engine::locks::LockManager;
use crate::engine::queue::TradeQueue;
use crate::errors::{EngineError, EngineResult};
use crate::models::{
    now_ts, ActivityEvent, BalanceBroadcast, PriceBroadcast, Side, TradeBroadcast, WsServerEvent,
    MIN_TRADE_COST_MICRO,
};
use crate::notify::Notifier;
use crate::store::{self, PositionRow, SettlementStore};
use std::sync::Arc;
use tracing::info;

const MAX_SLIPPAGE_BPS: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct BuyRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub buy_yes: i64,
    pub buy_no: i64,
    pub max_cost_micro: i64,
    pub slippage_bps: u32,
}

#[derive(Debug, Clone)]
pub struct SellRequest {
    pub user_id: i64,
    pub market_id: i64,
    pub option_id: i64,
    pub sell_yes: i64,
    pub sell_no: i64,
    pub min_payout_micro: i64,
    pub slippage_bps: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BuyOutcome {
    pub quantity: i64,
    pub total_cost: i64,
    pub avg_price: f64,
    pub new_yes_supply: i64,
    pub new_no_supply: i64,
    pub new_balance: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SellOutcome {
    pub quantity: i64,
    pub total_payout: i64,
    pub avg_price: f64,
    pub new_yes_supply: i64,
    pub new_no_supply: i64,
    pub new_balance: i64,
    pub realized_pnl: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimOutcome {
    pub payout: i64,
    pub winning_side: Side,
    pub realized_pnl: i64,
    pub new_balance: i64,
}

pub struct TradeExecutor {
    store: SettlementStore,
    locks: Arc<LockManager>,
    queue: Arc<TradeQueue>,
    notifier: Notifier,
    fee_rates: FeeRates,
    per_trade_limit_micro: i64,
    per_market_user_limit_micro: i64,
}

impl TradeExecutor {
    pub fn new(
        store: SettlementStore,
        locks: Arc<LockManager>,
        queue: Arc<TradeQueue>,
        notifier: Notifier,
        fee_rates: FeeRates,
        per_trade_limit_micro: i64,
        per_market_user_limit_micro: i64,
    ) -> Self {
        Self {
            store,
            locks,
            queue,
            notifier,
            fee_rates,
            per_trade_limit_micro,
            per_market_user_limit_micro,
        }
    }

    pub async fn buy(&self, req: BuyRequest) -> EngineResult<BuyOutcome> {
        validate_quantities(req.buy_yes, req.buy_no, req.slippage_bps)?;
        if req.max_cost_micro <= 0 {
            return Err(EngineError::Validation("max_cost must be positive".into()));
        }

        self.queue
            .run(req.market_id, req.option_id, || async {
                let _guard = self
                    .locks
                    .lock_trade(req.market_id, req.option_id, req.user_id)
                    .await;
                let now = now_ts();

                let (outcome, yes_price, no_price) = self
                    .store
                    .with_tx(|tx| self.buy_in_tx(tx, &req, now))
                    .await?;

                info!(
                    user_id = req.user_id,
                    market_id = req.market_id,
                    option_id = req.option_id,
                    cost = outcome.total_cost,
                    "💸 buy executed"
                );
                self.emit_trade(req.user_id, req.market_id, req.option_id, "buy",
                    req.buy_yes, req.buy_no, outcome.total_cost, outcome.new_balance,
                    yes_price, no_price, now);
                Ok(outcome)
            })
            .await
    }

    fn buy_in_tx(
        &self,
        tx: &rusqlite::Transaction<'_>,
        req: &BuyRequest,
        now: i64,
    ) -> EngineResult<(BuyOutcome, f64, f64)> {
        let market = store::get_market(tx, req.market_id)?
            .ok_or_else(|| EngineError::Validation("market not found".into()))?;
        if market.resolved || market.status != "active" {
            return Err(EngineError::Validation("market is not open for trading".into()));
        }
        let option = store::get_option(tx, req.option_id)?
            .ok_or_else(|| EngineError::Validation("option not found".into()))?;
        if option.market_id != req.market_id {
            return Err(EngineError::Validation("option does not belong to market".into()));
        }
        if option.resolved {
            return Err(EngineError::Validation("option is resolved".into()));
        }

        let wallet = store::ensure_wallet(tx, req.user_id, now)?;
        let position = store::get_position(tx, req.user_id, req.option_id)?
            .unwrap_or_else(|| PositionRow::empty(req.user_id, req.option_id));

        let b = market.liquidity_param as f64;

        // Sequential leg decomposition: the LMSR cost function is a
        // potential, so the yes-then-no split sums to the same total while
        // giving each side a well-defined cost basis.
        let mut cost_yes =
            lmsr::buy_cost_micro(option.yes_quantity, option.no_quantity, req.buy_yes, 0, b);
        let mut cost_no = lmsr::buy_cost_micro(
            option.yes_quantity + req.buy_yes,
            option.no_quantity,
            0,
            req.buy_no,
            b,
        );
        let raw_cost = cost_yes + cost_no;
        if raw_cost < MIN_TRADE_COST_MICRO {
            // Floor applies to the chargeable principal; attribute the bump
            // to whichever leg is being bought.
            let bump = MIN_TRADE_COST_MICRO - raw_cost;
            if req.buy_yes > 0 {
                cost_yes += bump;
            } else {
                cost_no += bump;
            }
        }
        let raw_cost = cost_yes + cost_no;

        let fee_split = fees::split(raw_cost, &self.fee_rates);
        let total_cost = raw_cost + fee_split.total;

        self.check_limits(tx, req.user_id, req.market_id, total_cost)?;

        let allowed = slippage_ceiling(req.max_cost_micro, req.slippage_bps);
        if total_cost > allowed {
            return Err(EngineError::Validation(format!(
                "cost {} exceeds max {} with {} bps slippage",
                total_cost, req.max_cost_micro, req.slippage_bps
            )));
        }
        if wallet.balance < total_cost {
            return Err(EngineError::InsufficientBalance {
                shortfall: total_cost - wallet.balance,
            });
        }

        // Mutate: wallet, option supply, market pool + re-derived b,
        // position, side-effect rows.
        let new_balance = wallet.balance - total_cost;
        store::update_wallet_balance(tx, req.user_id, new_balance, now)?;

        let new_yes = option.yes_quantity + req.buy_yes;
        let new_no = option.no_quantity + req.buy_no;
        store::update_option_quantities(tx, req.option_id, new_yes, new_no, now)?;

        let outstanding = store::market_outstanding_shares(tx, req.market_id)?;
        let new_b = derive_liquidity_param(market.base_liquidity_param, outstanding);
        store::update_market_liquidity(
            tx,
            req.market_id,
            market.liquidity_pool + raw_cost,
            new_b,
            now,
        )?;

        let mut position = position;
        position.yes_shares += req.buy_yes;
        position.no_shares += req.buy_no;
        position.yes_cost_basis += cost_yes;
        position.no_cost_basis += cost_no;
        position.updated_at = now;
        store::upsert_position(tx, &position)?;

        store::insert_fee_rows(tx, req.market_id, req.option_id, req.user_id, &fee_split, now)?;
        store::insert_activity(
            tx,
            req.user_id,
            &ActivityEvent::Buy {
                market_id: req.market_id,
                option_id: req.option_id,
                yes_amount: req.buy_yes,
                no_amount: req.buy_no,
                cost_micro: total_cost,
                fee_micro: fee_split.total,
            },
            now,
        )?;

        let quantity = req.buy_yes + req.buy_no;
        let outcome = BuyOutcome {
            quantity,
            total_cost,
            avg_price: raw_cost as f64 / quantity as f64,
            new_yes_supply: new_yes,
            new_no_supply: new_no,
            new_balance,
        };
        let yes_price = lmsr::price(new_yes, new_no, new_b as f64);
        Ok((outcome, yes_price, 1.0 - yes_price))
    }

    pub async fn sell(&self, req: SellRequest) -> EngineResult<SellOutcome> {
        validate_quantities(req.sell_yes, req.sell_no, req.slippage_bps)?;
        if req.min_payout_micro < 0 {
            return Err(EngineError::Validation("min_payout must not be negative".into()));
        }

        self.queue
            .run(req.market_id, req.option_id, || async {
                let _guard = self
                    .locks
                    .lock_trade(req.market_id, req.option_id, req.user_id)
                    .await;
                let now = now_ts();

                let (outcome, yes_price, no_price) = self
                    .store
                    .with_tx(|tx| self.sell_in_tx(tx, &req, now))
                    .await?;

                info!(
                    user_id = req.user_id,
                    market_id = req.market_id,
                    option_id = req.option_id,
                    payout = outcome.total_payout,
                    "💰 sell executed"
                );
                self.emit_trade(req.user_id, req.market_id, req.option_id, "sell",
                    req.sell_yes, req.sell_no, outcome.total_payout, outcome.new_balance,
                    yes_price, no_price, now);
                Ok(outcome)
            })
            .await
    }

    fn sell_in_tx(
        &self,
        tx: &rusqlite::Transaction<'_>,
        req: &SellRequest,
        now: i64,
    ) -> EngineResult<(SellOutcome, f64, f64)> {
        let market = store::get_market(tx, req.market_id)?
            .ok_or_else(|| EngineError::Validation("market not found".into()))?;
        let option = store::get_option(tx, req.option_id)?
            .ok_or_else(|| EngineError::Validation("option not found".into()))?;
        if option.market_id != req.market_id {
            return Err(EngineError::Validation("option does not belong to market".into()));
        }
        if option.resolved {
            return Err(EngineError::Validation("option is resolved".into()));
        }

        let wallet = store::ensure_wallet(tx, req.user_id, now)?;
        let position = store::get_position(tx, req.user_id, req.option_id)?
            .unwrap_or_else(|| PositionRow::empty(req.user_id, req.option_id));

        if position.yes_shares < req.sell_yes {
            return Err(EngineError::InsufficientShares {
                shortfall: req.sell_yes - position.yes_shares,
            });
        }
        if position.no_shares < req.sell_no {
            return Err(EngineError::InsufficientShares {
                shortfall: req.sell_no - position.no_shares,
            });
        }

        let b = market.liquidity_param as f64;
        let payout_yes =
            lmsr::sell_payout_micro(option.yes_quantity, option.no_quantity, req.sell_yes, 0, b);
        let payout_no = lmsr::sell_payout_micro(
            option.yes_quantity - req.sell_yes,
            option.no_quantity,
            0,
            req.sell_no,
            b,
        );
        let raw_payout = payout_yes + payout_no;

        if market.liquidity_pool < raw_payout {
            return Err(EngineError::InsufficientLiquidity {
                shortfall: raw_payout - market.liquidity_pool,
            });
        }

        let fee_split = fees::split(raw_payout, &self.fee_rates);
        let net_payout = raw_payout - fee_split.total;

        let floor = slippage_floor(req.min_payout_micro, req.slippage_bps);
        if net_payout < floor {
            return Err(EngineError::Validation(format!(
                "payout {} below min {} with {} bps slippage",
                net_payout, req.min_payout_micro, req.slippage_bps
            )));
        }

        // Proportional cost-basis release per side.
        let released_yes = proportional(position.yes_cost_basis, req.sell_yes, position.yes_shares);
        let released_no = proportional(position.no_cost_basis, req.sell_no, position.no_shares);
        let realized = net_payout - released_yes - released_no;

        let new_balance = wallet.balance + net_payout;
        store::update_wallet_balance(tx, req.user_id, new_balance, now)?;

        let new_yes = option.yes_quantity - req.sell_yes;
        let new_no = option.no_quantity - req.sell_no;
        store::update_option_quantities(tx, req.option_id, new_yes, new_no, now)?;

        let outstanding = store::market_outstanding_shares(tx, req.market_id)?;
        let new_b = derive_liquidity_param(market.base_liquidity_param, outstanding);
        store::update_market_liquidity(
            tx,
            req.market_id,
            market.liquidity_pool - raw_payout,
            new_b,
            now,
        )?;

        let mut position = position;
        position.yes_shares -= req.sell_yes;
        position.no_shares -= req.sell_no;
        position.yes_cost_basis -= released_yes;
        position.no_cost_basis -= released_no;
        position.realized_pnl += realized;
        position.updated_at = now;
        store::upsert_position(tx, &position)?;

        store::insert_fee_rows(tx, req.market_id, req.option_id, req.user_id, &fee_split, now)?;
        store::insert_activity(
            tx,
            req.user_id,
            &ActivityEvent::Sell {
                market_id: req.market_id,
                option_id: req.option_id,
                yes_amount: req.sell_yes,
                no_amount: req.sell_no,
                payout_micro: net_payout,
                fee_micro: fee_split.total,
                realized_pnl_micro: realized,
            },
            now,
        )?;

        let quantity = req.sell_yes + req.sell_no;
        let outcome = SellOutcome {
            quantity,
            total_payout: net_payout,
            avg_price: raw_payout as f64 / quantity as f64,
            new_yes_supply: new_yes,
            new_no_supply: new_no,
            new_balance,
            realized_pnl: realized,
        };
        let yes_price = lmsr::price(new_yes, new_no, new_b as f64);
        Ok((outcome, yes_price, 1.0 - yes_price))
    }

    pub async fn claim(
        &self,
        user_id: i64,
        market_id: i64,
        option_id: i64,
    ) -> EngineResult<ClaimOutcome> {
        self.queue
            .run(market_id, option_id, || async {
                let _guard = self.locks.lock_trade(market_id, option_id, user_id).await;
                let now = now_ts();

                let outcome = self
                    .store
                    .with_tx(|tx| claim_in_tx(tx, user_id, market_id, option_id, now))
                    .await?;

                info!(
                    user_id,
                    option_id,
                    payout = outcome.payout,
                    "🏆 claim settled"
                );
                self.notifier.broadcast(WsServerEvent::Balance(BalanceBroadcast {
                    user_id,
                    balance_micro: outcome.new_balance,
                    ts: now,
                }));
                Ok(outcome)
            })
            .await
    }

    fn check_limits(
        &self,
        tx: &rusqlite::Transaction<'_>,
        user_id: i64,
        market_id: i64,
        total_cost: i64,
    ) -> EngineResult<()> {
        if total_cost > self.per_trade_limit_micro {
            return Err(EngineError::Validation(format!(
                "trade of {} micro-units exceeds per-trade limit of {}",
                total_cost, self.per_trade_limit_micro
            )));
        }
        let exposure = store::user_market_exposure(tx, user_id, market_id)?;
        if exposure + total_cost > self.per_market_user_limit_micro {
            return Err(EngineError::Validation(format!(
                "market exposure {} would exceed limit of {}",
                exposure + total_cost,
                self.per_market_user_limit_micro
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_trade(
        &self,
        user_id: i64,
        market_id: i64,
        option_id: i64,
        kind: &str,
        yes_amount: i64,
        no_amount: i64,
        total_micro: i64,
        new_balance: i64,
        yes_price: f64,
        no_price: f64,
        ts: i64,
    ) {
        self.notifier.broadcast(WsServerEvent::Trade(TradeBroadcast {
            market_id,
            option_id,
            user_id,
            kind: kind.to_string(),
            yes_amount,
            no_amount,
            total_micro,
            ts,
        }));
        self.notifier.broadcast(WsServerEvent::Price(PriceBroadcast {
            market_id,
            option_id,
            yes_price,
            no_price,
            ts,
        }));
        self.notifier.broadcast(WsServerEvent::Balance(BalanceBroadcast {
            user_id,
            balance_micro: new_balance,
            ts,
        }));
    }
}

/// Claim settlement body, shared with the resolution payout processor's
/// manual-claim path.
pub fn claim_in_tx(
    tx: &rusqlite::Transaction<'_>,
    user_id: i64,
    market_id: i64,
    option_id: i64,
    now: i64,
) -> EngineResult<ClaimOutcome> {
    let market = store::get_market(tx, market_id)?
        .ok_or_else(|| EngineError::Validation("market not found".into()))?;
    let option = store::get_option(tx, option_id)?
        .ok_or_else(|| EngineError::Validation("option not found".into()))?;
    if option.market_id != market_id {
        return Err(EngineError::Validation("option does not belong to market".into()));
    }
    if !option.resolved {
        return Err(EngineError::Validation("option is not resolved".into()));
    }
    let winning_side = option
        .winning_side
        .ok_or_else(|| EngineError::Validation("option has no winning side recorded".into()))?;
    if let Some(deadline) = option.dispute_deadline {
        if now < deadline {
            return Err(EngineError::DisputeWindowOpen {
                remaining_secs: deadline - now,
            });
        }
    }

    let position = store::get_position(tx, user_id, option_id)?
        .ok_or_else(|| EngineError::Validation("no position to claim".into()))?;
    if position.is_claimed {
        return Err(EngineError::AlreadyClaimed);
    }
    if position.yes_shares == 0 && position.no_shares == 0 {
        return Err(EngineError::Validation("no shares held".into()));
    }

    // One micro-unit per winning micro-share.
    let payout = position.shares(winning_side);
    let cost_basis = position.yes_cost_basis + position.no_cost_basis;
    let realized = payout - cost_basis;

    let wallet = store::ensure_wallet(tx, user_id, now)?;
    let new_balance = wallet.balance + payout;
    store::update_wallet_balance(tx, user_id, new_balance, now)?;

    // The pool can fall short of late manual claims; it floors at zero
    // rather than blocking the claim (see DESIGN.md).
    let new_pool = (market.liquidity_pool - payout).max(0);
    store::update_market_liquidity(tx, market_id, new_pool, market.liquidity_param, now)?;

    let mut position = position;
    position.yes_shares = 0;
    position.no_shares = 0;
    position.yes_cost_basis = 0;
    position.no_cost_basis = 0;
    position.realized_pnl += realized;
    position.is_claimed = true;
    position.updated_at = now;
    store::upsert_position(tx, &position)?;

    store::insert_activity(
        tx,
        user_id,
        &ActivityEvent::Claim {
            market_id,
            option_id,
            winning_side,
            payout_micro: payout,
        },
        now,
    )?;

    Ok(ClaimOutcome {
        payout,
        winning_side,
        realized_pnl: realized,
        new_balance,
    })
}

fn validate_quantities(yes: i64, no: i64, slippage_bps: u32) -> EngineResult<()> {
    if yes < 0 || no < 0 {
        return Err(EngineError::Validation("share quantities must not be negative".into()));
    }
    if yes == 0 && no == 0 {
        return Err(EngineError::Validation("at least one side must be traded".into()));
    }
    if slippage_bps > MAX_SLIPPAGE_BPS {
        return Err(EngineError::Validation(format!(
            "slippage above {} bps",
            MAX_SLIPPAGE_BPS
        )));
    }
    Ok(())
}

/// Max acceptable buy cost after widening `max_cost` by the slippage
/// allowance.
fn slippage_ceiling(max_cost: i64, slippage_bps: u32) -> i64 {
    max_cost + ((max_cost as i128 * slippage_bps as i128) / 10_000) as i64
}

/// Min acceptable sell payout after narrowing `min_payout`.
fn slippage_floor(min_payout: i64, slippage_bps: u32) -> i64 {
    min_payout - ((min_payout as i128 * slippage_bps as i128) / 10_000) as i64
}

/// Re-derive the liquidity parameter from the base value so price impact
/// scales down as the market grows, never below the configured base.
fn derive_liquidity_param(base: i64, outstanding_shares: i64) -> i64 {
    base.max(outstanding_shares / 2)
}

fn proportional(basis: i64, sold: i64, held: i64) -> i64 {
    if sold == 0 || held == 0 {
        return 0;
    }
    ((basis as i128 * sold as i128) / held as i128) as i64
}
