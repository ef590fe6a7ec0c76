//! Matching engine: placement, matching, stops, cancels, settlement.
//!
//! Mutation is single-writer per round: every operation that touches a
//! round's book locks that round's mutex, plans its fills against the
//! in-memory book, applies the plan inside one ledger transaction, and only
//! mutates the book after the transaction commits. A rollback therefore
//! leaves book and ledger consistent with each other. Row locks on orders
//! and balances serialise the ledger side.

pub mod book;
pub mod events;
pub mod stops;

use crate::engine::book::{AggregatedBook, BookEntry, Fill, OrderBook};
use crate::engine::events::{EngineEvent, Payout};
use crate::engine::stops::{StopEntry, StopSet};
use anyhow::{anyhow, Result};
use log::{error, info, warn};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use updown_rust_core::db::{balances, liquidity, orders, positions, trades};
use updown_rust_core::db::orders::NewOrder;
use updown_rust_core::db::trades::NewTrade;
use updown_rust_core::models::{
    book_params, market_pseudo_price, taker_cost_per_share, BookSide, LiquidityProvision,
    MarketOutcome, MarketPhase, Order, OrderStatus, OrderType, Outcome, Position, Side,
    MAX_BOOK_PRICE, MIN_BOOK_PRICE,
};

// ============================================================================
// Errors & Results
// ============================================================================

/// Engine failures split user-visible rejections from internal faults.
#[derive(Debug)]
pub enum EngineError {
    /// Business or input rejection; safe to echo to the client verbatim.
    Rejected(String),
    /// Ledger or invariant fault; logged, reported generically.
    Internal(anyhow::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Rejected(msg) => write!(f, "{}", msg),
            EngineError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Internal(e)
    }
}

fn reject(msg: impl Into<String>) -> EngineError {
    EngineError::Rejected(msg.into())
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ============================================================================
// Requests & Outcomes
// ============================================================================

/// User-facing order parameters, already shape-validated by the gateway.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub order_type: OrderType,
    pub side: Side,
    pub outcome: Outcome,
    pub shares: i32,
    pub price: Option<i16>,
    pub stop_price: Option<i16>,
}

#[derive(Debug, Clone)]
pub struct PlacementOutcome {
    /// Final state of the placed order after matching.
    pub order: Order,
    pub trades: Vec<updown_rust_core::models::Trade>,
    /// Price-improvement plus unfilled-residual refunds, in cents.
    pub refund_cents: i64,
    /// Placer's balance after the whole placement, in cents. None when no
    /// balance was touched (stop-limit parking).
    pub balance_cents: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub order_id: i64,
    pub refund_cents: i64,
    pub balance_cents: i64,
}

#[derive(Debug, Clone)]
pub struct LiquidityOutcome {
    pub provision: LiquidityProvision,
    pub position: Position,
    pub balance_cents: i64,
}

#[derive(Debug, Clone)]
pub struct SettlementSummary {
    pub round_start_ms: i64,
    pub outcome: MarketOutcome,
    pub cancelled_orders: usize,
    pub payouts: Vec<Payout>,
}

// ============================================================================
// Engine
// ============================================================================

struct RoundState {
    phase: MarketPhase,
    book: OrderBook,
    stops: StopSet,
}

pub struct MatchingEngine {
    pool: PgPool,
    max_shares_per_order: i32,
    rounds: RwLock<HashMap<i64, Arc<Mutex<RoundState>>>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

impl MatchingEngine {
    pub fn new(
        pool: PgPool,
        max_shares_per_order: i32,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            pool,
            max_shares_per_order,
            rounds: RwLock::new(HashMap::new()),
            events_tx,
        }
    }

    fn emit(&self, event: EngineEvent) {
        // The gateway owning the receiver may be gone during shutdown
        let _ = self.events_tx.send(event);
    }

    /// Register a round with the engine (empty book, empty stop set).
    pub async fn init_round(&self, round_start_ms: i64, phase: MarketPhase) {
        let mut rounds = self.rounds.write().await;
        rounds.entry(round_start_ms).or_insert_with(|| {
            Arc::new(Mutex::new(RoundState {
                phase,
                book: OrderBook::new(),
                stops: StopSet::new(),
            }))
        });
    }

    pub async fn set_phase(&self, round_start_ms: i64, phase: MarketPhase) {
        let state = self.round_state(round_start_ms).await;
        match state {
            Some(state) => state.lock().await.phase = phase,
            None => warn!("set_phase for unknown round {}", round_start_ms),
        }
    }

    /// Drop a pruned round's in-memory state entirely.
    pub async fn remove_round(&self, round_start_ms: i64) {
        self.rounds.write().await.remove(&round_start_ms);
    }

    async fn round_state(&self, round_start_ms: i64) -> Option<Arc<Mutex<RoundState>>> {
        self.rounds.read().await.get(&round_start_ms).cloned()
    }

    /// Aggregated book snapshot; empty for unknown or cleared rounds.
    pub async fn orderbook_snapshot(&self, round_start_ms: i64) -> AggregatedBook {
        match self.round_state(round_start_ms).await {
            Some(state) => state.lock().await.book.aggregate(),
            None => AggregatedBook::default(),
        }
    }

    // ========================================================================
    // Placement
    // ========================================================================

    pub async fn place_order(
        &self,
        user_id: i64,
        round_start_ms: i64,
        req: PlaceOrderRequest,
    ) -> EngineResult<PlacementOutcome> {
        validate_request(&req, self.max_shares_per_order)?;

        let state = self
            .round_state(round_start_ms)
            .await
            .ok_or_else(|| reject("Market not found"))?;
        let mut state = state.lock().await;

        if state.phase != MarketPhase::Active {
            return Err(reject("Market is not active"));
        }

        match req.order_type {
            OrderType::StopLimit => self.place_stop_limit(&mut state, user_id, round_start_ms, &req).await,
            _ => self.place_book_order(&mut state, user_id, round_start_ms, &req).await,
        }
    }

    /// Park a stop-limit order: no balance reserved, no matching.
    async fn place_stop_limit(
        &self,
        state: &mut RoundState,
        user_id: i64,
        round_start_ms: i64,
        req: &PlaceOrderRequest,
    ) -> EngineResult<PlacementOutcome> {
        let price = req.price.ok_or_else(|| reject("Price is required for stop-limit orders"))?;
        let stop_price =
            req.stop_price.ok_or_else(|| reject("Stop price is required for stop-limit orders"))?;
        let (book_side, book_price, cost_per_share) = book_params(req.side, req.outcome, price);

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        let order = orders::insert_order(
            &mut tx,
            &NewOrder {
                user_id,
                round_start_ms,
                side: req.side,
                outcome: req.outcome,
                book_side,
                order_type: OrderType::StopLimit,
                book_price,
                stop_price: Some(stop_price),
                shares: req.shares,
                cost_per_share,
                status: OrderStatus::Stopped,
            },
        )
        .await?;
        tx.commit().await.map_err(|e| anyhow!(e))?;

        state.stops.insert(StopEntry {
            order_id: order.id,
            user_id,
            book_side,
            stop_price,
            limit_price: book_price,
            shares: req.shares,
            cost_per_share,
        });

        Ok(PlacementOutcome {
            order,
            trades: Vec::new(),
            refund_cents: 0,
            balance_cents: None,
        })
    }

    /// Limit and market orders: reserve, match, then rest or cancel residual.
    async fn place_book_order(
        &self,
        state: &mut RoundState,
        user_id: i64,
        round_start_ms: i64,
        req: &PlaceOrderRequest,
    ) -> EngineResult<PlacementOutcome> {
        let user_price = match req.order_type {
            OrderType::Limit => req.price.ok_or_else(|| reject("Price is required for limit orders"))?,
            _ => market_pseudo_price(req.side, req.outcome),
        };
        let (book_side, book_price, cost_per_share) = book_params(req.side, req.outcome, user_price);

        // FOK walks the book before any state is touched
        if req.order_type == OrderType::MarketFok {
            let available = state.book.matchable_shares(user_id, book_side, book_price);
            if available < req.shares as i64 {
                return Err(reject(format!(
                    "Insufficient liquidity: {} shares available, need {}",
                    available, req.shares
                )));
            }
        }

        let reserve_cents = req.shares as i64 * cost_per_share as i64;

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let balance_after_deduct = balances::deduct_balance(&mut tx, user_id, reserve_cents)
            .await?
            .ok_or_else(|| reject("Insufficient balance"))?;

        let order = orders::insert_order(
            &mut tx,
            &NewOrder {
                user_id,
                round_start_ms,
                side: req.side,
                outcome: req.outcome,
                book_side,
                order_type: req.order_type,
                book_price,
                stop_price: None,
                shares: req.shares,
                cost_per_share,
                status: OrderStatus::Open,
            },
        )
        .await?;

        let fills = state.book.plan_fills(user_id, book_side, book_price, req.shares);
        let exec = execute_fills(&mut tx, &order, &fills).await?;

        let filled: i32 = fills.iter().map(|f| f.qty).sum();
        let remaining = req.shares - filled;

        let mut refund_cents = exec.improvement_cents;
        let mut balance_cents = exec.taker_balance_cents.unwrap_or(balance_after_deduct);

        let final_status = match req.order_type {
            OrderType::Limit => {
                if remaining == 0 {
                    OrderStatus::Filled
                } else if filled > 0 {
                    OrderStatus::PartiallyFilled
                } else {
                    OrderStatus::Open
                }
            }
            OrderType::MarketFok => {
                if remaining != 0 {
                    // The pre-check passed, so this is a book/ledger split
                    return Err(EngineError::Internal(anyhow!(
                        "FOK residual {} after successful pre-check",
                        remaining
                    )));
                }
                OrderStatus::Filled
            }
            OrderType::MarketFak => {
                if remaining == 0 {
                    OrderStatus::Filled
                } else {
                    // Residual is cancelled and its reservation returned
                    let unfilled_refund = remaining as i64 * cost_per_share as i64;
                    balance_cents =
                        balances::credit_balance(&mut tx, user_id, unfilled_refund).await?;
                    refund_cents += unfilled_refund;
                    OrderStatus::Cancelled
                }
            }
            OrderType::StopLimit => unreachable!("stop-limit handled separately"),
        };

        orders::update_order_fill(&mut tx, order.id, filled, remaining, final_status).await?;

        tx.commit().await.map_err(|e| anyhow!(e))?;

        // Ledger committed; now mutate the in-memory book
        state.book.apply_fills(&fills);
        if req.order_type == OrderType::Limit && remaining > 0 {
            state.book.insert(
                book_side,
                BookEntry {
                    order_id: order.id,
                    user_id,
                    price: book_price,
                    remaining,
                    cost_per_share,
                    created_at_ms: order.created_at.timestamp_millis(),
                },
            );
        }

        for maker in &exec.maker_updates {
            self.emit(EngineEvent::OrderUpdate { order: maker.clone() });
        }
        for trade in &exec.trades {
            self.emit(EngineEvent::TradeExecuted { trade: trade.clone() });
        }
        self.emit(EngineEvent::BalanceUpdate { user_id, balance_cents });
        self.emit(EngineEvent::BookChanged { round_start_ms });

        if !exec.trades.is_empty() {
            self.check_stops(state, round_start_ms).await;
        }

        let final_order = Order {
            filled_shares: filled,
            remaining_shares: remaining,
            status: final_status,
            ..order
        };

        Ok(PlacementOutcome {
            order: final_order,
            trades: exec.trades,
            refund_cents,
            balance_cents: Some(balance_cents),
        })
    }

    // ========================================================================
    // Stop triggers
    // ========================================================================

    /// Fire every armed stop, cascading until a pass arms nothing new. Each
    /// stop leaves the set permanently when processed, so the cascade is
    /// bounded by the set size.
    async fn check_stops(&self, state: &mut RoundState, round_start_ms: i64) {
        loop {
            let triggered = state
                .stops
                .triggered(state.book.best_bid(), state.book.best_ask());
            if triggered.is_empty() {
                return;
            }

            for order_id in triggered {
                let Some(entry) = state.stops.remove(order_id) else {
                    continue;
                };
                if let Err(e) = self.trigger_stop(state, round_start_ms, entry).await {
                    error!("Stop trigger for order {} failed: {}", order_id, e);
                }
            }
        }
    }

    /// Activate one stop-limit: deduct its reservation and run it as a fresh
    /// limit order. A failed deduction cancels the order instead.
    async fn trigger_stop(
        &self,
        state: &mut RoundState,
        round_start_ms: i64,
        entry: StopEntry,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let order = match orders::get_order_for_update(&mut tx, entry.order_id).await? {
            Some(order) if order.status == OrderStatus::Stopped => order,
            _ => {
                warn!("Stop order {} no longer parked, skipping trigger", entry.order_id);
                return Ok(());
            }
        };

        let reserve_cents = entry.shares as i64 * entry.cost_per_share as i64;
        let deducted = balances::deduct_balance(&mut tx, entry.user_id, reserve_cents).await?;

        let Some(balance_after_deduct) = deducted else {
            orders::set_order_status(&mut tx, entry.order_id, OrderStatus::Cancelled).await?;
            tx.commit().await?;
            info!(
                "Stop order {} cancelled at trigger: insufficient balance",
                entry.order_id
            );
            self.emit(EngineEvent::OrderCancelled {
                user_id: entry.user_id,
                order_id: entry.order_id,
                refund_cents: 0,
                reason: Some("Insufficient balance at trigger".to_string()),
            });
            return Ok(());
        };

        orders::activate_stop_order(&mut tx, entry.order_id).await?;

        let fills = state
            .book
            .plan_fills(entry.user_id, entry.book_side, entry.limit_price, entry.shares);
        let exec = execute_fills(&mut tx, &order, &fills).await?;

        let filled: i32 = fills.iter().map(|f| f.qty).sum();
        let remaining = entry.shares - filled;
        let status = if remaining == 0 {
            OrderStatus::Filled
        } else if filled > 0 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Open
        };
        orders::update_order_fill(&mut tx, entry.order_id, filled, remaining, status).await?;

        tx.commit().await?;

        state.book.apply_fills(&fills);
        if remaining > 0 {
            state.book.insert(
                entry.book_side,
                BookEntry {
                    order_id: entry.order_id,
                    user_id: entry.user_id,
                    price: entry.limit_price,
                    remaining,
                    cost_per_share: entry.cost_per_share,
                    created_at_ms: order.created_at.timestamp_millis(),
                },
            );
        }

        let balance_cents = exec.taker_balance_cents.unwrap_or(balance_after_deduct);

        info!(
            "Stop order {} triggered: {} filled, {} resting",
            entry.order_id, filled, remaining
        );

        for maker in &exec.maker_updates {
            self.emit(EngineEvent::OrderUpdate { order: maker.clone() });
        }
        for trade in &exec.trades {
            self.emit(EngineEvent::TradeExecuted { trade: trade.clone() });
        }
        self.emit(EngineEvent::OrderUpdate {
            order: Order {
                filled_shares: filled,
                remaining_shares: remaining,
                status,
                ..order
            },
        });
        self.emit(EngineEvent::BalanceUpdate {
            user_id: entry.user_id,
            balance_cents,
        });
        self.emit(EngineEvent::BookChanged { round_start_ms });

        Ok(())
    }

    // ========================================================================
    // Cancel
    // ========================================================================

    pub async fn cancel_order(&self, user_id: i64, order_id: i64) -> EngineResult<CancelOutcome> {
        let order = orders::get_order(&self.pool, order_id)
            .await?
            .ok_or_else(|| reject("Order not found"))?;

        if order.user_id != user_id {
            return Err(reject("Order not found"));
        }
        if order.order_type.is_market() {
            return Err(reject("Market orders cannot be cancelled"));
        }
        if !order.status.is_cancellable() {
            return Err(reject("Order is not cancellable"));
        }

        let state = self
            .round_state(order.round_start_ms)
            .await
            .ok_or_else(|| reject("Market not found"))?;
        let mut state = state.lock().await;

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        // Re-read under the row lock; the order may have filled since
        let current = orders::get_order_for_update(&mut tx, order_id)
            .await?
            .ok_or_else(|| reject("Order not found"))?;
        if !current.status.is_cancellable() {
            return Err(reject("Order is not cancellable"));
        }

        let refund_cents = if current.status == OrderStatus::Stopped {
            0
        } else {
            current.remaining_reserved_cents()
        };

        orders::set_order_status(&mut tx, order_id, OrderStatus::Cancelled).await?;
        let balance_cents = if refund_cents > 0 {
            balances::credit_balance(&mut tx, user_id, refund_cents).await?
        } else {
            balances::get_balance_for_update(&mut tx, user_id)
                .await?
                .ok_or_else(|| EngineError::Internal(anyhow!("user {} missing", user_id)))?
        };

        tx.commit().await.map_err(|e| anyhow!(e))?;

        let was_resting = state.book.remove(order_id).is_some();
        state.stops.remove(order_id);
        if was_resting {
            self.emit(EngineEvent::BookChanged {
                round_start_ms: order.round_start_ms,
            });
        }
        self.emit(EngineEvent::BalanceUpdate { user_id, balance_cents });

        Ok(CancelOutcome {
            order_id,
            refund_cents,
            balance_cents,
        })
    }

    // ========================================================================
    // Liquidity provision
    // ========================================================================

    /// Mint `amount` dollars into `amount` YES + `amount` NO shares. Only
    /// allowed while the round is still provisioning; the minting user holds
    /// the exact complement on both sides so no payoff is created.
    pub async fn provide_liquidity(
        &self,
        user_id: i64,
        round_start_ms: i64,
        amount_dollars: i64,
        max_per_call: i64,
    ) -> EngineResult<LiquidityOutcome> {
        if amount_dollars < 1 || amount_dollars > max_per_call {
            return Err(reject(format!(
                "Amount must be an integer between 1 and {}",
                max_per_call
            )));
        }

        let state = self
            .round_state(round_start_ms)
            .await
            .ok_or_else(|| reject("Market not found"))?;
        let state = state.lock().await;

        if state.phase != MarketPhase::Provision {
            return Err(reject("Liquidity can only be added during provisioning"));
        }

        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;

        let balance_cents = balances::deduct_balance(&mut tx, user_id, amount_dollars * 100)
            .await?
            .ok_or_else(|| reject("Insufficient balance"))?;

        let provision =
            liquidity::insert_liquidity_provision(&mut tx, user_id, round_start_ms, amount_dollars)
                .await?;
        let position = positions::upsert_position(
            &mut tx,
            user_id,
            round_start_ms,
            amount_dollars,
            amount_dollars,
        )
        .await?;

        tx.commit().await.map_err(|e| anyhow!(e))?;

        self.emit(EngineEvent::BalanceUpdate { user_id, balance_cents });

        Ok(LiquidityOutcome {
            provision,
            position,
            balance_cents,
        })
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Close the round: cancel-and-refund everything live, pay the winning
    /// side one dollar per share, clear the in-memory structures.
    pub async fn settle_round(
        &self,
        round_start_ms: i64,
        outcome: MarketOutcome,
        final_price: f64,
    ) -> Result<SettlementSummary> {
        // Hold the round mutex across the sweep so no placement can
        // interleave with the cancel-and-pay transaction
        let state = self.round_state(round_start_ms).await;
        let mut guard = match &state {
            Some(state) => Some(state.lock().await),
            None => None,
        };

        let mut tx = self.pool.begin().await?;

        let cancelled = orders::cancel_all_round_orders(&mut tx, round_start_ms).await?;
        let mut balance_updates: HashMap<i64, i64> = HashMap::new();

        for order in &cancelled {
            if order.status == OrderStatus::Stopped {
                continue;
            }
            let refund = order.remaining_reserved_cents();
            if refund > 0 {
                let balance = balances::credit_balance(&mut tx, order.user_id, refund).await?;
                balance_updates.insert(order.user_id, balance);
            }
        }

        let round_positions = positions::get_all_round_positions(&mut tx, round_start_ms).await?;
        let mut payouts = Vec::new();
        for position in &round_positions {
            let winning_shares = match outcome {
                MarketOutcome::Up => position.yes_shares,
                MarketOutcome::Down => position.no_shares,
            };
            if winning_shares > 0 {
                let amount_cents = winning_shares * 100;
                let balance =
                    balances::credit_balance(&mut tx, position.user_id, amount_cents).await?;
                balance_updates.insert(position.user_id, balance);
                payouts.push(Payout {
                    user_id: position.user_id,
                    amount_cents,
                    balance_cents: balance,
                });
            }
        }

        tx.commit().await?;

        if let Some(state) = guard.as_mut() {
            state.phase = MarketPhase::Closed;
            state.book = OrderBook::new();
            state.stops.clear();
        }
        drop(guard);

        info!(
            "Round {} settled {}: {} orders cancelled, {} payouts",
            round_start_ms,
            outcome.as_str(),
            cancelled.len(),
            payouts.len()
        );

        for order in &cancelled {
            let refund_cents = if order.status == OrderStatus::Stopped {
                0
            } else {
                order.remaining_reserved_cents()
            };
            self.emit(EngineEvent::OrderCancelled {
                user_id: order.user_id,
                order_id: order.id,
                refund_cents,
                reason: Some("Round settled".to_string()),
            });
        }
        for (user_id, balance_cents) in balance_updates {
            self.emit(EngineEvent::BalanceUpdate { user_id, balance_cents });
        }
        self.emit(EngineEvent::RoundSettled {
            round_start_ms,
            outcome,
            final_price,
            payouts: payouts.clone(),
        });
        self.emit(EngineEvent::BookChanged { round_start_ms });

        Ok(SettlementSummary {
            round_start_ms,
            outcome,
            cancelled_orders: cancelled.len(),
            payouts,
        })
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Reload the books and stop sets of every non-closed round from the
    /// store after a restart. Persisted `created_at` keeps time priority.
    pub async fn recover_round(&self, round_start_ms: i64, phase: MarketPhase) -> Result<()> {
        self.init_round(round_start_ms, phase).await;

        let open = orders::get_open_round_orders(&self.pool, round_start_ms).await?;
        let stopped = orders::get_stopped_round_orders(&self.pool, round_start_ms).await?;

        let state = self
            .round_state(round_start_ms)
            .await
            .ok_or_else(|| anyhow!("round {} vanished during recovery", round_start_ms))?;
        let mut state = state.lock().await;

        for order in open {
            if order.order_type != OrderType::Limit {
                error!(
                    "Order {} is {} but was left live; skipping reload",
                    order.id,
                    order.order_type.as_str()
                );
                continue;
            }
            if order.remaining_shares > 0 {
                state.book.insert(
                    order.book_side,
                    BookEntry {
                        order_id: order.id,
                        user_id: order.user_id,
                        price: order.book_price,
                        remaining: order.remaining_shares,
                        cost_per_share: order.cost_per_share,
                        created_at_ms: order.created_at.timestamp_millis(),
                    },
                );
            }
        }

        for order in stopped {
            let Some(stop_price) = order.stop_price else {
                error!("Stopped order {} has no stop price; skipping reload", order.id);
                continue;
            };
            state.stops.insert(StopEntry {
                order_id: order.id,
                user_id: order.user_id,
                book_side: order.book_side,
                stop_price,
                limit_price: order.book_price,
                shares: order.shares,
                cost_per_share: order.cost_per_share,
            });
        }

        info!(
            "Recovered round {}: {} resting orders, {} stops",
            round_start_ms,
            state.book.entries(BookSide::Bid).len() + state.book.entries(BookSide::Ask).len(),
            state.stops.len()
        );

        Ok(())
    }
}

// ============================================================================
// Fill application (shared by placement and stop triggers)
// ============================================================================

struct FillExecution {
    trades: Vec<updown_rust_core::models::Trade>,
    maker_updates: Vec<Order>,
    improvement_cents: i64,
    /// Taker balance after improvement credits, if any were made.
    taker_balance_cents: Option<i64>,
}

/// Apply a planned fill sequence inside the open transaction: trades,
/// positions, maker fill counters, and taker price-improvement refunds.
async fn execute_fills(
    tx: &mut Transaction<'_, Postgres>,
    taker: &Order,
    fills: &[Fill],
) -> Result<FillExecution> {
    let mut exec = FillExecution {
        trades: Vec::with_capacity(fills.len()),
        maker_updates: Vec::with_capacity(fills.len()),
        improvement_cents: 0,
        taker_balance_cents: None,
    };

    for fill in fills {
        let maker = orders::get_order_for_update(tx, fill.maker_order_id)
            .await?
            .ok_or_else(|| anyhow!("maker order {} missing", fill.maker_order_id))?;

        if maker.remaining_shares < fill.qty {
            return Err(anyhow!(
                "maker order {} has {} remaining, planned fill {}",
                maker.id,
                maker.remaining_shares,
                fill.qty
            ));
        }

        // The bid side of every fill is the YES counterparty
        let (bid_order_id, ask_order_id, yes_user_id, no_user_id) = match taker.book_side {
            BookSide::Bid => (taker.id, maker.id, taker.user_id, maker.user_id),
            BookSide::Ask => (maker.id, taker.id, maker.user_id, taker.user_id),
        };

        let trade = trades::insert_trade(
            tx,
            &NewTrade {
                round_start_ms: taker.round_start_ms,
                bid_order_id,
                ask_order_id,
                yes_user_id,
                no_user_id,
                exec_price: fill.price,
                shares: fill.qty,
            },
        )
        .await?;

        positions::upsert_position(tx, yes_user_id, taker.round_start_ms, fill.qty as i64, 0)
            .await?;
        positions::upsert_position(tx, no_user_id, taker.round_start_ms, 0, fill.qty as i64)
            .await?;

        let maker_filled = maker.filled_shares + fill.qty;
        let maker_remaining = maker.remaining_shares - fill.qty;
        let maker_status = if maker_remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        orders::update_order_fill(tx, maker.id, maker_filled, maker_remaining, maker_status)
            .await?;

        exec.maker_updates.push(Order {
            filled_shares: maker_filled,
            remaining_shares: maker_remaining,
            status: maker_status,
            ..maker
        });

        // Maker reserved exactly their own price; only the taker can improve
        let actual = taker_cost_per_share(taker.book_side, fill.price);
        let diff = taker.cost_per_share as i64 - actual as i64;
        if diff > 0 {
            let refund = diff * fill.qty as i64;
            let balance = balances::credit_balance(tx, taker.user_id, refund).await?;
            exec.improvement_cents += refund;
            exec.taker_balance_cents = Some(balance);
        }

        exec.trades.push(trade);
    }

    Ok(exec)
}

// ============================================================================
// Validation
// ============================================================================

fn validate_request(req: &PlaceOrderRequest, max_shares: i32) -> EngineResult<()> {
    if req.shares < 1 || req.shares > max_shares {
        return Err(reject(format!(
            "Shares must be an integer between 1 and {}",
            max_shares
        )));
    }
    if let Some(price) = req.price {
        if !(MIN_BOOK_PRICE..=MAX_BOOK_PRICE).contains(&price) {
            return Err(reject("Price must be an integer between 1 and 99"));
        }
    }
    if let Some(stop_price) = req.stop_price {
        if !(MIN_BOOK_PRICE..=MAX_BOOK_PRICE).contains(&stop_price) {
            return Err(reject("Stop price must be an integer between 1 and 99"));
        }
    }
    if req.order_type == OrderType::Limit && req.price.is_none() {
        return Err(reject("Price is required for limit orders"));
    }
    if req.order_type == OrderType::StopLimit && (req.price.is_none() || req.stop_price.is_none()) {
        return Err(reject("Stop-limit orders require both price and stop price"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_req(shares: i32, price: Option<i16>) -> PlaceOrderRequest {
        PlaceOrderRequest {
            order_type: OrderType::Limit,
            side: Side::Buy,
            outcome: Outcome::Yes,
            shares,
            price,
            stop_price: None,
        }
    }

    #[test]
    fn test_validate_shares_bounds() {
        assert!(validate_request(&limit_req(0, Some(50)), 1000).is_err());
        assert!(validate_request(&limit_req(1001, Some(50)), 1000).is_err());
        assert!(validate_request(&limit_req(1, Some(50)), 1000).is_ok());
        assert!(validate_request(&limit_req(1000, Some(50)), 1000).is_ok());
    }

    #[test]
    fn test_validate_price_bounds() {
        assert!(validate_request(&limit_req(5, Some(0)), 1000).is_err());
        assert!(validate_request(&limit_req(5, Some(100)), 1000).is_err());
        assert!(validate_request(&limit_req(5, Some(1)), 1000).is_ok());
        assert!(validate_request(&limit_req(5, Some(99)), 1000).is_ok());
    }

    #[test]
    fn test_validate_limit_requires_price() {
        let err = validate_request(&limit_req(5, None), 1000).unwrap_err();
        match err {
            EngineError::Rejected(msg) => assert!(msg.contains("Price is required")),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_validate_stop_limit_requires_both_prices() {
        let req = PlaceOrderRequest {
            order_type: OrderType::StopLimit,
            side: Side::Sell,
            outcome: Outcome::Yes,
            shares: 10,
            price: Some(25),
            stop_price: None,
        };
        assert!(validate_request(&req, 1000).is_err());

        let req = PlaceOrderRequest {
            stop_price: Some(30),
            ..req
        };
        assert!(validate_request(&req, 1000).is_ok());
    }

    #[test]
    fn test_market_order_needs_no_price() {
        let req = PlaceOrderRequest {
            order_type: OrderType::MarketFak,
            side: Side::Buy,
            outcome: Outcome::No,
            shares: 10,
            price: None,
            stop_price: None,
        };
        assert!(validate_request(&req, 1000).is_ok());
    }
}
