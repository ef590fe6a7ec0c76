//! Round lifecycle controller.
//!
//! A single cooperative task drives every minute boundary: settle the
//! expiring market, activate the next with the same reference price (the
//! close of one minute is the open of the next), create a fresh provision
//! market five minutes out, prune the aged. A timer armed at the next
//! minute is the primary trigger; a 500 ms interval remains as the safety
//! net. The boundary routine is guarded against reentry so overlapping
//! ticks no-op.

pub mod table;

use crate::aggregator::PriceAggregator;
use crate::engine::MatchingEngine;
use crate::gateway::messages::ServerMessage;
use crate::rounds::table::{RoundTable, TableError, PROVISION_LOOKAHEAD};
use anyhow::Result;
use log::{error, info, warn};
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use updown_rust_core::db::markets;
use updown_rust_core::models::{minute_start, MarketPhase, ROUND_DURATION_MS};

pub struct RoundController {
    pool: PgPool,
    engine: Arc<MatchingEngine>,
    aggregator: Arc<PriceAggregator>,
    table: Arc<RwLock<RoundTable>>,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    boundary_guard: AtomicBool,
    tick_ms: u64,
}

impl RoundController {
    pub fn new(
        pool: PgPool,
        engine: Arc<MatchingEngine>,
        aggregator: Arc<PriceAggregator>,
        table: Arc<RwLock<RoundTable>>,
        broadcast_tx: broadcast::Sender<ServerMessage>,
        tick_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            engine,
            aggregator,
            table,
            broadcast_tx,
            boundary_guard: AtomicBool::new(false),
            tick_ms,
        })
    }

    /// Restore unclosed rounds from the store, then seed the provisioning
    /// window. Call once before `run`.
    pub async fn init(&self) -> Result<()> {
        let unclosed = markets::get_unclosed_markets(&self.pool).await?;

        let created = {
            let mut table = self.table.write().await;
            for market in unclosed {
                info!(
                    "Restoring round {} ({})",
                    market.minute_start_ms,
                    market.phase.as_str()
                );
                self.engine
                    .recover_round(market.minute_start_ms, market.phase)
                    .await?;
                table.restore(market);
            }
            table.seed(now_ms())
        };

        for market in created {
            self.engine
                .init_round(market.minute_start_ms, MarketPhase::Provision)
                .await;
            markets::upsert_market(&self.pool, &market).await?;
        }

        info!("Round controller initialised");
        Ok(())
    }

    /// Drive the minute clock forever.
    pub async fn run(self: Arc<Self>) {
        let mut safety_tick = interval(Duration::from_millis(self.tick_ms));

        loop {
            let now = now_ms();
            let next_minute = minute_start(now) + ROUND_DURATION_MS;
            let until_boundary = (next_minute - now).max(1) as u64;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(until_boundary)) => {}
                _ = safety_tick.tick() => {}
            }

            self.tick().await;
        }
    }

    /// One guarded tick. Public so tests and the safety net share the path.
    pub async fn tick(&self) {
        if self.boundary_guard.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.tick_inner().await {
            error!("Round tick failed: {}", e);
        }
        self.boundary_guard.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<()> {
        // No reference price yet: defer everything to the next tick
        let Some(aggregate) = self.aggregator.latest().await else {
            return Ok(());
        };
        let Some(price) = aggregate.price else {
            return Ok(());
        };

        let now = now_ms();
        let current_minute = minute_start(now);

        let mut table = self.table.write().await;
        let Some(current_round) = table.current_round_start() else {
            return Ok(());
        };

        // Deferred activation: the current round is still provisioning and a
        // reference price finally exists
        if current_minute == current_round {
            let pre_active = table
                .market(current_round)
                .map(|m| m.phase == MarketPhase::Provision)
                .unwrap_or(false);
            if pre_active {
                self.activate_round(&mut table, current_round, price).await;
            }
            return Ok(());
        }

        if current_minute < current_round {
            return Ok(());
        }

        // Boundary crossed: settle, roll over, provision, prune
        match table.settle(current_round, price) {
            Ok(settled) => {
                markets::upsert_market(&self.pool, &settled).await?;
                match settled.outcome {
                    Some(outcome) => {
                        self.engine
                            .settle_round(current_round, outcome, price)
                            .await?;
                        info!(
                            "Round {} settled {} (final {:.2} vs {:.2})",
                            settled.slug,
                            outcome.as_str(),
                            price,
                            settled.price_to_beat.unwrap_or(0.0)
                        );
                    }
                    None => {
                        self.engine
                            .set_phase(current_round, MarketPhase::Closed)
                            .await;
                        warn!(
                            "Round {} closed without outcome: never activated",
                            settled.slug
                        );
                    }
                }
                let _ = self
                    .broadcast_tx
                    .send(ServerMessage::MarketPhaseChange { market: settled });
            }
            Err(TableError::NotFound(_)) => {
                warn!("Boundary crossed but round {} is unknown", current_round);
            }
            Err(e) => error!("Failed to settle round {}: {}", current_round, e),
        }

        // The close of the previous minute opens the next
        if table.market(current_minute).is_none() {
            if let Some(market) = table.create_provision(current_minute) {
                self.engine
                    .init_round(current_minute, MarketPhase::Provision)
                    .await;
                markets::upsert_market(&self.pool, &market).await?;
            }
        }
        self.activate_round(&mut table, current_minute, price).await;
        table.set_current_round_start(current_minute);

        // Keep the provisioning window full
        let future_round = current_minute + PROVISION_LOOKAHEAD * ROUND_DURATION_MS;
        if let Some(market) = table.create_provision(future_round) {
            self.engine
                .init_round(future_round, MarketPhase::Provision)
                .await;
            markets::upsert_market(&self.pool, &market).await?;
        }

        for round in table.prune(now) {
            self.engine.remove_round(round).await;
        }

        let _ = self.broadcast_tx.send(ServerMessage::MarketList {
            markets: table.market_list(),
        });
        let book = self.engine.orderbook_snapshot(current_minute).await;
        let _ = self
            .broadcast_tx
            .send(ServerMessage::orderbook(current_minute, book));

        Ok(())
    }

    async fn activate_round(&self, table: &mut RoundTable, round_start_ms: i64, price: f64) {
        match table.activate(round_start_ms, price) {
            Ok(market) => {
                self.engine
                    .set_phase(round_start_ms, MarketPhase::Active)
                    .await;
                if let Err(e) = markets::upsert_market(&self.pool, &market).await {
                    error!("Failed to persist activation of {}: {}", market.slug, e);
                }
                info!("Round {} active, price to beat {:.2}", market.slug, price);
                let _ = self.broadcast_tx.send(ServerMessage::PriceToBeat {
                    slug: market.slug.clone(),
                    price,
                });
                let _ = self
                    .broadcast_tx
                    .send(ServerMessage::MarketPhaseChange { market });
            }
            Err(e) => {
                // Single-active violation or a missing market is an internal
                // fault, not a user-visible state change
                error!("Failed to activate round {}: {}", round_start_ms, e);
            }
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
