//! Ledger primitives and the connection pool behind them.
//!
//! The ledger is the durable shadow of the matching engine: orders, trades,
//! positions, balances, markets, and the reference-price time series. All
//! mutation primitives take a transaction handle; the engine owns the
//! transaction boundaries.
//!
//! Expected tables (schema text managed outside this crate):
//! `users`, `btc_1m_outcomes`, `orders`, `trades`, `positions`,
//! `liquidity_provisions`, `price_history`. The CHECK constraints mirror the
//! model invariants: `shares > 0`, prices and cost in [1, 99],
//! `filled_shares + remaining_shares = shares`, `balance >= 0`.

pub mod balances;
pub mod liquidity;
pub mod markets;
pub mod orders;
pub mod positions;
pub mod prices;
pub mod trades;
pub mod users;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Open the ledger pool and prove it usable before anything trades.
///
/// The caller supplies the sizing: matching is single-writer per round, so
/// the pool mostly serves concurrent gateway reads plus one settlement
/// sweep, and stays small. `acquire_timeout` should be a few lifecycle
/// ticks at most — an order placement that cannot get a connection quickly
/// is better rejected than left straddling a minute boundary.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")?;

    // A dead store must fail the boot, not the first placement
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Ledger ping failed")?;

    tracing::info!(
        "Ledger ready: {} connections, {}ms acquire timeout",
        max_connections,
        acquire_timeout.as_millis()
    );

    Ok(pool)
}
