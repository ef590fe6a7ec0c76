//! Liquidity provision log. Immutable append-only rows.

use crate::models::LiquidityProvision;
use crate::utils::money::{cents_to_decimal, decimal_to_cents};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

#[derive(Debug, sqlx::FromRow)]
struct LiquidityRow {
    id: i64,
    user_id: i64,
    round_start_ms: i64,
    amount: Decimal,
    created_at: DateTime<Utc>,
}

impl From<LiquidityRow> for LiquidityProvision {
    fn from(row: LiquidityRow) -> Self {
        LiquidityProvision {
            id: row.id,
            user_id: row.user_id,
            round_start_ms: row.round_start_ms,
            amount_dollars: decimal_to_cents(row.amount) / 100,
            created_at: row.created_at,
        }
    }
}

pub async fn insert_liquidity_provision(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    round_start_ms: i64,
    amount_dollars: i64,
) -> Result<LiquidityProvision> {
    let row: LiquidityRow = sqlx::query_as(
        r#"
        INSERT INTO liquidity_provisions (user_id, round_start_ms, amount, created_at)
        VALUES ($1, $2, $3, NOW())
        RETURNING id, user_id, round_start_ms, amount, created_at
        "#,
    )
    .bind(user_id)
    .bind(round_start_ms)
    .bind(cents_to_decimal(amount_dollars * 100))
    .fetch_one(&mut **tx)
    .await
    .context("Failed to insert liquidity provision")?;

    Ok(row.into())
}

/// Total dollars of liquidity minted into a round.
pub async fn get_total_liquidity(pool: &PgPool, round_start_ms: i64) -> Result<i64> {
    let (total,): (Option<Decimal>,) = sqlx::query_as(
        "SELECT SUM(amount) FROM liquidity_provisions WHERE round_start_ms = $1",
    )
    .bind(round_start_ms)
    .fetch_one(pool)
    .await
    .context("Failed to sum round liquidity")?;

    Ok(total.map(|d| decimal_to_cents(d) / 100).unwrap_or(0))
}
