//! Reference-price time series (`price_history`).

use crate::models::AggregatedPrice;
use anyhow::{Context, Result};
use sqlx::PgPool;

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PriceHistoryRow {
    pub price: f64,
    pub sources: i32,
    #[sqlx(rename = "timestamp_ms")]
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
}

/// Persist one aggregator tick. Null ticks are not stored.
pub async fn insert_aggregated_price(pool: &PgPool, aggregate: &AggregatedPrice) -> Result<()> {
    let price = match aggregate.price {
        Some(p) => p,
        None => return Ok(()),
    };

    sqlx::query(
        "INSERT INTO price_history (price, sources, timestamp_ms) VALUES ($1, $2, $3)",
    )
    .bind(price)
    .bind(aggregate.sources as i32)
    .bind(aggregate.timestamp_ms)
    .execute(pool)
    .await
    .context("Failed to insert price history row")?;

    Ok(())
}

/// Most recent samples, returned oldest first.
pub async fn get_price_history(pool: &PgPool, limit: i64) -> Result<Vec<PriceHistoryRow>> {
    let mut rows: Vec<PriceHistoryRow> = sqlx::query_as(
        r#"
        SELECT price, sources, timestamp_ms
        FROM price_history
        ORDER BY timestamp_ms DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch price history")?;

    rows.reverse();
    Ok(rows)
}
