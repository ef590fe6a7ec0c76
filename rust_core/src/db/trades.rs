//! Trade rows. Execution price is always the maker's book price.

use crate::models::Trade;
use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};

impl<'r> FromRow<'r, PgRow> for Trade {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Trade {
            id: row.try_get("id")?,
            round_start_ms: row.try_get("round_start_ms")?,
            bid_order_id: row.try_get("bid_order_id")?,
            ask_order_id: row.try_get("ask_order_id")?,
            yes_user_id: row.try_get("yes_user_id")?,
            no_user_id: row.try_get("no_user_id")?,
            exec_price: row.try_get("exec_price")?,
            shares: row.try_get("shares")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub round_start_ms: i64,
    pub bid_order_id: i64,
    pub ask_order_id: i64,
    pub yes_user_id: i64,
    pub no_user_id: i64,
    pub exec_price: i16,
    pub shares: i32,
}

pub async fn insert_trade(tx: &mut Transaction<'_, Postgres>, new: &NewTrade) -> Result<Trade> {
    let trade: Trade = sqlx::query_as(
        r#"
        INSERT INTO trades (
            round_start_ms, bid_order_id, ask_order_id, yes_user_id, no_user_id,
            exec_price, shares, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        RETURNING id, round_start_ms, bid_order_id, ask_order_id, yes_user_id,
                  no_user_id, exec_price, shares, created_at
        "#,
    )
    .bind(new.round_start_ms)
    .bind(new.bid_order_id)
    .bind(new.ask_order_id)
    .bind(new.yes_user_id)
    .bind(new.no_user_id)
    .bind(new.exec_price)
    .bind(new.shares)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to insert trade")?;

    Ok(trade)
}

/// Fills touching the given order, oldest first.
pub async fn get_order_trades(pool: &PgPool, order_id: i64) -> Result<Vec<Trade>> {
    let trades: Vec<Trade> = sqlx::query_as(
        r#"
        SELECT id, round_start_ms, bid_order_id, ask_order_id, yes_user_id,
               no_user_id, exec_price, shares, created_at
        FROM trades
        WHERE bid_order_id = $1 OR ask_order_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(order_id)
    .fetch_all(pool)
    .await
    .context("Failed to fetch order trades")?;

    Ok(trades)
}
