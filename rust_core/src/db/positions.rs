//! Position rows, keyed user x round.
//!
//! Shares only ever increase: trade fills credit one side to each
//! counterparty, liquidity provision credits both sides at once. Settlement
//! reads positions but never mutates them.

use crate::models::Position;
use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};

impl<'r> FromRow<'r, PgRow> for Position {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(Position {
            user_id: row.try_get("user_id")?,
            round_start_ms: row.try_get("round_start_ms")?,
            yes_shares: row.try_get("yes_shares")?,
            no_shares: row.try_get("no_shares")?,
        })
    }
}

/// Add share deltas to a user's position for the round, creating the row if
/// needed. Returns the resulting position.
pub async fn upsert_position(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    round_start_ms: i64,
    delta_yes: i64,
    delta_no: i64,
) -> Result<Position> {
    let position: Position = sqlx::query_as(
        r#"
        INSERT INTO positions (user_id, round_start_ms, yes_shares, no_shares)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id, round_start_ms) DO UPDATE SET
            yes_shares = positions.yes_shares + EXCLUDED.yes_shares,
            no_shares = positions.no_shares + EXCLUDED.no_shares
        RETURNING user_id, round_start_ms, yes_shares, no_shares
        "#,
    )
    .bind(user_id)
    .bind(round_start_ms)
    .bind(delta_yes)
    .bind(delta_no)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to upsert position")?;

    Ok(position)
}

pub async fn get_position(
    pool: &PgPool,
    user_id: i64,
    round_start_ms: i64,
) -> Result<Option<Position>> {
    let position: Option<Position> = sqlx::query_as(
        r#"
        SELECT user_id, round_start_ms, yes_shares, no_shares
        FROM positions
        WHERE user_id = $1 AND round_start_ms = $2
        "#,
    )
    .bind(user_id)
    .bind(round_start_ms)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch position")?;

    Ok(position)
}

/// All positions of a round, read inside the settlement transaction.
pub async fn get_all_round_positions(
    tx: &mut Transaction<'_, Postgres>,
    round_start_ms: i64,
) -> Result<Vec<Position>> {
    let positions: Vec<Position> = sqlx::query_as(
        r#"
        SELECT user_id, round_start_ms, yes_shares, no_shares
        FROM positions
        WHERE round_start_ms = $1
        "#,
    )
    .bind(round_start_ms)
    .fetch_all(&mut **tx)
    .await
    .context("Failed to fetch round positions")?;

    Ok(positions)
}
