//! User balance primitives.
//!
//! Balances are stored as NUMERIC(12,2) dollars; everything above this
//! module speaks integer cents. The conditional UPDATE in [`deduct_balance`]
//! is the sole source of "insufficient funds" in the system.

use crate::utils::money::{cents_to_decimal, decimal_to_cents};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};

/// Deduct `amount_cents` from the user's balance.
///
/// Returns the new balance in cents, or `None` when the pre-balance is
/// insufficient (no row is changed in that case).
pub async fn deduct_balance(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    amount_cents: i64,
) -> Result<Option<i64>> {
    let amount = cents_to_decimal(amount_cents);
    let row: Option<(Decimal,)> = sqlx::query_as(
        r#"
        UPDATE users
        SET balance = balance - $2
        WHERE user_id = $1 AND balance >= $2
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(&mut **tx)
    .await
    .context("Failed to deduct balance")?;

    Ok(row.map(|(balance,)| decimal_to_cents(balance)))
}

/// Credit `amount_cents` to the user's balance. Returns the new balance in cents.
pub async fn credit_balance(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    amount_cents: i64,
) -> Result<i64> {
    let amount = cents_to_decimal(amount_cents);
    let (balance,): (Decimal,) = sqlx::query_as(
        r#"
        UPDATE users
        SET balance = balance + $2
        WHERE user_id = $1
        RETURNING balance
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_one(&mut **tx)
    .await
    .context("Failed to credit balance")?;

    Ok(decimal_to_cents(balance))
}

/// Read the user's balance with a row lock held for the transaction.
pub async fn get_balance_for_update(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
) -> Result<Option<i64>> {
    let row: Option<(Decimal,)> =
        sqlx::query_as("SELECT balance FROM users WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await
            .context("Failed to read balance for update")?;

    Ok(row.map(|(balance,)| decimal_to_cents(balance)))
}
