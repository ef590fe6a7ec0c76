//! User rows: created on first successful auth, updated on later logins.

use crate::models::User;
use crate::utils::money::{cents_to_decimal, decimal_to_cents};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    user_id: i64,
    username: Option<String>,
    first_name: String,
    balance: Decimal,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            user_id: row.user_id,
            username: row.username,
            first_name: row.first_name,
            balance_cents: decimal_to_cents(row.balance),
            created_at: row.created_at,
        }
    }
}

/// Create the user on first login with the configured play balance, or
/// refresh the display attributes on subsequent logins.
pub async fn upsert_user(
    pool: &PgPool,
    user_id: i64,
    username: Option<&str>,
    first_name: &str,
    starting_balance_cents: i64,
) -> Result<User> {
    let row: UserRow = sqlx::query_as(
        r#"
        INSERT INTO users (user_id, username, first_name, balance, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (user_id) DO UPDATE SET
            username = EXCLUDED.username,
            first_name = EXCLUDED.first_name
        RETURNING user_id, username, first_name, balance, created_at
        "#,
    )
    .bind(user_id)
    .bind(username)
    .bind(first_name)
    .bind(cents_to_decimal(starting_balance_cents))
    .fetch_one(pool)
    .await
    .context("Failed to upsert user")?;

    Ok(row.into())
}

pub async fn get_user(pool: &PgPool, user_id: i64) -> Result<Option<User>> {
    let row: Option<UserRow> = sqlx::query_as(
        "SELECT user_id, username, first_name, balance, created_at FROM users WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch user")?;

    Ok(row.map(Into::into))
}
