//! Order rows: the durable shadow of the matching engine's books.

use crate::models::{BookSide, Order, OrderStatus, OrderType, Outcome, Side};
use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};

const ORDER_COLUMNS: &str = "id, user_id, round_start_ms, side, outcome, book_side, order_type, \
                             book_price, stop_price, shares, filled_shares, remaining_shares, \
                             cost_per_share, status, created_at";

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

impl<'r> FromRow<'r, PgRow> for Order {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let side_s: String = row.try_get("side")?;
        let outcome_s: String = row.try_get("outcome")?;
        let book_side_s: String = row.try_get("book_side")?;
        let order_type_s: String = row.try_get("order_type")?;
        let status_s: String = row.try_get("status")?;

        Ok(Order {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            round_start_ms: row.try_get("round_start_ms")?,
            side: Side::parse(&side_s)
                .ok_or_else(|| decode_err(format!("invalid side: {}", side_s)))?,
            outcome: Outcome::parse(&outcome_s)
                .ok_or_else(|| decode_err(format!("invalid outcome: {}", outcome_s)))?,
            book_side: BookSide::parse(&book_side_s)
                .ok_or_else(|| decode_err(format!("invalid book_side: {}", book_side_s)))?,
            order_type: OrderType::parse(&order_type_s)
                .ok_or_else(|| decode_err(format!("invalid order_type: {}", order_type_s)))?,
            book_price: row.try_get("book_price")?,
            stop_price: row.try_get("stop_price")?,
            shares: row.try_get("shares")?,
            filled_shares: row.try_get("filled_shares")?,
            remaining_shares: row.try_get("remaining_shares")?,
            cost_per_share: row.try_get("cost_per_share")?,
            status: OrderStatus::parse(&status_s)
                .ok_or_else(|| decode_err(format!("invalid status: {}", status_s)))?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Fields of an order before it has an id or timestamp.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: i64,
    pub round_start_ms: i64,
    pub side: Side,
    pub outcome: Outcome,
    pub book_side: BookSide,
    pub order_type: OrderType,
    pub book_price: i16,
    pub stop_price: Option<i16>,
    pub shares: i32,
    pub cost_per_share: i16,
    pub status: OrderStatus,
}

pub async fn insert_order(tx: &mut Transaction<'_, Postgres>, new: &NewOrder) -> Result<Order> {
    let query = format!(
        r#"
        INSERT INTO orders (
            user_id, round_start_ms, side, outcome, book_side, order_type,
            book_price, stop_price, shares, filled_shares, remaining_shares,
            cost_per_share, status, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $9, $10, $11, NOW())
        RETURNING {}
        "#,
        ORDER_COLUMNS
    );

    let order: Order = sqlx::query_as(&query)
        .bind(new.user_id)
        .bind(new.round_start_ms)
        .bind(new.side.as_str())
        .bind(new.outcome.as_str())
        .bind(new.book_side.as_str())
        .bind(new.order_type.as_str())
        .bind(new.book_price)
        .bind(new.stop_price)
        .bind(new.shares)
        .bind(new.cost_per_share)
        .bind(new.status.as_str())
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert order")?;

    Ok(order)
}

/// Update an order's fill counters and status after a match.
pub async fn update_order_fill(
    tx: &mut Transaction<'_, Postgres>,
    order_id: i64,
    filled_shares: i32,
    remaining_shares: i32,
    status: OrderStatus,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE orders
        SET filled_shares = $2, remaining_shares = $3, status = $4
        WHERE id = $1
        "#,
    )
    .bind(order_id)
    .bind(filled_shares)
    .bind(remaining_shares)
    .bind(status.as_str())
    .execute(&mut **tx)
    .await
    .context("Failed to update order fill")?;

    Ok(())
}

pub async fn set_order_status(
    tx: &mut Transaction<'_, Postgres>,
    order_id: i64,
    status: OrderStatus,
) -> Result<()> {
    sqlx::query("UPDATE orders SET status = $2 WHERE id = $1")
        .bind(order_id)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .context("Failed to set order status")?;

    Ok(())
}

/// Mark a parked stop-limit as live (`stopped` -> `open`).
pub async fn activate_stop_order(tx: &mut Transaction<'_, Postgres>, order_id: i64) -> Result<()> {
    sqlx::query("UPDATE orders SET status = 'open' WHERE id = $1 AND status = 'stopped'")
        .bind(order_id)
        .execute(&mut **tx)
        .await
        .context("Failed to activate stop order")?;

    Ok(())
}

/// Cancel every live order of a round, returning the pre-cancel rows.
///
/// The snapshot carries each order's status and remaining shares as they
/// were before the sweep, which settlement needs for refunds.
pub async fn cancel_all_round_orders(
    tx: &mut Transaction<'_, Postgres>,
    round_start_ms: i64,
) -> Result<Vec<Order>> {
    let orders: Vec<Order> = sqlx::query_as(
        r#"
        WITH live AS (
            SELECT id, user_id, round_start_ms, side, outcome, book_side, order_type,
                   book_price, stop_price, shares, filled_shares, remaining_shares,
                   cost_per_share, status, created_at
            FROM orders
            WHERE round_start_ms = $1
              AND status IN ('open', 'partially_filled', 'stopped')
            FOR UPDATE
        )
        UPDATE orders o
        SET status = 'cancelled'
        FROM live
        WHERE o.id = live.id
        RETURNING live.id, live.user_id, live.round_start_ms, live.side, live.outcome,
                  live.book_side, live.order_type, live.book_price, live.stop_price,
                  live.shares, live.filled_shares, live.remaining_shares,
                  live.cost_per_share, live.status, live.created_at
        "#,
    )
    .bind(round_start_ms)
    .fetch_all(&mut **tx)
    .await
    .context("Failed to cancel round orders")?;

    Ok(orders)
}

pub async fn get_order(pool: &PgPool, order_id: i64) -> Result<Option<Order>> {
    let query = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
    let order: Option<Order> = sqlx::query_as(&query)
        .bind(order_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch order")?;

    Ok(order)
}

/// Same as [`get_order`] but with a row lock inside the caller's transaction.
pub async fn get_order_for_update(
    tx: &mut Transaction<'_, Postgres>,
    order_id: i64,
) -> Result<Option<Order>> {
    let query = format!("SELECT {} FROM orders WHERE id = $1 FOR UPDATE", ORDER_COLUMNS);
    let order: Option<Order> = sqlx::query_as(&query)
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await
        .context("Failed to fetch order for update")?;

    Ok(order)
}

/// User-facing order list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFilter {
    /// open, partially_filled and stopped
    Open,
    All,
    Filled,
    Cancelled,
}

impl OrderFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderFilter::Open),
            "all" => Some(OrderFilter::All),
            "filled" => Some(OrderFilter::Filled),
            "cancelled" => Some(OrderFilter::Cancelled),
            _ => None,
        }
    }
}

pub async fn get_user_orders(
    pool: &PgPool,
    user_id: i64,
    filter: OrderFilter,
    round_start_ms: Option<i64>,
) -> Result<Vec<Order>> {
    let status_clause = match filter {
        OrderFilter::Open => " AND status IN ('open', 'partially_filled', 'stopped')",
        OrderFilter::All => "",
        OrderFilter::Filled => " AND status = 'filled'",
        OrderFilter::Cancelled => " AND status = 'cancelled'",
    };
    let round_clause = if round_start_ms.is_some() {
        " AND round_start_ms = $2"
    } else {
        ""
    };
    let query = format!(
        "SELECT {} FROM orders WHERE user_id = $1{}{} ORDER BY created_at DESC LIMIT 200",
        ORDER_COLUMNS, status_clause, round_clause
    );

    let mut q = sqlx::query_as(&query).bind(user_id);
    if let Some(round) = round_start_ms {
        q = q.bind(round);
    }

    let orders: Vec<Order> = q
        .fetch_all(pool)
        .await
        .context("Failed to fetch user orders")?;

    Ok(orders)
}

/// Live (open / partially filled) orders of a round, oldest first so a
/// reload reproduces time priority.
pub async fn get_open_round_orders(pool: &PgPool, round_start_ms: i64) -> Result<Vec<Order>> {
    let query = format!(
        "SELECT {} FROM orders WHERE round_start_ms = $1 \
         AND status IN ('open', 'partially_filled') ORDER BY created_at ASC",
        ORDER_COLUMNS
    );
    let orders: Vec<Order> = sqlx::query_as(&query)
        .bind(round_start_ms)
        .fetch_all(pool)
        .await
        .context("Failed to fetch open round orders")?;

    Ok(orders)
}

/// Parked stop-limit orders of a round.
pub async fn get_stopped_round_orders(pool: &PgPool, round_start_ms: i64) -> Result<Vec<Order>> {
    let query = format!(
        "SELECT {} FROM orders WHERE round_start_ms = $1 AND status = 'stopped' \
         ORDER BY created_at ASC",
        ORDER_COLUMNS
    );
    let orders: Vec<Order> = sqlx::query_as(&query)
        .bind(round_start_ms)
        .fetch_all(pool)
        .await
        .context("Failed to fetch stopped round orders")?;

    Ok(orders)
}
