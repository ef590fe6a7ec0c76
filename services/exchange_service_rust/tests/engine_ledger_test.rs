//! Ledger-coupled engine tests.
//!
//! These require a provisioned Postgres (DATABASE_URL) and should be run
//! with `cargo test -- --ignored`. Each test uses its own round so reruns
//! do not collide; users are (re)created with a known balance.

use exchange_service_rust::engine::{MatchingEngine, PlaceOrderRequest};
use sqlx::PgPool;
use tokio::sync::mpsc;
use updown_rust_core::db::{positions, users};
use updown_rust_core::models::{
    minute_start, MarketOutcome, MarketPhase, OrderStatus, OrderType, Outcome, Side,
};

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for ledger tests");
    PgPool::connect(&url).await.expect("database connection")
}

async fn fresh_user(pool: &PgPool, user_id: i64, balance_cents: i64) {
    users::upsert_user(pool, user_id, None, "test", balance_cents)
        .await
        .expect("user upsert");
    // Reset the balance in case the user already existed
    sqlx::query("UPDATE users SET balance = $2 WHERE user_id = $1")
        .bind(user_id)
        .bind(rust_decimal::Decimal::new(balance_cents, 2))
        .execute(pool)
        .await
        .expect("balance reset");
}

fn engine(pool: PgPool) -> (MatchingEngine, mpsc::UnboundedReceiver<exchange_service_rust::engine::events::EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MatchingEngine::new(pool, 1000, tx), rx)
}

fn limit(side: Side, outcome: Outcome, price: i16, shares: i32) -> PlaceOrderRequest {
    PlaceOrderRequest {
        order_type: OrderType::Limit,
        side,
        outcome,
        shares,
        price: Some(price),
        stop_price: None,
    }
}

/// A unique round far in the past so lifecycle tasks never touch it.
fn test_round(tag: i64) -> i64 {
    minute_start(1_600_000_000_000 + tag * 60_000)
}

#[tokio::test]
#[ignore] // Requires database
async fn test_limit_cross_updates_ledger() {
    let pool = test_pool().await;
    let (engine, _rx) = engine(pool.clone());
    let round = test_round(1);

    fresh_user(&pool, 9_001, 100_000).await;
    fresh_user(&pool, 9_002, 100_000).await;
    engine.init_round(round, MarketPhase::Active).await;

    // U1 buys yes 50 x 10 ($5 reserved)
    let placed = engine
        .place_order(9_001, round, limit(Side::Buy, Outcome::Yes, 50, 10))
        .await
        .expect("placement");
    assert_eq!(placed.order.status, OrderStatus::Open);
    assert_eq!(placed.balance_cents, Some(99_500));

    // U2 sells yes 40 x 6: trades at 50, refund $0.60
    let crossed = engine
        .place_order(9_002, round, limit(Side::Sell, Outcome::Yes, 40, 6))
        .await
        .expect("crossing placement");
    assert_eq!(crossed.trades.len(), 1);
    assert_eq!(crossed.trades[0].exec_price, 50);
    assert_eq!(crossed.trades[0].shares, 6);
    assert_eq!(crossed.refund_cents, 60);
    // 100000 - 360 + 60
    assert_eq!(crossed.balance_cents, Some(99_700));

    let p1 = positions::get_position(&pool, 9_001, round)
        .await
        .expect("position read")
        .expect("U1 position");
    assert_eq!(p1.yes_shares, 6);
    let p2 = positions::get_position(&pool, 9_002, round)
        .await
        .expect("position read")
        .expect("U2 position");
    assert_eq!(p2.no_shares, 6);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_fok_rejection_leaves_no_state() {
    let pool = test_pool().await;
    let (engine, _rx) = engine(pool.clone());
    let round = test_round(2);

    fresh_user(&pool, 9_003, 100_000).await;
    engine.init_round(round, MarketPhase::Active).await;

    let result = engine
        .place_order(
            9_003,
            round,
            PlaceOrderRequest {
                order_type: OrderType::MarketFok,
                side: Side::Buy,
                outcome: Outcome::Yes,
                shares: 20,
                price: None,
                stop_price: None,
            },
        )
        .await;

    let err = result.expect_err("FOK against an empty book must fail");
    assert!(err.to_string().contains("Insufficient liquidity"));

    let user = users::get_user(&pool, 9_003).await.unwrap().unwrap();
    assert_eq!(user.balance_cents, 100_000);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_settlement_pays_winning_side() {
    let pool = test_pool().await;
    let (engine, _rx) = engine(pool.clone());
    let round = test_round(3);

    fresh_user(&pool, 9_004, 100_000).await;
    fresh_user(&pool, 9_005, 100_000).await;
    engine.init_round(round, MarketPhase::Active).await;

    // Build positions {U1: 4 yes / 6 no, U2: 6 yes / 4 no} via two crosses
    engine
        .place_order(9_004, round, limit(Side::Buy, Outcome::Yes, 50, 4))
        .await
        .expect("U1 bid");
    engine
        .place_order(9_005, round, limit(Side::Sell, Outcome::Yes, 50, 4))
        .await
        .expect("U2 cross");
    engine
        .place_order(9_005, round, limit(Side::Buy, Outcome::Yes, 50, 6))
        .await
        .expect("U2 bid");
    engine
        .place_order(9_004, round, limit(Side::Sell, Outcome::Yes, 50, 6))
        .await
        .expect("U1 cross");

    let summary = engine
        .settle_round(round, MarketOutcome::Up, 65_000.0)
        .await
        .expect("settlement");

    // Up: U1 holds 4 yes -> $4, U2 holds 6 yes -> $6
    let payout = |uid: i64| {
        summary
            .payouts
            .iter()
            .find(|p| p.user_id == uid)
            .map(|p| p.amount_cents)
            .unwrap_or(0)
    };
    assert_eq!(payout(9_004), 400);
    assert_eq!(payout(9_005), 600);

    // Sum of payouts equals the winning shares across positions
    let total: i64 = summary.payouts.iter().map(|p| p.amount_cents).sum();
    assert_eq!(total, 1_000);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_cancel_refunds_remaining() {
    let pool = test_pool().await;
    let (engine, _rx) = engine(pool.clone());
    let round = test_round(4);

    fresh_user(&pool, 9_006, 100_000).await;
    engine.init_round(round, MarketPhase::Active).await;

    let placed = engine
        .place_order(9_006, round, limit(Side::Buy, Outcome::Yes, 50, 10))
        .await
        .expect("placement");

    let cancelled = engine
        .cancel_order(9_006, placed.order.id)
        .await
        .expect("cancel");
    assert_eq!(cancelled.refund_cents, 500);
    assert_eq!(cancelled.balance_cents, 100_000);

    // A second cancel is an error, not a second refund
    assert!(engine.cancel_order(9_006, placed.order.id).await.is_err());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_liquidity_provision_mints_both_sides() {
    let pool = test_pool().await;
    let (engine, _rx) = engine(pool.clone());
    let round = test_round(5);

    fresh_user(&pool, 9_007, 100_000).await;
    engine.init_round(round, MarketPhase::Provision).await;

    let outcome = engine
        .provide_liquidity(9_007, round, 25, 10_000)
        .await
        .expect("liquidity");
    assert_eq!(outcome.position.yes_shares, 25);
    assert_eq!(outcome.position.no_shares, 25);
    assert_eq!(outcome.balance_cents, 97_500);

    // Not allowed once the round is active
    engine.set_phase(round, MarketPhase::Active).await;
    assert!(engine.provide_liquidity(9_007, round, 5, 10_000).await.is_err());
}
