//! Matching scenarios exercised at the book-plan level.
//!
//! These cover the fill, refund, and trigger arithmetic end to end against
//! the in-memory structures; the ledger-coupled paths are covered by the
//! database integration tests.

use exchange_service_rust::engine::book::{BookEntry, OrderBook};
use exchange_service_rust::engine::stops::{StopEntry, StopSet};
use updown_rust_core::models::{
    book_params, market_pseudo_price, taker_cost_per_share, BookSide, Outcome, Side,
};

fn rest_limit(
    book: &mut OrderBook,
    order_id: i64,
    user_id: i64,
    side: Side,
    outcome: Outcome,
    price: i16,
    shares: i32,
    at: i64,
) {
    let (book_side, book_price, cost_per_share) = book_params(side, outcome, price);
    book.insert(
        book_side,
        BookEntry {
            order_id,
            user_id,
            price: book_price,
            remaining: shares,
            cost_per_share,
            created_at_ms: at,
        },
    );
}

/// Scenario: a crossing limit sell executes at the resting bid's price and
/// the taker is refunded the improvement.
#[test]
fn limit_crosses_and_improves() {
    let mut book = OrderBook::new();

    // U1 buys yes 50c x 10: costs $5, rests at bid 50
    rest_limit(&mut book, 1, 1, Side::Buy, Outcome::Yes, 50, 10, 1000);

    // U2 sells yes 40c x 6
    let (book_side, book_price, cost_per_share) = book_params(Side::Sell, Outcome::Yes, 40);
    assert_eq!(book_side, BookSide::Ask);
    assert_eq!(book_price, 40);
    assert_eq!(cost_per_share, 60); // reserves (100-40)*6 = $3.60

    let fills = book.plan_fills(2, book_side, book_price, 6);
    assert_eq!(fills.len(), 1);
    let fill = &fills[0];
    assert_eq!(fill.maker_order_id, 1);
    assert_eq!(fill.qty, 6);
    assert_eq!(fill.price, 50); // maker price

    // Reserved $3.60, actual cost (100-50)*6 = $3.00, refund $0.60
    let reserved = cost_per_share as i64 * 6;
    let actual = taker_cost_per_share(book_side, fill.price) as i64 * 6;
    assert_eq!(reserved, 360);
    assert_eq!(actual, 300);
    assert_eq!(reserved - actual, 60);

    // Remaining book: U1 bid 50 x 4
    book.apply_fills(&fills);
    let bids = book.entries(BookSide::Bid);
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].order_id, 1);
    assert_eq!(bids[0].remaining, 4);
    assert_eq!(bids[0].price, 50);
}

/// Scenario: FOK fails on insufficient matchable shares and changes nothing.
#[test]
fn fok_insufficient_liquidity() {
    let mut book = OrderBook::new();
    rest_limit(&mut book, 1, 1, Side::Sell, Outcome::Yes, 60, 10, 1000);
    rest_limit(&mut book, 2, 2, Side::Sell, Outcome::Yes, 61, 5, 1100);

    // buy yes FOK 61 x 20 -> only 15 available
    let (book_side, book_price, _) = book_params(Side::Buy, Outcome::Yes, 61);
    let available = book.matchable_shares(3, book_side, book_price);
    assert_eq!(available, 15);
    assert!(available < 20);

    // Book untouched
    assert_eq!(book.entries(BookSide::Ask).len(), 2);
}

/// Scenario: a FAK from the same user skips their own resting order, finds
/// nothing else, and cancels in full.
#[test]
fn self_trade_prevention_on_market_fak() {
    let mut book = OrderBook::new();
    rest_limit(&mut book, 1, 1, Side::Sell, Outcome::Yes, 40, 5, 1000);

    let pseudo = market_pseudo_price(Side::Buy, Outcome::Yes);
    let (book_side, book_price, cost_per_share) = book_params(Side::Buy, Outcome::Yes, pseudo);
    assert_eq!(cost_per_share, 99);

    let fills = book.plan_fills(1, book_side, book_price, 5);
    assert!(fills.is_empty());

    // Residual 5 is cancelled; the reservation comes back in full
    let refund = 5i64 * cost_per_share as i64;
    assert_eq!(refund, 495);
    assert!(book.contains(1));
}

/// Scenario: stop-limit sell arms when the best bid reaches the stop, then
/// crosses bids at or above its limit.
#[test]
fn stop_limit_triggers_and_matches() {
    let mut book = OrderBook::new();
    let mut stops = StopSet::new();

    // U1 parks: sell yes stop=30 limit=25 x 10. No balance reserved.
    let (book_side, book_price, cost_per_share) = book_params(Side::Sell, Outcome::Yes, 25);
    assert_eq!(book_side, BookSide::Ask);
    stops.insert(StopEntry {
        order_id: 7,
        user_id: 1,
        book_side,
        stop_price: 30,
        limit_price: book_price,
        shares: 10,
        cost_per_share,
    });

    // Best bid at 29: nothing arms
    rest_limit(&mut book, 2, 2, Side::Buy, Outcome::Yes, 29, 4, 1000);
    assert!(stops.triggered(book.best_bid(), book.best_ask()).is_empty());

    // Another user lifts the bid to 30
    rest_limit(&mut book, 3, 3, Side::Buy, Outcome::Yes, 30, 6, 1100);
    let triggered = stops.triggered(book.best_bid(), book.best_ask());
    assert_eq!(triggered, vec![7]);

    // Activation deducts (100-25)*10 = $7.50
    let entry = stops.remove(7).unwrap();
    assert_eq!(entry.shares as i64 * entry.cost_per_share as i64, 750);

    // As a fresh limit ask at 25 it crosses both bids (30 first, then 29)
    let fills = book.plan_fills(entry.user_id, entry.book_side, entry.limit_price, entry.shares);
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].maker_order_id, 3);
    assert_eq!(fills[0].price, 30);
    assert_eq!(fills[0].qty, 6);
    assert_eq!(fills[1].maker_order_id, 2);
    assert_eq!(fills[1].price, 29);
    assert_eq!(fills[1].qty, 4);
}

/// Price-time priority across a multi-fill sweep: every fill executes at
/// the maker's own price, and the bid/ask bound holds for each.
#[test]
fn exec_price_is_always_the_makers() {
    let mut book = OrderBook::new();
    rest_limit(&mut book, 1, 1, Side::Sell, Outcome::Yes, 40, 3, 1000);
    rest_limit(&mut book, 2, 2, Side::Sell, Outcome::Yes, 45, 3, 1100);
    rest_limit(&mut book, 3, 3, Side::Sell, Outcome::Yes, 50, 3, 1200);

    let (book_side, book_price, _) = book_params(Side::Buy, Outcome::Yes, 50);
    let fills = book.plan_fills(9, book_side, book_price, 9);

    assert_eq!(fills.len(), 3);
    let prices: Vec<i16> = fills.iter().map(|f| f.price).collect();
    assert_eq!(prices, vec![40, 45, 50]);
    for fill in &fills {
        // bid limit >= exec = maker ask price
        assert!(book_price >= fill.price);
    }
}

/// NO-outcome orders land on the complementary YES-scale price.
#[test]
fn no_outcome_orders_cross_yes_orders() {
    let mut book = OrderBook::new();

    // U1: buy no 40c x 5 -> ask at 60 on the YES scale
    let (no_side, no_price, no_cost) = book_params(Side::Buy, Outcome::No, 40);
    assert_eq!(no_side, BookSide::Ask);
    assert_eq!(no_price, 60);
    assert_eq!(no_cost, 40);
    book.insert(
        no_side,
        BookEntry {
            order_id: 1,
            user_id: 1,
            price: no_price,
            remaining: 5,
            cost_per_share: no_cost,
            created_at_ms: 1000,
        },
    );

    // U2: buy yes 60c x 5 crosses it exactly
    let (yes_side, yes_price, _) = book_params(Side::Buy, Outcome::Yes, 60);
    let fills = book.plan_fills(2, yes_side, yes_price, 5);
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 60);
    assert_eq!(fills[0].qty, 5);
}
