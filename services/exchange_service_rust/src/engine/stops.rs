//! Per-round stop-limit set.
//!
//! Parked stop orders hold no balance and sit outside the book until the
//! top of book reaches their trigger. A bid stop arms when YES becomes
//! cheap enough to buy; an ask stop arms when YES becomes expensive enough
//! to sell.

use std::collections::BTreeMap;
use updown_rust_core::models::BookSide;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEntry {
    pub order_id: i64,
    pub user_id: i64,
    pub book_side: BookSide,
    pub stop_price: i16,
    /// Book price the order becomes a limit at once triggered.
    pub limit_price: i16,
    pub shares: i32,
    pub cost_per_share: i16,
}

/// Keyed by order id, which is monotonically assigned, so iteration order
/// doubles as arrival order when several stops trigger on one tick.
#[derive(Debug, Default, Clone)]
pub struct StopSet {
    entries: BTreeMap<i64, StopEntry>,
}

impl StopSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: StopEntry) {
        self.entries.insert(entry.order_id, entry);
    }

    pub fn remove(&mut self, order_id: i64) -> Option<StopEntry> {
        self.entries.remove(&order_id)
    }

    pub fn contains(&self, order_id: i64) -> bool {
        self.entries.contains_key(&order_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Order ids whose trigger condition holds against the current top of
    /// book: bid stops when `bestAsk <= stopPrice`, ask stops when
    /// `bestBid >= stopPrice`.
    pub fn triggered(&self, best_bid: Option<i16>, best_ask: Option<i16>) -> Vec<i64> {
        self.entries
            .values()
            .filter(|e| match e.book_side {
                BookSide::Bid => best_ask.is_some_and(|ask| ask <= e.stop_price),
                BookSide::Ask => best_bid.is_some_and(|bid| bid >= e.stop_price),
            })
            .map(|e| e.order_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stop(order_id: i64, side: BookSide, stop_price: i16, limit_price: i16) -> StopEntry {
        StopEntry {
            order_id,
            user_id: 1,
            book_side: side,
            stop_price,
            limit_price,
            shares: 10,
            cost_per_share: match side {
                BookSide::Bid => limit_price,
                BookSide::Ask => 100 - limit_price,
            },
        }
    }

    #[test]
    fn test_bid_stop_triggers_on_cheap_ask() {
        let mut stops = StopSet::new();
        stops.insert(stop(1, BookSide::Bid, 30, 35));

        assert!(stops.triggered(None, Some(31)).is_empty());
        assert_eq!(stops.triggered(None, Some(30)), vec![1]);
        assert_eq!(stops.triggered(None, Some(25)), vec![1]);
        // No ask in the book: nothing to trigger against
        assert!(stops.triggered(Some(99), None).is_empty());
    }

    #[test]
    fn test_ask_stop_triggers_on_expensive_bid() {
        let mut stops = StopSet::new();
        stops.insert(stop(2, BookSide::Ask, 30, 25));

        assert!(stops.triggered(Some(29), None).is_empty());
        assert_eq!(stops.triggered(Some(30), None), vec![2]);
        assert_eq!(stops.triggered(Some(70), None), vec![2]);
        assert!(stops.triggered(None, Some(1)).is_empty());
    }

    #[test]
    fn test_triggered_returns_arrival_order() {
        let mut stops = StopSet::new();
        stops.insert(stop(5, BookSide::Ask, 30, 25));
        stops.insert(stop(3, BookSide::Ask, 40, 35));
        stops.insert(stop(4, BookSide::Bid, 20, 22));

        assert_eq!(stops.triggered(Some(50), Some(60)), vec![3, 5]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut stops = StopSet::new();
        stops.insert(stop(1, BookSide::Bid, 30, 35));
        assert!(stops.contains(1));
        assert_eq!(stops.len(), 1);
        assert!(stops.remove(1).is_some());
        assert!(!stops.contains(1));
        assert!(stops.remove(1).is_none());
        assert!(stops.is_empty());
    }
}
