// Shared models for UpDown Rust services
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Book prices live on an integer cent grid.
pub const MIN_BOOK_PRICE: i16 = 1;
pub const MAX_BOOK_PRICE: i16 = 99;

/// Minute duration in milliseconds (one round).
pub const ROUND_DURATION_MS: i64 = 60_000;

// ============================================================================
// Order & Market Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "yes",
            Outcome::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Outcome::Yes),
            "no" => Some(Outcome::No),
            _ => None,
        }
    }
}

/// Which side of the YES-scale book an order rests on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Bid => "bid",
            BookSide::Ask => "ask",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bid" => Some(BookSide::Bid),
            "ask" => Some(BookSide::Ask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    MarketFak,
    MarketFok,
    Limit,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::MarketFak => "market_fak",
            OrderType::MarketFok => "market_fok",
            OrderType::Limit => "limit",
            OrderType::StopLimit => "stop_limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "market_fak" => Some(OrderType::MarketFak),
            "market_fok" => Some(OrderType::MarketFok),
            "limit" => Some(OrderType::Limit),
            "stop_limit" => Some(OrderType::StopLimit),
            _ => None,
        }
    }

    /// Market orders execute synchronously and never rest in the book.
    pub fn is_market(&self) -> bool {
        matches!(self, OrderType::MarketFak | OrderType::MarketFok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Pre-trigger state of a stop-limit order.
    Stopped,
    /// Reserved for a future time-in-force feature; never produced today.
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Stopped => "stopped",
            OrderStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderStatus::Open),
            "partially_filled" => Some(OrderStatus::PartiallyFilled),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "stopped" => Some(OrderStatus::Stopped),
            "expired" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    /// Statuses a user may still cancel out of.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Open | OrderStatus::PartiallyFilled | OrderStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketPhase {
    Provision,
    Active,
    Closed,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::Provision => "provision",
            MarketPhase::Active => "active",
            MarketPhase::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provision" => Some(MarketPhase::Provision),
            "active" => Some(MarketPhase::Active),
            "closed" => Some(MarketPhase::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketOutcome {
    Up,
    Down,
}

impl MarketOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketOutcome::Up => "up",
            MarketOutcome::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(MarketOutcome::Up),
            "down" => Some(MarketOutcome::Down),
            _ => None,
        }
    }
}

// ============================================================================
// Price Feed Types
// ============================================================================

/// One upstream quote. Transient; only the newest per source is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSample {
    pub source_id: String,
    pub mid_price: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub timestamp_ms: i64,
}

/// Output of the aggregator. `price` is None until any source has reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub price: Option<f64>,
    pub sources: usize,
    pub timestamp_ms: i64,
}

// ============================================================================
// Market (one minute = one round)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub minute_start_ms: i64,
    pub slug: String,
    pub phase: MarketPhase,
    pub price_to_beat: Option<f64>,
    pub final_price: Option<f64>,
    pub outcome: Option<MarketOutcome>,
}

impl Market {
    pub fn new_provision(minute_start_ms: i64) -> Self {
        Self {
            minute_start_ms,
            slug: market_slug(minute_start_ms),
            phase: MarketPhase::Provision,
            price_to_beat: None,
            final_price: None,
            outcome: None,
        }
    }

    pub fn close_ms(&self) -> i64 {
        self.minute_start_ms + ROUND_DURATION_MS
    }
}

/// Slug for the round starting at `minute_start_ms`: `btc-YYYYMMDD-HHMM` (UTC).
pub fn market_slug(minute_start_ms: i64) -> String {
    let dt = Utc
        .timestamp_millis_opt(minute_start_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    format!("btc-{}", dt.format("%Y%m%d-%H%M"))
}

/// Inverse of [`market_slug`]. Returns None for anything malformed.
pub fn slug_to_minute_start(slug: &str) -> Option<i64> {
    let rest = slug.strip_prefix("btc-")?;
    let naive = NaiveDateTime::parse_from_str(rest, "%Y%m%d-%H%M").ok()?;
    Some(Utc.from_utc_datetime(&naive).timestamp_millis())
}

/// Start of the minute containing `now_ms`.
pub fn minute_start(now_ms: i64) -> i64 {
    now_ms - now_ms.rem_euclid(ROUND_DURATION_MS)
}

// ============================================================================
// Orders & Trades
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub round_start_ms: i64,
    pub side: Side,
    pub outcome: Outcome,
    pub book_side: BookSide,
    pub order_type: OrderType,
    /// Price on the YES scale, in [1, 99].
    pub book_price: i16,
    pub stop_price: Option<i16>,
    pub shares: i32,
    pub filled_shares: i32,
    pub remaining_shares: i32,
    /// Integer cents reserved from the placer per share.
    pub cost_per_share: i16,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Cents reserved for the still-unfilled part of this order.
    pub fn remaining_reserved_cents(&self) -> i64 {
        self.remaining_shares as i64 * self.cost_per_share as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub round_start_ms: i64,
    pub bid_order_id: i64,
    pub ask_order_id: i64,
    pub yes_user_id: i64,
    pub no_user_id: i64,
    /// Maker price on the YES scale.
    pub exec_price: i16,
    pub shares: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub user_id: i64,
    pub round_start_ms: i64,
    pub yes_shares: i64,
    pub no_shares: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityProvision {
    pub id: i64,
    pub user_id: i64,
    pub round_start_ms: i64,
    /// Whole dollars; one dollar mints one YES + one NO share.
    pub amount_dollars: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub balance_cents: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Book Normalisation
// ============================================================================

/// Translate a user-facing `(side, outcome, price)` into book coordinates.
///
/// The book lives on the YES price scale. Returns
/// `(book_side, book_price, cost_per_share)`:
///
/// | side | outcome | bookSide | bookPrice | costPerShare |
/// |------|---------|----------|-----------|--------------|
/// | buy  | yes     | bid      | P         | P            |
/// | buy  | no      | ask      | 100-P     | P            |
/// | sell | yes     | ask      | P         | 100-P        |
/// | sell | no      | bid      | 100-P     | 100-P        |
pub fn book_params(side: Side, outcome: Outcome, price: i16) -> (BookSide, i16, i16) {
    let book_side = match (side, outcome) {
        (Side::Buy, Outcome::Yes) | (Side::Sell, Outcome::No) => BookSide::Bid,
        (Side::Buy, Outcome::No) | (Side::Sell, Outcome::Yes) => BookSide::Ask,
    };
    let book_price = match outcome {
        Outcome::Yes => price,
        Outcome::No => 100 - price,
    };
    let cost_per_share = match side {
        Side::Buy => price,
        Side::Sell => 100 - price,
    };
    (book_side, book_price, cost_per_share)
}

/// Pseudo user-price for a market order: cross the entire book.
///
/// On the YES scale a market bid crosses everything when priced 99 and a
/// market ask when priced 1; mapped back through the outcome translation
/// this is the user price that produces that book price.
pub fn market_pseudo_price(side: Side, outcome: Outcome) -> i16 {
    let book_price = match (side, outcome) {
        (Side::Buy, Outcome::Yes) | (Side::Sell, Outcome::No) => MAX_BOOK_PRICE,
        (Side::Buy, Outcome::No) | (Side::Sell, Outcome::Yes) => MIN_BOOK_PRICE,
    };
    match outcome {
        Outcome::Yes => book_price,
        Outcome::No => 100 - book_price,
    }
}

/// Cents the taker actually pays per share when filling at `exec_price`.
pub fn taker_cost_per_share(book_side: BookSide, exec_price: i16) -> i16 {
    match book_side {
        BookSide::Bid => exec_price,
        BookSide::Ask => 100 - exec_price,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_round_trip() {
        // 2024-03-01 12:34 UTC
        let ms = Utc
            .with_ymd_and_hms(2024, 3, 1, 12, 34, 0)
            .unwrap()
            .timestamp_millis();
        let slug = market_slug(ms);
        assert_eq!(slug, "btc-20240301-1234");
        assert_eq!(slug_to_minute_start(&slug), Some(ms));
    }

    #[test]
    fn test_slug_rejects_malformed() {
        assert_eq!(slug_to_minute_start("eth-20240301-1234"), None);
        assert_eq!(slug_to_minute_start("btc-2024-03-01"), None);
        assert_eq!(slug_to_minute_start("btc-20241301-1234"), None);
    }

    #[test]
    fn test_minute_start() {
        assert_eq!(minute_start(0), 0);
        assert_eq!(minute_start(59_999), 0);
        assert_eq!(minute_start(60_000), 60_000);
        assert_eq!(minute_start(61_500), 60_000);
    }

    #[test]
    fn test_book_params_table() {
        assert_eq!(book_params(Side::Buy, Outcome::Yes, 40), (BookSide::Bid, 40, 40));
        assert_eq!(book_params(Side::Buy, Outcome::No, 40), (BookSide::Ask, 60, 40));
        assert_eq!(book_params(Side::Sell, Outcome::Yes, 40), (BookSide::Ask, 40, 60));
        assert_eq!(book_params(Side::Sell, Outcome::No, 40), (BookSide::Bid, 60, 60));
    }

    #[test]
    fn test_market_pseudo_price_crosses_whole_book() {
        // Every market order reserves 99 cents per share.
        for (side, outcome) in [
            (Side::Buy, Outcome::Yes),
            (Side::Buy, Outcome::No),
            (Side::Sell, Outcome::Yes),
            (Side::Sell, Outcome::No),
        ] {
            let pseudo = market_pseudo_price(side, outcome);
            let (book_side, book_price, cost) = book_params(side, outcome, pseudo);
            assert_eq!(cost, 99);
            match book_side {
                BookSide::Bid => assert_eq!(book_price, MAX_BOOK_PRICE),
                BookSide::Ask => assert_eq!(book_price, MIN_BOOK_PRICE),
            }
        }
    }

    #[test]
    fn test_taker_cost_per_share() {
        assert_eq!(taker_cost_per_share(BookSide::Bid, 50), 50);
        assert_eq!(taker_cost_per_share(BookSide::Ask, 50), 50);
        assert_eq!(taker_cost_per_share(BookSide::Ask, 40), 60);
    }

    #[test]
    fn test_status_parse_round_trip() {
        for s in [
            OrderStatus::Open,
            OrderStatus::PartiallyFilled,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Stopped,
            OrderStatus::Expired,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::parse("bogus"), None);
    }

    #[test]
    fn test_remaining_reserved_cents() {
        let order = Order {
            id: 1,
            user_id: 7,
            round_start_ms: 0,
            side: Side::Buy,
            outcome: Outcome::Yes,
            book_side: BookSide::Bid,
            order_type: OrderType::Limit,
            book_price: 50,
            stop_price: None,
            shares: 10,
            filled_shares: 6,
            remaining_shares: 4,
            cost_per_share: 50,
            status: OrderStatus::PartiallyFilled,
            created_at: Utc::now(),
        };
        assert_eq!(order.remaining_reserved_cents(), 200);
    }
}
