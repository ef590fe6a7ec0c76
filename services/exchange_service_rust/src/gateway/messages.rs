//! Client WebSocket protocol.
//!
//! Inbound messages are a tagged enum dispatched exhaustively at the
//! gateway; anything that fails to parse (unknown tag, wrong field types)
//! is rejected uniformly. Dollar amounts travel as decimal strings with two
//! fractional digits; book prices stay plain integers.

use crate::aggregator::AggregatorStatus;
use crate::engine::book::AggregatedBook;
use serde::{Deserialize, Serialize};
use updown_rust_core::models::{
    market_slug, AggregatedPrice, Market, MarketOutcome, Order, Trade, User,
};
use updown_rust_core::utils::money::cents_to_wire;

// ============================================================================
// Inbound
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
        user_id: i64,
        auth_date: i64,
    },
    PlaceOrder {
        order_type: String,
        side: String,
        outcome: String,
        shares: i64,
        #[serde(default)]
        price: Option<i64>,
        #[serde(default)]
        stop_price: Option<i64>,
        #[serde(default)]
        slug: Option<String>,
    },
    CancelOrder {
        order_id: i64,
    },
    GetOrderbook {
        #[serde(default)]
        slug: Option<String>,
    },
    GetMyOrders {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        slug: Option<String>,
    },
    GetOrder {
        order_id: i64,
    },
    AddLiquidity {
        slug: String,
        amount: i64,
    },
    GetMarket {
        slug: String,
    },
    GetMarkets,
    Status,
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub balance: String,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        UserInfo {
            user_id: user.user_id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            balance: cents_to_wire(user.balance_cents),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Price {
        price: f64,
        sources: usize,
        timestamp: i64,
    },
    PriceToBeat {
        slug: String,
        price: f64,
    },
    MarketList {
        markets: Vec<Market>,
    },
    MarketPhaseChange {
        market: Market,
    },
    Market {
        market: Market,
    },
    Orderbook {
        slug: String,
        round_start_ms: i64,
        bids: Vec<crate::engine::book::BookLevel>,
        asks: Vec<crate::engine::book::BookLevel>,
    },
    OrderAccepted {
        order: Order,
        trades: Vec<Trade>,
        /// Price-improvement plus residual refunds, dollars.
        refund: String,
        balance: Option<String>,
    },
    OrderRejected {
        error: String,
    },
    OrderUpdate {
        order: Order,
    },
    OrderCancelled {
        order_id: i64,
        refund: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Trade {
        trade: Trade,
    },
    MyOrders {
        orders: Vec<Order>,
    },
    OrderDetail {
        order: Order,
        trades: Vec<Trade>,
    },
    LiquidityAdded {
        slug: String,
        amount: String,
        yes_shares: i64,
        no_shares: i64,
        balance: String,
        /// Total dollars minted into the round so far, across all users.
        round_liquidity: i64,
    },
    Settlement {
        slug: String,
        round_start_ms: i64,
        outcome: MarketOutcome,
        final_price: f64,
        /// This user's payout, dollars.
        payout: String,
    },
    BalanceUpdate {
        balance: String,
    },
    AuthSuccess {
        user: UserInfo,
    },
    AuthError {
        error: String,
    },
    Status {
        status: AggregatorStatus,
    },
}

impl ServerMessage {
    pub fn price_tick(aggregate: &AggregatedPrice) -> Self {
        ServerMessage::Price {
            price: aggregate.price.unwrap_or(0.0),
            sources: aggregate.sources,
            timestamp: aggregate.timestamp_ms,
        }
    }

    pub fn orderbook(round_start_ms: i64, book: AggregatedBook) -> Self {
        ServerMessage::Orderbook {
            slug: market_slug(round_start_ms),
            round_start_ms,
            bids: book.bids,
            asks: book.asks,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        ServerMessage::OrderRejected { error: error.into() }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_place_order() {
        let raw = r#"{"type":"place_order","order_type":"limit","side":"buy","outcome":"yes","shares":10,"price":50}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::PlaceOrder {
                order_type,
                side,
                shares,
                price,
                stop_price,
                slug,
                ..
            } => {
                assert_eq!(order_type, "limit");
                assert_eq!(side, "buy");
                assert_eq!(shares, 10);
                assert_eq!(price, Some(50));
                assert_eq!(stop_price, None);
                assert_eq!(slug, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_parse_messages_without_fields() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_markets"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetMarkets));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"status"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Status));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"do_magic"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"shares":10}"#).is_err());
    }

    #[test]
    fn test_fractional_shares_rejected() {
        let raw = r#"{"type":"place_order","order_type":"limit","side":"buy","outcome":"yes","shares":10.5,"price":50}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn test_server_message_tagging() {
        let msg = ServerMessage::rejected("Insufficient balance");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "order_rejected");
        assert_eq!(json["error"], "Insufficient balance");
    }

    #[test]
    fn test_orderbook_message_shape() {
        let msg = ServerMessage::orderbook(60_000, AggregatedBook::default());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "orderbook");
        assert_eq!(json["round_start_ms"], 60_000);
        assert!(json["bids"].as_array().unwrap().is_empty());
        assert!(json["asks"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_balance_wire_format() {
        let user = User {
            user_id: 1,
            username: None,
            first_name: "Ada".into(),
            balance_cents: 123456,
            created_at: chrono::Utc::now(),
        };
        let info = UserInfo::from(&user);
        assert_eq!(info.balance, "1234.56");
    }
}
