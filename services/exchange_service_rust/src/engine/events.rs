//! Typed events the matching engine pushes to the session gateway.
//!
//! Events addressed to a user ride that user's outbound queue and are never
//! dropped; book-changed notifications only mark a round dirty (the gateway
//! debounces the actual broadcast).

use updown_rust_core::models::{MarketOutcome, Order, Trade};

/// One user's payout at settlement.
#[derive(Debug, Clone)]
pub struct Payout {
    pub user_id: i64,
    pub amount_cents: i64,
    pub balance_cents: i64,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A resting order changed through someone else's action (a fill or the
    /// settlement sweep); addressed to its owner.
    OrderUpdate { order: Order },

    /// A trade executed; addressed to both counterparties.
    TradeExecuted { trade: Trade },

    /// An order left the live set outside its owner's own cancel request
    /// (stop-limit balance failure at trigger, settlement sweep).
    OrderCancelled {
        user_id: i64,
        order_id: i64,
        refund_cents: i64,
        reason: Option<String>,
    },

    /// A user's balance changed; addressed to that user.
    BalanceUpdate { user_id: i64, balance_cents: i64 },

    /// The round's book changed; the gateway broadcasts a debounced snapshot.
    BookChanged { round_start_ms: i64 },

    /// The round settled; fan out settlement info and the per-user payouts.
    RoundSettled {
        round_start_ms: i64,
        outcome: MarketOutcome,
        final_price: f64,
        payouts: Vec<Payout>,
    },
}
