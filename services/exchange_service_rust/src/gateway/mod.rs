//! Session gateway: per-user fan-out, engine event pump, and the debounced
//! order book broadcast.
//!
//! Two delivery paths with different loss semantics: user-addressed
//! messages (fills, cancels, settlement, balances) ride unbounded per-user
//! queues and are never dropped; market-wide messages (prices, market
//! lists, order books) ride one lossy broadcast channel where a lagging
//! client sheds the oldest entries.

pub mod messages;
pub mod session;

use crate::engine::events::EngineEvent;
use crate::engine::MatchingEngine;
use crate::gateway::messages::ServerMessage;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::Instant;
use updown_rust_core::models::market_slug;
use updown_rust_core::utils::money::cents_to_wire;
use uuid::Uuid;

// ============================================================================
// User registry
// ============================================================================

/// Reverse map userID -> authenticated connections.
#[derive(Default)]
pub struct UserRegistry {
    inner: RwLock<HashMap<i64, Vec<(Uuid, mpsc::UnboundedSender<ServerMessage>)>>>,
}

impl UserRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(
        &self,
        user_id: i64,
        conn_id: Uuid,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut inner = self.inner.write().await;
        let conns = inner.entry(user_id).or_default();
        conns.retain(|(id, _)| *id != conn_id);
        conns.push((conn_id, tx));
    }

    pub async fn unregister(&self, user_id: i64, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(conns) = inner.get_mut(&user_id) {
            conns.retain(|(id, _)| *id != conn_id);
            if conns.is_empty() {
                inner.remove(&user_id);
            }
        }
    }

    /// Push to every connection of a user. Dead senders are swept lazily.
    pub async fn send_to_user(&self, user_id: i64, message: ServerMessage) {
        let mut inner = self.inner.write().await;
        if let Some(conns) = inner.get_mut(&user_id) {
            conns.retain(|(_, tx)| tx.send(message.clone()).is_ok());
            if conns.is_empty() {
                inner.remove(&user_id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.values().map(Vec::len).sum()
    }
}

// ============================================================================
// Order book broadcast debouncer
// ============================================================================

struct DebounceEntry {
    last_sent: Instant,
    pending: bool,
}

/// At most one `orderbook` broadcast per round per debounce window, with a
/// trailing send so the final state always goes out.
pub struct BookDebouncer {
    engine: Arc<MatchingEngine>,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    window: Duration,
    state: Arc<Mutex<HashMap<i64, DebounceEntry>>>,
}

impl BookDebouncer {
    pub fn new(
        engine: Arc<MatchingEngine>,
        broadcast_tx: broadcast::Sender<ServerMessage>,
        window_ms: u64,
    ) -> Self {
        Self {
            engine,
            broadcast_tx,
            window: Duration::from_millis(window_ms),
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn mark_dirty(&self, round_start_ms: i64) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        match state.get_mut(&round_start_ms) {
            None => {
                state.insert(
                    round_start_ms,
                    DebounceEntry { last_sent: now, pending: false },
                );
                drop(state);
                send_book_snapshot(&self.engine, &self.broadcast_tx, round_start_ms).await;
            }
            Some(entry) => {
                if entry.pending {
                    return;
                }
                let elapsed = now.duration_since(entry.last_sent);
                if elapsed >= self.window {
                    entry.last_sent = now;
                    drop(state);
                    send_book_snapshot(&self.engine, &self.broadcast_tx, round_start_ms).await;
                } else {
                    entry.pending = true;
                    let delay = self.window - elapsed;
                    let engine = Arc::clone(&self.engine);
                    let broadcast_tx = self.broadcast_tx.clone();
                    let shared = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        {
                            let mut state = shared.lock().await;
                            if let Some(entry) = state.get_mut(&round_start_ms) {
                                entry.pending = false;
                                entry.last_sent = Instant::now();
                            }
                        }
                        send_book_snapshot(&engine, &broadcast_tx, round_start_ms).await;
                    });
                }
            }
        }
    }

    /// Drop debounce state once a round is settled.
    pub async fn forget(&self, round_start_ms: i64) {
        self.state.lock().await.remove(&round_start_ms);
    }
}

async fn send_book_snapshot(
    engine: &MatchingEngine,
    broadcast_tx: &broadcast::Sender<ServerMessage>,
    round_start_ms: i64,
) {
    let book = engine.orderbook_snapshot(round_start_ms).await;
    let _ = broadcast_tx.send(ServerMessage::orderbook(round_start_ms, book));
}

// ============================================================================
// Engine event pump
// ============================================================================

/// Translate engine events into wire messages and route them.
pub async fn run_engine_events(
    mut events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    registry: Arc<UserRegistry>,
    debouncer: BookDebouncer,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            EngineEvent::OrderUpdate { order } => {
                let user_id = order.user_id;
                registry
                    .send_to_user(user_id, ServerMessage::OrderUpdate { order })
                    .await;
            }
            EngineEvent::TradeExecuted { trade } => {
                registry
                    .send_to_user(trade.yes_user_id, ServerMessage::Trade { trade: trade.clone() })
                    .await;
                registry
                    .send_to_user(trade.no_user_id, ServerMessage::Trade { trade })
                    .await;
            }
            EngineEvent::OrderCancelled {
                user_id,
                order_id,
                refund_cents,
                reason,
            } => {
                registry
                    .send_to_user(
                        user_id,
                        ServerMessage::OrderCancelled {
                            order_id,
                            refund: cents_to_wire(refund_cents),
                            reason,
                        },
                    )
                    .await;
            }
            EngineEvent::BalanceUpdate { user_id, balance_cents } => {
                registry
                    .send_to_user(
                        user_id,
                        ServerMessage::BalanceUpdate {
                            balance: cents_to_wire(balance_cents),
                        },
                    )
                    .await;
            }
            EngineEvent::BookChanged { round_start_ms } => {
                debouncer.mark_dirty(round_start_ms).await;
            }
            EngineEvent::RoundSettled {
                round_start_ms,
                outcome,
                final_price,
                payouts,
            } => {
                debug!(
                    "Settlement fan-out for round {}: {} payouts",
                    round_start_ms,
                    payouts.len()
                );
                debouncer.forget(round_start_ms).await;
                for payout in payouts {
                    registry
                        .send_to_user(
                            payout.user_id,
                            ServerMessage::Settlement {
                                slug: market_slug(round_start_ms),
                                round_start_ms,
                                outcome,
                                final_price,
                                payout: cents_to_wire(payout.amount_cents),
                            },
                        )
                        .await;
                }
            }
        }
    }
    warn!("Engine event channel closed; gateway pump exiting");
}
