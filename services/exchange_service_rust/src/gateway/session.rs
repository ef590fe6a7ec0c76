//! Per-connection WebSocket session: message dispatch and outbound pumping.

use crate::engine::{EngineError, PlaceOrderRequest};
use crate::gateway::messages::{ClientMessage, ServerMessage, UserInfo};
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use updown_rust_core::db::{liquidity, orders, trades, users};
use updown_rust_core::db::orders::OrderFilter;
use updown_rust_core::models::{
    slug_to_minute_start, Market, OrderType, Outcome, Side,
};
use updown_rust_core::utils::money::cents_to_wire;
use uuid::Uuid;

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    info!("WebSocket connected: {}", conn_id);

    let (user_tx, mut user_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut broadcast_rx = state.broadcast_tx.subscribe();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound pump: user-addressed messages take priority; a lagging
    // broadcast receiver sheds the oldest market-wide messages.
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                user = user_rx.recv() => match user {
                    Some(m) => m,
                    None => break,
                },
                broadcasted = broadcast_rx.recv() => match broadcasted {
                    Ok(m) => m,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Connection lagged {} broadcast messages", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let json = match serde_json::to_string(&message) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let mut session_user: Option<i64> = None;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    dispatch(&state, &user_tx, &mut session_user, conn_id, message).await;
                }
                Err(e) => {
                    let _ = user_tx.send(ServerMessage::rejected(format!("Invalid message: {}", e)));
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error on {}: {}", conn_id, e);
                break;
            }
        }
    }

    if let Some(user_id) = session_user {
        state.registry.unregister(user_id, conn_id).await;
    }
    send_task.abort();
    info!("WebSocket closed: {}", conn_id);
}

async fn dispatch(
    state: &AppState,
    user_tx: &mpsc::UnboundedSender<ServerMessage>,
    session_user: &mut Option<i64>,
    conn_id: Uuid,
    message: ClientMessage,
) {
    let reply = |msg: ServerMessage| {
        let _ = user_tx.send(msg);
    };

    match message {
        ClientMessage::Auth { token, user_id, auth_date } => {
            if !state.verifier.verify_session_token(&token, user_id, auth_date) {
                reply(ServerMessage::AuthError {
                    error: "Invalid session token".to_string(),
                });
                return;
            }
            let user = match users::get_user(&state.pool, user_id).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    reply(ServerMessage::AuthError {
                        error: "Unknown user".to_string(),
                    });
                    return;
                }
                Err(e) => {
                    error!("Auth lookup failed: {}", e);
                    reply(ServerMessage::AuthError {
                        error: "Internal error".to_string(),
                    });
                    return;
                }
            };

            if let Some(previous) = session_user.replace(user_id) {
                state.registry.unregister(previous, conn_id).await;
            }
            state.registry.register(user_id, conn_id, user_tx.clone()).await;
            reply(ServerMessage::AuthSuccess {
                user: UserInfo::from(&user),
            });
        }

        ClientMessage::PlaceOrder {
            order_type,
            side,
            outcome,
            shares,
            price,
            stop_price,
            slug,
        } => {
            let Some(user_id) = *session_user else {
                reply(ServerMessage::rejected("Authentication required"));
                return;
            };
            let Some(order_type) = OrderType::parse(&order_type) else {
                reply(ServerMessage::rejected("Invalid order type"));
                return;
            };
            let Some(side) = Side::parse(&side) else {
                reply(ServerMessage::rejected("Invalid side"));
                return;
            };
            let Some(outcome) = Outcome::parse(&outcome) else {
                reply(ServerMessage::rejected("Invalid outcome"));
                return;
            };
            let Ok(shares) = i32::try_from(shares) else {
                reply(ServerMessage::rejected(format!(
                    "Shares must be an integer between 1 and {}",
                    state.config.max_shares_per_order
                )));
                return;
            };
            let price = match narrow_price(price) {
                Ok(p) => p,
                Err(msg) => {
                    reply(ServerMessage::rejected(msg));
                    return;
                }
            };
            let stop_price = match narrow_price(stop_price) {
                Ok(p) => p,
                Err(msg) => {
                    reply(ServerMessage::rejected(msg));
                    return;
                }
            };

            let round_start_ms = match resolve_round(state, slug.as_deref()).await {
                Ok(round) => round,
                Err(msg) => {
                    reply(ServerMessage::rejected(msg));
                    return;
                }
            };

            let request = PlaceOrderRequest {
                order_type,
                side,
                outcome,
                shares,
                price,
                stop_price,
            };
            match state.engine.place_order(user_id, round_start_ms, request).await {
                Ok(outcome) => reply(ServerMessage::OrderAccepted {
                    order: outcome.order,
                    trades: outcome.trades,
                    refund: cents_to_wire(outcome.refund_cents),
                    balance: outcome.balance_cents.map(cents_to_wire),
                }),
                Err(EngineError::Rejected(msg)) => reply(ServerMessage::rejected(msg)),
                Err(EngineError::Internal(e)) => {
                    error!("Placement failed internally: {}", e);
                    reply(ServerMessage::rejected("Internal error"));
                }
            }
        }

        ClientMessage::CancelOrder { order_id } => {
            let Some(user_id) = *session_user else {
                reply(ServerMessage::rejected("Authentication required"));
                return;
            };
            match state.engine.cancel_order(user_id, order_id).await {
                Ok(outcome) => reply(ServerMessage::OrderCancelled {
                    order_id: outcome.order_id,
                    refund: cents_to_wire(outcome.refund_cents),
                    reason: None,
                }),
                Err(EngineError::Rejected(msg)) => reply(ServerMessage::rejected(msg)),
                Err(EngineError::Internal(e)) => {
                    error!("Cancel failed internally: {}", e);
                    reply(ServerMessage::rejected("Internal error"));
                }
            }
        }

        ClientMessage::GetOrderbook { slug } => {
            match resolve_round(state, slug.as_deref()).await {
                Ok(round_start_ms) => {
                    let book = state.engine.orderbook_snapshot(round_start_ms).await;
                    reply(ServerMessage::orderbook(round_start_ms, book));
                }
                Err(msg) => reply(ServerMessage::rejected(msg)),
            }
        }

        ClientMessage::GetMyOrders { status, slug } => {
            let Some(user_id) = *session_user else {
                reply(ServerMessage::rejected("Authentication required"));
                return;
            };
            let filter = match status.as_deref() {
                None => OrderFilter::Open,
                Some(s) => match OrderFilter::parse(s) {
                    Some(f) => f,
                    None => {
                        reply(ServerMessage::rejected("Invalid status filter"));
                        return;
                    }
                },
            };
            let round_start_ms = match slug.as_deref() {
                Some(slug) => match resolve_round(state, Some(slug)).await {
                    Ok(round) => Some(round),
                    Err(msg) => {
                        reply(ServerMessage::rejected(msg));
                        return;
                    }
                },
                None => None,
            };
            match orders::get_user_orders(&state.pool, user_id, filter, round_start_ms).await {
                Ok(orders) => reply(ServerMessage::MyOrders { orders }),
                Err(e) => {
                    error!("Order list failed: {}", e);
                    reply(ServerMessage::rejected("Internal error"));
                }
            }
        }

        ClientMessage::GetOrder { order_id } => {
            let Some(user_id) = *session_user else {
                reply(ServerMessage::rejected("Authentication required"));
                return;
            };
            let order = match orders::get_order(&state.pool, order_id).await {
                Ok(Some(order)) if order.user_id == user_id => order,
                Ok(_) => {
                    reply(ServerMessage::rejected("Order not found"));
                    return;
                }
                Err(e) => {
                    error!("Order lookup failed: {}", e);
                    reply(ServerMessage::rejected("Internal error"));
                    return;
                }
            };
            match trades::get_order_trades(&state.pool, order_id).await {
                Ok(trades) => reply(ServerMessage::OrderDetail { order, trades }),
                Err(e) => {
                    error!("Trade lookup failed: {}", e);
                    reply(ServerMessage::rejected("Internal error"));
                }
            }
        }

        ClientMessage::AddLiquidity { slug, amount } => {
            let Some(user_id) = *session_user else {
                reply(ServerMessage::rejected("Authentication required"));
                return;
            };
            let round_start_ms = match resolve_round(state, Some(&slug)).await {
                Ok(round) => round,
                Err(msg) => {
                    reply(ServerMessage::rejected(msg));
                    return;
                }
            };
            match state
                .engine
                .provide_liquidity(
                    user_id,
                    round_start_ms,
                    amount,
                    state.config.max_liquidity_per_call,
                )
                .await
            {
                Ok(outcome) => {
                    let round_liquidity =
                        liquidity::get_total_liquidity(&state.pool, round_start_ms)
                            .await
                            .unwrap_or_else(|e| {
                                error!("Liquidity total query failed: {}", e);
                                outcome.provision.amount_dollars
                            });
                    reply(ServerMessage::LiquidityAdded {
                        slug,
                        amount: cents_to_wire(outcome.provision.amount_dollars * 100),
                        yes_shares: outcome.position.yes_shares,
                        no_shares: outcome.position.no_shares,
                        balance: cents_to_wire(outcome.balance_cents),
                        round_liquidity,
                    });
                }
                Err(EngineError::Rejected(msg)) => reply(ServerMessage::rejected(msg)),
                Err(EngineError::Internal(e)) => {
                    error!("Liquidity provision failed internally: {}", e);
                    reply(ServerMessage::rejected("Internal error"));
                }
            }
        }

        ClientMessage::GetMarket { slug } => match find_market(state, &slug).await {
            Some(market) => reply(ServerMessage::Market { market }),
            None => reply(ServerMessage::rejected("Market not found")),
        },

        ClientMessage::GetMarkets => {
            let markets = state.table.read().await.market_list();
            reply(ServerMessage::MarketList { markets });
        }

        ClientMessage::Status => {
            let status = state.aggregator.status().await;
            reply(ServerMessage::Status { status });
        }
    }
}

fn narrow_price(price: Option<i64>) -> Result<Option<i16>, &'static str> {
    match price {
        None => Ok(None),
        Some(p) => match i16::try_from(p) {
            Ok(p) => Ok(Some(p)),
            Err(_) => Err("Price must be an integer between 1 and 99"),
        },
    }
}

/// Map an optional slug to a round start. Without a slug the current round
/// is used.
async fn resolve_round(state: &AppState, slug: Option<&str>) -> Result<i64, String> {
    match slug {
        None => state
            .table
            .read()
            .await
            .current_round_start()
            .ok_or_else(|| "No active market".to_string()),
        Some(slug) => {
            if let Some(market) = state.table.read().await.market_by_slug(slug) {
                return Ok(market.minute_start_ms);
            }
            slug_to_minute_start(slug).ok_or_else(|| "Market not found".to_string())
        }
    }
}

/// In-memory market, falling back to the store for aged-out rounds.
async fn find_market(state: &AppState, slug: &str) -> Option<Market> {
    if let Some(market) = state.table.read().await.market_by_slug(slug) {
        return Some(market.clone());
    }
    match updown_rust_core::db::markets::get_market_by_slug(&state.pool, slug).await {
        Ok(market) => market,
        Err(e) => {
            error!("Market lookup failed: {}", e);
            None
        }
    }
}
