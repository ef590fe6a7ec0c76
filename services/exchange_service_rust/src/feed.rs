//! Reference-price feed: distributes aggregator output and persists it.
//!
//! Every non-null aggregate is fanned out to the gateway broadcast channel
//! and appended to the `price_history` time series. Persistence is
//! best-effort: a write error is logged and the fan-out continues.

use crate::gateway::messages::ServerMessage;
use log::{debug, warn};
use sqlx::PgPool;
use tokio::sync::broadcast;
use updown_rust_core::db::prices;
use updown_rust_core::models::AggregatedPrice;

pub async fn run_price_feed(
    pool: PgPool,
    mut aggregate_rx: broadcast::Receiver<AggregatedPrice>,
    broadcast_tx: broadcast::Sender<ServerMessage>,
) {
    loop {
        match aggregate_rx.recv().await {
            Ok(aggregate) => {
                if aggregate.price.is_none() {
                    continue;
                }

                let _ = broadcast_tx.send(ServerMessage::price_tick(&aggregate));

                if let Err(e) = prices::insert_aggregated_price(&pool, &aggregate).await {
                    warn!("Failed to persist price sample: {}", e);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Price feed lagged {} aggregator ticks", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Aggregator channel closed; price feed exiting");
                return;
            }
        }
    }
}
