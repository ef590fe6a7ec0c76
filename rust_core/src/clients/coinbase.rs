//! Coinbase Exchange WebSocket price feed.
//!
//! Subscribes to the public `ticker` channel for BTC-USD. No API key
//! required.

use super::{now_millis, AdapterStatus, Backoff, PriceFeedAdapter, StatusHandle};
use crate::models::PriceSample;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

pub const SOURCE_ID: &str = "coinbase";

pub struct CoinbaseFeed {
    status: StatusHandle,
    backoff: Backoff,
}

impl CoinbaseFeed {
    pub fn new() -> Self {
        Self {
            status: StatusHandle::new(),
            backoff: Backoff::default(),
        }
    }

    async fn run(mut self, tx: mpsc::Sender<PriceSample>) {
        let subscribe = json!({
            "type": "subscribe",
            "product_ids": ["BTC-USD"],
            "channels": ["ticker"],
        })
        .to_string();

        loop {
            self.status.set(AdapterStatus::Connecting);
            info!("Coinbase feed connecting to {}", WS_URL);

            match tokio_tungstenite::connect_async(WS_URL).await {
                Ok((ws_stream, _)) => {
                    let (mut write, mut read) = ws_stream.split();

                    if let Err(e) = write.send(Message::Text(subscribe.clone())).await {
                        warn!("Coinbase feed subscribe failed: {}", e);
                    } else {
                        info!("Coinbase feed connected and subscribed");
                        self.status.set(AdapterStatus::Connected);
                        self.backoff.reset();

                        while let Some(result) = read.next().await {
                            match result {
                                Ok(msg) => {
                                    if let Ok(text) = msg.to_text() {
                                        if text.is_empty() {
                                            continue;
                                        }
                                        if let Some(sample) = parse_ticker(text) {
                                            if tx.send(sample).await.is_err() {
                                                info!("Coinbase feed channel closed, exiting");
                                                return;
                                            }
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!("Coinbase feed read error: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    self.status.set(AdapterStatus::Disconnected);
                }
                Err(e) => {
                    warn!("Coinbase feed connect error: {}", e);
                    self.status.set(AdapterStatus::Disconnected);
                }
            }

            match self.backoff.next_delay() {
                Some(delay) => {
                    info!(
                        "Coinbase feed reconnecting in {:?} (attempt {})",
                        delay,
                        self.backoff.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("Coinbase feed max reconnect attempts reached, going inert");
                    self.status.set(AdapterStatus::MaxReconnectReached);
                    return;
                }
            }
        }
    }
}

impl Default for CoinbaseFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceFeedAdapter for CoinbaseFeed {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn source_ids(&self) -> &'static [&'static str] {
        &[SOURCE_ID]
    }

    fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    fn spawn(self: Box<Self>, tx: mpsc::Sender<PriceSample>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx).await })
    }
}

/// Ticker channel message. Other message types (subscriptions, heartbeat)
/// simply fail the `type` check and are dropped.
#[derive(Debug, Deserialize)]
struct TickerMessage {
    #[serde(rename = "type")]
    msg_type: String,
    product_id: Option<String>,
    price: Option<String>,
    best_bid: Option<String>,
    best_ask: Option<String>,
}

fn parse_ticker(text: &str) -> Option<PriceSample> {
    let msg: TickerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("Coinbase feed unparseable frame: {}", e);
            return None;
        }
    };

    if msg.msg_type != "ticker" || msg.product_id.as_deref() != Some("BTC-USD") {
        return None;
    }

    let price: f64 = msg.price?.parse().ok()?;
    if price <= 0.0 {
        return None;
    }
    let best_bid = msg.best_bid.and_then(|s| s.parse().ok());
    let best_ask = msg.best_ask.and_then(|s| s.parse().ok());

    Some(PriceSample {
        source_id: SOURCE_ID.to_string(),
        mid_price: price,
        best_bid,
        best_ask,
        timestamp_ms: now_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ticker() {
        let text = r#"{"type":"ticker","sequence":1,"product_id":"BTC-USD","price":"65000.01","best_bid":"64999.99","best_ask":"65000.03"}"#;
        let sample = parse_ticker(text).unwrap();
        assert_eq!(sample.source_id, "coinbase");
        assert_eq!(sample.mid_price, 65000.01);
        assert_eq!(sample.best_bid, Some(64999.99));
    }

    #[test]
    fn test_non_ticker_dropped() {
        assert!(parse_ticker(r#"{"type":"subscriptions","channels":[]}"#).is_none());
        assert!(parse_ticker(r#"{"type":"heartbeat","sequence":2}"#).is_none());
        assert!(parse_ticker("junk").is_none());
    }

    #[test]
    fn test_wrong_product_dropped() {
        let text = r#"{"type":"ticker","product_id":"ETH-USD","price":"3500.00"}"#;
        assert!(parse_ticker(text).is_none());
    }
}
