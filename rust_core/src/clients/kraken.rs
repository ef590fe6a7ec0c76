//! Kraken WebSocket v2 price feed.
//!
//! Subscribes to the public `ticker` channel for BTC/USD. Kraken v2 sends
//! numeric fields as JSON numbers rather than strings.

use super::{now_millis, AdapterStatus, Backoff, PriceFeedAdapter, StatusHandle};
use crate::models::PriceSample;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const WS_URL: &str = "wss://ws.kraken.com/v2";

pub const SOURCE_ID: &str = "kraken";

pub struct KrakenFeed {
    status: StatusHandle,
    backoff: Backoff,
}

impl KrakenFeed {
    pub fn new() -> Self {
        Self {
            status: StatusHandle::new(),
            backoff: Backoff::default(),
        }
    }

    async fn run(mut self, tx: mpsc::Sender<PriceSample>) {
        let subscribe = json!({
            "method": "subscribe",
            "params": {
                "channel": "ticker",
                "symbol": ["BTC/USD"],
            },
        })
        .to_string();

        loop {
            self.status.set(AdapterStatus::Connecting);
            info!("Kraken feed connecting to {}", WS_URL);

            match tokio_tungstenite::connect_async(WS_URL).await {
                Ok((ws_stream, _)) => {
                    let (mut write, mut read) = ws_stream.split();

                    if let Err(e) = write.send(Message::Text(subscribe.clone())).await {
                        warn!("Kraken feed subscribe failed: {}", e);
                    } else {
                        info!("Kraken feed connected and subscribed");
                        self.status.set(AdapterStatus::Connected);
                        self.backoff.reset();

                        while let Some(result) = read.next().await {
                            match result {
                                Ok(msg) => {
                                    if let Ok(text) = msg.to_text() {
                                        if text.is_empty() {
                                            continue;
                                        }
                                        for sample in parse_ticker_frame(text) {
                                            if tx.send(sample).await.is_err() {
                                                info!("Kraken feed channel closed, exiting");
                                                return;
                                            }
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!("Kraken feed read error: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                    self.status.set(AdapterStatus::Disconnected);
                }
                Err(e) => {
                    warn!("Kraken feed connect error: {}", e);
                    self.status.set(AdapterStatus::Disconnected);
                }
            }

            match self.backoff.next_delay() {
                Some(delay) => {
                    info!(
                        "Kraken feed reconnecting in {:?} (attempt {})",
                        delay,
                        self.backoff.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("Kraken feed max reconnect attempts reached, going inert");
                    self.status.set(AdapterStatus::MaxReconnectReached);
                    return;
                }
            }
        }
    }
}

impl Default for KrakenFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceFeedAdapter for KrakenFeed {
    fn name(&self) -> &'static str {
        "kraken"
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

/// v2 channel envelope: `{"channel":"ticker","type":"snapshot","data":[...]}`
#[derive(Debug, Deserialize)]
struct TickerFrame {
    channel: String,
    data: Vec<TickerData>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    symbol: String,
    bid: f64,
    ask: f64,
    last: f64,
}

fn parse_ticker_frame(text: &str) -> Vec<PriceSample> {
    let frame: TickerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            // Status/heartbeat/ack frames land here; only log at debug
            debug!("Kraken feed non-ticker frame: {}", e);
            return Vec::new();
        }
    };

    if frame.channel != "ticker" {
        return Vec::new();
    }

    frame
        .data
        .into_iter()
        .filter(|d| d.symbol == "BTC/USD" && d.last > 0.0)
        .map(|d| PriceSample {
            source_id: SOURCE_ID.to_string(),
            mid_price: if d.bid > 0.0 && d.ask > 0.0 {
                (d.bid + d.ask) / 2.0
            } else {
                d.last
            },
            best_bid: (d.bid > 0.0).then_some(d.bid),
            best_ask: (d.ask > 0.0).then_some(d.ask),
            timestamp_ms: now_millis(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot() {
        let text = r#"{"channel":"ticker","type":"snapshot","data":[{"symbol":"BTC/USD","bid":64999.0,"bid_qty":0.5,"ask":65001.0,"ask_qty":0.2,"last":65000.0,"volume":1000.0,"vwap":64900.0,"low":64000.0,"high":66000.0,"change":100.0,"change_pct":0.15}]}"#;
        let samples = parse_ticker_frame(text);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].source_id, "kraken");
        assert_eq!(samples[0].mid_price, 65000.0);
    }

    #[test]
    fn test_heartbeat_dropped() {
        assert!(parse_ticker_frame(r#"{"channel":"heartbeat"}"#).is_empty());
        assert!(parse_ticker_frame(r#"{"method":"subscribe","success":true}"#).is_empty());
        assert!(parse_ticker_frame("junk").is_empty());
    }

    #[test]
    fn test_other_symbol_dropped() {
        let text = r#"{"channel":"ticker","type":"update","data":[{"symbol":"ETH/USD","bid":3499.0,"ask":3501.0,"last":3500.0}]}"#;
        assert!(parse_ticker_frame(text).is_empty());
    }
}
