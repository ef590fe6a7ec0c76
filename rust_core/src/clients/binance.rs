//! Binance WebSocket price feed.
//!
//! One transport carries two logical sub-sources: the USDT and USDC quote
//! legs of BTC, subscribed as a combined stream. Each leg emits its own
//! source ID so the aggregator can weight them independently.
//!
//! No API key required for public market data streams.

use super::{now_millis, AdapterStatus, Backoff, PriceFeedAdapter, StatusHandle};
use crate::models::PriceSample;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STREAM_URL: &str =
    "wss://stream.binance.com:9443/stream?streams=btcusdt@bookTicker/btcusdc@bookTicker";

pub const SOURCE_USDT: &str = "binance_usdt";
pub const SOURCE_USDC: &str = "binance_usdc";

/// Binance combined-stream adapter.
pub struct BinanceFeed {
    status: StatusHandle,
    backoff: Backoff,
}

impl BinanceFeed {
    pub fn new() -> Self {
        Self {
            status: StatusHandle::new(),
            backoff: Backoff::default(),
        }
    }

    async fn run(mut self, tx: mpsc::Sender<PriceSample>) {
        loop {
            self.status.set(AdapterStatus::Connecting);
            info!("Binance feed connecting to {}", STREAM_URL);

            match tokio_tungstenite::connect_async(STREAM_URL).await {
                Ok((ws_stream, _)) => {
                    info!("Binance feed connected");
                    self.status.set(AdapterStatus::Connected);
                    self.backoff.reset();

                    let (_, mut read) = ws_stream.split();
                    while let Some(result) = read.next().await {
                        match result {
                            Ok(msg) => {
                                if let Ok(text) = msg.to_text() {
                                    if text.is_empty() {
                                        continue;
                                    }
                                    if let Some(sample) = parse_combined_frame(text) {
                                        if tx.send(sample).await.is_err() {
                                            info!("Binance feed channel closed, exiting");
                                            return;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("Binance feed read error: {}", e);
                                break;
                            }
                        }
                    }
                    self.status.set(AdapterStatus::Disconnected);
                }
                Err(e) => {
                    warn!("Binance feed connect error: {}", e);
                    self.status.set(AdapterStatus::Disconnected);
                }
            }

            match self.backoff.next_delay() {
                Some(delay) => {
                    info!(
                        "Binance feed reconnecting in {:?} (attempt {})",
                        delay,
                        self.backoff.attempts()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("Binance feed max reconnect attempts reached, going inert");
                    self.status.set(AdapterStatus::MaxReconnectReached);
                    return;
                }
            }
        }
    }
}

impl Default for BinanceFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceFeedAdapter for BinanceFeed {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn source_ids(&self) -> &'static [&'static str] {
        &[SOURCE_USDT, SOURCE_USDC]
    }

    fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    fn spawn(self: Box<Self>, tx: mpsc::Sender<PriceSample>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx).await })
    }
}

/// Combined stream envelope: `{"stream": "...", "data": {...}}`
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: BookTicker,
}

/// bookTicker payload (best bid/ask for a symbol)
#[derive(Debug, Deserialize)]
struct BookTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "b")]
    bid_price: String,
    #[serde(rename = "a")]
    ask_price: String,
}

fn parse_combined_frame(text: &str) -> Option<PriceSample> {
    let frame: CombinedFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("Binance feed unparseable frame: {}", e);
            return None;
        }
    };

    let source_id = match frame.data.symbol.as_str() {
        "BTCUSDT" => SOURCE_USDT,
        "BTCUSDC" => SOURCE_USDC,
        other => {
            debug!("Binance feed unexpected symbol: {}", other);
            return None;
        }
    };

    let bid: f64 = frame.data.bid_price.parse().ok()?;
    let ask: f64 = frame.data.ask_price.parse().ok()?;
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }

    Some(PriceSample {
        source_id: source_id.to_string(),
        mid_price: (bid + ask) / 2.0,
        best_bid: Some(bid),
        best_ask: Some(ask),
        timestamp_ms: now_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usdt_frame() {
        let text = r#"{"stream":"btcusdt@bookTicker","data":{"u":400900217,"s":"BTCUSDT","b":"64999.50","B":"31.21","a":"65000.50","A":"40.66"}}"#;
        let sample = parse_combined_frame(text).unwrap();
        assert_eq!(sample.source_id, SOURCE_USDT);
        assert_eq!(sample.mid_price, 65000.0);
        assert_eq!(sample.best_bid, Some(64999.5));
        assert_eq!(sample.best_ask, Some(65000.5));
    }

    #[test]
    fn test_parse_usdc_frame() {
        let text = r#"{"stream":"btcusdc@bookTicker","data":{"u":1,"s":"BTCUSDC","b":"64990.00","B":"1.0","a":"65010.00","A":"1.0"}}"#;
        let sample = parse_combined_frame(text).unwrap();
        assert_eq!(sample.source_id, SOURCE_USDC);
    }

    #[test]
    fn test_parse_drops_garbage() {
        assert!(parse_combined_frame("not json").is_none());
        assert!(parse_combined_frame(r#"{"stream":"x","data":{"s":"ETHUSDT","b":"1","a":"2"}}"#).is_none());
        assert!(parse_combined_frame(
            r#"{"stream":"x","data":{"s":"BTCUSDT","b":"bogus","a":"2"}}"#
        )
        .is_none());
    }
}
