//! CoinGecko REST polling price feed.
//!
//! The free API has no streaming endpoint, so this adapter polls
//! `/simple/price` on a fixed interval. The poll interval doubles as the
//! upstream rate limit; errors back off like the socket adapters.

use super::{now_millis, AdapterStatus, Backoff, PriceFeedAdapter, StatusHandle};
use crate::models::PriceSample;
use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BASE_URL: &str = "https://api.coingecko.com/api/v3";

pub const SOURCE_ID: &str = "coingecko";

pub struct CoinGeckoFeed {
    client: Client,
    poll_interval: Duration,
    status: StatusHandle,
    backoff: Backoff,
}

impl CoinGeckoFeed {
    pub fn new(poll_interval: Duration) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("UpDown/1.0")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            poll_interval,
            status: StatusHandle::new(),
            backoff: Backoff::default(),
        }
    }

    async fn fetch_price(&self) -> Result<f64> {
        let url = format!("{}/simple/price?ids=bitcoin&vs_currencies=usd", BASE_URL);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch from CoinGecko")?;

        if !response.status().is_success() {
            return Err(anyhow!("CoinGecko API error: {}", response.status()));
        }

        let body: HashMap<String, SimplePrice> = response
            .json()
            .await
            .context("Failed to parse CoinGecko response")?;

        let price = body
            .get("bitcoin")
            .map(|p| p.usd)
            .ok_or_else(|| anyhow!("CoinGecko response missing bitcoin"))?;

        if price <= 0.0 {
            return Err(anyhow!("CoinGecko returned non-positive price"));
        }

        Ok(price)
    }

    async fn run(mut self, tx: mpsc::Sender<PriceSample>) {
        info!(
            "CoinGecko feed polling every {:?}",
            self.poll_interval
        );

        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            ticker.tick().await;

            match self.fetch_price().await {
                Ok(price) => {
                    self.status.set(AdapterStatus::Connected);
                    self.backoff.reset();

                    let sample = PriceSample {
                        source_id: SOURCE_ID.to_string(),
                        mid_price: price,
                        best_bid: None,
                        best_ask: None,
                        timestamp_ms: now_millis(),
                    };
                    if tx.send(sample).await.is_err() {
                        info!("CoinGecko feed channel closed, exiting");
                        return;
                    }
                }
                Err(e) => {
                    debug!("CoinGecko poll failed: {}", e);
                    self.status.set(AdapterStatus::Disconnected);

                    match self.backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                "CoinGecko feed backing off {:?} (attempt {})",
                                delay,
                                self.backoff.attempts()
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!("CoinGecko feed max retry attempts reached, going inert");
                            self.status.set(AdapterStatus::MaxReconnectReached);
                            return;
                        }
                    }
                }
            }
        }
    }
}

impl PriceFeedAdapter for CoinGeckoFeed {
    fn name(&self) -> &'static str {
        "coingecko"
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

#[derive(Debug, Deserialize)]
struct SimplePrice {
    usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_price_parse() {
        let body = r#"{"bitcoin":{"usd":65000.5}}"#;
        let parsed: HashMap<String, SimplePrice> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.get("bitcoin").unwrap().usd, 65000.5);
    }

    #[tokio::test]
    async fn test_adapter_creation() {
        let feed = CoinGeckoFeed::new(Duration::from_secs(10));
        assert_eq!(feed.name(), "coingecko");
        assert_eq!(feed.source_ids(), &["coingecko"]);
        assert_eq!(feed.status_handle().get(), AdapterStatus::Connecting);
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_fetch_price() {
        let feed = CoinGeckoFeed::new(Duration::from_secs(10));
        let price = feed.fetch_price().await.unwrap();
        assert!(price > 0.0);
    }
}
