//! Price aggregator: fan-in of upstream samples, one canonical reference
//! price per tick.
//!
//! Holds the newest sample per source and publishes a weighted average every
//! `aggregate_interval_ms`. Missing sources reduce the weight denominator,
//! never the numerator. Samples are not filtered by age: when one upstream
//! is the only feed left, a stale-but-known price beats none for one-minute
//! settlement. Staleness is surfaced in the status diagnostic only.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use updown_rust_core::models::{AggregatedPrice, PriceSample};

/// Static source weight table. Sums to 1.0.
pub const SOURCE_WEIGHTS: &[(&str, f64)] = &[
    ("binance_usdt", 0.30),
    ("coinbase", 0.30),
    ("kraken", 0.20),
    ("binance_usdc", 0.10),
    ("coingecko", 0.10),
];

fn weight_of(source_id: &str) -> Option<f64> {
    SOURCE_WEIGHTS
        .iter()
        .find(|(id, _)| *id == source_id)
        .map(|(_, w)| *w)
}

/// Weighted average over whichever sources are present.
///
/// Returns `(price, contributing_sources)`, or None when no weighted source
/// has ever reported.
pub fn weighted_average(samples: &HashMap<String, PriceSample>) -> Option<(f64, usize)> {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut contributing = 0usize;

    for (source_id, sample) in samples {
        let Some(weight) = weight_of(source_id) else {
            continue;
        };
        weighted_sum += weight * sample.mid_price;
        weight_total += weight;
        contributing += 1;
    }

    if contributing == 0 || weight_total <= 0.0 {
        return None;
    }
    Some((weighted_sum / weight_total, contributing))
}

/// Per-source entry of the status diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source_id: String,
    pub weight: f64,
    pub last_seen_ms: Option<i64>,
    pub age_ms: Option<i64>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStatus {
    pub sources: Vec<SourceStatus>,
    pub samples_received: u64,
    pub aggregate_interval_ms: u64,
    pub staleness_secs: u64,
    pub latest: Option<AggregatedPrice>,
}

pub struct PriceAggregator {
    samples: RwLock<HashMap<String, PriceSample>>,
    samples_received: AtomicU64,
    latest: RwLock<Option<AggregatedPrice>>,
    aggregate_tx: broadcast::Sender<AggregatedPrice>,
    aggregate_interval_ms: u64,
    staleness_secs: u64,
}

impl PriceAggregator {
    pub fn new(aggregate_interval_ms: u64, staleness_secs: u64) -> Arc<Self> {
        let (aggregate_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            samples: RwLock::new(HashMap::new()),
            samples_received: AtomicU64::new(0),
            latest: RwLock::new(None),
            aggregate_tx,
            aggregate_interval_ms,
            staleness_secs,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregatedPrice> {
        self.aggregate_tx.subscribe()
    }

    /// Newest published aggregate (price may be None before first sample).
    pub async fn latest(&self) -> Option<AggregatedPrice> {
        self.latest.read().await.clone()
    }

    /// Consume adapter samples and publish one aggregate per tick.
    pub async fn run(self: Arc<Self>, mut sample_rx: mpsc::Receiver<PriceSample>) {
        let mut ticker = interval(Duration::from_millis(self.aggregate_interval_ms));
        let mut intake_open = true;

        loop {
            if intake_open {
                tokio::select! {
                    maybe = sample_rx.recv() => match maybe {
                        Some(sample) => self.ingest(sample).await,
                        None => {
                            warn!("All price adapters disconnected; aggregator continues on cached samples");
                            intake_open = false;
                        }
                    },
                    _ = ticker.tick() => self.publish_tick().await,
                }
            } else {
                ticker.tick().await;
                self.publish_tick().await;
            }
        }
    }

    async fn ingest(&self, sample: PriceSample) {
        if weight_of(&sample.source_id).is_none() {
            debug!("Dropping sample from unweighted source {}", sample.source_id);
            return;
        }
        let count = self.samples_received.fetch_add(1, Ordering::Relaxed);
        if count % 1000 == 0 {
            debug!(
                "Price sample #{}: {} @ {:.2}",
                count, sample.source_id, sample.mid_price
            );
        }
        self.samples.write().await.insert(sample.source_id.clone(), sample);
    }

    async fn publish_tick(&self) {
        let aggregate = {
            let samples = self.samples.read().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            match weighted_average(&samples) {
                Some((price, sources)) => AggregatedPrice {
                    price: Some(price),
                    sources,
                    timestamp_ms: now_ms,
                },
                None => AggregatedPrice {
                    price: None,
                    sources: 0,
                    timestamp_ms: now_ms,
                },
            }
        };

        *self.latest.write().await = Some(aggregate.clone());
        // No receivers is normal before the first client connects
        let _ = self.aggregate_tx.send(aggregate);
    }

    /// Diagnostic snapshot for the `status` request.
    pub async fn status(&self) -> AggregatorStatus {
        let samples = self.samples.read().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let staleness_ms = (self.staleness_secs * 1000) as i64;

        let sources = SOURCE_WEIGHTS
            .iter()
            .map(|(source_id, weight)| {
                let last_seen_ms = samples.get(*source_id).map(|s| s.timestamp_ms);
                let age_ms = last_seen_ms.map(|ts| now_ms - ts);
                SourceStatus {
                    source_id: source_id.to_string(),
                    weight: *weight,
                    last_seen_ms,
                    age_ms,
                    stale: age_ms.map(|age| age > staleness_ms).unwrap_or(true),
                }
            })
            .collect();

        AggregatorStatus {
            sources,
            samples_received: self.samples_received.load(Ordering::Relaxed),
            aggregate_interval_ms: self.aggregate_interval_ms,
            staleness_secs: self.staleness_secs,
            latest: self.latest.read().await.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(source_id: &str, price: f64) -> PriceSample {
        PriceSample {
            source_id: source_id.to_string(),
            mid_price: price,
            best_bid: None,
            best_ask: None,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = SOURCE_WEIGHTS.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_average_all_sources() {
        let mut samples = HashMap::new();
        for (id, _) in SOURCE_WEIGHTS {
            samples.insert(id.to_string(), sample(id, 100.0));
        }
        let (price, sources) = weighted_average(&samples).unwrap();
        assert!((price - 100.0).abs() < 1e-9);
        assert_eq!(sources, SOURCE_WEIGHTS.len());
    }

    #[test]
    fn test_missing_sources_reduce_denominator() {
        // Only binance_usdt (0.30) and kraken (0.20) present
        let mut samples = HashMap::new();
        samples.insert("binance_usdt".to_string(), sample("binance_usdt", 60000.0));
        samples.insert("kraken".to_string(), sample("kraken", 61000.0));

        let (price, sources) = weighted_average(&samples).unwrap();
        let expected = (0.30 * 60000.0 + 0.20 * 61000.0) / 0.50;
        assert!((price - expected).abs() < 1e-6);
        assert_eq!(sources, 2);
    }

    #[test]
    fn test_no_sources_is_none() {
        let samples = HashMap::new();
        assert!(weighted_average(&samples).is_none());
    }

    #[test]
    fn test_unweighted_source_ignored() {
        let mut samples = HashMap::new();
        samples.insert("mystery".to_string(), sample("mystery", 1.0));
        assert!(weighted_average(&samples).is_none());

        samples.insert("coinbase".to_string(), sample("coinbase", 65000.0));
        let (price, sources) = weighted_average(&samples).unwrap();
        assert!((price - 65000.0).abs() < 1e-9);
        assert_eq!(sources, 1);
    }

    #[tokio::test]
    async fn test_latest_none_before_first_tick() {
        let aggregator = PriceAggregator::new(1000, 30);
        assert!(aggregator.latest().await.is_none());
    }

    #[tokio::test]
    async fn test_status_marks_unseen_sources_stale() {
        let aggregator = PriceAggregator::new(1000, 30);
        let status = aggregator.status().await;
        assert_eq!(status.sources.len(), SOURCE_WEIGHTS.len());
        assert!(status.sources.iter().all(|s| s.stale));
        assert_eq!(status.samples_received, 0);
    }
}
