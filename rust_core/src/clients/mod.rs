//! Upstream price feed adapters.
//!
//! Each adapter owns one transport (WebSocket stream or REST poll loop) to a
//! third-party exchange and emits [`PriceSample`]s into a shared channel. On
//! transport failure it reconnects with capped exponential backoff; parse
//! errors drop the sample and never kill the adapter.

pub mod backoff;
pub mod binance;
pub mod coinbase;
pub mod coingecko;
pub mod kraken;

// Re-export commonly used types
pub use backoff::Backoff;
pub use binance::BinanceFeed;
pub use coinbase::CoinbaseFeed;
pub use coingecko::CoinGeckoFeed;
pub use kraken::KrakenFeed;

use crate::models::PriceSample;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport health of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Connecting,
    Connected,
    Disconnected,
    /// The reconnect cap was hit; the adapter is inert until restart.
    MaxReconnectReached,
}

/// Shared, cheaply clonable view of an adapter's transport health.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<AdapterStatus>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(AdapterStatus::Connecting)),
        }
    }

    pub fn get(&self) -> AdapterStatus {
        *self.inner.read().expect("status lock poisoned")
    }

    pub fn set(&self, status: AdapterStatus) {
        *self.inner.write().expect("status lock poisoned") = status;
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One upstream price feed.
///
/// `spawn` consumes the adapter and runs its connect/read loop as a
/// background task; the [`StatusHandle`] taken beforehand stays live for
/// diagnostics.
pub trait PriceFeedAdapter: Send + 'static {
    /// Adapter display name, e.g. "binance".
    fn name(&self) -> &'static str;

    /// Source IDs this adapter emits. Most emit one; an adapter carrying two
    /// logical sub-sources over one transport emits two.
    fn source_ids(&self) -> &'static [&'static str];

    /// Transport health handle.
    fn status_handle(&self) -> StatusHandle;

    /// Run the adapter until its reconnect cap is exhausted.
    fn spawn(self: Box<Self>, tx: mpsc::Sender<PriceSample>) -> JoinHandle<()>;
}

/// Current millis helper shared by the adapters.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
