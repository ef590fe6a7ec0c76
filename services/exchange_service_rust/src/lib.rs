//! exchange_service_rust - minute-by-minute BTC binary prediction exchange
//!
//! Wires together the upstream price adapters, the aggregator, the round
//! lifecycle controller, the matching engine, and the client gateway.

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod feed;
pub mod gateway;
pub mod rounds;
pub mod server;

pub use config::ExchangeConfig;

use crate::aggregator::PriceAggregator;
use crate::engine::events::EngineEvent;
use crate::engine::MatchingEngine;
use crate::gateway::messages::ServerMessage;
use crate::gateway::{BookDebouncer, UserRegistry};
use crate::rounds::table::RoundTable;
use crate::rounds::RoundController;
use anyhow::{Context, Result};
use log::{error, info};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use updown_rust_core::auth::AuthVerifier;
use updown_rust_core::clients::{
    BinanceFeed, CoinGeckoFeed, CoinbaseFeed, KrakenFeed, PriceFeedAdapter, StatusHandle,
};
use updown_rust_core::db;

/// Shared handles every gateway and HTTP handler needs.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: ExchangeConfig,
    pub engine: Arc<MatchingEngine>,
    pub aggregator: Arc<PriceAggregator>,
    pub table: Arc<RwLock<RoundTable>>,
    pub verifier: AuthVerifier,
    pub registry: Arc<UserRegistry>,
    pub broadcast_tx: broadcast::Sender<ServerMessage>,
}

/// Main service
pub struct ExchangeService {
    state: AppState,
    engine_events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
}

impl ExchangeService {
    pub async fn new(config: ExchangeConfig) -> Result<Self> {
        info!("Initializing exchange service on {}", config.bind_addr);

        // Acquire timeout of a few lifecycle ticks: reject a placement
        // quickly rather than let it straddle a minute boundary
        let pool = db::connect(
            &config.database_url,
            config.db_max_connections,
            Duration::from_millis(config.round_tick_ms * 4),
        )
        .await?;
        info!("Connected to database");

        let (engine_events_tx, engine_events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(MatchingEngine::new(
            pool.clone(),
            config.max_shares_per_order,
            engine_events_tx,
        ));

        let aggregator =
            PriceAggregator::new(config.aggregate_interval_ms, config.price_staleness_secs);
        let table = Arc::new(RwLock::new(RoundTable::new()));
        let verifier = AuthVerifier::new(&config.auth_secret);
        let registry = UserRegistry::new();
        let (broadcast_tx, _) = broadcast::channel(1024);

        Ok(Self {
            state: AppState {
                pool,
                config,
                engine,
                aggregator,
                table,
                verifier,
                registry,
                broadcast_tx,
            },
            engine_events_rx: Some(engine_events_rx),
        })
    }

    /// Start every background task and serve until the listener dies.
    pub async fn run(&mut self) -> Result<()> {
        let state = &self.state;

        // Gateway plumbing: engine events -> user queues / debounced books
        let debouncer = BookDebouncer::new(
            Arc::clone(&state.engine),
            state.broadcast_tx.clone(),
            state.config.orderbook_debounce_ms,
        );
        let events_rx = self
            .engine_events_rx
            .take()
            .context("run() called twice")?;
        supervise(
            "engine-events",
            tokio::spawn(gateway::run_engine_events(
                events_rx,
                Arc::clone(&state.registry),
                debouncer,
            )),
        );

        // Upstream price adapters fan into one sample channel
        let (sample_tx, sample_rx) = mpsc::channel(1024);
        let adapters: Vec<Box<dyn PriceFeedAdapter>> = vec![
            Box::new(BinanceFeed::new()),
            Box::new(CoinbaseFeed::new()),
            Box::new(KrakenFeed::new()),
            Box::new(CoinGeckoFeed::new(Duration::from_secs(
                state.config.coingecko_poll_secs,
            ))),
        ];
        let mut adapter_statuses: Vec<(&'static str, StatusHandle)> = Vec::new();
        for adapter in adapters {
            let name = adapter.name();
            adapter_statuses.push((name, adapter.status_handle()));
            supervise(name, adapter.spawn(sample_tx.clone()));
        }
        drop(sample_tx);

        supervise(
            "aggregator",
            tokio::spawn(Arc::clone(&state.aggregator).run(sample_rx)),
        );
        supervise(
            "price-feed",
            tokio::spawn(feed::run_price_feed(
                state.pool.clone(),
                state.aggregator.subscribe(),
                state.broadcast_tx.clone(),
            )),
        );

        // Round lifecycle
        let controller = RoundController::new(
            state.pool.clone(),
            Arc::clone(&state.engine),
            Arc::clone(&state.aggregator),
            Arc::clone(&state.table),
            state.broadcast_tx.clone(),
            state.config.round_tick_ms,
        );
        controller.init().await?;
        supervise("round-controller", tokio::spawn(controller.run()));

        // Stats heartbeat
        supervise(
            "heartbeat",
            tokio::spawn(heartbeat_loop(
                self.state.clone(),
                adapter_statuses,
                self.state.config.heartbeat_interval_secs,
            )),
        );

        // HTTP + WebSocket front
        let router = server::create_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(&self.state.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.state.config.bind_addr))?;
        info!("Listening on {}", self.state.config.bind_addr);

        axum::serve(listener, router)
            .await
            .context("HTTP server terminated")
    }
}

/// Log a background task's exit; a panicking task must not take the
/// process (and its books) down with it.
fn supervise(name: &'static str, handle: tokio::task::JoinHandle<()>) {
    tokio::spawn(async move {
        match handle.await {
            Ok(()) => error!("Task {} exited", name),
            Err(e) => error!("Task {} panicked: {}", name, e),
        }
    });
}

async fn heartbeat_loop(
    state: AppState,
    adapter_statuses: Vec<(&'static str, StatusHandle)>,
    interval_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick fires immediately; skip it
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let connections = state.registry.connection_count().await;
        let markets = state.table.read().await.len();
        let latest = state.aggregator.latest().await;
        let statuses: Vec<String> = adapter_statuses
            .iter()
            .map(|(name, handle)| format!("{}={:?}", name, handle.get()))
            .collect();

        info!(
            "Heartbeat: connections={}, markets={}, latest_price={:?}, adapters=[{}]",
            connections,
            markets,
            latest.and_then(|a| a.price),
            statuses.join(", ")
        );
    }
}
