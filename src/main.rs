// =============================================================================
// Aurora Signal-to-Order Engine — Main Entry Point
// =============================================================================
//
// Wires the hot path end to end: per-venue WebSocket ingress feeds the Tick
// Queue, the Tick Consumer drains it into the OC Detector and the per-bot
// Order Services, and a handful of periodic tasks keep the caches, the
// alert watchers, the Telegram dispatcher, and position reconciliation
// running alongside it. Every task is independent and reconnect/retry loops
// never bring down the process — a stream error logs and retries after a
// backoff, same as the teacher's market-data loops.
// =============================================================================

mod alerts;
mod app_state;
mod config;
mod market_data;
mod oc_detector;
mod open_price_cache;
mod order_error;
mod order_service;
mod position_engine;
mod pricing;
mod reconcile;
mod side_selection;
mod store;
mod strategy_cache;
mod symbol_filter;
mod telegram;
mod tick_consumer;
mod types;
mod util;
mod venue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, VenueCredentials};
use crate::config::RuntimeConfig;
use crate::market_data::TickEvent;
use crate::store::memory::InMemoryStore;
use crate::tick_consumer::TickQueue;
use crate::types::Venue;

/// Kline intervals the engine keeps a live candle buffer for. Strategies may
/// configure any interval the glossary names; this is the demo/default set
/// of feeds the ingress layer subscribes to on startup.
const KLINE_INTERVALS: &[&str] = &["1m", "5m", "15m"];

/// How long a disconnected WebSocket stream waits before reconnecting.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║     Aurora Signal-to-Order Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        info!(symbols = ?config.symbols, "symbols overridden from AURORA_SYMBOLS");
    }

    info!(
        trading_mode = %config.trading_mode,
        symbols = ?config.symbols,
        "engine configuration loaded"
    );

    // ── Persistent store ────────────────────────────────────────────────
    // Storage is an external collaborator (spec §1 Non-goals): the core only
    // depends on the `Store` trait. `InMemoryStore` is the reference/demo
    // implementation; a production deployment swaps in a database-backed
    // implementation of the same trait without touching the core.
    let store: Arc<dyn store::Store> = Arc::new(InMemoryStore::new());

    // ── Venue credentials ───────────────────────────────────────────────
    let mut credentials = HashMap::new();
    if let (Ok(key), Ok(secret)) = (std::env::var("BINANCE_API_KEY"), std::env::var("BINANCE_API_SECRET")) {
        if !key.is_empty() && !secret.is_empty() {
            credentials.insert(Venue::Binance, VenueCredentials { api_key: key, api_secret: secret });
        }
    }
    if let (Ok(key), Ok(secret)) = (std::env::var("BYBIT_API_KEY"), std::env::var("BYBIT_API_SECRET")) {
        if !key.is_empty() && !secret.is_empty() {
            credentials.insert(Venue::Bybit, VenueCredentials { api_key: key, api_secret: secret });
        }
    }
    info!(venues = ?credentials.keys().collect::<Vec<_>>(), "exchange credentials configured");

    let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    if telegram_token.is_empty() {
        warn!("TELEGRAM_BOT_TOKEN not set — notifications will fail to send");
    }

    let state = AppState::build(config.clone(), store, credentials, telegram_token).await?;

    // ── Ingress: trade streams (ticks) and kline streams (bucket opens) ─
    let tick_queue = Arc::new(TickQueue::new(config.tick_queue_capacity));

    for venue in [Venue::Binance, Venue::Bybit] {
        if !state.clients.contains_key(&venue) {
            debug_no_client(venue);
            continue;
        }

        let (tx, mut rx) = mpsc::channel::<TickEvent>(config.tick_queue_capacity.max(1024));
        let forward_queue = tick_queue.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                forward_queue.push(event);
            }
        });

        for symbol in &config.symbols {
            let symbol = symbol.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = market_data::trade_stream::run_trade_stream(venue, &symbol, &tx).await {
                        error!(venue = %venue, symbol = %symbol, error = %e, "trade stream error — reconnecting");
                    }
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            });

            for interval in KLINE_INTERVALS {
                let Some(buffer) = state.candle_buffers.get(&venue).cloned() else { continue };
                let symbol = symbol.clone();
                let interval = interval.to_string();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            market_data::candle_buffer::run_kline_stream(venue, &symbol, &interval, &buffer).await
                        {
                            error!(venue = %venue, symbol = %symbol, interval = %interval, error = %e, "kline stream error — reconnecting");
                        }
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                });
            }
        }
    }

    info!(symbols = config.symbols.len(), "market data ingress launched");

    // ── Tick Consumer (the hot loop) ────────────────────────────────────
    {
        let consumer = state.tick_consumer.clone();
        let queue = tick_queue.clone();
        tokio::spawn(async move {
            consumer.run(queue).await;
        });
    }

    // ── Periodic cache refreshes ────────────────────────────────────────
    tokio::spawn(strategy_cache::run_refresh_loop(
        state.strategy_cache.clone(),
        Duration::from_secs(config.strategy_cache_refresh_secs),
    ));

    tokio::spawn(symbol_filter::run_refresh_loop(
        state.symbol_filter_cache.clone(),
        state.store.clone(),
        Duration::from_secs(config.symbol_filter_refresh_secs),
        Duration::from_secs(config.refresh_watchdog_timeout_secs),
    ));

    tokio::spawn(alerts::run_refresh_loop(
        state.alerts.clone(),
        Duration::from_secs(config.strategy_cache_refresh_secs),
    ));

    // ── Telegram dispatch ────────────────────────────────────────────────
    tokio::spawn(telegram::dispatcher::run_dispatch_loop(state.telegram.clone()));

    // ── Position reconciliation ──────────────────────────────────────────
    tokio::spawn(reconcile::run_reconcile_loop(
        state.clients.clone(),
        state.positions.clone(),
        Duration::from_secs(30),
    ));

    info!("all background tasks launched, engine is running");

    // ── Shutdown ─────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining queues");
    tokio::time::sleep(Duration::from_secs(config.shutdown_drain_deadline_secs.min(10))).await;
    info!("shutdown complete");

    Ok(())
}

fn debug_no_client(venue: Venue) {
    warn!(venue = %venue, "no exchange client configured for venue, skipping ingress");
}
