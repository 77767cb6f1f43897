// =============================================================================
// Shared application state — wires every cache, detector, and service
// together behind a single `Arc<AppState>` the spawned tasks all hold.
// =============================================================================
//
// `AppState::build` performs the one-time construction: pull bots/strategies/
// filters from the `Store`, stand up a venue client per credential set, and
// assemble the per-bot `OrderService` map the Tick Consumer dispatches into.
// Nothing here owns a task loop itself — `main.rs` spawns those against the
// pieces this module hands back.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::alerts::AlertManager;
use crate::config::RuntimeConfig;
use crate::market_data::CandleBuffer;
use crate::oc_detector::OcDetector;
use crate::open_price_cache::{OpenPriceCache, OpenPriceCacheConfig};
use crate::order_service::{OrderService, OrderServiceConfig};
use crate::position_engine::PositionManager;
use crate::store::Store;
use crate::strategy_cache::StrategyCache;
use crate::symbol_filter::SymbolFilterCache;
use crate::telegram::dispatcher::TelegramDispatcher;
use crate::tick_consumer::TickConsumer;
use crate::types::Venue;
use crate::venue::ExchangeClient;

/// Venue-keyed signing credentials, read from the environment by `main.rs`.
#[derive(Debug, Clone, Default)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
}

pub struct AppState {
    pub config: RwLock<RuntimeConfig>,
    pub store: Arc<dyn Store>,
    pub clients: HashMap<Venue, Arc<dyn ExchangeClient>>,
    pub candle_buffers: HashMap<Venue, Arc<CandleBuffer>>,
    pub strategy_cache: Arc<StrategyCache>,
    pub symbol_filter_cache: Arc<SymbolFilterCache>,
    pub open_price_cache: Arc<OpenPriceCache>,
    pub detector: Arc<OcDetector>,
    pub alerts: Arc<AlertManager>,
    pub telegram: Arc<TelegramDispatcher>,
    pub positions: Arc<PositionManager>,
    pub tick_consumer: Arc<TickConsumer>,
}

impl AppState {
    /// Construct every component and perform the initial cache loads. Does
    /// not spawn any background task — that is `main.rs`'s job, so it can
    /// hold the `JoinHandle`s for shutdown.
    pub async fn build(
        config: RuntimeConfig,
        store: Arc<dyn Store>,
        credentials: HashMap<Venue, VenueCredentials>,
        telegram_token: String,
    ) -> anyhow::Result<Arc<Self>> {
        let clients = build_clients(&credentials, &config);

        // One CandleBuffer per venue; `CandleKey` already carries the venue,
        // so a shared buffer would work too, but per-venue buffers keep one
        // venue's reconnect storm from evicting another venue's candles.
        let candle_buffers: HashMap<Venue, Arc<CandleBuffer>> = [Venue::Binance, Venue::Bybit]
            .into_iter()
            .map(|v| (v, Arc::new(CandleBuffer::new(4_096))))
            .collect();

        let strategy_cache = Arc::new(StrategyCache::new(store.clone()));
        strategy_cache.refresh().await.ok();

        let symbol_filter_cache = Arc::new(SymbolFilterCache::new());
        for venue in [Venue::Binance, Venue::Bybit] {
            match store.get_symbol_filters(venue).await {
                Ok(rows) => symbol_filter_cache.replace_snapshot(venue, rows),
                Err(e) => warn!(venue = %venue, error = %e, "initial symbol filter load failed"),
            }
        }

        let open_price_cache = Arc::new(OpenPriceCache::new(
            candle_buffers.clone(),
            clients.clone(),
            OpenPriceCacheConfig {
                max_entries: config.open_cache_max_entries,
                ttl: Duration::from_secs(config.open_cache_ttl_minutes * 60),
                memo_ttl: Duration::from_millis(config.open_memo_ms),
                rest_fallback_enabled: config.rest_fallback_enabled,
                rest_fallback_max_concurrent: config.rest_fallback_max_concurrent,
                rest_fallback_breaker_window: Duration::from_secs(config.rest_fallback_breaker_window_secs),
                open_prime_tolerance: Duration::from_millis(config.open_prime_tolerance_ms),
            },
        ));

        let detector = Arc::new(OcDetector::new(
            strategy_cache.clone(),
            open_price_cache.clone(),
            config.noise_threshold_pct,
        ));

        let alerts = Arc::new(AlertManager::new(store.clone(), config.alert_rearm_ratio));
        alerts.refresh().await.ok();

        let telegram = Arc::new(TelegramDispatcher::new(telegram_token, config.telegram.clone()));

        let positions = Arc::new(PositionManager::new());
        let bots = store.list_active_bots().await.unwrap_or_default();
        let mut seeded = Vec::new();
        for bot in &bots {
            if let Ok(open) = store.find_open_positions(&bot.id).await {
                seeded.extend(open);
            }
        }
        positions.seed(seeded);

        let order_service_config = OrderServiceConfig {
            position_open_cache_ttl: Duration::from_secs(config.position_open_cache_ttl_secs),
            failure_cooldown: Duration::from_secs(config.failure_cooldown_secs),
            tp_sl_placement_delay: Duration::from_millis(config.tp_sl_placement_delay_ms),
            order_retry_max: config.order_retry_max,
            order_retry_base: Duration::from_millis(config.order_retry_base_ms),
            extend_max_diff_ratio: config.extend_max_diff_ratio,
            passive_limit_on_extend_miss: config.passive_limit_on_extend_miss,
        };

        let mut order_services = HashMap::new();
        for bot in bots {
            let Some(client) = clients.get(&bot.venue).cloned() else {
                warn!(bot_id = %bot.id, venue = %bot.venue, "no exchange client configured for bot's venue, skipping");
                continue;
            };
            let service = Arc::new(OrderService::new(
                bot.clone(),
                client,
                positions.clone(),
                symbol_filter_cache.clone(),
                Some(telegram.clone()),
                order_service_config,
            ));
            order_services.insert(bot.id.clone(), service);
        }
        info!(count = order_services.len(), "order services constructed");

        let tick_consumer = Arc::new(TickConsumer::new(
            detector.clone(),
            open_price_cache.clone(),
            Some(alerts.clone()),
            Some(telegram.clone()),
            order_services,
            crate::tick_consumer::TickConsumerConfig {
                min_tick_interval: Duration::from_millis(config.min_tick_interval_ms),
                batch_size: config.batch_size,
                batch_timeout: Duration::from_millis(config.batch_timeout_ms),
                tick_concurrency: config.tick_concurrency,
            },
        ));

        Ok(Arc::new(Self {
            config: RwLock::new(config),
            store,
            clients,
            candle_buffers,
            strategy_cache,
            symbol_filter_cache,
            open_price_cache,
            detector,
            alerts,
            telegram,
            positions,
            tick_consumer,
        }))
    }
}

fn build_clients(
    credentials: &HashMap<Venue, VenueCredentials>,
    config: &RuntimeConfig,
) -> HashMap<Venue, Arc<dyn ExchangeClient>> {
    let mut clients: HashMap<Venue, Arc<dyn ExchangeClient>> = HashMap::new();

    if let Some(creds) = credentials.get(&Venue::Binance) {
        clients.insert(
            Venue::Binance,
            Arc::new(crate::venue::binance::BinanceClient::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                config.recv_window_ms,
                config.min_request_interval_ms,
            )),
        );
    }
    if let Some(creds) = credentials.get(&Venue::Bybit) {
        clients.insert(
            Venue::Bybit,
            Arc::new(crate::venue::bybit::BybitClient::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                config.recv_window_ms,
                config.min_request_interval_ms,
            )),
        );
    }

    clients
}
