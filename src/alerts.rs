// =============================================================================
// Price Alerts — out-of-band OC threshold notifications, spec §3/§4.3/§4.9
// =============================================================================
//
// A parallel branch off the same tick path the OC Detector uses: instead of
// matching against strategies, alerts match against user-configured
// {venue, symbols, intervals, threshold_percent, chat_id} watchers and push
// a Telegram message when the threshold is crossed. Arming/rearm mirrors the
// teacher's circuit-breaker idiom — a watcher fires once, then must see the
// move retrace below `threshold × rearm_ratio` before it can fire again.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::open_price_cache::OpenPriceCache;
use crate::store::{PriceAlertConfigRow, Store};
use crate::telegram::dispatcher::TelegramDispatcher;
use crate::types::{bucket_start, normalize_symbol, Venue};

/// A single alert-watcher configuration, rebuilt periodically from the store.
#[derive(Debug, Clone)]
pub struct AlertWatcher {
    pub config_id: String,
    pub venue: Venue,
    pub symbols: HashSet<String>,
    pub intervals: HashSet<String>,
    pub threshold_percent: f64,
    pub chat_id: i64,
}

impl AlertWatcher {
    fn matches_symbol(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.contains(symbol)
    }
}

type AlertKey = (String, Venue, String, String);

/// Per-(config_id, venue, symbol, interval) arming state.
#[derive(Debug, Clone, Copy)]
struct AlertState {
    last_alert_time: Instant,
    armed: bool,
    last_alert_oc_abs: f64,
}

impl Default for AlertState {
    fn default() -> Self {
        Self { last_alert_time: Instant::now(), armed: true, last_alert_oc_abs: 0.0 }
    }
}

/// Holds the live watcher set and per-key arming state, and evaluates ticks
/// against it on the same hot path the OC Detector runs on.
pub struct AlertManager {
    store: Arc<dyn Store>,
    watchers: RwLock<Vec<AlertWatcher>>,
    states: DashMap<AlertKey, AlertState>,
    rearm_ratio: f64,
}

impl AlertManager {
    pub fn new(store: Arc<dyn Store>, rearm_ratio: f64) -> Self {
        Self {
            store,
            watchers: RwLock::new(Vec::new()),
            states: DashMap::new(),
            rearm_ratio,
        }
    }

    /// Rebuild the watcher list from the store.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let rows: Vec<PriceAlertConfigRow> = self.store.list_alert_configs().await?;
        let watchers: Vec<AlertWatcher> = rows
            .into_iter()
            .map(|r| AlertWatcher {
                config_id: r.config_id,
                venue: r.venue,
                symbols: r.symbols.iter().map(|s| normalize_symbol(s)).collect(),
                intervals: r.intervals.into_iter().collect(),
                threshold_percent: r.threshold_percent,
                chat_id: r.chat_id,
            })
            .collect();
        let count = watchers.len();
        *self.watchers.write() = watchers;
        debug!(count, "alert watchers refreshed");
        Ok(())
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.read().len()
    }

    /// Evaluate a single tick against every watcher whose (venue, symbol)
    /// matches, resolving the bucket open via the alert path (the
    /// `fallback_current_price` tier is allowed here, unlike the order
    /// path). Enqueues a Telegram message per watcher/interval that fires.
    pub async fn evaluate(
        &self,
        open_prices: &OpenPriceCache,
        telegram: &TelegramDispatcher,
        venue: Venue,
        raw_symbol: &str,
        price: f64,
        timestamp_ms: i64,
    ) {
        if raw_symbol.is_empty() || !price.is_finite() || price <= 0.0 {
            return;
        }
        let symbol = normalize_symbol(raw_symbol);

        let candidates: Vec<AlertWatcher> = {
            let watchers = self.watchers.read();
            watchers
                .iter()
                .filter(|w| w.venue == venue && w.matches_symbol(&symbol))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        for watcher in candidates {
            for interval in &watcher.intervals {
                let bucket = bucket_start(interval, timestamp_ms);
                let Some(resolution) =
                    open_prices.resolve(venue, &symbol, interval, bucket, price, true).await
                else {
                    continue;
                };
                if resolution.open <= 0.0 {
                    continue;
                }

                let oc_percent = ((price - resolution.open) / resolution.open) * 100.0;
                let oc_abs = oc_percent.abs();
                let key: AlertKey = (watcher.config_id.clone(), venue, symbol.clone(), interval.clone());

                let should_fire = {
                    let state = self.states.entry(key.clone()).or_insert_with(AlertState::default);
                    state.armed && oc_abs >= watcher.threshold_percent
                };

                if should_fire {
                    self.fire(telegram, &watcher, &symbol, interval, oc_percent, resolution.open, price);
                    self.states.insert(
                        key,
                        AlertState { last_alert_time: Instant::now(), armed: false, last_alert_oc_abs: oc_abs },
                    );
                    continue;
                }

                // Re-arm once the move retraces below threshold * rearm_ratio.
                let mut entry = self.states.entry(key).or_insert_with(AlertState::default);
                if !entry.armed && oc_abs < watcher.threshold_percent * self.rearm_ratio {
                    entry.armed = true;
                    debug!(config_id = %watcher.config_id, symbol = %symbol, interval = %interval, "alert watcher re-armed");
                }
            }
        }
    }

    fn fire(
        &self,
        telegram: &TelegramDispatcher,
        watcher: &AlertWatcher,
        symbol: &str,
        interval: &str,
        oc_percent: f64,
        open: f64,
        current: f64,
    ) {
        let purpose = match watcher.venue {
            Venue::Binance => "price-alert-binance",
            Venue::Bybit => "price-alert-bybit",
        };
        let direction = if oc_percent >= 0.0 { "\u{1f4c8}" } else { "\u{1f4c9}" };
        let text = format!(
            "{direction} {symbol} ({interval}) {oc_percent:.2}%\nopen: {open}\ncurrent: {current}"
        );
        info!(config_id = %watcher.config_id, symbol, interval, oc_percent, "price alert fired");
        telegram.enqueue(purpose, watcher.chat_id, text);
    }
}

/// Spawn the periodic watcher refresh loop, mirroring `strategy_cache`'s.
pub async fn run_refresh_loop(manager: Arc<AlertManager>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = manager.refresh().await {
            warn!(error = %e, "alert watcher refresh failed");
        } else {
            debug!(count = manager.watcher_count(), "alert watcher refresh complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::telegram::dispatcher::TelegramDispatcher;
    use crate::venue::ExchangeClient;
    use std::collections::HashMap as StdHashMap;

    fn open_cache() -> OpenPriceCache {
        OpenPriceCache::new(
            StdHashMap::<Venue, Arc<crate::market_data::CandleBuffer>>::new(),
            StdHashMap::<Venue, Arc<dyn ExchangeClient>>::new(),
            crate::open_price_cache::OpenPriceCacheConfig {
                max_entries: 100,
                ttl: Duration::from_secs(900),
                memo_ttl: Duration::from_millis(200),
                rest_fallback_enabled: false,
                rest_fallback_max_concurrent: 1,
                rest_fallback_breaker_window: Duration::from_secs(60),
                open_prime_tolerance: Duration::from_millis(500),
            },
        )
    }

    fn telegram() -> TelegramDispatcher {
        TelegramDispatcher::new("token".into(), crate::config::TelegramConfig::default())
    }

    #[tokio::test]
    async fn refresh_loads_watchers_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_alert_config(PriceAlertConfigRow {
            config_id: "c1".into(),
            venue: Venue::Binance,
            symbols: vec!["btc/usdt".into()],
            intervals: vec!["1m".into()],
            threshold_percent: 3.0,
            chat_id: 42,
        });
        let manager = AlertManager::new(store, 0.6);
        manager.refresh().await.unwrap();
        assert_eq!(manager.watcher_count(), 1);
    }

    #[tokio::test]
    async fn below_threshold_does_not_fire_or_requeue() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_alert_config(PriceAlertConfigRow {
            config_id: "c1".into(),
            venue: Venue::Binance,
            symbols: vec!["BTCUSDT".into()],
            intervals: vec!["1m".into()],
            threshold_percent: 3.0,
            chat_id: 42,
        });
        let manager = AlertManager::new(store, 0.6);
        manager.refresh().await.unwrap();

        let open_prices = open_cache();
        let telegram = telegram();
        // No candle buffer/client registered for order-path tiers, but the
        // alert path's `fallback_current_price` tier always resolves using
        // the tick itself, so `oc` is always 0 here — below threshold.
        manager.evaluate(&open_prices, &telegram, Venue::Binance, "BTCUSDT", 100.0, 0).await;
        assert_eq!(telegram.queue_depth("price-alert-binance"), 0);
    }

    #[tokio::test]
    async fn empty_symbol_set_matches_any_symbol() {
        let watcher = AlertWatcher {
            config_id: "c1".into(),
            venue: Venue::Binance,
            symbols: HashSet::new(),
            intervals: ["1m".to_string()].into_iter().collect(),
            threshold_percent: 1.0,
            chat_id: 1,
        };
        assert!(watcher.matches_symbol("ANYTHING"));
    }
}
