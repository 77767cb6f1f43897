// =============================================================================
// OC Detector — match engine, spec §4.5
// =============================================================================
//
// Given a single tick, resolves the bucket open via the Open-Price Cache's
// tiered sources and returns the set of strategies whose configured OC%
// threshold is crossed in the current bucket. Pure with respect to its
// inputs aside from the open-price and noise-threshold state it reads.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::open_price_cache::OpenPriceCache;
use crate::store::Strategy;
use crate::strategy_cache::StrategyCache;
use crate::types::{bucket_start, normalize_symbol, Direction, Venue};

/// A single strategy match against the current tick.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub strategy: Strategy,
    pub oc_percent: f64,
    pub direction: Direction,
    pub current_price: f64,
    pub open_price: f64,
    pub interval: String,
    pub timestamp: i64,
}

/// Per-(venue, symbol) "don't re-evaluate a price that barely moved" state.
/// Distinct from the Tick Consumer's inter-arrival throttle: this one gates
/// on price distance, not time.
pub struct NoiseGate {
    last_price: RwLock<std::collections::HashMap<(Venue, String), f64>>,
    noise_threshold_pct: f64,
}

impl NoiseGate {
    pub fn new(noise_threshold_pct: f64) -> Self {
        Self { last_price: RwLock::new(std::collections::HashMap::new()), noise_threshold_pct }
    }

    /// Returns `true` if `price` is far enough from the last processed price
    /// for this (venue, symbol) to warrant re-evaluation, updating the
    /// stored price as a side effect when it is.
    fn admit(&self, venue: Venue, symbol: &str, price: f64) -> bool {
        let key = (venue, symbol.to_string());
        let mut map = self.last_price.write();
        match map.get(&key) {
            Some(&last) if last > 0.0 => {
                let move_pct = ((price - last) / last).abs() * 100.0;
                if move_pct < self.noise_threshold_pct {
                    return false;
                }
            }
            _ => {}
        }
        map.insert(key, price);
        true
    }
}

pub struct OcDetector {
    strategies: Arc<StrategyCache>,
    open_prices: Arc<OpenPriceCache>,
    noise_gate: NoiseGate,
}

impl OcDetector {
    pub fn new(strategies: Arc<StrategyCache>, open_prices: Arc<OpenPriceCache>, noise_threshold_pct: f64) -> Self {
        Self {
            strategies,
            open_prices,
            noise_gate: NoiseGate::new(noise_threshold_pct),
        }
    }

    /// Evaluate a single tick against every candidate strategy for its
    /// (venue, symbol). Invalid input (empty symbol, non-positive price)
    /// yields an empty result, per spec §4.5.
    pub async fn detect(&self, venue: Venue, raw_symbol: &str, price: f64, timestamp_ms: i64) -> Vec<MatchResult> {
        if raw_symbol.is_empty() || !price.is_finite() || price <= 0.0 {
            return Vec::new();
        }

        let symbol = normalize_symbol(raw_symbol);
        if !self.noise_gate.admit(venue, &symbol, price) {
            return Vec::new();
        }

        let candidates = self.strategies.get_strategies(venue, &symbol);
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut matches = Vec::with_capacity(candidates.len());
        for strategy in candidates {
            let bucket = bucket_start(&strategy.interval, timestamp_ms);
            let resolution = self
                .open_prices
                .resolve(venue, &symbol, &strategy.interval, bucket, price, false)
                .await;

            let Some(resolution) = resolution else {
                debug!(venue = %venue, symbol = %symbol, strategy_id = %strategy.id, "open unresolved, skipping strategy");
                continue;
            };

            let open = resolution.open;
            if open <= 0.0 {
                continue;
            }

            let oc_percent = ((price - open) / open) * 100.0;
            if oc_percent.abs() < strategy.oc_threshold {
                continue;
            }

            let direction = if oc_percent >= 0.0 { Direction::Bullish } else { Direction::Bearish };
            let interval = strategy.interval.clone();

            matches.push(MatchResult {
                strategy,
                oc_percent,
                direction,
                current_price: price,
                open_price: open,
                interval,
                timestamp: timestamp_ms,
            });
        }

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{memory::InMemoryStore, SymbolFilterRow};
    use crate::types::TradeType;
    use std::time::Duration;

    fn sample_strategy(oc_threshold: f64) -> Strategy {
        Strategy {
            id: "s1".into(),
            bot_id: "bot1".into(),
            venue: Venue::Binance,
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            oc_threshold,
            trade_type: TradeType::Both,
            is_reverse_strategy: false,
            extend: 0,
            take_profit: 10,
            stoploss: 0,
            reduce: 0.0,
            up_reduce: 0.0,
            amount: 100.0,
            is_active: true,
        }
    }

    async fn detector_with(strategy: Strategy) -> OcDetector {
        let store = Arc::new(InMemoryStore::new());
        store.seed_bot(crate::store::Bot {
            id: "bot1".into(),
            venue: Venue::Binance,
            is_active: true,
            is_reverse_strategy_default: false,
            max_concurrent_trades: 5,
            default_leverage: 10,
            hedge_mode: false,
            notify_chat_ids: vec![],
        });
        store.seed_strategy(strategy);
        let cache = Arc::new(StrategyCache::new(store));
        cache.refresh().await.unwrap();

        let filter = SymbolFilterRow { tick_size: 0.01, step_size: 0.001, min_notional: 5.0, max_leverage: 20 };
        let _ = filter;
        let open_cache = Arc::new(OpenPriceCache::new(
            std::collections::HashMap::new(),
            std::collections::HashMap::new(),
            crate::open_price_cache::OpenPriceCacheConfig {
                max_entries: 100,
                ttl: Duration::from_secs(900),
                memo_ttl: Duration::from_millis(200),
                rest_fallback_enabled: false,
                rest_fallback_max_concurrent: 1,
                rest_fallback_breaker_window: Duration::from_secs(60),
                open_prime_tolerance: Duration::from_millis(500),
            },
        ));

        OcDetector::new(cache, open_cache, 0.01)
    }

    #[tokio::test]
    async fn invalid_price_yields_no_matches() {
        let detector = detector_with(sample_strategy(3.0)).await;
        assert!(detector.detect(Venue::Binance, "BTCUSDT", -1.0, 0).await.is_empty());
        assert!(detector.detect(Venue::Binance, "BTCUSDT", f64::NAN, 0).await.is_empty());
        assert!(detector.detect(Venue::Binance, "", 100.0, 0).await.is_empty());
    }

    #[tokio::test]
    async fn unresolved_open_skips_strategy() {
        // No candle buffer / REST client registered -> open resolution fails
        // on the order path (for_alert = false in `detect`), so there are no
        // matches even though a strategy is registered for the symbol.
        let detector = detector_with(sample_strategy(3.0)).await;
        let matches = detector.detect(Venue::Binance, "BTCUSDT", 100.0, 0).await;
        assert!(matches.is_empty());
    }

    #[test]
    fn noise_gate_blocks_tiny_moves() {
        let gate = NoiseGate::new(0.01);
        assert!(gate.admit(Venue::Binance, "BTCUSDT", 100.0));
        assert!(!gate.admit(Venue::Binance, "BTCUSDT", 100.001));
        assert!(gate.admit(Venue::Binance, "BTCUSDT", 101.0));
    }
}
