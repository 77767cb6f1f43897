// =============================================================================
// Open-Price Cache and tiered resolution — spec §4.3
// =============================================================================
//
// Resolves the open price of a (venue, symbol, interval, bucket_start)
// exactly once per bucket where possible, with explicit provenance. Tier
// order: ws_bucket_open -> ws_latest_candle_open -> ws_prev_close ->
// (optional REST) rest_ohlcv -> fallback_current_price. The last tier is
// reserved for the alert path; the order path skips the match instead.
//
// The resolved value is kept in two LRU+TTL layers: the long-lived result
// cache (~15 min TTL, bounded entries) and a short admission memo (~1 s)
// that prevents repeated tiered resolution under bursty ticks within the
// same bucket, per the event-loop-scale admission memoization the spec
// calls for.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use crate::market_data::CandleBuffer;
use crate::types::{OpenSource, Venue};
use crate::venue::ExchangeClient;

/// A resolved bucket open, tagged with how it was obtained.
#[derive(Debug, Clone, Copy)]
pub struct OpenResolution {
    pub open: f64,
    pub source: OpenSource,
}

type CacheKey = (Venue, String, String, i64);

/// Tuning knobs the cache needs from `RuntimeConfig`, threaded through
/// explicitly rather than depending on the whole config struct.
#[derive(Debug, Clone, Copy)]
pub struct OpenPriceCacheConfig {
    pub max_entries: usize,
    pub ttl: Duration,
    pub memo_ttl: Duration,
    pub rest_fallback_enabled: bool,
    pub rest_fallback_max_concurrent: usize,
    pub rest_fallback_breaker_window: Duration,
    pub open_prime_tolerance: Duration,
}

struct RestBreaker {
    tripped_until: Mutex<Option<std::time::Instant>>,
}

impl RestBreaker {
    fn new() -> Self {
        Self { tripped_until: Mutex::new(None) }
    }

    fn is_open(&self) -> bool {
        match *self.tripped_until.lock() {
            Some(until) => std::time::Instant::now() < until,
            None => false,
        }
    }

    fn trip(&self, window: Duration) {
        *self.tripped_until.lock() = Some(std::time::Instant::now() + window);
    }
}

/// Per-(venue, symbol, interval, bucket) coalescing for REST fallback: only
/// one REST request is ever in flight for a given key; concurrent callers
/// wait on the first caller's result instead of issuing their own request.
struct Inflight {
    senders: DashMap<CacheKey, broadcast::Sender<Option<f64>>>,
}

impl Inflight {
    fn new() -> Self {
        Self { senders: DashMap::new() }
    }
}

pub struct OpenPriceCache {
    candles: HashMap<Venue, Arc<CandleBuffer>>,
    clients: HashMap<Venue, Arc<dyn ExchangeClient>>,
    cache: crate::util::LruTtlCache<CacheKey, OpenResolution>,
    memo: crate::util::LruTtlCache<CacheKey, OpenResolution>,
    inflight: Inflight,
    rest_semaphore: Semaphore,
    breaker: RestBreaker,
    config: OpenPriceCacheConfig,
}

impl OpenPriceCache {
    pub fn new(
        candles: HashMap<Venue, Arc<CandleBuffer>>,
        clients: HashMap<Venue, Arc<dyn ExchangeClient>>,
        config: OpenPriceCacheConfig,
    ) -> Self {
        Self {
            candles,
            clients,
            cache: crate::util::LruTtlCache::new(config.max_entries, config.ttl),
            memo: crate::util::LruTtlCache::new(config.max_entries, config.memo_ttl),
            inflight: Inflight::new(),
            rest_semaphore: Semaphore::new(config.rest_fallback_max_concurrent.max(1)),
            breaker: RestBreaker::new(),
            config,
        }
    }

    /// Resolve the open price for (venue, symbol, interval, bucket_start).
    /// `current_price` only feeds the `fallback_current_price` tier, which
    /// `for_alert` must be `true` to unlock — the order path always gets
    /// `None` on a full tier miss rather than a tick-price guess.
    pub async fn resolve(
        &self,
        venue: Venue,
        symbol: &str,
        interval: &str,
        bucket_start: i64,
        current_price: f64,
        for_alert: bool,
    ) -> Option<OpenResolution> {
        let key: CacheKey = (venue, symbol.to_string(), interval.to_string(), bucket_start);

        if let Some(memoized) = self.memo.get(&key) {
            return Some(memoized);
        }

        if let Some(resolution) = self.resolve_ws_tiers(venue, symbol, interval, bucket_start) {
            self.cache.insert(key.clone(), resolution);
            self.memo.insert(key, resolution);
            return Some(resolution);
        }

        if self.config.rest_fallback_enabled {
            if let Some(resolution) =
                self.resolve_rest(venue, symbol, interval, bucket_start, &key).await
            {
                self.cache.insert(key.clone(), resolution);
                self.memo.insert(key, resolution);
                return Some(resolution);
            }
        }

        if for_alert {
            let resolution = OpenResolution { open: current_price, source: OpenSource::FallbackCurrentPrice };
            warn!(venue = %venue, symbol, interval, bucket_start, "open resolution fell through to fallback_current_price");
            self.memo.insert(key, resolution);
            return Some(resolution);
        }

        debug!(venue = %venue, symbol, interval, bucket_start, "open unresolved — skipping match");
        None
    }

    fn resolve_ws_tiers(
        &self,
        venue: Venue,
        symbol: &str,
        interval: &str,
        bucket_start: i64,
    ) -> Option<OpenResolution> {
        let buffer = self.candles.get(&venue)?;
        let candle_key = crate::market_data::CandleKey {
            venue,
            symbol: symbol.to_string(),
            interval: interval.to_string(),
        };

        if let Some(candle) = buffer.candle_at_bucket(&candle_key, bucket_start) {
            return Some(OpenResolution { open: candle.open, source: OpenSource::WsBucketOpen });
        }

        if let Some(candle) = buffer.latest(&candle_key) {
            return Some(OpenResolution { open: candle.open, source: OpenSource::WsLatestCandleOpen });
        }

        if let Some(close) = buffer.last_close(&candle_key) {
            warn!(venue = %venue, symbol, interval, bucket_start, "using ws_prev_close approximation");
            return Some(OpenResolution { open: close, source: OpenSource::WsPrevClose });
        }

        None
    }

    async fn resolve_rest(
        &self,
        venue: Venue,
        symbol: &str,
        interval: &str,
        bucket_start: i64,
        key: &CacheKey,
    ) -> Option<OpenResolution> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let stale_ms = (now_ms - bucket_start).max(0) as u64;
        if stale_ms < self.config.open_prime_tolerance.as_millis() as u64 {
            debug!(venue = %venue, symbol, stale_ms, "bucket too fresh for REST fallback, skipping");
            return None;
        }

        if self.breaker.is_open() {
            debug!(venue = %venue, symbol, "REST fallback circuit breaker open, skipping");
            return None;
        }

        // Coalesce: if a request for this exact key is already in flight,
        // wait on its result instead of issuing a second one.
        if let Some(sender) = self.inflight.senders.get(key) {
            let mut rx = sender.subscribe();
            drop(sender);
            return rx.recv().await.ok().flatten().map(|open| OpenResolution {
                open,
                source: OpenSource::RestOhlcv,
            });
        }

        let (tx, _rx) = broadcast::channel(1);
        self.inflight.senders.insert(key.clone(), tx.clone());

        let result = self.fetch_rest_open(venue, symbol, interval, bucket_start).await;
        self.inflight.senders.remove(key);
        let _ = tx.send(result);

        result.map(|open| OpenResolution { open, source: OpenSource::RestOhlcv })
    }

    async fn fetch_rest_open(
        &self,
        venue: Venue,
        symbol: &str,
        interval: &str,
        bucket_start: i64,
    ) -> Option<f64> {
        let client = self.clients.get(&venue)?;
        let _permit = self.rest_semaphore.acquire().await.ok()?;

        match client.get_klines(symbol, interval, 2).await {
            Ok(candles) => {
                let open = candles
                    .iter()
                    .find(|c| c.open_time == bucket_start)
                    .or_else(|| candles.last())
                    .map(|c| c.open);
                if open.is_none() {
                    warn!(venue = %venue, symbol, interval, bucket_start, "REST klines returned no matching candle");
                }
                open
            }
            Err(e) => {
                if e.http_status == Some(429) {
                    self.breaker.trip(self.config.rest_fallback_breaker_window);
                    warn!(venue = %venue, symbol, "REST fallback hit 429, tripping circuit breaker");
                } else {
                    warn!(venue = %venue, symbol, error = %e, "REST fallback kline fetch failed");
                }
                None
            }
        }
    }

    pub fn sweep_expired(&self) -> (usize, usize) {
        (self.cache.sweep_expired(), self.memo.sweep_expired())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn config() -> OpenPriceCacheConfig {
        OpenPriceCacheConfig {
            max_entries: 1000,
            ttl: Duration::from_secs(900),
            memo_ttl: Duration::from_millis(200),
            rest_fallback_enabled: false,
            rest_fallback_max_concurrent: 4,
            rest_fallback_breaker_window: Duration::from_secs(60),
            open_prime_tolerance: Duration::from_millis(500),
        }
    }

    fn sample_candle(open_time: i64, open: f64, close: f64, is_closed: bool) -> Candle {
        Candle { open_time, close_time: open_time + 59_999, open, high: open.max(close), low: open.min(close), close, volume: 1.0, is_closed }
    }

    fn buffers_with_one(venue: Venue, symbol: &str, interval: &str) -> HashMap<Venue, Arc<CandleBuffer>> {
        let buf = Arc::new(CandleBuffer::new(10));
        let mut map = HashMap::new();
        map.insert(venue, buf);
        let _ = (symbol, interval);
        map
    }

    #[tokio::test]
    async fn ws_bucket_open_tier_wins_when_present() {
        let buffers = buffers_with_one(Venue::Binance, "BTCUSDT", "1m");
        let key = crate::market_data::CandleKey { venue: Venue::Binance, symbol: "BTCUSDT".into(), interval: "1m".into() };
        buffers[&Venue::Binance].update(key, sample_candle(60_000, 100.0, 101.0, true));

        let cache = OpenPriceCache::new(buffers, HashMap::new(), config());
        let resolved = cache.resolve(Venue::Binance, "BTCUSDT", "1m", 60_000, 105.0, false).await.unwrap();
        assert!((resolved.open - 100.0).abs() < f64::EPSILON);
        assert!(matches!(resolved.source, OpenSource::WsBucketOpen));
    }

    #[tokio::test]
    async fn falls_back_to_prev_close_when_no_exact_bucket() {
        let buffers = buffers_with_one(Venue::Binance, "ETHUSDT", "1m");
        let key = crate::market_data::CandleKey { venue: Venue::Binance, symbol: "ETHUSDT".into(), interval: "1m".into() };
        buffers[&Venue::Binance].update(key, sample_candle(0, 50.0, 52.0, true));

        let cache = OpenPriceCache::new(buffers, HashMap::new(), config());
        // bucket_start 60_000 has no exact candle and the buffered candle
        // (open_time 0) is also returned by `latest`, so ws_latest_candle_open
        // wins before prev_close is ever consulted.
        let resolved = cache.resolve(Venue::Binance, "ETHUSDT", "1m", 60_000, 53.0, false).await.unwrap();
        assert!(matches!(resolved.source, OpenSource::WsLatestCandleOpen));
    }

    #[tokio::test]
    async fn order_path_returns_none_on_total_miss() {
        let cache = OpenPriceCache::new(HashMap::new(), HashMap::new(), config());
        let resolved = cache.resolve(Venue::Binance, "SOLUSDT", "1m", 0, 20.0, false).await;
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn alert_path_falls_back_to_current_price_on_total_miss() {
        let cache = OpenPriceCache::new(HashMap::new(), HashMap::new(), config());
        let resolved = cache.resolve(Venue::Binance, "SOLUSDT", "1m", 0, 20.0, true).await.unwrap();
        assert!((resolved.open - 20.0).abs() < f64::EPSILON);
        assert!(matches!(resolved.source, OpenSource::FallbackCurrentPrice));
    }

    #[tokio::test]
    async fn memoization_short_circuits_repeat_lookups_in_same_bucket() {
        let buffers = buffers_with_one(Venue::Binance, "BTCUSDT", "1m");
        let key = crate::market_data::CandleKey { venue: Venue::Binance, symbol: "BTCUSDT".into(), interval: "1m".into() };
        buffers[&Venue::Binance].update(key, sample_candle(60_000, 100.0, 101.0, true));

        let cache = OpenPriceCache::new(buffers, HashMap::new(), config());
        let first = cache.resolve(Venue::Binance, "BTCUSDT", "1m", 60_000, 105.0, false).await.unwrap();
        let second = cache.resolve(Venue::Binance, "BTCUSDT", "1m", 60_000, 999.0, false).await.unwrap();
        assert_eq!(first.open, second.open);
    }
}
