// =============================================================================
// Tick Consumer — hot loop turning ticks into matches, spec §4.4
// =============================================================================
//
// Sits between the per-venue ingress tasks (`market_data::trade_stream`) and
// the OC Detector / Order Services. Owns the bounded tick queue, the
// per-symbol throttle, batching/dedup, and bounded-concurrency dispatch.
// Match dispatch to an Order Service is `allSettled`: each dispatch runs in
// its own task so one panic or slow bot never blocks or cancels siblings.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::warn;

use crate::alerts::AlertManager;
use crate::market_data::TickEvent;
use crate::oc_detector::OcDetector;
use crate::open_price_cache::OpenPriceCache;
use crate::order_service::OrderService;
use crate::telegram::dispatcher::TelegramDispatcher;
use crate::types::Venue;
use crate::util::Throttle;

/// Bounded FIFO of pending ticks. Unlike a plain `tokio::sync::mpsc`
/// channel — which drops the *newest* item on a full `try_send` — this
/// drops the *oldest* queued tick once at capacity, per spec §4.4's
/// "backpressure favors freshness". Generalizes `CandleBuffer`'s
/// trim-the-front-when-over-capacity discipline to an ingress queue.
pub struct TickQueue {
    buf: Mutex<VecDeque<TickEvent>>,
    capacity: usize,
    notify: Notify,
}

impl TickQueue {
    pub fn new(capacity: usize) -> Self {
        Self { buf: Mutex::new(VecDeque::with_capacity(capacity.min(1024))), capacity, notify: Notify::new() }
    }

    pub fn push(&self, event: TickEvent) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(event);
        drop(buf);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<TickEvent> {
        self.buf.lock().pop_front()
    }

    /// Block until at least one tick is available.
    async fn pop_wait(&self) -> TickEvent {
        loop {
            if let Some(ev) = self.try_pop() {
                return ev;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tunables threaded explicitly from `RuntimeConfig`.
#[derive(Debug, Clone, Copy)]
pub struct TickConsumerConfig {
    pub min_tick_interval: Duration,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub tick_concurrency: usize,
}

/// Drains a [`TickQueue`], batches/dedups/throttles, and fans each admitted
/// tick out to the OC Detector, the alert path, and (for every match) the
/// owning bot's Order Service.
pub struct TickConsumer {
    detector: Arc<OcDetector>,
    open_prices: Arc<OpenPriceCache>,
    alerts: Option<Arc<AlertManager>>,
    telegram: Option<Arc<TelegramDispatcher>>,
    /// bot_id -> the Order Service executing signals for that bot.
    order_services: HashMap<String, Arc<OrderService>>,
    throttle: Throttle<(Venue, String)>,
    config: TickConsumerConfig,
}

impl TickConsumer {
    pub fn new(
        detector: Arc<OcDetector>,
        open_prices: Arc<OpenPriceCache>,
        alerts: Option<Arc<AlertManager>>,
        telegram: Option<Arc<TelegramDispatcher>>,
        order_services: HashMap<String, Arc<OrderService>>,
        config: TickConsumerConfig,
    ) -> Self {
        Self { detector, open_prices, alerts, telegram, order_services, throttle: Throttle::new(), config }
    }

    /// Runs forever, draining `queue`. Intended to be spawned as a task.
    pub async fn run(self: Arc<Self>, queue: Arc<TickQueue>) {
        loop {
            let batch = self.next_batch(&queue).await;
            if batch.is_empty() {
                continue;
            }

            let admitted: Vec<TickEvent> = dedup_latest_per_symbol(batch)
                .into_iter()
                .filter(|tick| {
                    self.throttle.try_pass((tick.venue, tick.symbol.clone()), self.config.min_tick_interval)
                })
                .collect();
            if admitted.is_empty() {
                continue;
            }

            let semaphore = Arc::new(Semaphore::new(self.config.tick_concurrency.max(1)));
            let mut handles = Vec::with_capacity(admitted.len());
            for tick in admitted {
                let this = self.clone();
                let permit = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.ok();
                    this.process_tick(tick).await;
                }));
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "tick processing task panicked");
                }
            }
        }
    }

    /// Accumulate up to `batch_size` ticks, or until `batch_timeout` has
    /// elapsed since the first tick of this batch, whichever comes first.
    async fn next_batch(&self, queue: &TickQueue) -> Vec<TickEvent> {
        let mut batch = Vec::with_capacity(self.config.batch_size);
        batch.push(queue.pop_wait().await);

        let deadline = Instant::now() + self.config.batch_timeout;
        while batch.len() < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match queue.try_pop() {
                Some(tick) => batch.push(tick),
                None => {
                    let _ = tokio::time::timeout(remaining, queue.notify.notified()).await;
                }
            }
        }
        batch
    }

    async fn process_tick(&self, tick: TickEvent) {
        if let (Some(alerts), Some(telegram)) = (&self.alerts, &self.telegram) {
            alerts.evaluate(&self.open_prices, telegram, tick.venue, &tick.symbol, tick.price, tick.timestamp_ms).await;
        }

        let matches = self.detector.detect(tick.venue, &tick.symbol, tick.price, tick.timestamp_ms).await;
        if matches.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(matches.len());
        for m in matches {
            let Some(service) = self.order_services.get(&m.strategy.bot_id).cloned() else {
                warn!(bot_id = %m.strategy.bot_id, "no order service registered for bot, skipping match");
                continue;
            };
            handles.push(tokio::spawn(async move {
                service.handle_match(m).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "order dispatch task panicked");
            }
        }
    }
}

/// Keep only the tick with the latest timestamp per (venue, symbol) within a
/// batch. Never reorders across batches — only ever discards older entries
/// from within the same batch, preserving the per-symbol timestamp ordering
/// invariant (spec §4.4/§5).
fn dedup_latest_per_symbol(batch: Vec<TickEvent>) -> Vec<TickEvent> {
    let mut latest: HashMap<(Venue, String), TickEvent> = HashMap::new();
    for tick in batch {
        let key = (tick.venue, tick.symbol.clone());
        match latest.get(&key) {
            Some(existing) if existing.timestamp_ms > tick.timestamp_ms => {}
            _ => {
                latest.insert(key, tick);
            }
        }
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_service::OrderServiceConfig;
    use crate::position_engine::PositionManager;
    use crate::store::memory::InMemoryStore;
    use crate::store::{Bot, SymbolFilterRow};
    use crate::strategy_cache::StrategyCache;
    use crate::symbol_filter::SymbolFilterCache;
    use crate::types::TradeType;
    use crate::venue::{ExchangeClient, NewOrder, OrderAck, OrderStatus, VenueError};
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    fn tick(venue: Venue, symbol: &str, price: f64, ts: i64) -> TickEvent {
        TickEvent { venue, symbol: symbol.to_string(), price, timestamp_ms: ts }
    }

    #[test]
    fn tick_queue_drops_oldest_when_full() {
        let queue = TickQueue::new(2);
        queue.push(tick(Venue::Binance, "BTCUSDT", 1.0, 1));
        queue.push(tick(Venue::Binance, "BTCUSDT", 2.0, 2));
        queue.push(tick(Venue::Binance, "BTCUSDT", 3.0, 3));
        assert_eq!(queue.len(), 2);
        let first = queue.try_pop().unwrap();
        assert_eq!(first.timestamp_ms, 2, "oldest (ts=1) should have been dropped");
    }

    #[test]
    fn dedup_keeps_latest_timestamp_per_symbol() {
        let batch = vec![
            tick(Venue::Binance, "BTCUSDT", 100.0, 1),
            tick(Venue::Binance, "BTCUSDT", 101.0, 5),
            tick(Venue::Binance, "ETHUSDT", 50.0, 3),
        ];
        let deduped = dedup_latest_per_symbol(batch);
        assert_eq!(deduped.len(), 2);
        let btc = deduped.iter().find(|t| t.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.timestamp_ms, 5);
    }

    struct MockClient;

    #[async_trait]
    impl ExchangeClient for MockClient {
        async fn place_order(&self, _order: NewOrder<'_>) -> Result<OrderAck, VenueError> {
            Ok(OrderAck { order_id: "1".into(), avg_price: Some(100.0), status: "FILLED".into() })
        }
        async fn cancel_order(&self, _s: &str, _o: &str) -> Result<(), VenueError> {
            Ok(())
        }
        async fn get_order_status(&self, _s: &str, _o: &str) -> Result<OrderStatus, VenueError> {
            Ok(OrderStatus::Filled)
        }
        async fn get_account(&self) -> Result<serde_json::Value, VenueError> {
            Ok(serde_json::json!({}))
        }
        async fn get_exchange_info(&self, _s: &str) -> Result<serde_json::Value, VenueError> {
            Ok(serde_json::json!({}))
        }
        async fn get_klines(&self, _s: &str, _i: &str, _l: u32) -> Result<Vec<crate::market_data::Candle>, VenueError> {
            Ok(vec![])
        }
    }

    fn order_service_config() -> OrderServiceConfig {
        OrderServiceConfig {
            position_open_cache_ttl: Duration::from_secs(5),
            failure_cooldown: Duration::from_secs(60),
            tp_sl_placement_delay: Duration::from_millis(1),
            order_retry_max: 1,
            order_retry_base: Duration::from_millis(1),
            extend_max_diff_ratio: 0.5,
            passive_limit_on_extend_miss: true,
        }
    }

    #[tokio::test]
    async fn consumer_dispatches_match_to_order_service() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_bot(Bot {
            id: "b1".into(),
            venue: Venue::Binance,
            is_active: true,
            is_reverse_strategy_default: false,
            max_concurrent_trades: 5,
            default_leverage: 10,
            hedge_mode: false,
            notify_chat_ids: vec![],
        });
        store.seed_strategy(crate::store::Strategy {
            id: "s1".into(),
            bot_id: "b1".into(),
            venue: Venue::Binance,
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            oc_threshold: 3.0,
            trade_type: TradeType::Both,
            is_reverse_strategy: false,
            extend: 0,
            take_profit: 10,
            stoploss: 0,
            reduce: 0.0,
            up_reduce: 0.0,
            amount: 100.0,
            is_active: true,
        });

        let strategy_cache = Arc::new(StrategyCache::new(store));
        strategy_cache.refresh().await.unwrap();

        // The order path never falls back to current-price, so register a
        // real candle for the bucket the test tick lands in.
        let candle_buffer = Arc::new(crate::market_data::CandleBuffer::new(10));
        candle_buffer.update(
            crate::market_data::CandleKey { venue: Venue::Binance, symbol: "BTCUSDT".into(), interval: "1m".into() },
            crate::market_data::Candle {
                open_time: 0,
                close_time: 59_999,
                open: 100.0,
                high: 100.0,
                low: 100.0,
                close: 100.0,
                volume: 0.0,
                is_closed: true,
            },
        );
        let mut candles = StdHashMap::new();
        candles.insert(Venue::Binance, candle_buffer);
        let open_prices = Arc::new(OpenPriceCache::new(
            candles,
            StdHashMap::<Venue, Arc<dyn ExchangeClient>>::new(),
            crate::open_price_cache::OpenPriceCacheConfig {
                max_entries: 100,
                ttl: Duration::from_secs(900),
                memo_ttl: Duration::from_millis(1),
                rest_fallback_enabled: false,
                rest_fallback_max_concurrent: 1,
                rest_fallback_breaker_window: Duration::from_secs(60),
                open_prime_tolerance: Duration::from_millis(500),
            },
        ));

        let detector = Arc::new(OcDetector::new(strategy_cache, open_prices.clone(), 0.0));

        let filters = Arc::new(SymbolFilterCache::new());
        filters.bulk_upsert(
            Venue::Binance,
            vec![("BTCUSDT".to_string(), SymbolFilterRow { tick_size: 0.01, step_size: 0.001, min_notional: 5.0, max_leverage: 20 })],
        );
        let positions = Arc::new(PositionManager::new());
        let service = Arc::new(OrderService::new(
            Bot {
                id: "b1".into(),
                venue: Venue::Binance,
                is_active: true,
                is_reverse_strategy_default: false,
                max_concurrent_trades: 5,
                default_leverage: 10,
                hedge_mode: false,
                notify_chat_ids: vec![],
            },
            Arc::new(MockClient) as Arc<dyn ExchangeClient>,
            positions.clone(),
            filters,
            None,
            order_service_config(),
        ));
        let mut order_services = HashMap::new();
        order_services.insert("b1".to_string(), service);

        let consumer = Arc::new(TickConsumer::new(
            detector,
            open_prices,
            None,
            None,
            order_services,
            TickConsumerConfig {
                min_tick_interval: Duration::from_millis(0),
                batch_size: 10,
                batch_timeout: Duration::from_millis(20),
                tick_concurrency: 4,
            },
        ));

        // 6% move against a 3% threshold, both=trend-following => long MARKET.
        consumer.process_tick(tick(Venue::Binance, "BTCUSDT", 106.0, 1)).await;

        assert_eq!(positions.get_open_positions().len(), 1);
    }

    #[tokio::test]
    async fn empty_match_set_does_not_panic_or_dispatch() {
        let detector = Arc::new(OcDetector::new(
            Arc::new(StrategyCache::new(Arc::new(InMemoryStore::new()))),
            Arc::new(OpenPriceCache::new(
                StdHashMap::<Venue, Arc<crate::market_data::CandleBuffer>>::new(),
                StdHashMap::<Venue, Arc<dyn ExchangeClient>>::new(),
                crate::open_price_cache::OpenPriceCacheConfig {
                    max_entries: 10,
                    ttl: Duration::from_secs(60),
                    memo_ttl: Duration::from_millis(1),
                    rest_fallback_enabled: false,
                    rest_fallback_max_concurrent: 1,
                    rest_fallback_breaker_window: Duration::from_secs(60),
                    open_prime_tolerance: Duration::from_millis(500),
                },
            )),
            0.01,
        ));
        let consumer = Arc::new(TickConsumer::new(
            detector,
            Arc::new(OpenPriceCache::new(
                StdHashMap::<Venue, Arc<crate::market_data::CandleBuffer>>::new(),
                StdHashMap::<Venue, Arc<dyn ExchangeClient>>::new(),
                crate::open_price_cache::OpenPriceCacheConfig {
                    max_entries: 10,
                    ttl: Duration::from_secs(60),
                    memo_ttl: Duration::from_millis(1),
                    rest_fallback_enabled: false,
                    rest_fallback_max_concurrent: 1,
                    rest_fallback_breaker_window: Duration::from_secs(60),
                    open_prime_tolerance: Duration::from_millis(500),
                },
            )),
            None,
            None,
            HashMap::new(),
            TickConsumerConfig {
                min_tick_interval: Duration::from_millis(0),
                batch_size: 10,
                batch_timeout: Duration::from_millis(10),
                tick_concurrency: 2,
            },
        ));
        consumer.process_tick(tick(Venue::Binance, "BTCUSDT", 100.0, 1)).await;
    }
}
