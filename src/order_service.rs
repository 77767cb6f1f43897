// =============================================================================
// Order Service — per-bot signal execution state machine, spec §4.8
// =============================================================================
//
// One `OrderService` exists per bot. The Tick Consumer dispatches each match
// to the owning bot's service; dispatch is `allSettled` at the caller, so a
// failure here must never panic or propagate across strategies.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::oc_detector::MatchResult;
use crate::order_error::{classify, OrderError};
use crate::pricing::{price_signal, OrderKind, PricingError};
use crate::position_engine::{Position, PositionManager};
use crate::side_selection::select_side;
use crate::store::Bot;
use crate::symbol_filter::SymbolFilterCache;
use crate::telegram::dispatcher::TelegramDispatcher;
use crate::types::Side;
use crate::util::Throttle;
use crate::venue::{ExchangeClient, NewOrder, PositionMode};

/// Tunables the service needs from `RuntimeConfig`, threaded through
/// explicitly (mirrors `OpenPriceCacheConfig`'s approach).
#[derive(Debug, Clone, Copy)]
pub struct OrderServiceConfig {
    pub position_open_cache_ttl: Duration,
    pub failure_cooldown: Duration,
    pub tp_sl_placement_delay: Duration,
    pub order_retry_max: u32,
    pub order_retry_base: Duration,
    pub extend_max_diff_ratio: f64,
    pub passive_limit_on_extend_miss: bool,
}

/// Executes signals for a single bot against a single venue.
pub struct OrderService {
    bot: Bot,
    client: Arc<dyn ExchangeClient>,
    positions: Arc<PositionManager>,
    filters: Arc<SymbolFilterCache>,
    telegram: Option<Arc<TelegramDispatcher>>,
    config: OrderServiceConfig,
    /// Admission memo: avoids a position-manager scan on every tick for a
    /// strategy that already has a known-open position (step 1, TTL 5s).
    admission_memo: crate::util::LruTtlCache<String, bool>,
    /// Per-strategy failure cooldown (step 2, default 60s).
    cooldown: Throttle<String>,
}

impl OrderService {
    pub fn new(
        bot: Bot,
        client: Arc<dyn ExchangeClient>,
        positions: Arc<PositionManager>,
        filters: Arc<SymbolFilterCache>,
        telegram: Option<Arc<TelegramDispatcher>>,
        config: OrderServiceConfig,
    ) -> Self {
        Self {
            bot,
            client,
            positions,
            filters,
            telegram,
            config,
            admission_memo: crate::util::LruTtlCache::new(10_000, config.position_open_cache_ttl),
            cooldown: Throttle::new(),
        }
    }

    /// Execute one match end-to-end. Never returns an `Err` the caller must
    /// act on — every failure is classified, logged, and (for fatal/business
    /// failures) notified internally; the return value is informational.
    pub async fn handle_match(&self, m: MatchResult) {
        let strategy_id = m.strategy.id.clone();

        // Step 2: failure cooldown gates before admission so a strategy that
        // just failed doesn't pay for a position-manager lookup either.
        let remaining = self.cooldown.remaining(&strategy_id, self.config.failure_cooldown);
        if remaining > Duration::ZERO {
            debug!(strategy_id = %strategy_id, remaining_ms = remaining.as_millis(), "strategy in failure cooldown, skipping");
            return;
        }

        // Step 1: admission — one open position per strategy.
        if self.is_admitted(&strategy_id) {
            debug!(strategy_id = %strategy_id, "strategy already has an open position, skipping");
            return;
        }

        if self.positions.open_count_for_bot(&self.bot.id) >= self.bot.max_concurrent_trades {
            info!(bot_id = %self.bot.id, "max concurrent trades reached, skipping signal");
            return;
        }

        let direction = m.direction;
        let side = match select_side(direction, m.strategy.trade_type, m.strategy.is_reverse_strategy) {
            Some(side) => side,
            None => return,
        };

        // Step 3: filter resolution.
        let Some(filter) = self.filters.get(m.strategy.venue, &m.strategy.symbol) else {
            warn!(symbol = %m.strategy.symbol, strategy_id = %strategy_id, "no symbol filter, failing signal");
            self.on_failure(&strategy_id, "missing symbol filter");
            return;
        };

        let priced = price_signal(
            side,
            m.strategy.is_reverse_strategy,
            m.open_price,
            m.current_price,
            m.current_price,
            m.strategy.extend,
            m.strategy.take_profit,
            m.strategy.stoploss,
            m.strategy.amount,
            self.config.extend_max_diff_ratio,
            self.config.passive_limit_on_extend_miss,
            filter,
        );

        let priced = match priced {
            Ok(p) => p,
            Err(PricingError::ExtendMissed) => {
                debug!(strategy_id = %strategy_id, "extend window missed, skipping");
                return;
            }
            Err(PricingError::BelowMinNotional) => {
                warn!(strategy_id = %strategy_id, "order below minimum notional, failing signal");
                self.on_failure(&strategy_id, "notional below minimum");
                return;
            }
        };

        self.submit(&m, side, priced).await;
    }

    fn is_admitted(&self, strategy_id: &str) -> bool {
        if let Some(known_open) = self.admission_memo.get(&strategy_id.to_string()) {
            return known_open;
        }
        let open = self.positions.has_open_position_for_strategy(strategy_id);
        self.admission_memo.insert(strategy_id.to_string(), open);
        open
    }

    /// Steps 4-7: fill-price discovery, entry submission, paired TP/SL,
    /// position record creation, with step-8 retry/cooldown classification.
    async fn submit(&self, m: &MatchResult, side: Side, priced: crate::pricing::PricedOrder) {
        let symbol = m.strategy.symbol.as_str();
        let position_mode = if self.bot.hedge_mode { PositionMode::Hedge } else { PositionMode::OneWay };

        let entry_order_type = match priced.kind {
            OrderKind::Limit => "LIMIT",
            OrderKind::Market => "MARKET",
        };

        let entry_ack = match self
            .place_with_retry(|| {
                let order = NewOrder {
                    symbol,
                    side: side.entry_order_side(),
                    order_type: entry_order_type,
                    quantity: priced.quantity,
                    price: match priced.kind {
                        OrderKind::Limit => Some(priced.entry_price),
                        OrderKind::Market => None,
                    },
                    stop_price: None,
                    reduce_only: false,
                    position_mode,
                    client_order_id: None,
                };
                self.client.place_order(order)
            })
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                self.handle_failure(&m.strategy.id, err, "entry");
                return;
            }
        };

        // Step 4: fill-price discovery. LIMIT uses the computed entry; MARKET
        // uses the venue's reported average fill, falling back to the
        // computed entry if the venue didn't report one.
        let fill_price = match priced.kind {
            OrderKind::Limit => priced.entry_price,
            OrderKind::Market => entry_ack.avg_price.unwrap_or(priced.entry_price),
        };

        let position = Position::new(
            self.bot.id.clone(),
            m.strategy.id.clone(),
            m.strategy.venue,
            symbol,
            side,
            fill_price,
            priced.quantity,
            priced.take_profit_price,
            priced.stop_loss_price,
        );
        let position_id = position.id.clone();
        self.positions.open_position(position);
        self.admission_memo.insert(m.strategy.id.clone(), true);

        let closing_side = side.closing_order_side();

        // Step 6: TP first.
        let tp_order_id = match self
            .place_with_retry(|| {
                let order = NewOrder {
                    symbol,
                    side: closing_side,
                    order_type: "LIMIT",
                    quantity: priced.quantity,
                    price: Some(priced.take_profit_price),
                    stop_price: None,
                    reduce_only: true,
                    position_mode,
                    client_order_id: None,
                };
                self.client.place_order(order)
            })
            .await
        {
            Ok(ack) => Some(ack.order_id),
            Err(err) => {
                self.handle_failure(&m.strategy.id, err, "take_profit");
                None
            }
        };

        tokio::time::sleep(self.config.tp_sl_placement_delay).await;

        let sl_order_id = if let Some(sl_price) = priced.stop_loss_price {
            match self
                .place_with_retry(|| {
                    let order = NewOrder {
                        symbol,
                        side: closing_side,
                        order_type: "STOP_MARKET",
                        quantity: priced.quantity,
                        price: None,
                        stop_price: Some(sl_price),
                        reduce_only: true,
                        position_mode,
                        client_order_id: None,
                    };
                    self.client.place_order(order)
                })
                .await
            {
                Ok(ack) => Some(ack.order_id),
                Err(err) => {
                    self.handle_failure(&m.strategy.id, err, "stop_loss");
                    None
                }
            }
        } else {
            None
        };

        self.positions.record_order_ids(&position_id, Some(entry_ack.order_id), tp_order_id, sl_order_id);

        info!(
            strategy_id = %m.strategy.id,
            bot_id = %self.bot.id,
            symbol,
            side = %side,
            entry_price = fill_price,
            "signal executed"
        );
    }

    /// Submit an order, retrying transient/precision failures with
    /// exponential backoff up to `order_retry_max` attempts (step 8).
    async fn place_with_retry<F, Fut>(&self, mut submit: F) -> Result<crate::venue::OrderAck, OrderError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<crate::venue::OrderAck, crate::venue::VenueError>>,
    {
        let mut attempt = 0u32;
        loop {
            match submit().await {
                Ok(ack) => return Ok(ack),
                Err(venue_err) => {
                    let classified = classify(&venue_err);
                    let retryable = matches!(
                        classified,
                        OrderError::Transient { .. } | OrderError::RateLimited { .. } | OrderError::Precision { .. }
                    );
                    if !retryable || attempt >= self.config.order_retry_max {
                        return Err(classified);
                    }
                    let jitter_ms = rand::random::<u64>() % 100;
                    let backoff = self.config.order_retry_base * 2u32.pow(attempt) + Duration::from_millis(jitter_ms);
                    warn!(attempt, backoff_ms = backoff.as_millis(), error = %classified, "order submission failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn handle_failure(&self, strategy_id: &str, err: OrderError, stage: &str) {
        match &err {
            OrderError::Business { message } => {
                info!(strategy_id, stage, message, "order skipped — business rule");
            }
            OrderError::Fatal { message } => {
                warn!(strategy_id, stage, message, "fatal order error — cooling down bot");
                self.on_failure(strategy_id, message);
                self.notify_fatal(strategy_id, stage, message);
            }
            OrderError::Validation { message } | OrderError::Precision { message } => {
                warn!(strategy_id, stage, message, "order validation/precision failure");
                self.on_failure(strategy_id, message);
            }
            OrderError::Transient { message } | OrderError::RateLimited { message, .. } => {
                warn!(strategy_id, stage, message, "order failed after retries exhausted");
                self.on_failure(strategy_id, message);
            }
            OrderError::Internal { message } => {
                tracing::error!(strategy_id, stage, message, "internal error in order service");
                self.on_failure(strategy_id, message);
            }
        }
    }

    fn on_failure(&self, strategy_id: &str, _reason: &str) {
        // Seed the cooldown throttle so `remaining` reports a non-zero
        // duration for `failure_cooldown` from now.
        self.cooldown.try_pass(strategy_id.to_string(), Duration::ZERO);
    }

    fn notify_fatal(&self, strategy_id: &str, stage: &str, message: &str) {
        let Some(telegram) = &self.telegram else { return };
        if self.bot.notify_chat_ids.is_empty() {
            return;
        }
        let text = format!(
            "\u{26a0}\u{fe0f} fatal order error\nbot: {}\nstrategy: {strategy_id}\nstage: {stage}\n{message}",
            self.bot.id
        );
        for chat_id in &self.bot.notify_chat_ids {
            telegram.enqueue("order", *chat_id, text.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SymbolFilterRow;
    use crate::types::{Direction, TradeType, Venue};
    use crate::venue::{OrderStatus, VenueError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockClient {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl ExchangeClient for MockClient {
        async fn place_order(&self, _order: NewOrder<'_>) -> Result<crate::venue::OrderAck, VenueError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(VenueError { http_status: Some(503), code: None, message: "temp".into() });
            }
            Ok(crate::venue::OrderAck { order_id: "1".into(), avg_price: Some(100.0), status: "FILLED".into() })
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

    fn bot() -> Bot {
        Bot {
            id: "b1".into(),
            venue: Venue::Binance,
            is_active: true,
            is_reverse_strategy_default: false,
            max_concurrent_trades: 3,
            default_leverage: 10,
            hedge_mode: false,
            notify_chat_ids: vec![],
        }
    }

    fn config() -> OrderServiceConfig {
        OrderServiceConfig {
            position_open_cache_ttl: Duration::from_secs(5),
            failure_cooldown: Duration::from_secs(60),
            tp_sl_placement_delay: Duration::from_millis(1),
            order_retry_max: 3,
            order_retry_base: Duration::from_millis(1),
            extend_max_diff_ratio: 0.5,
            passive_limit_on_extend_miss: true,
        }
    }

    fn strategy() -> crate::store::Strategy {
        crate::store::Strategy {
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
        }
    }

    fn match_result() -> MatchResult {
        MatchResult {
            strategy: strategy(),
            oc_percent: 6.0,
            direction: Direction::Bullish,
            current_price: 106.0,
            open_price: 100.0,
            interval: "1m".into(),
            timestamp: 0,
        }
    }

    fn filters() -> Arc<SymbolFilterCache> {
        let f = Arc::new(SymbolFilterCache::new());
        f.bulk_upsert(
            Venue::Binance,
            vec![(
                "BTCUSDT".to_string(),
                SymbolFilterRow { tick_size: 0.01, step_size: 0.001, min_notional: 5.0, max_leverage: 20 },
            )],
        );
        f
    }

    #[tokio::test]
    async fn successful_signal_opens_a_position_with_all_order_ids() {
        let client = Arc::new(MockClient { fail_times: AtomicU32::new(0) });
        let positions = Arc::new(PositionManager::new());
        let service =
            OrderService::new(bot(), client, positions.clone(), filters(), None, config());

        service.handle_match(match_result()).await;

        let open = positions.get_open_positions();
        assert_eq!(open.len(), 1);
        assert!(open[0].entry_order_id.is_some());
        assert!(open[0].tp_order_id.is_some());
    }

    #[tokio::test]
    async fn second_signal_for_same_strategy_is_blocked_by_admission() {
        let client = Arc::new(MockClient { fail_times: AtomicU32::new(0) });
        let positions = Arc::new(PositionManager::new());
        let service =
            OrderService::new(bot(), client, positions.clone(), filters(), None, config());

        service.handle_match(match_result()).await;
        service.handle_match(match_result()).await;

        assert_eq!(positions.get_open_positions().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let client = Arc::new(MockClient { fail_times: AtomicU32::new(2) });
        let positions = Arc::new(PositionManager::new());
        let service =
            OrderService::new(bot(), client, positions.clone(), filters(), None, config());

        service.handle_match(match_result()).await;
        assert_eq!(positions.get_open_positions().len(), 1);
    }

    #[tokio::test]
    async fn missing_filter_fails_without_panicking() {
        let client = Arc::new(MockClient { fail_times: AtomicU32::new(0) });
        let positions = Arc::new(PositionManager::new());
        let service =
            OrderService::new(bot(), client, positions.clone(), Arc::new(SymbolFilterCache::new()), None, config());

        service.handle_match(match_result()).await;
        assert!(positions.get_open_positions().is_empty());
    }
}
