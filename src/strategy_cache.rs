// =============================================================================
// Strategy Cache — constant-time (venue, symbol) -> active strategies
// =============================================================================
//
// Single-writer / many-reader snapshot, refreshed periodically (default 60 s,
// spec §4.2) and on demand. Readers never block on the refresh: the old
// snapshot stays live until the new one is built and swapped in under a
// short write lock, mirroring the CandleBuffer's "replace the ring, not the
// element" discipline.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::store::{Store, Strategy};
use crate::types::{normalize_symbol, Venue};

pub struct StrategyCache {
    store: Arc<dyn Store>,
    snapshot: RwLock<HashMap<(Venue, String), Vec<Strategy>>>,
}

impl StrategyCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    /// Active strategies for a (venue, symbol) pair. Symbol is normalized
    /// before lookup so callers may pass raw exchange symbols.
    pub fn get_strategies(&self, venue: Venue, symbol: &str) -> Vec<Strategy> {
        let key = (venue, normalize_symbol(symbol));
        self.snapshot
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Rebuild the snapshot from the store. Only active strategies of active
    /// bots are indexed (spec §4.2); a strategy whose bot is inactive is
    /// dropped even if the strategy row itself is marked active.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let strategies = self.store.list_active_strategies().await?;
        let bots = self.store.list_active_bots().await?;
        let active_bot_ids: std::collections::HashSet<&str> =
            bots.iter().map(|b| b.id.as_str()).collect();

        let mut next: HashMap<(Venue, String), Vec<Strategy>> = HashMap::new();
        let mut skipped = 0usize;
        for strategy in strategies {
            if !active_bot_ids.contains(strategy.bot_id.as_str()) {
                skipped += 1;
                continue;
            }
            let key = (strategy.venue, normalize_symbol(&strategy.symbol));
            next.entry(key).or_default().push(strategy);
        }

        let count: usize = next.values().map(Vec::len).sum();
        *self.snapshot.write() = next;
        if skipped > 0 {
            warn!(skipped, "strategies skipped — owning bot inactive");
        }
        debug!(count, "strategy cache refreshed");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the periodic refresh loop. A watchdog-style guard is unnecessary
/// here because `refresh` holds no lock across its store calls — the snapshot
/// write lock is only taken once, after the store round-trip completes.
pub async fn run_refresh_loop(cache: Arc<StrategyCache>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = cache.refresh().await {
            warn!(error = %e, "strategy cache refresh failed");
        } else {
            info!(count = cache.len(), "strategy cache refresh complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::types::TradeType;

    fn sample_strategy(bot_id: &str, symbol: &str) -> Strategy {
        Strategy {
            id: "s1".into(),
            bot_id: bot_id.into(),
            venue: Venue::Binance,
            symbol: symbol.into(),
            interval: "1m".into(),
            oc_threshold: 3.0,
            trade_type: TradeType::Long,
            is_reverse_strategy: false,
            extend: 50,
            take_profit: 55,
            stoploss: 20,
            reduce: 0.0,
            up_reduce: 0.0,
            amount: 100.0,
            is_active: true,
        }
    }

    fn sample_bot(id: &str, is_active: bool) -> crate::store::Bot {
        crate::store::Bot {
            id: id.into(),
            venue: Venue::Binance,
            is_active,
            is_reverse_strategy_default: false,
            max_concurrent_trades: 3,
            default_leverage: 10,
            hedge_mode: false,
            notify_chat_ids: vec![],
        }
    }

    #[tokio::test]
    async fn refresh_indexes_by_normalized_symbol() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_bot(sample_bot("b1", true));
        store.seed_strategy(sample_strategy("b1", "btc/usdt"));

        let cache = StrategyCache::new(store);
        cache.refresh().await.unwrap();

        assert_eq!(cache.get_strategies(Venue::Binance, "BTCUSDT").len(), 1);
        assert_eq!(cache.get_strategies(Venue::Binance, "btc_usdt").len(), 1);
    }

    #[tokio::test]
    async fn strategies_of_inactive_bots_are_dropped() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_bot(sample_bot("b1", false));
        store.seed_strategy(sample_strategy("b1", "BTCUSDT"));

        let cache = StrategyCache::new(store);
        cache.refresh().await.unwrap();

        assert!(cache.get_strategies(Venue::Binance, "BTCUSDT").is_empty());
    }
}
