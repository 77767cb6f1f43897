// =============================================================================
// Symbol-Filter Cache — exchange precision constraints per (venue, symbol)
// =============================================================================
//
// Read-through, write-seldom: populated at startup from the store and kept
// current by an external refresh job (out of scope — see spec §1) that polls
// venue exchange-info and calls `bulk_upsert`/`replace_snapshot`. A missing
// entry means "not tradable"; callers must treat `get` returning `None` as a
// hard rejection, never a default.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::store::{SymbolFilterRow, Store};
use crate::types::Venue;

pub struct SymbolFilterCache {
    filters: RwLock<HashMap<(Venue, String), SymbolFilterRow>>,
}

impl SymbolFilterCache {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// O(1) lookup. Symbol is normalized before indexing, so callers may pass
    /// raw exchange symbols.
    pub fn get(&self, venue: Venue, symbol: &str) -> Option<SymbolFilterRow> {
        let key = (venue, crate::types::normalize_symbol(symbol));
        self.filters.read().get(&key).copied()
    }

    /// Insert or update filters for a set of symbols without touching the
    /// rest of the venue's entries.
    pub fn bulk_upsert(&self, venue: Venue, rows: impl IntoIterator<Item = (String, SymbolFilterRow)>) {
        let mut map = self.filters.write();
        let mut count = 0;
        for (symbol, row) in rows {
            map.insert((venue, crate::types::normalize_symbol(&symbol)), row);
            count += 1;
        }
        debug!(venue = %venue, count, "symbol filters upserted");
    }

    /// Replace the entire set of filters for `venue` — used by the refresh
    /// job to drop symbols that are no longer tradable.
    pub fn replace_snapshot(&self, venue: Venue, rows: Vec<(String, SymbolFilterRow)>) {
        let mut map = self.filters.write();
        map.retain(|(v, _), _| *v != venue);
        let count = rows.len();
        for (symbol, row) in rows {
            map.insert((venue, crate::types::normalize_symbol(&symbol)), row);
        }
        info!(venue = %venue, count, "symbol filter snapshot replaced");
    }

    pub fn len_for(&self, venue: Venue) -> usize {
        self.filters.read().keys().filter(|(v, _)| *v == venue).count()
    }
}

impl Default for SymbolFilterCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically refresh every venue's filter snapshot from the store. Guarded
/// by an `is_refreshing` flag so a slow refresh doesn't overlap itself; a
/// watchdog forcibly clears the flag after `watchdog_timeout` to prevent a
/// stuck refresh from wedging the cache forever (spec §5).
pub async fn run_refresh_loop(
    cache: Arc<SymbolFilterCache>,
    store: Arc<dyn Store>,
    period: Duration,
    watchdog_timeout: Duration,
) {
    let is_refreshing = Arc::new(AtomicBool::new(false));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;

        if is_refreshing.swap(true, Ordering::SeqCst) {
            warn!("symbol filter refresh already in progress, skipping this tick");
            continue;
        }

        let guard = is_refreshing.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(watchdog_timeout).await;
            if guard.swap(false, Ordering::SeqCst) {
                warn!("symbol filter refresh watchdog forcibly released a stuck refresh");
            }
        });

        for venue in [Venue::Binance, Venue::Bybit] {
            match store.get_symbol_filters(venue).await {
                Ok(rows) => {
                    let count = rows.len();
                    cache.replace_snapshot(venue, rows);
                    debug!(venue = %venue, count, "symbol filter cache refreshed from store");
                }
                Err(e) => warn!(venue = %venue, error = %e, "symbol filter refresh failed"),
            }
        }

        watchdog.abort();
        is_refreshing.store(false, Ordering::SeqCst);
        info!("symbol filter cache refresh complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    fn row(tick: f64) -> SymbolFilterRow {
        SymbolFilterRow {
            tick_size: tick,
            step_size: 0.001,
            min_notional: 5.0,
            max_leverage: 20,
        }
    }

    #[test]
    fn missing_entry_is_none() {
        let cache = SymbolFilterCache::new();
        assert!(cache.get(Venue::Binance, "BTCUSDT").is_none());
    }

    #[test]
    fn bulk_upsert_is_retrievable_with_raw_symbol() {
        let cache = SymbolFilterCache::new();
        cache.bulk_upsert(Venue::Binance, vec![("btc/usdt".to_string(), row(0.1))]);
        let found = cache.get(Venue::Binance, "BTCUSDT").unwrap();
        assert_eq!(found.tick_size, 0.1);
    }

    #[test]
    fn replace_snapshot_drops_stale_symbols() {
        let cache = SymbolFilterCache::new();
        cache.bulk_upsert(Venue::Binance, vec![("BTCUSDT".to_string(), row(0.1))]);
        cache.replace_snapshot(Venue::Binance, vec![("ETHUSDT".to_string(), row(0.2))]);
        assert!(cache.get(Venue::Binance, "BTCUSDT").is_none());
        assert!(cache.get(Venue::Binance, "ETHUSDT").is_some());
    }

    #[test]
    fn venues_are_independent() {
        let cache = SymbolFilterCache::new();
        cache.bulk_upsert(Venue::Binance, vec![("BTCUSDT".to_string(), row(0.1))]);
        assert!(cache.get(Venue::Bybit, "BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn refresh_loop_pulls_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store.seed_symbol_filters(Venue::Binance, vec![("BTCUSDT".to_string(), row(0.1))]);
        let cache = Arc::new(SymbolFilterCache::new());

        let handle = tokio::spawn(run_refresh_loop(
            cache.clone(),
            store,
            Duration::from_millis(10),
            Duration::from_secs(5),
        ));
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.abort();

        assert!(cache.get(Venue::Binance, "BTCUSDT").is_some());
    }
}
