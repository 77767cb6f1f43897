// =============================================================================
// In-memory Store — reference implementation for tests and local/demo runs
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::position_engine::Position;
use crate::store::{Bot, PriceAlertConfigRow, Store, Strategy, SymbolFilterRow};
use crate::types::Venue;

#[derive(Default)]
pub struct InMemoryStore {
    strategies: RwLock<Vec<Strategy>>,
    bots: RwLock<Vec<Bot>>,
    alert_configs: RwLock<Vec<PriceAlertConfigRow>>,
    positions: RwLock<HashMap<String, Position>>,
    symbol_filters: RwLock<HashMap<Venue, Vec<(String, SymbolFilterRow)>>>,
    app_config: RwLock<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_strategy(&self, strategy: Strategy) {
        self.strategies.write().push(strategy);
    }

    pub fn seed_bot(&self, bot: Bot) {
        self.bots.write().push(bot);
    }

    pub fn seed_alert_config(&self, cfg: PriceAlertConfigRow) {
        self.alert_configs.write().push(cfg);
    }

    pub fn seed_symbol_filters(&self, venue: Venue, filters: Vec<(String, SymbolFilterRow)>) {
        self.symbol_filters.write().insert(venue, filters);
    }

    pub fn set_config(&self, key: &str, value: &str) {
        self.app_config
            .write()
            .insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_active_strategies(&self) -> anyhow::Result<Vec<Strategy>> {
        Ok(self
            .strategies
            .read()
            .iter()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn list_active_bots(&self) -> anyhow::Result<Vec<Bot>> {
        Ok(self
            .bots
            .read()
            .iter()
            .filter(|b| b.is_active)
            .cloned()
            .collect())
    }

    async fn list_alert_configs(&self) -> anyhow::Result<Vec<PriceAlertConfigRow>> {
        Ok(self.alert_configs.read().clone())
    }

    async fn find_open_positions(&self, bot_id: &str) -> anyhow::Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .values()
            .filter(|p| p.bot_id == bot_id && p.status == crate::position_engine::PositionStatus::Open)
            .cloned()
            .collect())
    }

    async fn insert_position(&self, position: Position) -> anyhow::Result<()> {
        self.positions.write().insert(position.id.clone(), position);
        Ok(())
    }

    async fn update_position(&self, position: Position) -> anyhow::Result<()> {
        self.positions.write().insert(position.id.clone(), position);
        Ok(())
    }

    async fn get_symbol_filters(
        &self,
        venue: Venue,
    ) -> anyhow::Result<Vec<(String, SymbolFilterRow)>> {
        Ok(self
            .symbol_filters
            .read()
            .get(&venue)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_config(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.app_config.read().get(key).cloned())
    }
}
