// =============================================================================
// Persistent Store — interface to the external relational store
// =============================================================================
//
// Storage itself is out of scope for this engine (see spec §1 Non-goals):
// the real implementation lives behind a database the core never touches
// directly. What the core DOES need is a concrete Rust trait to depend on,
// so the hot path (Strategy Cache, Symbol-Filter Cache, Order Service) has
// something to call. `Store` is that trait; `memory::InMemoryStore` is a
// reference implementation used by tests and local/demo runs.
// =============================================================================

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::position_engine::Position;
use crate::types::{TradeType, Venue};

/// A user-configured strategy row, as read from the `strategies` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub bot_id: String,
    pub venue: Venue,
    pub symbol: String,
    pub interval: String,
    /// Percent OC threshold (e.g. `3.0` for 3%).
    pub oc_threshold: f64,
    pub trade_type: TradeType,
    pub is_reverse_strategy: bool,
    /// Pullback ratio as a percent of the open-to-current delta, 0-100.
    pub extend: u32,
    /// Tenth-of-a-percent units; effective percent = value / 10.
    pub take_profit: u32,
    /// Tenth-of-a-percent units; 0 means "no stop-loss".
    pub stoploss: u32,
    #[serde(default)]
    pub reduce: f64,
    #[serde(default)]
    pub up_reduce: f64,
    /// Notional amount in quote currency.
    pub amount: f64,
    pub is_active: bool,
}

/// A bot row, as read from the `bots` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub venue: Venue,
    pub is_active: bool,
    pub is_reverse_strategy_default: bool,
    pub max_concurrent_trades: u32,
    pub default_leverage: u32,
    pub hedge_mode: bool,
    /// Telegram chat ids that should receive notifications for this bot.
    pub notify_chat_ids: Vec<i64>,
}

/// A symbol-filter row, as read from the `symbol_filters` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolFilterRow {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub max_leverage: u32,
}

/// A price-alert watcher configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAlertConfigRow {
    pub config_id: String,
    pub venue: Venue,
    pub symbols: Vec<String>,
    pub intervals: Vec<String>,
    pub threshold_percent: f64,
    pub chat_id: i64,
}

/// The interface the engine needs from the persistent store. All methods are
/// single-row / idempotent at the application level by unique key, per spec
/// §6.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_active_strategies(&self) -> anyhow::Result<Vec<Strategy>>;
    async fn list_active_bots(&self) -> anyhow::Result<Vec<Bot>>;
    async fn list_alert_configs(&self) -> anyhow::Result<Vec<PriceAlertConfigRow>>;
    async fn find_open_positions(&self, bot_id: &str) -> anyhow::Result<Vec<Position>>;
    async fn insert_position(&self, position: Position) -> anyhow::Result<()>;
    async fn update_position(&self, position: Position) -> anyhow::Result<()>;
    async fn get_symbol_filters(&self, venue: Venue) -> anyhow::Result<Vec<(String, SymbolFilterRow)>>;
    async fn get_config(&self, key: &str) -> anyhow::Result<Option<String>>;
}
