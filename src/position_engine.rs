// =============================================================================
// Position Engine — the Position record and its lifecycle
// =============================================================================
//
// Life-cycle (spec §3):
//   created on entry-order acknowledgement, by the Order Service
//   -> mutated by reconciliation against the exchange (§4.10)
//   -> closed when the exchange reports the terminating order (TP or SL)
//      filled, or cancelled if the entry never filled.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::types::{Side, Venue};

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    Cancelled,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single tracked position, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub bot_id: String,
    pub strategy_id: String,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    /// Quantity in contracts.
    pub amount: f64,
    pub take_profit_price: f64,
    #[serde(default)]
    pub stop_loss_price: Option<f64>,
    #[serde(default)]
    pub tp_order_id: Option<String>,
    #[serde(default)]
    pub sl_order_id: Option<String>,
    #[serde(default)]
    pub entry_order_id: Option<String>,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub pnl: f64,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bot_id: impl Into<String>,
        strategy_id: impl Into<String>,
        venue: Venue,
        symbol: impl Into<String>,
        side: Side,
        entry_price: f64,
        amount: f64,
        take_profit_price: f64,
        stop_loss_price: Option<f64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.into(),
            strategy_id: strategy_id.into(),
            venue,
            symbol: symbol.into(),
            side,
            entry_price,
            amount,
            take_profit_price,
            stop_loss_price,
            tp_order_id: None,
            sl_order_id: None,
            entry_order_id: None,
            status: PositionStatus::Open,
            opened_at: Utc::now().to_rfc3339(),
            close_reason: None,
            pnl: 0.0,
        }
    }

    fn direction(&self) -> f64 {
        match self.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Unrealized pnl at `price`, quote currency.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.direction() * (price - self.entry_price) * self.amount
    }
}

/// Thread-safe manager that owns the set of tracked positions for the whole
/// engine. Positions for all bots share one table; admission and concurrency
/// checks are keyed by `strategy_id` / `bot_id` per spec §4.8.
pub struct PositionManager {
    positions: RwLock<Vec<Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(Vec::new()),
        }
    }

    pub fn seed(&self, positions: Vec<Position>) {
        *self.positions.write() = positions;
    }

    /// Record a newly-opened position.
    pub fn open_position(&self, position: Position) {
        info!(
            id = %position.id,
            bot_id = %position.bot_id,
            strategy_id = %position.strategy_id,
            symbol = %position.symbol,
            side = %position.side,
            entry_price = position.entry_price,
            amount = position.amount,
            "position opened"
        );
        self.positions.write().push(position);
    }

    /// Whether a strategy already has an open position — the admission
    /// check in spec §4.8 step 1 ("one open position per strategy").
    pub fn has_open_position_for_strategy(&self, strategy_id: &str) -> bool {
        self.positions
            .read()
            .iter()
            .any(|p| p.strategy_id == strategy_id && p.status == PositionStatus::Open)
    }

    /// Count of open positions for a given bot — enforces
    /// `max_concurrent_trades` (spec §4.8 invariant).
    pub fn open_count_for_bot(&self, bot_id: &str) -> u32 {
        self.positions
            .read()
            .iter()
            .filter(|p| p.bot_id == bot_id && p.status == PositionStatus::Open)
            .count() as u32
    }

    pub fn get_open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .iter()
            .filter(|p| p.status == PositionStatus::Open)
            .cloned()
            .collect()
    }

    pub fn get_open_positions_for_bot(&self, bot_id: &str) -> Vec<Position> {
        self.positions
            .read()
            .iter()
            .filter(|p| p.bot_id == bot_id && p.status == PositionStatus::Open)
            .cloned()
            .collect()
    }

    /// Record the order ids returned by the exchange once the entry and
    /// TP/SL orders have been placed (spec §4.8 steps 5-6).
    pub fn record_order_ids(
        &self,
        id: &str,
        entry_order_id: Option<String>,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
    ) {
        let mut positions = self.positions.write();
        if let Some(p) = positions.iter_mut().find(|p| p.id == id) {
            if entry_order_id.is_some() {
                p.entry_order_id = entry_order_id;
            }
            if tp_order_id.is_some() {
                p.tp_order_id = tp_order_id;
            }
            if sl_order_id.is_some() {
                p.sl_order_id = sl_order_id;
            }
        }
    }

    /// Mark a position closed with the given reason and realized pnl.
    pub fn close_position(&self, id: &str, close_reason: impl Into<String>, pnl: f64) {
        let mut positions = self.positions.write();
        if let Some(p) = positions.iter_mut().find(|p| p.id == id) {
            p.status = PositionStatus::Closed;
            p.close_reason = Some(close_reason.into());
            p.pnl = pnl;
            info!(id = %p.id, symbol = %p.symbol, pnl, "position closed");
        }
    }

    /// Mark a position cancelled — the entry order never filled.
    pub fn cancel_position(&self, id: &str, reason: impl Into<String>) {
        let mut positions = self.positions.write();
        if let Some(p) = positions.iter_mut().find(|p| p.id == id) {
            p.status = PositionStatus::Cancelled;
            p.close_reason = Some(reason.into());
            info!(id = %p.id, symbol = %p.symbol, "position cancelled");
        }
    }

    pub fn find(&self, id: &str) -> Option<Position> {
        self.positions.read().iter().find(|p| p.id == id).cloned()
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let positions = self.positions.read();
        let open = positions.iter().filter(|p| p.status == PositionStatus::Open).count();
        f.debug_struct("PositionManager")
            .field("total", &positions.len())
            .field("open", &open)
            .finish()
    }
}
