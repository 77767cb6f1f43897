// =============================================================================
// Exchange venue abstraction
// =============================================================================
//
// Generalizes the teacher's single `BinanceClient` into a trait so the Order
// Service, reconciliation loop, and Open-Price Cache's REST fallback can be
// written once against both venues (spec §6 "Exchange REST").
// =============================================================================

pub mod binance;
pub mod bybit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;

/// Position mode on a venue — governs whether `position_side` is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    OneWay,
    Hedge,
}

/// Parameters for a new order, in venue-neutral form. Each client translates
/// this into its own wire format (hedge-mode `positionSide`, one-way `BOTH`,
/// `reduceOnly` flags, STOP_MARKET vs LIMIT).
#[derive(Debug, Clone)]
pub struct NewOrder<'a> {
    pub symbol: &'a str,
    /// "BUY" or "SELL".
    pub side: &'a str,
    /// "LIMIT", "MARKET", or "STOP_MARKET".
    pub order_type: &'a str,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub position_mode: PositionMode,
    pub client_order_id: Option<&'a str>,
}

/// Result of a successfully acknowledged order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price if the venue reports one immediately (typical for
    /// MARKET orders); `None` for LIMIT orders that rest on the book.
    pub avg_price: Option<f64>,
    pub status: String,
}

/// Current status of a previously placed order, as reported by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// A venue-reported error code, mapped by `crate::order_error::OrderError`.
#[derive(Debug, Clone)]
pub struct VenueError {
    pub http_status: Option<u16>,
    /// Venue-specific numeric error code (e.g. Binance's `-1111`), if present.
    pub code: Option<i64>,
    pub message: String,
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "venue error (http={:?}, code={:?}): {}", self.http_status, self.code, self.message)
    }
}

impl std::error::Error for VenueError {}

/// Interface the core needs from an exchange, per spec §6.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, order: NewOrder<'_>) -> Result<OrderAck, VenueError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError>;
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError>;
    async fn get_account(&self) -> Result<serde_json::Value, VenueError>;
    async fn get_exchange_info(&self, symbol: &str) -> Result<serde_json::Value, VenueError>;
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, VenueError>;
}
