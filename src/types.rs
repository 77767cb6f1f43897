// =============================================================================
// Shared types used across the Aurora signal-to-order engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// An exchange venue the engine is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Binance,
    Bybit,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Bybit => write!(f, "bybit"),
        }
    }
}

/// Resolved order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The exchange-facing entry order side ("BUY" for long, "SELL" for short).
    pub fn entry_order_side(self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// The closing side used for TP/SL orders — opposite of the entry side.
    pub fn closing_order_side(self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// A strategy's configured trade direction appetite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeType {
    Long,
    Short,
    Both,
}

/// The direction of an OC (open-to-current) price move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}

/// Provenance tag for a resolved bucket open price — see the Open-Price Cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenSource {
    WsBucketOpen,
    WsLatestCandleOpen,
    WsPrevClose,
    RestOhlcv,
    FallbackCurrentPrice,
    Cache,
}

impl std::fmt::Display for OpenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WsBucketOpen => "ws_bucket_open",
            Self::WsLatestCandleOpen => "ws_latest_candle_open",
            Self::WsPrevClose => "ws_prev_close",
            Self::RestOhlcv => "rest_ohlcv",
            Self::FallbackCurrentPrice => "fallback_current_price",
            Self::Cache => "cache",
        };
        write!(f, "{s}")
    }
}

/// Parse a kline interval string (e.g. "1m", "5m", "15m", "1h") into
/// milliseconds. Unknown intervals fall back to one minute.
pub fn interval_ms(interval: &str) -> i64 {
    match interval {
        "1m" => 60_000,
        "3m" => 3 * 60_000,
        "5m" => 5 * 60_000,
        "15m" => 15 * 60_000,
        "30m" => 30 * 60_000,
        "1h" => 60 * 60_000,
        "4h" => 4 * 60 * 60_000,
        "1d" => 24 * 60 * 60_000,
        _ => 60_000,
    }
}

/// Compute the bucket start for a given interval and timestamp (both in
/// milliseconds), aligned to the UNIX epoch.
///
/// Invariant: `bucket_start <= timestamp_ms < bucket_start + interval_ms`.
pub fn bucket_start(interval: &str, timestamp_ms: i64) -> i64 {
    let step = interval_ms(interval);
    (timestamp_ms / step) * step
}

/// Normalize a symbol string for cache indexing and lookup: uppercase, strip
/// separator characters, and re-append `USDT` if the result doesn't already
/// end with a recognizable quote asset.
///
/// Idempotent: `normalize_symbol(normalize_symbol(s)) == normalize_symbol(s)`.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s: String = raw
        .chars()
        .filter(|c| !matches!(c, '/' | ':' | '_' | ' '))
        .collect::<String>()
        .to_uppercase();

    if !s.ends_with("USDT") && !s.ends_with("USDC") && !s.ends_with("BUSD") && !s.ends_with("BTC")
    {
        s.push_str("USDT");
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_start_is_aligned_and_contains_timestamp() {
        let t = 1_700_000_123_456i64;
        let b = bucket_start("1m", t);
        let step = interval_ms("1m");
        assert_eq!(b % step, 0);
        assert!(b <= t && t < b + step);
    }

    #[test]
    fn normalize_symbol_is_idempotent() {
        for raw in ["btc/usdt", "ETH_USDT", "sol:usdt ", "bnb usdt", "xrp"] {
            let once = normalize_symbol(raw);
            let twice = normalize_symbol(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn normalize_symbol_appends_usdt_when_missing() {
        assert_eq!(normalize_symbol("doge"), "DOGEUSDT");
        assert_eq!(normalize_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn side_orders_are_opposite() {
        assert_eq!(Side::Long.entry_order_side(), "BUY");
        assert_eq!(Side::Long.closing_order_side(), "SELL");
        assert_eq!(Side::Short.entry_order_side(), "SELL");
        assert_eq!(Side::Short.closing_order_side(), "BUY");
    }
}
