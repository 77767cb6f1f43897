// =============================================================================
// Runtime Configuration — every tunable named in the spec, hot-reloadable
// =============================================================================
//
// Central configuration hub. Every interval, threshold, and batch size the
// engine uses lives here as a typed field — no untyped global getters.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default = "...")]` so that adding new
// fields never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::TradingMode;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_min_tick_interval_ms() -> u64 {
    75
}
fn default_batch_size() -> usize {
    200
}
fn default_batch_timeout_ms() -> u64 {
    50
}
fn default_tick_concurrency() -> usize {
    8
}
fn default_tick_queue_capacity() -> usize {
    20_000
}
fn default_noise_threshold_pct() -> f64 {
    0.01
}

fn default_open_cache_max_entries() -> usize {
    1000
}
fn default_open_cache_ttl_minutes() -> u64 {
    15
}
fn default_open_memo_ms() -> u64 {
    1000
}
fn default_rest_fallback_enabled() -> bool {
    false
}
fn default_rest_fallback_max_concurrent() -> usize {
    4
}
fn default_rest_fallback_breaker_window_secs() -> u64 {
    60
}
fn default_open_prime_tolerance_ms() -> u64 {
    500
}

fn default_extend_max_diff_ratio() -> f64 {
    0.5
}
fn default_passive_limit_on_extend_miss() -> bool {
    true
}

fn default_position_open_cache_ttl_secs() -> u64 {
    5
}
fn default_failure_cooldown_secs() -> u64 {
    60
}
fn default_tp_sl_placement_delay_ms() -> u64 {
    1000
}
fn default_order_retry_max() -> u32 {
    3
}
fn default_order_retry_base_ms() -> u64 {
    1000
}

fn default_strategy_cache_refresh_secs() -> u64 {
    60
}
fn default_symbol_filter_refresh_secs() -> u64 {
    300
}

fn default_alert_rearm_ratio() -> f64 {
    0.6
}

fn default_rest_timeout_secs() -> u64 {
    15
}
fn default_min_request_interval_ms() -> u64 {
    100
}
fn default_recv_window_ms() -> u64 {
    10_000
}

fn default_shutdown_drain_deadline_secs() -> u64 {
    10
}
fn default_refresh_watchdog_timeout_secs() -> u64 {
    300
}

// =============================================================================
// Telegram dispatcher configuration
// =============================================================================

fn default_telegram_min_gap_global_ms() -> u64 {
    1000
}
fn default_telegram_per_chat_min_gap_ms() -> u64 {
    3000
}
fn default_telegram_queue_max_idle_ms() -> u64 {
    30 * 60 * 1000
}
fn default_telegram_chat_max_idle_ms() -> u64 {
    6 * 60 * 60 * 1000
}
fn default_telegram_backoff_safety_buffer_ms() -> u64 {
    5000
}
fn default_telegram_consecutive_429_cap() -> u32 {
    5
}
fn default_telegram_send_timeout_secs() -> u64 {
    10
}
fn default_telegram_transient_backoff_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_min_gap_global_ms")]
    pub min_gap_global_ms: u64,
    #[serde(default = "default_telegram_per_chat_min_gap_ms")]
    pub per_chat_min_gap_ms: u64,
    #[serde(default = "default_telegram_queue_max_idle_ms")]
    pub queue_max_idle_ms: u64,
    #[serde(default = "default_telegram_chat_max_idle_ms")]
    pub chat_max_idle_ms: u64,
    #[serde(default = "default_telegram_backoff_safety_buffer_ms")]
    pub backoff_safety_buffer_ms: u64,
    #[serde(default = "default_telegram_consecutive_429_cap")]
    pub consecutive_429_cap: u32,
    #[serde(default = "default_telegram_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_telegram_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            min_gap_global_ms: default_telegram_min_gap_global_ms(),
            per_chat_min_gap_ms: default_telegram_per_chat_min_gap_ms(),
            queue_max_idle_ms: default_telegram_queue_max_idle_ms(),
            chat_max_idle_ms: default_telegram_chat_max_idle_ms(),
            backoff_safety_buffer_ms: default_telegram_backoff_safety_buffer_ms(),
            consecutive_429_cap: default_telegram_consecutive_429_cap(),
            send_timeout_secs: default_telegram_send_timeout_secs(),
            transient_backoff_ms: default_telegram_transient_backoff_ms(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Aurora signal-to-order engine.
///
/// Every field has a serde default so that older JSON config files missing
/// new fields will still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Symbols the engine is watching across both venues.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    // --- Tick Consumer -------------------------------------------------
    #[serde(default = "default_min_tick_interval_ms")]
    pub min_tick_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_tick_concurrency")]
    pub tick_concurrency: usize,
    #[serde(default = "default_tick_queue_capacity")]
    pub tick_queue_capacity: usize,
    #[serde(default = "default_noise_threshold_pct")]
    pub noise_threshold_pct: f64,

    // --- Open-Price Cache ------------------------------------------------
    #[serde(default = "default_open_cache_max_entries")]
    pub open_cache_max_entries: usize,
    #[serde(default = "default_open_cache_ttl_minutes")]
    pub open_cache_ttl_minutes: u64,
    #[serde(default = "default_open_memo_ms")]
    pub open_memo_ms: u64,
    #[serde(default = "default_rest_fallback_enabled")]
    pub rest_fallback_enabled: bool,
    #[serde(default = "default_rest_fallback_max_concurrent")]
    pub rest_fallback_max_concurrent: usize,
    #[serde(default = "default_rest_fallback_breaker_window_secs")]
    pub rest_fallback_breaker_window_secs: u64,
    #[serde(default = "default_open_prime_tolerance_ms")]
    pub open_prime_tolerance_ms: u64,

    // --- Entry pricing ---------------------------------------------------
    #[serde(default = "default_extend_max_diff_ratio")]
    pub extend_max_diff_ratio: f64,
    #[serde(default = "default_passive_limit_on_extend_miss")]
    pub passive_limit_on_extend_miss: bool,

    // --- Order Service -----------------------------------------------------
    #[serde(default = "default_position_open_cache_ttl_secs")]
    pub position_open_cache_ttl_secs: u64,
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,
    #[serde(default = "default_tp_sl_placement_delay_ms")]
    pub tp_sl_placement_delay_ms: u64,
    #[serde(default = "default_order_retry_max")]
    pub order_retry_max: u32,
    #[serde(default = "default_order_retry_base_ms")]
    pub order_retry_base_ms: u64,

    // --- Cache refresh -----------------------------------------------------
    #[serde(default = "default_strategy_cache_refresh_secs")]
    pub strategy_cache_refresh_secs: u64,
    #[serde(default = "default_symbol_filter_refresh_secs")]
    pub symbol_filter_refresh_secs: u64,

    // --- Alerts --------------------------------------------------------------
    #[serde(default = "default_alert_rearm_ratio")]
    pub alert_rearm_ratio: f64,

    // --- Exchange REST ---------------------------------------------------
    #[serde(default = "default_rest_timeout_secs")]
    pub rest_timeout_secs: u64,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,

    // --- Lifecycle -----------------------------------------------------------
    #[serde(default = "default_shutdown_drain_deadline_secs")]
    pub shutdown_drain_deadline_secs: u64,
    #[serde(default = "default_refresh_watchdog_timeout_secs")]
    pub refresh_watchdog_timeout_secs: u64,

    // --- Telegram --------------------------------------------------------
    #[serde(default)]
    pub telegram: TelegramConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            symbols: default_symbols(),
            min_tick_interval_ms: default_min_tick_interval_ms(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            tick_concurrency: default_tick_concurrency(),
            tick_queue_capacity: default_tick_queue_capacity(),
            noise_threshold_pct: default_noise_threshold_pct(),
            open_cache_max_entries: default_open_cache_max_entries(),
            open_cache_ttl_minutes: default_open_cache_ttl_minutes(),
            open_memo_ms: default_open_memo_ms(),
            rest_fallback_enabled: default_rest_fallback_enabled(),
            rest_fallback_max_concurrent: default_rest_fallback_max_concurrent(),
            rest_fallback_breaker_window_secs: default_rest_fallback_breaker_window_secs(),
            open_prime_tolerance_ms: default_open_prime_tolerance_ms(),
            extend_max_diff_ratio: default_extend_max_diff_ratio(),
            passive_limit_on_extend_miss: default_passive_limit_on_extend_miss(),
            position_open_cache_ttl_secs: default_position_open_cache_ttl_secs(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            tp_sl_placement_delay_ms: default_tp_sl_placement_delay_ms(),
            order_retry_max: default_order_retry_max(),
            order_retry_base_ms: default_order_retry_base_ms(),
            strategy_cache_refresh_secs: default_strategy_cache_refresh_secs(),
            symbol_filter_refresh_secs: default_symbol_filter_refresh_secs(),
            alert_rearm_ratio: default_alert_rearm_ratio(),
            rest_timeout_secs: default_rest_timeout_secs(),
            min_request_interval_ms: default_min_request_interval_ms(),
            recv_window_ms: default_recv_window_ms(),
            shutdown_drain_deadline_secs: default_shutdown_drain_deadline_secs(),
            refresh_watchdog_timeout_secs: default_refresh_watchdog_timeout_secs(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.batch_timeout_ms, 50);
        assert!((cfg.noise_threshold_pct - 0.01).abs() < f64::EPSILON);
        assert!((cfg.extend_max_diff_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.failure_cooldown_secs, 60);
        assert_eq!(cfg.telegram.min_gap_global_ms, 1000);
        assert_eq!(cfg.telegram.per_chat_min_gap_ms, 3000);
        assert!(!cfg.rest_fallback_enabled);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.batch_size, 200);
        assert_eq!(cfg.telegram.consecutive_429_cap, 5);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.failure_cooldown_secs, 60);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.batch_size, cfg2.batch_size);
    }
}
