// =============================================================================
// Kline ingestion — per-venue WebSocket kline streams feeding a shared buffer
// =============================================================================
//
// The Open-Price Cache's first two resolution tiers (spec §4.3) read off this
// buffer: the exact-bucket open of the in-progress or just-closed candle, and
// the latest closed candle's open as a fallback. Binance and Bybit use
// different connection and framing conventions; both funnel into the same
// `Candle`/`CandleKey` shapes so the rest of the engine is venue-agnostic.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::Venue;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle from a venue's kline stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub venue: Venue,
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.venue, self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (venue, symbol, interval)
// ---------------------------------------------------------------------------

/// Thread-safe ring-buffer that stores the most recent candles per
/// `CandleKey`. The live (unclosed) candle is continuously updated in-place;
/// when a candle closes it becomes permanent and the ring is trimmed to
/// `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key. See the
    /// original single-venue implementation this is generalized from for the
    /// in-progress-replacement rule.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if !last.is_closed && last.open_time == candle.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        while ring.len() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Return the most recent `count` **closed** candles (oldest-first).
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Candle (closed or in-progress) whose `open_time` equals `bucket_start`,
    /// if buffered — the Open-Price Cache's `ws_bucket_open` tier.
    pub fn candle_at_bucket(&self, key: &CandleKey, bucket_start: i64) -> Option<Candle> {
        let map = self.buffers.read();
        map.get(key)?
            .iter()
            .find(|c| c.open_time == bucket_start)
            .cloned()
    }

    /// Most recently buffered candle regardless of open/closed state — the
    /// `ws_latest_candle_open` tier.
    pub fn latest(&self, key: &CandleKey) -> Option<Candle> {
        let map = self.buffers.read();
        map.get(key)?.back().cloned()
    }

    /// Most recent **closed** candle's close price — used to approximate the
    /// current bucket's open (`ws_prev_close` tier) when the previous bucket
    /// immediately precedes the current one.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }

    // -- spec §6 named read operations -------------------------------------

    pub fn get_kline_open(&self, key: &CandleKey, bucket_start: i64) -> Option<f64> {
        self.candle_at_bucket(key, bucket_start).map(|c| c.open)
    }

    pub fn get_kline_close(&self, key: &CandleKey, bucket_start: i64) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)?
            .iter()
            .find(|c| c.open_time == bucket_start)
            .map(|c| c.close)
    }

    pub fn get_latest_candle(&self, key: &CandleKey) -> Option<Candle> {
        self.latest(key)
    }
}

// ---------------------------------------------------------------------------
// Binance kline stream
// ---------------------------------------------------------------------------

async fn run_binance_kline_stream(
    symbol: &str,
    interval: &str,
    buffer: &Arc<CandleBuffer>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@kline_{interval}");
    info!(url = %url, symbol, interval, "connecting to Binance kline WebSocket");

    let (ws_stream, _) = connect_async(&url)
        .await
        .context("failed to connect to Binance kline WebSocket")?;
    info!(symbol, interval, "Binance kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                match parse_binance_kline(&text) {
                    Ok((symbol, interval, candle)) => {
                        let key = CandleKey {
                            venue: Venue::Binance,
                            symbol,
                            interval,
                        };
                        debug!(key = %key, close = candle.close, closed = candle.is_closed, "candle update");
                        buffer.update(key, candle);
                    }
                    Err(e) => warn!(error = %e, "failed to parse Binance kline message"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Binance kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, interval, "Binance kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_binance_kline(text: &str) -> Result<(String, String, Candle)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;
    let data = if root.get("data").is_some() { &root["data"] } else { &root };

    let symbol = data["s"].as_str().context("missing field s")?.to_uppercase();
    let k = &data["k"];
    let interval = k["i"].as_str().context("missing field k.i")?.to_string();
    let open_time = k["t"].as_i64().context("missing field k.t")?;
    let close_time = k["T"].as_i64().context("missing field k.T")?;
    let open = parse_string_f64(&k["o"], "k.o")?;
    let high = parse_string_f64(&k["h"], "k.h")?;
    let low = parse_string_f64(&k["l"], "k.l")?;
    let close = parse_string_f64(&k["c"], "k.c")?;
    let volume = parse_string_f64(&k["v"], "k.v")?;
    let is_closed = k["x"].as_bool().context("missing field k.x")?;

    Ok((
        symbol,
        interval,
        Candle { open_time, close_time, open, high, low, close, volume, is_closed },
    ))
}

// ---------------------------------------------------------------------------
// Bybit kline stream (v5 public, topic-subscription model)
// ---------------------------------------------------------------------------

async fn run_bybit_kline_stream(
    symbol: &str,
    interval: &str,
    buffer: &Arc<CandleBuffer>,
) -> Result<()> {
    let url = "wss://stream.bybit.com/v5/public/linear";
    info!(url, symbol, interval, "connecting to Bybit kline WebSocket");

    let (mut ws_stream, _) = connect_async(url)
        .await
        .context("failed to connect to Bybit kline WebSocket")?;

    let topic = format!("kline.{}.{}", bybit_interval_code(interval), symbol.to_uppercase());
    let subscribe = serde_json::json!({ "op": "subscribe", "args": [topic] }).to_string();
    ws_stream
        .send(Message::Text(subscribe))
        .await
        .context("failed to send Bybit subscribe frame")?;

    info!(symbol, interval, "Bybit kline WebSocket connected and subscribed");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                match parse_bybit_kline(&text) {
                    Ok(Some((symbol, interval, candle))) => {
                        let key = CandleKey { venue: Venue::Bybit, symbol, interval };
                        debug!(key = %key, close = candle.close, closed = candle.is_closed, "candle update");
                        buffer.update(key, candle);
                    }
                    Ok(None) => {} // control frame (subscribe ack, ping, etc.)
                    Err(e) => warn!(error = %e, "failed to parse Bybit kline message"),
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Bybit kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, interval, "Bybit kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Bybit encodes intervals as bare minute counts (except D/W/M).
pub fn bybit_interval_code(interval: &str) -> String {
    match interval {
        "1m" => "1".into(),
        "3m" => "3".into(),
        "5m" => "5".into(),
        "15m" => "15".into(),
        "30m" => "30".into(),
        "1h" => "60".into(),
        "4h" => "240".into(),
        "1d" => "D".into(),
        other => other.into(),
    }
}

fn parse_bybit_kline(text: &str) -> Result<Option<(String, String, Candle)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse Bybit message JSON")?;

    let topic = match root.get("topic").and_then(|v| v.as_str()) {
        Some(t) => t,
        None => return Ok(None),
    };
    let mut parts = topic.splitn(3, '.');
    let _ = parts.next(); // "kline"
    let _interval_code = parts.next().context("malformed Bybit kline topic")?;
    let symbol = parts.next().context("malformed Bybit kline topic")?.to_string();

    let entry = root["data"]
        .as_array()
        .and_then(|arr| arr.first())
        .context("Bybit kline message missing data[0]")?;

    let interval_raw = entry["interval"].as_str().unwrap_or_default();
    let interval = bybit_interval_to_spec(interval_raw);
    let open_time = entry["start"].as_i64().context("missing field start")?;
    let close_time = entry["end"].as_i64().context("missing field end")?;
    let open = parse_string_f64(&entry["open"], "open")?;
    let high = parse_string_f64(&entry["high"], "high")?;
    let low = parse_string_f64(&entry["low"], "low")?;
    let close = parse_string_f64(&entry["close"], "close")?;
    let volume = parse_string_f64(&entry["volume"], "volume")?;
    let is_closed = entry["confirm"].as_bool().unwrap_or(false);

    Ok(Some((
        symbol,
        interval,
        Candle { open_time, close_time, open, high, low, close, volume, is_closed },
    )))
}

fn bybit_interval_to_spec(code: &str) -> String {
    match code {
        "1" => "1m".into(),
        "3" => "3m".into(),
        "5" => "5m".into(),
        "15" => "15m".into(),
        "30" => "30m".into(),
        "60" => "1h".into(),
        "240" => "4h".into(),
        "D" => "1d".into(),
        other => other.into(),
    }
}

fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => {
            n.as_f64().with_context(|| format!("field {name} is not a valid f64"))
        }
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Connect to `venue`'s kline stream for a single (symbol, interval) pair and
/// feed candles into `buffer`. Runs until disconnect or error, then returns
/// so the caller can handle reconnection with backoff.
pub async fn run_kline_stream(
    venue: Venue,
    symbol: &str,
    interval: &str,
    buffer: &Arc<CandleBuffer>,
) -> Result<()> {
    match venue {
        Venue::Binance => run_binance_kline_stream(symbol, interval, buffer).await,
        Venue::Bybit => run_bybit_kline_stream(symbol, interval, buffer).await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed,
        }
    }

    fn make_key(sym: &str, iv: &str) -> CandleKey {
        CandleKey { venue: Venue::Binance, symbol: sym.into(), interval: iv.into() }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let key = make_key("BTCUSDT", "1m");
        for i in 0..5 {
            buf.update(key.clone(), sample_candle(i * 60_000, 100.0 + i as f64, true));
        }
        assert_eq!(buf.count(&key), 3);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        let key = make_key("ETHUSDT", "5m");
        buf.update(key.clone(), sample_candle(0, 50.0, false));
        buf.update(key.clone(), sample_candle(0, 51.0, false));
        assert_eq!(buf.count(&key), 1);
        buf.update(key.clone(), sample_candle(0, 52.0, true));
        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(52.0));
    }

    #[test]
    fn candle_at_bucket_finds_exact_open_time() {
        let buf = CandleBuffer::new(10);
        let key = make_key("BTCUSDT", "1m");
        buf.update(key.clone(), sample_candle(60_000, 101.0, true));
        let found = buf.candle_at_bucket(&key, 60_000).unwrap();
        assert_eq!(found.open, 101.0);
        assert!(buf.candle_at_bucket(&key, 120_000).is_none());
    }

    #[test]
    fn venues_are_distinct_keys() {
        let buf = CandleBuffer::new(10);
        let bin = CandleKey { venue: Venue::Binance, symbol: "BTCUSDT".into(), interval: "1m".into() };
        let byb = CandleKey { venue: Venue::Bybit, symbol: "BTCUSDT".into(), interval: "1m".into() };
        buf.update(bin.clone(), sample_candle(0, 100.0, true));
        assert_eq!(buf.count(&bin), 1);
        assert_eq!(buf.count(&byb), 0);
    }

    #[test]
    fn parse_binance_kline_ok() {
        let json = r#"{
            "stream": "btcusdt@kline_1m",
            "data": { "e": "kline", "s": "BTCUSDT", "k": {
                "t": 1700000000000, "T": 1700000059999, "i": "1m",
                "o": "37000.00", "h": "37050.00", "l": "36990.00", "c": "37020.00",
                "v": "123.456", "x": false
            }}
        }"#;
        let (symbol, interval, candle) = parse_binance_kline(json).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(interval, "1m");
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
        assert!(!candle.is_closed);
    }

    #[test]
    fn parse_bybit_kline_ok() {
        let json = r#"{
            "topic": "kline.1.BTCUSDT",
            "data": [{
                "start": 1700000000000, "end": 1700000059999, "interval": "1",
                "open": "37000.00", "close": "37020.00", "high": "37050.00", "low": "36990.00",
                "volume": "10.5", "confirm": false
            }]
        }"#;
        let (symbol, interval, candle) = parse_bybit_kline(json).unwrap().unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(interval, "1m");
        assert!((candle.close - 37020.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_bybit_non_kline_message_is_ignored() {
        let json = r#"{"success": true, "op": "subscribe"}"#;
        assert!(parse_bybit_kline(json).unwrap().is_none());
    }
}
