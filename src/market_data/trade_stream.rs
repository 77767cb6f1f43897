// =============================================================================
// Price-Tick Ingress — per-venue WebSocket trade streams feeding the Tick Consumer
// =============================================================================
//
// Each venue gets one long-lived reader task per subscribed symbol. Every
// trade is turned into a `Tick` and pushed onto a bounded channel; the Tick
// Consumer (src/tick_consumer.rs) owns the receiving end. A full channel
// means the consumer is behind — the sender drops the tick rather than
// blocking the WebSocket read loop, so ingestion never backs up into the
// network layer (spec §4.4 backpressure: freshness over completeness).
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::Venue;

/// A single normalized price observation from a venue.
#[derive(Debug, Clone)]
pub struct TickEvent {
    pub venue: Venue,
    pub symbol: String,
    pub price: f64,
    pub timestamp_ms: i64,
}

async fn run_binance_trade_stream(symbol: &str, tx: &mpsc::Sender<TickEvent>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("wss://fstream.binance.com/ws/{lower}@aggTrade");
    info!(url = %url, symbol, "connecting to Binance trade WebSocket");

    let (ws_stream, _) = connect_async(&url)
        .await
        .context("failed to connect to Binance trade WebSocket")?;
    info!(symbol, "Binance trade WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_binance_agg_trade(&text) {
                Ok((symbol, price, timestamp_ms)) => {
                    let event = TickEvent { venue: Venue::Binance, symbol, price, timestamp_ms };
                    if tx.try_send(event).is_err() {
                        debug!("tick channel full — dropping Binance tick");
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse Binance aggTrade message"),
            },
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol, error = %e, "Binance trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "Binance trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_binance_agg_trade(text: &str) -> Result<(String, f64, i64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    let symbol = root["s"].as_str().context("missing field s")?.to_uppercase();
    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;
    let timestamp_ms = root["T"].as_i64().context("missing field T")?;
    Ok((symbol, price, timestamp_ms))
}

async fn run_bybit_trade_stream(symbol: &str, tx: &mpsc::Sender<TickEvent>) -> Result<()> {
    use futures_util::SinkExt;

    let url = "wss://stream.bybit.com/v5/public/linear";
    info!(url, symbol, "connecting to Bybit trade WebSocket");

    let (mut ws_stream, _) = connect_async(url)
        .await
        .context("failed to connect to Bybit trade WebSocket")?;

    let topic = format!("publicTrade.{}", symbol.to_uppercase());
    let subscribe = serde_json::json!({ "op": "subscribe", "args": [topic] }).to_string();
    ws_stream
        .send(Message::Text(subscribe))
        .await
        .context("failed to send Bybit subscribe frame")?;

    info!(symbol, "Bybit trade WebSocket connected and subscribed");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                for (symbol, price, timestamp_ms) in parse_bybit_trades(&text)? {
                    let event = TickEvent { venue: Venue::Bybit, symbol, price, timestamp_ms };
                    if tx.try_send(event).is_err() {
                        debug!("tick channel full — dropping Bybit tick");
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(symbol, error = %e, "Bybit trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "Bybit trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn parse_bybit_trades(text: &str) -> Result<Vec<(String, f64, i64)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse Bybit trade JSON")?;
    let Some(entries) = root["data"].as_array() else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let symbol = entry["s"].as_str().unwrap_or_default().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        let price: f64 = entry["p"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let timestamp_ms = entry["T"].as_i64().unwrap_or(0);
        out.push((symbol, price, timestamp_ms));
    }
    Ok(out)
}

/// Connect to `venue`'s trade stream for a single symbol and push normalized
/// ticks onto `tx`. Runs until disconnect or error, then returns so the
/// caller can reconnect with backoff.
pub async fn run_trade_stream(
    venue: Venue,
    symbol: &str,
    tx: &mpsc::Sender<TickEvent>,
) -> Result<()> {
    match venue {
        Venue::Binance => run_binance_trade_stream(symbol, tx).await,
        Venue::Bybit => run_bybit_trade_stream(symbol, tx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_binance_agg_trade_ok() {
        let json = r#"{"e":"aggTrade","s":"BTCUSDT","p":"37000.50","q":"0.01","T":1700000000123,"m":true}"#;
        let (symbol, price, ts) = parse_binance_agg_trade(json).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert!((price - 37000.50).abs() < f64::EPSILON);
        assert_eq!(ts, 1700000000123);
    }

    #[test]
    fn parse_bybit_trades_ok() {
        let json = r#"{"topic":"publicTrade.BTCUSDT","data":[{"s":"BTCUSDT","p":"37000.5","T":1700000000123}]}"#;
        let trades = parse_bybit_trades(json).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].0, "BTCUSDT");
    }

    #[test]
    fn parse_bybit_trades_empty_data_is_ok() {
        let json = r#"{"success":true}"#;
        assert!(parse_bybit_trades(json).unwrap().is_empty());
    }
}
