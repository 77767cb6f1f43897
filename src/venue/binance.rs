// =============================================================================
// Binance USDT-M Futures client — HMAC-SHA256 signed requests
// =============================================================================
//
// Adapted from the spot client this engine's teacher shipped: same signing
// scheme (HMAC-SHA256 over the sorted query string plus timestamp and
// recvWindow), same "never log the secret" discipline, retargeted at the
// `/fapi` derivatives endpoints and the `ExchangeClient` trait so the Order
// Service can address Binance and Bybit uniformly.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::util::Throttle;
use crate::venue::{ExchangeClient, NewOrder, OrderAck, OrderStatus, PositionMode, VenueError};

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
    recv_window_ms: u64,
    min_request_interval: Duration,
    request_gate: Throttle<()>,
}

impl BinanceClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        recv_window_ms: u64,
        min_request_interval_ms: u64,
    ) -> Self {
        let api_key = api_key.into();
        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: secret.into(),
            base_url: "https://fapi.binance.com".to_string(),
            client,
            recv_window_ms,
            min_request_interval: Duration::from_millis(min_request_interval_ms),
            request_gate: Throttle::new(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let recv = self.recv_window_ms;
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={recv}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={recv}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Block until the minimum inter-request interval has elapsed (spec §6:
    /// "minimum-interval rate-limiting enforced before each call").
    async fn gate(&self) {
        while !self.request_gate.try_pass((), self.min_request_interval) {
            let remaining = self.request_gate.remaining(&(), self.min_request_interval);
            tokio::time::sleep(remaining.max(Duration::from_millis(1))).await;
        }
    }

    fn venue_error_from_body(status: reqwest::StatusCode, body: &serde_json::Value) -> VenueError {
        VenueError {
            http_status: Some(status.as_u16()),
            code: body.get("code").and_then(|v| v.as_i64()),
            message: body
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        }
    }

    fn transport_error(e: reqwest::Error) -> VenueError {
        VenueError { http_status: None, code: None, message: e.to_string() }
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    #[instrument(skip(self, order), name = "binance::place_order")]
    async fn place_order(&self, order: NewOrder<'_>) -> Result<OrderAck, VenueError> {
        self.gate().await;

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            order.symbol, order.side, order.order_type, order.quantity
        );
        if let Some(p) = order.price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(sp) = order.stop_price {
            params.push_str(&format!("&stopPrice={sp}"));
        }
        if order.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if order.position_mode == PositionMode::Hedge {
            let side = if order.side == "BUY" { "LONG" } else { "SHORT" };
            params.push_str(&format!("&positionSide={side}"));
        } else {
            params.push_str("&positionSide=BOTH");
        }
        if let Some(coid) = order.client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol = order.symbol, side = order.side, "placing order");
        let resp = self.client.post(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;

        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &body));
        }

        Ok(OrderAck {
            order_id: body["orderId"].to_string(),
            avg_price: body["avgPrice"].as_str().and_then(|s| s.parse().ok()).filter(|v| *v > 0.0),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
        })
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        self.gate().await;
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self.client.delete(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &body));
        }
        Ok(())
    }

    #[instrument(skip(self), name = "binance::get_order_status")]
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
        self.gate().await;
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &body));
        }

        let raw = body["status"].as_str().unwrap_or("NEW");
        Ok(match raw {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            other => {
                warn!(status = other, "unrecognized Binance order status");
                OrderStatus::New
            }
        })
    }

    #[instrument(skip(self), name = "binance::get_account")]
    async fn get_account(&self) -> Result<serde_json::Value, VenueError> {
        self.gate().await;
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/account?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &body));
        }
        Ok(body)
    }

    #[instrument(skip(self), name = "binance::get_exchange_info")]
    async fn get_exchange_info(&self, symbol: &str) -> Result<serde_json::Value, VenueError> {
        self.gate().await;
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);

        let resp = self.client.get(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &body));
        }

        body["symbols"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .ok_or_else(|| VenueError {
                http_status: None,
                code: None,
                message: format!("symbol {symbol} not found in exchangeInfo response"),
            })
    }

    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, VenueError> {
        self.gate().await;
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self.client.get(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &body));
        }

        let raw = body.as_array().ok_or_else(|| VenueError {
            http_status: None,
            code: None,
            message: "klines response is not an array".to_string(),
        })?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else { continue };
            if arr.len() < 7 {
                continue;
            }
            let parse = |v: &serde_json::Value| -> f64 {
                v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()).unwrap_or(0.0)
            };
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                close_time: arr[6].as_i64().unwrap_or(0),
                open: parse(&arr[1]),
                high: parse(&arr[2]),
                low: parse(&arr[3]),
                close: parse(&arr[4]),
                volume: parse(&arr[5]),
                is_closed: true,
            });
        }
        Ok(candles)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
