// =============================================================================
// Bybit v5 (unified derivatives) client — HMAC-SHA256 signed requests
// =============================================================================
//
// Bybit's v5 signing scheme differs from Binance's: the signature covers
// `timestamp + api_key + recv_window + payload` and travels in request
// headers (`X-BAPI-SIGN`) rather than as a query parameter. Request shaping
// otherwise follows the same `ExchangeClient` contract as Binance.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::market_data::Candle;
use crate::util::Throttle;
use crate::venue::{ExchangeClient, NewOrder, OrderAck, OrderStatus, PositionMode, VenueError};

type HmacSha256 = Hmac<Sha256>;

pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    recv_window_ms: u64,
    min_request_interval: Duration,
    request_gate: Throttle<()>,
}

impl BybitClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        recv_window_ms: u64,
        min_request_interval_ms: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: "https://api.bybit.com".to_string(),
            client,
            recv_window_ms,
            min_request_interval: Duration::from_millis(min_request_interval_ms),
            request_gate: Throttle::new(),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn sign(&self, timestamp: u64, payload: &str) -> String {
        let prehash = format!("{timestamp}{}{}{payload}", self.api_key, self.recv_window_ms);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, payload: &str) -> HeaderMap {
        let ts = Self::timestamp_ms();
        let sign = self.sign(ts, payload);
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-bapi-api-key"),
            HeaderValue::from_str(&self.api_key).unwrap_or(HeaderValue::from_static("")),
        );
        headers.insert(
            HeaderName::from_static("x-bapi-timestamp"),
            HeaderValue::from_str(&ts.to_string()).unwrap(),
        );
        headers.insert(
            HeaderName::from_static("x-bapi-recv-window"),
            HeaderValue::from_str(&self.recv_window_ms.to_string()).unwrap(),
        );
        headers.insert(
            HeaderName::from_static("x-bapi-sign"),
            HeaderValue::from_str(&sign).unwrap_or(HeaderValue::from_static("")),
        );
        headers
    }

    async fn gate(&self) {
        while !self.request_gate.try_pass((), self.min_request_interval) {
            let remaining = self.request_gate.remaining(&(), self.min_request_interval);
            tokio::time::sleep(remaining.max(Duration::from_millis(1))).await;
        }
    }

    fn venue_error_from_body(status: reqwest::StatusCode, body: &serde_json::Value) -> VenueError {
        VenueError {
            http_status: Some(status.as_u16()),
            code: body.get("retCode").and_then(|v| v.as_i64()),
            message: body
                .get("retMsg")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        }
    }

    fn transport_error(e: reqwest::Error) -> VenueError {
        VenueError { http_status: None, code: None, message: e.to_string() }
    }

    fn business_error(body: &serde_json::Value) -> Option<VenueError> {
        let ret_code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(0);
        if ret_code != 0 {
            Some(VenueError {
                http_status: None,
                code: Some(ret_code),
                message: body
                    .get("retMsg")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            None
        }
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    #[instrument(skip(self, order), name = "bybit::place_order")]
    async fn place_order(&self, order: NewOrder<'_>) -> Result<OrderAck, VenueError> {
        self.gate().await;

        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": order.symbol,
            "side": if order.side == "BUY" { "Buy" } else { "Sell" },
            "orderType": if order.order_type == "MARKET" { "Market" } else { "Limit" },
            "qty": order.quantity.to_string(),
            "reduceOnly": order.reduce_only,
            "positionIdx": if order.position_mode == PositionMode::Hedge {
                if order.side == "BUY" { 1 } else { 2 }
            } else {
                0
            },
        });
        if let Some(p) = order.price {
            body["price"] = serde_json::json!(p.to_string());
            body["timeInForce"] = serde_json::json!("GTC");
        }
        if let Some(sp) = order.stop_price {
            body["triggerPrice"] = serde_json::json!(sp.to_string());
        }
        if let Some(coid) = order.client_order_id {
            body["orderLinkId"] = serde_json::json!(coid);
        }

        let payload = body.to_string();
        let headers = self.signed_headers(&payload);
        let url = format!("{}/v5/order/create", self.base_url);

        debug!(symbol = order.symbol, side = order.side, "placing order");
        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = resp.status();
        let parsed: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &parsed));
        }
        if let Some(err) = Self::business_error(&parsed) {
            return Err(err);
        }

        Ok(OrderAck {
            order_id: parsed["result"]["orderId"].as_str().unwrap_or_default().to_string(),
            avg_price: None,
            status: "NEW".to_string(),
        })
    }

    #[instrument(skip(self), name = "bybit::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        self.gate().await;
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": order_id,
        });
        let payload = body.to_string();
        let headers = self.signed_headers(&payload);
        let url = format!("{}/v5/order/cancel", self.base_url);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(Self::transport_error)?;
        let status = resp.status();
        let parsed: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &parsed));
        }
        if let Some(err) = Self::business_error(&parsed) {
            return Err(err);
        }
        Ok(())
    }

    #[instrument(skip(self), name = "bybit::get_order_status")]
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
        self.gate().await;
        let query = format!("category=linear&symbol={symbol}&orderId={order_id}");
        let headers = self.signed_headers(&query);
        let url = format!("{}/v5/order/realtime?{}", self.base_url, query);

        let resp = self.client.get(&url).headers(headers).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let parsed: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &parsed));
        }
        if let Some(err) = Self::business_error(&parsed) {
            return Err(err);
        }

        let raw = parsed["result"]["list"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|o| o["orderStatus"].as_str())
            .unwrap_or("New");

        Ok(match raw {
            "New" | "Untriggered" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled,
            "Cancelled" | "PendingCancel" => OrderStatus::Canceled,
            "Rejected" => OrderStatus::Rejected,
            "Deactivated" => OrderStatus::Expired,
            _ => OrderStatus::New,
        })
    }

    #[instrument(skip(self), name = "bybit::get_account")]
    async fn get_account(&self) -> Result<serde_json::Value, VenueError> {
        self.gate().await;
        let query = "accountType=UNIFIED".to_string();
        let headers = self.signed_headers(&query);
        let url = format!("{}/v5/account/wallet-balance?{}", self.base_url, query);

        let resp = self.client.get(&url).headers(headers).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let parsed: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &parsed));
        }
        if let Some(err) = Self::business_error(&parsed) {
            return Err(err);
        }
        Ok(parsed)
    }

    #[instrument(skip(self), name = "bybit::get_exchange_info")]
    async fn get_exchange_info(&self, symbol: &str) -> Result<serde_json::Value, VenueError> {
        self.gate().await;
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&symbol={}",
            self.base_url, symbol
        );
        let resp = self.client.get(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let parsed: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &parsed));
        }
        if let Some(err) = Self::business_error(&parsed) {
            return Err(err);
        }

        parsed["result"]["list"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .ok_or_else(|| VenueError {
                http_status: None,
                code: None,
                message: format!("symbol {symbol} not found in instruments-info response"),
            })
    }

    #[instrument(skip(self), name = "bybit::get_klines")]
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>, VenueError> {
        self.gate().await;
        let code = crate::market_data::bybit_interval_code(interval);
        let url = format!(
            "{}/v5/market/kline?category=linear&symbol={}&interval={}&limit={}",
            self.base_url, symbol, code, limit
        );
        let resp = self.client.get(&url).send().await.map_err(Self::transport_error)?;
        let status = resp.status();
        let parsed: serde_json::Value = resp.json().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::venue_error_from_body(status, &parsed));
        }
        if let Some(err) = Self::business_error(&parsed) {
            return Err(err);
        }

        let raw = parsed["result"]["list"].as_array().cloned().unwrap_or_default();
        // Bybit returns newest-first: [startTime, open, high, low, close, volume, turnover].
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw.iter().rev() {
            let Some(arr) = entry.as_array() else { continue };
            if arr.len() < 6 {
                continue;
            }
            let parse = |v: &serde_json::Value| -> f64 {
                v.as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0)
            };
            let open_time: i64 = arr[0].as_str().and_then(|s| s.parse().ok()).unwrap_or(0);
            candles.push(Candle {
                open_time,
                close_time: open_time,
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

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
