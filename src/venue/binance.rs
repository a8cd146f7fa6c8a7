// =============================================================================
// Binance Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed
// requests carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to
// tolerate minor clock drift against the venue.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::market_data::Candle;
use crate::types::Direction;
use crate::venue::{OrderAck, Venue, VenuePosition};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Signed futures REST client implementing the [`Venue`] trait.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    /// Create a new client. Public (unsigned) endpoints work with empty
    /// keys, which is all paper mode needs.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesClient initialised (base_url=https://fapi.binance.com)");

        Self {
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
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

    /// Full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<serde_json::Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("{method} {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value> {
        let query = self.signed_query(params);
        self.request(method, path, &query).await
    }

    /// Parse a JSON value that may be either a string or a number into f64.
    fn parse_f64(val: &serde_json::Value) -> f64 {
        match val {
            serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    fn side_str(direction: Direction) -> &'static str {
        match direction {
            Direction::Long => "BUY",
            Direction::Short => "SELL",
        }
    }

    fn ack_from(body: &serde_json::Value) -> OrderAck {
        OrderAck {
            order_id: body["orderId"]
                .as_u64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            avg_price: Self::parse_f64(&body["avgPrice"]),
            filled_qty: Self::parse_f64(&body["executedQty"]),
            status: body["status"].as_str().unwrap_or("").to_string(),
        }
    }
}

#[async_trait]
impl Venue for BinanceFuturesClient {
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/ticker/price",
                &format!("symbol={symbol}"),
            )
            .await?;
        let price = Self::parse_f64(&body["price"]);
        if price <= 0.0 {
            anyhow::bail!("non-positive price for {symbol}: {body}");
        }
        Ok(price)
    }

    /// GET /fapi/v1/klines (public). Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            candles.push(Candle::new(
                arr[0].as_i64().unwrap_or(0),
                Self::parse_f64(&arr[1]),
                Self::parse_f64(&arr[2]),
                Self::parse_f64(&arr[3]),
                Self::parse_f64(&arr[4]),
                Self::parse_f64(&arr[5]),
                arr[6].as_i64().unwrap_or(0),
            ));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    async fn get_balance(&self) -> Result<f64> {
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v2/balance", "")
            .await?;
        let entries = body.as_array().context("balance response is not an array")?;
        for entry in entries {
            if entry["asset"].as_str() == Some("USDT") {
                let free = Self::parse_f64(&entry["availableBalance"]);
                debug!(free, "balance retrieved");
                return Ok(free);
            }
        }
        warn!("USDT not found in balances — returning 0.0");
        Ok(0.0)
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        let body = self
            .signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;
        let entries = body
            .as_array()
            .context("positionRisk response is not an array")?;

        let mut positions = Vec::new();
        for entry in entries {
            let qty = Self::parse_f64(&entry["positionAmt"]);
            if qty == 0.0 {
                continue;
            }
            positions.push(VenuePosition {
                symbol: entry["symbol"].as_str().unwrap_or("").to_string(),
                direction: if qty > 0.0 { Direction::Long } else { Direction::Short },
                quantity: qty.abs(),
                entry_price: Self::parse_f64(&entry["entryPrice"]),
                unrealized_pnl: Self::parse_f64(&entry["unRealizedProfit"]),
            });
        }
        debug!(count = positions.len(), "venue positions retrieved");
        Ok(positions)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={quantity}&newOrderRespType=RESULT",
            Self::side_str(direction)
        );
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        debug!(symbol, side = Self::side_str(direction), quantity, reduce_only, "placing market order");
        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(Self::ack_from(&body))
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck> {
        let params = format!(
            "symbol={symbol}&side={}&type=LIMIT&quantity={quantity}&price={price}&timeInForce=GTC",
            Self::side_str(direction)
        );
        debug!(symbol, side = Self::side_str(direction), quantity, price, "placing limit order");
        let body = self
            .signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        Ok(Self::ack_from(&body))
    }

    async fn place_tpsl(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        take_profit: f64,
        stop_loss: f64,
    ) -> Result<()> {
        // Exit orders sit on the opposite side, reduce-only.
        let exit_side = Self::side_str(direction.opposite());

        let tp_params = format!(
            "symbol={symbol}&side={exit_side}&type=TAKE_PROFIT_MARKET&stopPrice={take_profit}\
             &quantity={quantity}&reduceOnly=true"
        );
        self.signed(reqwest::Method::POST, "/fapi/v1/order", &tp_params)
            .await
            .context("failed to place take-profit trigger")?;

        let sl_params = format!(
            "symbol={symbol}&side={exit_side}&type=STOP_MARKET&stopPrice={stop_loss}\
             &quantity={quantity}&reduceOnly=true"
        );
        self.signed(reqwest::Method::POST, "/fapi/v1/order", &sl_params)
            .await
            .context("failed to place stop-loss trigger")?;

        debug!(symbol, take_profit, stop_loss, "TP/SL triggers attached");
        Ok(())
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(())
    }

    async fn bulk_cancel(&self, symbol: &str) -> Result<u32> {
        let params = format!("symbol={symbol}");
        self.signed(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        debug!(symbol, "all open orders cancelled");
        Ok(0)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        self.signed(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<f64> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/fapi/v1/premiumIndex",
                &format!("symbol={symbol}"),
            )
            .await?;
        Ok(Self::parse_f64(&body["lastFundingRate"]))
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceFuturesClient::new("key", "secret");
        let sig = client.sign("symbol=BTCUSDT&timestamp=1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        // Same input, same signature.
        assert_eq!(sig, client.sign("symbol=BTCUSDT&timestamp=1700000000000"));
        // Different input, different signature.
        assert_ne!(sig, client.sign("symbol=ETHUSDT&timestamp=1700000000000"));
    }

    #[test]
    fn signed_query_shape() {
        let client = BinanceFuturesClient::new("key", "secret");
        let query = client.signed_query("symbol=BTCUSDT");
        assert!(query.starts_with("symbol=BTCUSDT&timestamp="));
        assert!(query.contains("&recvWindow=5000&signature="));
    }

    #[test]
    fn side_mapping() {
        assert_eq!(BinanceFuturesClient::side_str(Direction::Long), "BUY");
        assert_eq!(BinanceFuturesClient::side_str(Direction::Short), "SELL");
    }

    #[test]
    fn ack_parses_mixed_types() {
        let body = serde_json::json!({
            "orderId": 123456u64,
            "avgPrice": "30000.50",
            "executedQty": "0.5",
            "status": "FILLED"
        });
        let ack = BinanceFuturesClient::ack_from(&body);
        assert_eq!(ack.order_id, "123456");
        assert!((ack.avg_price - 30000.5).abs() < 1e-9);
        assert!((ack.filled_qty - 0.5).abs() < 1e-9);
        assert!(ack.is_filled());
    }

    #[test]
    fn unfilled_ack() {
        let body = serde_json::json!({
            "orderId": 1u64,
            "avgPrice": "0",
            "executedQty": "0",
            "status": "NEW"
        });
        assert!(!BinanceFuturesClient::ack_from(&body).is_filled());
    }
}
