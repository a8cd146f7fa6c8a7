// =============================================================================
// Derivatives Data Client — funding / OI / positioning / liquidations
// =============================================================================
//
// Polls the venue's public futures-data endpoints to build the per-coin
// metrics the regime classifier consumes. Liquidation totals cannot be
// fetched in bulk, so they are accumulated from the force-order WS stream
// into a rolling 24h window.
//
// Rate limiting: a 429 from any endpoint puts the client into backoff for
// the remainder of the current minute window; during backoff `scan_market`
// serves the cached snapshot.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::regime::classifier::{CoinMetrics, MarketSnapshot};
use crate::types::{bare_symbol, Direction};

const BASE_URL: &str = "https://fapi.binance.com";
const LIQ_WINDOW_SECS: i64 = 24 * 3600;

/// End of the minute window containing `now` (epoch seconds).
fn minute_window_end(now: i64) -> i64 {
    now - now.rem_euclid(60) + 60
}

/// Percentage change between the close `bars_back` bars ago and the last.
fn pct_change(closes: &[f64], bars_back: usize) -> f64 {
    if closes.len() <= bars_back {
        return 0.0;
    }
    let last = closes[closes.len() - 1];
    let past = closes[closes.len() - 1 - bars_back];
    if past == 0.0 {
        return 0.0;
    }
    (last - past) / past * 100.0
}

/// Fetches and aggregates derivatives metrics for the trading universe.
pub struct DerivativesClient {
    client: reqwest::Client,
    base_url: String,
    /// Epoch seconds until which all requests are suppressed.
    backoff_until: AtomicI64,
    cache: RwLock<Option<MarketSnapshot>>,
    /// Rolling liquidation events per bare symbol: (epoch secs, long USD,
    /// short USD).
    liq_events: RwLock<HashMap<String, VecDeque<(i64, f64, f64)>>>,
}

impl DerivativesClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for DerivativesClient"),
            base_url: BASE_URL.to_string(),
            backoff_until: AtomicI64::new(0),
            cache: RwLock::new(None),
            liq_events: RwLock::new(HashMap::new()),
        }
    }

    /// Latest snapshot without refetching.
    pub fn cached_snapshot(&self) -> Option<MarketSnapshot> {
        self.cache.read().clone()
    }

    /// Whether the client is currently backing off after a 429.
    pub fn in_backoff(&self, now: i64) -> bool {
        self.backoff_until.load(Ordering::Relaxed) > now
    }

    // -------------------------------------------------------------------------
    // Market scan
    // -------------------------------------------------------------------------

    /// Build a fresh snapshot for `symbols`. During rate-limit backoff the
    /// cached snapshot is returned unchanged; individual symbol failures
    /// are logged and skipped.
    pub async fn scan_market(&self, symbols: &[String]) -> MarketSnapshot {
        let now = chrono::Utc::now().timestamp();

        if self.in_backoff(now) {
            debug!("derivatives client in backoff — serving cached snapshot");
            return self.cached_snapshot().unwrap_or_default();
        }

        let mut snapshot = MarketSnapshot {
            scan_time: now,
            ..Default::default()
        };

        for symbol in symbols {
            match self.fetch_coin_metrics(symbol, now).await {
                Ok(metrics) => {
                    snapshot.coins.insert(bare_symbol(symbol), metrics);
                }
                Err(e) => {
                    if e.to_string().contains("429") {
                        let until = minute_window_end(now);
                        self.backoff_until.store(until, Ordering::Relaxed);
                        warn!(
                            until,
                            "rate limited — backing off for the current minute window"
                        );
                        return self.cached_snapshot().unwrap_or(snapshot);
                    }
                    warn!(symbol = %symbol, error = %e, "derivatives fetch failed — skipping symbol");
                }
            }
        }

        if !snapshot.coins.is_empty() {
            *self.cache.write() = Some(snapshot.clone());
        }
        info!(coins = snapshot.coins.len(), "derivatives scan complete");
        snapshot
    }

    async fn fetch_coin_metrics(&self, symbol: &str, now: i64) -> Result<CoinMetrics> {
        let bare = bare_symbol(symbol);
        let mut metrics = CoinMetrics {
            symbol: bare.clone(),
            long_ratio: 0.5,
            short_ratio: 0.5,
            taker_buy_ratio: 0.5,
            ..Default::default()
        };

        // Funding + mark price.
        let premium = self
            .get_json(&format!("/fapi/v1/premiumIndex?symbol={symbol}"))
            .await?;
        metrics.funding_rate = json_f64(&premium["lastFundingRate"]);
        metrics.price = json_f64(&premium["markPrice"]);

        // Price changes from hourly closes.
        let klines = self
            .get_json(&format!("/fapi/v1/klines?symbol={symbol}&interval=1h&limit=25"))
            .await?;
        if let Some(rows) = klines.as_array() {
            let closes: Vec<f64> = rows
                .iter()
                .filter_map(|row| row.as_array())
                .filter_map(|row| row.get(4))
                .map(json_f64)
                .collect();
            metrics.price_change_1h = pct_change(&closes, 1);
            metrics.price_change_4h = pct_change(&closes, 4);
            metrics.price_change_24h = pct_change(&closes, 24);
        }

        // 24h volume.
        let ticker = self
            .get_json(&format!("/fapi/v1/ticker/24hr?symbol={symbol}"))
            .await?;
        metrics.volume_24h = json_f64(&ticker["quoteVolume"]);

        // Open interest history (1h buckets).
        let oi = self
            .get_json(&format!(
                "/futures/data/openInterestHist?symbol={symbol}&period=1h&limit=25"
            ))
            .await?;
        if let Some(rows) = oi.as_array() {
            let values: Vec<f64> = rows
                .iter()
                .map(|row| json_f64(&row["sumOpenInterestValue"]))
                .collect();
            if let Some(last) = values.last() {
                metrics.oi_usd = *last;
            }
            metrics.oi_change_1h = pct_change(&values, 1);
            metrics.oi_change_4h = pct_change(&values, 4);
            metrics.oi_change_24h = pct_change(&values, 24);
        }

        // Global long/short account ratio.
        let ls = self
            .get_json(&format!(
                "/futures/data/globalLongShortAccountRatio?symbol={symbol}&period=1h&limit=1"
            ))
            .await?;
        if let Some(row) = ls.as_array().and_then(|a| a.last()) {
            let long = json_f64(&row["longAccount"]);
            if long > 0.0 {
                metrics.long_ratio = long;
                metrics.short_ratio = 1.0 - long;
            }
        }

        // Taker buy/sell ratio.
        let taker = self
            .get_json(&format!(
                "/futures/data/takerlongshortRatio?symbol={symbol}&period=1h&limit=1"
            ))
            .await?;
        if let Some(row) = taker.as_array().and_then(|a| a.last()) {
            let ratio = json_f64(&row["buySellRatio"]);
            if ratio > 0.0 {
                metrics.taker_buy_ratio = ratio / (1.0 + ratio);
            }
        }

        // Liquidations from the rolling accumulator.
        let (liq_long, liq_short) = self.liq_totals(&bare, now);
        metrics.liq_long_24h = liq_long;
        metrics.liq_short_24h = liq_short;

        Ok(metrics)
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            anyhow::bail!("429 rate limited on {path}");
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;
        if !status.is_success() {
            anyhow::bail!("{path} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Liquidation accumulator
    // -------------------------------------------------------------------------

    /// Record a liquidation event. `liquidated_side` is the side that got
    /// liquidated (a forced SELL closes a long).
    pub fn record_liquidation(
        &self,
        symbol: &str,
        liquidated_side: Direction,
        notional_usd: f64,
        at_secs: i64,
    ) {
        let bare = bare_symbol(symbol);
        let mut map = self.liq_events.write();
        let ring = map.entry(bare).or_default();
        let (long_usd, short_usd) = match liquidated_side {
            Direction::Long => (notional_usd, 0.0),
            Direction::Short => (0.0, notional_usd),
        };
        ring.push_back((at_secs, long_usd, short_usd));
    }

    /// Rolling 24h liquidation totals (long USD, short USD) for a symbol.
    /// Prunes expired events as a side effect.
    pub fn liq_totals(&self, bare: &str, now: i64) -> (f64, f64) {
        let mut map = self.liq_events.write();
        let Some(ring) = map.get_mut(bare) else {
            return (0.0, 0.0);
        };
        while ring
            .front()
            .map(|(ts, _, _)| now - ts > LIQ_WINDOW_SECS)
            .unwrap_or(false)
        {
            ring.pop_front();
        }
        ring.iter().fold((0.0, 0.0), |(l, s), (_, el, es)| (l + el, s + es))
    }
}

impl Default for DerivativesClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DerivativesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivativesClient")
            .field("base_url", &self.base_url)
            .field("backoff_until", &self.backoff_until.load(Ordering::Relaxed))
            .finish()
    }
}

/// Parse a JSON value that may be a string or a number into f64.
fn json_f64(val: &serde_json::Value) -> f64 {
    match val {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Force-order WebSocket stream
// ---------------------------------------------------------------------------

/// Parse one force-order event into (symbol, liquidated side, notional USD,
/// epoch secs). A forced SELL closes a long position.
fn parse_force_order(text: &str) -> Result<(String, Direction, f64, i64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse force-order JSON")?;
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };
    let order = &data["o"];

    let symbol = order["s"]
        .as_str()
        .context("missing field o.s")?
        .to_uppercase();
    let side = order["S"].as_str().context("missing field o.S")?;
    let qty = json_f64(&order["q"]);
    let price = json_f64(&order["ap"]).max(json_f64(&order["p"]));
    let at_secs = data["E"].as_i64().unwrap_or(0) / 1000;

    let liquidated = if side == "SELL" {
        Direction::Long
    } else {
        Direction::Short
    };
    Ok((symbol, liquidated, qty * price, at_secs))
}

/// Consume the all-market force-order stream and feed the accumulator.
/// Returns on disconnect so the caller can reconnect with a delay.
pub async fn run_liquidation_stream(client: &DerivativesClient) -> Result<()> {
    let url = "wss://fstream.binance.com/ws/!forceOrder@arr";
    info!(url, "connecting to force-order WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to force-order WebSocket")?;
    info!("force-order WebSocket connected");

    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_force_order(&text) {
                        Ok((symbol, side, notional, at_secs)) => {
                            client.record_liquidation(&symbol, side, notional, at_secs);
                        }
                        Err(e) => {
                            debug!(error = %e, "unparseable force-order event");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "force-order WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("force-order WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
