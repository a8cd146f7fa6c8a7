// =============================================================================
// Price Feed — venue WS mid-prices bridged into the event loop
// =============================================================================
//
// The venue pushes best-bid/ask updates from its own connection task; the
// exit monitor consumes mid-price ticks from a bounded queue. Back-pressure
// policy on the bridge: bounded queue (default 5000); when full the incoming
// (NEWEST) tick is dropped and counted. The policy is constant — subsequent
// ticks carry fresh state, so losing one is acceptable.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

/// A single mid-price observation for one symbol.
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub mid: f64,
    /// Venue event time in epoch milliseconds (0 when not provided).
    pub at_ms: i64,
}

// ---------------------------------------------------------------------------
// TickBridge — bounded channel between the WS task and the exit monitor
// ---------------------------------------------------------------------------

/// Producer half of the tick bridge. Cheap to clone across WS tasks.
#[derive(Clone)]
pub struct TickBridge {
    tx: mpsc::Sender<PriceTick>,
    dropped: Arc<AtomicU64>,
    /// Epoch milliseconds of the most recent successful publish.
    last_publish_ms: Arc<AtomicI64>,
}

impl TickBridge {
    /// Create a bridge with the given capacity. Returns the producer half
    /// and the consumer receiver.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<PriceTick>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                last_publish_ms: Arc::new(AtomicI64::new(0)),
            },
            rx,
        )
    }

    /// Publish a tick. Drop policy: when the queue is full the incoming
    /// (newest) tick is discarded and the drop counter incremented — the
    /// consumer is expected to keep up.
    pub fn publish(&self, tick: PriceTick) {
        match self.tx.try_send(tick) {
            Ok(()) => {
                self.last_publish_ms
                    .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(t)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total % 1000 == 1 {
                    warn!(
                        symbol = %t.symbol,
                        dropped_total = total,
                        "tick bridge full — dropping newest tick"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("tick bridge closed — consumer gone");
            }
        }
    }

    /// Total ticks dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Seconds since the last successful publish; `None` before the first.
    pub fn seconds_since_last_tick(&self) -> Option<f64> {
        let last = self.last_publish_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now = chrono::Utc::now().timestamp_millis();
        Some((now - last).max(0) as f64 / 1000.0)
    }
}

// ---------------------------------------------------------------------------
// WebSocket stream — venue best bid/ask per symbol
// ---------------------------------------------------------------------------

/// Build the combined-stream URL for the futures bookTicker feed.
fn build_ticker_url(symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@bookTicker", s.to_lowercase()))
        .collect();
    format!(
        "wss://fstream.binance.com/stream?streams={}",
        streams.join("/")
    )
}

/// Parse one bookTicker message into a mid-price tick.
///
/// Expected shape (combined stream envelope):
/// ```json
/// { "stream": "btcusdt@bookTicker",
///   "data": { "s": "BTCUSDT", "b": "37000.1", "a": "37000.3", "E": 1700000000000 } }
/// ```
fn parse_ticker_message(text: &str) -> Result<PriceTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse bookTicker JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let bid: f64 = data["b"]
        .as_str()
        .context("missing field b")?
        .parse()
        .context("failed to parse bid")?;
    let ask: f64 = data["a"]
        .as_str()
        .context("missing field a")?
        .parse()
        .context("failed to parse ask")?;

    if bid <= 0.0 || ask <= 0.0 {
        anyhow::bail!("non-positive bid/ask for {symbol}: {bid}/{ask}");
    }

    Ok(PriceTick {
        symbol,
        mid: (bid + ask) / 2.0,
        at_ms: data["E"].as_i64().unwrap_or(0),
    })
}

/// Connect to the venue bookTicker WebSocket for `symbols` and publish
/// mid-price ticks into `bridge`.
///
/// Runs until the stream disconnects or errors, then returns so the caller
/// can handle reconnection with a minimum delay between attempts.
pub async fn run_tick_stream(symbols: &[String], bridge: &TickBridge) -> Result<()> {
    let url = build_ticker_url(symbols);
    info!(url = %url, count = symbols.len(), "connecting to tick WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to tick WebSocket")?;

    info!(count = symbols.len(), "tick WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_ticker_message(&text) {
                        Ok(tick) => {
                            bridge.publish(tick);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse tick message");
                        }
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                warn!(error = %e, "tick WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("tick WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
