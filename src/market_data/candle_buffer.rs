use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single immutable OHLCV candle. The interval lives on the series key,
/// not the candle itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open time in epoch milliseconds.
    pub open_time: i64,
    /// Bar close time in epoch milliseconds.
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Whether the bar has finished forming.
    pub is_closed: bool,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            is_closed: true,
        }
    }

    /// True when the candle closed below its open.
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Absolute body size |close - open|.
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Resampling
// ---------------------------------------------------------------------------

/// Fold `group` contiguous source candles into one target candle:
/// open = first.open, high = max, low = min, close = last.close,
/// volume = sum. Incomplete trailing groups are discarded.
pub fn resample(candles: &[Candle], group: usize) -> Vec<Candle> {
    if group == 0 {
        return Vec::new();
    }
    if group == 1 {
        return candles.to_vec();
    }

    let mut out = Vec::with_capacity(candles.len() / group);
    for chunk in candles.chunks(group) {
        if chunk.len() < group {
            break; // trailing incomplete group
        }
        let first = &chunk[0];
        let last = &chunk[chunk.len() - 1];
        out.push(Candle {
            open_time: first.open_time,
            close_time: last.close_time,
            open: first.open,
            high: chunk.iter().map(|c| c.high).fold(f64::MIN, f64::max),
            low: chunk.iter().map(|c| c.low).fold(f64::MAX, f64::min),
            close: last.close,
            volume: chunk.iter().map(|c| c.volume).sum(),
            is_closed: last.is_closed,
        });
    }
    out
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, interval)
// ---------------------------------------------------------------------------

/// Thread-safe ring-buffer that stores the most recent candles per
/// `(symbol, interval)` pair. The live (unclosed) candle is continuously
/// updated in-place; when a candle closes it becomes permanent and the ring
/// is trimmed to `max_candles`.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new buffer that retains at most `max_candles` closed candles
    /// per key, plus one in-progress candle.
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// * A closed candle replaces its own in-progress version (matched by
    ///   `open_time`), is appended, and the ring is trimmed.
    /// * An open candle replaces the previous open candle with the same
    ///   `open_time`, otherwise it is appended.
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

    /// Replace the whole series for a key (used after a REST backfill).
    pub fn replace_series(&self, key: CandleKey, candles: Vec<Candle>) {
        let mut ring: VecDeque<Candle> = candles.into();
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        self.buffers.write().insert(key, ring);
    }

    /// Return the most recent `count` **closed** candles (oldest-first order).
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

    /// Return the most recent `count` close prices from closed candles
    /// (oldest-first order).
    pub fn get_closes(&self, key: &CandleKey, count: usize) -> Vec<f64> {
        self.get_closed(key, count).iter().map(|c| c.close).collect()
    }

    /// Return the close price of the most recent closed candle, if any.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    /// Total number of candles (including any in-progress candle) stored for
    /// a key.
    pub fn count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
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
        CandleKey::new(sym, iv)
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(3);
        let key = make_key("BTCUSDT", "1m");

        for i in 0..5 {
            buf.update(key.clone(), sample_candle(i * 60_000, 100.0 + i as f64, true));
        }

        assert_eq!(buf.count(&key), 3);
        let closes = buf.get_closes(&key, 10);
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_replacement() {
        let buf = CandleBuffer::new(10);
        let key = make_key("ETHUSDT", "5m");

        buf.update(key.clone(), sample_candle(0, 50.0, false));
        assert_eq!(buf.count(&key), 1);

        // Same open_time, still open -- should replace.
        buf.update(key.clone(), sample_candle(0, 51.0, false));
        assert_eq!(buf.count(&key), 1);

        // Close it.
        buf.update(key.clone(), sample_candle(0, 52.0, true));
        assert_eq!(buf.count(&key), 1);
        assert_eq!(buf.last_close(&key), Some(52.0));
    }

    #[test]
    fn get_closed_filters_out_in_progress() {
        let buf = CandleBuffer::new(10);
        let key = make_key("BTCUSDT", "1m");

        buf.update(key.clone(), sample_candle(0, 100.0, true));
        buf.update(key.clone(), sample_candle(60_000, 101.0, true));
        buf.update(key.clone(), sample_candle(120_000, 102.0, false));

        let closed = buf.get_closed(&key, 10);
        assert_eq!(closed.len(), 2);
    }

    #[test]
    fn last_close_empty_returns_none() {
        let buf = CandleBuffer::new(10);
        let key = make_key("XYZUSDT", "1h");
        assert_eq!(buf.last_close(&key), None);
    }

    #[test]
    fn resample_folds_groups() {
        let candles: Vec<Candle> = (0..7)
            .map(|i| Candle {
                open_time: i * 60_000,
                close_time: i * 60_000 + 59_999,
                open: 100.0 + i as f64,
                high: 105.0 + i as f64,
                low: 95.0 + i as f64,
                close: 101.0 + i as f64,
                volume: 10.0,
                is_closed: true,
            })
            .collect();

        // 7 candles folded by 3 -> 2 complete groups, trailing 1 dropped.
        let folded = resample(&candles, 3);
        assert_eq!(folded.len(), 2);

        let first = &folded[0];
        assert_eq!(first.open, 100.0);
        assert_eq!(first.close, 103.0); // close of candle index 2
        assert_eq!(first.high, 107.0); // high of candle index 2
        assert_eq!(first.low, 95.0); // low of candle index 0
        assert_eq!(first.volume, 30.0);
        assert_eq!(first.open_time, 0);
        assert_eq!(first.close_time, 2 * 60_000 + 59_999);
    }

    #[test]
    fn resample_group_of_one_is_identity() {
        let candles = vec![sample_candle(0, 100.0, true), sample_candle(60_000, 101.0, true)];
        let folded = resample(&candles, 1);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[1].close, 101.0);
    }

    #[test]
    fn resample_insufficient_input_is_empty() {
        let candles = vec![sample_candle(0, 100.0, true)];
        assert!(resample(&candles, 4).is_empty());
        assert!(resample(&candles, 0).is_empty());
    }

    #[test]
    fn replace_series_trims_to_capacity() {
        let buf = CandleBuffer::new(2);
        let key = make_key("BTCUSDT", "1m");
        let candles: Vec<Candle> =
            (0..5).map(|i| sample_candle(i * 60_000, 100.0 + i as f64, true)).collect();
        buf.replace_series(key.clone(), candles);
        assert_eq!(buf.count(&key), 2);
        assert_eq!(buf.last_close(&key), Some(104.0));
    }
}
