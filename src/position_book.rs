// =============================================================================
// Position Book — open positions and closed trade results
// =============================================================================
//
// One book serves both paper and live mode; behaviour diverges only in the
// order manager. The book is the single writer for position records. In
// live mode the open map is persisted atomically after every change so a
// restart can reconcile against the venue.
//
// Quantity accounting is the hard invariant here: a partial close may never
// push the remaining quantity negative. That is an internal invariant
// violation and is surfaced as an error for the caller to treat as fatal.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Direction, EngineMode, TradeType};

/// Tolerance for floating-point quantity bookkeeping.
const QTY_EPSILON: f64 = 1e-9;

/// An open trade. Exactly one exit state exists per position with the same
/// lifetime (owned by the exit monitor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub trade_type: TradeType,
    pub entry_price: f64,
    /// Remaining quantity; reduced by partial closes.
    pub quantity: f64,
    pub original_quantity: f64,
    pub notional: f64,
    pub leverage: u32,
    /// Current protective stop (moves monotonically toward profit).
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Epoch seconds.
    pub entry_time: i64,
    pub original_stop: f64,
    /// PnL already banked by partial closes.
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub fees_paid: f64,
    /// Zone-memory key this trade's stop was anchored on, if any.
    #[serde(default)]
    pub zone_key: Option<String>,
    pub mode: EngineMode,
    /// Venue order id for the entry fill (live mode).
    #[serde(default)]
    pub venue_order_id: Option<String>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        direction: Direction,
        trade_type: TradeType,
        entry_price: f64,
        quantity: f64,
        notional: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
        entry_time: i64,
        mode: EngineMode,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol,
            direction,
            trade_type,
            entry_price,
            quantity,
            original_quantity: quantity,
            notional,
            leverage,
            stop_loss,
            take_profit,
            entry_time,
            original_stop: stop_loss,
            realized_pnl: 0.0,
            fees_paid: 0.0,
            zone_key: None,
            mode,
            venue_order_id: None,
        }
    }

    /// Risk still at stake: distance from entry to the current stop, over
    /// the remaining quantity. Positions past breakeven carry zero heat.
    pub fn open_risk_usd(&self) -> f64 {
        let adverse = match self.direction {
            Direction::Long => self.entry_price - self.stop_loss,
            Direction::Short => self.stop_loss - self.entry_price,
        };
        (adverse * self.quantity).max(0.0)
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        self.direction.sign() * (current_price - self.entry_price) * self.quantity
    }
}

/// The outcome of a fully closed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub position_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub trade_type: TradeType,
    pub entry_price: f64,
    /// Price of the final close.
    pub exit_price: f64,
    pub original_quantity: f64,
    /// Total realised PnL across all partials, gross of fees.
    pub pnl: f64,
    pub fees: f64,
    pub reason: String,
    pub opened_at: i64,
    pub closed_at: i64,
    /// PnL expressed in R (initial risk units).
    pub r_multiple: f64,
    #[serde(default)]
    pub zone_key: Option<String>,
}

impl TradeResult {
    /// PnL net of fees — the number the circuit breaker records.
    pub fn net_pnl(&self) -> f64 {
        self.pnl - self.fees
    }

    pub fn is_win(&self) -> bool {
        self.net_pnl() >= 0.0
    }
}

// =============================================================================
// PositionBook
// =============================================================================

/// Thread-safe book of open positions and closed results.
pub struct PositionBook {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<TradeResult>>,
    path: Option<PathBuf>,
}

impl PositionBook {
    /// Create a book; when `path` is given, previously persisted open
    /// positions are restored (live-mode restart).
    pub fn new(path: Option<PathBuf>) -> Self {
        let open = path
            .as_deref()
            .and_then(|p| Self::load_open(p).ok())
            .unwrap_or_default();
        if !open.is_empty() {
            info!(count = open.len(), "position book restored from disk");
        }
        Self {
            open: RwLock::new(open),
            closed: RwLock::new(Vec::new()),
            path,
        }
    }

    /// Insert a new position and return its id.
    pub fn insert(&self, position: Position) -> String {
        let id = position.id.clone();
        info!(
            id = %id,
            symbol = %position.symbol,
            direction = %position.direction,
            trade_type = %position.trade_type,
            entry = position.entry_price,
            qty = position.quantity,
            notional = position.notional,
            leverage = position.leverage,
            stop = position.stop_loss,
            tp = position.take_profit,
            mode = %position.mode,
            "position opened"
        );
        self.open.write().insert(id.clone(), position);
        self.persist();
        id
    }

    pub fn get(&self, id: &str) -> Option<Position> {
        self.open.read().get(id).cloned()
    }

    pub fn get_open(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.open.read().values().any(|p| p.symbol == symbol)
    }

    /// Whether any scalp position is open (drives the adaptive cycle).
    pub fn has_scalp_position(&self) -> bool {
        self.open.read().values().any(|p| p.trade_type == TradeType::Scalp)
    }

    pub fn total_notional(&self) -> f64 {
        self.open.read().values().map(|p| p.notional).sum()
    }

    /// Move the protective stop. The exit engine guarantees monotonicity;
    /// the book only records it.
    pub fn update_stop(&self, id: &str, new_stop: f64) {
        if let Some(pos) = self.open.write().get_mut(id) {
            pos.stop_loss = new_stop;
        }
        self.persist();
    }

    /// Reduce a position by `close_qty` at `close_price`, banking PnL and
    /// fees. Errors when the close would take the remaining quantity
    /// negative — an internal invariant violation the caller must treat as
    /// fatal.
    pub fn reduce(
        &self,
        id: &str,
        close_qty: f64,
        close_price: f64,
        fee: f64,
    ) -> Result<f64> {
        let mut open = self.open.write();
        let Some(pos) = open.get_mut(id) else {
            bail!("reduce on unknown position {id}");
        };

        if close_qty > pos.quantity + QTY_EPSILON {
            bail!(
                "invariant violation: closing {close_qty} of {} remaining on {id}",
                pos.quantity
            );
        }

        let pnl = pos.direction.sign() * (close_price - pos.entry_price) * close_qty;
        pos.quantity = (pos.quantity - close_qty).max(0.0);
        pos.realized_pnl += pnl;
        pos.fees_paid += fee;

        info!(
            id = %id,
            close_qty,
            close_price,
            partial_pnl = format!("{pnl:.2}"),
            remaining = pos.quantity,
            "partial close"
        );
        drop(open);
        self.persist();
        Ok(pnl)
    }

    /// Close a position entirely at `close_price` and move it to the closed
    /// list. Returns the trade result.
    pub fn close(
        &self,
        id: &str,
        reason: &str,
        close_price: f64,
        fee: f64,
        now_secs: i64,
    ) -> Option<TradeResult> {
        let mut pos = self.open.write().remove(id)?;

        let final_pnl = pos.direction.sign() * (close_price - pos.entry_price) * pos.quantity;
        pos.realized_pnl += final_pnl;
        pos.fees_paid += fee;

        let r_denominator = (pos.entry_price - pos.original_stop).abs() * pos.original_quantity;
        let r_multiple = if r_denominator > 0.0 {
            pos.realized_pnl / r_denominator
        } else {
            0.0
        };

        let result = TradeResult {
            position_id: pos.id.clone(),
            symbol: pos.symbol.clone(),
            direction: pos.direction,
            trade_type: pos.trade_type,
            entry_price: pos.entry_price,
            exit_price: close_price,
            original_quantity: pos.original_quantity,
            pnl: pos.realized_pnl,
            fees: pos.fees_paid,
            reason: reason.to_string(),
            opened_at: pos.entry_time,
            closed_at: now_secs,
            r_multiple,
            zone_key: pos.zone_key.clone(),
        };

        info!(
            id = %id,
            symbol = %result.symbol,
            reason,
            exit_price = close_price,
            pnl = format!("{:.2}", result.pnl),
            fees = format!("{:.2}", result.fees),
            r = format!("{:.2}", result.r_multiple),
            "position closed"
        );

        self.closed.write().push(result.clone());
        self.persist();
        Some(result)
    }

    /// Most recent closed trades, newest first.
    pub fn recent_closed(&self, limit: usize) -> Vec<TradeResult> {
        let closed = self.closed.read();
        closed.iter().rev().take(limit).cloned().collect()
    }

    /// Epoch seconds of the most recent losing close on `symbol`, if any.
    pub fn last_loss_time(&self, symbol: &str) -> Option<i64> {
        self.closed
            .read()
            .iter()
            .rev()
            .find(|r| r.symbol == symbol && !r.is_win())
            .map(|r| r.closed_at)
    }

    // -------------------------------------------------------------------------
    // Persistence (live book)
    // -------------------------------------------------------------------------

    pub fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let result: Result<()> = (|| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let content = serde_json::to_string_pretty(&*self.open.read())
                .context("failed to serialise position book")?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, content)
                .with_context(|| format!("failed to write tmp book to {}", tmp.display()))?;
            std::fs::rename(&tmp, path)
                .with_context(|| format!("failed to rename book to {}", path.display()))?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "failed to persist position book");
        }
    }

    fn load_open(path: &Path) -> Result<HashMap<String, Position>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn long_position(qty: f64) -> Position {
        Position::new(
            "BTCUSDT".to_string(),
            Direction::Long,
            TradeType::Swing,
            100.0,
            qty,
            100.0 * qty,
            5,
            99.0,
            110.0,
            NOW,
            EngineMode::Paper,
        )
    }

    #[test]
    fn insert_and_query() {
        let book = PositionBook::new(None);
        let id = book.insert(long_position(10.0));
        assert_eq!(book.open_count(), 1);
        assert!(book.has_symbol("BTCUSDT"));
        assert!(!book.has_symbol("ETHUSDT"));
        let pos = book.get(&id).unwrap();
        assert_eq!(pos.original_quantity, 10.0);
        assert_eq!(pos.original_stop, 99.0);
    }

    #[test]
    fn reduce_banks_pnl_and_decrements() {
        let book = PositionBook::new(None);
        let id = book.insert(long_position(10.0));

        let pnl = book.reduce(&id, 2.5, 101.0, 0.4).unwrap();
        assert!((pnl - 2.5).abs() < 1e-9); // 2.5 * (101 - 100)

        let pos = book.get(&id).unwrap();
        assert!((pos.quantity - 7.5).abs() < 1e-9);
        assert!((pos.realized_pnl - 2.5).abs() < 1e-9);
        assert!((pos.fees_paid - 0.4).abs() < 1e-9);
        // remaining = original - sum(closed).
        assert!((pos.original_quantity - pos.quantity - 2.5).abs() < 1e-9);
    }

    #[test]
    fn over_close_is_an_invariant_violation() {
        let book = PositionBook::new(None);
        let id = book.insert(long_position(10.0));
        book.reduce(&id, 9.0, 101.0, 0.0).unwrap();
        let err = book.reduce(&id, 2.0, 101.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("invariant violation"), "{err}");
    }

    #[test]
    fn close_aggregates_partials_into_result() {
        let book = PositionBook::new(None);
        let id = book.insert(long_position(10.0));

        book.reduce(&id, 2.5, 101.0, 0.2).unwrap(); // +2.5
        book.reduce(&id, 2.5, 101.5, 0.2).unwrap(); // +3.75
        let result = book.close(&id, "STOP_LOSS", 100.0, 0.3, NOW + 3600).unwrap();

        // Final 5.0 at breakeven adds nothing.
        assert!((result.pnl - 6.25).abs() < 1e-9);
        assert!((result.fees - 0.7).abs() < 1e-9);
        assert!((result.net_pnl() - 5.55).abs() < 1e-9);
        // r = 6.25 / (1.0 * 10).
        assert!((result.r_multiple - 0.625).abs() < 1e-9);
        assert_eq!(result.reason, "STOP_LOSS");
        assert_eq!(book.open_count(), 0);
        assert_eq!(book.recent_closed(5).len(), 1);
    }

    #[test]
    fn short_pnl_signs() {
        let book = PositionBook::new(None);
        let mut pos = long_position(10.0);
        pos.direction = Direction::Short;
        pos.stop_loss = 101.0;
        pos.original_stop = 101.0;
        let id = book.insert(pos);

        let pnl = book.reduce(&id, 5.0, 99.0, 0.0).unwrap();
        assert!((pnl - 5.0).abs() < 1e-9); // short profits as price falls

        let result = book.close(&id, "TIME_EXIT", 101.0, 0.0, NOW + 60).unwrap();
        // Remaining 5.0 closed at -1.0 each.
        assert!((result.pnl - 0.0).abs() < 1e-9);
    }

    #[test]
    fn open_risk_uses_current_stop() {
        let book = PositionBook::new(None);
        let id = book.insert(long_position(10.0));
        assert!((book.get(&id).unwrap().open_risk_usd() - 10.0).abs() < 1e-9);

        // At breakeven the position no longer carries heat.
        book.update_stop(&id, 100.0);
        assert_eq!(book.get(&id).unwrap().open_risk_usd(), 0.0);

        // A stop in profit never reports negative risk.
        book.update_stop(&id, 102.0);
        assert_eq!(book.get(&id).unwrap().open_risk_usd(), 0.0);
    }

    #[test]
    fn last_loss_time_finds_losing_close() {
        let book = PositionBook::new(None);
        let id = book.insert(long_position(10.0));
        book.close(&id, "STOP_LOSS", 99.0, 0.0, NOW + 100); // -10

        let id = book.insert(long_position(10.0));
        book.close(&id, "TP3", 104.0, 0.0, NOW + 200); // +40

        assert_eq!(book.last_loss_time("BTCUSDT"), Some(NOW + 100));
        assert_eq!(book.last_loss_time("ETHUSDT"), None);
    }

    #[test]
    fn live_book_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let id = {
            let book = PositionBook::new(Some(path.clone()));
            let mut pos = long_position(10.0);
            pos.mode = EngineMode::Live;
            pos.venue_order_id = Some("12345".to_string());
            book.insert(pos)
        };

        let book = PositionBook::new(Some(path));
        assert_eq!(book.open_count(), 1);
        let pos = book.get(&id).unwrap();
        assert_eq!(pos.venue_order_id.as_deref(), Some("12345"));
    }
}
