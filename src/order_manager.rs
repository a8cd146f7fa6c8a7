// =============================================================================
// Order Manager — paper fills and live orders over one position book
// =============================================================================
//
// Paper mode: fills are instant at the signal's entry price; exit decisions
// update the book directly, with fees accrued per partial at the configured
// paper rate on the closed notional.
//
// Live mode: entries go out as market orders, confirmed fills get reduce-only
// TP/SL trigger orders attached, and the book is persisted atomically. Exit
// decisions send reduce-only market closes. Close detection compares the
// local book against the venue's open positions and infers the close reason
// from the last price relative to TP/SL.
//
// Limit entries rest with a TTL (zone-magnet orders); scaled entries split
// the size into tranches weighted toward the zone's deeper edge.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::exit::engine::{ExitAction, ExitDecision};
use crate::position_book::{Position, PositionBook, TradeResult};
use crate::sizer::SizedPosition;
use crate::types::{Direction, EngineMode, TradeSignal, TradeType};
use crate::venue::Venue;

/// A resting entry order waiting for price to come to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub trade_type: TradeType,
    pub limit_price: f64,
    pub quantity: f64,
    pub notional: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub conviction: f64,
    pub placed_time: i64,
    pub expires_at: i64,
    pub mode: EngineMode,
    #[serde(default)]
    pub venue_order_id: Option<String>,
    #[serde(default)]
    pub zone_key: Option<String>,
}

// =============================================================================
// OrderManager
// =============================================================================

pub struct OrderManager {
    mode: EngineMode,
    venue: Arc<dyn Venue>,
    book: PositionBook,
    pending: RwLock<HashMap<String, PendingOrder>>,
    paper_fee_rate: f64,
}

impl OrderManager {
    pub fn new(
        mode: EngineMode,
        venue: Arc<dyn Venue>,
        book: PositionBook,
        paper_fee_rate: f64,
    ) -> Self {
        Self {
            mode,
            venue,
            book,
            pending: RwLock::new(HashMap::new()),
            paper_fee_rate,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn book(&self) -> &PositionBook {
        &self.book
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.pending.read().values().cloned().collect()
    }

    pub fn pending_count_for(&self, symbol: &str) -> usize {
        self.pending.read().values().filter(|o| o.symbol == symbol).count()
    }

    /// Fee for closing `qty` at `price`. Live fills carry venue-side fees,
    /// so only paper fills are charged here.
    fn close_fee(&self, qty: f64, price: f64) -> f64 {
        match self.mode {
            EngineMode::Paper => self.paper_fee_rate * qty * price,
            EngineMode::Live => 0.0,
        }
    }

    // -------------------------------------------------------------------------
    // Market entries
    // -------------------------------------------------------------------------

    /// Execute a validated, sized signal. Returns the opened position, or
    /// `None` when the sizing was zero or the venue rejected the order
    /// (venue-logical failure — the cycle moves on).
    pub async fn execute_signal(
        &self,
        signal: &TradeSignal,
        sizing: &SizedPosition,
        zone_key: Option<String>,
        now_secs: i64,
    ) -> Result<Option<Position>> {
        if sizing.is_zero() {
            debug!(symbol = %signal.symbol, "zero sizing — no order");
            return Ok(None);
        }

        let mut position = Position::new(
            signal.symbol.clone(),
            signal.direction,
            signal.trade_type,
            signal.entry_price,
            sizing.qty,
            sizing.notional_usd,
            sizing.leverage,
            sizing.sl_price,
            signal.take_profit_1,
            now_secs,
            self.mode,
        );
        position.zone_key = zone_key;

        match self.mode {
            EngineMode::Paper => {
                // Instant synthetic fill at the signal's entry.
                self.book.insert(position.clone());
                Ok(Some(position))
            }
            EngineMode::Live => {
                if let Err(e) = self
                    .venue
                    .set_leverage(&signal.symbol, sizing.leverage)
                    .await
                {
                    warn!(symbol = %signal.symbol, error = %e, "set_leverage failed — continuing");
                }

                let ack = self
                    .venue
                    .place_market_order(&signal.symbol, signal.direction, sizing.qty, false)
                    .await
                    .context("market entry failed")?;

                if !ack.is_filled() {
                    warn!(
                        symbol = %signal.symbol,
                        status = %ack.status,
                        "entry order not filled — aborting trade"
                    );
                    return Ok(None);
                }

                // Record the venue's truth, not ours.
                position.entry_price = if ack.avg_price > 0.0 {
                    ack.avg_price
                } else {
                    signal.entry_price
                };
                position.quantity = ack.filled_qty;
                position.original_quantity = ack.filled_qty;
                position.notional = ack.filled_qty * position.entry_price;
                position.venue_order_id = Some(ack.order_id.clone());

                if let Err(e) = self
                    .venue
                    .place_tpsl(
                        &signal.symbol,
                        signal.direction,
                        ack.filled_qty,
                        signal.take_profit_1,
                        sizing.sl_price,
                    )
                    .await
                {
                    warn!(symbol = %signal.symbol, error = %e, "TP/SL attach failed — position unprotected on venue");
                }

                self.book.insert(position.clone());
                Ok(Some(position))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Limit entries
    // -------------------------------------------------------------------------

    /// Place a resting limit entry with a TTL (zone-magnet order).
    pub async fn execute_limit_entry(
        &self,
        signal: &TradeSignal,
        sizing: &SizedPosition,
        limit_price: f64,
        ttl_secs: u64,
        now_secs: i64,
    ) -> Result<Option<String>> {
        if sizing.is_zero() || limit_price <= 0.0 {
            return Ok(None);
        }

        let mut order = PendingOrder {
            id: Uuid::new_v4().to_string(),
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            trade_type: signal.trade_type,
            limit_price,
            quantity: sizing.qty,
            notional: sizing.notional_usd,
            leverage: sizing.leverage,
            stop_loss: sizing.sl_price,
            take_profit: signal.take_profit_1,
            conviction: signal.conviction,
            placed_time: now_secs,
            expires_at: now_secs + ttl_secs as i64,
            mode: self.mode,
            venue_order_id: None,
            zone_key: None,
        };

        if self.mode == EngineMode::Live {
            let ack = self
                .venue
                .place_limit_order(&signal.symbol, signal.direction, sizing.qty, limit_price)
                .await
                .context("limit entry failed")?;
            order.venue_order_id = Some(ack.order_id);
        }

        info!(
            id = %order.id,
            symbol = %order.symbol,
            direction = %order.direction,
            limit = limit_price,
            qty = order.quantity,
            ttl_secs,
            "limit entry resting"
        );

        let id = order.id.clone();
        self.pending.write().insert(id.clone(), order);
        Ok(Some(id))
    }

    /// Split a sized entry into `tranches` limit orders across a price
    /// zone, with weights favouring the zone's deeper edge.
    pub async fn execute_scaled_entry(
        &self,
        signal: &TradeSignal,
        sizing: &SizedPosition,
        zone_top: f64,
        zone_bottom: f64,
        tranches: u32,
        ttl_secs: u64,
        now_secs: i64,
    ) -> Result<Vec<String>> {
        if sizing.is_zero() || tranches == 0 || zone_top <= zone_bottom {
            return Ok(Vec::new());
        }

        // For a long the deep edge is the zone bottom; shorts invert.
        let (shallow, deep) = match signal.direction {
            Direction::Long => (zone_top, zone_bottom),
            Direction::Short => (zone_bottom, zone_top),
        };

        let n = tranches as usize;
        let weight_total: f64 = (1..=n).map(|i| i as f64).sum();
        let mut ids = Vec::with_capacity(n);

        for i in 0..n {
            // Tranche 0 sits at the shallow edge with the smallest weight.
            let t = if n == 1 { 0.0 } else { i as f64 / (n - 1) as f64 };
            let price = shallow + (deep - shallow) * t;
            let weight = (i + 1) as f64 / weight_total;
            let qty = sizing.qty * weight;

            let mut tranche_sizing = sizing.clone();
            tranche_sizing.qty = qty;
            tranche_sizing.notional_usd = qty * price;

            if let Some(id) = self
                .execute_limit_entry(signal, &tranche_sizing, price, ttl_secs, now_secs)
                .await?
            {
                ids.push(id);
            }
        }

        info!(
            symbol = %signal.symbol,
            tranches = ids.len(),
            zone_top,
            zone_bottom,
            "scaled entry placed"
        );
        Ok(ids)
    }

    /// Fill paper limit orders whose price has been touched, and sweep
    /// expired orders. Returns position ids created by fills.
    pub async fn check_pending(
        &self,
        prices: &HashMap<String, f64>,
        now_secs: i64,
    ) -> Vec<String> {
        let mut fill_ids: Vec<String> = Vec::new();
        let mut expire_ids: Vec<String> = Vec::new();

        for (id, order) in self.pending.read().iter() {
            if now_secs >= order.expires_at {
                expire_ids.push(id.clone());
                continue;
            }
            if order.mode == EngineMode::Paper {
                if let Some(price) = prices.get(&order.symbol) {
                    let touched = match order.direction {
                        Direction::Long => *price <= order.limit_price,
                        Direction::Short => *price >= order.limit_price,
                    };
                    if touched {
                        fill_ids.push(id.clone());
                    }
                }
            }
        }

        let (filled, expired) = {
            let mut pending = self.pending.write();
            let filled: Vec<PendingOrder> =
                fill_ids.iter().filter_map(|id| pending.remove(id)).collect();
            let expired: Vec<PendingOrder> =
                expire_ids.iter().filter_map(|id| pending.remove(id)).collect();
            (filled, expired)
        };

        for order in &expired {
            info!(id = %order.id, symbol = %order.symbol, "pending order expired (TTL)");
            if let Some(venue_id) = &order.venue_order_id {
                if let Err(e) = self.venue.cancel_order(&order.symbol, venue_id).await {
                    warn!(symbol = %order.symbol, error = %e, "failed to cancel expired venue order");
                }
            }
        }

        let mut position_ids = Vec::new();
        for order in filled {
            let mut position = Position::new(
                order.symbol.clone(),
                order.direction,
                order.trade_type,
                order.limit_price,
                order.quantity,
                order.notional,
                order.leverage,
                order.stop_loss,
                order.take_profit,
                now_secs,
                order.mode,
            );
            position.zone_key = order.zone_key.clone();
            info!(
                id = %position.id,
                symbol = %position.symbol,
                limit = order.limit_price,
                "paper limit order filled"
            );
            position_ids.push(self.book.insert(position));
        }
        position_ids
    }

    /// Convert a venue fill notification for a live limit order into a
    /// position.
    pub fn on_venue_fill(&self, venue_order_id: &str, fill_price: f64, now_secs: i64) {
        let order = {
            let mut pending = self.pending.write();
            let id = pending
                .iter()
                .find(|(_, o)| o.venue_order_id.as_deref() == Some(venue_order_id))
                .map(|(id, _)| id.clone());
            id.and_then(|id| pending.remove(&id))
        };

        if let Some(order) = order {
            let mut position = Position::new(
                order.symbol.clone(),
                order.direction,
                order.trade_type,
                if fill_price > 0.0 { fill_price } else { order.limit_price },
                order.quantity,
                order.notional,
                order.leverage,
                order.stop_loss,
                order.take_profit,
                now_secs,
                order.mode,
            );
            position.venue_order_id = Some(venue_order_id.to_string());
            position.zone_key = order.zone_key;
            self.book.insert(position);
        }
    }

    // -------------------------------------------------------------------------
    // Exit decision application
    // -------------------------------------------------------------------------

    /// Apply one tick's exit decisions, in order. Returns the trade result
    /// when a terminal decision closed the position. An over-close from
    /// corrupted state propagates as an error (fatal invariant violation).
    pub async fn apply_exit_decisions(
        &self,
        position_id: &str,
        decisions: &[ExitDecision],
        current_price: f64,
        now_secs: i64,
    ) -> Result<Option<TradeResult>> {
        for decision in decisions {
            let Some(position) = self.book.get(position_id) else {
                debug!(id = %position_id, "decision for unknown position — skipped");
                return Ok(None);
            };

            match decision.action {
                ExitAction::TrailStop => {
                    if let Some(new_stop) = decision.new_stop {
                        self.book.update_stop(position_id, new_stop);
                    }
                }

                ExitAction::PartialEarly | ExitAction::PartialTp1 | ExitAction::PartialTp2 => {
                    let close_qty = position.quantity * decision.close_fraction;
                    let price = if decision.close_price > 0.0 {
                        decision.close_price
                    } else {
                        current_price
                    };

                    if position.mode == EngineMode::Live {
                        if let Err(e) = self
                            .venue
                            .place_market_order(
                                &position.symbol,
                                position.direction.opposite(),
                                close_qty,
                                true,
                            )
                            .await
                        {
                            warn!(
                                symbol = %position.symbol,
                                error = %e,
                                "reduce-only partial failed — keeping local state unchanged"
                            );
                            continue;
                        }
                    }

                    let fee = self.close_fee(close_qty, price);
                    self.book
                        .reduce(position_id, close_qty, price, fee)
                        .context("partial close failed")?;
                }

                ExitAction::StopLoss | ExitAction::PartialTp3 | ExitAction::TimeExit => {
                    let price = if decision.close_price > 0.0 {
                        decision.close_price
                    } else {
                        current_price
                    };

                    if position.mode == EngineMode::Live {
                        if let Err(e) = self
                            .venue
                            .place_market_order(
                                &position.symbol,
                                position.direction.opposite(),
                                position.quantity,
                                true,
                            )
                            .await
                        {
                            warn!(
                                symbol = %position.symbol,
                                error = %e,
                                "reduce-only close failed — will retry next tick"
                            );
                            continue;
                        }
                        // The venue's trigger orders are now stale.
                        if let Err(e) = self.venue.bulk_cancel(&position.symbol).await {
                            debug!(symbol = %position.symbol, error = %e, "bulk cancel failed");
                        }
                    }

                    let fee = self.close_fee(position.quantity, price);
                    let result = self.book.close(
                        position_id,
                        &decision.action.to_string(),
                        price,
                        fee,
                        now_secs,
                    );
                    return Ok(result);
                }
            }
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Live close detection
    // -------------------------------------------------------------------------

    /// Compare the local live book against the venue. Any local symbol the
    /// venue no longer holds is presumed closed (TP or SL triggered); the
    /// reason is classified from the last price against the levels.
    pub async fn reconcile(&self, now_secs: i64) -> Result<Vec<TradeResult>> {
        let venue_positions = self
            .venue
            .get_positions()
            .await
            .context("failed to fetch venue positions")?;
        let venue_symbols: Vec<&str> =
            venue_positions.iter().map(|p| p.symbol.as_str()).collect();

        // A live limit order that filled server-side shows up as a venue
        // position before any local record exists: convert it.
        let pending_fills: Vec<(String, f64)> = self
            .pending
            .read()
            .values()
            .filter(|o| o.mode == EngineMode::Live && !self.book.has_symbol(&o.symbol))
            .filter_map(|o| {
                let venue_pos = venue_positions.iter().find(|p| p.symbol == o.symbol)?;
                let venue_id = o.venue_order_id.clone()?;
                Some((venue_id, venue_pos.entry_price))
            })
            .collect();
        for (venue_id, fill_price) in pending_fills {
            self.on_venue_fill(&venue_id, fill_price, now_secs);
        }

        let mut results = Vec::new();
        for position in self.book.get_open() {
            if position.mode != EngineMode::Live {
                continue;
            }
            if venue_symbols.contains(&position.symbol.as_str()) {
                continue;
            }

            let last_price = match self.venue.get_price(&position.symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "price fetch failed during reconcile");
                    continue;
                }
            };

            // Classify: which level did the venue most plausibly trigger?
            let (reason, close_price) = match position.direction {
                Direction::Long if last_price >= position.take_profit => {
                    ("TP_TRIGGERED", position.take_profit)
                }
                Direction::Long if last_price <= position.stop_loss => {
                    ("SL_TRIGGERED", position.stop_loss)
                }
                Direction::Short if last_price <= position.take_profit => {
                    ("TP_TRIGGERED", position.take_profit)
                }
                Direction::Short if last_price >= position.stop_loss => {
                    ("SL_TRIGGERED", position.stop_loss)
                }
                _ => ("CLOSED_EXTERNAL", last_price),
            };

            info!(
                id = %position.id,
                symbol = %position.symbol,
                reason,
                close_price,
                "venue reports position gone — closing locally"
            );
            if let Some(result) =
                self.book.close(&position.id, reason, close_price, 0.0, now_secs)
            {
                results.push(result);
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for OrderManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderManager")
            .field("mode", &self.mode)
            .field("book", &self.book)
            .field("pending", &self.pending.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
