// =============================================================================
// Exit Engine — trailing stops, partial TPs, time exits
// =============================================================================
//
// Manages the full exit lifecycle of a position:
//   1. Early partial: 25% at 1.0R — pays for the trade, stop to breakeven.
//   2. TP1: 25% at 1.5R — half the position banked.
//   3. TP2: 30% at 2.5R — 80% total banked.
//   4. TP3: the 20% runner closes at 4.0R.
//   5. Trailing stop: breakeven hold from 1.0R, ATR-following from 2.0R,
//      widened in trends and tightened in chop. Monotone only.
//   6. Time exit: stale positions (>= 12h, |R| < 0.3) are flattened; a
//      funding-collecting position may earn a configurable grace window.
//
// Per-tick evaluation order: stop check, high-water update, partials
// (each at most once; price gaps can fire several in one tick), trailing,
// time exit. A stop decision closes the entire remainder at the stop price.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::types::Direction;

/// What the engine wants done, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitAction {
    StopLoss,
    PartialEarly,
    PartialTp1,
    PartialTp2,
    PartialTp3,
    TrailStop,
    TimeExit,
}

impl std::fmt::Display for ExitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "STOP_LOSS"),
            Self::PartialEarly => write!(f, "PARTIAL_EARLY"),
            Self::PartialTp1 => write!(f, "PARTIAL_TP1"),
            Self::PartialTp2 => write!(f, "PARTIAL_TP2"),
            Self::PartialTp3 => write!(f, "PARTIAL_TP3"),
            Self::TrailStop => write!(f, "TRAIL_SL"),
            Self::TimeExit => write!(f, "TIME_EXIT"),
        }
    }
}

/// One instruction for the order manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitDecision {
    pub action: ExitAction,
    /// New stop level for `TrailStop`.
    pub new_stop: Option<f64>,
    /// Fraction of the REMAINING quantity to close (0 for pure stop moves).
    pub close_fraction: f64,
    /// Fill price; 0.0 means "use current market".
    pub close_price: f64,
    pub reason: String,
}

/// One slice of the position that has been closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialRecord {
    pub label: String,
    /// Fraction of the ORIGINAL quantity this slice represents.
    pub fraction_of_original: f64,
    pub price: f64,
}

/// Mutable per-position exit state. Owned by the exit monitor; mutated only
/// on tick by [`ExitEngine::evaluate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitState {
    pub entry_price: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub current_stop: f64,
    pub original_stop: f64,
    pub original_qty: f64,
    pub remaining_qty: f64,
    /// ATR at entry time; 0.0 falls back to 1R trailing distance.
    pub atr: f64,
    /// Epoch seconds when the position opened.
    pub entry_time: i64,
    pub early_hit: bool,
    pub tp1_hit: bool,
    pub tp2_hit: bool,
    pub tp3_hit: bool,
    /// Whether this position currently collects funding (stale-exit grace).
    pub funding_collecting: bool,
    pub partial_history: Vec<PartialRecord>,
    /// Terminal flag; no further evaluation once set.
    pub closed: bool,
}

impl ExitState {
    pub fn new(entry_price: f64, stop_loss: f64, qty: f64, atr: f64, entry_time: i64) -> Self {
        Self {
            entry_price,
            highest_price: entry_price,
            lowest_price: entry_price,
            current_stop: stop_loss,
            original_stop: stop_loss,
            original_qty: qty,
            remaining_qty: qty,
            atr,
            entry_time,
            early_hit: false,
            tp1_hit: false,
            tp2_hit: false,
            tp3_hit: false,
            funding_collecting: false,
            partial_history: Vec::new(),
            closed: false,
        }
    }

    /// Fraction of the original quantity already closed.
    pub fn closed_fraction(&self) -> f64 {
        self.partial_history.iter().map(|p| p.fraction_of_original).sum()
    }
}

// =============================================================================
// ExitEngine
// =============================================================================

/// Stateless evaluator; all mutable state lives in [`ExitState`].
pub struct ExitEngine {
    trail_atr_mult: f64,
    trail_breakeven_r: f64,
    trail_activate_r: f64,
    early_pct: f64,
    early_r: f64,
    tp1_pct: f64,
    tp1_r: f64,
    tp2_pct: f64,
    tp2_r: f64,
    tp3_r: f64,
    max_stale_hours: f64,
    stale_threshold_r: f64,
    chop_mult: f64,
    trend_mult: f64,
    funding_stale_extension_hours: f64,
}

impl ExitEngine {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            trail_atr_mult: config.trail_atr_multiplier,
            trail_breakeven_r: config.trail_breakeven_r,
            trail_activate_r: config.trail_activate_r,
            early_pct: config.partial_early_pct,
            early_r: config.partial_early_r,
            tp1_pct: config.partial_tp1_pct,
            tp1_r: config.partial_tp1_r,
            tp2_pct: config.partial_tp2_pct,
            tp2_r: config.partial_tp2_r,
            tp3_r: config.partial_tp3_r,
            max_stale_hours: config.max_stale_hours,
            stale_threshold_r: config.stale_threshold_r,
            chop_mult: config.exit_regime_chop_mult,
            trend_mult: config.exit_regime_trend_mult,
            funding_stale_extension_hours: config.funding_stale_extension_hours,
        }
    }

    /// Evaluate all exit conditions for one position on one tick.
    ///
    /// Decisions must be applied in the order returned. A terminal decision
    /// (stop, TP3, time exit) marks the state closed.
    pub fn evaluate(
        &self,
        direction: Direction,
        state: &mut ExitState,
        current_price: f64,
        now_secs: i64,
        regime_label: &str,
    ) -> Vec<ExitDecision> {
        let mut decisions = Vec::new();

        if state.closed || state.remaining_qty <= 0.0 || current_price <= 0.0 {
            return decisions;
        }
        let r_distance = (state.entry_price - state.original_stop).abs();
        if r_distance <= 0.0 {
            return decisions;
        }

        // ── 1. Stop hit? Entire remainder goes at the stop price. ───
        let stop_hit = match direction {
            Direction::Long => current_price <= state.current_stop,
            Direction::Short => current_price >= state.current_stop,
        };
        if stop_hit {
            let current_r = signed_r(direction, state.entry_price, current_price, r_distance);
            let fraction = state.remaining_qty / state.original_qty;
            state.partial_history.push(PartialRecord {
                label: "stop_loss".to_string(),
                fraction_of_original: fraction,
                price: state.current_stop,
            });
            decisions.push(ExitDecision {
                action: ExitAction::StopLoss,
                new_stop: None,
                close_fraction: 1.0,
                close_price: state.current_stop,
                reason: format!(
                    "stop hit at {:.2} (R={current_r:.1})",
                    state.current_stop
                ),
            });
            state.remaining_qty = 0.0;
            state.closed = true;
            return decisions;
        }

        // ── 2. High-water marks and the current R-multiple. ─────────
        state.highest_price = state.highest_price.max(current_price);
        state.lowest_price = state.lowest_price.min(current_price);
        let current_r = signed_r(direction, state.entry_price, current_price, r_distance);

        let regime_mult = self.regime_multiplier(regime_label);

        // ── 3. Partial take-profits. Plain `if`s: a price gap may fire
        //        several levels in a single tick. ───────────────────────
        if !state.early_hit && current_r >= self.early_r {
            self.take_partial(
                state,
                &mut decisions,
                ExitAction::PartialEarly,
                "early",
                self.early_pct,
                current_price,
                current_r,
            );
            state.early_hit = true;

            // Pay for the trade, then protect it: stop to breakeven.
            if stop_improves(direction, state.entry_price, state.current_stop) {
                state.current_stop = state.entry_price;
                decisions.push(ExitDecision {
                    action: ExitAction::TrailStop,
                    new_stop: Some(state.entry_price),
                    close_fraction: 0.0,
                    close_price: 0.0,
                    reason: "stop to breakeven after early partial".to_string(),
                });
            }
        }

        if !state.tp1_hit && current_r >= self.tp1_r {
            self.take_partial(
                state,
                &mut decisions,
                ExitAction::PartialTp1,
                "tp1",
                self.tp1_pct,
                current_price,
                current_r,
            );
            state.tp1_hit = true;
            state.early_hit = true; // price gapped past the early level
        }

        if !state.tp2_hit && current_r >= self.tp2_r {
            self.take_partial(
                state,
                &mut decisions,
                ExitAction::PartialTp2,
                "tp2",
                self.tp2_pct,
                current_price,
                current_r,
            );
            state.tp2_hit = true;
        }

        if !state.tp3_hit && current_r >= self.tp3_r {
            // The runner: close everything that is left.
            let fraction = state.remaining_qty / state.original_qty;
            state.partial_history.push(PartialRecord {
                label: "tp3".to_string(),
                fraction_of_original: fraction,
                price: current_price,
            });
            decisions.push(ExitDecision {
                action: ExitAction::PartialTp3,
                new_stop: None,
                close_fraction: 1.0,
                close_price: current_price,
                reason: format!("runner closed at {current_r:.1}R"),
            });
            state.tp3_hit = true;
            state.remaining_qty = 0.0;
            state.closed = true;
            return decisions;
        }

        // ── 4. Trailing stop. ───────────────────────────────────────
        if let Some(new_stop) =
            self.trail_candidate(direction, state, current_r, r_distance, regime_mult)
        {
            state.current_stop = new_stop;
            decisions.push(ExitDecision {
                action: ExitAction::TrailStop,
                new_stop: Some(new_stop),
                close_fraction: 0.0,
                close_price: 0.0,
                reason: format!(
                    "trail stop -> {new_stop:.2} (R={current_r:.1}, regime_mult={regime_mult:.1})"
                ),
            });
        }

        // ── 5. Time exit. ───────────────────────────────────────────
        if let Some(decision) = self.time_exit(state, current_r, now_secs) {
            let fraction = state.remaining_qty / state.original_qty;
            state.partial_history.push(PartialRecord {
                label: "time_exit".to_string(),
                fraction_of_original: fraction,
                price: current_price,
            });
            decisions.push(decision);
            state.remaining_qty = 0.0;
            state.closed = true;
        }

        decisions
    }

    /// Close `pct` of the ORIGINAL quantity, expressed as a fraction of the
    /// remaining quantity, clamped to 0.95 against precision dust.
    #[allow(clippy::too_many_arguments)]
    fn take_partial(
        &self,
        state: &mut ExitState,
        decisions: &mut Vec<ExitDecision>,
        action: ExitAction,
        label: &str,
        pct: f64,
        current_price: f64,
        current_r: f64,
    ) {
        let fraction_of_remaining =
            (pct * state.original_qty / state.remaining_qty.max(1e-12)).min(0.95);
        let closed_qty = fraction_of_remaining * state.remaining_qty;

        state.partial_history.push(PartialRecord {
            label: label.to_string(),
            fraction_of_original: closed_qty / state.original_qty,
            price: current_price,
        });
        decisions.push(ExitDecision {
            action,
            new_stop: None,
            close_fraction: fraction_of_remaining,
            close_price: current_price,
            reason: format!("{label} partial ({:.0}% of original) at {current_r:.1}R", pct * 100.0),
        });
        state.remaining_qty -= closed_qty;

        debug!(
            label,
            closed_qty,
            remaining = state.remaining_qty,
            r = format!("{current_r:.2}"),
            "partial take-profit"
        );
    }

    /// Trailing candidate, or `None` when trailing is inactive or would
    /// regress. Breakeven hold between 1R and the activation R; beyond that
    /// the stop follows the best price at an ATR distance.
    fn trail_candidate(
        &self,
        direction: Direction,
        state: &ExitState,
        current_r: f64,
        r_distance: f64,
        regime_mult: f64,
    ) -> Option<f64> {
        if current_r < self.trail_breakeven_r {
            return None;
        }

        let trail_dist = if state.atr > 0.0 {
            state.atr * self.trail_atr_mult * regime_mult
        } else {
            r_distance * regime_mult
        };

        let candidate = if current_r < self.trail_activate_r {
            state.entry_price
        } else {
            match direction {
                Direction::Long => state.highest_price - trail_dist,
                Direction::Short => state.lowest_price + trail_dist,
            }
        };

        if !stop_improves(direction, candidate, state.current_stop) {
            return None;
        }
        Some((candidate * 100.0).round() / 100.0)
    }

    /// Flatten stale positions that never went anywhere. The fill happens
    /// at market (`close_price` 0.0).
    fn time_exit(&self, state: &ExitState, current_r: f64, now_secs: i64) -> Option<ExitDecision> {
        if state.entry_time <= 0 {
            return None;
        }
        let hours_held = (now_secs - state.entry_time) as f64 / 3600.0;
        let mut limit = self.max_stale_hours;
        if state.funding_collecting {
            limit += self.funding_stale_extension_hours;
        }
        if hours_held < limit || current_r.abs() >= self.stale_threshold_r {
            return None;
        }

        Some(ExitDecision {
            action: ExitAction::TimeExit,
            new_stop: None,
            close_fraction: 1.0,
            close_price: 0.0,
            reason: format!(
                "stale trade: {hours_held:.1}h held, only {current_r:.2}R moved"
            ),
        })
    }

    /// Trailing width modifier by regime label: wider in trends, tighter in
    /// chop and manipulation.
    fn regime_multiplier(&self, regime_label: &str) -> f64 {
        match regime_label.to_lowercase().as_str() {
            "choppy" | "manipulation" | "neutral" | "ranging" => self.chop_mult,
            "strong_bull" | "strong_bear" | "bull" | "bear" => self.trend_mult,
            _ => 1.0,
        }
    }
}

/// Signed R-multiple: positive when the trade is in profit.
fn signed_r(direction: Direction, entry: f64, price: f64, r_distance: f64) -> f64 {
    direction.sign() * (price - entry) / r_distance
}

/// True when `candidate` is strictly better (toward profit) than `current`.
fn stop_improves(direction: Direction, candidate: f64, current: f64) -> bool {
    match direction {
        Direction::Long => candidate > current,
        Direction::Short => candidate < current,
    }
}

// =============================================================================
// Tests
// =============================================================================
