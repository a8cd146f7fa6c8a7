// =============================================================================
// Circuit Breaker — multi-level loss limits protecting capital
// =============================================================================
//
// Levels, evaluated top-down, first match wins:
//   Halt        total drawdown >= 25%      reject until manual resume
//   Timed pause pause_until > now          reject, auto-clears
//   Consecutive >= 3 losing trades         pause 4h, resume at 50% size
//   Daily       daily loss >= 3%           pause 24h
//   Monthly     monthly loss >= 15%        size x 0.25
//   Weekly      weekly loss >= 6%          size x 0.5
//   Soft        2 consecutive losses       size x 0.75
//
// Per-symbol: N consecutive losses on one coin block new entries on it
// until its next win. The balance changes only via record_trade.
//
// All state is persisted after every mutation (tmp + rename) so a crash
// mid-update never loses the counters.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::bare_symbol;

/// Persisted breaker counters. Process-wide singleton.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakerState {
    #[serde(default)]
    pub consecutive_losses: u32,
    #[serde(default)]
    pub daily_pnl: f64,
    #[serde(default)]
    pub weekly_pnl: f64,
    #[serde(default)]
    pub monthly_pnl: f64,
    #[serde(default)]
    pub total_pnl: f64,
    #[serde(default)]
    pub peak_balance: f64,
    #[serde(default)]
    pub current_balance: f64,
    /// Epoch seconds; 0 = not paused.
    #[serde(default)]
    pub pause_until: i64,
    /// Epoch seconds of the halt; 0 = not halted.
    #[serde(default)]
    pub halt_time: i64,
    #[serde(default)]
    pub last_loss_time: i64,
    #[serde(default)]
    pub per_symbol_losses: HashMap<String, u32>,
    #[serde(default)]
    pub per_symbol_pnl: HashMap<String, f64>,
}

impl BreakerState {
    /// Drawdown from the peak balance, in percent.
    pub fn drawdown_pct(&self) -> f64 {
        if self.peak_balance <= 0.0 {
            return 0.0;
        }
        ((1.0 - self.current_balance / self.peak_balance) * 10_000.0).round() / 100.0
    }
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerDecision {
    pub trading_allowed: bool,
    pub reason: String,
    /// Size multiplier to apply on top of normal sizing.
    pub size_modifier: f64,
}

// =============================================================================
// CircuitBreaker
// =============================================================================

pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
    starting_capital: f64,
    max_consecutive_losses: u32,
    max_daily_loss_pct: f64,
    max_weekly_loss_pct: f64,
    max_monthly_dd_pct: f64,
    max_total_dd_pct: f64,
    pause_hours: f64,
    state_path: Option<PathBuf>,
}

impl CircuitBreaker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        starting_capital: f64,
        max_consecutive_losses: u32,
        max_daily_loss_pct: f64,
        max_weekly_loss_pct: f64,
        max_monthly_dd_pct: f64,
        max_total_dd_pct: f64,
        pause_hours: f64,
        state_path: Option<PathBuf>,
    ) -> Self {
        let mut state = BreakerState {
            peak_balance: starting_capital,
            current_balance: starting_capital,
            ..Default::default()
        };

        if let Some(path) = &state_path {
            match Self::load_state(path) {
                Ok(Some(loaded)) => {
                    info!(
                        path = %path.display(),
                        balance = loaded.current_balance,
                        consecutive_losses = loaded.consecutive_losses,
                        "circuit breaker state loaded"
                    );
                    state = loaded;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to load breaker state — starting fresh"),
            }
        }

        Self {
            state: RwLock::new(state),
            starting_capital,
            max_consecutive_losses,
            max_daily_loss_pct,
            max_weekly_loss_pct,
            max_monthly_dd_pct,
            max_total_dd_pct,
            pause_hours,
            state_path,
        }
    }

    pub fn from_config(config: &crate::config::EngineConfig, state_path: Option<PathBuf>) -> Self {
        Self::new(
            config.starting_capital,
            config.max_consecutive_losses,
            config.max_daily_loss_pct,
            config.max_weekly_loss_pct,
            config.max_monthly_dd_pct,
            config.max_total_dd_pct,
            config.pause_hours_after_losses,
            state_path,
        )
    }

    /// Snapshot of the current counters.
    pub fn state(&self) -> BreakerState {
        self.state.read().clone()
    }

    // -------------------------------------------------------------------------
    // Gate check
    // -------------------------------------------------------------------------

    /// Run all breaker levels. Checked at the start of each trading cycle.
    pub fn check(&self, now_secs: i64) -> BreakerDecision {
        let mut state = self.state.write();
        let mut persist = false;

        let decision = 'gate: {
            // Existing halt.
            if state.halt_time > 0 {
                break 'gate BreakerDecision {
                    trading_allowed: false,
                    reason: "HALTED — max drawdown exceeded, manual review required"
                        .to_string(),
                    size_modifier: 0.0,
                };
            }

            // Total drawdown -> halt.
            let drawdown = state.drawdown_pct();
            if drawdown >= self.max_total_dd_pct {
                state.halt_time = now_secs;
                persist = true;
                let reason = format!(
                    "HALTED: {drawdown:.1}% total drawdown (max {:.0}%)",
                    self.max_total_dd_pct
                );
                warn!("{reason}");
                break 'gate BreakerDecision {
                    trading_allowed: false,
                    reason,
                    size_modifier: 0.0,
                };
            }

            // Timed pause; auto-clears.
            if state.pause_until > now_secs {
                let remaining_h = (state.pause_until - now_secs) as f64 / 3600.0;
                break 'gate BreakerDecision {
                    trading_allowed: false,
                    reason: format!("paused for {remaining_h:.1}h"),
                    size_modifier: 0.0,
                };
            }

            // Consecutive losses -> timed pause, half size on resume.
            if state.consecutive_losses >= self.max_consecutive_losses {
                state.pause_until = now_secs + (self.pause_hours * 3600.0) as i64;
                persist = true;
                let reason = format!(
                    "paused: {} consecutive losses (resuming in {:.0}h at 50% size)",
                    state.consecutive_losses, self.pause_hours
                );
                warn!("{reason}");
                break 'gate BreakerDecision {
                    trading_allowed: false,
                    reason,
                    size_modifier: 0.5,
                };
            }

            let daily_dd = loss_pct(state.daily_pnl, self.starting_capital);
            let weekly_dd = loss_pct(state.weekly_pnl, self.starting_capital);
            let monthly_dd = loss_pct(state.monthly_pnl, self.starting_capital);

            // Daily loss -> 24h pause.
            if daily_dd >= self.max_daily_loss_pct {
                state.pause_until = now_secs + 24 * 3600;
                persist = true;
                let reason =
                    format!("daily loss limit: {daily_dd:.1}% — stopped for 24h");
                warn!("{reason}");
                break 'gate BreakerDecision {
                    trading_allowed: false,
                    reason,
                    size_modifier: 0.0,
                };
            }

            // Monthly drawdown -> recovery mode.
            if monthly_dd >= self.max_monthly_dd_pct {
                let reason =
                    format!("recovery mode: {monthly_dd:.1}% monthly drawdown (25% size)");
                warn!("{reason}");
                break 'gate BreakerDecision {
                    trading_allowed: true,
                    reason,
                    size_modifier: 0.25,
                };
            }

            // Weekly loss -> half size.
            if weekly_dd >= self.max_weekly_loss_pct {
                let reason = format!("weekly loss limit: {weekly_dd:.1}% (50% size)");
                warn!("{reason}");
                break 'gate BreakerDecision {
                    trading_allowed: true,
                    reason,
                    size_modifier: 0.5,
                };
            }

            // Soft taper near the consecutive limit.
            if state.consecutive_losses == 2 {
                break 'gate BreakerDecision {
                    trading_allowed: true,
                    reason: format!(
                        "{} losses — reduced to 75% size",
                        state.consecutive_losses
                    ),
                    size_modifier: 0.75,
                };
            }

            BreakerDecision {
                trading_allowed: true,
                reason: String::new(),
                size_modifier: 1.0,
            }
        };

        if persist {
            self.persist(&state);
        }
        decision
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Record a completed trade. The only place the balance changes.
    pub fn record_trade(&self, pnl: f64, symbol: &str, now_secs: i64) {
        let mut state = self.state.write();

        if pnl >= 0.0 {
            state.consecutive_losses = 0;
        } else {
            state.consecutive_losses += 1;
            state.last_loss_time = now_secs;
        }

        state.daily_pnl += pnl;
        state.weekly_pnl += pnl;
        state.monthly_pnl += pnl;
        state.total_pnl += pnl;

        state.current_balance += pnl;
        if state.current_balance > state.peak_balance {
            state.peak_balance = state.current_balance;
        }

        if !symbol.is_empty() {
            let bare = bare_symbol(symbol);
            *state.per_symbol_pnl.entry(bare.clone()).or_insert(0.0) += pnl;
            if pnl >= 0.0 {
                state.per_symbol_losses.insert(bare, 0);
            } else {
                *state.per_symbol_losses.entry(bare).or_insert(0) += 1;
            }
        }

        info!(
            pnl = format!("{pnl:.2}"),
            daily = format!("{:.2}", state.daily_pnl),
            weekly = format!("{:.2}", state.weekly_pnl),
            monthly = format!("{:.2}", state.monthly_pnl),
            balance = format!("{:.2}", state.current_balance),
            consecutive_losses = state.consecutive_losses,
            symbol,
            "trade recorded"
        );

        self.persist(&state);
    }

    /// Whether a specific coin is blocked by its own losing streak.
    pub fn is_symbol_blocked(&self, symbol: &str, max_losses: u32) -> bool {
        let state = self.state.read();
        state
            .per_symbol_losses
            .get(&bare_symbol(symbol))
            .map(|n| *n >= max_losses)
            .unwrap_or(false)
    }

    /// Reset daily counters (scheduler, midnight UTC). Clears an expired
    /// consecutive-loss pause.
    pub fn reset_daily(&self, now_secs: i64) {
        let mut state = self.state.write();
        state.daily_pnl = 0.0;
        if state.pause_until > 0 && now_secs > state.pause_until {
            state.pause_until = 0;
            state.consecutive_losses = 0;
        }
        info!("daily breaker counters reset");
        self.persist(&state);
    }

    /// Reset weekly counters (scheduler, Monday midnight UTC).
    pub fn reset_weekly(&self) {
        let mut state = self.state.write();
        state.weekly_pnl = 0.0;
        info!("weekly breaker counters reset");
        self.persist(&state);
    }

    /// Reset monthly counters (scheduler, 1st of month UTC).
    pub fn reset_monthly(&self) {
        let mut state = self.state.write();
        state.monthly_pnl = 0.0;
        info!("monthly breaker counters reset");
        self.persist(&state);
    }

    /// Resume after a halt. Requires a human decision; comes back at half
    /// size via the next check.
    pub fn manual_resume(&self) {
        let mut state = self.state.write();
        state.halt_time = 0;
        state.pause_until = 0;
        state.consecutive_losses = 0;
        info!("manual resume — breaker cleared");
        self.persist(&state);
    }

    /// Sync the tracked balance from the venue (live mode reconciliation).
    pub fn update_balance(&self, balance: f64) {
        let mut state = self.state.write();
        state.current_balance = balance;
        if balance > state.peak_balance {
            state.peak_balance = balance;
        }
        self.persist(&state);
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    fn persist(&self, state: &BreakerState) {
        let Some(path) = &self.state_path else {
            return;
        };
        if let Err(e) = Self::save_state(path, state) {
            warn!(error = %e, "failed to persist breaker state");
        }
    }

    fn save_state(path: &Path, state: &BreakerState) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content =
            serde_json::to_string_pretty(state).context("failed to serialise breaker state")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write tmp breaker state to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename breaker state to {}", path.display()))?;
        Ok(())
    }

    fn load_state(path: &Path) -> Result<Option<BreakerState>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read breaker state from {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse breaker state from {}", path.display()))?;
        Ok(Some(state))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CircuitBreaker")
            .field("balance", &state.current_balance)
            .field("consecutive_losses", &state.consecutive_losses)
            .field("halted", &(state.halt_time > 0))
            .finish()
    }
}

/// Loss magnitude as a percent of starting capital; 0 when in profit.
fn loss_pct(pnl: f64, capital: f64) -> f64 {
    if pnl >= 0.0 || capital <= 0.0 {
        return 0.0;
    }
    -pnl / capital * 100.0
}

// =============================================================================
// Tests
// =============================================================================
