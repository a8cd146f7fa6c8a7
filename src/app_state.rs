// =============================================================================
// Central Application State — Borealis Trading Engine
// =============================================================================
//
// The single source of truth wiring the subsystems together. Each engine
// manages its own interior mutability; AppState ties them into one Arc the
// background tasks share, and renders the status snapshot the dashboard
// file consumers read.
//
// Thread safety: parking_lot::RwLock for shared collections, Arc wrappers
// for the subsystem engines.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::config::{CalibrationState, EngineConfig};
use crate::market_data::{CandleBuffer, TickBridge};
use crate::order_manager::OrderManager;
use crate::position_book::{Position, TradeResult};
use crate::regime::classifier::RegimeView;
use crate::regime::DerivativesClient;
use crate::risk::{CircuitBreaker, PortfolioGuard};
use crate::venue::Venue;
use crate::zone_memory::{ZoneMemory, ZoneMemoryStats};

/// Maximum number of recent errors retained for the status file.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub subsystem: String,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: EngineConfig,
    pub calibration: RwLock<CalibrationState>,

    // ── Market data ─────────────────────────────────────────────────────
    pub candle_buffer: Arc<CandleBuffer>,
    pub tick_bridge: TickBridge,
    /// Latest mid-price per symbol, fed by the exit monitor.
    pub last_prices: RwLock<HashMap<String, f64>>,

    // ── Subsystems ──────────────────────────────────────────────────────
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub portfolio_guard: Arc<PortfolioGuard>,
    pub zone_memory: Arc<ZoneMemory>,
    pub order_manager: Arc<OrderManager>,
    pub derivatives: Arc<DerivativesClient>,
    pub venue: Arc<dyn Venue>,

    // ── Regime (replaced atomically each scan) ──────────────────────────
    pub regime: RwLock<RegimeView>,

    // ── Diagnostics ─────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    /// Last error per subsystem, surfaced in the status file.
    pub subsystem_errors: RwLock<HashMap<String, String>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: EngineConfig,
        order_manager: Arc<OrderManager>,
        venue: Arc<dyn Venue>,
        tick_bridge: TickBridge,
    ) -> Self {
        let data_dir = PathBuf::from(&config.data_dir);

        let circuit_breaker = Arc::new(CircuitBreaker::from_config(
            &config,
            Some(data_dir.join("circuit_breaker.json")),
        ));
        let portfolio_guard = Arc::new(PortfolioGuard::from_config(
            &config,
            Some(data_dir.join("portfolio_blacklist.json")),
        ));
        let zone_memory = Arc::new(ZoneMemory::open(data_dir.join("zone_memory.json")));

        Self {
            config,
            calibration: RwLock::new(CalibrationState::default()),
            candle_buffer: Arc::new(CandleBuffer::new(500)),
            tick_bridge,
            last_prices: RwLock::new(HashMap::new()),
            circuit_breaker,
            portfolio_guard,
            zone_memory,
            order_manager,
            derivatives: Arc::new(DerivativesClient::new()),
            venue,
            regime: RwLock::new(RegimeView::default()),
            recent_errors: RwLock::new(Vec::new()),
            subsystem_errors: RwLock::new(HashMap::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Error bookkeeping ───────────────────────────────────────────────

    /// Record a subsystem failure for the status file and the error ring.
    pub fn push_error(&self, subsystem: &str, message: String) {
        let record = ErrorRecord {
            subsystem: subsystem.to_string(),
            message: message.clone(),
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.subsystem_errors
            .write()
            .insert(subsystem.to_string(), message);
    }

    /// Kill switch: a flag file checked at cycle start. When present, new
    /// entries are suspended; venue-side TP/SL triggers keep working.
    pub fn kill_switch_active(&self) -> bool {
        std::path::Path::new(&self.config.kill_switch_file).exists()
    }

    /// Balance for sizing: the venue's number in live mode is synced into
    /// the breaker; paper mode just reads the breaker's ledger (its only
    /// mutator is record_trade).
    pub fn balance(&self) -> f64 {
        self.circuit_breaker.state().current_balance
    }

    // ── Status snapshot ─────────────────────────────────────────────────

    /// Build the status snapshot consumed by the dashboard.
    pub fn build_status(&self) -> StatusSnapshot {
        let breaker = self.circuit_breaker.state();
        let guard = self.portfolio_guard.snapshot();
        let regime = self.regime.read().clone();
        let positions = self.order_manager.book().get_open();
        let recent_trades = self.order_manager.book().recent_closed(20);

        StatusSnapshot {
            at: Utc::now().to_rfc3339(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            mode: self.order_manager.mode().to_string(),
            balance: breaker.current_balance,
            peak_balance: breaker.peak_balance,
            drawdown_pct: breaker.drawdown_pct(),
            daily_pnl: breaker.daily_pnl,
            weekly_pnl: breaker.weekly_pnl,
            monthly_pnl: breaker.monthly_pnl,
            total_pnl: breaker.total_pnl,
            consecutive_losses: breaker.consecutive_losses,
            paused_until: breaker.pause_until,
            halted: breaker.halt_time > 0,
            heat_usd: guard.total_heat_usd,
            heat_pct: guard.total_heat_pct,
            open_positions: positions,
            pending_orders: self.order_manager.pending_orders().len(),
            recent_trades,
            regime_label: regime.regime_label(),
            regime_score: regime.global_score,
            direction_bias: regime.direction_bias.map(|d| d.to_string()),
            opportunity_count: regime.opportunities.len(),
            zone_stats: self.zone_memory.stats(),
            size_multiplier: self.calibration.read().size_multiplier,
            ticks_dropped: self.tick_bridge.dropped_count(),
            subsystem_errors: self.subsystem_errors.read().clone(),
            kill_switch: self.kill_switch_active(),
        }
    }

    /// Write the status snapshot atomically (tmp + rename).
    pub fn write_status(&self) -> Result<()> {
        let path = PathBuf::from(&self.config.data_dir).join("status.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content = serde_json::to_string_pretty(&self.build_status())
            .context("failed to serialise status snapshot")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write tmp status to {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename status to {}", path.display()))?;
        Ok(())
    }

    /// Append one line to the NDJSON report stream (trade results, health
    /// diagnostics, calibration reviews).
    pub fn append_report(&self, kind: &str, payload: serde_json::Value) {
        let path = PathBuf::from(&self.config.data_dir).join("reports.ndjson");
        let line = serde_json::json!({
            "at": Utc::now().to_rfc3339(),
            "kind": kind,
            "payload": payload,
        });

        let result: Result<()> = (|| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            writeln!(file, "{line}").context("failed to append report line")?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(error = %e, "report append failed");
        }
    }

    /// Flush every persistent store (shutdown path).
    pub fn flush_all(&self) {
        if let Err(e) = self.zone_memory.save() {
            warn!(error = %e, "zone memory flush failed");
        }
        self.order_manager.book().persist();
        if let Err(e) = self.write_status() {
            warn!(error = %e, "status flush failed");
        }
    }
}

// =============================================================================
// Status snapshot types
// =============================================================================

/// Human-readable engine status, written to `status.json`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub at: String,
    pub uptime_secs: u64,
    pub mode: String,
    pub balance: f64,
    pub peak_balance: f64,
    pub drawdown_pct: f64,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub monthly_pnl: f64,
    pub total_pnl: f64,
    pub consecutive_losses: u32,
    pub paused_until: i64,
    pub halted: bool,
    pub heat_usd: f64,
    pub heat_pct: f64,
    pub open_positions: Vec<Position>,
    pub pending_orders: usize,
    pub recent_trades: Vec<TradeResult>,
    pub regime_label: String,
    pub regime_score: f64,
    pub direction_bias: Option<String>,
    pub opportunity_count: usize,
    pub zone_stats: ZoneMemoryStats,
    pub size_multiplier: f64,
    pub ticks_dropped: u64,
    pub subsystem_errors: HashMap<String, String>,
    pub kill_switch: bool,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_book::PositionBook;
    use crate::types::EngineMode;
    use crate::venue::{OrderAck, Venue, VenuePosition};
    use async_trait::async_trait;

    struct NullVenue;

    #[async_trait]
    impl Venue for NullVenue {
        async fn get_price(&self, _s: &str) -> Result<f64> {
            anyhow::bail!("offline")
        }
        async fn get_klines(
            &self,
            _s: &str,
            _i: &str,
            _l: u32,
        ) -> Result<Vec<crate::market_data::Candle>> {
            Ok(Vec::new())
        }
        async fn get_balance(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
            Ok(Vec::new())
        }
        async fn place_market_order(
            &self,
            _s: &str,
            _d: crate::types::Direction,
            _q: f64,
            _r: bool,
        ) -> Result<OrderAck> {
            anyhow::bail!("offline")
        }
        async fn place_limit_order(
            &self,
            _s: &str,
            _d: crate::types::Direction,
            _q: f64,
            _p: f64,
        ) -> Result<OrderAck> {
            anyhow::bail!("offline")
        }
        async fn place_tpsl(
            &self,
            _s: &str,
            _d: crate::types::Direction,
            _q: f64,
            _tp: f64,
            _sl: f64,
        ) -> Result<()> {
            Ok(())
        }
        async fn cancel_order(&self, _s: &str, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn bulk_cancel(&self, _s: &str) -> Result<u32> {
            Ok(0)
        }
        async fn set_leverage(&self, _s: &str, _l: u32) -> Result<()> {
            Ok(())
        }
        async fn get_funding_rate(&self, _s: &str) -> Result<f64> {
            Ok(0.0)
        }
    }

    fn state_in(dir: &std::path::Path) -> AppState {
        let mut config = EngineConfig::default();
        config.data_dir = dir.to_string_lossy().to_string();
        config.kill_switch_file = dir.join("kill_switch").to_string_lossy().to_string();

        let venue: Arc<dyn Venue> = Arc::new(NullVenue);
        let order_manager = Arc::new(OrderManager::new(
            EngineMode::Paper,
            venue.clone(),
            PositionBook::new(None),
            config.paper_fee_rate,
        ));
        let (bridge, _rx) = TickBridge::new(16);
        AppState::new(config, order_manager, venue, bridge)
    }

    #[test]
    fn status_snapshot_reflects_breaker_and_regime() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        state.circuit_breaker.record_trade(-20.0, "BTCUSDT", 1_700_000_000);
        let status = state.build_status();
        assert_eq!(status.balance, 980.0);
        assert_eq!(status.consecutive_losses, 1);
        assert_eq!(status.mode, "Paper");
        assert!(!status.kill_switch);
    }

    #[test]
    fn status_file_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        state.write_status().unwrap();

        let content = std::fs::read_to_string(dir.path().join("status.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(parsed["balance"].is_number());
        assert!(parsed["regime_label"].is_string());
    }

    #[test]
    fn kill_switch_follows_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        assert!(!state.kill_switch_active());

        std::fs::write(dir.path().join("kill_switch"), "halt").unwrap();
        assert!(state.kill_switch_active());

        std::fs::remove_file(dir.path().join("kill_switch")).unwrap();
        assert!(!state.kill_switch_active());
    }

    #[test]
    fn reports_append_ndjson_lines() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        state.append_report("health", serde_json::json!({ "ok": true }));
        state.append_report("trade", serde_json::json!({ "pnl": -5.0 }));

        let content = std::fs::read_to_string(dir.path().join("reports.ndjson")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "health");
    }

    #[test]
    fn push_error_tracks_last_per_subsystem() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());

        state.push_error("regime", "scan failed".to_string());
        state.push_error("regime", "scan failed again".to_string());
        state.push_error("venue", "timeout".to_string());

        let errors = state.subsystem_errors.read();
        assert_eq!(errors.get("regime").unwrap(), "scan failed again");
        assert_eq!(errors.len(), 2);
        assert_eq!(state.recent_errors.read().len(), 3);
    }
}
