// =============================================================================
// Engine Configuration — immutable settings with atomic save
// =============================================================================
//
// Every tunable parameter of the Borealis engine lives here. The config is
// loaded once at startup and handed to components by value or reference; it
// is never mutated at runtime. Runtime adaptation goes through the separate
// CalibrationState, owned by the weekly calibration review and read via a
// thread-safe snapshot.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
        "DOGEUSDT".to_string(),
    ]
}

fn default_starting_capital() -> f64 {
    1000.0
}

fn default_risk_per_trade_usd() -> f64 {
    25.0
}

fn default_risk_per_trade_pct() -> f64 {
    3.25
}

fn default_max_leverage() -> u32 {
    50
}

fn default_leverage() -> u32 {
    10
}

fn default_max_exposure_pct() -> f64 {
    50.0
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_weekly_loss_pct() -> f64 {
    6.0
}

fn default_max_monthly_dd_pct() -> f64 {
    15.0
}

fn default_max_total_dd_pct() -> f64 {
    25.0
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_pause_hours_after_losses() -> f64 {
    4.0
}

fn default_max_open_positions() -> u32 {
    2
}

fn default_class_max_positions() -> u32 {
    2
}

fn default_max_same_direction() -> u32 {
    4
}

fn default_portfolio_max_heat_pct() -> f64 {
    10.0
}

fn default_coin_blacklist_after_losses() -> u32 {
    3
}

fn default_notional_cap_major() -> f64 {
    1000.0
}

fn default_notional_cap_mid() -> f64 {
    600.0
}

fn default_notional_cap_alt() -> f64 {
    400.0
}

fn default_trail_atr_multiplier() -> f64 {
    1.5
}

fn default_trail_breakeven_r() -> f64 {
    1.0
}

fn default_trail_activate_r() -> f64 {
    2.0
}

fn default_partial_early_pct() -> f64 {
    0.25
}

fn default_partial_early_r() -> f64 {
    1.0
}

fn default_partial_tp1_pct() -> f64 {
    0.25
}

fn default_partial_tp1_r() -> f64 {
    1.5
}

fn default_partial_tp2_pct() -> f64 {
    0.30
}

fn default_partial_tp2_r() -> f64 {
    2.5
}

fn default_partial_tp3_r() -> f64 {
    4.0
}

fn default_max_stale_hours() -> f64 {
    12.0
}

fn default_stale_threshold_r() -> f64 {
    0.3
}

fn default_exit_regime_chop_mult() -> f64 {
    0.7
}

fn default_exit_regime_trend_mult() -> f64 {
    1.5
}

fn default_cycle_seconds() -> u64 {
    300
}

fn default_scalp_cycle_seconds() -> u64 {
    30
}

fn default_macro_poll_seconds() -> u64 {
    600
}

fn default_derivatives_poll_seconds() -> u64 {
    180
}

fn default_status_write_seconds() -> u64 {
    60
}

fn default_health_report_seconds() -> u64 {
    1800
}

fn default_min_conviction() -> f64 {
    50.0
}

fn default_analyst_min_risk_usd() -> f64 {
    5.0
}

fn default_analyst_max_risk_usd() -> f64 {
    50.0
}

fn default_paper_fee_rate() -> f64 {
    0.0017
}

fn default_limit_order_ttl_seconds() -> u64 {
    7200
}

fn default_scaled_entry_tranches() -> u32 {
    3
}

fn default_scaled_entry_spread_pct() -> f64 {
    0.3
}

fn default_scalp_cooldown_seconds() -> u64 {
    1800
}

fn default_screen_regime_threshold() -> f64 {
    45.0
}

fn default_screen_move_pct() -> f64 {
    1.5
}

fn default_screen_volume_zscore() -> f64 {
    2.0
}

fn default_symbols_per_cycle() -> usize {
    8
}

fn default_tick_queue_capacity() -> usize {
    5000
}

fn default_htf() -> String {
    "1d".to_string()
}

fn default_mtf() -> String {
    "4h".to_string()
}

fn default_ltf() -> String {
    "15m".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_kill_switch_file() -> String {
    "data/kill_switch".to_string()
}

fn default_calibration_utc_weekday() -> u32 {
    0 // Monday
}

fn default_calibration_utc_hour() -> u32 {
    6
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration for the Borealis engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Mode ----------------------------------------------------------------
    /// Paper-fill simulation when true; live venue orders when false.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Subscribe to the venue WS tick feed. When false the exit monitor
    /// runs on REST polling only.
    #[serde(default = "default_true")]
    pub ws_enabled: bool,

    // --- Universe ------------------------------------------------------------
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_starting_capital")]
    pub starting_capital: f64,

    /// High / mid / low timeframes for the multi-timeframe analysis.
    #[serde(default = "default_htf")]
    pub htf: String,
    #[serde(default = "default_mtf")]
    pub mtf: String,
    #[serde(default = "default_ltf")]
    pub ltf: String,

    // --- Risk per trade ------------------------------------------------------
    #[serde(default = "default_risk_per_trade_usd")]
    pub risk_per_trade_usd: f64,
    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: f64,

    // --- Loss limits ---------------------------------------------------------
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_weekly_loss_pct")]
    pub max_weekly_loss_pct: f64,
    #[serde(default = "default_max_monthly_dd_pct")]
    pub max_monthly_dd_pct: f64,
    #[serde(default = "default_max_total_dd_pct")]
    pub max_total_dd_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_pause_hours_after_losses")]
    pub pause_hours_after_losses: f64,

    // --- Position caps -------------------------------------------------------
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_class_max_positions")]
    pub scalp_max_positions: u32,
    #[serde(default = "default_class_max_positions")]
    pub swing_max_positions: u32,
    #[serde(default = "default_max_same_direction")]
    pub max_same_direction: u32,

    // --- Portfolio guard -----------------------------------------------------
    #[serde(default = "default_portfolio_max_heat_pct")]
    pub portfolio_max_heat_pct: f64,
    #[serde(default = "default_coin_blacklist_after_losses")]
    pub coin_blacklist_after_losses: u32,
    #[serde(default = "default_notional_cap_major")]
    pub notional_cap_major: f64,
    #[serde(default = "default_notional_cap_mid")]
    pub notional_cap_mid: f64,
    #[serde(default = "default_notional_cap_alt")]
    pub notional_cap_alt: f64,

    // --- Exit engine ---------------------------------------------------------
    #[serde(default = "default_trail_atr_multiplier")]
    pub trail_atr_multiplier: f64,
    #[serde(default = "default_trail_breakeven_r")]
    pub trail_breakeven_r: f64,
    #[serde(default = "default_trail_activate_r")]
    pub trail_activate_r: f64,
    #[serde(default = "default_partial_early_pct")]
    pub partial_early_pct: f64,
    #[serde(default = "default_partial_early_r")]
    pub partial_early_r: f64,
    #[serde(default = "default_partial_tp1_pct")]
    pub partial_tp1_pct: f64,
    #[serde(default = "default_partial_tp1_r")]
    pub partial_tp1_r: f64,
    #[serde(default = "default_partial_tp2_pct")]
    pub partial_tp2_pct: f64,
    #[serde(default = "default_partial_tp2_r")]
    pub partial_tp2_r: f64,
    #[serde(default = "default_partial_tp3_r")]
    pub partial_tp3_r: f64,
    #[serde(default = "default_max_stale_hours")]
    pub max_stale_hours: f64,
    #[serde(default = "default_stale_threshold_r")]
    pub stale_threshold_r: f64,
    #[serde(default = "default_exit_regime_chop_mult")]
    pub exit_regime_chop_mult: f64,
    #[serde(default = "default_exit_regime_trend_mult")]
    pub exit_regime_trend_mult: f64,
    /// Stale-exit grace window while collecting funding. 0 disables.
    #[serde(default)]
    pub funding_stale_extension_hours: f64,

    // --- Timing --------------------------------------------------------------
    #[serde(default = "default_cycle_seconds")]
    pub cycle_seconds: u64,
    #[serde(default = "default_scalp_cycle_seconds")]
    pub scalp_cycle_seconds: u64,
    #[serde(default = "default_macro_poll_seconds")]
    pub macro_poll_seconds: u64,
    #[serde(default = "default_derivatives_poll_seconds")]
    pub derivatives_poll_seconds: u64,
    #[serde(default = "default_status_write_seconds")]
    pub status_write_seconds: u64,
    #[serde(default = "default_health_report_seconds")]
    pub health_report_seconds: u64,
    #[serde(default = "default_calibration_utc_weekday")]
    pub calibration_utc_weekday: u32,
    #[serde(default = "default_calibration_utc_hour")]
    pub calibration_utc_hour: u32,

    // --- Analyst boundary ----------------------------------------------------
    /// HTTP endpoint of the external analyst oracle. Empty disables it.
    #[serde(default)]
    pub analyst_url: String,
    #[serde(default = "default_min_conviction")]
    pub min_conviction: f64,
    #[serde(default = "default_analyst_min_risk_usd")]
    pub analyst_min_risk_usd: f64,
    #[serde(default = "default_analyst_max_risk_usd")]
    pub analyst_max_risk_usd: f64,

    // --- Orders --------------------------------------------------------------
    /// Round-trip paper fee rate applied to closed notional.
    #[serde(default = "default_paper_fee_rate")]
    pub paper_fee_rate: f64,
    #[serde(default = "default_limit_order_ttl_seconds")]
    pub limit_order_ttl_seconds: u64,
    #[serde(default = "default_scaled_entry_tranches")]
    pub scaled_entry_tranches: u32,
    #[serde(default = "default_scaled_entry_spread_pct")]
    pub scaled_entry_spread_pct: f64,

    // --- Re-entry cooldowns after a losing close -----------------------------
    #[serde(default = "default_scalp_cooldown_seconds")]
    pub symbol_cooldown_seconds_scalp: u64,
    #[serde(default)]
    pub symbol_cooldown_seconds_swing: u64,

    // --- Cycle screening -----------------------------------------------------
    #[serde(default = "default_screen_regime_threshold")]
    pub screen_regime_threshold: f64,
    #[serde(default = "default_screen_move_pct")]
    pub screen_move_pct: f64,
    #[serde(default = "default_screen_volume_zscore")]
    pub screen_volume_zscore: f64,
    #[serde(default = "default_symbols_per_cycle")]
    pub symbols_per_cycle: usize,

    // --- Scheduler plumbing --------------------------------------------------
    #[serde(default = "default_tick_queue_capacity")]
    pub tick_queue_capacity: usize,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Flag file checked at cycle start; existing file suspends new entries.
    #[serde(default = "default_kill_switch_file")]
    pub kill_switch_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialise from defaults")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            dry_run = config.dry_run,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Cooldown for re-entering a symbol after a losing close, by trade type.
    pub fn symbol_cooldown_seconds(&self, trade_type: crate::types::TradeType) -> u64 {
        match trade_type {
            crate::types::TradeType::Scalp => self.symbol_cooldown_seconds_scalp,
            crate::types::TradeType::Swing => self.symbol_cooldown_seconds_swing,
        }
    }
}

// =============================================================================
// CalibrationState
// =============================================================================

/// Output of the weekly calibration review. Owned by the calibrator task;
/// everything else reads an immutable snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Global size multiplier applied on top of breaker/guard sizing.
    pub size_multiplier: f64,
    /// Trades examined in the last review.
    pub reviewed_trades: usize,
    /// Win rate observed in the last review window.
    pub win_rate: f64,
    /// RFC 3339 timestamp of the last review.
    pub reviewed_at: String,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            size_multiplier: 1.0,
            reviewed_trades: 0,
            win_rate: 0.0,
            reviewed_at: String::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeType;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert!(cfg.dry_run);
        assert!(cfg.ws_enabled);
        assert_eq!(cfg.symbols.len(), 5);
        assert!((cfg.risk_per_trade_usd - 25.0).abs() < f64::EPSILON);
        assert!((cfg.risk_per_trade_pct - 3.25).abs() < f64::EPSILON);
        assert_eq!(cfg.max_leverage, 50);
        assert_eq!(cfg.max_open_positions, 2);
        assert_eq!(cfg.max_consecutive_losses, 3);
        assert!((cfg.max_daily_loss_pct - 3.0).abs() < f64::EPSILON);
        assert!((cfg.max_total_dd_pct - 25.0).abs() < f64::EPSILON);
        assert!((cfg.portfolio_max_heat_pct - 10.0).abs() < f64::EPSILON);
        assert!((cfg.trail_atr_multiplier - 1.5).abs() < f64::EPSILON);
        assert!((cfg.partial_tp3_r - 4.0).abs() < f64::EPSILON);
        assert_eq!(cfg.cycle_seconds, 300);
        assert_eq!(cfg.scalp_cycle_seconds, 30);
        assert_eq!(cfg.derivatives_poll_seconds, 180);
        assert!((cfg.min_conviction - 50.0).abs() < f64::EPSILON);
        assert!((cfg.funding_stale_extension_hours - 0.0).abs() < f64::EPSILON);
        assert_eq!(cfg.tick_queue_capacity, 5000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.max_same_direction, 4);
        assert!((cfg.max_stale_hours - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "dry_run": false, "symbols": ["ETHUSDT"], "cycle_seconds": 60 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.dry_run);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.cycle_seconds, 60);
        assert_eq!(cfg.max_open_positions, 2);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.cycle_seconds, cfg2.cycle_seconds);
        assert!((cfg.paper_fee_rate - cfg2.paper_fee_rate).abs() < f64::EPSILON);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = EngineConfig::default();
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, cfg.symbols);
        assert_eq!(loaded.max_leverage, cfg.max_leverage);
    }

    #[test]
    fn cooldown_by_trade_type() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.symbol_cooldown_seconds(TradeType::Scalp), 1800);
        assert_eq!(cfg.symbol_cooldown_seconds(TradeType::Swing), 0);
    }

    #[test]
    fn calibration_default_is_neutral() {
        let cal = CalibrationState::default();
        assert!((cal.size_multiplier - 1.0).abs() < f64::EPSILON);
    }
}
