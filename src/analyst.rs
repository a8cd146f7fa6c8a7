// =============================================================================
// Analyst Boundary — contract layer to the external LLM oracle
// =============================================================================
//
// The analyst is an external collaborator that returns a strict-JSON
// directional decision. This module owns the request shape, the transport
// (plain HTTP POST), and — most importantly — validation. An invalid
// decision is rejected silently for the cycle: a failing analyst must never
// corrupt the order manager.
// =============================================================================

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::types::{Direction, TradeSignal, TradeType};
use crate::zone_memory::RevisitPrediction;

/// Stop-distance bands per trade type, in percent of entry.
const SCALP_SL_BAND: (f64, f64) = (0.2, 2.0);
const SWING_SL_BAND: (f64, f64) = (0.5, 5.0);
/// Minimum reward:risk per trade type.
const SCALP_MIN_RR: f64 = 1.0;
const SWING_MIN_RR: f64 = 1.5;

// =============================================================================
// Request
// =============================================================================

/// Condensed view of one timeframe for the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeBrief {
    pub interval: String,
    pub last_close: f64,
    pub ema_9: Option<f64>,
    pub ema_21: Option<f64>,
    pub rsi_14: Option<f64>,
    pub atr_14: Option<f64>,
    /// Structural trend label for the timeframe.
    pub trend: String,
    pub poi_count: usize,
    /// Recent closes, oldest first.
    pub closes: Vec<f64>,
}

/// Everything the analyst sees for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystRequest {
    pub symbol: String,
    pub balance: f64,
    pub open_positions: usize,
    pub regime_label: String,
    pub regime_score: f64,
    pub direction_bias: Option<Direction>,
    /// HTF, MTF, LTF in that order.
    pub timeframes: Vec<TimeframeBrief>,
    pub nearby_zones: Vec<RevisitPrediction>,
    #[serde(default)]
    pub lessons: Vec<String>,
}

// =============================================================================
// Raw response
// =============================================================================

/// The analyst's wire format, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDecision {
    pub action: String,
    #[serde(default)]
    pub conviction: f64,
    #[serde(default)]
    pub entry_price: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit_1: f64,
    #[serde(default)]
    pub take_profit_2: Option<f64>,
    #[serde(default)]
    pub risk_reward: f64,
    #[serde(default)]
    pub trade_type: Option<String>,
    #[serde(default)]
    pub risk_usd: Option<f64>,
    #[serde(default)]
    pub reasoning: Vec<String>,
}

// =============================================================================
// Validation
// =============================================================================

/// Validate a raw decision against the contract. Every rejection names its
/// rule; callers log it and move on — rejection is control flow, not error.
pub fn validate_decision(
    raw: &RawDecision,
    symbol: &str,
    config: &EngineConfig,
) -> Result<TradeSignal, String> {
    let direction = match raw.action.to_uppercase().as_str() {
        "LONG" => Direction::Long,
        "SHORT" => Direction::Short,
        "FLAT" => return Err("action is FLAT".to_string()),
        other => return Err(format!("unknown action '{other}'")),
    };

    if raw.conviction < config.min_conviction {
        return Err(format!(
            "conviction {:.0} below minimum {:.0}",
            raw.conviction, config.min_conviction
        ));
    }

    if raw.entry_price <= 0.0 || raw.stop_loss <= 0.0 || raw.take_profit_1 <= 0.0 {
        return Err("non-positive price field".to_string());
    }

    // Strict ordering: stop < entry < TP1 for longs, reversed for shorts.
    match direction {
        Direction::Long => {
            if !(raw.stop_loss < raw.entry_price && raw.entry_price < raw.take_profit_1) {
                return Err(format!(
                    "LONG ordering violated: stop {} entry {} tp1 {}",
                    raw.stop_loss, raw.entry_price, raw.take_profit_1
                ));
            }
        }
        Direction::Short => {
            if !(raw.stop_loss > raw.entry_price && raw.entry_price > raw.take_profit_1) {
                return Err(format!(
                    "SHORT ordering violated: stop {} entry {} tp1 {}",
                    raw.stop_loss, raw.entry_price, raw.take_profit_1
                ));
            }
        }
    }

    let trade_type = match raw.trade_type.as_deref().map(str::to_lowercase).as_deref() {
        Some("scalp") => TradeType::Scalp,
        _ => TradeType::Swing,
    };

    // Stop distance inside the trade-type band.
    let sl_dist_pct = (raw.stop_loss - raw.entry_price).abs() / raw.entry_price * 100.0;
    let (band_lo, band_hi) = match trade_type {
        TradeType::Scalp => SCALP_SL_BAND,
        TradeType::Swing => SWING_SL_BAND,
    };
    if sl_dist_pct < band_lo || sl_dist_pct > band_hi {
        return Err(format!(
            "{trade_type} stop distance {sl_dist_pct:.2}% outside [{band_lo}, {band_hi}]%"
        ));
    }

    // Minimum reward:risk.
    let min_rr = match trade_type {
        TradeType::Scalp => SCALP_MIN_RR,
        TradeType::Swing => SWING_MIN_RR,
    };
    if raw.risk_reward < min_rr {
        return Err(format!(
            "{trade_type} risk:reward {:.2} below minimum {min_rr}",
            raw.risk_reward
        ));
    }

    // Requested risk clamped into the configured range.
    let risk_usd = raw
        .risk_usd
        .unwrap_or(config.analyst_min_risk_usd)
        .clamp(config.analyst_min_risk_usd, config.analyst_max_risk_usd);

    Ok(TradeSignal {
        symbol: symbol.to_string(),
        direction,
        trade_type,
        entry_price: raw.entry_price,
        stop_loss: raw.stop_loss,
        take_profit_1: raw.take_profit_1,
        take_profit_2: raw.take_profit_2,
        conviction: raw.conviction,
        risk_usd,
        risk_reward: raw.risk_reward,
        reasoning: raw.reasoning.clone(),
    })
}

// =============================================================================
// Transport
// =============================================================================

/// HTTP JSON transport to the analyst endpoint. An empty URL disables the
/// boundary: `analyze` returns `None` and the cycle moves on.
pub struct AnalystClient {
    client: reqwest::Client,
    url: String,
    min_conviction: f64,
}

impl AnalystClient {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .expect("failed to build reqwest client for AnalystClient"),
            url: config.analyst_url.clone(),
            min_conviction: config.min_conviction,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.url.is_empty()
    }

    /// Ask the oracle about one symbol. Transport failures and invalid
    /// decisions both resolve to `Ok(None)`: the cycle continues with the
    /// next symbol either way.
    pub async fn analyze(
        &self,
        request: &AnalystRequest,
        config: &EngineConfig,
    ) -> Result<Option<TradeSignal>> {
        if !self.enabled() {
            return Ok(None);
        }

        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("analyst POST for {}", request.symbol))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .context("failed to read analyst response body")?;
        if !status.is_success() {
            anyhow::bail!("analyst returned {status}: {body}");
        }

        let raw: RawDecision = match serde_json::from_str(&body) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(symbol = %request.symbol, error = %e, "analyst JSON unparseable — rejected");
                return Ok(None);
            }
        };

        match validate_decision(&raw, &request.symbol, config) {
            Ok(signal) => {
                info!(
                    symbol = %signal.symbol,
                    direction = %signal.direction,
                    trade_type = %signal.trade_type,
                    conviction = signal.conviction,
                    entry = signal.entry_price,
                    stop = signal.stop_loss,
                    tp1 = signal.take_profit_1,
                    rr = signal.risk_reward,
                    risk = signal.risk_usd,
                    "analyst signal accepted"
                );
                Ok(Some(signal))
            }
            Err(reason) => {
                debug!(
                    symbol = %request.symbol,
                    min_conviction = self.min_conviction,
                    reason = %reason,
                    "analyst signal rejected"
                );
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for AnalystClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalystClient")
            .field("url", &self.url)
            .field("enabled", &self.enabled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
