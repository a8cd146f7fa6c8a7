// =============================================================================
// Regime Classifier — reads the derivatives tape and fades the crowd
// =============================================================================
//
// Scoring philosophy:
//   - Funding extremes = crowded trade, fade it.
//   - OI building while price drops = trapped longs, short them.
//   - OI flushed + price stable = leverage reset, look for longs.
//   - Liquidation cascades = momentum (or bilateral carnage = manipulation).
//   - L/S ratio extremes = the crowd is wrong, fade them.
//
// Outputs a global regime label + score + direction bias, per-symbol
// opportunities, and a funding-arbitrage table.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::Direction;

// =============================================================================
// Thresholds
// =============================================================================

/// 1%/8h funding = very expensive longs.
const FUNDING_EXTREME_HIGH: f64 = 0.01;
/// -0.5%/8h = shorts paying heavily.
const FUNDING_EXTREME_LOW: f64 = -0.005;
/// 0.5%/8h = notably positive.
const FUNDING_ELEVATED: f64 = 0.005;
/// 60% on one side = crowded.
const LS_CROWDED: f64 = 0.60;
/// 5% OI change in 1h = surge.
const OI_SURGE_THRESH: f64 = 5.0;
/// 70% of liquidations on one side = dominance.
const LIQ_DOMINANCE: f64 = 0.70;
/// Bilateral liquidations above this total flag manipulation.
const MANIPULATION_LIQ_USD: f64 = 50_000_000.0;

/// Minimum |8h funding rate| to flag a funding-arb opportunity (0.02%).
pub const FUNDING_ARB_MIN_RATE: f64 = 0.0002;

// =============================================================================
// Types
// =============================================================================

/// Global market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    StrongBear,
    Bear,
    Neutral,
    Bull,
    StrongBull,
    /// Mean-reverting, no clear direction.
    Choppy,
    /// Bilateral liquidations / OI whipsaw — stand aside.
    Manipulation,
    /// Macro-event volatility.
    News,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StrongBear => "strong_bear",
            Self::Bear => "bear",
            Self::Neutral => "neutral",
            Self::Bull => "bull",
            Self::StrongBull => "strong_bull",
            Self::Choppy => "choppy",
            Self::Manipulation => "manipulation",
            Self::News => "news",
        };
        write!(f, "{s}")
    }
}

/// Per-coin derivatives metrics for one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoinMetrics {
    pub symbol: String,
    pub price: f64,
    /// Current 8h funding rate as a signed fraction (0.0001 = 0.01%).
    pub funding_rate: f64,
    pub oi_usd: f64,
    pub oi_change_1h: f64,
    pub oi_change_4h: f64,
    pub oi_change_24h: f64,
    /// Fraction of accounts long, in [0, 1].
    pub long_ratio: f64,
    pub short_ratio: f64,
    pub liq_long_24h: f64,
    pub liq_short_24h: f64,
    /// Taker buy volume / total taker volume.
    pub taker_buy_ratio: f64,
    pub price_change_1h: f64,
    pub price_change_4h: f64,
    pub price_change_24h: f64,
    pub volume_24h: f64,
}

/// One full universe scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub coins: HashMap<String, CoinMetrics>,
    /// Epoch seconds of the scan.
    pub scan_time: i64,
}

/// A tradeable opportunity surfaced by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolOpportunity {
    pub symbol: String,
    pub direction: Option<Direction>,
    /// 0-100, higher = more confident.
    pub score: f64,
    pub reasons: Vec<String>,

    // Raw signal components, each in [-1, +1] (negative = short).
    pub funding_signal: f64,
    pub oi_signal: f64,
    pub ls_signal: f64,
    pub liq_signal: f64,
    pub momentum_signal: f64,
}

impl SymbolOpportunity {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction: None,
            score: 0.0,
            reasons: Vec::new(),
            funding_signal: 0.0,
            oi_signal: 0.0,
            ls_signal: 0.0,
            liq_signal: 0.0,
            momentum_signal: 0.0,
        }
    }

    /// Only scored, directional opportunities count as tradeable.
    pub fn tradeable(&self) -> bool {
        self.score >= 50.0 && self.direction.is_some()
    }
}

/// Funding-rate arbitrage read for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingArbInfo {
    pub symbol: String,
    pub active: bool,
    /// Which side collects the payment. Negative funding = longs collect.
    pub collect_side: Option<Direction>,
    pub rate_8h: f64,
    pub daily_income_est: f64,
    pub annualized_pct: f64,
}

/// The classifier's full output; replaced atomically each scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimeView {
    pub regime: Option<Regime>,
    /// 0 = max bear, 100 = max bull.
    pub global_score: f64,
    pub direction_bias: Option<Direction>,
    pub opportunities: Vec<SymbolOpportunity>,
    pub top_long: Option<String>,
    pub top_short: Option<String>,
    pub funding_arbs: HashMap<String, FundingArbInfo>,
    pub scan_time: i64,
}

impl RegimeView {
    /// Opportunity score for a symbol, 0.0 when unscored.
    pub fn score_for(&self, symbol: &str) -> f64 {
        self.opportunities
            .iter()
            .find(|o| o.symbol == symbol)
            .map(|o| o.score)
            .unwrap_or(0.0)
    }

    pub fn regime_label(&self) -> String {
        self.regime.map(|r| r.to_string()).unwrap_or_else(|| "neutral".to_string())
    }
}

// =============================================================================
// RegimeClassifier
// =============================================================================

/// Stateless classifier over a market snapshot. The reference coin (BTC)
/// drives the global regime; every coin is scored individually.
#[derive(Debug, Default)]
pub struct RegimeClassifier;

impl RegimeClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Analyse a snapshot and produce the full regime view.
    pub fn analyze(&self, snapshot: &MarketSnapshot) -> RegimeView {
        let mut view = RegimeView {
            scan_time: snapshot.scan_time,
            global_score: 50.0,
            ..Default::default()
        };

        if snapshot.coins.is_empty() {
            warn!("empty market snapshot — staying neutral");
            return view;
        }

        // Global regime is read off the reference coin: BTC leads.
        let btc = snapshot.coins.get("BTC");
        if let Some(btc) = btc {
            view.global_score = global_score(btc);

            if let Some(special) = detect_special_regime(btc) {
                view.regime = Some(special);
                view.direction_bias = match special {
                    Regime::News => {
                        if view.global_score < 35.0 {
                            Some(Direction::Short)
                        } else if view.global_score > 65.0 {
                            Some(Direction::Long)
                        } else {
                            None
                        }
                    }
                    _ => None, // choppy / manipulation: stand aside
                };
            } else {
                view.regime = Some(score_to_regime(view.global_score));
                view.direction_bias = if view.global_score < 40.0 {
                    Some(Direction::Short)
                } else if view.global_score > 60.0 {
                    Some(Direction::Long)
                } else {
                    None
                };
            }
        }

        // Score every coin with detailed data; liq-only coins get the
        // reduced-confidence path.
        for coin in snapshot.coins.values() {
            if has_detailed_data(coin) {
                let opp = self.score_symbol(coin);
                if opp.tradeable() {
                    view.opportunities.push(opp);
                }
            } else if has_liq_data(coin) {
                if let Some(opp) = score_liq_only(coin, view.direction_bias) {
                    if opp.tradeable() {
                        view.opportunities.push(opp);
                    }
                }
            }
        }

        // Counter-trend protection at the global level: never bias short
        // into a hard rally or long into a dump.
        if let Some(btc) = btc {
            if btc.price_change_4h > 3.0 && view.direction_bias == Some(Direction::Short) {
                info!(
                    change_4h = btc.price_change_4h,
                    "counter-trend override: global bias SHORT -> NONE"
                );
                view.direction_bias = None;
            } else if btc.price_change_4h < -3.0 && view.direction_bias == Some(Direction::Long) {
                info!(
                    change_4h = btc.price_change_4h,
                    "counter-trend override: global bias LONG -> NONE"
                );
                view.direction_bias = None;
            }
        }

        view.opportunities.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });

        view.top_short = view
            .opportunities
            .iter()
            .find(|o| o.direction == Some(Direction::Short))
            .map(|o| o.symbol.clone());
        view.top_long = view
            .opportunities
            .iter()
            .find(|o| o.direction == Some(Direction::Long))
            .map(|o| o.symbol.clone());

        info!(
            regime = %view.regime_label(),
            score = format!("{:.0}", view.global_score),
            opportunities = view.opportunities.len(),
            top_long = view.top_long.as_deref().unwrap_or("none"),
            top_short = view.top_short.as_deref().unwrap_or("none"),
            "regime scan complete"
        );

        view
    }

    /// Funding-arb read: negative funding means longs collect.
    pub fn funding_arb_opportunity(
        &self,
        symbol: &str,
        rate_8h: f64,
        notional: f64,
        min_rate: f64,
    ) -> FundingArbInfo {
        let mut info = FundingArbInfo {
            symbol: symbol.to_string(),
            rate_8h,
            ..Default::default()
        };

        if rate_8h.abs() < min_rate {
            return info;
        }

        info.collect_side = Some(if rate_8h < 0.0 {
            Direction::Long
        } else {
            Direction::Short
        });
        info.active = true;
        info.daily_income_est = rate_8h.abs() * notional * 3.0;
        info.annualized_pct = rate_8h.abs() * 3.0 * 365.0 * 100.0;

        debug!(
            symbol,
            collect = %info.collect_side.unwrap(),
            rate_pct_8h = format!("{:.4}", rate_8h * 100.0),
            daily = format!("{:.2}", info.daily_income_est),
            annualized = format!("{:.1}", info.annualized_pct),
            "funding arb detected"
        );
        info
    }

    // -------------------------------------------------------------------------
    // Per-symbol scoring
    // -------------------------------------------------------------------------

    fn score_symbol(&self, coin: &CoinMetrics) -> SymbolOpportunity {
        let mut opp = SymbolOpportunity::new(&coin.symbol);

        opp.funding_signal = funding_score(coin);
        opp.oi_signal = oi_score(coin);
        opp.ls_signal = ls_score(coin);
        opp.liq_signal = liq_score(coin);
        opp.momentum_signal = momentum_score(coin);

        // Momentum carries the largest weight so contrarian components
        // cannot talk us into shorting a rally on their own.
        let mut composite = opp.momentum_signal * 0.25
            + opp.funding_signal * 0.25
            + opp.oi_signal * 0.20
            + opp.ls_signal * 0.15
            + opp.liq_signal * 0.15;

        // Counter-trend protection per symbol.
        if composite < -0.2 && coin.price_change_4h > 2.0 {
            if coin.price_change_4h > 4.0 {
                opp.reasons.push(format!(
                    "counter-trend block: SHORT blocked during +{:.1}% rally",
                    coin.price_change_4h
                ));
                return opp; // direction stays None, score 0
            }
            composite *= 0.3;
            opp.reasons.push(format!(
                "counter-trend dampen: SHORT reduced during +{:.1}% rally",
                coin.price_change_4h
            ));
        }
        if composite > 0.2 && coin.price_change_4h < -2.0 {
            if coin.price_change_4h < -4.0 {
                opp.reasons.push(format!(
                    "counter-trend block: LONG blocked during {:.1}% dump",
                    coin.price_change_4h
                ));
                return opp;
            }
            composite *= 0.3;
            opp.reasons.push(format!(
                "counter-trend dampen: LONG reduced during {:.1}% dump",
                coin.price_change_4h
            ));
        }

        if composite < -0.2 {
            opp.direction = Some(Direction::Short);
            opp.score = (composite.abs() * 100.0).min(100.0);
        } else if composite > 0.2 {
            opp.direction = Some(Direction::Long);
            opp.score = (composite.abs() * 100.0).min(100.0);
        }

        // Human-readable reasons for the stronger components.
        if opp.funding_signal.abs() > 0.3 {
            let label = if coin.funding_rate.abs() > FUNDING_EXTREME_HIGH {
                "extreme"
            } else {
                "elevated"
            };
            opp.reasons.push(format!("funding {label}: {:.4}", coin.funding_rate));
        }
        if opp.oi_signal.abs() > 0.3 {
            opp.reasons.push(format!("OI 1h change: {:+.1}%", coin.oi_change_1h));
        }
        if opp.ls_signal.abs() > 0.3 {
            opp.reasons.push(format!(
                "L/S: {:.0}%L/{:.0}%S",
                coin.long_ratio * 100.0,
                coin.short_ratio * 100.0
            ));
        }
        if opp.liq_signal.abs() > 0.3 {
            opp.reasons.push(format!(
                "liq 24h: ${:.1}M long / ${:.1}M short",
                coin.liq_long_24h / 1e6,
                coin.liq_short_24h / 1e6
            ));
        }

        opp
    }
}

// =============================================================================
// Global scoring
// =============================================================================

/// Global regime score from the reference coin. 0 = max bear, 100 = max bull.
fn global_score(btc: &CoinMetrics) -> f64 {
    let mut score: f64 = 50.0;

    // Funding rate (-15 to +15). Positive funding is bearish: fade the
    // crowded longs.
    if btc.funding_rate > FUNDING_EXTREME_HIGH {
        score -= 15.0;
    } else if btc.funding_rate > FUNDING_ELEVATED {
        score -= 8.0;
    } else if btc.funding_rate < FUNDING_EXTREME_LOW {
        score += 12.0;
    } else if btc.funding_rate < -0.001 {
        score += 5.0;
    }

    // OI structure (-15 to +15).
    if btc.oi_change_1h > OI_SURGE_THRESH && btc.price_change_1h < -1.0 {
        score -= 15.0; // OI up + price down = trapped longs
    } else if btc.oi_change_1h > OI_SURGE_THRESH && btc.price_change_1h > 1.0 {
        score += 10.0; // healthy trend
    } else if btc.oi_change_1h < -OI_SURGE_THRESH {
        score += 5.0; // leverage flushed
    }

    // L/S positioning (-10 to +10).
    if btc.long_ratio > LS_CROWDED {
        score -= 10.0;
    } else if btc.short_ratio > LS_CROWDED {
        score += 10.0;
    }

    // Liquidation flow (-10 to +10).
    let total_liq = btc.liq_long_24h + btc.liq_short_24h;
    if total_liq > 0.0 {
        let long_pct = btc.liq_long_24h / total_liq;
        if long_pct > LIQ_DOMINANCE {
            score -= 10.0;
        } else if long_pct < 1.0 - LIQ_DOMINANCE {
            score += 8.0;
        }
    }

    // 24h price momentum (-20 to +20) — doubled weight so the score
    // respects actual price action.
    if btc.price_change_24h < -5.0 {
        score -= 20.0;
    } else if btc.price_change_24h < -2.0 {
        score -= 10.0;
    } else if btc.price_change_24h > 5.0 {
        score += 20.0;
    } else if btc.price_change_24h > 2.0 {
        score += 10.0;
    }

    // Short-term momentum agreement (-8 to +8).
    if btc.price_change_1h > 0.5 && btc.price_change_4h > 1.0 {
        score += 8.0;
    } else if btc.price_change_1h < -0.5 && btc.price_change_4h < -1.0 {
        score -= 8.0;
    }

    score.clamp(0.0, 100.0)
}

/// CHOPPY / MANIPULATION / NEWS detection; takes precedence over the
/// score-based label.
fn detect_special_regime(btc: &CoinMetrics) -> Option<Regime> {
    // MANIPULATION: both sides getting liquidated at scale.
    let total_liq = btc.liq_long_24h + btc.liq_short_24h;
    if total_liq > 0.0 {
        let liq_balance = (btc.liq_long_24h - btc.liq_short_24h).abs() / total_liq;
        if liq_balance < 0.3 && total_liq > MANIPULATION_LIQ_USD {
            info!(
                total_liq_m = format!("{:.0}", total_liq / 1e6),
                "manipulation regime: bilateral liquidations"
            );
            return Some(Regime::Manipulation);
        }
    }

    // Rapid OI whipsaw.
    if btc.oi_change_1h.abs() > 10.0 {
        info!(oi_1h = btc.oi_change_1h, "manipulation regime: OI whipsaw");
        return Some(Regime::Manipulation);
    }

    // NEWS: extreme price moves in a short window.
    if btc.price_change_4h.abs() > 5.0 || btc.price_change_1h.abs() > 3.0 {
        info!(
            change_4h = btc.price_change_4h,
            change_1h = btc.price_change_1h,
            "news regime: outsized short-term move"
        );
        return Some(Regime::News);
    }

    // CHOPPY: flat everything.
    let flat_price = btc.price_change_4h.abs() < 0.5 && btc.price_change_1h.abs() < 0.3;
    let flat_funding = btc.funding_rate.abs() < 0.002;
    let balanced_ls = (0.45..=0.55).contains(&btc.long_ratio);
    let flat_oi = btc.oi_change_1h.abs() < 1.5;
    if flat_price && flat_funding && balanced_ls && flat_oi {
        info!("choppy regime: flat price, balanced L/S, stable OI");
        return Some(Regime::Choppy);
    }

    None
}

fn score_to_regime(score: f64) -> Regime {
    if score <= 20.0 {
        Regime::StrongBear
    } else if score <= 40.0 {
        Regime::Bear
    } else if score <= 60.0 {
        Regime::Neutral
    } else if score <= 80.0 {
        Regime::Bull
    } else {
        Regime::StrongBull
    }
}

fn has_detailed_data(coin: &CoinMetrics) -> bool {
    coin.funding_rate != 0.0 || coin.oi_usd > 0.0 || coin.long_ratio != 0.5
}

fn has_liq_data(coin: &CoinMetrics) -> bool {
    coin.liq_long_24h + coin.liq_short_24h > 0.0
}

/// Reduced-confidence scoring from liquidation flow alone (bulk-scan coins
/// without detailed metrics). Score tops out at 70 and must align with the
/// global bias.
fn score_liq_only(coin: &CoinMetrics, bias: Option<Direction>) -> Option<SymbolOpportunity> {
    let total = coin.liq_long_24h + coin.liq_short_24h;
    if total < 1_000_000.0 {
        return None;
    }

    // Positive balance = shorts getting liquidated = price going up.
    let liq_balance = (coin.liq_short_24h - coin.liq_long_24h) / total;
    if liq_balance.abs() < 0.50 {
        return None;
    }

    let liq_direction = if liq_balance > 0.0 {
        Direction::Long
    } else {
        Direction::Short
    };

    if let Some(b) = bias {
        if b != liq_direction {
            return None;
        }
    }

    let base_score = liq_balance.abs() * 70.0;
    let vol_bonus = (total / 10_000_000.0 * 5.0).min(10.0);
    let score = (base_score + vol_bonus).min(70.0);

    let mut opp = SymbolOpportunity::new(&coin.symbol);
    opp.direction = Some(liq_direction);
    opp.liq_signal = liq_balance;
    opp.score = score;
    opp.reasons.push(format!(
        "liq-only: {} (imbalance {:.0}%, vol ${:.1}M)",
        liq_direction,
        liq_balance.abs() * 100.0,
        total / 1e6
    ));
    Some(opp)
}

// =============================================================================
// Component signals, each in [-1, +1]
// =============================================================================

/// Positive funding = short signal (fade the longs).
fn funding_score(coin: &CoinMetrics) -> f64 {
    let fr = coin.funding_rate;
    if fr > FUNDING_EXTREME_HIGH {
        -0.9
    } else if fr > FUNDING_ELEVATED {
        -0.5
    } else if fr > 0.002 {
        -0.2
    } else if fr < FUNDING_EXTREME_LOW {
        0.8
    } else if fr < -0.002 {
        0.4
    } else {
        0.0
    }
}

/// OI up + price down = trapped longs (short).
fn oi_score(coin: &CoinMetrics) -> f64 {
    let oi_1h = coin.oi_change_1h;
    let price_1h = coin.price_change_1h;

    if oi_1h > OI_SURGE_THRESH && price_1h < -1.0 {
        -0.8
    } else if oi_1h > OI_SURGE_THRESH && price_1h > 1.0 {
        0.3
    } else if oi_1h < -OI_SURGE_THRESH {
        0.2
    } else if oi_1h > 3.0 && price_1h < 0.0 {
        -0.4
    } else {
        0.0
    }
}

/// The crowd is usually wrong; fade crowded positioning.
fn ls_score(coin: &CoinMetrics) -> f64 {
    if coin.long_ratio > 0.65 {
        -0.7
    } else if coin.long_ratio > LS_CROWDED {
        -0.4
    } else if coin.short_ratio > 0.65 {
        0.6
    } else if coin.short_ratio > LS_CROWDED {
        0.3
    } else {
        0.0
    }
}

fn liq_score(coin: &CoinMetrics) -> f64 {
    let total = coin.liq_long_24h + coin.liq_short_24h;
    if total <= 0.0 {
        return 0.0;
    }
    let long_pct = coin.liq_long_24h / total;
    if long_pct > 0.80 {
        -0.6
    } else if long_pct > LIQ_DOMINANCE {
        -0.3
    } else if long_pct < 0.20 {
        0.5
    } else if long_pct < 1.0 - LIQ_DOMINANCE {
        0.2
    } else {
        0.0
    }
}

/// 4h momentum, confirmed or contradicted by the 1h.
fn momentum_score(coin: &CoinMetrics) -> f64 {
    let p4h = coin.price_change_4h;
    let p1h = coin.price_change_1h;

    let mut base: f64 = if p4h < -5.0 {
        -0.8
    } else if p4h < -2.0 {
        -0.4
    } else if p4h > 5.0 {
        0.8
    } else if p4h > 2.0 {
        0.4
    } else {
        0.0
    };

    if p1h > 0.5 && base > 0.0 {
        base = (base + 0.2).min(1.0);
    } else if p1h < -0.5 && base < 0.0 {
        base = (base - 0.2).max(-1.0);
    } else if p1h > 0.5 && base < -0.2 {
        base *= 0.5;
    } else if p1h < -0.5 && base > 0.2 {
        base *= 0.5;
    }

    base
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> CoinMetrics {
        CoinMetrics {
            symbol: "BTC".to_string(),
            price: 60_000.0,
            long_ratio: 0.5,
            short_ratio: 0.5,
            ..Default::default()
        }
    }

    fn snapshot_with(coins: Vec<CoinMetrics>) -> MarketSnapshot {
        let mut map = HashMap::new();
        for c in coins {
            map.insert(c.symbol.clone(), c);
        }
        MarketSnapshot {
            coins: map,
            scan_time: 1_700_000_000,
        }
    }

    #[test]
    fn empty_snapshot_stays_neutral() {
        let view = RegimeClassifier::new().analyze(&MarketSnapshot::default());
        assert!(view.regime.is_none());
        assert!(view.direction_bias.is_none());
        assert!(view.opportunities.is_empty());
    }

    #[test]
    fn neutral_metrics_score_fifty() {
        let mut coin = btc();
        // Avoid the choppy detector: give it a mild 4h move.
        coin.price_change_4h = 1.0;
        assert!((global_score(&coin) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn extreme_positive_funding_is_bearish() {
        let mut coin = btc();
        coin.funding_rate = 0.02; // 2%/8h — absurdly crowded longs
        coin.price_change_4h = 1.0;
        assert!(global_score(&coin) < 50.0);
    }

    #[test]
    fn rally_with_negative_funding_scores_bullish() {
        let mut coin = btc();
        coin.funding_rate = -0.006;
        coin.price_change_24h = 6.0;
        coin.price_change_4h = 2.0;
        coin.price_change_1h = 1.0;
        let score = global_score(&coin);
        assert!(score > 70.0, "expected strongly bullish, got {score}");
    }

    #[test]
    fn score_to_regime_bands() {
        assert_eq!(score_to_regime(10.0), Regime::StrongBear);
        assert_eq!(score_to_regime(35.0), Regime::Bear);
        assert_eq!(score_to_regime(50.0), Regime::Neutral);
        assert_eq!(score_to_regime(70.0), Regime::Bull);
        assert_eq!(score_to_regime(90.0), Regime::StrongBull);
    }

    #[test]
    fn manipulation_on_bilateral_liquidations() {
        let mut coin = btc();
        coin.liq_long_24h = 40_000_000.0;
        coin.liq_short_24h = 35_000_000.0; // imbalance ~7% < 30%, total $75M
        assert_eq!(detect_special_regime(&coin), Some(Regime::Manipulation));
    }

    #[test]
    fn manipulation_on_oi_whipsaw() {
        let mut coin = btc();
        coin.oi_change_1h = 12.0;
        assert_eq!(detect_special_regime(&coin), Some(Regime::Manipulation));
    }

    #[test]
    fn news_on_price_shock() {
        let mut coin = btc();
        coin.price_change_4h = 6.0;
        assert_eq!(detect_special_regime(&coin), Some(Regime::News));

        let mut coin = btc();
        coin.price_change_1h = -3.5;
        assert_eq!(detect_special_regime(&coin), Some(Regime::News));
    }

    #[test]
    fn choppy_on_flat_everything() {
        let coin = btc(); // all changes zero, L/S balanced, funding zero
        assert_eq!(detect_special_regime(&coin), Some(Regime::Choppy));
    }

    #[test]
    fn special_regime_clears_bias() {
        let mut coin = btc();
        coin.liq_long_24h = 40_000_000.0;
        coin.liq_short_24h = 35_000_000.0;
        coin.funding_rate = 0.02; // would otherwise push bearish

        let view = RegimeClassifier::new().analyze(&snapshot_with(vec![coin]));
        assert_eq!(view.regime, Some(Regime::Manipulation));
        assert!(view.direction_bias.is_none());
    }

    #[test]
    fn counter_trend_override_blocks_short_into_rally() {
        // Contrarian signals scream short, but price is up 5% in 4h.
        let mut coin = btc();
        coin.symbol = "SOL".to_string();
        coin.funding_rate = 0.02;
        coin.long_ratio = 0.70;
        coin.short_ratio = 0.30;
        coin.price_change_4h = 5.0;
        coin.oi_usd = 1.0e9;

        let opp = RegimeClassifier::new().score_symbol(&coin);
        assert!(opp.direction.is_none(), "short must be blocked: {opp:?}");
        assert_eq!(opp.score, 0.0);
        assert!(opp.reasons.iter().any(|r| r.contains("counter-trend block")));
    }

    #[test]
    fn crowded_longs_rolling_over_scores_short() {
        let mut coin = btc();
        coin.symbol = "DOGE".to_string();
        coin.funding_rate = 0.02;
        coin.long_ratio = 0.70;
        coin.short_ratio = 0.30;
        coin.oi_change_1h = 6.0;
        coin.price_change_1h = -1.5;
        coin.price_change_4h = -2.5;
        coin.oi_usd = 5.0e8;

        let opp = RegimeClassifier::new().score_symbol(&coin);
        assert_eq!(opp.direction, Some(Direction::Short));
        assert!(opp.score >= 50.0, "expected tradeable short, got {}", opp.score);
        assert!(opp.tradeable());
    }

    #[test]
    fn funding_arb_sign_convention() {
        let classifier = RegimeClassifier::new();

        // Negative funding: longs collect.
        let info = classifier.funding_arb_opportunity("BTC", -0.0005, 1000.0, FUNDING_ARB_MIN_RATE);
        assert!(info.active);
        assert_eq!(info.collect_side, Some(Direction::Long));
        assert!((info.daily_income_est - 0.0005 * 1000.0 * 3.0).abs() < 1e-9);
        assert!((info.annualized_pct - 0.0005 * 3.0 * 365.0 * 100.0).abs() < 1e-9);

        // Positive funding: shorts collect.
        let info = classifier.funding_arb_opportunity("ETH", 0.0004, 1000.0, FUNDING_ARB_MIN_RATE);
        assert!(info.active);
        assert_eq!(info.collect_side, Some(Direction::Short));

        // Below the threshold: inactive.
        let info = classifier.funding_arb_opportunity("XRP", 0.0001, 1000.0, FUNDING_ARB_MIN_RATE);
        assert!(!info.active);
        assert!(info.collect_side.is_none());
    }

    #[test]
    fn liq_only_scoring_respects_bias() {
        let mut coin = CoinMetrics {
            symbol: "PEPE".to_string(),
            liq_long_24h: 9_000_000.0,
            liq_short_24h: 1_000_000.0, // longs rekt -> bearish
            long_ratio: 0.5,
            short_ratio: 0.5,
            ..Default::default()
        };

        // Aligned with a short bias: scored.
        let opp = score_liq_only(&coin, Some(Direction::Short)).unwrap();
        assert_eq!(opp.direction, Some(Direction::Short));
        assert!(opp.score >= 50.0);
        assert!(opp.score <= 70.0);

        // Against a long bias: dropped.
        assert!(score_liq_only(&coin, Some(Direction::Long)).is_none());

        // Too small to matter.
        coin.liq_long_24h = 500_000.0;
        coin.liq_short_24h = 100_000.0;
        assert!(score_liq_only(&coin, None).is_none());
    }

    #[test]
    fn opportunities_sorted_and_tops_tracked() {
        let mut short_coin = btc();
        short_coin.symbol = "DOGE".to_string();
        short_coin.funding_rate = 0.02;
        short_coin.long_ratio = 0.70;
        short_coin.short_ratio = 0.30;
        short_coin.oi_change_1h = 6.0;
        short_coin.price_change_1h = -1.5;
        short_coin.price_change_4h = -2.5;
        short_coin.oi_usd = 5.0e8;

        let mut long_coin = btc();
        long_coin.symbol = "SOL".to_string();
        long_coin.funding_rate = -0.007;
        long_coin.short_ratio = 0.70;
        long_coin.long_ratio = 0.30;
        long_coin.price_change_4h = 5.5;
        long_coin.price_change_1h = 1.0;
        long_coin.oi_usd = 1.0e9;

        let mut reference = btc();
        reference.price_change_4h = 1.0; // keep out of choppy

        let view =
            RegimeClassifier::new().analyze(&snapshot_with(vec![reference, short_coin, long_coin]));
        assert_eq!(view.top_short.as_deref(), Some("DOGE"));
        assert_eq!(view.top_long.as_deref(), Some("SOL"));
        // Sorted descending.
        for pair in view.opportunities.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
