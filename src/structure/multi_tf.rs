// =============================================================================
// Multi-Timeframe Synthesis — HTF bias, MTF zone, LTF trigger
// =============================================================================
//
// Combines three structure reads into one directional signal:
//   - HTF trend sets the bias. Neutral HTF = no trade.
//   - MTF must agree with HTF (or be neutral). Opposing MTF vetoes.
//   - The entry zone is the strongest MTF point of interest within reach of
//     the current price, on the protective side of the trade.
//   - The LTF must show a structure break in the trade direction (trigger).
//
// Confidence accumulates 0.25 per confirmation; the zone's contribution is
// scaled by its strength.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::structure::engine::{MarketStructure, SmcPattern};
use crate::types::{Bias, Direction};

/// Zones further than this from the current price are out of reach.
const MAX_ZONE_DISTANCE_PCT: f64 = 3.0;
/// Stop hint buffer beyond the entry zone edge.
const STOP_BUFFER_PCT: f64 = 0.15;

/// The combined signal for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiTfSignal {
    /// Trade direction, `None` when the timeframes disagree or HTF is flat.
    pub direction: Option<Direction>,
    /// Accumulated confidence in [0, 1].
    pub confidence: f64,
    /// The MTF zone chosen as the entry area, if any qualified.
    pub entry_zone: Option<SmcPattern>,
    /// Whether the LTF printed a matching BOS/CHOCH.
    pub ltf_trigger: bool,
    /// Suggested stop behind the entry zone (0.0 when no zone qualified).
    pub stop_hint: f64,
    /// Suggested first target at 2R from the stop hint (0.0 when no zone).
    pub target_hint: f64,
    pub reasons: Vec<String>,
}

impl MultiTfSignal {
    fn no_trade(reason: String) -> Self {
        Self {
            direction: None,
            confidence: 0.0,
            entry_zone: None,
            ltf_trigger: false,
            stop_hint: 0.0,
            target_hint: 0.0,
            reasons: vec![reason],
        }
    }
}

/// Synthesises HTF / MTF / LTF structure into a tradeable signal.
pub struct MultiTimeframeAnalyzer {
    max_zone_distance_pct: f64,
}

impl Default for MultiTimeframeAnalyzer {
    fn default() -> Self {
        Self {
            max_zone_distance_pct: MAX_ZONE_DISTANCE_PCT,
        }
    }
}

impl MultiTimeframeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyze(
        &self,
        htf: &MarketStructure,
        mtf: &MarketStructure,
        ltf: &MarketStructure,
        current_price: f64,
    ) -> MultiTfSignal {
        if current_price <= 0.0 {
            return MultiTfSignal::no_trade("invalid current price".to_string());
        }

        // ── HTF bias ────────────────────────────────────────────────
        let direction = match htf.trend.as_direction() {
            Some(d) => d,
            None => return MultiTfSignal::no_trade("HTF trend neutral".to_string()),
        };

        // ── MTF agreement ───────────────────────────────────────────
        if mtf.trend != Bias::Neutral && mtf.trend != htf.trend {
            return MultiTfSignal::no_trade(format!(
                "MTF trend {} opposes HTF {}",
                mtf.trend, htf.trend
            ));
        }

        let mut confidence = 0.25; // HTF alignment
        let mut reasons = vec![format!("HTF trend {}", htf.trend)];

        if mtf.trend == htf.trend {
            confidence += 0.25;
            reasons.push(format!("MTF confirms {}", mtf.trend));
        } else {
            reasons.push("MTF neutral — no confirmation".to_string());
        }

        // ── Entry zone from MTF points of interest ──────────────────
        let entry_zone = self.find_entry_zone(mtf, direction, current_price);
        if let Some(zone) = &entry_zone {
            confidence += 0.25 * (zone.strength / 100.0);
            reasons.push(format!(
                "{} zone {:.2}-{:.2} (strength {:.0})",
                zone.kind, zone.bottom, zone.top, zone.strength
            ));
        }

        // ── LTF trigger ─────────────────────────────────────────────
        let want_bias = match direction {
            Direction::Long => Bias::Bullish,
            Direction::Short => Bias::Bearish,
        };
        let ltf_trigger = ltf
            .last_bos
            .as_ref()
            .map(|p| p.bias == want_bias)
            .unwrap_or(false)
            || ltf
                .last_choch
                .as_ref()
                .map(|p| p.bias == want_bias)
                .unwrap_or(false);
        if ltf_trigger {
            confidence += 0.25;
            reasons.push("LTF structure break confirms entry".to_string());
        }

        // ── Stop / target hints from the zone ───────────────────────
        let (stop_hint, target_hint) = match &entry_zone {
            Some(zone) => {
                let stop = match direction {
                    Direction::Long => zone.bottom * (1.0 - STOP_BUFFER_PCT / 100.0),
                    Direction::Short => zone.top * (1.0 + STOP_BUFFER_PCT / 100.0),
                };
                let r = (current_price - stop).abs();
                let target = current_price + direction.sign() * 2.0 * r;
                (stop, target)
            }
            None => (0.0, 0.0),
        };

        debug!(
            direction = %direction,
            confidence = format!("{:.2}", confidence),
            zone = entry_zone.is_some(),
            ltf_trigger,
            "multi-timeframe synthesis"
        );

        MultiTfSignal {
            direction: Some(direction),
            confidence,
            entry_zone,
            ltf_trigger,
            stop_hint,
            target_hint,
            reasons,
        }
    }

    /// Strongest MTF POI within reach and on the protective side: below
    /// price for longs, above for shorts.
    fn find_entry_zone(
        &self,
        mtf: &MarketStructure,
        direction: Direction,
        current_price: f64,
    ) -> Option<SmcPattern> {
        mtf.points_of_interest
            .iter()
            .filter(|poi| {
                let distance_pct = match direction {
                    Direction::Long => (current_price - poi.top) / current_price * 100.0,
                    Direction::Short => (poi.bottom - current_price) / current_price * 100.0,
                };
                distance_pct >= 0.0 && distance_pct <= self.max_zone_distance_pct
            })
            .max_by(|a, b| {
                a.strength
                    .partial_cmp(&b.strength)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
