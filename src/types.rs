// =============================================================================
// Shared types used across the Borealis trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction for a position or proposed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for longs, -1.0 for shorts. PnL = sign * (exit - entry) * qty.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Structural bias of a pattern or timeframe (distinct from trade direction:
/// a bullish order block is a *support* zone, not an open long).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    /// Map a structural bias to the trade direction it supports.
    pub fn as_direction(self) -> Option<Direction> {
        match self {
            Self::Bullish => Some(Direction::Long),
            Self::Bearish => Some(Direction::Short),
            Self::Neutral => None,
        }
    }
}

impl Default for Bias {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
            Self::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Horizon class of a trade. Scalps and swings run under different
/// stop-distance and R:R bands, and count against separate position caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeType {
    Scalp,
    Swing,
}

impl std::fmt::Display for TradeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalp => write!(f, "scalp"),
            Self::Swing => write!(f, "swing"),
        }
    }
}

/// Whether orders are simulated locally or routed to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineMode {
    Paper,
    Live,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// A validated, executable trade proposal. Produced exclusively by the
/// analyst boundary after validation; consumed once per cycle by the
/// guard → sizer → order manager pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub direction: Direction,
    pub trade_type: TradeType,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    #[serde(default)]
    pub take_profit_2: Option<f64>,
    /// Analyst conviction in [0, 100].
    pub conviction: f64,
    /// Requested risk in USD (already conviction-weighted by the analyst).
    pub risk_usd: f64,
    pub risk_reward: f64,
    #[serde(default)]
    pub reasoning: Vec<String>,
}

/// Strip the quote suffix: "BTCUSDT" -> "BTC". Correlation groups, tiers
/// and blacklists all key on the bare coin.
pub fn bare_symbol(symbol: &str) -> String {
    symbol
        .to_uppercase()
        .trim_end_matches("USDT")
        .trim_end_matches("USD")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_sign_and_opposite() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
        assert_eq!(Direction::Long.opposite(), Direction::Short);
    }

    #[test]
    fn bias_maps_to_direction() {
        assert_eq!(Bias::Bullish.as_direction(), Some(Direction::Long));
        assert_eq!(Bias::Bearish.as_direction(), Some(Direction::Short));
        assert_eq!(Bias::Neutral.as_direction(), None);
    }

    #[test]
    fn bare_symbol_strips_quote() {
        assert_eq!(bare_symbol("BTCUSDT"), "BTC");
        assert_eq!(bare_symbol("ethusd"), "ETH");
        assert_eq!(bare_symbol("SOL"), "SOL");
    }

    #[test]
    fn trade_type_serde_lowercase() {
        let json = serde_json::to_string(&TradeType::Scalp).unwrap();
        assert_eq!(json, "\"scalp\"");
        let t: TradeType = serde_json::from_str("\"swing\"").unwrap();
        assert_eq!(t, TradeType::Swing);
    }
}
