// =============================================================================
// Regime Classification Module
// =============================================================================
//
// Maps derivatives-market metrics (funding, open interest, long/short
// positioning, liquidations, taker flow) plus price action onto a global
// regime label, a directional bias, and per-symbol trade opportunities.

pub mod classifier;
pub mod derivatives;

pub use classifier::{
    CoinMetrics, FundingArbInfo, MarketSnapshot, Regime, RegimeClassifier, RegimeView,
    SymbolOpportunity,
};
pub use derivatives::DerivativesClient;
