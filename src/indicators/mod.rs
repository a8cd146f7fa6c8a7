// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicator primitives used by
// the trading engine. Every public function returns `Option<T>` or an empty
// series so callers are forced to handle insufficient-data and numerical
// edge cases.

pub mod atr;
pub mod ema;
pub mod rsi;
pub mod volume;
