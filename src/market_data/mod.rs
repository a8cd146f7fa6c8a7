pub mod candle_buffer;
pub mod price_feed;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{resample, Candle, CandleBuffer, CandleKey};
pub use price_feed::{PriceTick, TickBridge};
