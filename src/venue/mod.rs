// =============================================================================
// Venue Abstraction — the exchange behind a trait
// =============================================================================
//
// The core never talks to an exchange directly; everything goes through
// `Venue` so paper simulation, live trading and tests share one seam.

pub mod binance;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::types::Direction;

/// An order acknowledgement from the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price; 0.0 when resting unfilled.
    pub avg_price: f64,
    pub filled_qty: f64,
    pub status: String,
}

impl OrderAck {
    pub fn is_filled(&self) -> bool {
        self.status == "FILLED" && self.filled_qty > 0.0
    }
}

/// A position as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: String,
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

/// The abstract exchange interface. Every call carries the client's fixed
/// request timeout; failures are surfaced as errors for the call site to
/// log and swallow.
#[async_trait]
pub trait Venue: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<f64>;

    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Free collateral in the quote currency.
    async fn get_balance(&self) -> Result<f64>;

    async fn get_positions(&self) -> Result<Vec<VenuePosition>>;

    /// Market order, optionally reduce-only (exit path).
    async fn place_market_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        price: f64,
    ) -> Result<OrderAck>;

    /// Attach reduce-only take-profit and stop-loss trigger orders to an
    /// open position.
    async fn place_tpsl(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        take_profit: f64,
        stop_loss: f64,
    ) -> Result<()>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Cancel all resting orders on a symbol; returns how many went away.
    async fn bulk_cancel(&self, symbol: &str) -> Result<u32>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Current signed 8h funding rate.
    async fn get_funding_rate(&self, symbol: &str) -> Result<f64>;
}
