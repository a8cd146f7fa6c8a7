// =============================================================================
// Risk Module
// =============================================================================
//
// Two independent gates protect capital:
//   - CircuitBreaker: multi-level loss limits over time windows, persisted.
//   - PortfolioGuard: portfolio-shape constraints (heat, direction balance,
//     correlation groups, per-coin caps, blacklist).

pub mod circuit_breaker;
pub mod portfolio_guard;

pub use circuit_breaker::{BreakerDecision, BreakerState, CircuitBreaker};
pub use portfolio_guard::{GuardDecision, PortfolioGuard, PortfolioSnapshot};
