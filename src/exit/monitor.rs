// =============================================================================
// Exit Monitor Loop — tick-driven evaluation of every open position
// =============================================================================
//
// Consumes mid-price ticks from the bounded bridge and, throttled to one
// evaluation sweep per 2 seconds, runs the exit engine over all open
// positions, applying decisions through the order manager and recording
// closed trades into the circuit breaker, portfolio guard and zone memory.
//
// When the WS feed goes stale (no tick for >30s) the monitor falls back to
// REST price polls at the status-write cadence until ticks resume.
//
// The monitor is the sole mutator of exit states; the trading cycle only
// registers new ones for positions it opens.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::exit::engine::{ExitEngine, ExitState};
use crate::market_data::PriceTick;
use crate::position_book::TradeResult;

/// Minimum seconds between evaluation sweeps.
const EVAL_THROTTLE_SECS: f64 = 2.0;
/// The WS feed counts as stale after this many seconds without a tick.
const WS_STALE_SECS: f64 = 30.0;

/// Shared exit states keyed by position id.
pub type ExitStates = Arc<RwLock<HashMap<String, ExitState>>>;

/// Create a new, empty exit states map.
pub fn new_exit_states() -> ExitStates {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Run the exit monitor until shutdown. Spawn once at engine startup.
pub async fn run_exit_monitor(
    state: Arc<AppState>,
    mut ticks: mpsc::Receiver<PriceTick>,
    exit_states: ExitStates,
    mut shutdown: watch::Receiver<bool>,
) {
    let engine = ExitEngine::from_config(&state.config);
    let mut last_eval: Option<std::time::Instant> = None;
    let mut last_rest_fallback = std::time::Instant::now();

    info!(
        throttle_secs = EVAL_THROTTLE_SECS,
        stale_secs = WS_STALE_SECS,
        "exit monitor started"
    );

    loop {
        tokio::select! {
            maybe_tick = ticks.recv() => {
                match maybe_tick {
                    Some(tick) => {
                        state.last_prices.write().insert(tick.symbol.clone(), tick.mid);
                    }
                    None => {
                        warn!("tick bridge closed — exit monitor degrading to REST polls");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("exit monitor shutting down");
                    return;
                }
            }
            _ = sleep(Duration::from_secs(1)) => {
                // Idle wake-up so staleness detection runs without ticks.
            }
        }

        // REST fallback while the WS is stale.
        let ws_stale = state
            .tick_bridge
            .seconds_since_last_tick()
            .map(|age| age > WS_STALE_SECS)
            .unwrap_or(true);
        if ws_stale
            && last_rest_fallback.elapsed().as_secs() >= state.config.status_write_seconds
        {
            last_rest_fallback = std::time::Instant::now();
            refresh_prices_via_rest(&state).await;
        }

        // Throttled evaluation sweep.
        let due = last_eval
            .map(|t| t.elapsed().as_secs_f64() >= EVAL_THROTTLE_SECS)
            .unwrap_or(true);
        if due {
            last_eval = Some(std::time::Instant::now());
            evaluate_positions(&state, &engine, &exit_states).await;

            // Paper limit orders fill on touched prices from this sweep.
            let prices = state.last_prices.read().clone();
            if !prices.is_empty() {
                let now = chrono::Utc::now().timestamp();
                let filled = state.order_manager.check_pending(&prices, now).await;
                for position_id in filled {
                    if let Some(pos) = state.order_manager.book().get(&position_id) {
                        exit_states.write().insert(
                            position_id,
                            ExitState::new(
                                pos.entry_price,
                                pos.stop_loss,
                                pos.quantity,
                                0.0,
                                pos.entry_time,
                            ),
                        );
                    }
                }
            }
        }
    }
}

/// Poll REST prices for symbols with open positions.
async fn refresh_prices_via_rest(state: &Arc<AppState>) {
    let symbols: Vec<String> = state
        .order_manager
        .book()
        .get_open()
        .into_iter()
        .map(|p| p.symbol)
        .collect();
    if symbols.is_empty() {
        return;
    }

    debug!(count = symbols.len(), "WS stale — refreshing prices via REST");
    for symbol in symbols {
        match state.venue.get_price(&symbol).await {
            Ok(price) => {
                state.last_prices.write().insert(symbol, price);
            }
            Err(e) => {
                state.push_error("price_feed", format!("REST price for {symbol}: {e}"));
            }
        }
    }
}

/// One evaluation sweep over all open positions.
async fn evaluate_positions(state: &Arc<AppState>, engine: &ExitEngine, exit_states: &ExitStates) {
    let open_positions = state.order_manager.book().get_open();
    if open_positions.is_empty() {
        return;
    }

    let now = chrono::Utc::now().timestamp();
    let regime_label = state.regime.read().regime_label();

    for position in open_positions {
        let Some(price) = state.last_prices.read().get(&position.symbol).copied() else {
            continue;
        };
        if price <= 0.0 {
            continue;
        }

        // Evaluate against this position's exit state (registered lazily
        // for positions restored from disk).
        let decisions = {
            let mut states = exit_states.write();
            let exit_state = states.entry(position.id.clone()).or_insert_with(|| {
                ExitState::new(
                    position.entry_price,
                    position.stop_loss,
                    position.quantity,
                    0.0,
                    position.entry_time,
                )
            });
            engine.evaluate(position.direction, exit_state, price, now, &regime_label)
        };

        if decisions.is_empty() {
            continue;
        }
        debug!(
            id = %position.id,
            symbol = %position.symbol,
            price,
            decisions = decisions.len(),
            "exit decisions emitted"
        );

        match state
            .order_manager
            .apply_exit_decisions(&position.id, &decisions, price, now)
            .await
        {
            Ok(Some(result)) => {
                record_closed_trade(state, &result, now);
                exit_states.write().remove(&position.id);
            }
            Ok(None) => {}
            Err(e) => {
                // Book-keeping contradiction: stop the process before it
                // compounds (operator intervention required).
                error!(
                    id = %position.id,
                    error = %e,
                    "invariant violation applying exit decisions — flushing state and exiting"
                );
                state.flush_all();
                std::process::exit(2);
            }
        }
    }
}

/// Fan a closed trade out to the breaker, guard, zone memory and reports.
fn record_closed_trade(state: &Arc<AppState>, result: &TradeResult, now: i64) {
    let net = result.net_pnl();
    state.circuit_breaker.record_trade(net, &result.symbol, now);

    if result.is_win() {
        state.portfolio_guard.record_win(&result.symbol);
    } else {
        state.portfolio_guard.record_loss(&result.symbol, now);
    }

    if let Some(zone_key) = &result.zone_key {
        state.zone_memory.record_hit(zone_key, result.is_win());
    }

    state.append_report("trade", serde_json::to_value(result).unwrap_or_default());

    info!(
        symbol = %result.symbol,
        reason = %result.reason,
        pnl = format!("{net:.2}"),
        r = format!("{:.2}", result.r_multiple),
        "closed trade recorded"
    );
}
