// =============================================================================
// Borealis Perps Engine — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run (paper) mode unless the config says
// otherwise. SIGINT and SIGTERM both trigger a graceful shutdown: every
// periodic task is cancelled via the watch flag, the WS tasks die with the
// runtime, and all persistent state is flushed before exit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analyst;
mod app_state;
mod config;
mod exit;
mod indicators;
mod market_data;
mod order_manager;
mod position_book;
mod regime;
mod risk;
mod scheduler;
mod sizer;
mod structure;
mod types;
mod venue;
mod zone_memory;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::analyst::AnalystClient;
use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::market_data::price_feed;
use crate::market_data::TickBridge;
use crate::order_manager::OrderManager;
use crate::position_book::PositionBook;
use crate::regime::derivatives;
use crate::types::EngineMode;
use crate::venue::binance::BinanceFuturesClient;
use crate::venue::Venue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Perps Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("engine_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("BOREALIS_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config = EngineConfig {
            symbols: EngineConfig::default().symbols,
            ..config
        };
    }

    let mode = if config.dry_run {
        EngineMode::Paper
    } else {
        EngineMode::Live
    };

    info!(symbols = ?config.symbols, "configured trading pairs");
    info!(
        mode = %mode,
        ws_enabled = config.ws_enabled,
        cycle_seconds = config.cycle_seconds,
        "engine mode"
    );

    // ── 2. Venue client ──────────────────────────────────────────────────
    let api_key = std::env::var("BOREALIS_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BOREALIS_API_SECRET").unwrap_or_default();
    if mode == EngineMode::Live && (api_key.is_empty() || api_secret.is_empty()) {
        anyhow::bail!("live mode requires BOREALIS_API_KEY and BOREALIS_API_SECRET");
    }
    let venue: Arc<dyn Venue> = Arc::new(BinanceFuturesClient::new(api_key, api_secret));

    // ── 3. Shared state ──────────────────────────────────────────────────
    let book_path = match mode {
        EngineMode::Live => Some(PathBuf::from(&config.data_dir).join("live_positions.json")),
        EngineMode::Paper => None,
    };
    let order_manager = Arc::new(OrderManager::new(
        mode,
        venue.clone(),
        PositionBook::new(book_path),
        config.paper_fee_rate,
    ));

    let (tick_bridge, tick_rx) = TickBridge::new(config.tick_queue_capacity);
    let state = Arc::new(AppState::new(
        config.clone(),
        order_manager,
        venue,
        tick_bridge.clone(),
    ));

    let exit_states = exit::monitor::new_exit_states();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Market data streams ───────────────────────────────────────────
    if config.ws_enabled {
        let symbols = config.symbols.clone();
        let bridge = tick_bridge.clone();
        let mut ws_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = price_feed::run_tick_stream(&symbols, &bridge) => {
                        if let Err(e) = result {
                            error!(error = %e, "tick stream error — reconnecting in 5s");
                        }
                    }
                    _ = ws_shutdown.changed() => {
                        if *ws_shutdown.borrow() {
                            return;
                        }
                    }
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Liquidation flow feeds the regime classifier's manipulation read.
        let liq_state = state.clone();
        let mut liq_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = derivatives::run_liquidation_stream(&liq_state.derivatives) => {
                        if let Err(e) = result {
                            error!(error = %e, "liquidation stream error — reconnecting in 5s");
                        }
                    }
                    _ = liq_shutdown.changed() => {
                        if *liq_shutdown.borrow() {
                            return;
                        }
                    }
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        info!(count = config.symbols.len(), "market data streams launched");
    }

    // ── 5. Exit monitor ──────────────────────────────────────────────────
    tokio::spawn(exit::monitor::run_exit_monitor(
        state.clone(),
        tick_rx,
        exit_states.clone(),
        shutdown_rx.clone(),
    ));

    // ── 6. Periodic loops ────────────────────────────────────────────────
    let analyst = Arc::new(AnalystClient::from_config(&config));
    if !analyst.enabled() {
        warn!("analyst endpoint not configured — the engine will scan but never enter");
    }

    tokio::spawn(scheduler::run_trading_cycle_loop(
        state.clone(),
        analyst,
        exit_states.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_regime_refresh_loop(
        state.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_reset_loop(state.clone(), shutdown_rx.clone()));
    tokio::spawn(scheduler::run_health_report_loop(
        state.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_calibration_loop(
        state.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(scheduler::run_reconcile_loop(
        state.clone(),
        shutdown_rx.clone(),
    ));

    info!("all subsystems running — Ctrl+C or SIGTERM to stop");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    wait_for_shutdown_signal().await;
    warn!("shutdown signal received — stopping gracefully");

    // Cancel every periodic task; in-flight REST calls finish on their own.
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    state.flush_all();
    info!("state flushed — Borealis shut down complete");
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
