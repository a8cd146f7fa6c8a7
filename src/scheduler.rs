// =============================================================================
// Scheduler — periodic trading cycles fused with background maintenance
// =============================================================================
//
// Loops spawned at startup:
//   - Trading cycle (default 5 min, tightening to 30 s while a scalp is
//     open): breaker gate -> symbol rotation + screening -> per-symbol
//     pipeline (candles -> structure -> zones -> multi-TF -> analyst ->
//     guard -> sizer -> order manager -> exit-state registration).
//   - Regime refresh (default 3 min): derivatives scan -> classifier ->
//     atomic RegimeView swap, enriched with funding-arb reads.
//   - Reset loop: daily/weekly/monthly breaker resets at UTC boundaries,
//     plus periodic status-file writes.
//   - Health report (default 30 min) and weekly calibration review.
//
// Every loop recovers locally: errors are logged into the state's error
// ring and the loop continues. Nothing here unwinds to main.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike, Utc};
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::analyst::{AnalystClient, AnalystRequest, TimeframeBrief};
use crate::app_state::AppState;
use crate::exit::engine::ExitState;
use crate::exit::monitor::ExitStates;
use crate::indicators::{atr, ema, rsi, volume};
use crate::market_data::Candle;
use crate::regime::classifier::{RegimeClassifier, RegimeView, FUNDING_ARB_MIN_RATE};
use crate::sizer::{PositionSizer, SizeRequest};
use crate::structure::engine::MarketStructure;
use crate::structure::{MultiTimeframeAnalyzer, SmcEngine};
use crate::types::bare_symbol;

/// Fallback set scanned when screening leaves nothing.
const FALLBACK_MAJORS: [&str; 2] = ["BTCUSDT", "ETHUSDT"];
/// Zone query radius for analyst context and revisit stats.
const ZONE_RADIUS_PCT: f64 = 3.0;

/// Sleep that aborts promptly on shutdown. Returns false when shutting down.
async fn sleep_or_shutdown(secs: u64, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(Duration::from_secs(secs)) => true,
        _ = shutdown.changed() => !*shutdown.borrow(),
    }
}

// =============================================================================
// Trading cycle
// =============================================================================

pub async fn run_trading_cycle_loop(
    state: Arc<AppState>,
    analyst: Arc<AnalystClient>,
    exit_states: ExitStates,
    mut shutdown: watch::Receiver<bool>,
) {
    let smc = SmcEngine::new();
    let multi_tf = MultiTimeframeAnalyzer::new();
    let sizer = PositionSizer::from_config(&state.config);
    let mut rotation_offset: usize = 0;

    info!(
        cycle_seconds = state.config.cycle_seconds,
        scalp_cycle_seconds = state.config.scalp_cycle_seconds,
        "trading cycle loop started"
    );

    loop {
        // Adaptive cadence: scalps need faster management decisions.
        let interval = if state.order_manager.book().has_scalp_position() {
            state.config.scalp_cycle_seconds
        } else {
            state.config.cycle_seconds
        };
        if !sleep_or_shutdown(interval, &mut shutdown).await {
            info!("trading cycle loop shutting down");
            return;
        }

        if let Err(e) = run_one_cycle(
            &state,
            &analyst,
            &smc,
            &multi_tf,
            &sizer,
            &exit_states,
            &mut rotation_offset,
        )
        .await
        {
            state.push_error("trading_cycle", e.to_string());
            warn!(error = %e, "trading cycle failed — continuing");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_cycle(
    state: &Arc<AppState>,
    analyst: &AnalystClient,
    smc: &SmcEngine,
    multi_tf: &MultiTimeframeAnalyzer,
    sizer: &PositionSizer,
    exit_states: &ExitStates,
    rotation_offset: &mut usize,
) -> Result<()> {
    let now = Utc::now().timestamp();

    // ── Kill switch: suspend new entries, leave exits alone. ────────
    if state.kill_switch_active() {
        info!("kill switch set — skipping entries this cycle");
        return Ok(());
    }

    // ── Balance refresh (live) and breaker gate. ────────────────────
    if !state.config.dry_run {
        match state.venue.get_balance().await {
            Ok(balance) if balance > 0.0 => state.circuit_breaker.update_balance(balance),
            Ok(_) => {}
            Err(e) => state.push_error("venue", format!("balance fetch: {e}")),
        }
    }
    let balance = state.balance();

    let gate = state.circuit_breaker.check(now);
    if !gate.trading_allowed {
        info!(reason = %gate.reason, "circuit breaker gate closed");
        return Ok(());
    }
    let size_modifier = gate.size_modifier * state.calibration.read().size_multiplier;

    // ── Symbol selection: rotation + regime + cheap screening. ──────
    let regime = state.regime.read().clone();
    let candidates = select_symbols(
        &state.config.symbols,
        &regime,
        *rotation_offset,
        state.config.symbols_per_cycle,
    );
    *rotation_offset = rotation_offset.wrapping_add(state.config.symbols_per_cycle);

    let mut survivors = Vec::new();
    for symbol in &candidates {
        if screen_symbol(state, &regime, symbol).await {
            survivors.push(symbol.clone());
        }
    }
    if survivors.is_empty() {
        survivors = FALLBACK_MAJORS
            .iter()
            .map(|s| s.to_string())
            .filter(|s| state.config.symbols.contains(s))
            .collect();
        debug!("screen left nothing — falling back to majors");
    }

    info!(
        candidates = candidates.len(),
        survivors = survivors.len(),
        balance = format!("{balance:.2}"),
        size_modifier = format!("{size_modifier:.2}"),
        "cycle scan"
    );

    // ── Per-symbol pipeline. Failures skip the symbol, never the cycle.
    for symbol in survivors {
        if let Err(e) = process_symbol(
            state,
            analyst,
            smc,
            multi_tf,
            sizer,
            exit_states,
            &symbol,
            balance,
            size_modifier,
            now,
        )
        .await
        {
            state.push_error("symbol_pipeline", format!("{symbol}: {e}"));
            debug!(symbol = %symbol, error = %e, "symbol pipeline failed — next symbol");
        }
    }

    Ok(())
}

/// Merge regime opportunities with a rotating slice of the universe so all
/// coins get evaluated over several cycles.
fn select_symbols(
    universe: &[String],
    regime: &RegimeView,
    rotation_offset: usize,
    per_cycle: usize,
) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();

    // Tradeable opportunities first, strongest first (already sorted).
    for opp in &regime.opportunities {
        if let Some(symbol) = universe.iter().find(|s| bare_symbol(s) == opp.symbol) {
            if !selected.contains(symbol) {
                selected.push(symbol.clone());
            }
        }
    }

    // Rotation slice fills the remainder.
    if !universe.is_empty() {
        for i in 0..universe.len() {
            if selected.len() >= per_cycle {
                break;
            }
            let symbol = &universe[(rotation_offset + i) % universe.len()];
            if !selected.contains(symbol) {
                selected.push(symbol.clone());
            }
        }
    }

    selected.truncate(per_cycle);
    selected
}

/// Cheap local heuristics: regime score, recent move, or a volume spike.
async fn screen_symbol(state: &Arc<AppState>, regime: &RegimeView, symbol: &str) -> bool {
    let bare = bare_symbol(symbol);

    if regime.score_for(&bare) >= state.config.screen_regime_threshold {
        return true;
    }

    // Recent move / volume spike off the LTF candles already in the buffer
    // (or fetched fresh when the buffer is cold).
    let candles = fetch_candles(state, symbol, &state.config.ltf, 60).await;
    let Ok(candles) = candles else {
        return false;
    };
    if candles.len() < 20 {
        return false;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let first = closes[closes.len() - 12.min(closes.len())];
    let last = closes[closes.len() - 1];
    if first > 0.0 {
        let move_pct = ((last - first) / first * 100.0).abs();
        if move_pct >= state.config.screen_move_pct {
            return true;
        }
    }

    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    if let Some(z) = volume::latest_volume_zscore(&volumes, 30) {
        if z >= state.config.screen_volume_zscore {
            return true;
        }
    }

    false
}

async fn fetch_candles(
    state: &Arc<AppState>,
    symbol: &str,
    interval: &str,
    limit: u32,
) -> Result<Vec<Candle>> {
    let candles = state
        .venue
        .get_klines(symbol, interval, limit)
        .await
        .with_context(|| format!("klines {symbol}@{interval}"))?;
    state.candle_buffer.replace_series(
        crate::market_data::CandleKey::new(symbol, interval),
        candles.clone(),
    );
    Ok(candles)
}

#[allow(clippy::too_many_arguments)]
async fn process_symbol(
    state: &Arc<AppState>,
    analyst: &AnalystClient,
    smc: &SmcEngine,
    multi_tf: &MultiTimeframeAnalyzer,
    sizer: &PositionSizer,
    exit_states: &ExitStates,
    symbol: &str,
    balance: f64,
    size_modifier: f64,
    now: i64,
) -> Result<()> {
    let bare = bare_symbol(symbol);

    // One position (or resting order) per symbol at a time.
    if state.order_manager.book().has_symbol(symbol)
        || state.order_manager.pending_count_for(symbol) > 0
    {
        return Ok(());
    }

    // Per-symbol losing streak block.
    if state
        .circuit_breaker
        .is_symbol_blocked(symbol, state.config.max_consecutive_losses)
    {
        debug!(symbol, "symbol blocked by its losing streak");
        return Ok(());
    }

    // ── Structure on three timeframes. ──────────────────────────────
    let htf_candles = fetch_candles(state, symbol, &state.config.htf, 200).await?;
    let mtf_candles = fetch_candles(state, symbol, &state.config.mtf, 200).await?;
    let ltf_candles = fetch_candles(state, symbol, &state.config.ltf, 200).await?;

    let htf_structure = smc.analyze(&htf_candles);
    let mtf_structure = smc.analyze(&mtf_candles);
    let ltf_structure = smc.analyze(&ltf_candles);

    // Remember what the MTF found; its zones anchor stops later.
    let mut detected = mtf_structure.active_obs.clone();
    detected.extend(mtf_structure.active_fvgs.iter().cloned());
    state
        .zone_memory
        .store_patterns(&bare, &state.config.mtf, &detected);

    let current_price = state
        .last_prices
        .read()
        .get(symbol)
        .copied()
        .filter(|p| *p > 0.0)
        .or_else(|| ltf_candles.last().map(|c| c.close))
        .unwrap_or(0.0);
    if current_price <= 0.0 {
        anyhow::bail!("no price available");
    }

    // ── Multi-timeframe gate. ───────────────────────────────────────
    let tf_signal = multi_tf.analyze(&htf_structure, &mtf_structure, &ltf_structure, current_price);
    if tf_signal.direction.is_none() {
        debug!(symbol, reasons = ?tf_signal.reasons, "timeframes disagree — skip");
        return Ok(());
    }

    // ── Ask the oracle. ─────────────────────────────────────────────
    let regime = state.regime.read().clone();
    let nearby_zones = state
        .zone_memory
        .predict_revisits(&bare, current_price, ZONE_RADIUS_PCT);

    let request = AnalystRequest {
        symbol: symbol.to_string(),
        balance,
        open_positions: state.order_manager.book().open_count(),
        regime_label: regime.regime_label(),
        regime_score: regime.global_score,
        direction_bias: regime.direction_bias,
        timeframes: vec![
            timeframe_brief(&state.config.htf, &htf_candles, &htf_structure),
            timeframe_brief(&state.config.mtf, &mtf_candles, &mtf_structure),
            timeframe_brief(&state.config.ltf, &ltf_candles, &ltf_structure),
        ],
        nearby_zones,
        lessons: Vec::new(),
    };

    let Some(signal) = analyst.analyze(&request, &state.config).await? else {
        return Ok(());
    };

    // ── Re-entry cooldown after a loss on this symbol. ──────────────
    let cooldown = state.config.symbol_cooldown_seconds(signal.trade_type);
    if cooldown > 0 {
        if let Some(last_loss) = state.order_manager.book().last_loss_time(symbol) {
            if now - last_loss < cooldown as i64 {
                debug!(symbol, "re-entry cooldown active — skip");
                return Ok(());
            }
        }
    }

    // ── Portfolio guard. A denial means no order, full stop. ────────
    let open_positions = state.order_manager.book().get_open();
    state.portfolio_guard.update_state(balance, &open_positions);

    let stop_distance = (signal.entry_price - signal.stop_loss).abs();
    let intended_notional = if stop_distance > 0.0 {
        signal.risk_usd / stop_distance * signal.entry_price
    } else {
        0.0
    };

    let guard_decision = state.portfolio_guard.check_trade(
        symbol,
        signal.direction,
        signal.risk_usd,
        intended_notional,
        signal.trade_type,
        now,
    );
    if !guard_decision.allowed {
        info!(symbol, reasons = ?guard_decision.reasons, "portfolio guard denied trade");
        return Ok(());
    }
    if !guard_decision.reasons.iter().any(|r| r == "all checks passed") {
        info!(symbol, reasons = ?guard_decision.reasons, "portfolio guard adjustments");
    }

    // ── Size the trade. ─────────────────────────────────────────────
    let risk = guard_decision.adjusted_risk_usd.unwrap_or(signal.risk_usd) * size_modifier;
    let funding = regime.funding_arbs.get(&bare).cloned().unwrap_or_default();
    let zones = state.zone_memory.active_zones(
        &bare,
        Some((current_price * 0.95, current_price * 1.05)),
    );

    let mut size_request =
        SizeRequest::new(balance, signal.entry_price, signal.stop_loss, signal.direction);
    size_request.conviction = signal.conviction;
    size_request.risk_override = risk;
    size_request.notional_cap_override = guard_decision.notional_cap.unwrap_or(0.0);
    size_request.current_exposure = state.order_manager.book().total_notional();
    size_request.funding_rate_8h = funding.rate_8h;
    size_request.funding_collect_side = funding.collect_side;
    size_request.zones = &zones;

    let sizing = sizer.calculate(&size_request);
    if sizing.is_zero() {
        debug!(symbol, adjustments = ?sizing.adjustments, "sizer returned zero quantity");
        return Ok(());
    }

    // The zone the stop leans on, for hit-rate statistics later.
    let zone_key = if sizing.sl_source.starts_with("OB") || sizing.sl_source.starts_with("FVG") {
        zones.first().map(|z| z.key())
    } else {
        None
    };

    // ── Execute and register exit management. ───────────────────────
    let opened = state
        .order_manager
        .execute_signal(&signal, &sizing, zone_key, now)
        .await?;

    if let Some(position) = opened {
        let ltf_atr = atr::calculate_atr(&ltf_candles, 14).unwrap_or(0.0);
        let mut exit_state = ExitState::new(
            position.entry_price,
            position.stop_loss,
            position.quantity,
            ltf_atr,
            position.entry_time,
        );
        exit_state.funding_collecting =
            funding.active && funding.collect_side == Some(signal.direction);
        exit_states.write().insert(position.id.clone(), exit_state);

        info!(
            symbol,
            position_id = %position.id,
            direction = %signal.direction,
            qty = position.quantity,
            "trade opened and exit state registered"
        );
    }

    Ok(())
}

fn timeframe_brief(interval: &str, candles: &[Candle], structure: &MarketStructure) -> TimeframeBrief {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let tail_start = closes.len().saturating_sub(30);
    TimeframeBrief {
        interval: interval.to_string(),
        last_close: closes.last().copied().unwrap_or(0.0),
        ema_9: ema::latest_ema(&closes, 9),
        ema_21: ema::latest_ema(&closes, 21),
        rsi_14: rsi::calculate_rsi(&closes, 14),
        atr_14: atr::calculate_atr(candles, 14),
        trend: structure.trend.to_string(),
        poi_count: structure.points_of_interest.len(),
        closes: closes[tail_start..].to_vec(),
    }
}

// =============================================================================
// Regime refresh
// =============================================================================

pub async fn run_regime_refresh_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let classifier = RegimeClassifier::new();
    info!(
        poll_seconds = state.config.derivatives_poll_seconds,
        "regime refresh loop started"
    );

    loop {
        if !sleep_or_shutdown(state.config.derivatives_poll_seconds, &mut shutdown).await {
            info!("regime refresh loop shutting down");
            return;
        }

        let snapshot = state.derivatives.scan_market(&state.config.symbols).await;
        if snapshot.coins.is_empty() {
            state.push_error("regime", "empty derivatives snapshot".to_string());
            continue;
        }

        let mut view = classifier.analyze(&snapshot);

        // Funding-arb table from the scanned rates.
        for coin in snapshot.coins.values() {
            let info = classifier.funding_arb_opportunity(
                &coin.symbol,
                coin.funding_rate,
                1000.0,
                FUNDING_ARB_MIN_RATE,
            );
            if info.active {
                view.funding_arbs.insert(coin.symbol.clone(), info);
            }
        }

        // Replace atomically: readers never see a half-built view.
        *state.regime.write() = view;
    }
}

// =============================================================================
// Reset loop — UTC boundaries + status writes
// =============================================================================

pub async fn run_reset_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut last_day = day_key(Utc::now().timestamp());
    let mut last_week = week_key(Utc::now().timestamp());
    let mut last_month = month_key(Utc::now().timestamp());
    let mut last_status_write = std::time::Instant::now();

    info!("reset loop started");

    loop {
        if !sleep_or_shutdown(60, &mut shutdown).await {
            info!("reset loop shutting down");
            return;
        }

        let now = Utc::now().timestamp();

        let day = day_key(now);
        if day != last_day {
            last_day = day;
            state.circuit_breaker.reset_daily(now);
        }

        let week = week_key(now);
        if week != last_week {
            last_week = week;
            state.circuit_breaker.reset_weekly();
        }

        let month = month_key(now);
        if month != last_month {
            last_month = month;
            state.circuit_breaker.reset_monthly();
        }

        if last_status_write.elapsed().as_secs() >= state.config.status_write_seconds {
            last_status_write = std::time::Instant::now();
            if let Err(e) = state.write_status() {
                state.push_error("status", e.to_string());
            }
        }
    }
}

fn day_key(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn week_key(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| {
            let week = dt.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        })
        .unwrap_or_default()
}

fn month_key(epoch_secs: i64) -> String {
    chrono::DateTime::from_timestamp(epoch_secs, 0)
        .map(|dt| dt.format("%Y-%m").to_string())
        .unwrap_or_default()
}

// =============================================================================
// Health report
// =============================================================================

pub async fn run_health_report_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    info!(
        interval_secs = state.config.health_report_seconds,
        "health report loop started"
    );

    loop {
        if !sleep_or_shutdown(state.config.health_report_seconds, &mut shutdown).await {
            info!("health report loop shutting down");
            return;
        }

        let status = state.build_status();
        info!(
            uptime_secs = status.uptime_secs,
            balance = format!("{:.2}", status.balance),
            open = status.open_positions.len(),
            pending = status.pending_orders,
            ticks_dropped = status.ticks_dropped,
            regime = %status.regime_label,
            "health diagnostic"
        );
        state.append_report(
            "health",
            serde_json::json!({
                "uptime_secs": status.uptime_secs,
                "balance": status.balance,
                "drawdown_pct": status.drawdown_pct,
                "open_positions": status.open_positions.len(),
                "ticks_dropped": status.ticks_dropped,
                "subsystem_errors": status.subsystem_errors,
            }),
        );
    }
}

// =============================================================================
// Weekly calibration review
// =============================================================================

pub async fn run_calibration_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut last_review_week = String::new();
    info!(
        weekday = state.config.calibration_utc_weekday,
        hour = state.config.calibration_utc_hour,
        "calibration loop started"
    );

    loop {
        if !sleep_or_shutdown(300, &mut shutdown).await {
            info!("calibration loop shutting down");
            return;
        }

        let now = Utc::now();
        let due = now.weekday().num_days_from_monday() == state.config.calibration_utc_weekday
            && now.hour() == state.config.calibration_utc_hour;
        let week = week_key(now.timestamp());
        if !due || week == last_review_week {
            continue;
        }
        last_review_week = week;

        let trades = state.order_manager.book().recent_closed(50);
        if trades.len() < 10 {
            debug!(trades = trades.len(), "calibration skipped — not enough closed trades");
            continue;
        }

        let wins = trades.iter().filter(|t| t.is_win()).count();
        let win_rate = wins as f64 / trades.len() as f64;
        // Blunt instrument on purpose: a cold streak trims size, recovery
        // restores it. Strategy evolution stays out of scope.
        let multiplier = if win_rate < 0.40 { 0.75 } else { 1.0 };

        {
            let mut calibration = state.calibration.write();
            calibration.size_multiplier = multiplier;
            calibration.reviewed_trades = trades.len();
            calibration.win_rate = win_rate;
            calibration.reviewed_at = now.to_rfc3339();
        }

        info!(
            trades = trades.len(),
            win_rate = format!("{win_rate:.2}"),
            size_multiplier = multiplier,
            "weekly calibration review"
        );
        state.append_report(
            "calibration",
            serde_json::json!({
                "trades": trades.len(),
                "win_rate": win_rate,
                "size_multiplier": multiplier,
            }),
        );
    }
}

// =============================================================================
// Live reconciliation loop
// =============================================================================

/// Poll the venue for positions that closed server-side (TP/SL triggers)
/// and record the inferred results.
pub async fn run_reconcile_loop(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    if state.config.dry_run {
        return; // paper book never diverges
    }
    info!("reconcile loop started");

    loop {
        if !sleep_or_shutdown(60, &mut shutdown).await {
            info!("reconcile loop shutting down");
            return;
        }

        let now = Utc::now().timestamp();
        match state.order_manager.reconcile(now).await {
            Ok(results) => {
                for result in results {
                    let net = result.net_pnl();
                    state.circuit_breaker.record_trade(net, &result.symbol, now);
                    if result.is_win() {
                        state.portfolio_guard.record_win(&result.symbol);
                    } else {
                        state.portfolio_guard.record_loss(&result.symbol, now);
                    }
                    state.append_report(
                        "trade",
                        serde_json::to_value(&result).unwrap_or_default(),
                    );
                }
            }
            Err(e) => {
                state.push_error("reconcile", e.to_string());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::classifier::SymbolOpportunity;
    use crate::types::Direction;

    fn universe() -> Vec<String> {
        vec![
            "BTCUSDT".to_string(),
            "ETHUSDT".to_string(),
            "SOLUSDT".to_string(),
            "XRPUSDT".to_string(),
            "DOGEUSDT".to_string(),
        ]
    }

    fn view_with_opportunity(symbol: &str, score: f64) -> RegimeView {
        let opp = SymbolOpportunity {
            symbol: symbol.to_string(),
            direction: Some(Direction::Long),
            score,
            reasons: vec![],
            funding_signal: 0.0,
            oi_signal: 0.0,
            ls_signal: 0.0,
            liq_signal: 0.0,
            momentum_signal: 0.0,
        };
        RegimeView {
            opportunities: vec![opp],
            ..Default::default()
        }
    }

    #[test]
    fn opportunities_lead_the_selection() {
        let selected =
            select_symbols(&universe(), &view_with_opportunity("SOL", 80.0), 0, 3);
        assert_eq!(selected[0], "SOLUSDT");
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn rotation_covers_the_universe_over_cycles() {
        let empty = RegimeView::default();
        let mut seen = std::collections::HashSet::new();
        for cycle in 0..3 {
            for symbol in select_symbols(&universe(), &empty, cycle * 2, 2) {
                seen.insert(symbol);
            }
        }
        // Offsets 0, 2, 4 with two per cycle cover all five symbols.
        assert_eq!(seen.len(), 5, "rotation must reach the whole universe: {seen:?}");
    }

    #[test]
    fn selection_never_duplicates() {
        let selected =
            select_symbols(&universe(), &view_with_opportunity("BTC", 90.0), 0, 5);
        let unique: std::collections::HashSet<&String> = selected.iter().collect();
        assert_eq!(unique.len(), selected.len());
    }

    #[test]
    fn per_cycle_cap_is_respected() {
        let selected = select_symbols(&universe(), &RegimeView::default(), 0, 2);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn empty_universe_selects_nothing() {
        let selected = select_symbols(&[], &view_with_opportunity("BTC", 90.0), 0, 4);
        assert!(selected.is_empty());
    }

    #[test]
    fn utc_period_keys() {
        // 2023-11-14 22:13:20 UTC.
        let ts = 1_700_000_000;
        assert_eq!(day_key(ts), "2023-11-14");
        assert_eq!(week_key(ts), "2023-W46");
        assert_eq!(month_key(ts), "2023-11");

        // Keys change across a midnight boundary.
        let before_midnight = 1_699_919_999; // 2023-11-13 23:59:59 UTC
        let after_midnight = 1_699_920_000; // 2023-11-14 00:00:00 UTC
        assert_ne!(day_key(before_midnight), day_key(after_midnight));
    }

    #[test]
    fn timeframe_brief_summarises_indicators() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.5;
                Candle::new(i * 60_000, base, base + 1.0, base - 1.0, base + 0.2, 50.0, 0)
            })
            .collect();
        let brief = timeframe_brief("4h", &candles, &MarketStructure::default());
        assert_eq!(brief.interval, "4h");
        assert_eq!(brief.closes.len(), 30);
        assert!(brief.ema_9.is_some());
        assert!(brief.rsi_14.is_some());
        assert!(brief.atr_14.is_some());
        assert!(brief.last_close > 100.0);
    }
}
