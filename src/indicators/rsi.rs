// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// overbought / oversold conditions.
//
//   RS  = avg_gain / avg_loss     (Wilder-smoothed)
//   RSI = 100 - 100 / (1 + RS)
//
// Default period: 14
// =============================================================================

/// Compute the most recent RSI value for `closes` using Wilder smoothing.
///
/// Returns `None` when the period is zero, there are fewer than
/// `period + 1` closes, or a non-finite value appears in the input.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if !delta.is_finite() {
            return None;
        }
        if delta >= 0.0 {
            gains += delta;
        } else {
            losses += -delta;
        }
    }

    let period_f = period as f64;
    let mut avg_gain = gains / period_f;
    let mut avg_loss = losses / period_f;

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        if !delta.is_finite() {
            return None;
        }
        let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    if avg_loss == 0.0 {
        // No losses in the window: fully overbought by definition.
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    if rsi.is_finite() {
        Some(rsi)
    } else {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_period_zero() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_none());
    }

    #[test]
    fn rsi_insufficient_data() {
        let closes = vec![100.0; 10];
        assert!(calculate_rsi(&closes, 14).is_none());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!((rsi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_all_losses_is_near_zero() {
        let closes: Vec<f64> = (0..30).map(|i| 200.0 - i as f64).collect();
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!(rsi < 1.0, "expected RSI near 0, got {rsi}");
    }

    #[test]
    fn rsi_alternating_is_midrange() {
        // Equal up and down moves -> RSI near 50.
        let mut closes = vec![100.0];
        for i in 1..40 {
            let prev = closes[i - 1];
            closes.push(if i % 2 == 0 { prev + 1.0 } else { prev - 1.0 });
        }
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!((rsi - 50.0).abs() < 10.0, "expected RSI near 50, got {rsi}");
    }

    #[test]
    fn rsi_in_valid_range() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.5).sin() * 8.0).collect();
        let rsi = calculate_rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }

    #[test]
    fn rsi_nan_returns_none() {
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        closes[5] = f64::NAN;
        assert!(calculate_rsi(&closes, 14).is_none());
    }
}
