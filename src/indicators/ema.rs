// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev_ema = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev_ema * (1.0 - multiplier);
        if !ema.is_finite() {
            // Stop on a broken series rather than propagate garbage.
            break;
        }
        result.push(ema);
        prev_ema = ema;
    }

    result
}

/// Most recent EMA value, or `None` when the series cannot be computed.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    calculate_ema(closes, period).last().copied()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_period_zero() {
        assert!(calculate_ema(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_constant_series_stays_constant() {
        let closes = vec![50.0; 30];
        let ema = calculate_ema(&closes, 9);
        assert!(!ema.is_empty());
        for v in &ema {
            assert!((v - 50.0).abs() < 1e-9, "constant input must give constant EMA");
        }
    }

    #[test]
    fn ema_tracks_rising_prices() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let ema = calculate_ema(&closes, 9);
        let last = *ema.last().unwrap();
        let first = ema[0];
        assert!(last > first, "EMA must rise with rising closes");
        // EMA lags price, so the last EMA sits below the last close.
        assert!(last < *closes.last().unwrap());
    }

    #[test]
    fn ema_seed_is_sma() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let ema = calculate_ema(&closes, 5);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn latest_ema_matches_series_tail() {
        let closes: Vec<f64> = (0..30).map(|i| (i as f64 * 0.7).sin() * 5.0 + 100.0).collect();
        let series = calculate_ema(&closes, 9);
        assert_eq!(latest_ema(&closes, 9), series.last().copied());
    }

    #[test]
    fn ema_nan_stops_series() {
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        closes[10] = f64::NAN;
        let ema = calculate_ema(&closes, 5);
        // Series stops at the NaN rather than emitting non-finite values.
        for v in &ema {
            assert!(v.is_finite());
        }
    }
}
