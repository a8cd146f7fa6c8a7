// =============================================================================
// Volume Z-Score — how unusual is a bar's volume?
// =============================================================================
//
//   z = (volume - mean) / std
//
// Order-block validation treats z >= 2 as institutionally significant; the
// cycle screen uses the latest bar's z-score as a cheap activity filter.
// =============================================================================

/// Z-score of `volumes[index]` against the mean/std of the whole slice.
///
/// Returns `None` for an empty slice or out-of-range index. A zero standard
/// deviation (all volumes equal) yields 0.0 rather than dividing by zero.
pub fn volume_zscore_at(volumes: &[f64], index: usize) -> Option<f64> {
    if volumes.is_empty() || index >= volumes.len() {
        return None;
    }

    let n = volumes.len() as f64;
    let mean = volumes.iter().sum::<f64>() / n;
    let variance = volumes.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    if !mean.is_finite() || !std.is_finite() {
        return None;
    }
    if std == 0.0 {
        return Some(0.0);
    }
    Some((volumes[index] - mean) / std)
}

/// Z-score of the most recent volume over a trailing `window` of bars.
pub fn latest_volume_zscore(volumes: &[f64], window: usize) -> Option<f64> {
    if volumes.is_empty() || window == 0 {
        return None;
    }
    let start = volumes.len().saturating_sub(window);
    let tail = &volumes[start..];
    volume_zscore_at(tail, tail.len() - 1)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_none() {
        assert!(volume_zscore_at(&[], 0).is_none());
        assert!(latest_volume_zscore(&[], 20).is_none());
    }

    #[test]
    fn out_of_range_index_is_none() {
        assert!(volume_zscore_at(&[1.0, 2.0], 5).is_none());
    }

    #[test]
    fn uniform_volume_scores_zero() {
        let volumes = vec![100.0; 20];
        assert_eq!(volume_zscore_at(&volumes, 10), Some(0.0));
    }

    #[test]
    fn spike_scores_high() {
        let mut volumes = vec![100.0; 30];
        volumes[29] = 1000.0;
        let z = volume_zscore_at(&volumes, 29).unwrap();
        assert!(z > 3.0, "volume spike should score high, got {z}");
    }

    #[test]
    fn below_average_scores_negative() {
        let mut volumes = vec![100.0; 30];
        volumes[15] = 500.0; // make the mean sit above the rest
        let z = volume_zscore_at(&volumes, 0).unwrap();
        assert!(z < 0.0);
    }

    #[test]
    fn latest_uses_trailing_window() {
        // Old spike outside the window must not distort the score.
        let mut volumes = vec![100.0; 50];
        volumes[0] = 10_000.0;
        volumes[49] = 100.0;
        let z = latest_volume_zscore(&volumes, 20).unwrap();
        assert!(z.abs() < 1e-9, "spike outside window should not matter, got {z}");
    }
}
