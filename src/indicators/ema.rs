// =============================================================================
// Exponential Moving Average (EMA) and dead-band trend classification
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

use crate::types::Trend;

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let ema = close * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            // Stop producing once the series goes non-finite; downstream
            // consumers should not trust a broken tail.
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value, if computable.
pub fn ema_last(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}

/// Classify the trend from the last close against its EMA, with a dead-band
/// buffer (`buffer_pct`, percent of the EMA) that works as hysteresis:
///
/// - From `Range`, either band edge commits a directional trend.
/// - A committed `Bull` only flips once the close drops below the *lower*
///   band edge (and symmetrically for `Bear`), so small oscillations at the
///   EMA line do not whipsaw the classification.
pub fn classify_trend(prev: Trend, last_close: f64, ema: f64, buffer_pct: f64) -> Trend {
    if !last_close.is_finite() || !ema.is_finite() || ema <= 0.0 {
        return prev;
    }

    let band = ema * buffer_pct / 100.0;
    let upper = ema + band;
    let lower = ema - band;

    match prev {
        Trend::Bull => {
            if last_close < lower {
                Trend::Bear
            } else if last_close < ema {
                Trend::Range
            } else {
                Trend::Bull
            }
        }
        Trend::Bear => {
            if last_close > upper {
                Trend::Bull
            } else if last_close > ema {
                Trend::Range
            } else {
                Trend::Bear
            }
        }
        Trend::Range => {
            if last_close > upper {
                Trend::Bull
            } else if last_close < lower {
                Trend::Bear
            } else {
                Trend::Range
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ascending(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    // ---- ema_series ------------------------------------------------------

    #[test]
    fn ema_empty_input() {
        assert!(ema_series(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(ema_series(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn ema_period_equals_length_is_sma() {
        let ema = ema_series(&[2.0, 4.0, 6.0], 3);
        assert_eq!(ema.len(), 1);
        assert!((ema[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1..10]: SMA seed 3.0, multiplier 1/3.
        let closes = ascending(10);
        let ema = ema_series(&closes, 5);
        assert_eq!(ema.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i + 1] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn ema_tracks_rising_series() {
        let closes = ascending(100);
        let last = ema_last(&closes, 21).unwrap();
        // EMA lags, so it must sit below the last close on a rising series.
        assert!(last < 100.0);
        assert!(last > 80.0);
    }

    #[test]
    fn ema_stops_on_nan() {
        let closes = vec![1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = ema_series(&closes, 3);
        assert_eq!(ema.len(), 1);
    }

    // ---- classify_trend --------------------------------------------------

    #[test]
    fn trend_commits_beyond_band() {
        // ema=100, buffer 0.5% => band edges at 99.5 / 100.5.
        assert_eq!(classify_trend(Trend::Range, 101.0, 100.0, 0.5), Trend::Bull);
        assert_eq!(classify_trend(Trend::Range, 99.0, 100.0, 0.5), Trend::Bear);
        assert_eq!(classify_trend(Trend::Range, 100.2, 100.0, 0.5), Trend::Range);
    }

    #[test]
    fn trend_hysteresis_holds_inside_band() {
        // A committed bull does not flip on a close just under the EMA
        // but still above the lower band edge.
        assert_eq!(classify_trend(Trend::Bull, 100.4, 100.0, 0.5), Trend::Bull);
        assert_eq!(classify_trend(Trend::Bull, 99.8, 100.0, 0.5), Trend::Range);
        assert_eq!(classify_trend(Trend::Bull, 99.0, 100.0, 0.5), Trend::Bear);
    }

    #[test]
    fn trend_hysteresis_symmetric_for_bear() {
        assert_eq!(classify_trend(Trend::Bear, 99.6, 100.0, 0.5), Trend::Bear);
        assert_eq!(classify_trend(Trend::Bear, 100.2, 100.0, 0.5), Trend::Range);
        assert_eq!(classify_trend(Trend::Bear, 101.0, 100.0, 0.5), Trend::Bull);
    }

    #[test]
    fn trend_keeps_prev_on_bad_input() {
        assert_eq!(classify_trend(Trend::Bull, f64::NAN, 100.0, 0.5), Trend::Bull);
        assert_eq!(classify_trend(Trend::Bear, 100.0, 0.0, 0.5), Trend::Bear);
    }
}
