// =============================================================================
// Average Directional Index (ADX) — trend strength regardless of direction
// =============================================================================
//
// Pipeline:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder's smoothing over `period` for all three.
//   3. +DI / -DI from the smoothed values, DX = |+DI - -DI| / (+DI + -DI).
//   4. ADX = Wilder's smoothed average of DX.
//
// ADX > 25 reads as a trending market, < 20 as ranging.
// =============================================================================

use crate::exchange::Kline;

/// Most recent ADX value from a slice of OHLCV bars (oldest first).
///
/// Needs at least `2 * period + 1` bars: `period` for the initial smoothing
/// of +DM/-DM/TR plus `period` DX values to seed the ADX average.
pub fn adx(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;
    let transitions = klines.len() - 1;

    let mut plus_dm = Vec::with_capacity(transitions);
    let mut minus_dm = Vec::with_capacity(transitions);
    let mut tr_vals = Vec::with_capacity(transitions);

    for pair in klines.windows(2) {
        let (prev, bar) = (pair[0], pair[1]);

        let tr = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());

        let up_move = bar.high - prev.high;
        let down_move = prev.low - bar.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(transitions - period + 1);
    dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..transitions {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        dx_values.push(dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    let mut value: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &d in &dx_values[period..] {
        value = (value * (period_f - 1.0) + d) / period_f;
    }

    value.is_finite().then_some(value)
}

/// DX from smoothed +DM, -DM, and TR.  Zero TR means no usable range; zero
/// DI sum means no directional movement at all.
fn dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;
    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let value = (plus_di - minus_di).abs() / di_sum * 100.0;
    value.is_finite().then_some(value)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Kline {
        Kline {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            close_time: 0,
        }
    }

    #[test]
    fn period_zero_is_none() {
        let klines = vec![bar(1.0, 2.0, 0.5, 1.5); 50];
        assert!(adx(&klines, 0).is_none());
    }

    #[test]
    fn insufficient_data_is_none() {
        let klines = vec![bar(1.0, 2.0, 0.5, 1.5); 10];
        assert!(adx(&klines, 14).is_none());
    }

    #[test]
    fn strong_uptrend_scores_high() {
        let klines: Vec<Kline> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();
        let value = adx(&klines, 14).unwrap();
        assert!(value > 25.0, "expected ADX > 25 for strong trend, got {value}");
    }

    #[test]
    fn flat_market_scores_near_zero() {
        let klines = vec![bar(100.0, 101.0, 99.0, 100.0); 60];
        let value = adx(&klines, 14).unwrap();
        assert!(value < 1.0, "expected ADX near 0 for flat market, got {value}");
    }

    #[test]
    fn result_stays_in_range() {
        let klines: Vec<Kline> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                bar(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(value) = adx(&klines, 14) {
            assert!((0.0..=100.0).contains(&value), "ADX {value} out of range");
        }
    }

    #[test]
    fn minimum_bar_count_is_exact() {
        let period = 5;
        let min = 2 * period + 1;
        let klines: Vec<Kline> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(adx(&klines, period).is_some());
        assert!(adx(&klines[..min - 1], period).is_none());
    }
}
