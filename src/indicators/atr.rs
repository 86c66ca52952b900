// =============================================================================
// Average True Range (ATR) — Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR using Wilder's method:
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::exchange::Kline;

/// Most recent ATR value from a slice of OHLCV bars (oldest first).
///
/// Returns `None` when `period` is zero, fewer than `period + 1` bars are
/// available, or any intermediate value is non-finite.
pub fn atr(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(klines.len() - 1);
    for pair in klines.windows(2) {
        let prev_close = pair[0].close;
        let bar = pair[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        tr_values.push(tr);
    }

    let period_f = period as f64;
    let mut value: f64 = tr_values[..period].iter().sum::<f64>() / period_f;
    for &tr in &tr_values[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    value.is_finite().then_some(value)
}

/// ATR as a percentage of the last close.  Comparable across assets with
/// different price scales.
pub fn atr_pct(klines: &[Kline], period: usize) -> Option<f64> {
    let value = atr(klines, period)?;
    let last_close = klines.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some(value / last_close * 100.0)
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
            volume: 100.0,
            quote_volume: 200.0,
            close_time: 0,
        }
    }

    #[test]
    fn period_zero_is_none() {
        let klines = vec![bar(100.0, 105.0, 95.0, 102.0); 20];
        assert!(atr(&klines, 0).is_none());
    }

    #[test]
    fn insufficient_data_is_none() {
        let klines = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(atr(&klines, 14).is_none());
    }

    #[test]
    fn exact_minimum_data_produces_value() {
        let klines = vec![
            bar(100.0, 102.0, 98.0, 101.0),
            bar(101.0, 104.0, 99.0, 103.0),
            bar(103.0, 106.0, 100.0, 105.0),
            bar(105.0, 108.0, 102.0, 107.0),
        ];
        let value = atr(&klines, 3).unwrap();
        assert!(value > 0.0 && value.is_finite());
    }

    #[test]
    fn constant_range_converges() {
        // Every bar spans H-L = 10 with a slight drift; ATR converges to 10.
        let klines: Vec<Kline> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 0.1;
                bar(base, base + 5.0, base - 5.0, base)
            })
            .collect();
        let value = atr(&klines, 14).unwrap();
        assert!((value - 10.0).abs() < 1.0, "expected ATR near 10.0, got {value}");
    }

    #[test]
    fn true_range_uses_prev_close_on_gaps() {
        let klines = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            // Gap up: |115 - 95| = 20 dominates H-L = 7.
            bar(110.0, 115.0, 108.0, 112.0),
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let value = atr(&klines, 3).unwrap();
        assert!(value > 7.0, "ATR should reflect the gap, got {value}");
    }

    #[test]
    fn nan_input_is_none() {
        let klines = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(atr(&klines, 3).is_none());
    }

    #[test]
    fn pct_scales_by_last_close() {
        let klines: Vec<Kline> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base + 3.0, base - 3.0, base + 1.0)
            })
            .collect();
        let abs = atr(&klines, 14).unwrap();
        let pct = atr_pct(&klines, 14).unwrap();
        let last_close = klines.last().unwrap().close;
        assert!((pct - abs / last_close * 100.0).abs() < 1e-9);
    }
}
