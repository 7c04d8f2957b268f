// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
//   DIF  = EMA(fast) - EMA(slow)
//   DEA  = EMA(signal) of DIF
//   MACD = 2 * (DIF - DEA)        (histogram, HK charting convention)
// =============================================================================

use super::ema::ema_series;

/// One MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub dif: f64,
    pub dea: f64,
    pub macd: f64,
}

/// Compute the MACD series for `closes` with `(fast, slow, signal)` periods.
///
/// Output starts once the slow EMA and the signal EMA of DIF are both
/// available, i.e. after `slow + signal - 2` closes.
pub fn macd_series(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<MacdValue> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return Vec::new();
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    if slow_ema.is_empty() {
        return Vec::new();
    }

    // Align: slow EMA starts (slow - fast) elements later than the fast EMA.
    let offset = slow - fast;
    if fast_ema.len() < offset {
        return Vec::new();
    }
    let dif: Vec<f64> = fast_ema[offset..]
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();

    let dea = ema_series(&dif, signal);
    if dea.is_empty() {
        return Vec::new();
    }

    let dif_offset = dif.len() - dea.len();
    dea.iter()
        .enumerate()
        .map(|(i, &dea_v)| {
            let dif_v = dif[dif_offset + i];
            MacdValue {
                dif: dif_v,
                dea: dea_v,
                macd: 2.0 * (dif_v - dea_v),
            }
        })
        .collect()
}

/// Most recent MACD reading with the standard (12, 26, 9) parameters.
pub fn latest_macd(closes: &[f64]) -> Option<MacdValue> {
    macd_series(closes, 12, 26, 9).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(latest_macd(&closes).is_none());
        assert!(macd_series(&closes, 0, 26, 9).is_empty());
        assert!(macd_series(&closes, 26, 12, 9).is_empty());
    }

    #[test]
    fn flat_market_is_zero() {
        let closes = vec![100.0; 80];
        let v = latest_macd(&closes).unwrap();
        assert!(v.dif.abs() < 1e-9);
        assert!(v.dea.abs() < 1e-9);
        assert!(v.macd.abs() < 1e-9);
    }

    #[test]
    fn uptrend_has_positive_dif() {
        let closes: Vec<f64> = (1..=120).map(|x| x as f64).collect();
        let v = latest_macd(&closes).unwrap();
        assert!(v.dif > 0.0, "dif = {}", v.dif);
    }

    #[test]
    fn downtrend_has_negative_dif() {
        let closes: Vec<f64> = (1..=120).rev().map(|x| x as f64).collect();
        let v = latest_macd(&closes).unwrap();
        assert!(v.dif < 0.0, "dif = {}", v.dif);
    }

    #[test]
    fn histogram_is_twice_the_gap() {
        let closes: Vec<f64> = (0..120)
            .map(|i| 100.0 + (i as f64 / 7.0).sin() * 5.0)
            .collect();
        for v in macd_series(&closes, 12, 26, 9) {
            assert!((v.macd - 2.0 * (v.dif - v.dea)).abs() < 1e-12);
        }
    }
}
