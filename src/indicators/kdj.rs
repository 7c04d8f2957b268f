// =============================================================================
// KDJ Stochastic Oscillator
// =============================================================================
//
//   RSV_t = (close_t - lowest_low(n)) / (highest_high(n) - lowest_low(n)) * 100
//   K_t   = 2/3 * K_{t-1} + 1/3 * RSV_t        (K_0 seeded at 50)
//   D_t   = 2/3 * D_{t-1} + 1/3 * K_t          (D_0 seeded at 50)
//   J_t   = 3 * K_t - 2 * D_t
//
// J is unbounded and goes negative in strong downtrends, which is exactly the
// regime the oversold buy rules watch for.
// =============================================================================

use crate::types::Candle;

/// One KDJ reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdjValue {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

/// Compute the KDJ series for `candles` with an `n`-candle RSV window.
///
/// The output starts once `n` candles are available; earlier candles only
/// warm the smoothing seeds.
pub fn kdj_series(candles: &[Candle], n: usize) -> Vec<KdjValue> {
    if n == 0 || candles.len() < n {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(candles.len() - n + 1);
    let mut k = 50.0_f64;
    let mut d = 50.0_f64;

    for i in (n - 1)..candles.len() {
        let window = &candles[i + 1 - n..=i];
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        let range = highest - lowest;
        let rsv = if range > 0.0 {
            (candles[i].close - lowest) / range * 100.0
        } else {
            50.0
        };

        k = k * 2.0 / 3.0 + rsv / 3.0;
        d = d * 2.0 / 3.0 + k / 3.0;
        let j = 3.0 * k - 2.0 * d;

        if !k.is_finite() || !d.is_finite() || !j.is_finite() {
            break;
        }
        result.push(KdjValue { k, d, j });
    }

    result
}

/// Most recent KDJ reading, if the series can be computed at all.
pub fn latest_kdj(candles: &[Candle], n: usize) -> Option<KdjValue> {
    kdj_series(candles, n).last().copied()
}
