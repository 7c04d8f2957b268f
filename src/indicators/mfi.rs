// =============================================================================
// Money Flow Index (MFI)
// =============================================================================
//
// Volume-weighted RSI over the typical price:
//   typical = (high + low + close) / 3
//   raw money flow = typical * volume
//   positive flow when typical rises, negative when it falls
//   MFI = 100 - 100 / (1 + positive_sum / negative_sum) over `period` changes
// =============================================================================

use crate::types::Candle;

/// Compute the most recent MFI value for `candles` over `period`.
///
/// Needs `period + 1` candles. Returns `None` on insufficient data or a
/// non-finite result. When there is no negative flow at all MFI clamps to
/// 100; no positive flow clamps to 0; no flow in either direction yields 50.
pub fn latest_mfi(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let typical: Vec<f64> = candles
        .iter()
        .map(|c| (c.high + c.low + c.close) / 3.0)
        .collect();

    let window = &candles[candles.len() - period - 1..];
    let typical_window = &typical[typical.len() - period - 1..];

    let mut positive = 0.0_f64;
    let mut negative = 0.0_f64;
    for i in 1..typical_window.len() {
        let flow = typical_window[i] * window[i].volume;
        if typical_window[i] > typical_window[i - 1] {
            positive += flow;
        } else if typical_window[i] < typical_window[i - 1] {
            negative += flow;
        }
    }

    let mfi = if positive == 0.0 && negative == 0.0 {
        50.0
    } else if negative == 0.0 {
        100.0
    } else if positive == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + positive / negative)
    };

    mfi.is_finite().then_some(mfi)
}
