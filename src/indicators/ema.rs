// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Incremental form: with alpha = 2 / (period + 1), each close pulls the
// running average toward itself by `alpha * (close - ema)`. The first value
// is the simple mean of the seed window, so the output is aligned to start
// at input index `period - 1`.
// =============================================================================

/// Compute the EMA series for `closes` over `period`.
///
/// Returns empty on a zero period or fewer than `period` closes. A
/// non-finite close poisons the running average; the series is cut at the
/// first bad reading.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;

    std::iter::once(seed)
        .chain(closes[period..].iter().scan(seed, move |ema, &close| {
            *ema += alpha * (close - *ema);
            Some(*ema)
        }))
        .take_while(|v| v.is_finite())
        .collect()
}

/// Most recent EMA value, if the series can be computed at all.
pub fn latest_ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}
