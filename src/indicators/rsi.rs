// =============================================================================
// Relative Strength Index (RSI)
// =============================================================================
//
// Wilder's RSI: split every price change into an up-move and a down-move,
// smooth both exponentially with factor 1/n, and map their ratio onto
// [0, 100]. The smoothed averages are seeded with the plain mean of the
// first `period` changes.
//
//   up_avg'   = up_avg   + (up   - up_avg)   / n
//   down_avg' = down_avg + (down - down_avg) / n
//   RSI       = 100 - 100 / (1 + up_avg / down_avg)
// =============================================================================

/// Compute the RSI series for `closes` over `period`.
///
/// Needs at least `period + 1` closes; the first value covers the seed
/// window, after which every additional close yields one more reading. A
/// one-sided market clamps to 100 (no down-moves) or 0 (no up-moves); a
/// market with no movement at all reads 50.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }
    let n = period as f64;

    // Each change contributes to exactly one side.
    let moves: Vec<(f64, f64)> = closes
        .windows(2)
        .map(|pair| {
            let change = pair[1] - pair[0];
            (change.max(0.0), (-change).max(0.0))
        })
        .collect();

    let (mut up_avg, mut down_avg) = moves[..period]
        .iter()
        .fold((0.0, 0.0), |(up, down), &(u, d)| (up + u / n, down + d / n));

    let mut series = Vec::with_capacity(moves.len() - period + 1);
    series.push(strength_index(up_avg, down_avg));

    for &(up, down) in &moves[period..] {
        up_avg += (up - up_avg) / n;
        down_avg += (down - down_avg) / n;
        series.push(strength_index(up_avg, down_avg));
    }

    // A poisoned input (NaN/inf close) poisons everything downstream of it;
    // cut the series at the first bad reading.
    if let Some(bad) = series.iter().position(|v| !v.is_finite()) {
        series.truncate(bad);
    }
    series
}

/// Most recent RSI value, if the series can be computed at all.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

/// Map smoothed up/down averages onto the 0–100 index.
fn strength_index(up_avg: f64, down_avg: f64) -> f64 {
    if down_avg > 0.0 {
        100.0 - 100.0 / (1.0 + up_avg / down_avg)
    } else if up_avg > 0.0 {
        100.0
    } else {
        50.0
    }
}
