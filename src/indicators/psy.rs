// =============================================================================
// Psychological Line (PSY)
// =============================================================================
//
// PSY(n) = (number of rising closes within the last n changes) / n * 100
//
// A close equal to its predecessor does not count as rising.
// =============================================================================

/// Compute the PSY series for `closes` over `period` changes.
///
/// The output starts at index `period` of the input (the first `period + 1`
/// closes produce the first value).
pub fn psy_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let ups: Vec<u32> = closes
        .windows(2)
        .map(|w| if w[1] > w[0] { 1 } else { 0 })
        .collect();

    ups.windows(period)
        .map(|w| f64::from(w.iter().sum::<u32>()) / period as f64 * 100.0)
        .collect()
}

/// Most recent PSY value, if the series can be computed at all.
pub fn latest_psy(closes: &[f64], period: usize) -> Option<f64> {
    psy_series(closes, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data() {
        assert!(psy_series(&[1.0, 2.0], 12).is_empty());
        assert!(psy_series(&[], 12).is_empty());
        assert!(psy_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn all_rising_is_100() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        for v in psy_series(&closes, 12) {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn all_falling_is_0() {
        let closes: Vec<f64> = (1..=20).rev().map(|x| x as f64).collect();
        for v in psy_series(&closes, 12) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn flat_counts_as_not_rising() {
        let closes = vec![5.0; 20];
        for v in psy_series(&closes, 12) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn alternating_is_50() {
        // up, down, up, down ... over an even period.
        let closes: Vec<f64> = (0..21)
            .map(|i| if i % 2 == 0 { 10.0 } else { 11.0 })
            .collect();
        let v = latest_psy(&closes, 12).unwrap();
        assert!((v - 50.0).abs() < 1e-10);
    }
}
