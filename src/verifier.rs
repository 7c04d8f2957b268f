// =============================================================================
// Delayed-Signal Verifier — T0 / T0+Δ/2 / T0+Δ indicator re-check
// =============================================================================
//
// A triggered signal with a verification delay parks here instead of going
// straight to the queues. A once-per-second sweep re-examines each pending
// entry after its delay elapses: the configured indicator fields must hold
// their trigger direction at three timepoints (for buys, every reading at or
// above the trigger baseline; for sells, at or below). Snapshots come from
// the pipeline's lookback ring; a missing timepoint rejects the signal.
//
// Seat switches cancel pending entries by direction; symbol cleanup cancels
// by symbol.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::SnapshotRing;
use crate::signal::{Signal, VerificationPoint};
use crate::strategy::dsl::{IndicatorField, IndicatorSource};
use crate::types::Direction;

/// Snapshot-matching tolerance around each timepoint.
const TIMEPOINT_TOLERANCE_MS: i64 = 5_000;

struct PendingVerification {
    signal: Signal,
    underlying: String,
    t0_ms: i64,
    delay_seconds: u64,
    fields: Vec<IndicatorField>,
}

/// Holds signals awaiting their delayed re-check.
pub struct DelayedSignalVerifier {
    pending: Mutex<HashMap<Uuid, PendingVerification>>,
}

impl DelayedSignalVerifier {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Park `signal` until `delay_seconds` after its trigger time. The
    /// signal's `trigger_indicators` provide the comparison baseline.
    pub fn enqueue(
        &self,
        signal: Signal,
        underlying: &str,
        delay_seconds: u64,
        fields: Vec<IndicatorField>,
    ) -> Uuid {
        let id = signal.id;
        debug!(
            symbol = %signal.symbol,
            action = %signal.action,
            delay_seconds,
            "signal parked for delayed verification"
        );
        self.pending.lock().insert(
            id,
            PendingVerification {
                t0_ms: signal.trigger_time_ms,
                signal,
                underlying: underlying.to_string(),
                delay_seconds,
                fields,
            },
        );
        id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run one sweep. Entries whose delay has elapsed are verified against
    /// the ring and either returned (verified) or dropped (rejected).
    pub fn sweep(&self, now_ms: i64, ring: &SnapshotRing) -> Vec<Signal> {
        let due: Vec<Uuid> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| now_ms >= p.t0_ms + (p.delay_seconds as i64) * 1_000)
                .map(|(id, _)| *id)
                .collect()
        };

        let mut verified = Vec::new();
        for id in due {
            let Some(entry) = self.pending.lock().remove(&id) else {
                continue;
            };
            match Self::verify(&entry, ring) {
                Ok(history) => {
                    let mut signal = entry.signal;
                    signal.verification_history = history;
                    info!(
                        symbol = %signal.symbol,
                        action = %signal.action,
                        "delayed signal verified"
                    );
                    verified.push(signal);
                }
                Err(reason) => {
                    info!(
                        symbol = %entry.signal.symbol,
                        action = %entry.signal.action,
                        reason,
                        "delayed signal rejected"
                    );
                }
            }
        }
        verified
    }

    fn verify(
        entry: &PendingVerification,
        ring: &SnapshotRing,
    ) -> Result<Vec<VerificationPoint>, String> {
        let delta_ms = (entry.delay_seconds as i64) * 1_000;
        let timepoints = [
            entry.t0_ms,
            entry.t0_ms + delta_ms / 2,
            entry.t0_ms + delta_ms,
        ];

        let is_buy = entry.signal.action.is_buy();
        let mut history = Vec::with_capacity(timepoints.len());

        for at_ms in timepoints {
            // Indicators are computed on the monitored underlying, not the
            // warrant the signal trades.
            let Some(snapshot) = ring.find_closest(&entry.underlying, at_ms, TIMEPOINT_TOLERANCE_MS)
            else {
                return Err("missing timepoint data".to_string());
            };

            let mut values = Vec::with_capacity(entry.fields.len());
            for field in &entry.fields {
                let Some(baseline) = entry
                    .signal
                    .trigger_indicators
                    .iter()
                    .find(|(f, _)| f == field)
                    .map(|(_, v)| *v)
                else {
                    return Err(format!("no trigger baseline for {field}"));
                };
                let Some(value) = snapshot.indicator(field) else {
                    return Err("missing timepoint data".to_string());
                };

                let holds = if is_buy {
                    value >= baseline
                } else {
                    value <= baseline
                };
                if !holds {
                    return Err(format!(
                        "{field} broke direction: {value:.4} vs baseline {baseline:.4}"
                    ));
                }
                values.push((*field, value));
            }
            history.push(VerificationPoint { at_ms, values });
        }

        Ok(history)
    }

    /// Cancel every pending signal on (underlying, direction). Used on seat
    /// switches.
    pub fn cancel_all_for_direction(&self, underlying: &str, direction: Direction) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| {
            !(p.underlying == underlying && p.signal.action.direction() == Some(direction))
        });
        let cancelled = before - pending.len();
        if cancelled > 0 {
            warn!(underlying, %direction, cancelled, "pending verifications cancelled");
        }
        cancelled
    }

    /// Cancel every pending signal for `symbol`. Used on cleanup.
    pub fn cancel_all_for_symbol(&self, symbol: &str) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| p.signal.symbol != symbol);
        before - pending.len()
    }
}

impl Default for DelayedSignalVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Fingerprint, IndicatorSnapshot};
    use crate::types::SignalAction;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const SYM: &str = "61999.HK";
    const UNDERLYING: &str = "HSI.HK";

    fn snapshot(at_ms: i64, rsi6: f64) -> Arc<IndicatorSnapshot> {
        let mut rsi = BTreeMap::new();
        rsi.insert(6, rsi6);
        Arc::new(IndicatorSnapshot {
            symbol: UNDERLYING.to_string(),
            price: 0.3,
            change_percent: 0.0,
            rsi,
            ema: BTreeMap::new(),
            psy: BTreeMap::new(),
            mfi: None,
            kdj: None,
            macd: None,
            computed_at_ms: at_ms,
            fingerprint: Fingerprint {
                len: at_ms as usize,
                last_close_bits: 0,
            },
        })
    }

    fn ring_with(readings: &[(i64, f64)]) -> SnapshotRing {
        let ring = SnapshotRing::new();
        for &(at_ms, rsi6) in readings {
            ring.push_on_change(&snapshot(at_ms, rsi6));
        }
        ring
    }

    fn buy_signal(t0_ms: i64, baseline_rsi6: f64) -> Signal {
        let mut s = Signal::new(SignalAction::BuyCall, SYM, "HSI BULL A", t0_ms, 1);
        s.trigger_indicators = vec![(IndicatorField::Rsi(6), baseline_rsi6)];
        s
    }

    #[test]
    fn not_due_before_delay() {
        let verifier = DelayedSignalVerifier::new();
        let ring = ring_with(&[(0, 20.0)]);
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        assert!(verifier.sweep(30_000, &ring).is_empty());
        assert_eq!(verifier.pending_count(), 1);
    }

    #[test]
    fn buy_verifies_when_direction_holds() {
        let verifier = DelayedSignalVerifier::new();
        // Baseline 20; every later reading >= 20.
        let ring = ring_with(&[(0, 20.0), (30_000, 22.0), (60_000, 25.0)]);
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        let verified = verifier.sweep(60_000, &ring);
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].verification_history.len(), 3);
        assert_eq!(verifier.pending_count(), 0);
    }

    #[test]
    fn buy_rejected_when_direction_breaks() {
        let verifier = DelayedSignalVerifier::new();
        // Midpoint dips below baseline.
        let ring = ring_with(&[(0, 20.0), (30_000, 18.0), (60_000, 25.0)]);
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        assert!(verifier.sweep(60_000, &ring).is_empty());
        assert_eq!(verifier.pending_count(), 0);
    }

    #[test]
    fn sell_requires_non_increasing_readings() {
        let verifier = DelayedSignalVerifier::new();
        let ring = ring_with(&[(0, 80.0), (30_000, 78.0), (60_000, 75.0)]);

        let mut s = Signal::new(SignalAction::SellCall, SYM, "HSI BULL A", 0, 1);
        s.trigger_indicators = vec![(IndicatorField::Rsi(6), 80.0)];
        verifier.enqueue(s, "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        assert_eq!(verifier.sweep(60_000, &ring).len(), 1);
    }

    #[test]
    fn missing_timepoint_rejects() {
        let verifier = DelayedSignalVerifier::new();
        // No snapshot anywhere near the 30 s midpoint.
        let ring = ring_with(&[(0, 20.0), (60_000, 25.0)]);
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        assert!(verifier.sweep(60_000, &ring).is_empty());
        assert_eq!(verifier.pending_count(), 0);
    }

    #[test]
    fn timepoint_tolerance_accepts_nearby_snapshots() {
        let verifier = DelayedSignalVerifier::new();
        // Snapshots 3 s off each ideal timepoint.
        let ring = ring_with(&[(3_000, 20.0), (33_000, 22.0), (57_000, 25.0)]);
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        assert_eq!(verifier.sweep(60_000, &ring).len(), 1);
    }

    #[test]
    fn cancel_by_direction() {
        let verifier = DelayedSignalVerifier::new();
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        let mut put = Signal::new(SignalAction::BuyPut, "62888.HK", "HSI BEAR", 0, 1);
        put.trigger_indicators = vec![(IndicatorField::Rsi(6), 80.0)];
        verifier.enqueue(put, "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);

        assert_eq!(verifier.cancel_all_for_direction("HSI.HK", Direction::Long), 1);
        assert_eq!(verifier.pending_count(), 1);
    }

    #[test]
    fn cancel_by_symbol() {
        let verifier = DelayedSignalVerifier::new();
        verifier.enqueue(buy_signal(0, 20.0), "HSI.HK", 60, vec![IndicatorField::Rsi(6)]);
        assert_eq!(verifier.cancel_all_for_symbol(SYM), 1);
        assert_eq!(verifier.pending_count(), 0);
    }
}
