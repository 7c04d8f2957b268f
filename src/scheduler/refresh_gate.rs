// =============================================================================
// RefreshGate — post-trade cache freshness barrier
// =============================================================================
//
// Every trade submission marks the gate stale and enqueues a refresh task
// carrying the returned version. Workers that must not act on stale position
// data suspend in `wait_for_fresh` until the refresh worker acknowledges
// that version (or a newer one) via `mark_fresh`.
//
// Freshness is `stale_version >= current_version`; both counters only grow.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Default ceiling on a freshness wait before proceeding with possibly-stale
/// data.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RefreshGate {
    current_version: AtomicU64,
    stale_version: AtomicU64,
    notify: Notify,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self {
            current_version: AtomicU64::new(0),
            stale_version: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Invalidate downstream caches. Returns the version the refresher must
    /// acknowledge.
    pub fn mark_stale(&self) -> u64 {
        let v = self.current_version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(version = v, "refresh gate marked stale");
        v
    }

    /// Acknowledge a refresh for `version`. Raises the stale watermark
    /// monotonically and wakes waiters.
    pub fn mark_fresh(&self, version: u64) {
        let mut observed = self.stale_version.load(Ordering::SeqCst);
        while observed < version {
            match self.stale_version.compare_exchange(
                observed,
                version,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
        debug!(version, "refresh gate marked fresh");
        self.notify.notify_waiters();
    }

    pub fn is_fresh(&self) -> bool {
        self.stale_version.load(Ordering::SeqCst) >= self.current_version.load(Ordering::SeqCst)
    }

    /// Current version for diagnostics.
    pub fn current_version(&self) -> u64 {
        self.current_version.load(Ordering::SeqCst)
    }

    /// Suspend until the gate is fresh or `timeout` elapses. Returns `true`
    /// when fresh; on timeout the caller proceeds with possibly-stale data
    /// and a warning is logged.
    pub async fn wait_for_fresh(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.is_fresh() {
                return true;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after arming the waiter so a concurrent mark_fresh
            // cannot slip between the check and the await.
            if self.is_fresh() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    current = self.current_version.load(Ordering::SeqCst),
                    stale = self.stale_version.load(Ordering::SeqCst),
                    "refresh gate wait timed out — proceeding with possibly-stale data"
                );
                return false;
            }
        }
    }
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_fresh() {
        let gate = RefreshGate::new();
        assert!(gate.is_fresh());
    }

    #[test]
    fn stale_until_acknowledged() {
        let gate = RefreshGate::new();
        let v = gate.mark_stale();
        assert!(!gate.is_fresh());
        gate.mark_fresh(v);
        assert!(gate.is_fresh());
    }

    #[test]
    fn old_acknowledgement_does_not_freshen() {
        let gate = RefreshGate::new();
        let v1 = gate.mark_stale();
        let v2 = gate.mark_stale();
        gate.mark_fresh(v1);
        assert!(!gate.is_fresh());
        gate.mark_fresh(v2);
        assert!(gate.is_fresh());
    }

    #[test]
    fn mark_fresh_is_monotonic() {
        let gate = RefreshGate::new();
        let v1 = gate.mark_stale();
        let v2 = gate.mark_stale();
        gate.mark_fresh(v2);
        // A late, lower acknowledgement must not regress the watermark.
        gate.mark_fresh(v1);
        assert!(gate.is_fresh());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_fresh() {
        let gate = RefreshGate::new();
        assert!(gate.wait_for_fresh(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn wait_wakes_on_matching_ack() {
        let gate = Arc::new(RefreshGate::new());
        let v = gate.mark_stale();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_fresh(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.mark_fresh(v);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_on_missing_ack() {
        let gate = RefreshGate::new();
        gate.mark_stale();
        assert!(!gate.wait_for_fresh(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn ack_must_cover_latest_stale_version() {
        let gate = Arc::new(RefreshGate::new());
        let v1 = gate.mark_stale();
        let _v2 = gate.mark_stale();

        gate.mark_fresh(v1);
        assert!(!gate.wait_for_fresh(Duration::from_millis(30)).await);
    }
}
