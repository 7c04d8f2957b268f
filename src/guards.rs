// =============================================================================
// Protective Guards — warrant distance, liquidation cooldowns, loss checks
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::LiquidationCooldownConfig;
use crate::hk_time;
use crate::types::Direction;

/// Minimum distance-to-call (percent of underlying) to buy a bull warrant.
pub const BULL_WARRANT_MIN_DISTANCE_PERCENT: f64 = 0.5;
/// Maximum (signed) distance-to-call to buy a bear warrant.
pub const BEAR_WARRANT_MAX_DISTANCE_PERCENT: f64 = -0.5;

/// Distances inside these bands force-liquidate the held warrant before the
/// recall barrier is hit.
pub const BULL_LIQUIDATION_DISTANCE_PERCENT: f64 = 0.3;
pub const BEAR_LIQUIDATION_DISTANCE_PERCENT: f64 = -0.3;

/// Seconds between verified-signal risk checks per (symbol, side).
pub const VERIFIED_SIGNAL_COOLDOWN_SECONDS: u64 = 60;

// ---------------------------------------------------------------------------
// Warrant distance
// ---------------------------------------------------------------------------

/// Signed distance between the underlying and the warrant's call price, as a
/// percentage of the underlying. Positive when the underlying is above the
/// call price (safe for bulls), negative below it (safe for bears).
pub fn warrant_distance_pct(monitor_price: f64, call_price: f64) -> f64 {
    if monitor_price <= 0.0 {
        return 0.0;
    }
    (monitor_price - call_price) / monitor_price * 100.0
}

/// Buy-side distance gate.
pub fn buy_distance_ok(direction: Direction, monitor_price: f64, call_price: f64) -> bool {
    let distance = warrant_distance_pct(monitor_price, call_price);
    match direction {
        Direction::Long => distance >= BULL_WARRANT_MIN_DISTANCE_PERCENT,
        Direction::Short => distance <= BEAR_WARRANT_MAX_DISTANCE_PERCENT,
    }
}

/// True when the held warrant has drifted inside the liquidation band.
pub fn liquidation_distance_breached(
    direction: Direction,
    monitor_price: f64,
    call_price: f64,
) -> bool {
    let distance = warrant_distance_pct(monitor_price, call_price);
    match direction {
        Direction::Long => distance < BULL_LIQUIDATION_DISTANCE_PERCENT,
        Direction::Short => distance > BEAR_LIQUIDATION_DISTANCE_PERCENT,
    }
}

// ---------------------------------------------------------------------------
// Liquidation cooldown
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LiquidationRecord {
    day_key: String,
    at_ms: i64,
}

/// Tracks the most recent protective liquidation per seat; consulted on
/// every buy.
pub struct LiquidationCooldownTracker {
    records: RwLock<HashMap<(String, Direction), LiquidationRecord>>,
}

impl LiquidationCooldownTracker {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_liquidation(&self, underlying: &str, direction: Direction, now_ms: i64) {
        let record = LiquidationRecord {
            day_key: hk_time::hk_date_key(now_ms),
            at_ms: now_ms,
        };
        info!(underlying, %direction, day = %record.day_key, "protective liquidation recorded");
        self.records
            .write()
            .insert((underlying.to_string(), direction), record);
    }

    /// `Ok(())` when buying is allowed again; `Err(reason)` while frozen.
    pub fn check(
        &self,
        underlying: &str,
        direction: Direction,
        config: &LiquidationCooldownConfig,
        now_ms: i64,
    ) -> Result<(), String> {
        let records = self.records.read();
        let Some(record) = records.get(&(underlying.to_string(), direction)) else {
            return Ok(());
        };

        match config {
            LiquidationCooldownConfig::Minutes { minutes } => {
                let until_ms = record.at_ms + i64::from(*minutes) * 60_000;
                if now_ms < until_ms {
                    let remaining_s = (until_ms - now_ms) / 1_000;
                    Err(format!(
                        "liquidation cooldown active: {remaining_s}s remaining"
                    ))
                } else {
                    Ok(())
                }
            }
            LiquidationCooldownConfig::MidnightEligible => {
                if hk_time::hk_date_key(now_ms) == record.day_key {
                    Err(format!(
                        "liquidation freeze until next HK midnight (since {})",
                        record.day_key
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl Default for LiquidationCooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Verification cooldown
// ---------------------------------------------------------------------------

/// Rate limit on risk-checking verified signals per (symbol, buy|sell).
pub struct VerificationCooldownTracker {
    last_check_ms: RwLock<HashMap<(String, bool), i64>>,
}

impl VerificationCooldownTracker {
    pub fn new() -> Self {
        Self {
            last_check_ms: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `true` (and stamps the slot) when enough time has passed
    /// since the last risk check of this (symbol, side).
    pub fn try_acquire(&self, symbol: &str, is_buy: bool, now_ms: i64) -> bool {
        let key = (symbol.to_string(), is_buy);
        let mut map = self.last_check_ms.write();
        if let Some(last) = map.get(&key) {
            if now_ms - last < (VERIFIED_SIGNAL_COOLDOWN_SECONDS as i64) * 1_000 {
                return false;
            }
        }
        map.insert(key, now_ms);
        true
    }

    pub fn clear(&self) {
        self.last_check_ms.write().clear();
    }
}

impl Default for VerificationCooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unrealized loss (offset-aware)
// ---------------------------------------------------------------------------

/// Assess one seat position against its unrealized-loss cap.
///
/// Today's realized loss on the same seat is added to the mark-to-market
/// loss, so a seat that already burned budget intraday trips earlier.
/// Returns the combined loss magnitude when the cap is breached.
pub fn unrealized_loss_breach(
    cost_avg: f64,
    quantity: f64,
    current_price: f64,
    realized_today_pnl: f64,
    max_unrealized_loss: f64,
) -> Option<f64> {
    if quantity <= 0.0 || cost_avg <= 0.0 || current_price <= 0.0 {
        return None;
    }

    let unrealized = (current_price - cost_avg) * quantity;
    let realized_loss = realized_today_pnl.min(0.0);
    let combined = unrealized + realized_loss;

    if combined < -max_unrealized_loss {
        let loss = -combined;
        warn!(
            cost_avg,
            quantity, current_price, realized_today_pnl, loss, "unrealized loss cap breached"
        );
        Some(loss)
    } else {
        None
    }
}
