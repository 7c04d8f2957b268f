// =============================================================================
// Doomsday Protection — end-of-session buy rejection and auto-liquidation
// =============================================================================
//
// HK sessions: 09:30-12:00 and 13:00-16:00; half days close at 12:00.
//   - New buys are rejected in the last 15 minutes before the session end.
//   - All seat positions are liquidated in the last 5 minutes.
//   - Pending buy orders are cancelled once per HK date when the reject
//     window first opens (the latch).
//
// Open-protection (N minutes after each open) suppresses signal generation
// only; execution of already-queued work is unaffected.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::OpenProtectionConfig;
use crate::hk_time::{
    self, AFTERNOON_CLOSE_MIN, AFTERNOON_OPEN_MIN, MORNING_CLOSE_MIN, MORNING_OPEN_MIN,
};
use crate::registry::SymbolRegistry;
use crate::signal::Signal;
use crate::types::{Position, Quote, SignalAction};

/// Minutes before session end in which buys are rejected.
const REJECT_BUY_WINDOW_MIN: u32 = 15;
/// Minutes before session end in which positions are force-closed.
const LIQUIDATE_WINDOW_MIN: u32 = 5;

// ---------------------------------------------------------------------------
// Session window predicates
// ---------------------------------------------------------------------------

fn session_end_min(is_half_day: bool) -> u32 {
    if is_half_day {
        MORNING_CLOSE_MIN
    } else {
        AFTERNOON_CLOSE_MIN
    }
}

/// Inside a continuous trading session.
pub fn is_trading_time(minutes_of_day: u32, is_half_day: bool) -> bool {
    let morning = (MORNING_OPEN_MIN..MORNING_CLOSE_MIN).contains(&minutes_of_day);
    if is_half_day {
        return morning;
    }
    morning || (AFTERNOON_OPEN_MIN..AFTERNOON_CLOSE_MIN).contains(&minutes_of_day)
}

/// Inside the last 15 minutes before the day's session end.
pub fn should_reject_buy(minutes_of_day: u32, is_half_day: bool) -> bool {
    let end = session_end_min(is_half_day);
    minutes_of_day >= end - REJECT_BUY_WINDOW_MIN && minutes_of_day < end
}

/// Inside the last 5 minutes before the day's session end.
pub fn is_before_close_5_minutes(minutes_of_day: u32, is_half_day: bool) -> bool {
    let end = session_end_min(is_half_day);
    minutes_of_day >= end - LIQUIDATE_WINDOW_MIN && minutes_of_day < end
}

/// Inside the configured quiet window after a session open.
pub fn in_open_protection(
    minutes_of_day: u32,
    is_half_day: bool,
    config: &OpenProtectionConfig,
) -> bool {
    if (MORNING_OPEN_MIN..MORNING_OPEN_MIN + config.morning_minutes).contains(&minutes_of_day) {
        return true;
    }
    if !is_half_day
        && (AFTERNOON_OPEN_MIN..AFTERNOON_OPEN_MIN + config.afternoon_minutes)
            .contains(&minutes_of_day)
    {
        return true;
    }
    false
}

// ---------------------------------------------------------------------------
// Protector
// ---------------------------------------------------------------------------

/// Stateful close-of-day guard. Holds the once-per-day cancel latch.
pub struct DoomsdayProtector {
    enabled: bool,
    cancel_latch_day: Mutex<Option<String>>,
}

impl DoomsdayProtector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            cancel_latch_day: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn should_reject_buy(&self, now_ms: i64, is_half_day: bool) -> bool {
        self.enabled && should_reject_buy(hk_time::hk_minutes_of_day(now_ms), is_half_day)
    }

    pub fn is_auto_liquidate_window(&self, now_ms: i64, is_half_day: bool) -> bool {
        self.enabled && is_before_close_5_minutes(hk_time::hk_minutes_of_day(now_ms), is_half_day)
    }

    /// Arms once per HK date: returns `true` exactly on the first call for
    /// `day_key`, which triggers the pending-buy cancellation sweep.
    pub fn arm_cancel_latch(&self, day_key: &str) -> bool {
        let mut latch = self.cancel_latch_day.lock();
        if latch.as_deref() == Some(day_key) {
            return false;
        }
        *latch = Some(day_key.to_string());
        true
    }

    /// Cross-day reset of the latch.
    pub fn reset_day(&self) {
        *self.cancel_latch_day.lock() = None;
    }

    /// Build one protective sell signal per seat-held position.
    ///
    /// Positions whose symbol matches no registry seat are ignored; duplicate
    /// (action, symbol) pairs collapse to the first occurrence.
    pub fn build_clearance_signals(
        &self,
        registry: &SymbolRegistry,
        positions: &HashMap<String, Position>,
        quotes: &HashMap<String, Quote>,
        now_ms: i64,
    ) -> Vec<Signal> {
        let mut seen: HashSet<(SignalAction, String)> = HashSet::new();
        let mut signals = Vec::new();

        for (symbol, position) in positions {
            if position.available_quantity <= 0.0 {
                continue;
            }
            let Some((underlying, direction)) = registry.resolve_seat_by_symbol(symbol) else {
                debug!(symbol, "clearance skip: not a seat symbol");
                continue;
            };
            let action = SignalAction::sell_for(direction);
            if !seen.insert((action, symbol.clone())) {
                continue;
            }

            let seat_version = registry
                .get_seat_version(&underlying, direction)
                .unwrap_or(0);
            let quote = quotes.get(symbol);

            let mut signal = Signal::new(
                action,
                symbol.clone(),
                quote.map(|q| q.name.clone()).unwrap_or_default(),
                now_ms,
                seat_version,
            )
            .protective()
            .with_reason("close-of-day clearance");
            signal.price = quote.map(|q| q.price);
            signal.lot_size = quote.map(|q| q.lot_size);
            signal.quantity = Some(position.available_quantity);
            signals.push(signal);
        }

        info!(count = signals.len(), "clearance signals built");
        signals
    }
}
