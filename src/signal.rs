// =============================================================================
// Trading signals — the unit of work moved through the buy/sell queues
// =============================================================================

use uuid::Uuid;

use crate::strategy::dsl::IndicatorField;
use crate::types::{OrderType, SignalAction};

/// Indicator readings captured at one verification timepoint.
#[derive(Debug, Clone)]
pub struct VerificationPoint {
    pub at_ms: i64,
    pub values: Vec<(IndicatorField, f64)>,
}

/// A buy/sell/hold instruction produced by a monitor's strategy.
///
/// Signals are plain owned values: they are created by the strategy, moved
/// through a queue, and dropped by the worker that finishes with them.
/// `seat_version` pins the seat generation the signal was created against;
/// a worker must drop the signal when the registry has moved on.
#[derive(Debug, Clone)]
pub struct Signal {
    pub id: Uuid,
    pub action: SignalAction,
    pub symbol: String,
    pub symbol_name: String,
    pub price: Option<f64>,
    pub lot_size: Option<u32>,
    pub quantity: Option<f64>,
    pub reason: Option<String>,
    pub trigger_time_ms: i64,
    pub seat_version: u32,
    pub order_type_override: Option<OrderType>,
    pub is_protective_liquidation: bool,
    /// Indicator readings at trigger time; baseline for delayed verification.
    pub trigger_indicators: Vec<(IndicatorField, f64)>,
    /// Filled by the verifier: readings at each re-check timepoint.
    pub verification_history: Vec<VerificationPoint>,
    /// Buy orders a sell signal is reserved against.
    pub related_buy_order_ids: Vec<String>,
}

impl Signal {
    pub fn new(
        action: SignalAction,
        symbol: impl Into<String>,
        symbol_name: impl Into<String>,
        trigger_time_ms: i64,
        seat_version: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            symbol: symbol.into(),
            symbol_name: symbol_name.into(),
            price: None,
            lot_size: None,
            quantity: None,
            reason: None,
            trigger_time_ms,
            seat_version,
            order_type_override: None,
            is_protective_liquidation: false,
            trigger_indicators: Vec::new(),
            verification_history: Vec::new(),
            related_buy_order_ids: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn protective(mut self) -> Self {
        self.is_protective_liquidation = true;
        self
    }

    /// Mark the signal rejected: demote to HOLD and record why.
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.action = SignalAction::Hold;
        self.reason = Some(reason.into());
    }
}
