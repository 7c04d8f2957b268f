// =============================================================================
// Strategy — signal-config DSL and per-monitor rule evaluation
// =============================================================================

pub mod dsl;
pub mod engine;

pub use engine::{MonitorStrategy, SeatView};
