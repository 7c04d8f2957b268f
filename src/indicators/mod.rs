// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators consumed by the
// signal pipeline.  Every public function returns `Option<T>` or an empty
// series so callers are forced to handle insufficient-data and numerical
// edge cases.

pub mod ema;
pub mod kdj;
pub mod macd;
pub mod mfi;
pub mod psy;
pub mod rsi;

pub use kdj::KdjValue;
pub use macd::MacdValue;
