// =============================================================================
// Shared types used across the Meridian warrant engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which seat of a monitor an instrument or signal belongs to.
///
/// A LONG seat holds a bull warrant, a SHORT seat holds a bear warrant. Both
/// are held as long positions in the warrant itself; the direction only
/// describes the exposure to the monitored underlying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// The action a signal asks the engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    BuyCall,
    SellCall,
    BuyPut,
    SellPut,
    Hold,
}

impl SignalAction {
    /// Seat direction the action operates on. `Hold` has none.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::BuyCall | Self::SellCall => Some(Direction::Long),
            Self::BuyPut | Self::SellPut => Some(Direction::Short),
            Self::Hold => None,
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, Self::BuyCall | Self::BuyPut)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Self::SellCall | Self::SellPut)
    }

    /// The sell action that closes positions held on `direction`'s seat.
    pub fn sell_for(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::SellCall,
            Direction::Short => Self::SellPut,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BuyCall => write!(f, "BUYCALL"),
            Self::SellCall => write!(f, "SELLCALL"),
            Self::BuyPut => write!(f, "BUYPUT"),
            Self::SellPut => write!(f, "SELLPUT"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Broker order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// HKEX order types supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Limit order.
    Lo,
    /// Enhanced limit order.
    Elo,
    /// Market order.
    Mo,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Elo
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lo => write!(f, "LO"),
            Self::Elo => write!(f, "ELO"),
            Self::Mo => write!(f, "MO"),
        }
    }
}

/// Broker order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    WaitToNew,
    PartialFilled,
    Filled,
    WaitToReplace,
    PendingReplace,
    Cancelled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    /// Statuses that still occupy the book and can be replaced or cancelled.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::New
                | Self::WaitToNew
                | Self::PartialFilled
                | Self::WaitToReplace
                | Self::PendingReplace
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "New" | "NEW" => Self::New,
            "WaitToNew" => Self::WaitToNew,
            "PartialFilled" | "PartiallyFilled" => Self::PartialFilled,
            "Filled" | "FILLED" => Self::Filled,
            "WaitToReplace" => Self::WaitToReplace,
            "PendingReplace" => Self::PendingReplace,
            "Cancelled" | "Canceled" | "CANCELED" => Self::Cancelled,
            "Rejected" | "REJECTED" => Self::Rejected,
            "Expired" | "EXPIRED" => Self::Expired,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::WaitToNew => "WaitToNew",
            Self::PartialFilled => "PartialFilled",
            Self::Filled => "Filled",
            Self::WaitToReplace => "WaitToReplace",
            Self::PendingReplace => "PendingReplace",
            Self::Cancelled => "Cancelled",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Candlestick periods the engine pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandlePeriod {
    OneMinute,
    FiveMinute,
    FifteenMinute,
    SixtyMinute,
    Day,
}

impl CandlePeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinute => "5m",
            Self::FifteenMinute => "15m",
            Self::SixtyMinute => "60m",
            Self::Day => "1d",
        }
    }
}

impl std::fmt::Display for CandlePeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A live quote composed from the push feed and cached static data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub prev_close: f64,
    /// Exchange timestamp in milliseconds.
    pub timestamp_ms: i64,
    pub lot_size: u32,
}

impl Quote {
    pub fn change_percent(&self) -> f64 {
        if self.prev_close > 0.0 {
            (self.price - self.prev_close) / self.prev_close * 100.0
        } else {
            0.0
        }
    }
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub turnover: Option<f64>,
    /// Candle open timestamp in milliseconds.
    pub timestamp_ms: i64,
}

/// A broker position held in the local cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub available_quantity: f64,
    pub cost_price: f64,
    pub currency: String,
    pub market: String,
}

/// Trading-day lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingDayInfo {
    pub is_trading_day: bool,
    pub is_half_day: bool,
}
