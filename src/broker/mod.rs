// =============================================================================
// Brokerage Gateway — narrow capability traits over the broker's SDK surface
// =============================================================================
//
// The engine talks to the brokerage exclusively through `QuoteGateway` and
// `TradeGateway`. One production implementation (`LongportGateway`) speaks
// signed REST + WebSocket push; the in-memory `MockGateway` backs the test
// suite. Everything above this module is broker-agnostic.
// =============================================================================

pub mod client;
pub mod push;

#[cfg(test)]
pub mod mock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{Candle, CandlePeriod, OrderSide, OrderStatus, OrderType};

pub use client::LongportGateway;

// ---------------------------------------------------------------------------
// Wire models
// ---------------------------------------------------------------------------

/// A pulled quote used to seed the local cache at subscription time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub last_done: f64,
    pub prev_close: f64,
    pub timestamp_ms: i64,
}

/// A pushed trade-price update. `prev_close` is not on the wire; the
/// market-data client joins it from its own cache.
#[derive(Debug, Clone)]
pub struct QuotePush {
    pub symbol: String,
    pub last_done: f64,
    pub timestamp_ms: i64,
}

/// Static security data cached once per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInfo {
    pub symbol: String,
    pub name: String,
    pub lot_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarrantType {
    Bull,
    Bear,
}

/// A CBBC candidate row from the warrant screener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarrantBrief {
    pub symbol: String,
    pub name: String,
    pub warrant_type: WarrantType,
    pub call_price: Option<f64>,
    pub expiry_date: NaiveDate,
    /// Day turnover in HKD.
    pub turnover: f64,
    pub last_done: f64,
    pub lot_size: u32,
}

/// Trading-day ranges returned by the calendar endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingDaysPage {
    pub trading_days: Vec<NaiveDate>,
    pub half_trading_days: Vec<NaiveDate>,
}

/// Warrant screener filter.
#[derive(Debug, Clone)]
pub struct WarrantListFilter {
    pub warrant_type: WarrantType,
    /// Sort key understood by the screener; the engine always asks for
    /// turnover-descending and refines locally.
    pub sort_by_turnover_desc: bool,
}

/// Account funds snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub currency: String,
    pub total_cash: f64,
    pub available_cash: f64,
    pub net_assets: f64,
}

/// A position row as the broker reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: f64,
    pub available_quantity: f64,
    pub cost_price: f64,
    pub currency: String,
    pub market: String,
}

/// An order row from `today_orders` / `history_orders`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub price: Option<f64>,
    pub quantity: f64,
    pub executed_price: Option<f64>,
    pub executed_quantity: f64,
    pub submitted_at_ms: i64,
    pub updated_at_ms: i64,
}

/// An order-changed push event. Events can arrive out of order; `sequence`
/// lets the consumer re-order them.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub sequence: u64,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub submitted_quantity: f64,
    pub executed_quantity: f64,
    pub executed_price: Option<f64>,
    pub price: Option<f64>,
    pub updated_at_ms: i64,
    /// Broker-side error text on Rejected.
    pub message: Option<String>,
}

/// New-order request.
#[derive(Debug, Clone)]
pub struct SubmitOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub time_in_force: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub remark: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitOrderResponse {
    pub order_id: String,
}

pub type QuoteCallback = Box<dyn Fn(QuotePush) + Send + Sync>;
pub type OrderCallback = Box<dyn Fn(OrderUpdate) + Send + Sync>;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Market-data side of the brokerage SDK.
#[async_trait]
pub trait QuoteGateway: Send + Sync {
    async fn subscribe_quotes(&self, symbols: &[String]) -> Result<()>;
    async fn unsubscribe_quotes(&self, symbols: &[String]) -> Result<()>;

    /// Pull quotes (subscription seeding and prev-close capture).
    async fn quotes(&self, symbols: &[String]) -> Result<Vec<QuoteSnapshot>>;

    async fn candlesticks(
        &self,
        symbol: &str,
        period: CandlePeriod,
        count: usize,
    ) -> Result<Vec<Candle>>;

    async fn trading_days(
        &self,
        market: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<TradingDaysPage>;

    async fn static_info(&self, symbols: &[String]) -> Result<Vec<StaticInfo>>;

    /// Screener listing of warrants on `underlying`.
    async fn warrant_list(
        &self,
        underlying: &str,
        filter: WarrantListFilter,
    ) -> Result<Vec<WarrantBrief>>;

    /// Detailed warrant quotes (call price refresh for held seats).
    async fn warrant_quote(&self, symbols: &[String]) -> Result<Vec<WarrantBrief>>;

    /// Register the push handler for trade-price updates.
    fn set_on_quote(&self, cb: QuoteCallback);
}

/// Trading side of the brokerage SDK.
#[async_trait]
pub trait TradeGateway: Send + Sync {
    async fn submit_order(&self, req: SubmitOrderRequest) -> Result<SubmitOrderResponse>;
    async fn replace_order(&self, order_id: &str, quantity: f64, price: Option<f64>)
        -> Result<()>;
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn today_orders(&self, symbol: Option<&str>) -> Result<Vec<RawOrder>>;
    async fn account_balance(&self, currency: &str) -> Result<AccountSnapshot>;
    async fn stock_positions(&self, symbols: &[String]) -> Result<Vec<BrokerPosition>>;

    /// Register the push handler for order-changed events.
    fn set_on_order_changed(&self, cb: OrderCallback);
}

// ---------------------------------------------------------------------------
// Error classification (retry policy input)
// ---------------------------------------------------------------------------

/// Whether a broker error is worth retrying.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}").to_lowercase();
    text.contains("timeout")
        || text.contains("timed out")
        || text.contains("network")
        || text.contains("connection")
        || text.contains("rate limit")
        || text.contains("429")
        || text.contains("503")
}
