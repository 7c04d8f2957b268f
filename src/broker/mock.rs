// =============================================================================
// MockGateway — in-memory broker used by the test suite
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use super::{
    AccountSnapshot, BrokerPosition, OrderCallback, OrderUpdate, QuoteCallback, QuotePush,
    QuoteSnapshot, RawOrder, StaticInfo, SubmitOrderRequest, SubmitOrderResponse, TradingDaysPage,
    WarrantBrief, WarrantListFilter,
};
use super::{QuoteGateway, TradeGateway};
use crate::types::{Candle, CandlePeriod};

/// Scripted broker double. Tests pre-load responses and inspect recorded
/// calls afterwards.
#[derive(Default)]
pub struct MockGateway {
    pub quotes: Mutex<HashMap<String, QuoteSnapshot>>,
    pub candles: Mutex<HashMap<(String, CandlePeriod), Vec<Candle>>>,
    pub static_infos: Mutex<HashMap<String, StaticInfo>>,
    pub warrants: Mutex<Vec<WarrantBrief>>,
    pub trading_days_page: Mutex<TradingDaysPage>,
    pub account: Mutex<AccountSnapshot>,
    pub positions: Mutex<Vec<BrokerPosition>>,
    pub today_orders_response: Mutex<Vec<RawOrder>>,

    pub subscribed: Mutex<Vec<String>>,
    pub unsubscribed: Mutex<Vec<String>>,
    pub submitted: Mutex<Vec<SubmitOrderRequest>>,
    pub replaced: Mutex<Vec<(String, f64, Option<f64>)>>,
    pub cancelled: Mutex<Vec<String>>,

    /// Error text the next submit/replace returns, if set.
    pub submit_error: Mutex<Option<String>>,
    pub replace_error: Mutex<Option<String>>,

    next_order_id: AtomicU64,
    on_quote: Mutex<Option<QuoteCallback>>,
    on_order: Mutex<Option<OrderCallback>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, symbol: &str, last_done: f64, prev_close: f64) {
        self.quotes.lock().insert(
            symbol.to_string(),
            QuoteSnapshot {
                symbol: symbol.to_string(),
                last_done,
                prev_close,
                timestamp_ms: 0,
            },
        );
    }

    pub fn set_static_info(&self, symbol: &str, name: &str, lot_size: u32) {
        self.static_infos.lock().insert(
            symbol.to_string(),
            StaticInfo {
                symbol: symbol.to_string(),
                name: name.to_string(),
                lot_size,
            },
        );
    }

    pub fn set_candles(&self, symbol: &str, period: CandlePeriod, candles: Vec<Candle>) {
        self.candles
            .lock()
            .insert((symbol.to_string(), period), candles);
    }

    /// Simulate a pushed trade-price update.
    pub fn push_quote(&self, symbol: &str, last_done: f64, timestamp_ms: i64) {
        if let Some(cb) = self.on_quote.lock().as_ref() {
            cb(QuotePush {
                symbol: symbol.to_string(),
                last_done,
                timestamp_ms,
            });
        }
    }

    /// Simulate a pushed order-changed event.
    pub fn push_order_update(&self, update: OrderUpdate) {
        if let Some(cb) = self.on_order.lock().as_ref() {
            cb(update);
        }
    }
}

#[async_trait]
impl QuoteGateway for MockGateway {
    async fn subscribe_quotes(&self, symbols: &[String]) -> Result<()> {
        self.subscribed.lock().extend(symbols.iter().cloned());
        Ok(())
    }

    async fn unsubscribe_quotes(&self, symbols: &[String]) -> Result<()> {
        self.unsubscribed.lock().extend(symbols.iter().cloned());
        Ok(())
    }

    async fn quotes(&self, symbols: &[String]) -> Result<Vec<QuoteSnapshot>> {
        let quotes = self.quotes.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| quotes.get(s).cloned())
            .collect())
    }

    async fn candlesticks(
        &self,
        symbol: &str,
        period: CandlePeriod,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let candles = self.candles.lock();
        let series = candles
            .get(&(symbol.to_string(), period))
            .cloned()
            .unwrap_or_default();
        let start = series.len().saturating_sub(count);
        Ok(series[start..].to_vec())
    }

    async fn trading_days(
        &self,
        _market: &str,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<TradingDaysPage> {
        Ok(self.trading_days_page.lock().clone())
    }

    async fn static_info(&self, symbols: &[String]) -> Result<Vec<StaticInfo>> {
        let infos = self.static_infos.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| infos.get(s).cloned())
            .collect())
    }

    async fn warrant_list(
        &self,
        _underlying: &str,
        filter: WarrantListFilter,
    ) -> Result<Vec<WarrantBrief>> {
        let mut list: Vec<WarrantBrief> = self
            .warrants
            .lock()
            .iter()
            .filter(|w| w.warrant_type == filter.warrant_type)
            .cloned()
            .collect();
        if filter.sort_by_turnover_desc {
            list.sort_by(|a, b| b.turnover.total_cmp(&a.turnover));
        }
        Ok(list)
    }

    async fn warrant_quote(&self, symbols: &[String]) -> Result<Vec<WarrantBrief>> {
        Ok(self
            .warrants
            .lock()
            .iter()
            .filter(|w| symbols.contains(&w.symbol))
            .cloned()
            .collect())
    }

    fn set_on_quote(&self, cb: QuoteCallback) {
        *self.on_quote.lock() = Some(cb);
    }
}

#[async_trait]
impl TradeGateway for MockGateway {
    async fn submit_order(&self, req: SubmitOrderRequest) -> Result<SubmitOrderResponse> {
        if let Some(err) = self.submit_error.lock().clone() {
            bail!("{err}");
        }
        let n = self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted.lock().push(req);
        Ok(SubmitOrderResponse {
            order_id: format!("MOCK-{n}"),
        })
    }

    async fn replace_order(
        &self,
        order_id: &str,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<()> {
        if let Some(err) = self.replace_error.lock().clone() {
            bail!("{err}");
        }
        self.replaced
            .lock()
            .push((order_id.to_string(), quantity, price));
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.cancelled.lock().push(order_id.to_string());
        Ok(())
    }

    async fn today_orders(&self, symbol: Option<&str>) -> Result<Vec<RawOrder>> {
        let orders = self.today_orders_response.lock();
        Ok(match symbol {
            Some(s) => orders.iter().filter(|o| o.symbol == s).cloned().collect(),
            None => orders.clone(),
        })
    }

    async fn account_balance(&self, _currency: &str) -> Result<AccountSnapshot> {
        Ok(self.account.lock().clone())
    }

    async fn stock_positions(&self, symbols: &[String]) -> Result<Vec<BrokerPosition>> {
        let positions = self.positions.lock();
        Ok(if symbols.is_empty() {
            positions.clone()
        } else {
            positions
                .iter()
                .filter(|p| symbols.contains(&p.symbol))
                .cloned()
                .collect()
        })
    }

    fn set_on_order_changed(&self, cb: OrderCallback) {
        *self.on_order.lock() = Some(cb);
    }
}
