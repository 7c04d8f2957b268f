// =============================================================================
// Market-Data Client — push-fed quote cache with pull fallbacks
// =============================================================================
//
// Owns the engine's local view of the market:
//   - a symbol -> Quote map updated by the push handler (the only writer),
//   - static info (name, lot size) and prev-close captured once at
//     subscription time,
//   - a trading-day calendar with a 24 h TTL,
//   - pull access to candlesticks with a bounded retry wrapper.
//
// `get_quotes` never touches the network; asking for a symbol that was never
// subscribed is a configuration error and fails loudly.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::broker::{is_transient_error, QuoteGateway, QuotePush, StaticInfo};
use crate::hk_time::{self, TradingCalendar};
use crate::types::{Candle, CandlePeriod, Quote, TradingDayInfo};

/// Pull-call retry policy.
const RETRY_ATTEMPTS: usize = 3;
const RETRY_DELAY_MS: u64 = 200;

/// Trading-day calendar TTL.
const CALENDAR_TTL_MS: i64 = 24 * 3600 * 1000;

/// Days of calendar pulled around "today" on refresh.
const CALENDAR_BACK_DAYS: i64 = 14;
const CALENDAR_AHEAD_DAYS: i64 = 31;

/// Retry `op` up to [`RETRY_ATTEMPTS`] times on transient errors.
pub async fn with_retry<T, F, Fut>(op_name: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !is_transient_error(&e) || attempt == RETRY_ATTEMPTS {
                    return Err(e.context(format!("{op_name} failed after {attempt} attempt(s)")));
                }
                warn!(op = op_name, attempt, error = %e, "transient error — retrying");
                last_err = Some(e);
                tokio::time::sleep(tokio::time::Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("retry loop exhausted"))
        .context(format!("{op_name} failed")))
}

/// The engine's market-data facade over the quote gateway.
pub struct MarketDataClient {
    gateway: Arc<dyn QuoteGateway>,
    quotes: RwLock<HashMap<String, Quote>>,
    statics: RwLock<HashMap<String, StaticInfo>>,
    prev_closes: RwLock<HashMap<String, f64>>,
    subscribed: RwLock<HashSet<String>>,
    calendar: RwLock<TradingCalendar>,
    calendar_fetched_at_ms: RwLock<i64>,
}

impl MarketDataClient {
    pub fn new(gateway: Arc<dyn QuoteGateway>) -> Self {
        Self {
            gateway,
            quotes: RwLock::new(HashMap::new()),
            statics: RwLock::new(HashMap::new()),
            prev_closes: RwLock::new(HashMap::new()),
            subscribed: RwLock::new(HashSet::new()),
            calendar: RwLock::new(TradingCalendar::new()),
            calendar_fetched_at_ms: RwLock::new(0),
        }
    }

    /// Register this client as the gateway's push consumer. Call once after
    /// wrapping in `Arc`.
    pub fn install_push_handler(self: &Arc<Self>) {
        let client = Arc::clone(self);
        self.gateway
            .set_on_quote(Box::new(move |push| client.on_quote_push(push)));
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Subscribe `symbols`, warm their static info, and seed quotes (price +
    /// prev close) with one pull. Already-subscribed symbols are skipped.
    pub async fn subscribe_symbols(&self, symbols: &[String]) -> Result<()> {
        let fresh: Vec<String> = {
            let subscribed = self.subscribed.read();
            symbols
                .iter()
                .filter(|s| !subscribed.contains(*s))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        self.cache_static_info(&fresh).await?;

        let snapshots = with_retry("quotes", || self.gateway.quotes(&fresh)).await?;
        {
            let mut prev_closes = self.prev_closes.write();
            let mut quotes = self.quotes.write();
            let statics = self.statics.read();
            for snap in &snapshots {
                prev_closes.insert(snap.symbol.clone(), snap.prev_close);
                let info = statics.get(&snap.symbol);
                quotes.insert(
                    snap.symbol.clone(),
                    Quote {
                        symbol: snap.symbol.clone(),
                        name: info.map(|i| i.name.clone()).unwrap_or_default(),
                        price: snap.last_done,
                        prev_close: snap.prev_close,
                        timestamp_ms: snap.timestamp_ms,
                        lot_size: info.map(|i| i.lot_size).unwrap_or(1),
                    },
                );
            }
        }

        with_retry("subscribe_quotes", || {
            self.gateway.subscribe_quotes(&fresh)
        })
        .await?;

        self.subscribed.write().extend(fresh.iter().cloned());
        info!(count = fresh.len(), "symbols subscribed");
        Ok(())
    }

    /// Incremental static-info warmup.
    pub async fn cache_static_info(&self, symbols: &[String]) -> Result<()> {
        let missing: Vec<String> = {
            let statics = self.statics.read();
            symbols
                .iter()
                .filter(|s| !statics.contains_key(*s))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let infos = with_retry("static_info", || self.gateway.static_info(&missing)).await?;
        let mut statics = self.statics.write();
        for info in infos {
            statics.insert(info.symbol.clone(), info);
        }
        Ok(())
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscribed.read().contains(symbol)
    }

    // -------------------------------------------------------------------------
    // Quote access
    // -------------------------------------------------------------------------

    /// Read quotes from the local cache only. Requesting a symbol that was
    /// never subscribed is a configuration error.
    pub fn get_quotes(&self, symbols: &[String]) -> Result<HashMap<String, Option<Quote>>> {
        let subscribed = self.subscribed.read();
        for symbol in symbols {
            if !subscribed.contains(symbol) {
                bail!("quote requested for unsubscribed symbol {symbol}");
            }
        }

        let quotes = self.quotes.read();
        Ok(symbols
            .iter()
            .map(|s| (s.clone(), quotes.get(s).cloned()))
            .collect())
    }

    pub fn get_quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.read().get(symbol).cloned()
    }

    pub fn lot_size(&self, symbol: &str) -> Option<u32> {
        self.statics.read().get(symbol).map(|i| i.lot_size)
    }

    pub fn symbol_name(&self, symbol: &str) -> Option<String> {
        self.statics.read().get(symbol).map(|i| i.name.clone())
    }

    /// Push handler: join the pushed price with the cached prev close and
    /// static info into a full quote. The quote-map insert is the only write.
    fn on_quote_push(&self, push: QuotePush) {
        let prev_close = match self.prev_closes.read().get(&push.symbol).copied() {
            Some(pc) => pc,
            None => {
                warn!(symbol = %push.symbol, "quote push for symbol without cached prev close");
                return;
            }
        };

        let (name, lot_size) = {
            let statics = self.statics.read();
            statics
                .get(&push.symbol)
                .map(|i| (i.name.clone(), i.lot_size))
                .unwrap_or_default()
        };

        self.quotes.write().insert(
            push.symbol.clone(),
            Quote {
                symbol: push.symbol,
                name,
                price: push.last_done,
                prev_close,
                timestamp_ms: push.timestamp_ms,
                lot_size: lot_size.max(1),
            },
        );
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    pub async fn get_candlesticks(
        &self,
        symbol: &str,
        period: CandlePeriod,
        count: usize,
    ) -> Result<Vec<Candle>> {
        with_retry("candlesticks", || {
            self.gateway.candlesticks(symbol, period, count)
        })
        .await
        .with_context(|| format!("candlesticks pull failed for {symbol}@{period}"))
    }

    // -------------------------------------------------------------------------
    // Trading-day calendar
    // -------------------------------------------------------------------------

    /// Look up whether `date_key` is a (half) trading day, refreshing the
    /// calendar when its TTL lapsed. Dates inside the fetched window but not
    /// listed are non-trading days.
    pub async fn is_trading_day(&self, date_key: &str, now_ms: i64) -> Result<TradingDayInfo> {
        self.refresh_calendar_if_stale(now_ms).await?;
        Ok(self.calendar.read().get(date_key).unwrap_or(TradingDayInfo {
            is_trading_day: false,
            is_half_day: false,
        }))
    }

    /// Clone the current calendar for synchronous consumers (doomsday rules,
    /// session-age math).
    pub fn calendar_snapshot(&self) -> TradingCalendar {
        self.calendar.read().clone()
    }

    pub async fn refresh_calendar_if_stale(&self, now_ms: i64) -> Result<()> {
        {
            let fetched = *self.calendar_fetched_at_ms.read();
            if fetched > 0 && now_ms - fetched < CALENDAR_TTL_MS {
                return Ok(());
            }
        }

        let today = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(now_ms)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
            .with_timezone(&hk_time::hk_offset())
            .date_naive();
        let from = today - ChronoDuration::days(CALENDAR_BACK_DAYS);
        let to = today + ChronoDuration::days(CALENDAR_AHEAD_DAYS);

        let page = with_retry("trading_days", || {
            self.gateway.trading_days("HK", from, to)
        })
        .await?;

        let mut calendar = TradingCalendar::new();
        for day in &page.trading_days {
            calendar.insert(
                hk_time::date_key_of(*day),
                TradingDayInfo {
                    is_trading_day: true,
                    is_half_day: false,
                },
            );
        }
        for day in &page.half_trading_days {
            calendar.insert(
                hk_time::date_key_of(*day),
                TradingDayInfo {
                    is_trading_day: true,
                    is_half_day: true,
                },
            );
        }

        debug!(days = calendar.len(), "trading calendar refreshed");
        *self.calendar.write() = calendar;
        *self.calendar_fetched_at_ms.write() = now_ms;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockGateway;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client_with_mock() -> (Arc<MarketDataClient>, Arc<MockGateway>) {
        let mock = Arc::new(MockGateway::new());
        mock.set_static_info("61999.HK", "HSI BULL A", 10_000);
        mock.set_quote("61999.HK", 0.345, 0.300);
        let client = Arc::new(MarketDataClient::new(
            mock.clone() as Arc<dyn QuoteGateway>
        ));
        client.install_push_handler();
        (client, mock)
    }

    #[tokio::test]
    async fn subscribe_seeds_quote_and_prev_close() {
        let (client, mock) = client_with_mock();
        client
            .subscribe_symbols(&["61999.HK".to_string()])
            .await
            .unwrap();

        assert!(client.is_subscribed("61999.HK"));
        assert_eq!(mock.subscribed.lock().as_slice(), ["61999.HK"]);

        let quote = client.get_quote("61999.HK").unwrap();
        assert!((quote.price - 0.345).abs() < 1e-12);
        assert!((quote.prev_close - 0.300).abs() < 1e-12);
        assert_eq!(quote.lot_size, 10_000);
        assert_eq!(quote.name, "HSI BULL A");
    }

    #[tokio::test]
    async fn push_updates_quote_atomically() {
        let (client, mock) = client_with_mock();
        client
            .subscribe_symbols(&["61999.HK".to_string()])
            .await
            .unwrap();

        mock.push_quote("61999.HK", 0.360, 1_700_000_000_000);

        let quote = client.get_quote("61999.HK").unwrap();
        assert!((quote.price - 0.360).abs() < 1e-12);
        // prev close survives the push.
        assert!((quote.prev_close - 0.300).abs() < 1e-12);
        assert_eq!(quote.timestamp_ms, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn push_for_unknown_symbol_is_dropped() {
        let (client, mock) = client_with_mock();
        mock.push_quote("99999.HK", 1.0, 0);
        assert!(client.get_quote("99999.HK").is_none());
    }

    #[tokio::test]
    async fn get_quotes_rejects_unsubscribed_symbol() {
        let (client, _mock) = client_with_mock();
        let err = client.get_quotes(&["61999.HK".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unsubscribed"));
    }

    #[tokio::test]
    async fn resubscribing_is_idempotent() {
        let (client, mock) = client_with_mock();
        client
            .subscribe_symbols(&["61999.HK".to_string()])
            .await
            .unwrap();
        client
            .subscribe_symbols(&["61999.HK".to_string()])
            .await
            .unwrap();
        assert_eq!(mock.subscribed.lock().len(), 1);
    }

    #[tokio::test]
    async fn calendar_ttl_and_lookup() {
        let (client, mock) = client_with_mock();
        {
            let mut page = mock.trading_days_page.lock();
            page.trading_days = vec![NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()];
            page.half_trading_days = vec![NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()];
        }

        let now = hk_time::hk_timestamp_ms(2024, 3, 4, 10, 0);
        let info = client.is_trading_day("2024-03-04", now).await.unwrap();
        assert!(info.is_trading_day);
        assert!(!info.is_half_day);

        let info = client.is_trading_day("2024-03-05", now).await.unwrap();
        assert!(info.is_half_day);

        let info = client.is_trading_day("2024-03-09", now).await.unwrap();
        assert!(!info.is_trading_day);

        // Within TTL a changed upstream page is not refetched.
        mock.trading_days_page.lock().trading_days.clear();
        let info = client.is_trading_day("2024-03-04", now + 1_000).await.unwrap();
        assert!(info.is_trading_day);
    }

    #[tokio::test]
    async fn retry_gives_up_on_non_transient() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("insufficient funds")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result = with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("request timeout"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
