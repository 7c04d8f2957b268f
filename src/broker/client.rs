// =============================================================================
// Longport OpenAPI Gateway — HMAC-SHA256 signed REST + WebSocket push
// =============================================================================
//
// SECURITY: the app secret is never logged or serialized. Signed requests
// carry the app key and access token as headers plus a millisecond timestamp;
// the signature covers method, path, timestamp and body.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument};

use super::{
    AccountSnapshot, BrokerPosition, OrderCallback, OrderUpdate, QuoteCallback, QuotePush,
    QuoteSnapshot, RawOrder, StaticInfo, SubmitOrderRequest, SubmitOrderResponse, TradingDaysPage,
    WarrantBrief, WarrantListFilter, WarrantType,
};
use super::{QuoteGateway, TradeGateway};
use crate::types::{Candle, CandlePeriod, OrderSide, OrderStatus, OrderType};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_BASE_URL: &str = "https://openapi.longportapp.com";
const DEFAULT_PUSH_URL: &str = "wss://openapi-quote.longportapp.com/v2/push";

/// Credentials loaded from the environment at startup.
#[derive(Clone)]
pub struct GatewayCredentials {
    pub app_key: String,
    pub app_secret: String,
    pub access_token: String,
}

/// Production brokerage gateway.
pub struct LongportGateway {
    creds: GatewayCredentials,
    base_url: String,
    push_url: String,
    client: reqwest::Client,
    pub(super) on_quote: Arc<Mutex<Option<QuoteCallback>>>,
    pub(super) on_order: Arc<Mutex<Option<OrderCallback>>>,
}

impl LongportGateway {
    pub fn new(creds: GatewayCredentials) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&creds.app_key) {
            default_headers.insert("X-Api-Key", val);
        }
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {}", creds.access_token)) {
            default_headers.insert("Authorization", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = DEFAULT_BASE_URL, "LongportGateway initialised");

        Self {
            creds,
            base_url: DEFAULT_BASE_URL.to_string(),
            push_url: DEFAULT_PUSH_URL.to_string(),
            client,
            on_quote: Arc::new(Mutex::new(None)),
            on_order: Arc::new(Mutex::new(None)),
        }
    }

    pub fn push_url(&self) -> &str {
        &self.push_url
    }

    pub fn access_token(&self) -> &str {
        &self.creds.access_token
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature over `method|path|timestamp|body`.
    pub fn sign(&self, method: &str, path: &str, timestamp_ms: u64, body: &str) -> String {
        let payload = format!("{method}|{path}|{timestamp_ms}|{body}");
        let mut mac = HmacSha256::new_from_slice(self.creds.app_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, path, q),
            _ => format!("{}{}", self.base_url, path),
        };

        let ts = Self::timestamp_ms();
        let body_str = body
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_default();
        let signature = self.sign(method.as_str(), path, ts, &body_str);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("X-Timestamp", ts.to_string())
            .header("X-Api-Signature", signature);
        if let Some(b) = body {
            req = req.json(&b);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{method} {path} request failed"))?;

        let status = resp.status();
        let envelope: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {path} response"))?;

        if !status.is_success() {
            anyhow::bail!("{method} {path} returned {status}: {envelope}");
        }

        let code = envelope["code"].as_i64().unwrap_or(0);
        if code != 0 {
            anyhow::bail!(
                "{method} {path} returned broker error {code}: {}",
                envelope["message"].as_str().unwrap_or("")
            );
        }

        Ok(envelope
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    // -------------------------------------------------------------------------
    // Parse helpers — numeric fields come back as strings
    // -------------------------------------------------------------------------

    fn field_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
        let v = &val[name];
        if let Some(s) = v.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{name}'='{s}' as f64"))
        } else if let Some(n) = v.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("field '{name}' missing or not numeric: {v}")
        }
    }

    fn field_f64_opt(val: &serde_json::Value, name: &str) -> Option<f64> {
        Self::field_f64(val, name).ok().filter(|v| *v > 0.0)
    }

    fn field_i64(val: &serde_json::Value, name: &str) -> i64 {
        val[name]
            .as_i64()
            .or_else(|| val[name].as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0)
    }

    fn field_str(val: &serde_json::Value, name: &str) -> String {
        val[name].as_str().unwrap_or("").to_string()
    }

    fn parse_date(s: &str) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(s, "%Y%m%d")
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
            .with_context(|| format!("failed to parse date '{s}'"))
    }

    fn parse_raw_order(val: &serde_json::Value) -> RawOrder {
        let side = if Self::field_str(val, "side").eq_ignore_ascii_case("buy") {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let order_type = match Self::field_str(val, "order_type").as_str() {
            "LO" => OrderType::Lo,
            "MO" => OrderType::Mo,
            _ => OrderType::Elo,
        };

        RawOrder {
            order_id: Self::field_str(val, "order_id"),
            symbol: Self::field_str(val, "symbol"),
            side,
            order_type,
            status: OrderStatus::parse(&Self::field_str(val, "status")),
            price: Self::field_f64_opt(val, "price"),
            quantity: Self::field_f64(val, "quantity").unwrap_or(0.0),
            executed_price: Self::field_f64_opt(val, "executed_price"),
            executed_quantity: Self::field_f64(val, "executed_quantity").unwrap_or(0.0),
            submitted_at_ms: Self::field_i64(val, "submitted_at"),
            updated_at_ms: Self::field_i64(val, "updated_at"),
        }
    }

    fn parse_warrant(val: &serde_json::Value) -> Result<WarrantBrief> {
        let warrant_type = match Self::field_str(val, "warrant_type").as_str() {
            "Bull" | "BULL" => WarrantType::Bull,
            _ => WarrantType::Bear,
        };
        Ok(WarrantBrief {
            symbol: Self::field_str(val, "symbol"),
            name: Self::field_str(val, "name"),
            warrant_type,
            call_price: Self::field_f64_opt(val, "call_price"),
            expiry_date: Self::parse_date(&Self::field_str(val, "expiry_date"))?,
            turnover: Self::field_f64(val, "turnover").unwrap_or(0.0),
            last_done: Self::field_f64(val, "last_done").unwrap_or(0.0),
            lot_size: Self::field_i64(val, "lot_size").max(1) as u32,
        })
    }
}

// =============================================================================
// QuoteGateway impl
// =============================================================================

#[async_trait]
impl QuoteGateway for LongportGateway {
    #[instrument(skip(self), name = "gateway::subscribe_quotes")]
    async fn subscribe_quotes(&self, symbols: &[String]) -> Result<()> {
        let body = serde_json::json!({ "symbols": symbols, "sub_types": ["QUOTE"] });
        self.request(reqwest::Method::POST, "/v1/quote/subscribe", None, Some(body))
            .await?;
        debug!(count = symbols.len(), "quote subscription added");
        Ok(())
    }

    #[instrument(skip(self), name = "gateway::unsubscribe_quotes")]
    async fn unsubscribe_quotes(&self, symbols: &[String]) -> Result<()> {
        let body = serde_json::json!({ "symbols": symbols, "sub_types": ["QUOTE"] });
        self.request(
            reqwest::Method::POST,
            "/v1/quote/unsubscribe",
            None,
            Some(body),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "gateway::quotes")]
    async fn quotes(&self, symbols: &[String]) -> Result<Vec<QuoteSnapshot>> {
        let query = format!("symbols={}", symbols.join(","));
        let data = self
            .request(reqwest::Method::GET, "/v1/quote/batch", Some(&query), None)
            .await?;

        let rows = data["quotes"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(QuoteSnapshot {
                symbol: Self::field_str(row, "symbol"),
                last_done: Self::field_f64(row, "last_done")?,
                prev_close: Self::field_f64(row, "prev_close")?,
                timestamp_ms: Self::field_i64(row, "timestamp"),
            });
        }
        debug!(count = out.len(), "quotes pulled");
        Ok(out)
    }

    #[instrument(skip(self), name = "gateway::candlesticks")]
    async fn candlesticks(
        &self,
        symbol: &str,
        period: CandlePeriod,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let query = format!("symbol={symbol}&period={}&count={count}", period.as_str());
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/quote/candlesticks",
                Some(&query),
                None,
            )
            .await?;

        let rows = data["candlesticks"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Candle {
                open: Self::field_f64(row, "open")?,
                high: Self::field_f64(row, "high")?,
                low: Self::field_f64(row, "low")?,
                close: Self::field_f64(row, "close")?,
                volume: Self::field_f64(row, "volume").unwrap_or(0.0),
                turnover: Self::field_f64_opt(row, "turnover"),
                timestamp_ms: Self::field_i64(row, "timestamp"),
            });
        }
        debug!(symbol, count = out.len(), "candlesticks fetched");
        Ok(out)
    }

    #[instrument(skip(self), name = "gateway::trading_days")]
    async fn trading_days(
        &self,
        market: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<TradingDaysPage> {
        let query = format!(
            "market={market}&beg_day={}&end_day={}",
            from.format("%Y%m%d"),
            to.format("%Y%m%d")
        );
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/quote/trading-days",
                Some(&query),
                None,
            )
            .await?;

        let parse_list = |name: &str| -> Result<Vec<NaiveDate>> {
            data[name]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .map(|s| Self::parse_date(&s))
                .collect()
        };

        Ok(TradingDaysPage {
            trading_days: parse_list("trading_days")?,
            half_trading_days: parse_list("half_trading_days")?,
        })
    }

    #[instrument(skip(self), name = "gateway::static_info")]
    async fn static_info(&self, symbols: &[String]) -> Result<Vec<StaticInfo>> {
        let query = format!("symbols={}", symbols.join(","));
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/quote/static-info",
                Some(&query),
                None,
            )
            .await?;

        let rows = data["secu_static_info"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|row| StaticInfo {
                symbol: Self::field_str(row, "symbol"),
                name: Self::field_str(row, "name_en"),
                lot_size: Self::field_i64(row, "lot_size").max(1) as u32,
            })
            .collect())
    }

    #[instrument(skip(self), name = "gateway::warrant_list")]
    async fn warrant_list(
        &self,
        underlying: &str,
        filter: WarrantListFilter,
    ) -> Result<Vec<WarrantBrief>> {
        let type_str = match filter.warrant_type {
            WarrantType::Bull => "Bull",
            WarrantType::Bear => "Bear",
        };
        let sort = if filter.sort_by_turnover_desc {
            "&sort_by=turnover&order=desc"
        } else {
            ""
        };
        let query = format!("symbol={underlying}&warrant_type={type_str}{sort}");
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/quote/warrant-list",
                Some(&query),
                None,
            )
            .await?;

        data["warrant_list"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(Self::parse_warrant)
            .collect()
    }

    #[instrument(skip(self), name = "gateway::warrant_quote")]
    async fn warrant_quote(&self, symbols: &[String]) -> Result<Vec<WarrantBrief>> {
        let query = format!("symbols={}", symbols.join(","));
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/quote/warrant-quote",
                Some(&query),
                None,
            )
            .await?;

        data["warrant_quote"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(Self::parse_warrant)
            .collect()
    }

    fn set_on_quote(&self, cb: QuoteCallback) {
        *self.on_quote.lock() = Some(cb);
    }
}

// =============================================================================
// TradeGateway impl
// =============================================================================

#[async_trait]
impl TradeGateway for LongportGateway {
    #[instrument(skip(self, req), name = "gateway::submit_order", fields(symbol = %req.symbol, side = %req.side))]
    async fn submit_order(&self, req: SubmitOrderRequest) -> Result<SubmitOrderResponse> {
        let body = serde_json::json!({
            "symbol": req.symbol,
            "side": req.side.to_string(),
            "order_type": req.order_type.to_string(),
            "time_in_force": req.time_in_force,
            "submitted_quantity": req.quantity.to_string(),
            "submitted_price": req.price.map(|p| p.to_string()),
            "remark": req.remark,
        });

        let data = self
            .request(reqwest::Method::POST, "/v1/trade/order", None, Some(body))
            .await?;

        let order_id = Self::field_str(&data, "order_id");
        if order_id.is_empty() {
            anyhow::bail!("submit response missing order_id: {data}");
        }

        debug!(order_id, "order submitted");
        Ok(SubmitOrderResponse { order_id })
    }

    #[instrument(skip(self), name = "gateway::replace_order")]
    async fn replace_order(
        &self,
        order_id: &str,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "order_id": order_id,
            "quantity": quantity.to_string(),
            "price": price.map(|p| p.to_string()),
        });
        self.request(reqwest::Method::PUT, "/v1/trade/order", None, Some(body))
            .await?;
        debug!(order_id, quantity, "order replaced");
        Ok(())
    }

    #[instrument(skip(self), name = "gateway::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let query = format!("order_id={order_id}");
        self.request(reqwest::Method::DELETE, "/v1/trade/order", Some(&query), None)
            .await?;
        debug!(order_id, "order cancelled");
        Ok(())
    }

    #[instrument(skip(self), name = "gateway::today_orders")]
    async fn today_orders(&self, symbol: Option<&str>) -> Result<Vec<RawOrder>> {
        let query = symbol.map(|s| format!("symbol={s}")).unwrap_or_default();
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/trade/orders/today",
                Some(&query),
                None,
            )
            .await?;

        let orders: Vec<RawOrder> = data["orders"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(Self::parse_raw_order)
            .collect();
        debug!(count = orders.len(), "today orders fetched");
        Ok(orders)
    }

    #[instrument(skip(self), name = "gateway::account_balance")]
    async fn account_balance(&self, currency: &str) -> Result<AccountSnapshot> {
        let query = format!("currency={currency}");
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/asset/account",
                Some(&query),
                None,
            )
            .await?;

        let row = data["list"]
            .as_array()
            .and_then(|l| l.first().cloned())
            .context("account response missing balance list")?;

        Ok(AccountSnapshot {
            currency: currency.to_string(),
            total_cash: Self::field_f64(&row, "total_cash")?,
            available_cash: Self::field_f64(&row, "available_cash")?,
            net_assets: Self::field_f64(&row, "net_assets").unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "gateway::stock_positions")]
    async fn stock_positions(&self, symbols: &[String]) -> Result<Vec<BrokerPosition>> {
        let query = if symbols.is_empty() {
            String::new()
        } else {
            format!("symbols={}", symbols.join(","))
        };
        let data = self
            .request(
                reqwest::Method::GET,
                "/v1/asset/stock-positions",
                Some(&query),
                None,
            )
            .await?;

        let rows = data["positions"].as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|row| BrokerPosition {
                symbol: Self::field_str(row, "symbol"),
                quantity: Self::field_f64(row, "quantity").unwrap_or(0.0),
                available_quantity: Self::field_f64(row, "available_quantity").unwrap_or(0.0),
                cost_price: Self::field_f64(row, "cost_price").unwrap_or(0.0),
                currency: Self::field_str(row, "currency"),
                market: Self::field_str(row, "market"),
            })
            .collect())
    }

    fn set_on_order_changed(&self, cb: OrderCallback) {
        *self.on_order.lock() = Some(cb);
    }
}

impl std::fmt::Debug for LongportGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongportGateway")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
