// =============================================================================
// Push Session — WebSocket feed for quote ticks and order-changed events
// =============================================================================
//
// One combined connection carries both event kinds. The stream runs until the
// socket drops or errors, then returns so the supervisor can reconnect after
// a fixed back-off. Frames that fail to parse are logged and skipped; the
// feed must survive one bad message.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::client::LongportGateway;
use super::{OrderUpdate, QuotePush};
use crate::types::{OrderSide, OrderStatus, OrderType};

/// Delay before reconnecting a dropped push session.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Parse a pushed quote frame.
///
/// Expected shape:
/// ```json
/// { "event": "quote", "symbol": "61999.HK", "last_done": "0.345", "timestamp": 1700000000000 }
/// ```
fn parse_quote_frame(root: &serde_json::Value) -> Result<QuotePush> {
    let symbol = root["symbol"]
        .as_str()
        .context("quote frame missing symbol")?
        .to_string();
    let last_done = parse_number(&root["last_done"]).context("quote frame missing last_done")?;
    let timestamp_ms = root["timestamp"].as_i64().unwrap_or(0);

    Ok(QuotePush {
        symbol,
        last_done,
        timestamp_ms,
    })
}

/// Parse a pushed order-changed frame.
fn parse_order_frame(root: &serde_json::Value) -> Result<OrderUpdate> {
    let order_id = root["order_id"]
        .as_str()
        .context("order frame missing order_id")?
        .to_string();
    let symbol = root["symbol"]
        .as_str()
        .context("order frame missing symbol")?
        .to_string();

    let side = if root["side"].as_str().unwrap_or("").eq_ignore_ascii_case("buy") {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    };
    let order_type = match root["order_type"].as_str().unwrap_or("") {
        "LO" => OrderType::Lo,
        "MO" => OrderType::Mo,
        _ => OrderType::Elo,
    };

    Ok(OrderUpdate {
        sequence: root["sequence"].as_u64().unwrap_or(0),
        order_id,
        symbol,
        side,
        order_type,
        status: OrderStatus::parse(root["status"].as_str().unwrap_or("")),
        submitted_quantity: parse_number(&root["submitted_quantity"]).unwrap_or(0.0),
        executed_quantity: parse_number(&root["executed_quantity"]).unwrap_or(0.0),
        executed_price: parse_number(&root["executed_price"]).ok().filter(|p| *p > 0.0),
        price: parse_number(&root["price"]).ok().filter(|p| *p > 0.0),
        updated_at_ms: root["updated_at"].as_i64().unwrap_or(0),
        message: root["message"].as_str().map(str::to_string),
    })
}

/// Push frames carry numbers as strings.
fn parse_number(val: &serde_json::Value) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64")),
        serde_json::Value::Number(n) => n.as_f64().context("number out of f64 range"),
        _ => anyhow::bail!("value has unexpected JSON type: {val}"),
    }
}

/// Run one push session: connect, authenticate, dispatch frames until the
/// stream ends or errors.
pub async fn run_push_session(gateway: &Arc<LongportGateway>) -> Result<()> {
    let url = gateway.push_url().to_string();
    info!(url = %url, "connecting to push WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to push WebSocket")?;

    let (mut write, mut read) = ws_stream.split();

    // Authenticate before any data flows.
    let auth = serde_json::json!({ "event": "auth", "token": gateway.access_token() });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth frame")?;

    info!("push WebSocket connected");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let root: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to parse push frame");
                        continue;
                    }
                };

                match root["event"].as_str().unwrap_or("") {
                    "quote" => match parse_quote_frame(&root) {
                        Ok(push) => {
                            debug!(symbol = %push.symbol, price = push.last_done, "quote push");
                            if let Some(cb) = gateway.on_quote.lock().as_ref() {
                                cb(push);
                            }
                        }
                        Err(e) => warn!(error = %e, "bad quote frame"),
                    },
                    "order" => match parse_order_frame(&root) {
                        Ok(update) => {
                            debug!(
                                order_id = %update.order_id,
                                status = %update.status,
                                "order push"
                            );
                            if let Some(cb) = gateway.on_order.lock().as_ref() {
                                cb(update);
                            }
                        }
                        Err(e) => warn!(error = %e, "bad order frame"),
                    },
                    "auth" | "heartbeat" => {}
                    other => debug!(event = other, "ignoring push frame"),
                }
            }
            // tungstenite answers pings automatically.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "push WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("push WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Spawn the supervised push session: reconnect forever with a fixed back-off.
pub fn spawn_supervised(gateway: Arc<LongportGateway>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_push_session(&gateway).await {
                error!(error = %e, "push session error — reconnecting in {RECONNECT_DELAY_SECS}s");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
        }
    })
}
