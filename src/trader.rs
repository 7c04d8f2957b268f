// =============================================================================
// Trader — order submission, sell merging, timeouts, push reconciliation
// =============================================================================
//
// The only component that talks to the trade gateway. Responsibilities:
//
//   - submit buy/sell orders with the configured order-type priority
//     (signal override > liquidation type for protective sells > trading
//     type);
//   - merge concurrent sells on the same symbol: replace a single compatible
//     pending order, otherwise cancel everything and submit one merged
//     order;
//   - track per-order timeouts and re-price drifting limit orders;
//   - consume the order-changed push bus (re-ordered by sequence number),
//     keep the order recorder in sync, and append terminal events to the
//     per-day trade journal;
//   - after every mutation, mark the refresh gate stale and enqueue a
//     post-trade refresh so risk decisions never read stale positions.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{OrderUpdate, RawOrder, SubmitOrderRequest, TradeGateway};
use crate::config::GlobalConfig;
use crate::hk_time;
use crate::journal::{TradeJournal, TradeRecord};
use crate::recorder::{OrderRecorder, PendingSellOrder};
use crate::registry::SymbolRegistry;
use crate::scheduler::{RefreshGate, TaskQueue};
use crate::signal::Signal;
use crate::types::{Direction, OrderSide, OrderStatus, OrderType, Quote, SignalAction};

/// Pending-order cache TTL.
const PENDING_CACHE_TTL_MS: i64 = 15_000;
/// Sequence-buffer size before gaps are force-flushed.
const MAX_SEQUENCE_BUFFER: usize = 8;
/// Relative price drift that triggers a re-price of a resting limit order.
const REPRICE_DRIFT_FRACTION: f64 = 0.002;

// ---------------------------------------------------------------------------
// Public decision types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct CanTrade {
    pub can_trade: bool,
    pub wait_seconds: Option<u64>,
}

/// How a new sell interacts with pending sells on the same symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SellMergeDecision {
    Submit,
    Replace { order_id: String },
    CancelAndSubmit,
}

/// The view of one live pending sell the merge decision runs on.
#[derive(Debug, Clone)]
pub struct PendingSellSnapshot {
    pub order_id: String,
    pub order_type: OrderType,
    pub broker_status: OrderStatus,
    pub remaining_quantity: f64,
    pub related_buy_order_ids: Vec<String>,
}

/// Decide how to place a new sell given the live pending sells.
///
/// A single pending order of the same type that is not mid-replace and not a
/// market order can simply grow (replace); anything else collapses into
/// cancel-all-then-submit. Protective liquidations never replace: they must
/// hit the market as configured.
pub fn decide_sell_merge(
    pendings: &[PendingSellSnapshot],
    new_order_type: OrderType,
    is_protective: bool,
) -> SellMergeDecision {
    if pendings.is_empty() {
        return SellMergeDecision::Submit;
    }

    if pendings.len() == 1 {
        let p = &pendings[0];
        let replace_blocked = matches!(
            p.broker_status,
            OrderStatus::WaitToReplace | OrderStatus::PendingReplace
        );
        if p.order_type == new_order_type
            && !replace_blocked
            && p.order_type != OrderType::Mo
            && !is_protective
        {
            return SellMergeDecision::Replace {
                order_id: p.order_id.clone(),
            };
        }
    }

    SellMergeDecision::CancelAndSubmit
}

// ---------------------------------------------------------------------------
// Internal tracking
// ---------------------------------------------------------------------------

/// Everything remembered about an order we submitted, for timeouts,
/// re-pricing and journal context.
#[derive(Debug, Clone)]
struct OrderTracking {
    symbol: String,
    symbol_name: String,
    monitor_symbol: Option<String>,
    direction: Option<Direction>,
    action: SignalAction,
    side: OrderSide,
    order_type: OrderType,
    quantity: f64,
    price: Option<f64>,
    deadline_ms: i64,
    last_reprice_ms: i64,
    is_protective: bool,
    reason: Option<String>,
    signal_trigger_time_ms: i64,
}

struct PendingCache {
    orders: Vec<RawOrder>,
    fetched_at_ms: i64,
}

/// Re-orders push events by sequence number; unsequenced events pass
/// through, stale duplicates are dropped, and persistent gaps are
/// force-flushed once the buffer grows past its bound.
struct SequenceBuffer {
    last: u64,
    buffer: BTreeMap<u64, OrderUpdate>,
}

impl SequenceBuffer {
    fn new() -> Self {
        Self {
            last: 0,
            buffer: BTreeMap::new(),
        }
    }

    fn push(&mut self, update: OrderUpdate) -> Vec<OrderUpdate> {
        if update.sequence == 0 {
            return vec![update];
        }
        if self.last != 0 && update.sequence <= self.last {
            debug!(sequence = update.sequence, "stale push event dropped");
            return Vec::new();
        }
        self.buffer.insert(update.sequence, update);

        let mut ready = Vec::new();
        loop {
            let Some((&seq, _)) = self.buffer.iter().next() else {
                break;
            };
            if self.last == 0 || seq == self.last + 1 || self.buffer.len() > MAX_SEQUENCE_BUFFER {
                let update = self.buffer.remove(&seq).expect("key just observed");
                self.last = seq;
                ready.push(update);
            } else {
                break;
            }
        }
        ready
    }
}

// ---------------------------------------------------------------------------
// Trader
// ---------------------------------------------------------------------------

/// A post-trade refresh request carrying the gate version to acknowledge.
#[derive(Debug, Clone)]
pub struct PostTradeTask {
    pub gate_version: u64,
    pub symbols: Vec<String>,
}

pub struct Trader {
    gateway: Arc<dyn TradeGateway>,
    recorder: Arc<OrderRecorder>,
    registry: Arc<SymbolRegistry>,
    journal: TradeJournal,
    global: GlobalConfig,
    refresh_gate: Arc<RefreshGate>,
    post_trade_queue: Arc<TaskQueue<PostTradeTask>>,

    pending_cache: Mutex<Option<PendingCache>>,
    buy_attempts: Mutex<HashMap<(String, Direction), i64>>,
    tracked_orders: Mutex<HashMap<String, OrderTracking>>,

    bus_tx: mpsc::UnboundedSender<OrderUpdate>,
    bus_rx: Mutex<Option<mpsc::UnboundedReceiver<OrderUpdate>>>,
}

impl Trader {
    pub fn new(
        gateway: Arc<dyn TradeGateway>,
        recorder: Arc<OrderRecorder>,
        registry: Arc<SymbolRegistry>,
        journal: TradeJournal,
        global: GlobalConfig,
        refresh_gate: Arc<RefreshGate>,
        post_trade_queue: Arc<TaskQueue<PostTradeTask>>,
    ) -> Self {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            recorder,
            registry,
            journal,
            global,
            refresh_gate,
            post_trade_queue,
            pending_cache: Mutex::new(None),
            buy_attempts: Mutex::new(HashMap::new()),
            tracked_orders: Mutex::new(HashMap::new()),
            bus_tx,
            bus_rx: Mutex::new(Some(bus_rx)),
        }
    }

    /// Forward broker order pushes onto the single-consumer bus. Call once
    /// after wrapping in `Arc`.
    pub fn install_order_push_handler(self: &Arc<Self>) {
        let tx = self.bus_tx.clone();
        self.gateway.set_on_order_changed(Box::new(move |update| {
            if tx.send(update).is_err() {
                warn!("order bus closed — push event dropped");
            }
        }));
    }

    /// The bus receiver for `run_order_bus`. Takeable once.
    pub fn take_bus_receiver(&self) -> Option<mpsc::UnboundedReceiver<OrderUpdate>> {
        self.bus_rx.lock().take()
    }

    // -------------------------------------------------------------------------
    // Trade frequency
    // -------------------------------------------------------------------------

    /// Sells are never frequency-limited; buys must wait out
    /// `buy_interval_seconds` since the last attempt on the same seat.
    pub fn can_trade_now(
        &self,
        action: SignalAction,
        monitor_symbol: &str,
        buy_interval_seconds: u64,
        now_ms: i64,
    ) -> CanTrade {
        if !action.is_buy() {
            return CanTrade {
                can_trade: true,
                wait_seconds: None,
            };
        }
        let Some(direction) = action.direction() else {
            return CanTrade {
                can_trade: true,
                wait_seconds: None,
            };
        };

        let attempts = self.buy_attempts.lock();
        match attempts.get(&(monitor_symbol.to_string(), direction)) {
            Some(last_ms) => {
                let elapsed_s = (now_ms - last_ms) / 1_000;
                if elapsed_s >= buy_interval_seconds as i64 {
                    CanTrade {
                        can_trade: true,
                        wait_seconds: None,
                    }
                } else {
                    CanTrade {
                        can_trade: false,
                        wait_seconds: Some((buy_interval_seconds as i64 - elapsed_s) as u64),
                    }
                }
            }
            None => CanTrade {
                can_trade: true,
                wait_seconds: None,
            },
        }
    }

    pub fn record_buy_attempt(&self, monitor_symbol: &str, direction: Direction, now_ms: i64) {
        self.buy_attempts
            .lock()
            .insert((monitor_symbol.to_string(), direction), now_ms);
    }

    pub fn reset_buy_attempts(&self) {
        self.buy_attempts.lock().clear();
    }

    // -------------------------------------------------------------------------
    // Order-type resolution
    // -------------------------------------------------------------------------

    fn resolve_order_type(&self, signal: &Signal) -> OrderType {
        signal.order_type_override.unwrap_or({
            if signal.is_protective_liquidation {
                self.global.liquidation_order_type
            } else {
                self.global.trading_order_type
            }
        })
    }

    // -------------------------------------------------------------------------
    // Buys
    // -------------------------------------------------------------------------

    /// Submit one buy per signal. Signals must carry price and quantity
    /// (risk checks set them).
    pub async fn execute_buy_signals(&self, signals: Vec<Signal>, monitor_symbol: &str) {
        for signal in signals {
            if let Err(e) = self.execute_buy_signal(&signal, monitor_symbol).await {
                error!(
                    symbol = %signal.symbol,
                    error = %e,
                    "buy submission failed"
                );
                self.journal_error(&signal, monitor_symbol, &e);
            }
        }
    }

    async fn execute_buy_signal(&self, signal: &Signal, monitor_symbol: &str) -> Result<()> {
        let quantity = signal
            .quantity
            .filter(|q| *q > 0.0)
            .context("buy signal without quantity")?;
        let order_type = self.resolve_order_type(signal);
        let price = match order_type {
            OrderType::Mo => None,
            _ => Some(signal.price.context("limit buy without price")?),
        };

        let response = self
            .gateway
            .submit_order(SubmitOrderRequest {
                symbol: signal.symbol.clone(),
                side: OrderSide::Buy,
                order_type,
                time_in_force: "Day".to_string(),
                quantity,
                price,
                remark: signal.reason.clone(),
            })
            .await
            .context("submit buy order")?;

        let now_ms = hk_time::now_ms();
        info!(
            order_id = %response.order_id,
            symbol = %signal.symbol,
            quantity,
            ?price,
            %order_type,
            "buy order submitted"
        );

        self.track_order(
            &response.order_id,
            signal,
            monitor_symbol,
            OrderSide::Buy,
            order_type,
            quantity,
            price,
            now_ms + (self.global.buy_order_timeout_seconds as i64) * 1_000,
        );
        self.after_trade_mutation(vec![signal.symbol.clone()]);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sells
    // -------------------------------------------------------------------------

    /// Execute sell signals, merging per symbol.
    pub async fn execute_sell_signals(&self, signals: Vec<Signal>, monitor_symbol: &str) {
        let mut by_symbol: HashMap<String, Vec<Signal>> = HashMap::new();
        for signal in signals {
            by_symbol.entry(signal.symbol.clone()).or_default().push(signal);
        }

        for (symbol, batch) in by_symbol {
            if let Err(e) = self
                .execute_sell_for_symbol(&symbol, batch, monitor_symbol)
                .await
            {
                error!(symbol, error = %e, "sell execution failed");
            }
        }
    }

    async fn execute_sell_for_symbol(
        &self,
        symbol: &str,
        signals: Vec<Signal>,
        monitor_symbol: &str,
    ) -> Result<()> {
        let now_ms = hk_time::now_ms();
        let new_quantity: f64 = signals.iter().filter_map(|s| s.quantity).sum();
        if new_quantity <= 0.0 {
            return Ok(());
        }

        let lead = &signals[0];
        let order_type = self.resolve_order_type(lead);
        let is_protective = signals.iter().any(|s| s.is_protective_liquidation);
        let mut related: Vec<String> = signals
            .iter()
            .flat_map(|s| s.related_buy_order_ids.iter().cloned())
            .collect();

        // Broker statuses refine the merge decision (mid-replace orders
        // cannot be replaced again).
        let broker_pendings = self
            .get_pending_orders(&[symbol.to_string()], false)
            .await
            .unwrap_or_default();
        let snapshot: Vec<PendingSellSnapshot> = self
            .recorder
            .live_pending_sells(symbol)
            .iter()
            .map(|p| self.snapshot_pending(p, &broker_pendings))
            .collect();

        match decide_sell_merge(&snapshot, order_type, is_protective) {
            SellMergeDecision::Submit => {
                self.submit_sell(
                    symbol,
                    lead,
                    monitor_symbol,
                    order_type,
                    new_quantity,
                    related,
                    now_ms,
                )
                .await?;
            }
            SellMergeDecision::Replace { order_id } => {
                let existing = snapshot
                    .iter()
                    .find(|p| p.order_id == order_id)
                    .expect("decision references snapshot entry");
                let total = existing.remaining_quantity + new_quantity;
                let price = lead.price;

                match self.gateway.replace_order(&order_id, total, price).await {
                    Ok(()) => {
                        info!(order_id = %order_id, total, "sell order replaced (merged)");
                        self.recorder
                            .merge_into_pending_sell(&order_id, new_quantity, related);
                        self.after_trade_mutation(vec![symbol.to_string()]);
                    }
                    Err(e) => {
                        // Brokers that refuse quantity growth on replace get
                        // the cancel-and-submit path instead.
                        warn!(order_id = %order_id, error = %e, "replace failed — cancelling and merging");
                        related.extend(existing.related_buy_order_ids.iter().cloned());
                        self.cancel_and_submit(
                            symbol,
                            lead,
                            monitor_symbol,
                            order_type,
                            new_quantity + existing.remaining_quantity,
                            related,
                            &snapshot,
                            now_ms,
                        )
                        .await?;
                    }
                }
            }
            SellMergeDecision::CancelAndSubmit => {
                let merged_quantity: f64 =
                    new_quantity + snapshot.iter().map(|p| p.remaining_quantity).sum::<f64>();
                related.extend(
                    snapshot
                        .iter()
                        .flat_map(|p| p.related_buy_order_ids.iter().cloned()),
                );
                self.cancel_and_submit(
                    symbol,
                    lead,
                    monitor_symbol,
                    order_type,
                    merged_quantity,
                    related,
                    &snapshot,
                    now_ms,
                )
                .await?;
            }
        }
        Ok(())
    }

    fn snapshot_pending(
        &self,
        pending: &PendingSellOrder,
        broker_orders: &[RawOrder],
    ) -> PendingSellSnapshot {
        let broker_status = broker_orders
            .iter()
            .find(|o| o.order_id == pending.order_id)
            .map(|o| o.status)
            .unwrap_or(OrderStatus::New);
        PendingSellSnapshot {
            order_id: pending.order_id.clone(),
            order_type: pending.order_type,
            broker_status,
            remaining_quantity: pending.submitted_quantity - pending.executed_quantity,
            related_buy_order_ids: pending.related_buy_order_ids.clone(),
        }
    }

    async fn cancel_and_submit(
        &self,
        symbol: &str,
        lead: &Signal,
        monitor_symbol: &str,
        order_type: OrderType,
        quantity: f64,
        related: Vec<String>,
        snapshot: &[PendingSellSnapshot],
        now_ms: i64,
    ) -> Result<()> {
        for pending in snapshot {
            if let Err(e) = self.gateway.cancel_order(&pending.order_id).await {
                warn!(order_id = %pending.order_id, error = %e, "cancel before merge failed — continuing");
            }
            self.recorder.mark_sell_cancelled(&pending.order_id);
            self.tracked_orders.lock().remove(&pending.order_id);
        }

        self.submit_sell(
            symbol,
            lead,
            monitor_symbol,
            order_type,
            quantity,
            related,
            now_ms,
        )
        .await
    }

    async fn submit_sell(
        &self,
        symbol: &str,
        lead: &Signal,
        monitor_symbol: &str,
        order_type: OrderType,
        quantity: f64,
        related: Vec<String>,
        now_ms: i64,
    ) -> Result<()> {
        let price = match order_type {
            OrderType::Mo => None,
            _ => Some(lead.price.context("limit sell without price")?),
        };

        let response = self
            .gateway
            .submit_order(SubmitOrderRequest {
                symbol: symbol.to_string(),
                side: OrderSide::Sell,
                order_type,
                time_in_force: "Day".to_string(),
                quantity,
                price,
                remark: lead.reason.clone(),
            })
            .await
            .context("submit sell order")?;

        info!(
            order_id = %response.order_id,
            symbol,
            quantity,
            ?price,
            %order_type,
            protective = lead.is_protective_liquidation,
            "sell order submitted"
        );

        let direction = lead.action.direction().unwrap_or(Direction::Long);
        self.recorder.submit_sell_order(
            &response.order_id,
            symbol,
            direction,
            quantity,
            related,
            order_type,
            now_ms,
        );
        self.track_order(
            &response.order_id,
            lead,
            monitor_symbol,
            OrderSide::Sell,
            order_type,
            quantity,
            price,
            now_ms + (self.global.sell_order_timeout_seconds as i64) * 1_000,
        );
        self.after_trade_mutation(vec![symbol.to_string()]);
        Ok(())
    }

    fn track_order(
        &self,
        order_id: &str,
        signal: &Signal,
        monitor_symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        price: Option<f64>,
        deadline_ms: i64,
    ) {
        self.tracked_orders.lock().insert(
            order_id.to_string(),
            OrderTracking {
                symbol: signal.symbol.clone(),
                symbol_name: signal.symbol_name.clone(),
                monitor_symbol: Some(monitor_symbol.to_string()),
                direction: signal.action.direction(),
                action: signal.action,
                side,
                order_type,
                quantity,
                price,
                deadline_ms,
                last_reprice_ms: 0,
                is_protective: signal.is_protective_liquidation,
                reason: signal.reason.clone(),
                signal_trigger_time_ms: signal.trigger_time_ms,
            },
        );
    }

    fn after_trade_mutation(&self, symbols: Vec<String>) {
        let version = self.refresh_gate.mark_stale();
        self.post_trade_queue.push(PostTradeTask {
            gate_version: version,
            symbols,
        });
    }

    // -------------------------------------------------------------------------
    // Pending-order cache
    // -------------------------------------------------------------------------

    /// Live broker orders for `symbols`, served from a 15 s cache unless
    /// `force_refresh`.
    pub async fn get_pending_orders(
        &self,
        symbols: &[String],
        force_refresh: bool,
    ) -> Result<Vec<RawOrder>> {
        let now_ms = hk_time::now_ms();
        {
            let cache = self.pending_cache.lock();
            if !force_refresh {
                if let Some(cached) = cache.as_ref() {
                    if now_ms - cached.fetched_at_ms < PENDING_CACHE_TTL_MS {
                        return Ok(Self::filter_pending(&cached.orders, symbols));
                    }
                }
            }
        }

        let orders = self
            .gateway
            .today_orders(None)
            .await
            .context("refresh pending orders")?;
        let result = Self::filter_pending(&orders, symbols);
        *self.pending_cache.lock() = Some(PendingCache {
            orders,
            fetched_at_ms: now_ms,
        });
        Ok(result)
    }

    fn filter_pending(orders: &[RawOrder], symbols: &[String]) -> Vec<RawOrder> {
        orders
            .iter()
            .filter(|o| o.status.is_live())
            .filter(|o| symbols.is_empty() || symbols.contains(&o.symbol))
            .cloned()
            .collect()
    }

    pub fn invalidate_pending_cache(&self) {
        *self.pending_cache.lock() = None;
    }

    /// Cancel every live buy order on the given symbols. One failure logs
    /// and continues so the rest still get cancelled.
    pub async fn cancel_pending_buy_orders(&self, symbols: &[String]) -> usize {
        let pendings = match self.get_pending_orders(symbols, true).await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "pending-buy sweep could not list orders");
                return 0;
            }
        };

        let mut cancelled = 0;
        for order in pendings.iter().filter(|o| o.side == OrderSide::Buy) {
            match self.gateway.cancel_order(&order.order_id).await {
                Ok(()) => {
                    info!(order_id = %order.order_id, symbol = %order.symbol, "pending buy cancelled");
                    cancelled += 1;
                }
                Err(e) => {
                    error!(order_id = %order.order_id, error = %e, "pending buy cancel failed — continuing");
                }
            }
        }
        if cancelled > 0 {
            self.after_trade_mutation(symbols.to_vec());
        }
        cancelled
    }

    // -------------------------------------------------------------------------
    // Timeouts & price updates (order monitor worker)
    // -------------------------------------------------------------------------

    /// Cancel tracked orders past their deadline and re-price resting limit
    /// orders that drifted away from the latest quote.
    pub async fn monitor_tracked_orders(&self, quotes: &HashMap<String, Quote>, now_ms: i64) {
        let reprice_interval_ms =
            (self.global.order_monitor_price_update_interval_seconds as i64) * 1_000;

        let due: Vec<(String, OrderTracking)> = {
            let tracked = self.tracked_orders.lock();
            tracked
                .iter()
                .map(|(id, t)| (id.clone(), t.clone()))
                .collect()
        };

        for (order_id, tracking) in due {
            if now_ms >= tracking.deadline_ms {
                info!(
                    order_id = %order_id,
                    symbol = %tracking.symbol,
                    "order timed out — cancelling"
                );
                if let Err(e) = self.gateway.cancel_order(&order_id).await {
                    error!(order_id = %order_id, error = %e, "timeout cancel failed");
                }
                // Fill events racing the cancel are still processed by the
                // bus; tracking is dropped on the terminal push.
                continue;
            }

            // Re-price limit orders that drifted from the market.
            let Some(limit_price) = tracking.price else { continue };
            if tracking.order_type == OrderType::Mo {
                continue;
            }
            if now_ms - tracking.last_reprice_ms < reprice_interval_ms {
                continue;
            }
            let Some(quote) = quotes.get(&tracking.symbol) else {
                continue;
            };
            let drift = (quote.price - limit_price).abs() / limit_price.max(f64::MIN_POSITIVE);
            if drift < REPRICE_DRIFT_FRACTION {
                continue;
            }

            match self
                .gateway
                .replace_order(&order_id, tracking.quantity, Some(quote.price))
                .await
            {
                Ok(()) => {
                    debug!(
                        order_id = %order_id,
                        old_price = limit_price,
                        new_price = quote.price,
                        "resting order re-priced"
                    );
                    let mut tracked = self.tracked_orders.lock();
                    if let Some(t) = tracked.get_mut(&order_id) {
                        t.price = Some(quote.price);
                        t.last_reprice_ms = now_ms;
                    }
                }
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "re-price failed");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Order bus (push reconciliation)
    // -------------------------------------------------------------------------

    /// Consume order-changed events until the channel closes. Spawned once.
    pub async fn run_order_bus(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<OrderUpdate>) {
        let mut sequencer = SequenceBuffer::new();
        info!("order bus consumer started");
        while let Some(update) = rx.recv().await {
            for ordered in sequencer.push(update) {
                self.handle_order_update(ordered);
            }
        }
        info!("order bus consumer stopped");
    }

    /// Apply one (sequence-ordered) order event to the recorder and journal.
    pub(crate) fn handle_order_update(&self, update: OrderUpdate) {
        let now_ms = if update.updated_at_ms > 0 {
            update.updated_at_ms
        } else {
            hk_time::now_ms()
        };
        let day_key = hk_time::hk_date_key(now_ms);

        let tracking = self.tracked_orders.lock().get(&update.order_id).cloned();
        let direction = tracking
            .as_ref()
            .and_then(|t| t.direction)
            .or_else(|| {
                self.registry
                    .resolve_seat_by_symbol(&update.symbol)
                    .map(|(_, d)| d)
            });

        match (update.side, update.status) {
            (OrderSide::Buy, OrderStatus::Filled | OrderStatus::PartialFilled) => {
                if update.executed_quantity > 0.0 {
                    let Some(direction) = direction else {
                        warn!(symbol = %update.symbol, "buy fill for unattributed symbol");
                        return;
                    };
                    self.recorder.record_local_buy(
                        direction,
                        crate::recorder::OrderRecord {
                            order_id: update.order_id.clone(),
                            symbol: update.symbol.clone(),
                            executed_price: update.executed_price.unwrap_or_default(),
                            executed_quantity: update.executed_quantity,
                            executed_time_ms: now_ms,
                            submitted_at_ms: now_ms,
                            updated_at_ms: now_ms,
                        },
                    );
                }
            }
            (OrderSide::Sell, OrderStatus::Filled) => {
                self.recorder
                    .mark_sell_filled(&update.order_id, update.executed_price, &day_key);
            }
            (OrderSide::Sell, OrderStatus::PartialFilled) => {
                self.recorder
                    .update_pending_sell_progress(&update.order_id, update.executed_quantity);
            }
            (
                OrderSide::Sell,
                OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired,
            ) => {
                if update.executed_quantity > 0.0 {
                    self.recorder.mark_sell_partial_filled(
                        &update.order_id,
                        update.executed_quantity,
                        update.executed_price,
                        &day_key,
                    );
                } else {
                    self.recorder.mark_sell_cancelled(&update.order_id);
                }
            }
            _ => {}
        }

        if update.status.is_terminal() {
            self.tracked_orders.lock().remove(&update.order_id);
            self.invalidate_pending_cache();
            self.append_journal(&update, tracking.as_ref(), now_ms);
            self.after_trade_mutation(vec![update.symbol.clone()]);
        }
    }

    fn append_journal(&self, update: &OrderUpdate, tracking: Option<&OrderTracking>, now_ms: i64) {
        let record = TradeRecord {
            order_id: Some(update.order_id.clone()),
            symbol: Some(update.symbol.clone()),
            symbol_name: tracking.map(|t| t.symbol_name.clone()),
            monitor_symbol: tracking.and_then(|t| t.monitor_symbol.clone()),
            action: tracking.map(|t| t.action.to_string()),
            side: Some(update.side.to_string()),
            quantity: Some(update.executed_quantity),
            price: update.executed_price.or(update.price),
            order_type: Some(update.order_type.to_string()),
            status: Some(update.status.to_string()),
            error: update.message.clone(),
            reason: tracking.and_then(|t| t.reason.clone()),
            signal_trigger_time: tracking
                .map(|t| hk_time::hk_iso_timestamp(t.signal_trigger_time_ms)),
            executed_at: Some(hk_time::hk_iso_timestamp(now_ms)),
            executed_at_ms: Some(now_ms),
            timestamp: None, // stamped by the journal
            is_protective_clearance: tracking.map(|t| t.is_protective),
        };

        if let Err(e) = self.journal.append(record, now_ms) {
            error!(order_id = %update.order_id, error = %e, "trade journal append failed");
        }
    }

    fn journal_error(&self, signal: &Signal, monitor_symbol: &str, error: &anyhow::Error) {
        let now_ms = hk_time::now_ms();
        let record = TradeRecord {
            symbol: Some(signal.symbol.clone()),
            symbol_name: Some(signal.symbol_name.clone()),
            monitor_symbol: Some(monitor_symbol.to_string()),
            action: Some(signal.action.to_string()),
            quantity: signal.quantity,
            price: signal.price,
            status: Some("SubmitFailed".to_string()),
            error: Some(format!("{error:#}")),
            reason: signal.reason.clone(),
            signal_trigger_time: Some(hk_time::hk_iso_timestamp(signal.trigger_time_ms)),
            is_protective_clearance: Some(signal.is_protective_liquidation),
            ..Default::default()
        };
        if let Err(e) = self.journal.append(record, now_ms) {
            error!(error = %e, "trade journal append failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockGateway;
    use crate::registry::SeatStatus;

    const SYM: &str = "61999.HK";

    struct Fixture {
        trader: Arc<Trader>,
        mock: Arc<MockGateway>,
        recorder: Arc<OrderRecorder>,
        post_trade: Arc<TaskQueue<PostTradeTask>>,
        gate: Arc<RefreshGate>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockGateway::new());
        let recorder = Arc::new(OrderRecorder::new());
        let registry = Arc::new(SymbolRegistry::new());
        registry.register_monitor("HSI.HK");
        registry.update_seat_state("HSI.HK", Direction::Long, |s| {
            s.symbol = Some(SYM.to_string());
            s.status = SeatStatus::Ready;
        });

        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(RefreshGate::new());
        let post_trade = Arc::new(TaskQueue::new("post-trade"));
        let trader = Arc::new(Trader::new(
            mock.clone() as Arc<dyn TradeGateway>,
            recorder.clone(),
            registry,
            TradeJournal::new(dir.path()),
            GlobalConfig::default(),
            gate.clone(),
            post_trade.clone(),
        ));

        Fixture {
            trader,
            mock,
            recorder,
            post_trade,
            gate,
            _dir: dir,
        }
    }

    fn buy_record(order_id: &str, price: f64, qty: f64) -> crate::recorder::OrderRecord {
        crate::recorder::OrderRecord {
            order_id: order_id.to_string(),
            symbol: SYM.to_string(),
            executed_price: price,
            executed_quantity: qty,
            executed_time_ms: 1_000,
            submitted_at_ms: 1_000,
            updated_at_ms: 1_000,
        }
    }

    fn sell_signal(qty: f64, related: &[&str]) -> Signal {
        let mut s = Signal::new(SignalAction::SellCall, SYM, "HSI BULL A", 0, 1);
        s.price = Some(0.35);
        s.quantity = Some(qty);
        s.related_buy_order_ids = related.iter().map(|r| r.to_string()).collect();
        s
    }

    // ---- merge decision ----------------------------------------------------

    fn pending_snapshot(order_type: OrderType, status: OrderStatus) -> PendingSellSnapshot {
        PendingSellSnapshot {
            order_id: "S1".to_string(),
            order_type,
            broker_status: status,
            remaining_quantity: 100.0,
            related_buy_order_ids: vec!["B1".to_string()],
        }
    }

    #[test]
    fn merge_submit_when_no_pending() {
        assert_eq!(
            decide_sell_merge(&[], OrderType::Elo, false),
            SellMergeDecision::Submit
        );
    }

    #[test]
    fn merge_replace_single_compatible() {
        let pendings = vec![pending_snapshot(OrderType::Elo, OrderStatus::New)];
        assert_eq!(
            decide_sell_merge(&pendings, OrderType::Elo, false),
            SellMergeDecision::Replace {
                order_id: "S1".to_string()
            }
        );
    }

    #[test]
    fn merge_cancel_when_type_differs() {
        let pendings = vec![pending_snapshot(OrderType::Lo, OrderStatus::New)];
        assert_eq!(
            decide_sell_merge(&pendings, OrderType::Elo, false),
            SellMergeDecision::CancelAndSubmit
        );
    }

    #[test]
    fn merge_cancel_when_mid_replace() {
        let pendings = vec![pending_snapshot(OrderType::Elo, OrderStatus::PendingReplace)];
        assert_eq!(
            decide_sell_merge(&pendings, OrderType::Elo, false),
            SellMergeDecision::CancelAndSubmit
        );
    }

    #[test]
    fn merge_cancel_for_market_orders_and_protective() {
        let pendings = vec![pending_snapshot(OrderType::Mo, OrderStatus::New)];
        assert_eq!(
            decide_sell_merge(&pendings, OrderType::Mo, false),
            SellMergeDecision::CancelAndSubmit
        );

        let pendings = vec![pending_snapshot(OrderType::Elo, OrderStatus::New)];
        assert_eq!(
            decide_sell_merge(&pendings, OrderType::Elo, true),
            SellMergeDecision::CancelAndSubmit
        );
    }

    #[test]
    fn merge_cancel_for_multiple_pendings() {
        let pendings = vec![
            pending_snapshot(OrderType::Elo, OrderStatus::New),
            PendingSellSnapshot {
                order_id: "S2".to_string(),
                ..pending_snapshot(OrderType::Elo, OrderStatus::New)
            },
        ];
        assert_eq!(
            decide_sell_merge(&pendings, OrderType::Elo, false),
            SellMergeDecision::CancelAndSubmit
        );
    }

    // ---- sequence buffer ---------------------------------------------------

    fn update(seq: u64, status: OrderStatus) -> OrderUpdate {
        OrderUpdate {
            sequence: seq,
            order_id: format!("ORD-{seq}"),
            symbol: SYM.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Elo,
            status,
            submitted_quantity: 100.0,
            executed_quantity: 0.0,
            executed_price: None,
            price: Some(0.3),
            updated_at_ms: 0,
            message: None,
        }
    }

    #[test]
    fn sequence_buffer_reorders() {
        let mut buf = SequenceBuffer::new();
        assert_eq!(buf.push(update(1, OrderStatus::New)).len(), 1);
        // 3 arrives before 2: held back.
        assert!(buf.push(update(3, OrderStatus::New)).is_empty());
        let ready = buf.push(update(2, OrderStatus::New));
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].sequence, 2);
        assert_eq!(ready[1].sequence, 3);
    }

    #[test]
    fn sequence_buffer_drops_stale() {
        let mut buf = SequenceBuffer::new();
        buf.push(update(5, OrderStatus::New));
        assert!(buf.push(update(4, OrderStatus::New)).is_empty());
        assert!(buf.push(update(5, OrderStatus::New)).is_empty());
    }

    #[test]
    fn sequence_buffer_passes_unsequenced() {
        let mut buf = SequenceBuffer::new();
        assert_eq!(buf.push(update(0, OrderStatus::New)).len(), 1);
    }

    // ---- frequency ---------------------------------------------------------

    #[test]
    fn buy_frequency_gate() {
        let f = fixture();
        let t0 = 1_000_000;

        let ct = f.trader.can_trade_now(SignalAction::BuyCall, "HSI.HK", 120, t0);
        assert!(ct.can_trade);

        f.trader.record_buy_attempt("HSI.HK", Direction::Long, t0);
        let ct = f
            .trader
            .can_trade_now(SignalAction::BuyCall, "HSI.HK", 120, t0 + 60_000);
        assert!(!ct.can_trade);
        assert_eq!(ct.wait_seconds, Some(60));

        // Sells are never limited; the other direction is independent.
        assert!(f
            .trader
            .can_trade_now(SignalAction::SellCall, "HSI.HK", 120, t0)
            .can_trade);
        assert!(f
            .trader
            .can_trade_now(SignalAction::BuyPut, "HSI.HK", 120, t0)
            .can_trade);

        let ct = f
            .trader
            .can_trade_now(SignalAction::BuyCall, "HSI.HK", 120, t0 + 120_000);
        assert!(ct.can_trade);
    }

    // ---- buys --------------------------------------------------------------

    #[tokio::test]
    async fn buy_submission_uses_trading_order_type() {
        let f = fixture();
        let mut signal = Signal::new(SignalAction::BuyCall, SYM, "HSI BULL A", 0, 1);
        signal.price = Some(0.3);
        signal.quantity = Some(10_000.0);

        f.trader
            .execute_buy_signals(vec![signal], "HSI.HK")
            .await;

        let submitted = f.mock.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].order_type, OrderType::Elo);
        assert_eq!(submitted[0].side, OrderSide::Buy);
        assert_eq!(submitted[0].price, Some(0.3));

        // Trade mutation marked the gate stale and queued a refresh.
        assert!(!f.gate.is_fresh());
        assert_eq!(f.post_trade.len(), 1);
    }

    #[tokio::test]
    async fn order_type_override_wins() {
        let f = fixture();
        let mut signal = Signal::new(SignalAction::BuyCall, SYM, "HSI BULL A", 0, 1);
        signal.price = Some(0.3);
        signal.quantity = Some(10_000.0);
        signal.order_type_override = Some(OrderType::Lo);

        f.trader.execute_buy_signals(vec![signal], "HSI.HK").await;
        assert_eq!(f.mock.submitted.lock()[0].order_type, OrderType::Lo);
    }

    #[tokio::test]
    async fn protective_sell_uses_liquidation_order_type() {
        let f = fixture();
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B1", 0.30, 10_000.0));

        let mut signal = sell_signal(10_000.0, &["B1"]).protective();
        signal.order_type_override = None;

        f.trader.execute_sell_signals(vec![signal], "HSI.HK").await;

        let submitted = f.mock.submitted.lock();
        assert_eq!(submitted.len(), 1);
        // GlobalConfig default liquidation type is MO.
        assert_eq!(submitted[0].order_type, OrderType::Mo);
        assert_eq!(submitted[0].price, None);
    }

    #[tokio::test]
    async fn failed_buy_is_journaled() {
        let f = fixture();
        *f.mock.submit_error.lock() = Some("insufficient funds".to_string());

        let mut signal = Signal::new(SignalAction::BuyCall, SYM, "HSI BULL A", 0, 1);
        signal.price = Some(0.3);
        signal.quantity = Some(10_000.0);

        f.trader.execute_buy_signals(vec![signal], "HSI.HK").await;

        let records = f
            .trader
            .journal
            .read_day(hk_time::now_ms())
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0]
            .error
            .as_deref()
            .unwrap()
            .contains("insufficient funds"));
    }

    // ---- sells -------------------------------------------------------------

    #[tokio::test]
    async fn sell_submit_reserves_in_recorder() {
        let f = fixture();
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B1", 0.30, 10_000.0));

        f.trader
            .execute_sell_signals(vec![sell_signal(10_000.0, &["B1"])], "HSI.HK")
            .await;

        let pendings = f.recorder.live_pending_sells(SYM);
        assert_eq!(pendings.len(), 1);
        assert_eq!(pendings[0].related_buy_order_ids, vec!["B1".to_string()]);
        assert!((pendings[0].submitted_quantity - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn second_sell_replaces_compatible_pending() {
        let f = fixture();
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B1", 0.30, 10_000.0));
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B2", 0.32, 10_000.0));

        f.trader
            .execute_sell_signals(vec![sell_signal(10_000.0, &["B1"])], "HSI.HK")
            .await;
        f.trader
            .execute_sell_signals(vec![sell_signal(10_000.0, &["B2"])], "HSI.HK")
            .await;

        // One submit + one replace, no cancels.
        assert_eq!(f.mock.submitted.lock().len(), 1);
        assert_eq!(f.mock.replaced.lock().len(), 1);
        assert!(f.mock.cancelled.lock().is_empty());

        let (_, total, _) = f.mock.replaced.lock()[0].clone();
        assert!((total - 20_000.0).abs() < 1e-9);

        let pendings = f.recorder.live_pending_sells(SYM);
        assert_eq!(pendings.len(), 1);
        assert!((pendings[0].submitted_quantity - 20_000.0).abs() < 1e-9);
        assert_eq!(pendings[0].related_buy_order_ids.len(), 2);
    }

    #[tokio::test]
    async fn replace_failure_falls_back_to_cancel_and_submit() {
        let f = fixture();
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B1", 0.30, 10_000.0));
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B2", 0.32, 10_000.0));

        f.trader
            .execute_sell_signals(vec![sell_signal(10_000.0, &["B1"])], "HSI.HK")
            .await;

        *f.mock.replace_error.lock() = Some("quantity increase unsupported".to_string());
        f.trader
            .execute_sell_signals(vec![sell_signal(10_000.0, &["B2"])], "HSI.HK")
            .await;

        assert_eq!(f.mock.cancelled.lock().len(), 1);
        assert_eq!(f.mock.submitted.lock().len(), 2);

        let pendings = f.recorder.live_pending_sells(SYM);
        assert_eq!(pendings.len(), 1);
        assert!((pendings[0].submitted_quantity - 20_000.0).abs() < 1e-9);
    }

    // ---- order bus ---------------------------------------------------------

    #[test]
    fn buy_fill_lands_in_recorder() {
        let f = fixture();
        f.trader.handle_order_update(OrderUpdate {
            sequence: 1,
            order_id: "ORD-1".to_string(),
            symbol: SYM.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Elo,
            status: OrderStatus::Filled,
            submitted_quantity: 10_000.0,
            executed_quantity: 10_000.0,
            executed_price: Some(0.30),
            price: Some(0.30),
            updated_at_ms: hk_time::now_ms(),
            message: None,
        });

        let ledger = f.recorder.buy_ledger(SYM, Direction::Long);
        assert_eq!(ledger.len(), 1);
        assert!((ledger[0].executed_quantity - 10_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_fill_consumes_reservations_and_journals() {
        let f = fixture();
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B1", 0.30, 10_000.0));

        f.trader
            .execute_sell_signals(vec![sell_signal(10_000.0, &["B1"])], "HSI.HK")
            .await;
        let order_id = f.recorder.live_pending_sells(SYM)[0].order_id.clone();

        let now = hk_time::now_ms();
        f.trader.handle_order_update(OrderUpdate {
            sequence: 1,
            order_id: order_id.clone(),
            symbol: SYM.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Elo,
            status: OrderStatus::Filled,
            submitted_quantity: 10_000.0,
            executed_quantity: 10_000.0,
            executed_price: Some(0.35),
            price: Some(0.35),
            updated_at_ms: now,
            message: None,
        });

        assert!(f.recorder.live_pending_sells(SYM).is_empty());
        assert!(f.recorder.buy_ledger(SYM, Direction::Long).is_empty());

        let records = f.trader.journal.read_day(now).unwrap();
        assert!(records
            .iter()
            .any(|r| r.order_id.as_deref() == Some(order_id.as_str())
                && r.status.as_deref() == Some("Filled")));
    }

    #[tokio::test]
    async fn sell_cancel_with_partial_fill_consumes_partial() {
        let f = fixture();
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B1", 0.30, 10_000.0));
        f.recorder
            .record_local_buy(Direction::Long, buy_record("B2", 0.32, 10_000.0));

        f.trader
            .execute_sell_signals(vec![sell_signal(20_000.0, &["B1", "B2"])], "HSI.HK")
            .await;
        let order_id = f.recorder.live_pending_sells(SYM)[0].order_id.clone();

        f.trader.handle_order_update(OrderUpdate {
            sequence: 1,
            order_id,
            symbol: SYM.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Elo,
            status: OrderStatus::Cancelled,
            submitted_quantity: 20_000.0,
            executed_quantity: 10_000.0,
            executed_price: Some(0.35),
            price: Some(0.35),
            updated_at_ms: hk_time::now_ms(),
            message: None,
        });

        // B1 consumed by the partial fill, B2 released back to the ledger.
        let ledger = f.recorder.buy_ledger(SYM, Direction::Long);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].order_id, "B2");
        assert!(f.recorder.reserved_ids(SYM, Direction::Long).is_empty());
    }

    // ---- timeouts ----------------------------------------------------------

    #[tokio::test]
    async fn timed_out_order_is_cancelled() {
        let f = fixture();
        let mut signal = Signal::new(SignalAction::BuyCall, SYM, "HSI BULL A", 0, 1);
        signal.price = Some(0.3);
        signal.quantity = Some(10_000.0);
        f.trader.execute_buy_signals(vec![signal], "HSI.HK").await;

        let far_future = hk_time::now_ms() + 10 * 60_000;
        f.trader
            .monitor_tracked_orders(&HashMap::new(), far_future)
            .await;

        assert_eq!(f.mock.cancelled.lock().len(), 1);
    }

    #[tokio::test]
    async fn drifted_limit_order_is_repriced() {
        let f = fixture();
        let mut signal = Signal::new(SignalAction::BuyCall, SYM, "HSI BULL A", 0, 1);
        signal.price = Some(0.300);
        signal.quantity = Some(10_000.0);
        f.trader.execute_buy_signals(vec![signal], "HSI.HK").await;

        let mut quotes = HashMap::new();
        quotes.insert(
            SYM.to_string(),
            Quote {
                symbol: SYM.to_string(),
                name: "HSI BULL A".into(),
                price: 0.310, // > 0.2 % drift
                prev_close: 0.3,
                timestamp_ms: 0,
                lot_size: 10_000,
            },
        );

        let soon = hk_time::now_ms() + 1_000;
        f.trader.monitor_tracked_orders(&quotes, soon).await;

        let replaced = f.mock.replaced.lock();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].2, Some(0.310));
    }

    // ---- pending cache -----------------------------------------------------

    #[tokio::test]
    async fn pending_orders_filter_live_statuses() {
        let f = fixture();
        {
            let mut orders = f.mock.today_orders_response.lock();
            for (i, status) in [
                OrderStatus::New,
                OrderStatus::Filled,
                OrderStatus::WaitToReplace,
                OrderStatus::Cancelled,
                OrderStatus::PartialFilled,
            ]
            .iter()
            .enumerate()
            {
                orders.push(RawOrder {
                    order_id: format!("O{i}"),
                    symbol: SYM.to_string(),
                    side: OrderSide::Buy,
                    order_type: OrderType::Elo,
                    status: *status,
                    price: Some(0.3),
                    quantity: 100.0,
                    executed_price: None,
                    executed_quantity: 0.0,
                    submitted_at_ms: 0,
                    updated_at_ms: 0,
                });
            }
        }

        let pendings = f
            .trader
            .get_pending_orders(&[SYM.to_string()], true)
            .await
            .unwrap();
        assert_eq!(pendings.len(), 3);
        assert!(pendings.iter().all(|o| o.status.is_live()));
    }

    #[tokio::test]
    async fn cancel_pending_buy_orders_sweeps_buys_only() {
        let f = fixture();
        {
            let mut orders = f.mock.today_orders_response.lock();
            orders.push(RawOrder {
                order_id: "BUY-1".into(),
                symbol: SYM.to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Elo,
                status: OrderStatus::New,
                price: Some(0.3),
                quantity: 100.0,
                executed_price: None,
                executed_quantity: 0.0,
                submitted_at_ms: 0,
                updated_at_ms: 0,
            });
            orders.push(RawOrder {
                order_id: "SELL-1".into(),
                symbol: SYM.to_string(),
                side: OrderSide::Sell,
                order_type: OrderType::Elo,
                status: OrderStatus::New,
                price: Some(0.35),
                quantity: 100.0,
                executed_price: None,
                executed_quantity: 0.0,
                submitted_at_ms: 0,
                updated_at_ms: 0,
            });
        }

        let cancelled = f.trader.cancel_pending_buy_orders(&[SYM.to_string()]).await;
        assert_eq!(cancelled, 1);
        assert_eq!(f.mock.cancelled.lock().as_slice(), ["BUY-1"]);
    }
}
