// =============================================================================
// Order Recorder — filled-order ledger, pending-sell reservations, smart-close
// =============================================================================
//
// The central ledger of what the engine actually owns, per (symbol,
// direction):
//
//   - a buy ledger of filled (or partially filled) buy orders that make up
//     the current position, rebuilt from broker order lists and updated
//     locally on fills;
//   - live pending-sell orders, each reserving specific buy orders so two
//     concurrent sells can never claim the same lot;
//   - a sell history used for daily realized-PnL offsets.
//
// Invariants:
//   (a) every reservation references a buy in the current ledger, and the
//       reserved quantity never exceeds the ledger quantity;
//   (b) the cost average is computed over the FULL ledger, ignoring
//       reservations;
//   (c) no two live pending sells overlap in related buy orders.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::broker::RawOrder;
use crate::hk_time::{self, TradingCalendar};
use crate::types::{Direction, OrderSide, OrderType, Quote};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A filled (or partially filled) order in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub executed_price: f64,
    pub executed_quantity: f64,
    pub executed_time_ms: i64,
    pub submitted_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Lifecycle of a tracked sell order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSellStatus {
    Submitted,
    PartialFilled,
    Filled,
    Cancelled,
}

/// A live sell order together with the buy orders it reserves.
#[derive(Debug, Clone)]
pub struct PendingSellOrder {
    pub order_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub submitted_quantity: f64,
    pub executed_quantity: f64,
    pub related_buy_order_ids: Vec<String>,
    pub submitted_at_ms: i64,
    pub status: PendingSellStatus,
    pub order_type: OrderType,
}

impl PendingSellOrder {
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            PendingSellStatus::Submitted | PendingSellStatus::PartialFilled
        )
    }
}

/// Result of a sellable-order selection.
#[derive(Debug, Clone, Default)]
pub struct SellableOrders {
    pub orders: Vec<OrderRecord>,
    pub total_quantity: f64,
    pub related_buy_order_ids: Vec<String>,
}

/// Options for [`OrderRecorder::get_sellable_orders`].
#[derive(Debug, Clone, Default)]
pub struct SellableOptions {
    /// Ignore the profit filter and return the whole unreserved ledger.
    pub include_all: bool,
    /// Order ids the caller wants skipped on top of live reservations.
    pub exclude_order_ids: HashSet<String>,
}

type Key = (String, Direction);

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

pub struct OrderRecorder {
    buys: RwLock<HashMap<Key, Vec<OrderRecord>>>,
    sells: RwLock<HashMap<Key, Vec<OrderRecord>>>,
    pending_sells: RwLock<HashMap<String, PendingSellOrder>>,
    /// (day key, realized pnl) per seat, reset on day rollover.
    realized_today: RwLock<HashMap<Key, (String, f64)>>,
}

impl OrderRecorder {
    pub fn new() -> Self {
        Self {
            buys: RwLock::new(HashMap::new()),
            sells: RwLock::new(HashMap::new()),
            pending_sells: RwLock::new(HashMap::new()),
            realized_today: RwLock::new(HashMap::new()),
        }
    }

    fn key(symbol: &str, direction: Direction) -> Key {
        (symbol.to_string(), direction)
    }

    // -------------------------------------------------------------------------
    // Local updates
    // -------------------------------------------------------------------------

    /// Record a buy fill. `executed_quantity` is the cumulative filled
    /// quantity; an existing record with the same order id is overwritten.
    pub fn record_local_buy(&self, direction: Direction, record: OrderRecord) {
        if record.executed_quantity <= 0.0 || record.executed_price <= 0.0 {
            warn!(
                order_id = %record.order_id,
                quantity = record.executed_quantity,
                price = record.executed_price,
                "dropping buy record with non-positive quantity or price"
            );
            return;
        }

        let key = Self::key(&record.symbol, direction);
        let mut buys = self.buys.write();
        let ledger = buys.entry(key).or_default();
        match ledger.iter_mut().find(|r| r.order_id == record.order_id) {
            Some(existing) => *existing = record,
            None => ledger.push(record),
        }
        ledger.sort_by_key(|r| r.executed_time_ms);
    }

    /// Record a sell fill into the history ledger.
    pub fn record_local_sell(&self, direction: Direction, record: OrderRecord) {
        if record.executed_quantity <= 0.0 {
            warn!(
                order_id = %record.order_id,
                quantity = record.executed_quantity,
                "dropping sell record with non-positive quantity"
            );
            return;
        }
        let key = Self::key(&record.symbol, direction);
        let mut sells = self.sells.write();
        let ledger = sells.entry(key).or_default();
        match ledger.iter_mut().find(|r| r.order_id == record.order_id) {
            Some(existing) => *existing = record,
            None => ledger.push(record),
        }
    }

    // -------------------------------------------------------------------------
    // Full rebuild from broker order lists
    // -------------------------------------------------------------------------

    /// Rebuild the ledger for one seat from a broker-fetched order list.
    ///
    /// Filled buys still backing the current net position are kept: all buys
    /// after the latest sell, plus just enough earlier buys (newest first,
    /// boundary order truncated) to cover the remainder. Live sell orders
    /// found at the broker but not tracked locally are re-tracked with
    /// recovered reservations.
    pub fn refresh_orders_from_all_orders(
        &self,
        symbol: &str,
        direction: Direction,
        raw_orders: &[RawOrder],
        quote: Option<&Quote>,
    ) {
        let key = Self::key(symbol, direction);

        let filled = |o: &&RawOrder| o.symbol == symbol && o.executed_quantity > 0.0;

        let filled_buys: Vec<&RawOrder> = raw_orders
            .iter()
            .filter(|o| o.side == OrderSide::Buy)
            .filter(filled)
            .collect();
        let filled_sells: Vec<&RawOrder> = raw_orders
            .iter()
            .filter(|o| o.side == OrderSide::Sell)
            .filter(filled)
            .collect();

        let total_bought: f64 = filled_buys.iter().map(|o| o.executed_quantity).sum();
        let total_sold: f64 = filled_sells.iter().map(|o| o.executed_quantity).sum();
        let net = (total_bought - total_sold).max(0.0);

        // Walk buys newest-first until the net position is covered; the
        // boundary order is truncated, anything older is already sold.
        let mut buys_desc: Vec<OrderRecord> = filled_buys
            .iter()
            .map(|o| Self::raw_to_record(o))
            .collect();
        buys_desc.sort_by_key(|r| std::cmp::Reverse(r.executed_time_ms));

        let mut ledger: Vec<OrderRecord> = Vec::new();
        let mut remaining = net;
        for mut record in buys_desc {
            if remaining <= 0.0 {
                break;
            }
            if record.executed_quantity > remaining {
                record.executed_quantity = remaining;
            }
            remaining -= record.executed_quantity;
            ledger.push(record);
        }
        ledger.sort_by_key(|r| r.executed_time_ms);

        let position_value = quote
            .map(|q| q.price * ledger.iter().map(|r| r.executed_quantity).sum::<f64>());
        info!(
            symbol,
            %direction,
            orders = ledger.len(),
            net_quantity = net,
            position_value,
            "ledger rebuilt from broker orders"
        );

        self.buys.write().insert(key.clone(), ledger);
        self.sells.write().insert(
            key,
            filled_sells.iter().map(|o| Self::raw_to_record(o)).collect(),
        );

        self.reconcile_pending_sells(symbol, direction, raw_orders);
    }

    fn raw_to_record(raw: &RawOrder) -> OrderRecord {
        OrderRecord {
            order_id: raw.order_id.clone(),
            symbol: raw.symbol.clone(),
            executed_price: raw.executed_price.or(raw.price).unwrap_or(0.0),
            executed_quantity: raw.executed_quantity,
            executed_time_ms: raw.updated_at_ms,
            submitted_at_ms: raw.submitted_at_ms,
            updated_at_ms: raw.updated_at_ms,
        }
    }

    /// Bring tracked pending sells in line with the broker list: drop
    /// terminal ones, prune reservations of buys no longer in the ledger,
    /// and re-track live sells the broker knows about but we do not.
    fn reconcile_pending_sells(&self, symbol: &str, direction: Direction, raw_orders: &[RawOrder]) {
        let ledger_ids: HashSet<String> = self
            .buy_ledger(symbol, direction)
            .into_iter()
            .map(|r| r.order_id)
            .collect();

        let mut to_remove: Vec<String> = Vec::new();
        {
            let mut pending = self.pending_sells.write();
            for (order_id, sell) in pending.iter_mut() {
                if sell.symbol != symbol || sell.direction != direction {
                    continue;
                }
                match raw_orders.iter().find(|o| &o.order_id == order_id) {
                    Some(raw) if raw.status.is_live() => {
                        sell.executed_quantity = raw.executed_quantity;
                        sell.related_buy_order_ids
                            .retain(|id| ledger_ids.contains(id));
                    }
                    _ => to_remove.push(order_id.clone()),
                }
            }
            for order_id in &to_remove {
                pending.remove(order_id);
                debug!(order_id = %order_id, "pending sell dropped during reconcile");
            }
        }

        // Re-track live broker sells we lost (startup, crash recovery).
        let untracked: Vec<&RawOrder> = raw_orders
            .iter()
            .filter(|o| {
                o.symbol == symbol
                    && o.side == OrderSide::Sell
                    && o.status.is_live()
                    && !self.pending_sells.read().contains_key(&o.order_id)
            })
            .collect();

        for raw in untracked {
            let outstanding = raw.quantity - raw.executed_quantity;
            let related =
                self.allocate_related_buy_order_ids_for_recovery(symbol, direction, outstanding);
            info!(
                order_id = %raw.order_id,
                outstanding,
                related = related.len(),
                "re-tracking live sell order from broker"
            );
            self.track_pending_sell(PendingSellOrder {
                order_id: raw.order_id.clone(),
                symbol: symbol.to_string(),
                direction,
                submitted_quantity: raw.quantity,
                executed_quantity: raw.executed_quantity,
                related_buy_order_ids: related,
                submitted_at_ms: raw.submitted_at_ms,
                status: if raw.executed_quantity > 0.0 {
                    PendingSellStatus::PartialFilled
                } else {
                    PendingSellStatus::Submitted
                },
                order_type: raw.order_type,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn buy_ledger(&self, symbol: &str, direction: Direction) -> Vec<OrderRecord> {
        self.buys
            .read()
            .get(&Self::key(symbol, direction))
            .cloned()
            .unwrap_or_default()
    }

    /// Σ(price·qty) / Σ(qty) over the FULL ledger. Reservations are ignored.
    pub fn get_cost_average_price(&self, symbol: &str, direction: Direction) -> Option<f64> {
        let buys = self.buys.read();
        let ledger = buys.get(&Self::key(symbol, direction))?;
        let total_qty: f64 = ledger.iter().map(|r| r.executed_quantity).sum();
        if total_qty <= 0.0 {
            return None;
        }
        let total_value: f64 = ledger
            .iter()
            .map(|r| r.executed_price * r.executed_quantity)
            .sum();
        Some(total_value / total_qty)
    }

    /// Price of the most recent buy in the ledger (averaging-down guard).
    pub fn last_buy_price(&self, symbol: &str, direction: Direction) -> Option<f64> {
        let buys = self.buys.read();
        buys.get(&Self::key(symbol, direction))?
            .last()
            .map(|r| r.executed_price)
    }

    /// Ids of buys reserved by any live pending sell on this seat.
    pub fn reserved_ids(&self, symbol: &str, direction: Direction) -> HashSet<String> {
        self.pending_sells
            .read()
            .values()
            .filter(|p| p.symbol == symbol && p.direction == direction && p.is_live())
            .flat_map(|p| p.related_buy_order_ids.iter().cloned())
            .collect()
    }

    pub fn live_pending_sells(&self, symbol: &str) -> Vec<PendingSellOrder> {
        let mut out: Vec<PendingSellOrder> = self
            .pending_sells
            .read()
            .values()
            .filter(|p| p.symbol == symbol && p.is_live())
            .cloned()
            .collect();
        out.sort_by_key(|p| p.submitted_at_ms);
        out
    }

    /// Realized PnL accumulated today for this seat (negative = loss).
    pub fn realized_pnl_today(&self, symbol: &str, direction: Direction, day_key: &str) -> f64 {
        self.realized_today
            .read()
            .get(&Self::key(symbol, direction))
            .filter(|(day, _)| day == day_key)
            .map(|(_, pnl)| *pnl)
            .unwrap_or(0.0)
    }

    // -------------------------------------------------------------------------
    // Sellable selection (smart close)
    // -------------------------------------------------------------------------

    /// Select sellable buy orders against `current_price`.
    ///
    /// Reserved and explicitly excluded orders are never returned. Without
    /// `include_all`, only orders bought below `current_price` qualify.
    /// LONG seats sell cheapest-first, SHORT seats highest-first. `max_qty`
    /// truncates at whole-order granularity: an order that would overshoot
    /// the cap is dropped along with everything after it.
    pub fn get_sellable_orders(
        &self,
        symbol: &str,
        direction: Direction,
        current_price: f64,
        max_qty: Option<f64>,
        options: &SellableOptions,
    ) -> SellableOrders {
        let reserved = self.reserved_ids(symbol, direction);
        let mut candidates: Vec<OrderRecord> = self
            .buy_ledger(symbol, direction)
            .into_iter()
            .filter(|r| !reserved.contains(&r.order_id))
            .filter(|r| !options.exclude_order_ids.contains(&r.order_id))
            .filter(|r| options.include_all || r.executed_price < current_price)
            .collect();

        match direction {
            Direction::Long => {
                candidates.sort_by(|a, b| a.executed_price.total_cmp(&b.executed_price))
            }
            Direction::Short => {
                candidates.sort_by(|a, b| b.executed_price.total_cmp(&a.executed_price))
            }
        }

        let mut selected = Vec::new();
        let mut total = 0.0;
        for record in candidates {
            if let Some(cap) = max_qty {
                if total + record.executed_quantity > cap + 1e-9 {
                    break;
                }
            }
            total += record.executed_quantity;
            selected.push(record);
        }

        SellableOrders {
            related_buy_order_ids: selected.iter().map(|r| r.order_id.clone()).collect(),
            total_quantity: total,
            orders: selected,
        }
    }

    // -------------------------------------------------------------------------
    // Pending-sell lifecycle
    // -------------------------------------------------------------------------

    /// Start tracking a submitted sell order that reserves `related` buys.
    ///
    /// Reservations overlapping another live pending sell are dropped with a
    /// warning; ids not present in the ledger are dropped too.
    pub fn submit_sell_order(
        &self,
        order_id: &str,
        symbol: &str,
        direction: Direction,
        quantity: f64,
        related: Vec<String>,
        order_type: OrderType,
        now_ms: i64,
    ) {
        if quantity <= 0.0 {
            warn!(order_id, quantity, "dropping pending sell with non-positive quantity");
            return;
        }

        let reserved = self.reserved_ids(symbol, direction);
        let ledger_ids: HashSet<String> = self
            .buy_ledger(symbol, direction)
            .into_iter()
            .map(|r| r.order_id)
            .collect();

        let mut clean = Vec::with_capacity(related.len());
        for id in related {
            if reserved.contains(&id) {
                warn!(order_id, buy_order_id = %id, "reservation overlaps a live pending sell — dropped");
                continue;
            }
            if !ledger_ids.contains(&id) {
                warn!(order_id, buy_order_id = %id, "reservation references unknown buy order — dropped");
                continue;
            }
            clean.push(id);
        }

        self.track_pending_sell(PendingSellOrder {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            direction,
            submitted_quantity: quantity,
            executed_quantity: 0.0,
            related_buy_order_ids: clean,
            submitted_at_ms: now_ms,
            status: PendingSellStatus::Submitted,
            order_type,
        });
    }

    fn track_pending_sell(&self, pending: PendingSellOrder) {
        debug!(
            order_id = %pending.order_id,
            symbol = %pending.symbol,
            quantity = pending.submitted_quantity,
            reserved = pending.related_buy_order_ids.len(),
            "pending sell tracked"
        );
        self.pending_sells
            .write()
            .insert(pending.order_id.clone(), pending);
    }

    /// The sell filled completely: consume every reserved buy from the
    /// ledger and close the tracking entry.
    pub fn mark_sell_filled(&self, order_id: &str, executed_price: Option<f64>, day_key: &str) {
        let Some(pending) = self.pending_sells.write().remove(order_id) else {
            debug!(order_id, "mark_sell_filled for untracked order");
            return;
        };

        let consumed = self.consume_reserved(
            &pending.symbol,
            pending.direction,
            &pending.related_buy_order_ids,
            f64::INFINITY,
        );
        self.accumulate_realized(
            &pending.symbol,
            pending.direction,
            &consumed,
            executed_price,
            day_key,
        );
        info!(
            order_id,
            symbol = %pending.symbol,
            consumed = consumed.len(),
            "sell filled — reservations consumed"
        );
    }

    /// The sell finished partially filled: consume `executed_qty` worth of
    /// reservations (whole buys, boundary truncated) and release the rest.
    pub fn mark_sell_partial_filled(
        &self,
        order_id: &str,
        executed_qty: f64,
        executed_price: Option<f64>,
        day_key: &str,
    ) {
        let Some(pending) = self.pending_sells.write().remove(order_id) else {
            debug!(order_id, "mark_sell_partial_filled for untracked order");
            return;
        };

        let consumed = self.consume_reserved(
            &pending.symbol,
            pending.direction,
            &pending.related_buy_order_ids,
            executed_qty,
        );
        self.accumulate_realized(
            &pending.symbol,
            pending.direction,
            &consumed,
            executed_price,
            day_key,
        );
        info!(
            order_id,
            executed_qty,
            released = pending.related_buy_order_ids.len() - consumed.len(),
            "sell partially filled — remainder released"
        );
    }

    /// Progress update for a still-live sell (cumulative executed quantity).
    pub fn update_pending_sell_progress(&self, order_id: &str, executed_qty: f64) {
        let mut pending = self.pending_sells.write();
        if let Some(sell) = pending.get_mut(order_id) {
            sell.executed_quantity = executed_qty;
            if executed_qty > 0.0 {
                sell.status = PendingSellStatus::PartialFilled;
            }
        }
    }

    /// Grow a live pending sell in place after a broker replace: more
    /// quantity, more reservations. Reservation hygiene matches
    /// `submit_sell_order`.
    pub fn merge_into_pending_sell(
        &self,
        order_id: &str,
        additional_quantity: f64,
        additional_related: Vec<String>,
    ) {
        let (symbol, direction) = {
            let pending = self.pending_sells.read();
            let Some(sell) = pending.get(order_id) else {
                warn!(order_id, "merge into unknown pending sell ignored");
                return;
            };
            (sell.symbol.clone(), sell.direction)
        };

        let reserved = self.reserved_ids(&symbol, direction);
        let ledger_ids: HashSet<String> = self
            .buy_ledger(&symbol, direction)
            .into_iter()
            .map(|r| r.order_id)
            .collect();

        let mut pending = self.pending_sells.write();
        if let Some(sell) = pending.get_mut(order_id) {
            sell.submitted_quantity += additional_quantity;
            for id in additional_related {
                if reserved.contains(&id) || !ledger_ids.contains(&id) {
                    warn!(order_id, buy_order_id = %id, "merge reservation dropped");
                    continue;
                }
                sell.related_buy_order_ids.push(id);
            }
        }
    }

    /// The sell was cancelled or rejected: release every reservation.
    pub fn mark_sell_cancelled(&self, order_id: &str) {
        if let Some(pending) = self.pending_sells.write().remove(order_id) {
            info!(
                order_id,
                released = pending.related_buy_order_ids.len(),
                "sell cancelled — reservations released"
            );
        } else {
            debug!(order_id, "mark_sell_cancelled for untracked order");
        }
    }

    /// Consume up to `quantity` from the ledger, walking `related` in
    /// reservation order. Whole buys are removed; a boundary buy is reduced
    /// in place. Returns `(price, qty)` pairs actually consumed.
    fn consume_reserved(
        &self,
        symbol: &str,
        direction: Direction,
        related: &[String],
        quantity: f64,
    ) -> Vec<(f64, f64)> {
        let key = Self::key(symbol, direction);
        let mut buys = self.buys.write();
        let Some(ledger) = buys.get_mut(&key) else {
            return Vec::new();
        };

        let mut consumed = Vec::new();
        let mut remaining = quantity;
        for id in related {
            if remaining <= 1e-9 {
                break;
            }
            let Some(idx) = ledger.iter().position(|r| &r.order_id == id) else {
                continue;
            };
            if ledger[idx].executed_quantity <= remaining + 1e-9 {
                let record = ledger.remove(idx);
                remaining -= record.executed_quantity;
                consumed.push((record.executed_price, record.executed_quantity));
            } else {
                ledger[idx].executed_quantity -= remaining;
                consumed.push((ledger[idx].executed_price, remaining));
                remaining = 0.0;
            }
        }
        consumed
    }

    fn accumulate_realized(
        &self,
        symbol: &str,
        direction: Direction,
        consumed: &[(f64, f64)],
        sell_price: Option<f64>,
        day_key: &str,
    ) {
        let Some(sell_price) = sell_price else { return };
        let pnl: f64 = consumed
            .iter()
            .map(|(buy_price, qty)| (sell_price - buy_price) * qty)
            .sum();

        let mut realized = self.realized_today.write();
        let entry = realized
            .entry(Self::key(symbol, direction))
            .or_insert_with(|| (day_key.to_string(), 0.0));
        if entry.0 != day_key {
            *entry = (day_key.to_string(), 0.0);
        }
        entry.1 += pnl;
    }

    // -------------------------------------------------------------------------
    // Recovery allocation
    // -------------------------------------------------------------------------

    /// Greedy-match unreserved buys (in sell order for the direction) until
    /// `quantity` is covered. Used when re-tracking a pending sell found at
    /// the broker.
    pub fn allocate_related_buy_order_ids_for_recovery(
        &self,
        symbol: &str,
        direction: Direction,
        quantity: f64,
    ) -> Vec<String> {
        let reserved = self.reserved_ids(symbol, direction);
        let mut candidates: Vec<OrderRecord> = self
            .buy_ledger(symbol, direction)
            .into_iter()
            .filter(|r| !reserved.contains(&r.order_id))
            .collect();
        match direction {
            Direction::Long => {
                candidates.sort_by(|a, b| a.executed_price.total_cmp(&b.executed_price))
            }
            Direction::Short => {
                candidates.sort_by(|a, b| b.executed_price.total_cmp(&a.executed_price))
            }
        }

        let mut out = Vec::new();
        let mut covered = 0.0;
        for record in candidates {
            if covered >= quantity - 1e-9 {
                break;
            }
            covered += record.executed_quantity;
            out.push(record.order_id);
        }
        out
    }

    // -------------------------------------------------------------------------
    // Timeout selector
    // -------------------------------------------------------------------------

    /// Select unreserved buys whose age, measured only during continuous HK
    /// trading sessions, exceeds `timeout_minutes`.
    pub fn select_timeout_buy_orders(
        &self,
        symbol: &str,
        direction: Direction,
        timeout_minutes: u32,
        now_ms: i64,
        calendar: &TradingCalendar,
    ) -> Vec<OrderRecord> {
        let reserved = self.reserved_ids(symbol, direction);
        let threshold_ms = i64::from(timeout_minutes) * 60_000;

        self.buy_ledger(symbol, direction)
            .into_iter()
            .filter(|r| !reserved.contains(&r.order_id))
            .filter(|r| {
                hk_time::trading_session_elapsed_ms(r.executed_time_ms, now_ms, calendar)
                    > threshold_ms
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Clear all state (cross-day reset, startup before rehydration).
    pub fn reset_all(&self) {
        self.buys.write().clear();
        self.sells.write().clear();
        self.pending_sells.write().clear();
        self.realized_today.write().clear();
        info!("order recorder reset");
    }
}

impl Default for OrderRecorder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;

    const SYM: &str = "61999.HK";
    const DAY: &str = "2024-03-04";

    fn buy(order_id: &str, price: f64, qty: f64, time_ms: i64) -> OrderRecord {
        OrderRecord {
            order_id: order_id.to_string(),
            symbol: SYM.to_string(),
            executed_price: price,
            executed_quantity: qty,
            executed_time_ms: time_ms,
            submitted_at_ms: time_ms,
            updated_at_ms: time_ms,
        }
    }

    fn raw(
        order_id: &str,
        side: OrderSide,
        status: OrderStatus,
        price: f64,
        qty: f64,
        executed_qty: f64,
        time_ms: i64,
    ) -> RawOrder {
        RawOrder {
            order_id: order_id.to_string(),
            symbol: SYM.to_string(),
            side,
            order_type: OrderType::Elo,
            status,
            price: Some(price),
            quantity: qty,
            executed_price: Some(price),
            executed_quantity: executed_qty,
            submitted_at_ms: time_ms,
            updated_at_ms: time_ms,
        }
    }

    fn seeded() -> OrderRecorder {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy(Direction::Long, buy("B1", 1.00, 100.0, 1_000));
        recorder.record_local_buy(Direction::Long, buy("B2", 1.20, 100.0, 2_000));
        recorder
    }

    // ---- cost average ------------------------------------------------------

    #[test]
    fn cost_average_over_full_ledger() {
        let recorder = seeded();
        let avg = recorder.get_cost_average_price(SYM, Direction::Long).unwrap();
        assert!((avg - 1.10).abs() < 1e-9);
    }

    #[test]
    fn cost_average_ignores_reservations() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            100.0,
            vec!["B1".to_string()],
            OrderType::Elo,
            3_000,
        );
        let avg = recorder.get_cost_average_price(SYM, Direction::Long).unwrap();
        assert!((avg - 1.10).abs() < 1e-9);
    }

    #[test]
    fn cost_average_empty_is_none() {
        let recorder = OrderRecorder::new();
        assert!(recorder.get_cost_average_price(SYM, Direction::Long).is_none());
    }

    // ---- sellable selection ------------------------------------------------

    #[test]
    fn integral_profit_returns_everything() {
        // cost avg 1.10 < price 1.15 -> caller passes include_all.
        let recorder = seeded();
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Long,
            1.15,
            None,
            &SellableOptions {
                include_all: true,
                ..Default::default()
            },
        );
        assert_eq!(sellable.orders.len(), 2);
        assert!((sellable.total_quantity - 200.0).abs() < 1e-9);
    }

    #[test]
    fn partial_profit_returns_profitable_only() {
        let recorder = seeded();
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Long,
            1.05,
            None,
            &SellableOptions::default(),
        );
        assert_eq!(sellable.orders.len(), 1);
        assert!((sellable.orders[0].executed_price - 1.00).abs() < 1e-9);
        assert!((sellable.total_quantity - 100.0).abs() < 1e-9);
        assert_eq!(sellable.related_buy_order_ids, vec!["B1".to_string()]);
    }

    #[test]
    fn long_sells_cheapest_first() {
        let recorder = seeded();
        recorder.record_local_buy(Direction::Long, buy("B3", 0.90, 100.0, 3_000));
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Long,
            2.0,
            None,
            &SellableOptions::default(),
        );
        let prices: Vec<f64> = sellable.orders.iter().map(|r| r.executed_price).collect();
        assert_eq!(prices, vec![0.90, 1.00, 1.20]);
    }

    #[test]
    fn short_sells_highest_first() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy(Direction::Short, buy("B1", 1.00, 100.0, 1_000));
        recorder.record_local_buy(Direction::Short, buy("B2", 1.20, 100.0, 2_000));
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Short,
            2.0,
            None,
            &SellableOptions::default(),
        );
        let prices: Vec<f64> = sellable.orders.iter().map(|r| r.executed_price).collect();
        assert_eq!(prices, vec![1.20, 1.00]);
    }

    #[test]
    fn max_qty_truncates_whole_orders() {
        let recorder = seeded();
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Long,
            2.0,
            Some(150.0),
            &SellableOptions::default(),
        );
        // 100 fits; adding the next 100 would overshoot 150 -> stop.
        assert_eq!(sellable.orders.len(), 1);
        assert!((sellable.total_quantity - 100.0).abs() < 1e-9);
    }

    #[test]
    fn reserved_orders_are_excluded() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            100.0,
            vec!["B1".to_string()],
            OrderType::Elo,
            3_000,
        );
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Long,
            2.0,
            None,
            &SellableOptions::default(),
        );
        assert_eq!(sellable.related_buy_order_ids, vec!["B2".to_string()]);
    }

    #[test]
    fn caller_exclusions_are_respected() {
        let recorder = seeded();
        let mut exclude = HashSet::new();
        exclude.insert("B2".to_string());
        let sellable = recorder.get_sellable_orders(
            SYM,
            Direction::Long,
            2.0,
            None,
            &SellableOptions {
                include_all: false,
                exclude_order_ids: exclude,
            },
        );
        assert_eq!(sellable.related_buy_order_ids, vec!["B1".to_string()]);
    }

    // ---- pending-sell lifecycle -------------------------------------------

    #[test]
    fn overlapping_reservations_are_rejected() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            100.0,
            vec!["B1".to_string()],
            OrderType::Elo,
            3_000,
        );
        recorder.submit_sell_order(
            "S2",
            SYM,
            Direction::Long,
            200.0,
            vec!["B1".to_string(), "B2".to_string()],
            OrderType::Elo,
            4_000,
        );

        let pendings = recorder.live_pending_sells(SYM);
        let s2 = pendings.iter().find(|p| p.order_id == "S2").unwrap();
        // B1 already reserved by S1 -> only B2 survives.
        assert_eq!(s2.related_buy_order_ids, vec!["B2".to_string()]);

        let reserved = recorder.reserved_ids(SYM, Direction::Long);
        assert_eq!(reserved.len(), 2);
    }

    #[test]
    fn sell_filled_consumes_ledger() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            100.0,
            vec!["B1".to_string()],
            OrderType::Elo,
            3_000,
        );
        recorder.mark_sell_filled("S1", Some(1.05), DAY);

        // Remaining ledger: only B2 -> cost avg 1.20.
        let avg = recorder.get_cost_average_price(SYM, Direction::Long).unwrap();
        assert!((avg - 1.20).abs() < 1e-9);
        assert!(recorder.live_pending_sells(SYM).is_empty());

        // Realized pnl: (1.05 - 1.00) * 100 = 5.0.
        let pnl = recorder.realized_pnl_today(SYM, Direction::Long, DAY);
        assert!((pnl - 5.0).abs() < 1e-9);
    }

    #[test]
    fn full_sell_leaves_no_cost_average() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            200.0,
            vec!["B1".to_string(), "B2".to_string()],
            OrderType::Elo,
            3_000,
        );
        recorder.mark_sell_filled("S1", Some(1.30), DAY);
        assert!(recorder.get_cost_average_price(SYM, Direction::Long).is_none());
    }

    #[test]
    fn partial_fill_consumes_and_releases() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            200.0,
            vec!["B1".to_string(), "B2".to_string()],
            OrderType::Elo,
            3_000,
        );
        // Only 150 of 200 filled: B1 fully consumed, B2 halved.
        recorder.mark_sell_partial_filled("S1", 150.0, Some(1.25), DAY);

        let ledger = recorder.buy_ledger(SYM, Direction::Long);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].order_id, "B2");
        assert!((ledger[0].executed_quantity - 50.0).abs() < 1e-9);
        assert!(recorder.reserved_ids(SYM, Direction::Long).is_empty());
    }

    #[test]
    fn cancel_releases_everything() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            200.0,
            vec!["B1".to_string(), "B2".to_string()],
            OrderType::Elo,
            3_000,
        );
        recorder.mark_sell_cancelled("S1");

        assert!(recorder.reserved_ids(SYM, Direction::Long).is_empty());
        assert_eq!(recorder.buy_ledger(SYM, Direction::Long).len(), 2);
    }

    #[test]
    fn reservation_invariant_holds() {
        let recorder = seeded();
        recorder.submit_sell_order(
            "S1",
            SYM,
            Direction::Long,
            999.0,
            vec![
                "B1".to_string(),
                "B2".to_string(),
                "GHOST".to_string(), // not in ledger -> dropped
            ],
            OrderType::Elo,
            3_000,
        );

        let ledger_ids: HashSet<String> = recorder
            .buy_ledger(SYM, Direction::Long)
            .into_iter()
            .map(|r| r.order_id)
            .collect();
        let reserved = recorder.reserved_ids(SYM, Direction::Long);
        assert!(reserved.is_subset(&ledger_ids));
    }

    // ---- rebuild from broker orders ---------------------------------------

    #[test]
    fn refresh_keeps_buys_after_latest_sell() {
        let recorder = OrderRecorder::new();
        let orders = vec![
            raw("B1", OrderSide::Buy, OrderStatus::Filled, 1.00, 100.0, 100.0, 1_000),
            raw("S1", OrderSide::Sell, OrderStatus::Filled, 1.10, 100.0, 100.0, 2_000),
            raw("B2", OrderSide::Buy, OrderStatus::Filled, 1.20, 100.0, 100.0, 3_000),
            raw("B3", OrderSide::Buy, OrderStatus::Filled, 1.30, 100.0, 100.0, 4_000),
        ];
        recorder.refresh_orders_from_all_orders(SYM, Direction::Long, &orders, None);

        let ledger = recorder.buy_ledger(SYM, Direction::Long);
        let ids: Vec<&str> = ledger.iter().map(|r| r.order_id.as_str()).collect();
        assert_eq!(ids, vec!["B2", "B3"]);
    }

    #[test]
    fn refresh_truncates_boundary_buy() {
        let recorder = OrderRecorder::new();
        // Bought 300, sold 150 -> net 150. Newest-first: B3(100) + 50 of B2.
        let orders = vec![
            raw("B1", OrderSide::Buy, OrderStatus::Filled, 1.00, 100.0, 100.0, 1_000),
            raw("B2", OrderSide::Buy, OrderStatus::Filled, 1.10, 100.0, 100.0, 2_000),
            raw("B3", OrderSide::Buy, OrderStatus::Filled, 1.20, 100.0, 100.0, 3_000),
            raw("S1", OrderSide::Sell, OrderStatus::Filled, 1.15, 150.0, 150.0, 4_000),
        ];
        recorder.refresh_orders_from_all_orders(SYM, Direction::Long, &orders, None);

        let ledger = recorder.buy_ledger(SYM, Direction::Long);
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].order_id, "B2");
        assert!((ledger[0].executed_quantity - 50.0).abs() < 1e-9);
        assert_eq!(ledger[1].order_id, "B3");
    }

    #[test]
    fn refresh_retracks_live_broker_sell() {
        let recorder = OrderRecorder::new();
        let orders = vec![
            raw("B1", OrderSide::Buy, OrderStatus::Filled, 1.00, 100.0, 100.0, 1_000),
            raw("B2", OrderSide::Buy, OrderStatus::Filled, 1.20, 100.0, 100.0, 2_000),
            raw("S1", OrderSide::Sell, OrderStatus::New, 1.30, 100.0, 0.0, 3_000),
        ];
        recorder.refresh_orders_from_all_orders(SYM, Direction::Long, &orders, None);

        let pendings = recorder.live_pending_sells(SYM);
        assert_eq!(pendings.len(), 1);
        assert_eq!(pendings[0].order_id, "S1");
        // Greedy recovery reserves the cheapest buy for a LONG seat.
        assert_eq!(pendings[0].related_buy_order_ids, vec!["B1".to_string()]);
    }

    #[test]
    fn reset_then_refresh_matches_fresh_startup() {
        let orders = vec![
            raw("B1", OrderSide::Buy, OrderStatus::Filled, 1.00, 100.0, 100.0, 1_000),
            raw("S1", OrderSide::Sell, OrderStatus::Filled, 1.10, 50.0, 50.0, 2_000),
            raw("B2", OrderSide::Buy, OrderStatus::Filled, 1.20, 100.0, 100.0, 3_000),
        ];

        let fresh = OrderRecorder::new();
        fresh.refresh_orders_from_all_orders(SYM, Direction::Long, &orders, None);

        let reused = seeded();
        reused.submit_sell_order(
            "SX",
            SYM,
            Direction::Long,
            100.0,
            vec!["B1".to_string()],
            OrderType::Elo,
            9_000,
        );
        reused.reset_all();
        reused.refresh_orders_from_all_orders(SYM, Direction::Long, &orders, None);

        assert_eq!(
            fresh.buy_ledger(SYM, Direction::Long),
            reused.buy_ledger(SYM, Direction::Long)
        );
        assert_eq!(
            fresh.get_cost_average_price(SYM, Direction::Long),
            reused.get_cost_average_price(SYM, Direction::Long)
        );
        assert!(reused.live_pending_sells(SYM).is_empty());
    }

    // ---- timeout selector --------------------------------------------------

    #[test]
    fn timeout_selector_counts_session_time_only() {
        use crate::hk_time::{hk_timestamp_ms, TradingCalendar};
        use crate::types::TradingDayInfo;

        let recorder = OrderRecorder::new();
        let mut cal = TradingCalendar::new();
        cal.insert(
            "2024-03-04".into(),
            TradingDayInfo {
                is_trading_day: true,
                is_half_day: false,
            },
        );

        // Bought at 11:50; by 13:20 only 10 + 20 session minutes elapsed
        // (lunch break does not count).
        let bought_at = hk_timestamp_ms(2024, 3, 4, 11, 50);
        let mut record = buy("B1", 1.0, 100.0, bought_at);
        record.executed_time_ms = bought_at;
        recorder.record_local_buy(Direction::Long, record);

        let now = hk_timestamp_ms(2024, 3, 4, 13, 20);
        assert!(recorder
            .select_timeout_buy_orders(SYM, Direction::Long, 45, now, &cal)
            .is_empty());
        let hits = recorder.select_timeout_buy_orders(SYM, Direction::Long, 25, now, &cal);
        assert_eq!(hits.len(), 1);
    }

    // ---- local record validation ------------------------------------------

    #[test]
    fn negative_quantity_records_are_dropped() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy(Direction::Long, buy("B1", 1.0, -5.0, 1_000));
        assert!(recorder.buy_ledger(SYM, Direction::Long).is_empty());
    }

    #[test]
    fn duplicate_order_id_overwrites() {
        let recorder = OrderRecorder::new();
        recorder.record_local_buy(Direction::Long, buy("B1", 1.0, 50.0, 1_000));
        recorder.record_local_buy(Direction::Long, buy("B1", 1.0, 100.0, 1_000));
        let ledger = recorder.buy_ledger(SYM, Direction::Long);
        assert_eq!(ledger.len(), 1);
        assert!((ledger[0].executed_quantity - 100.0).abs() < 1e-9);
    }
}
