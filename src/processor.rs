// =============================================================================
// Signal Processor — buy risk gates and smart-close sell decisions
// =============================================================================
//
// Buy gates run in a fixed order and short-circuit on the first failure,
// recording the reason on the signal:
//
//   1. verification cooldown (before any broker call)
//   2. one batched account + positions fetch for the surviving signals
//   3. trade frequency (buy interval per seat)
//   4. liquidation cooldown
//   5. buy-price guard (averaging-down only)
//   6. doomsday pre-close rejection
//   7. warrant distance to the recall barrier
//   8. position-notional cap and cash check
//
// The frequency slot is reserved right after gate 4 so concurrent verified
// signals in the same tick cannot both pass gate 3.
//
// Sell processing picks the quantity: with smart close on, an integral
// profit (cost average below price) liquidates the whole position, otherwise
// only the profitable lots; signals with nothing sellable demote to HOLD.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::TradeGateway;
use crate::config::MonitorConfig;
use crate::doomsday::DoomsdayProtector;
use crate::guards::{self, LiquidationCooldownTracker, VerificationCooldownTracker};
use crate::recorder::{OrderRecorder, SellableOptions};
use crate::registry::SymbolRegistry;
use crate::signal::Signal;
use crate::trader::Trader;
use crate::types::{Direction, Position, Quote};

pub struct SignalProcessor {
    gateway: Arc<dyn TradeGateway>,
    recorder: Arc<OrderRecorder>,
    registry: Arc<SymbolRegistry>,
    liquidation_cooldowns: Arc<LiquidationCooldownTracker>,
    verification_cooldowns: VerificationCooldownTracker,
    stale_skips: AtomicU64,
}

/// Everything the buy gates need about the seat under check.
pub struct BuyCheckContext<'a> {
    pub monitor: &'a MonitorConfig,
    pub direction: Direction,
    /// Latest underlying price.
    pub monitor_price: f64,
    pub seat_call_price: Option<f64>,
    pub warrant_quote: Option<&'a Quote>,
    pub is_half_day: bool,
    pub doomsday: &'a DoomsdayProtector,
    pub trader: &'a Trader,
    pub now_ms: i64,
}

/// Inputs for sell-quantity processing.
pub struct SellContext<'a> {
    pub positions: &'a HashMap<String, Position>,
    pub quotes: &'a HashMap<String, Quote>,
    pub smart_close_enabled: bool,
}

impl SignalProcessor {
    pub fn new(
        gateway: Arc<dyn TradeGateway>,
        recorder: Arc<OrderRecorder>,
        registry: Arc<SymbolRegistry>,
        liquidation_cooldowns: Arc<LiquidationCooldownTracker>,
    ) -> Self {
        Self {
            gateway,
            recorder,
            registry,
            liquidation_cooldowns,
            verification_cooldowns: VerificationCooldownTracker::new(),
            stale_skips: AtomicU64::new(0),
        }
    }

    /// Signals/tasks dropped for carrying a stale seat version.
    pub fn stale_skip_count(&self) -> u64 {
        self.stale_skips.load(Ordering::Relaxed)
    }

    /// Cross-day reset: verification cooldowns are per-day state.
    pub fn reset_day(&self) {
        self.verification_cooldowns.clear();
    }

    fn skip_stale(&self, signal: &Signal, current_version: u32) {
        self.stale_skips.fetch_add(1, Ordering::Relaxed);
        warn!(
            symbol = %signal.symbol,
            action = %signal.action,
            signal_version = signal.seat_version,
            current_version,
            "seatVersion mismatch — signal skipped"
        );
    }

    fn seat_version_current(&self, signal: &Signal) -> bool {
        let Some((underlying, direction)) = self.registry.resolve_seat_by_symbol(&signal.symbol)
        else {
            // Symbol left the registry entirely; treat as stale.
            self.skip_stale(signal, 0);
            return false;
        };
        let current = self
            .registry
            .get_seat_version(&underlying, direction)
            .unwrap_or(0);
        if current != signal.seat_version {
            self.skip_stale(signal, current);
            return false;
        }
        true
    }

    // -------------------------------------------------------------------------
    // Buy gates
    // -------------------------------------------------------------------------

    /// Run the buy gate chain. Returns the signals that passed, each with
    /// its quantity sized to the target notional.
    pub async fn apply_risk_checks(
        &self,
        signals: Vec<Signal>,
        ctx: &BuyCheckContext<'_>,
    ) -> Vec<Signal> {
        // Gate 1 runs before any broker call.
        let mut candidates: Vec<Signal> = Vec::with_capacity(signals.len());
        for mut signal in signals {
            if !signal.action.is_buy() {
                continue;
            }
            if !self.seat_version_current(&signal) {
                continue;
            }
            if !self
                .verification_cooldowns
                .try_acquire(&signal.symbol, true, ctx.now_ms)
            {
                signal.reject("verified-signal cooldown");
                info!(symbol = %signal.symbol, "buy rejected: verified-signal cooldown");
                continue;
            }
            candidates.push(signal);
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        // Gate 2: one broker round-trip shared by the remaining signals.
        let account = match self.gateway.account_balance("HKD").await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "buy rejected batch: account fetch failed");
                return Vec::new();
            }
        };
        let symbols: Vec<String> = candidates.iter().map(|s| s.symbol.clone()).collect();
        let positions = match self.gateway.stock_positions(&symbols).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "buy rejected batch: positions fetch failed");
                return Vec::new();
            }
        };

        let mut passed = Vec::new();
        for mut signal in candidates {
            match self.run_buy_gates(&mut signal, ctx, account.available_cash, &positions) {
                Ok(()) => passed.push(signal),
                Err(reason) => {
                    info!(
                        symbol = %signal.symbol,
                        action = %signal.action,
                        reason = %reason,
                        "buy rejected"
                    );
                    signal.reject(reason);
                }
            }
        }
        passed
    }

    fn run_buy_gates(
        &self,
        signal: &mut Signal,
        ctx: &BuyCheckContext<'_>,
        available_cash: f64,
        positions: &[crate::broker::BrokerPosition],
    ) -> Result<(), String> {
        let monitor = ctx.monitor;

        // Gate 3: trade frequency.
        let can = ctx.trader.can_trade_now(
            signal.action,
            &monitor.monitor_symbol,
            monitor.buy_interval_seconds,
            ctx.now_ms,
        );
        if !can.can_trade {
            return Err(format!(
                "buy interval not elapsed ({}s remaining)",
                can.wait_seconds.unwrap_or(0)
            ));
        }

        // Gate 4: liquidation cooldown.
        self.liquidation_cooldowns.check(
            &monitor.monitor_symbol,
            ctx.direction,
            &monitor.liquidation_cooldown,
            ctx.now_ms,
        )?;

        // Reserve the frequency slot before the remaining gates so a second
        // verified signal in the same tick fails gate 3.
        ctx.trader
            .record_buy_attempt(&monitor.monitor_symbol, ctx.direction, ctx.now_ms);

        let price = signal
            .price
            .or(ctx.warrant_quote.map(|q| q.price))
            .filter(|p| *p > 0.0)
            .ok_or_else(|| "no warrant price available".to_string())?;
        signal.price = Some(price);

        // Gate 5: buy-price guard — averaging down only.
        if let Some(last_buy) = self
            .recorder
            .last_buy_price(&signal.symbol, ctx.direction)
        {
            if price > last_buy {
                return Err(format!(
                    "price {price:.3} above last buy {last_buy:.3} (averaging-down only)"
                ));
            }
        }

        // Gate 6: doomsday pre-close rejection.
        if ctx.doomsday.should_reject_buy(ctx.now_ms, ctx.is_half_day) {
            return Err("inside pre-close buy rejection window".to_string());
        }

        // Gate 7: warrant distance to the recall barrier.
        let call_price = ctx
            .seat_call_price
            .ok_or_else(|| "seat has no call price".to_string())?;
        if !guards::buy_distance_ok(ctx.direction, ctx.monitor_price, call_price) {
            return Err(format!(
                "warrant distance {:.3}% outside the buy band",
                guards::warrant_distance_pct(ctx.monitor_price, call_price)
            ));
        }

        // Gate 8: notional sizing and caps.
        let lot_size = signal
            .lot_size
            .or(ctx.warrant_quote.map(|q| q.lot_size))
            .unwrap_or(1)
            .max(1);
        let lot_notional = price * f64::from(lot_size);
        let lots = (monitor.target_notional / lot_notional).floor();
        if lots < 1.0 {
            return Err(format!(
                "target notional {:.0} below one lot ({lot_notional:.0})",
                monitor.target_notional
            ));
        }
        let quantity = lots * f64::from(lot_size);
        let order_notional = quantity * price;

        let position_value: f64 = positions
            .iter()
            .filter(|p| p.symbol == signal.symbol)
            .map(|p| {
                if p.cost_price > 0.0 {
                    p.cost_price * p.quantity
                } else {
                    price * p.quantity
                }
            })
            .sum();

        if order_notional + position_value > monitor.max_position_notional {
            return Err(format!(
                "notional cap: order {order_notional:.0} + held {position_value:.0} > {:.0}",
                monitor.max_position_notional
            ));
        }
        if order_notional > available_cash {
            return Err(format!(
                "insufficient cash: need {order_notional:.0}, have {available_cash:.0}"
            ));
        }

        signal.quantity = Some(quantity);
        signal.lot_size = Some(lot_size);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sells
    // -------------------------------------------------------------------------

    /// Compute sell quantities and reservations. Signals with nothing to
    /// sell demote to HOLD and are not returned.
    pub fn process_sell_signals(&self, signals: Vec<Signal>, ctx: &SellContext<'_>) -> Vec<Signal> {
        let mut out = Vec::with_capacity(signals.len());

        for mut signal in signals {
            if !signal.action.is_sell() {
                continue;
            }
            if !self.seat_version_current(&signal) {
                continue;
            }
            let Some(direction) = signal.action.direction() else {
                continue;
            };

            let available = ctx
                .positions
                .get(&signal.symbol)
                .map(|p| p.available_quantity)
                .unwrap_or(0.0);
            if available <= 0.0 {
                signal.reject("no available position");
                continue;
            }

            let quote = ctx.quotes.get(&signal.symbol);
            let Some(current_price) = quote.map(|q| q.price).or(signal.price).filter(|p| *p > 0.0)
            else {
                signal.reject("no current price");
                continue;
            };

            let cap = signal
                .quantity
                .filter(|q| *q > 0.0)
                .map(|q| q.min(available))
                .unwrap_or(available);

            let include_all = if signal.is_protective_liquidation || !ctx.smart_close_enabled {
                true
            } else {
                // Integral-profit check: cost average below the market means
                // the whole position closes, otherwise only profitable lots.
                match self
                    .recorder
                    .get_cost_average_price(&signal.symbol, direction)
                {
                    Some(cost_avg) => cost_avg < current_price,
                    None => true,
                }
            };

            let sellable = self.recorder.get_sellable_orders(
                &signal.symbol,
                direction,
                current_price,
                Some(cap),
                &SellableOptions {
                    include_all,
                    exclude_order_ids: Default::default(),
                },
            );

            if sellable.total_quantity <= 0.0 {
                info!(
                    symbol = %signal.symbol,
                    current_price,
                    include_all,
                    "sell demoted to HOLD: no sellable quantity"
                );
                signal.reject("no sellable quantity");
                continue;
            }

            signal.quantity = Some(sellable.total_quantity);
            signal.related_buy_order_ids = sellable.related_buy_order_ids;
            if signal.price.is_none() {
                signal.price = Some(current_price);
            }
            if signal.lot_size.is_none() {
                signal.lot_size = quote.map(|q| q.lot_size);
            }
            out.push(signal);
        }

        out
    }
}
