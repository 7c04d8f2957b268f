// =============================================================================
// Engine — the orchestrator that owns every queue, cache, and worker
// =============================================================================
//
// One `Engine` owns the registry, the recorder, the trader, the processor,
// the verifier, the auto-symbol manager, all five queues and their workers.
// Subsystems never hold back-pointers; they receive `Arc` handles at
// construction and IDs/symbols at call time.
//
// The 1 Hz tick drives everything: pull quotes, build each monitor's
// indicator snapshot, evaluate strategy rules, route signals (immediate to
// the buy/sell queues, delayed to the verifier), sweep the verifier, emit
// coalesced monitor tasks, and apply the doomsday windows. Workers consume
// asynchronously; the refresh gate serialises position-sensitive work behind
// post-trade cache refreshes.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auto_symbol::AutoSymbolManager;
use crate::broker::{QuoteGateway, TradeGateway};
use crate::config::{AppConfig, MonitorConfig};
use crate::doomsday::{self, DoomsdayProtector};
use crate::guards::{self, LiquidationCooldownTracker};
use crate::hk_time;
use crate::journal::TradeJournal;
use crate::market_data::MarketDataClient;
use crate::pipeline::{SnapshotPipeline, SnapshotRing};
use crate::processor::{BuyCheckContext, SellContext, SignalProcessor};
use crate::recorder::OrderRecorder;
use crate::registry::{SeatStatus, SymbolRegistry};
use crate::scheduler::{
    refresh_gate::DEFAULT_WAIT_TIMEOUT, spawn_worker_loop, MonitorTask, RefreshGate, TaskQueue,
    Worker,
};
use crate::signal::Signal;
use crate::strategy::{MonitorStrategy, SeatView};
use crate::trader::{PostTradeTask, Trader};
use crate::types::{CandlePeriod, Direction, Position, Quote, SignalAction};
use crate::verifier::DelayedSignalVerifier;

/// Candles pulled per snapshot.
const SNAPSHOT_CANDLE_COUNT: usize = 100;
/// Ticks between health log lines.
const HEALTH_LOG_EVERY_TICKS: u64 = 60;

/// Per-monitor immutable state built at startup.
struct MonitorContext {
    config: MonitorConfig,
    strategy: MonitorStrategy,
    pipeline: SnapshotPipeline,
}

pub struct Engine {
    monitors: HashMap<String, MonitorContext>,
    global: crate::config::GlobalConfig,

    trade_gateway: Arc<dyn TradeGateway>,

    market_data: Arc<MarketDataClient>,
    registry: Arc<SymbolRegistry>,
    recorder: Arc<OrderRecorder>,
    trader: Arc<Trader>,
    processor: Arc<SignalProcessor>,
    verifier: Arc<DelayedSignalVerifier>,
    auto_symbol: Arc<AutoSymbolManager>,
    doomsday: Arc<DoomsdayProtector>,
    cooldowns: Arc<LiquidationCooldownTracker>,
    ring: Arc<SnapshotRing>,
    refresh_gate: Arc<RefreshGate>,

    buy_queue: Arc<TaskQueue<Signal>>,
    sell_queue: Arc<TaskQueue<Signal>>,
    monitor_queue: Arc<TaskQueue<MonitorTask>>,
    post_trade_queue: Arc<TaskQueue<PostTradeTask>>,
    order_monitor_queue: Arc<TaskQueue<HashMap<String, Quote>>>,

    position_cache: RwLock<HashMap<String, Position>>,
    day_key: RwLock<String>,

    workers: Mutex<Vec<Worker>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        quote_gateway: Arc<dyn QuoteGateway>,
        trade_gateway: Arc<dyn TradeGateway>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(SymbolRegistry::new());
        let recorder = Arc::new(OrderRecorder::new());
        let cooldowns = Arc::new(LiquidationCooldownTracker::new());
        let refresh_gate = Arc::new(RefreshGate::new());
        let verifier = Arc::new(DelayedSignalVerifier::new());
        let ring = Arc::new(SnapshotRing::new());
        let market_data = Arc::new(MarketDataClient::new(quote_gateway.clone()));

        let buy_queue = Arc::new(TaskQueue::new("buy"));
        let sell_queue = Arc::new(TaskQueue::new("sell"));
        let monitor_queue = Arc::new(TaskQueue::new("monitor"));
        let post_trade_queue = Arc::new(TaskQueue::new("post-trade"));
        let order_monitor_queue = Arc::new(TaskQueue::new("order-monitor"));

        let trader = Arc::new(Trader::new(
            trade_gateway.clone(),
            recorder.clone(),
            registry.clone(),
            TradeJournal::new(&config.global.log_root),
            config.global.clone(),
            refresh_gate.clone(),
            post_trade_queue.clone(),
        ));

        let processor = Arc::new(SignalProcessor::new(
            trade_gateway.clone(),
            recorder.clone(),
            registry.clone(),
            cooldowns.clone(),
        ));

        let auto_symbol = Arc::new(AutoSymbolManager::new(
            quote_gateway.clone(),
            registry.clone(),
            market_data.clone(),
            verifier.clone(),
            monitor_queue.clone(),
        ));

        let doomsday = Arc::new(DoomsdayProtector::new(config.global.doomsday_protection));

        // Build per-monitor strategy state; malformed configs abort here.
        let mut monitors = HashMap::new();
        for monitor in &config.monitors {
            registry.register_monitor(&monitor.monitor_symbol);
            let strategy = MonitorStrategy::from_config(monitor)
                .with_context(|| format!("monitor {}", monitor.monitor_symbol))?;
            let pipeline = SnapshotPipeline::new(strategy.periods());
            for (action, rule) in strategy.describe() {
                info!(
                    monitor = %monitor.monitor_symbol,
                    %action,
                    rule = %rule,
                    target_notional = monitor.target_notional,
                    buy_delay_s = monitor.verification.buy.delay_seconds,
                    sell_delay_s = monitor.verification.sell.delay_seconds,
                    "monitor configured"
                );
            }
            monitors.insert(
                monitor.monitor_symbol.clone(),
                MonitorContext {
                    config: monitor.clone(),
                    strategy,
                    pipeline,
                },
            );
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            monitors,
            global: config.global.clone(),
            trade_gateway,
            market_data,
            registry,
            recorder,
            trader,
            processor,
            verifier,
            auto_symbol,
            doomsday,
            cooldowns,
            ring,
            refresh_gate,
            buy_queue,
            sell_queue,
            monitor_queue,
            post_trade_queue,
            order_monitor_queue,
            position_cache: RwLock::new(HashMap::new()),
            day_key: RwLock::new(hk_time::hk_date_key(hk_time::now_ms())),
            workers: Mutex::new(Vec::new()),
            shutdown_tx,
        }))
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Subscribe, seed static seats, and rehydrate the recorder from the
    /// broker. Must run before the first tick.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.market_data.install_push_handler();
        self.trader.install_order_push_handler();

        // Static seats from the config occupy immediately.
        for ctx in self.monitors.values() {
            let seats = [
                (Direction::Long, ctx.config.long_symbol.clone()),
                (Direction::Short, ctx.config.short_symbol.clone()),
            ];
            for (direction, symbol) in seats {
                let Some(symbol) = symbol else { continue };
                self.registry
                    .update_seat_state(&ctx.config.monitor_symbol, direction, |s| {
                        s.symbol = Some(symbol.clone());
                        s.status = SeatStatus::Ready;
                    });
            }
        }

        let watched = self.watched_symbols();
        self.market_data
            .subscribe_symbols(&watched)
            .await
            .context("initial subscription")?;

        let now = hk_time::now_ms();
        if let Err(e) = self.market_data.refresh_calendar_if_stale(now).await {
            warn!(error = %e, "trading calendar unavailable at startup");
        }

        // Seat call prices for the distance gates.
        for (underlying, _) in self.monitors.iter() {
            for direction in [Direction::Long, Direction::Short] {
                if let Err(e) = self.auto_symbol.refresh_call_price(underlying, direction).await {
                    warn!(underlying, %direction, error = %e, "call price warmup failed");
                }
            }
        }

        self.rehydrate_recorder().await;
        self.refresh_position_cache().await;

        info!(
            monitors = self.monitors.len(),
            watched = watched.len(),
            "engine initialised"
        );
        Ok(())
    }

    /// Rebuild the recorder from broker order history (startup and cross-day
    /// reset). One seat failing logs and continues.
    async fn rehydrate_recorder(&self) {
        for ctx in self.monitors.values() {
            let mut seats: Vec<(String, Direction)> = Vec::new();
            for direction in [Direction::Long, Direction::Short] {
                if let Some(state) = self
                    .registry
                    .get_seat_state(&ctx.config.monitor_symbol, direction)
                {
                    if let Some(symbol) = state.symbol {
                        seats.push((symbol, direction));
                    }
                }
            }
            // Formerly-seated warrants named in the ownership mapping still
            // need their orders attributed.
            for (symbol, underlying) in &ctx.config.order_ownership_mapping {
                if underlying != &ctx.config.monitor_symbol {
                    continue;
                }
                if seats.iter().any(|(s, _)| s == symbol) {
                    continue;
                }
                let direction = if ctx.config.short_symbol.as_deref() == Some(symbol) {
                    Direction::Short
                } else {
                    Direction::Long
                };
                seats.push((symbol.clone(), direction));
            }

            for (symbol, direction) in seats {
                match self.trade_gateway.today_orders(Some(&symbol)).await {
                    Ok(orders) => {
                        let quote = self.market_data.get_quote(&symbol);
                        self.recorder.refresh_orders_from_all_orders(
                            &symbol,
                            direction,
                            &orders,
                            quote.as_ref(),
                        );
                    }
                    Err(e) => {
                        error!(symbol, error = %e, "order rehydration failed — continuing");
                    }
                }
            }
        }
    }

    async fn refresh_position_cache(&self) {
        match self.trade_gateway.stock_positions(&[]).await {
            Ok(positions) => {
                let cache: HashMap<String, Position> = positions
                    .into_iter()
                    .map(|p| {
                        (
                            p.symbol.clone(),
                            Position {
                                symbol: p.symbol,
                                quantity: p.quantity,
                                available_quantity: p.available_quantity,
                                cost_price: p.cost_price,
                                currency: p.currency,
                                market: p.market,
                            },
                        )
                    })
                    .collect();
                *self.position_cache.write() = cache;
            }
            Err(e) => {
                error!(error = %e, "position cache refresh failed");
            }
        }
    }

    fn watched_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self.monitors.keys().cloned().collect();
        out.extend(self.registry.seat_symbols());
        out.sort();
        out.dedup();
        out
    }

    fn current_quotes(&self) -> HashMap<String, Quote> {
        let watched = self.watched_symbols();
        match self.market_data.get_quotes(&watched) {
            Ok(map) => map
                .into_iter()
                .filter_map(|(symbol, quote)| quote.map(|q| (symbol, q)))
                .collect(),
            Err(e) => {
                error!(error = %e, "quote read failed");
                HashMap::new()
            }
        }
    }

    fn is_half_day(&self, now_ms: i64) -> bool {
        self.market_data
            .calendar_snapshot()
            .get(&hk_time::hk_date_key(now_ms))
            .map(|i| i.is_half_day)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run the tick loop until shutdown. Workers must be started first.
    pub async fn run(self: &Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut tick: u64 = 0;

        info!("tick loop started");
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    tick += 1;
                    let now = hk_time::now_ms();
                    if let Err(e) = self.tick_once(now).await {
                        error!(error = %e, "tick failed");
                    }
                    if tick % HEALTH_LOG_EVERY_TICKS == 0 {
                        info!(
                            stale_skips = self.processor.stale_skip_count(),
                            pending_verifications = self.verifier.pending_count(),
                            buy_queue = self.buy_queue.len(),
                            sell_queue = self.sell_queue.len(),
                            "engine health"
                        );
                    }
                }
            }
        }
        info!("tick loop stopped");
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One pass of the tick pipeline. Public for tests.
    pub async fn tick_once(self: &Arc<Self>, now_ms: i64) -> Result<()> {
        self.handle_day_rollover(now_ms).await;

        let day_key = hk_time::hk_date_key(now_ms);
        let day_info = match self.market_data.is_trading_day(&day_key, now_ms).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "calendar lookup failed — skipping tick");
                return Ok(());
            }
        };
        if !day_info.is_trading_day {
            debug!(day = %day_key, "not a trading day");
            return Ok(());
        }
        let is_half_day = day_info.is_half_day;

        let minutes = hk_time::hk_minutes_of_day(now_ms);
        if !doomsday::is_trading_time(minutes, is_half_day) {
            return Ok(());
        }

        let quotes = self.current_quotes();

        for (underlying, ctx) in self.monitors.iter() {
            if let Err(e) = self
                .monitor_tick(underlying, ctx, &quotes, now_ms, is_half_day)
                .await
            {
                error!(underlying, error = %e, "monitor tick failed — continuing");
            }
        }

        // Delayed signals whose window elapsed re-enter the queues.
        for signal in self.verifier.sweep(now_ms, &self.ring) {
            self.route_verified_signal(signal);
        }

        self.apply_doomsday(&quotes, now_ms, is_half_day).await;

        self.order_monitor_queue
            .schedule_latest("latest-quotes".to_string(), quotes);

        Ok(())
    }

    async fn monitor_tick(
        self: &Arc<Self>,
        underlying: &str,
        ctx: &MonitorContext,
        quotes: &HashMap<String, Quote>,
        now_ms: i64,
        is_half_day: bool,
    ) -> Result<()> {
        let monitor_quote = quotes.get(underlying);

        let candles = self
            .market_data
            .get_candlesticks(underlying, CandlePeriod::OneMinute, SNAPSHOT_CANDLE_COUNT)
            .await?;
        if candles.is_empty() {
            debug!(underlying, "no candles yet");
            return Ok(());
        }

        let snapshot = ctx
            .pipeline
            .build(underlying, &candles, monitor_quote, now_ms);
        self.ring.push_on_change(&snapshot);

        // Monitor tasks run regardless of open protection.
        self.schedule_monitor_tasks(underlying, &ctx.config);

        let minutes = hk_time::hk_minutes_of_day(now_ms);
        if doomsday::in_open_protection(minutes, is_half_day, &self.global.open_protection) {
            debug!(underlying, "open protection — signal generation suppressed");
            return Ok(());
        }

        let long_view = self.seat_view(underlying, Direction::Long, quotes);
        let short_view = self.seat_view(underlying, Direction::Short, quotes);

        let signals = ctx
            .strategy
            .evaluate(&snapshot, long_view.as_ref(), short_view.as_ref(), now_ms);

        for signal in signals {
            self.route_new_signal(underlying, &ctx.config, signal);
        }
        Ok(())
    }

    fn seat_view(
        &self,
        underlying: &str,
        direction: Direction,
        quotes: &HashMap<String, Quote>,
    ) -> Option<SeatView> {
        let (symbol, seat_version) = self.registry.tradable_symbol(underlying, direction)?;
        let quote = quotes.get(&symbol).cloned();
        let symbol_name = quote
            .as_ref()
            .map(|q| q.name.clone())
            .or_else(|| self.market_data.symbol_name(&symbol))
            .unwrap_or_default();
        Some(SeatView {
            direction,
            symbol,
            symbol_name,
            seat_version,
            quote,
        })
    }

    /// Route a freshly-emitted signal: delayed sides park in the verifier,
    /// everything else goes straight to its queue.
    fn route_new_signal(&self, underlying: &str, config: &MonitorConfig, signal: Signal) {
        let rule = if signal.action.is_buy() {
            &config.verification.buy
        } else {
            &config.verification.sell
        };

        if rule.is_delayed() {
            match rule.parsed_fields() {
                Ok(fields) => {
                    self.verifier
                        .enqueue(signal, underlying, rule.delay_seconds, fields);
                    return;
                }
                Err(e) => {
                    // Validated at startup; reaching here means a config
                    // reload slipped through. Fall back to immediate.
                    warn!(error = %e, "verification fields unparseable — treating signal as immediate");
                }
            }
        }
        self.route_verified_signal(signal);
    }

    fn route_verified_signal(&self, signal: Signal) {
        match signal.action {
            SignalAction::BuyCall | SignalAction::BuyPut => self.buy_queue.push(signal),
            SignalAction::SellCall | SignalAction::SellPut => self.sell_queue.push(signal),
            SignalAction::Hold => {}
        }
    }

    fn schedule_monitor_tasks(&self, underlying: &str, config: &MonitorConfig) {
        let tasks = [
            MonitorTask::AutoSymbolTick {
                underlying: underlying.to_string(),
            },
            MonitorTask::UnrealizedLossCheck {
                underlying: underlying.to_string(),
            },
            MonitorTask::LiquidationDistanceCheck {
                underlying: underlying.to_string(),
            },
        ];
        for task in tasks {
            self.monitor_queue.schedule_latest(task.dedupe_key(), task);
        }

        if config
            .auto_search
            .as_ref()
            .and_then(|a| a.switch_distance_range)
            .is_some()
        {
            for direction in [Direction::Long, Direction::Short] {
                let task = MonitorTask::AutoSymbolSwitchDistance {
                    underlying: underlying.to_string(),
                    direction,
                };
                self.monitor_queue.schedule_latest(task.dedupe_key(), task);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Doomsday
    // -------------------------------------------------------------------------

    async fn apply_doomsday(
        self: &Arc<Self>,
        quotes: &HashMap<String, Quote>,
        now_ms: i64,
        is_half_day: bool,
    ) {
        if !self.doomsday.is_enabled() {
            return;
        }
        let day_key = hk_time::hk_date_key(now_ms);

        if self.doomsday.should_reject_buy(now_ms, is_half_day)
            && self.doomsday.arm_cancel_latch(&day_key)
        {
            info!("pre-close window opened — cancelling pending buys");
            let symbols = self.registry.seat_symbols();
            self.trader.cancel_pending_buy_orders(&symbols).await;
        }

        if self.doomsday.is_auto_liquidate_window(now_ms, is_half_day) {
            let positions = self.position_cache.read().clone();
            let signals = self
                .doomsday
                .build_clearance_signals(&self.registry, &positions, quotes, now_ms);
            for signal in signals {
                self.sell_queue.push(signal);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Cross-day reset
    // -------------------------------------------------------------------------

    async fn handle_day_rollover(self: &Arc<Self>, now_ms: i64) {
        let today = hk_time::hk_date_key(now_ms);
        {
            let current = self.day_key.read();
            if *current == today {
                return;
            }
        }
        info!(day = %today, "HK date rolled — resetting daily state");
        *self.day_key.write() = today;

        self.recorder.reset_all();
        self.rehydrate_recorder().await;
        self.trader.reset_buy_attempts();
        self.doomsday.reset_day();
        self.processor.reset_day();

        for underlying in self.registry.underlyings() {
            for direction in [Direction::Long, Direction::Short] {
                self.registry.update_seat_state(&underlying, direction, |s| {
                    s.search_fail_count_today = 0;
                    s.frozen_trading_day_key = None;
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    pub fn start_workers(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }

        // Buy worker: risk gates then submission.
        let engine = self.clone();
        let queue = self.buy_queue.clone();
        let buy = Worker::new(
            "buy",
            Box::new(move |rx| {
                let engine = engine.clone();
                let queue = queue.clone();
                spawn_worker_loop("buy", queue, rx, move |signal| {
                    let engine = engine.clone();
                    async move { engine.handle_buy_signal(signal).await }
                })
            }),
        );

        // Sell worker: waits for post-trade freshness before deciding.
        let engine = self.clone();
        let queue = self.sell_queue.clone();
        let sell = Worker::new(
            "sell",
            Box::new(move |rx| {
                let engine = engine.clone();
                let queue = queue.clone();
                spawn_worker_loop("sell", queue, rx, move |signal| {
                    let engine = engine.clone();
                    async move { engine.handle_sell_signal(signal).await }
                })
            }),
        );

        let engine = self.clone();
        let queue = self.monitor_queue.clone();
        let monitor = Worker::new(
            "monitor",
            Box::new(move |rx| {
                let engine = engine.clone();
                let queue = queue.clone();
                spawn_worker_loop("monitor", queue, rx, move |task| {
                    let engine = engine.clone();
                    async move { engine.handle_monitor_task(task).await }
                })
            }),
        );

        let engine = self.clone();
        let queue = self.post_trade_queue.clone();
        let post_trade = Worker::new(
            "post-trade",
            Box::new(move |rx| {
                let engine = engine.clone();
                let queue = queue.clone();
                spawn_worker_loop("post-trade", queue, rx, move |task| {
                    let engine = engine.clone();
                    async move { engine.handle_post_trade(task).await }
                })
            }),
        );

        let engine = self.clone();
        let queue = self.order_monitor_queue.clone();
        let order_monitor = Worker::new(
            "order-monitor",
            Box::new(move |rx| {
                let engine = engine.clone();
                let queue = queue.clone();
                spawn_worker_loop("order-monitor", queue, rx, move |quotes| {
                    let engine = engine.clone();
                    async move {
                        engine
                            .trader
                            .monitor_tracked_orders(&quotes, hk_time::now_ms())
                            .await;
                    }
                })
            }),
        );

        // Drain order matters at shutdown: post-trade acknowledges the
        // refresh gate before the monitor worker's gated checks drain.
        for worker in [buy, sell, post_trade, monitor, order_monitor] {
            worker.start();
            workers.push(worker);
        }

        // Order bus consumer.
        if let Some(rx) = self.trader.take_bus_receiver() {
            let trader = self.trader.clone();
            tokio::spawn(trader.run_order_bus(rx));
        }

        info!("workers started");
    }

    /// Drain every worker in dependency order.
    pub async fn stop_workers(&self) {
        let workers: Vec<Worker> = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };
        for worker in &workers {
            worker.stop_and_drain().await;
        }
        info!("workers drained");
    }

    // -------------------------------------------------------------------------
    // Worker handlers
    // -------------------------------------------------------------------------

    async fn handle_buy_signal(self: &Arc<Self>, signal: Signal) {
        let Some((underlying, direction)) = self.registry.resolve_seat_by_symbol(&signal.symbol)
        else {
            debug!(symbol = %signal.symbol, "buy signal for unseated symbol dropped");
            return;
        };
        let Some(ctx) = self.monitors.get(&underlying) else {
            return;
        };
        let Some(monitor_quote) = self.market_data.get_quote(&underlying) else {
            warn!(underlying, "no monitor quote — buy skipped");
            return;
        };
        let call_price = self
            .registry
            .get_seat_state(&underlying, direction)
            .and_then(|s| s.call_price);
        let warrant_quote = self.market_data.get_quote(&signal.symbol);
        let now_ms = hk_time::now_ms();

        let check_ctx = BuyCheckContext {
            monitor: &ctx.config,
            direction,
            monitor_price: monitor_quote.price,
            seat_call_price: call_price,
            warrant_quote: warrant_quote.as_ref(),
            is_half_day: self.is_half_day(now_ms),
            doomsday: &self.doomsday,
            trader: &self.trader,
            now_ms,
        };

        let passed = self.processor.apply_risk_checks(vec![signal], &check_ctx).await;
        if !passed.is_empty() {
            self.trader.execute_buy_signals(passed, &underlying).await;
        }
    }

    async fn handle_sell_signal(self: &Arc<Self>, signal: Signal) {
        // No position decision before post-trade caches settle.
        self.refresh_gate.wait_for_fresh(DEFAULT_WAIT_TIMEOUT).await;

        let Some((underlying, direction)) = self.registry.resolve_seat_by_symbol(&signal.symbol)
        else {
            debug!(symbol = %signal.symbol, "sell signal for unseated symbol dropped");
            return;
        };
        let Some(ctx) = self.monitors.get(&underlying) else {
            return;
        };

        let positions = self.position_cache.read().clone();
        let quotes = self.current_quotes();
        let was_protective = signal.is_protective_liquidation;

        let out = self.processor.process_sell_signals(
            vec![signal],
            &SellContext {
                positions: &positions,
                quotes: &quotes,
                smart_close_enabled: ctx.config.smart_close_enabled,
            },
        );
        if out.is_empty() {
            return;
        }

        self.trader.execute_sell_signals(out, &underlying).await;

        if was_protective {
            self.cooldowns
                .record_liquidation(&underlying, direction, hk_time::now_ms());
        }
    }

    async fn handle_monitor_task(self: &Arc<Self>, task: MonitorTask) {
        match task {
            MonitorTask::AutoSymbolTick { underlying } => {
                let Some(ctx) = self.monitors.get(&underlying) else {
                    return;
                };
                let Some(auto) = ctx.config.auto_search.clone() else {
                    return;
                };
                let Some(price) = self.market_data.get_quote(&underlying).map(|q| q.price) else {
                    return;
                };
                let now = hk_time::now_ms();
                for direction in [Direction::Long, Direction::Short] {
                    if let Err(e) = self
                        .auto_symbol
                        .maybe_search_on_tick(&underlying, direction, &auto, price, now)
                        .await
                    {
                        error!(underlying, %direction, error = %e, "auto-symbol search failed");
                    }
                    if let Err(e) = self
                        .auto_symbol
                        .maybe_switch_on_interval(&underlying, direction, &auto, price, now)
                        .await
                    {
                        error!(underlying, %direction, error = %e, "auto-symbol rotation failed");
                    }
                }
            }
            MonitorTask::AutoSymbolSwitchDistance {
                underlying,
                direction,
            } => {
                let Some(ctx) = self.monitors.get(&underlying) else {
                    return;
                };
                let Some(auto) = ctx.config.auto_search.clone() else {
                    return;
                };
                let Some(price) = self.market_data.get_quote(&underlying).map(|q| q.price) else {
                    return;
                };
                if let Err(e) = self
                    .auto_symbol
                    .maybe_switch_on_distance(&underlying, direction, &auto, price, hk_time::now_ms())
                    .await
                {
                    error!(underlying, %direction, error = %e, "distance switch failed");
                }
            }
            MonitorTask::UnrealizedLossCheck { underlying } => {
                self.refresh_gate.wait_for_fresh(DEFAULT_WAIT_TIMEOUT).await;
                self.check_unrealized_loss(&underlying);
            }
            MonitorTask::LiquidationDistanceCheck { underlying } => {
                self.check_liquidation_distance(&underlying);
            }
            MonitorTask::SeatRefresh {
                underlying,
                direction,
                seat_version,
            } => {
                let current = self
                    .registry
                    .get_seat_version(&underlying, direction)
                    .unwrap_or(0);
                if current != seat_version {
                    debug!(
                        underlying,
                        %direction,
                        task_version = seat_version,
                        current,
                        "seat refresh skipped: version moved on"
                    );
                    return;
                }
                if let Err(e) = self.auto_symbol.refresh_call_price(&underlying, direction).await {
                    error!(underlying, %direction, error = %e, "seat refresh failed");
                }
                // New seat symbols need quotes before the next tick.
                let watched = self.watched_symbols();
                if let Err(e) = self.market_data.subscribe_symbols(&watched).await {
                    error!(error = %e, "seat refresh subscription failed");
                }
            }
        }
    }

    /// Emit a protective sell when a seat's combined loss breaches its cap.
    fn check_unrealized_loss(self: &Arc<Self>, underlying: &str) {
        let Some(ctx) = self.monitors.get(underlying) else {
            return;
        };
        let now_ms = hk_time::now_ms();
        let day_key = hk_time::hk_date_key(now_ms);

        for direction in [Direction::Long, Direction::Short] {
            let Some((symbol, seat_version)) = self.registry.tradable_symbol(underlying, direction)
            else {
                continue;
            };
            let Some(position) = self.position_cache.read().get(&symbol).cloned() else {
                continue;
            };
            let Some(quote) = self.market_data.get_quote(&symbol) else {
                continue;
            };
            let Some(cost_avg) = self.recorder.get_cost_average_price(&symbol, direction) else {
                continue;
            };
            let realized = self.recorder.realized_pnl_today(&symbol, direction, &day_key);

            if let Some(loss) = guards::unrealized_loss_breach(
                cost_avg,
                position.quantity,
                quote.price,
                realized,
                ctx.config.max_unrealized_loss_per_symbol,
            ) {
                warn!(
                    underlying,
                    %direction,
                    symbol,
                    loss,
                    "unrealized loss cap breached — liquidating"
                );
                let mut signal = Signal::new(
                    SignalAction::sell_for(direction),
                    symbol,
                    quote.name.clone(),
                    now_ms,
                    seat_version,
                )
                .protective()
                .with_reason(format!("unrealized loss {loss:.0} over cap"));
                signal.price = Some(quote.price);
                signal.quantity = Some(position.available_quantity);
                self.sell_queue.push(signal);
            }
        }
    }

    /// Emit a protective sell when a held warrant sits too close to its
    /// recall barrier.
    fn check_liquidation_distance(self: &Arc<Self>, underlying: &str) {
        let Some(monitor_quote) = self.market_data.get_quote(underlying) else {
            return;
        };
        let now_ms = hk_time::now_ms();

        for direction in [Direction::Long, Direction::Short] {
            let Some((symbol, seat_version)) = self.registry.tradable_symbol(underlying, direction)
            else {
                continue;
            };
            let Some(call_price) = self
                .registry
                .get_seat_state(underlying, direction)
                .and_then(|s| s.call_price)
            else {
                continue;
            };
            if !guards::liquidation_distance_breached(direction, monitor_quote.price, call_price) {
                continue;
            }
            let Some(position) = self.position_cache.read().get(&symbol).cloned() else {
                continue;
            };
            if position.available_quantity <= 0.0 {
                continue;
            }

            warn!(
                underlying,
                %direction,
                symbol,
                call_price,
                monitor_price = monitor_quote.price,
                "warrant too close to recall — liquidating"
            );
            let quote = self.market_data.get_quote(&symbol);
            let mut signal = Signal::new(
                SignalAction::sell_for(direction),
                symbol,
                quote.as_ref().map(|q| q.name.clone()).unwrap_or_default(),
                now_ms,
                seat_version,
            )
            .protective()
            .with_reason("distance to recall barrier breached");
            signal.price = quote.map(|q| q.price);
            signal.quantity = Some(position.available_quantity);
            self.sell_queue.push(signal);
        }
    }

    /// Post-trade refresh: positions, ledgers, and warrant distances, then
    /// acknowledge the gate version.
    async fn handle_post_trade(self: &Arc<Self>, task: PostTradeTask) {
        self.refresh_position_cache().await;

        for symbol in &task.symbols {
            let Some((_, direction)) = self.registry.resolve_seat_by_symbol(symbol) else {
                continue;
            };
            match self.trade_gateway.today_orders(Some(symbol)).await {
                Ok(orders) => {
                    let quote = self.market_data.get_quote(symbol);
                    self.recorder.refresh_orders_from_all_orders(
                        symbol,
                        direction,
                        &orders,
                        quote.as_ref(),
                    );
                }
                Err(e) => {
                    error!(symbol, error = %e, "post-trade ledger refresh failed — continuing");
                }
            }
        }

        // Call prices drift with the underlying; refresh them while we are
        // already stale.
        for symbol in &task.symbols {
            if let Some((underlying, direction)) = self.registry.resolve_seat_by_symbol(symbol) {
                if let Err(e) = self.auto_symbol.refresh_call_price(&underlying, direction).await {
                    debug!(symbol, error = %e, "post-trade call price refresh failed");
                }
            }
        }

        self.refresh_gate.mark_fresh(task.gate_version);
    }

    // -------------------------------------------------------------------------
    // Accessors used by main and tests
    // -------------------------------------------------------------------------

    pub fn buy_queue_len(&self) -> usize {
        self.buy_queue.len()
    }

    pub fn sell_queue_len(&self) -> usize {
        self.sell_queue.len()
    }

    pub fn verifier_pending(&self) -> usize {
        self.verifier.pending_count()
    }
}
