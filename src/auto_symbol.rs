// =============================================================================
// Auto-Symbol Manager — warrant search, rotation, and seat switching
// =============================================================================
//
// Keeps each monitor's seats occupied with a tradable CBBC. Candidates come
// from the broker's warrant screener and must clear distance, turnover and
// expiry filters; the highest-turnover survivor wins. Seat transitions go
// EMPTY/SEARCHING -> SWITCHING -> READY, bump the seat version at every
// step, and cancel delayed signals for the affected direction so no stale
// work survives the switch.
//
// Failed searches count per HK date; past the limit the seat freezes until
// the next trading day.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, TimeZone};
use tracing::{debug, info, warn};

use crate::broker::{QuoteGateway, WarrantBrief, WarrantListFilter, WarrantType};
use crate::config::AutoSearchConfig;
use crate::guards;
use crate::hk_time;
use crate::market_data::MarketDataClient;
use crate::registry::{SeatStatus, SymbolRegistry};
use crate::scheduler::{MonitorTask, TaskQueue};
use crate::types::Direction;
use crate::verifier::DelayedSignalVerifier;

/// Minutes of continuous trading per full HK session day.
const TRADING_MINUTES_PER_DAY: f64 = 330.0;

/// What a failed search does to the seat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFailureOutcome {
    /// Try again on a later tick with the incremented counter.
    Retry { fail_count: u32 },
    /// Too many failures: freeze the seat for the rest of the HK date.
    FreezeForDay { day_key: String },
}

/// Pure transition for the per-day failed-search limit.
pub fn resolve_next_search_failure_state(
    fail_count_today: u32,
    max_failures: u32,
    now_ms: i64,
) -> SearchFailureOutcome {
    let next = fail_count_today + 1;
    if next >= max_failures {
        SearchFailureOutcome::FreezeForDay {
            day_key: hk_time::hk_date_key(now_ms),
        }
    } else {
        SearchFailureOutcome::Retry { fail_count: next }
    }
}

/// Filter + rank screener rows for one seat. Rows must carry a call price,
/// clear the distance/turnover/expiry bars, and not be `exclude`; the
/// highest turnover wins.
pub fn select_candidate<'a>(
    warrants: &'a [WarrantBrief],
    direction: Direction,
    monitor_price: f64,
    config: &AutoSearchConfig,
    now_ms: i64,
    exclude: Option<&str>,
) -> Option<&'a WarrantBrief> {
    let min_expiry =
        hk_time::hk_offset().timestamp_millis_opt(now_ms).single()?.date_naive()
            + ChronoDuration::days(i64::from(config.expiry_min_months) * 30);

    warrants
        .iter()
        .filter(|w| Some(w.symbol.as_str()) != exclude)
        .filter(|w| w.last_done > 0.0)
        .filter(|w| w.expiry_date >= min_expiry)
        .filter(|w| w.turnover / TRADING_MINUTES_PER_DAY >= config.min_turnover_per_minute)
        .filter(|w| {
            let Some(call_price) = w.call_price else {
                return false;
            };
            let distance = guards::warrant_distance_pct(monitor_price, call_price);
            match direction {
                Direction::Long => distance >= config.min_distance_pct,
                Direction::Short => distance <= -config.min_distance_pct,
            }
        })
        .max_by(|a, b| a.turnover.total_cmp(&b.turnover))
}

pub struct AutoSymbolManager {
    gateway: Arc<dyn QuoteGateway>,
    registry: Arc<SymbolRegistry>,
    market_data: Arc<MarketDataClient>,
    verifier: Arc<DelayedSignalVerifier>,
    monitor_queue: Arc<TaskQueue<MonitorTask>>,
}

impl AutoSymbolManager {
    pub fn new(
        gateway: Arc<dyn QuoteGateway>,
        registry: Arc<SymbolRegistry>,
        market_data: Arc<MarketDataClient>,
        verifier: Arc<DelayedSignalVerifier>,
        monitor_queue: Arc<TaskQueue<MonitorTask>>,
    ) -> Self {
        Self {
            gateway,
            registry,
            market_data,
            verifier,
            monitor_queue,
        }
    }

    fn warrant_type_for(direction: Direction) -> WarrantType {
        match direction {
            Direction::Long => WarrantType::Bull,
            Direction::Short => WarrantType::Bear,
        }
    }

    // -------------------------------------------------------------------------
    // Tick entry points
    // -------------------------------------------------------------------------

    /// Try to fill an empty seat. No-op when the seat is occupied, frozen
    /// for the day, or inside its search interval.
    pub async fn maybe_search_on_tick(
        &self,
        underlying: &str,
        direction: Direction,
        config: &AutoSearchConfig,
        monitor_price: f64,
        now_ms: i64,
    ) -> Result<()> {
        if !config.enabled {
            return Ok(());
        }
        let Some(state) = self.registry.get_seat_state(underlying, direction) else {
            return Ok(());
        };
        if !matches!(state.status, SeatStatus::Empty | SeatStatus::Searching) {
            return Ok(());
        }
        let today = hk_time::hk_date_key(now_ms);
        if state.frozen_trading_day_key.as_deref() == Some(today.as_str()) {
            return Ok(());
        }
        if let Some(last) = state.last_search_at_ms {
            if now_ms - last < (config.search_interval_seconds as i64) * 1_000 {
                return Ok(());
            }
        }

        self.registry.update_seat_state(underlying, direction, |s| {
            s.status = SeatStatus::Searching;
            s.last_search_at_ms = Some(now_ms);
        });

        let warrants = match self
            .gateway
            .warrant_list(
                underlying,
                WarrantListFilter {
                    warrant_type: Self::warrant_type_for(direction),
                    sort_by_turnover_desc: true,
                },
            )
            .await
        {
            Ok(w) => w,
            Err(e) => {
                warn!(underlying, %direction, error = %e, "warrant screener call failed");
                self.record_search_failure(underlying, direction, &state, config, now_ms);
                return Ok(());
            }
        };

        match select_candidate(&warrants, direction, monitor_price, config, now_ms, None) {
            Some(candidate) => {
                let candidate = candidate.clone();
                self.occupy_seat(underlying, direction, &candidate, now_ms)
                    .await?;
            }
            None => {
                debug!(
                    underlying,
                    %direction,
                    screened = warrants.len(),
                    "no warrant candidate cleared the filters"
                );
                self.record_search_failure(underlying, direction, &state, config, now_ms);
            }
        }
        Ok(())
    }

    /// Rotate away from a held warrant whose distance left the configured
    /// band. Only switches when a qualifying replacement exists.
    pub async fn maybe_switch_on_distance(
        &self,
        underlying: &str,
        direction: Direction,
        config: &AutoSearchConfig,
        monitor_price: f64,
        now_ms: i64,
    ) -> Result<()> {
        let Some(range) = config.switch_distance_range else {
            return Ok(());
        };
        let Some(state) = self.registry.get_seat_state(underlying, direction) else {
            return Ok(());
        };
        if state.status != SeatStatus::Ready {
            return Ok(());
        }
        let (Some(symbol), Some(call_price)) = (state.symbol.clone(), state.call_price) else {
            return Ok(());
        };

        let distance = guards::warrant_distance_pct(monitor_price, call_price).abs();
        if distance >= range.low && distance <= range.high {
            return Ok(());
        }

        info!(
            underlying,
            %direction,
            symbol,
            distance,
            low = range.low,
            high = range.high,
            "held warrant left the distance band — searching replacement"
        );
        self.search_replacement(underlying, direction, config, monitor_price, &symbol, now_ms)
            .await
    }

    /// Periodic rotation: after `switch_interval_seconds` a better candidate
    /// (by turnover) replaces the held warrant.
    pub async fn maybe_switch_on_interval(
        &self,
        underlying: &str,
        direction: Direction,
        config: &AutoSearchConfig,
        monitor_price: f64,
        now_ms: i64,
    ) -> Result<()> {
        let Some(interval_s) = config.switch_interval_seconds else {
            return Ok(());
        };
        let Some(state) = self.registry.get_seat_state(underlying, direction) else {
            return Ok(());
        };
        if state.status != SeatStatus::Ready {
            return Ok(());
        }
        let Some(symbol) = state.symbol.clone() else {
            return Ok(());
        };
        if let Some(last) = state.last_switch_at_ms {
            if now_ms - last < (interval_s as i64) * 1_000 {
                return Ok(());
            }
        }

        self.search_replacement(underlying, direction, config, monitor_price, &symbol, now_ms)
            .await
    }

    async fn search_replacement(
        &self,
        underlying: &str,
        direction: Direction,
        config: &AutoSearchConfig,
        monitor_price: f64,
        current_symbol: &str,
        now_ms: i64,
    ) -> Result<()> {
        let warrants = self
            .gateway
            .warrant_list(
                underlying,
                WarrantListFilter {
                    warrant_type: Self::warrant_type_for(direction),
                    sort_by_turnover_desc: true,
                },
            )
            .await?;

        match select_candidate(
            &warrants,
            direction,
            monitor_price,
            config,
            now_ms,
            Some(current_symbol),
        ) {
            Some(candidate) => {
                let candidate = candidate.clone();
                let version = self.occupy_seat(underlying, direction, &candidate, now_ms).await?;
                info!(
                    underlying,
                    %direction,
                    from = current_symbol,
                    to = %candidate.symbol,
                    version,
                    "seat switched"
                );
            }
            None => {
                // Keep the current warrant rather than going empty.
                debug!(underlying, %direction, "no replacement candidate — keeping current seat");
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seat transitions
    // -------------------------------------------------------------------------

    /// Occupy the seat with `warrant`: SWITCHING while the symbol warms up,
    /// then READY. Cancels the direction's delayed signals and enqueues a
    /// seat refresh carrying the new version.
    async fn occupy_seat(
        &self,
        underlying: &str,
        direction: Direction,
        warrant: &WarrantBrief,
        now_ms: i64,
    ) -> Result<u32> {
        self.registry.update_seat_state(underlying, direction, |s| {
            s.status = SeatStatus::Switching;
            s.symbol = Some(warrant.symbol.clone());
            s.call_price = warrant.call_price;
            s.last_switch_at_ms = Some(now_ms);
        });

        // In-flight work against the previous symbol is now void.
        self.verifier.cancel_all_for_direction(underlying, direction);

        self.market_data
            .subscribe_symbols(&[warrant.symbol.clone()])
            .await?;

        let version = self
            .registry
            .update_seat_state(underlying, direction, |s| {
                s.status = SeatStatus::Ready;
                s.search_fail_count_today = 0;
            })
            .unwrap_or(0);

        info!(
            underlying,
            %direction,
            symbol = %warrant.symbol,
            call_price = ?warrant.call_price,
            version,
            "seat occupied"
        );

        let task = MonitorTask::SeatRefresh {
            underlying: underlying.to_string(),
            direction,
            seat_version: version,
        };
        self.monitor_queue.schedule_latest(task.dedupe_key(), task);
        Ok(version)
    }

    fn record_search_failure(
        &self,
        underlying: &str,
        direction: Direction,
        state: &crate::registry::SeatState,
        config: &AutoSearchConfig,
        now_ms: i64,
    ) {
        match resolve_next_search_failure_state(
            state.search_fail_count_today,
            config.max_search_failures_per_day,
            now_ms,
        ) {
            SearchFailureOutcome::Retry { fail_count } => {
                self.registry.update_seat_state(underlying, direction, |s| {
                    s.status = SeatStatus::Empty;
                    s.search_fail_count_today = fail_count;
                });
            }
            SearchFailureOutcome::FreezeForDay { day_key } => {
                warn!(
                    underlying,
                    %direction,
                    day = %day_key,
                    "search failures exhausted — seat frozen for the day"
                );
                self.registry.update_seat_state(underlying, direction, |s| {
                    s.status = SeatStatus::Empty;
                    s.search_fail_count_today += 1;
                    s.frozen_trading_day_key = Some(day_key.clone());
                });
            }
        }
    }

    /// Refresh the held warrant's call price from the broker (seat-refresh
    /// task handler).
    pub async fn refresh_call_price(&self, underlying: &str, direction: Direction) -> Result<()> {
        let Some(state) = self.registry.get_seat_state(underlying, direction) else {
            return Ok(());
        };
        let Some(symbol) = state.symbol else {
            return Ok(());
        };

        let quotes = self.gateway.warrant_quote(&[symbol.clone()]).await?;
        if let Some(w) = quotes.iter().find(|w| w.symbol == symbol) {
            if w.call_price != state.call_price {
                self.registry.update_seat_state(underlying, direction, |s| {
                    s.call_price = w.call_price;
                });
                debug!(underlying, %direction, symbol, call_price = ?w.call_price, "call price refreshed");
            }
        }
        Ok(())
    }
}
