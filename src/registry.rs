// =============================================================================
// Symbol Registry — per-underlying LONG/SHORT seats with monotonic versions
// =============================================================================
//
// Each monitor owns two seats. A seat holds at most one warrant symbol and a
// status; every mutation bumps the seat's version counter. The version is the
// single source of truth for identity on in-flight work: any signal or task
// carrying a stale version must be skipped by its worker.
//
// Thread safety: seat state behind parking_lot::RwLock, versions in
// AtomicU32. A reverse symbol -> seat map keeps `resolve_seat_by_symbol`
// O(1); it is maintained inside `update_seat_state`.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::types::Direction;

/// Seat occupancy lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatStatus {
    Empty,
    Searching,
    Switching,
    Ready,
}

impl std::fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "EMPTY"),
            Self::Searching => write!(f, "SEARCHING"),
            Self::Switching => write!(f, "SWITCHING"),
            Self::Ready => write!(f, "READY"),
        }
    }
}

/// Mutable state of one seat.
#[derive(Debug, Clone)]
pub struct SeatState {
    pub symbol: Option<String>,
    pub status: SeatStatus,
    pub call_price: Option<f64>,
    pub last_switch_at_ms: Option<i64>,
    pub last_search_at_ms: Option<i64>,
    pub search_fail_count_today: u32,
    /// When set, no further searches happen on this HK date.
    pub frozen_trading_day_key: Option<String>,
}

impl Default for SeatState {
    fn default() -> Self {
        Self {
            symbol: None,
            status: SeatStatus::Empty,
            call_price: None,
            last_switch_at_ms: None,
            last_search_at_ms: None,
            search_fail_count_today: 0,
            frozen_trading_day_key: None,
        }
    }
}

struct SeatCell {
    state: RwLock<SeatState>,
    version: AtomicU32,
}

/// Registry of all seats, keyed by (underlying, direction).
pub struct SymbolRegistry {
    seats: RwLock<HashMap<(String, Direction), Arc<SeatCell>>>,
    by_symbol: RwLock<HashMap<String, (String, Direction)>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self {
            seats: RwLock::new(HashMap::new()),
            by_symbol: RwLock::new(HashMap::new()),
        }
    }

    /// Create both seats for an underlying. Idempotent.
    pub fn register_monitor(&self, underlying: &str) {
        let mut seats = self.seats.write();
        for direction in [Direction::Long, Direction::Short] {
            seats
                .entry((underlying.to_string(), direction))
                .or_insert_with(|| {
                    Arc::new(SeatCell {
                        state: RwLock::new(SeatState::default()),
                        version: AtomicU32::new(1),
                    })
                });
        }
    }

    fn cell(&self, underlying: &str, direction: Direction) -> Option<Arc<SeatCell>> {
        self.seats
            .read()
            .get(&(underlying.to_string(), direction))
            .cloned()
    }

    pub fn get_seat_state(&self, underlying: &str, direction: Direction) -> Option<SeatState> {
        self.cell(underlying, direction)
            .map(|cell| cell.state.read().clone())
    }

    pub fn get_seat_version(&self, underlying: &str, direction: Direction) -> Option<u32> {
        self.cell(underlying, direction)
            .map(|cell| cell.version.load(Ordering::SeqCst))
    }

    /// Mutate a seat through `mutate` and bump its version. Returns the new
    /// version, or `None` for an unknown seat.
    ///
    /// The reverse-lookup map is kept in sync with the symbol change here, so
    /// every symbol points at the seat currently holding it.
    pub fn update_seat_state<F>(
        &self,
        underlying: &str,
        direction: Direction,
        mutate: F,
    ) -> Option<u32>
    where
        F: FnOnce(&mut SeatState),
    {
        let cell = self.cell(underlying, direction)?;
        let (old_symbol, new_symbol) = {
            let mut state = cell.state.write();
            let old = state.symbol.clone();
            mutate(&mut state);
            (old, state.symbol.clone())
        };

        if old_symbol != new_symbol {
            let mut by_symbol = self.by_symbol.write();
            if let Some(old) = old_symbol {
                by_symbol.remove(&old);
            }
            if let Some(new) = new_symbol {
                by_symbol.insert(new, (underlying.to_string(), direction));
            }
        }

        let version = cell.version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(underlying, %direction, version, "seat updated");
        Some(version)
    }

    /// Bump the version without touching state (invalidates in-flight work).
    pub fn bump_seat_version(&self, underlying: &str, direction: Direction) -> Option<u32> {
        let cell = self.cell(underlying, direction)?;
        let version = cell.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(underlying, %direction, version, "seat version bumped");
        Some(version)
    }

    /// Reverse lookup: which seat currently holds `symbol`.
    pub fn resolve_seat_by_symbol(&self, symbol: &str) -> Option<(String, Direction)> {
        self.by_symbol.read().get(symbol).cloned()
    }

    /// A seat is tradable only when READY with a symbol. Returns the symbol
    /// and the version observed together with it.
    pub fn tradable_symbol(&self, underlying: &str, direction: Direction) -> Option<(String, u32)> {
        let cell = self.cell(underlying, direction)?;
        let state = cell.state.read();
        if state.status != SeatStatus::Ready {
            return None;
        }
        let symbol = state.symbol.clone()?;
        Some((symbol, cell.version.load(Ordering::SeqCst)))
    }

    /// All symbols currently occupying any seat.
    pub fn seat_symbols(&self) -> Vec<String> {
        self.by_symbol.read().keys().cloned().collect()
    }

    /// All registered underlyings (deduplicated).
    pub fn underlyings(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .seats
            .read()
            .keys()
            .map(|(u, _)| u.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

impl Default for SymbolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
