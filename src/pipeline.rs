// =============================================================================
// Indicator Pipeline — snapshot computation, fingerprint cache, lookback ring
// =============================================================================
//
// Every tick the engine pulls candles for a monitor symbol and asks the
// pipeline for a snapshot. Recomputation is skipped when the candle series
// fingerprint (length + last close) is unchanged and the cached snapshot is
// younger than the TTL; a cache hit returns the identical `Arc`, so callers
// may compare snapshots by pointer.
//
// The ring keeps the most recent snapshots per symbol for the delayed-signal
// verifier's historical lookups.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::indicators::{ema, kdj, macd, mfi, psy, rsi, KdjValue, MacdValue};
use crate::strategy::dsl::{IndicatorField, IndicatorSource};
use crate::types::{Candle, Quote};

/// Snapshot cache TTL.
const SNAPSHOT_TTL_MS: i64 = 5_000;
/// Maximum number of symbols the fingerprint cache retains.
const SNAPSHOT_CACHE_MAX: usize = 50;
/// Snapshots retained per symbol for verifier lookback.
const RING_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Candle-series fingerprint: length plus the bit pattern of the last close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: usize,
    pub last_close_bits: u64,
}

impl Fingerprint {
    pub fn of(candles: &[Candle]) -> Self {
        Self {
            len: candles.len(),
            last_close_bits: candles.last().map(|c| c.close.to_bits()).unwrap_or(0),
        }
    }
}

/// Point-in-time bundle of computed indicators for one symbol.
#[derive(Debug, Clone)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub price: f64,
    pub change_percent: f64,
    pub rsi: BTreeMap<u32, f64>,
    pub ema: BTreeMap<u32, f64>,
    pub psy: BTreeMap<u32, f64>,
    pub mfi: Option<f64>,
    pub kdj: Option<KdjValue>,
    pub macd: Option<MacdValue>,
    pub computed_at_ms: i64,
    pub fingerprint: Fingerprint,
}

impl IndicatorSource for IndicatorSnapshot {
    fn indicator(&self, field: &IndicatorField) -> Option<f64> {
        match field {
            IndicatorField::Rsi(p) => self.rsi.get(p).copied(),
            IndicatorField::Psy(p) => self.psy.get(p).copied(),
            IndicatorField::Mfi => self.mfi,
            IndicatorField::K => self.kdj.map(|v| v.k),
            IndicatorField::D => self.kdj.map(|v| v.d),
            IndicatorField::J => self.kdj.map(|v| v.j),
            IndicatorField::Macd => self.macd.map(|v| v.macd),
            IndicatorField::Dif => self.macd.map(|v| v.dif),
            IndicatorField::Dea => self.macd.map(|v| v.dea),
        }
    }
}

// ---------------------------------------------------------------------------
// Period configuration
// ---------------------------------------------------------------------------

/// Which periods the pipeline computes for the period-parameterised
/// indicators. Seeded with defaults and extended by every period the
/// monitor's signal rules actually reference.
#[derive(Debug, Clone)]
pub struct IndicatorPeriods {
    pub rsi: Vec<u32>,
    pub ema: Vec<u32>,
    pub psy: Vec<u32>,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        Self {
            rsi: vec![6, 12, 24],
            ema: vec![5, 10, 20],
            psy: vec![12, 24],
        }
    }
}

impl IndicatorPeriods {
    /// Extend with the periods referenced by a rule's conditions.
    pub fn absorb_fields(&mut self, fields: &[IndicatorField]) {
        for field in fields {
            match field {
                IndicatorField::Rsi(p) if !self.rsi.contains(p) => self.rsi.push(*p),
                IndicatorField::Psy(p) if !self.psy.contains(p) => self.psy.push(*p),
                _ => {}
            }
        }
        self.rsi.sort_unstable();
        self.psy.sort_unstable();
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct CacheEntry {
    snapshot: Arc<IndicatorSnapshot>,
    cached_at_ms: i64,
}

/// Snapshot builder with a per-symbol fingerprint cache.
pub struct SnapshotPipeline {
    periods: IndicatorPeriods,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl SnapshotPipeline {
    pub fn new(periods: IndicatorPeriods) -> Self {
        Self {
            periods,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn periods(&self) -> &IndicatorPeriods {
        &self.periods
    }

    /// Build (or reuse) the snapshot for `symbol` from `candles`.
    ///
    /// `quote` supplies price and change-percent; when absent the last candle
    /// close stands in. A cache hit returns the identical `Arc`.
    pub fn build(
        &self,
        symbol: &str,
        candles: &[Candle],
        quote: Option<&Quote>,
        now_ms: i64,
    ) -> Arc<IndicatorSnapshot> {
        let fingerprint = Fingerprint::of(candles);

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(symbol) {
                if entry.snapshot.fingerprint == fingerprint
                    && now_ms - entry.cached_at_ms < SNAPSHOT_TTL_MS
                {
                    debug!(symbol, "snapshot cache hit");
                    return entry.snapshot.clone();
                }
            }
        }

        let snapshot = Arc::new(self.compute(symbol, candles, quote, now_ms, fingerprint));

        let mut cache = self.cache.lock();
        cache.insert(
            symbol.to_string(),
            CacheEntry {
                snapshot: snapshot.clone(),
                cached_at_ms: now_ms,
            },
        );
        // Evict the stalest entries once over budget.
        while cache.len() > SNAPSHOT_CACHE_MAX {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.cached_at_ms)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            } else {
                break;
            }
        }

        snapshot
    }

    fn compute(
        &self,
        symbol: &str,
        candles: &[Candle],
        quote: Option<&Quote>,
        now_ms: i64,
        fingerprint: Fingerprint,
    ) -> IndicatorSnapshot {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let mut rsi_map = BTreeMap::new();
        for &p in &self.periods.rsi {
            if let Some(v) = rsi::latest_rsi(&closes, p as usize) {
                rsi_map.insert(p, v);
            }
        }

        let mut ema_map = BTreeMap::new();
        for &p in &self.periods.ema {
            if let Some(v) = ema::latest_ema(&closes, p as usize) {
                ema_map.insert(p, v);
            }
        }

        let mut psy_map = BTreeMap::new();
        for &p in &self.periods.psy {
            if let Some(v) = psy::latest_psy(&closes, p as usize) {
                psy_map.insert(p, v);
            }
        }

        let price = quote
            .map(|q| q.price)
            .or_else(|| closes.last().copied())
            .unwrap_or(0.0);
        let change_percent = quote.map(|q| q.change_percent()).unwrap_or(0.0);

        IndicatorSnapshot {
            symbol: symbol.to_string(),
            price,
            change_percent,
            rsi: rsi_map,
            ema: ema_map,
            psy: psy_map,
            mfi: mfi::latest_mfi(candles, 14),
            kdj: kdj::latest_kdj(candles, 9),
            macd: macd::latest_macd(&closes),
            computed_at_ms: now_ms,
            fingerprint,
        }
    }
}

// ---------------------------------------------------------------------------
// Lookback ring
// ---------------------------------------------------------------------------

/// Per-symbol ring of recent snapshots, pushed on change only.
pub struct SnapshotRing {
    rings: Mutex<HashMap<String, VecDeque<Arc<IndicatorSnapshot>>>>,
}

impl SnapshotRing {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Append `snapshot` unless it is the same object as the ring's newest
    /// entry (cache hits produce pointer-identical snapshots).
    pub fn push_on_change(&self, snapshot: &Arc<IndicatorSnapshot>) {
        let mut rings = self.rings.lock();
        let ring = rings
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(RING_CAPACITY));

        if let Some(last) = ring.back() {
            if Arc::ptr_eq(last, snapshot) {
                return;
            }
        }

        ring.push_back(snapshot.clone());
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
    }

    /// The snapshot computed closest to `at_ms`, within `tolerance_ms`.
    pub fn find_closest(
        &self,
        symbol: &str,
        at_ms: i64,
        tolerance_ms: i64,
    ) -> Option<Arc<IndicatorSnapshot>> {
        let rings = self.rings.lock();
        let ring = rings.get(symbol)?;

        ring.iter()
            .min_by_key(|s| (s.computed_at_ms - at_ms).abs())
            .filter(|s| (s.computed_at_ms - at_ms).abs() <= tolerance_ms)
            .cloned()
    }

    /// Drop all history for `symbol` (seat switched away or cleanup).
    pub fn clear_symbol(&self, symbol: &str) {
        self.rings.lock().remove(symbol);
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.rings.lock().get(symbol).map_or(0, VecDeque::len)
    }
}

impl Default for SnapshotRing {
    fn default() -> Self {
        Self::new()
    }
}
