// =============================================================================
// Hong Kong market time — fixed +08:00 offset, day keys, session windows
// =============================================================================
//
// All daily partitioning in the engine (trade journal files, cooldown records,
// search-failure freezes, doomsday latches) is keyed by the HK calendar date.
// The offset is hard-coded: host timezone and locale must never leak into
// trading decisions.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};

use crate::types::TradingDayInfo;

/// Hong Kong is UTC+8 with no daylight saving.
pub const HK_OFFSET_SECS: i32 = 8 * 3600;

/// Minutes since HK midnight for the session boundaries.
pub const MORNING_OPEN_MIN: u32 = 9 * 60 + 30;
pub const MORNING_CLOSE_MIN: u32 = 12 * 60;
pub const AFTERNOON_OPEN_MIN: u32 = 13 * 60;
pub const AFTERNOON_CLOSE_MIN: u32 = 16 * 60;

pub fn hk_offset() -> FixedOffset {
    FixedOffset::east_opt(HK_OFFSET_SECS).expect("+08:00 is a valid offset")
}

/// Wall-clock now in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn hk_datetime(ts_ms: i64) -> DateTime<FixedOffset> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .with_timezone(&hk_offset())
}

/// `YYYY-MM-DD` at UTC+8. Partitions all per-day engine state.
pub fn hk_date_key(ts_ms: i64) -> String {
    hk_datetime(ts_ms).format("%Y-%m-%d").to_string()
}

/// HK ISO-8601 timestamp with explicit offset, used in persisted records.
pub fn hk_iso_timestamp(ts_ms: i64) -> String {
    hk_datetime(ts_ms).to_rfc3339()
}

/// Minutes elapsed since HK midnight.
pub fn hk_minutes_of_day(ts_ms: i64) -> u32 {
    let dt = hk_datetime(ts_ms);
    dt.hour() * 60 + dt.minute()
}

/// HK midnight of the day containing `ts_ms`, in epoch milliseconds.
pub fn hk_midnight_ms(ts_ms: i64) -> i64 {
    let dt = hk_datetime(ts_ms);
    let midnight = dt
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("00:00:00 is a valid time");
    hk_offset()
        .from_local_datetime(&midnight)
        .single()
        .expect("fixed offset has a unique mapping")
        .timestamp_millis()
}

/// The next HK midnight strictly after `ts_ms`.
pub fn next_hk_midnight_ms(ts_ms: i64) -> i64 {
    hk_midnight_ms(ts_ms) + 24 * 3600 * 1000
}

// ---------------------------------------------------------------------------
// Trading calendar
// ---------------------------------------------------------------------------

/// Snapshot of trading days fetched from the quote gateway at startup and
/// refreshed on a 24 h TTL. Keys are HK date keys.
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    days: BTreeMap<String, TradingDayInfo>,
}

impl TradingCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date_key: String, info: TradingDayInfo) {
        self.days.insert(date_key, info);
    }

    pub fn get(&self, date_key: &str) -> Option<TradingDayInfo> {
        self.days.get(date_key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }
}

/// Milliseconds of `[from_ms, to_ms]` that fall inside continuous HK trading
/// sessions according to `calendar`. Days absent from the calendar contribute
/// nothing.
pub fn trading_session_elapsed_ms(from_ms: i64, to_ms: i64, calendar: &TradingCalendar) -> i64 {
    if to_ms <= from_ms {
        return 0;
    }

    let mut total = 0i64;
    let mut day: NaiveDate = hk_datetime(from_ms).date_naive();
    let end_day: NaiveDate = hk_datetime(to_ms).date_naive();

    while day <= end_day {
        let key = day.format("%Y-%m-%d").to_string();
        if let Some(info) = calendar.get(&key) {
            if info.is_trading_day {
                let midnight = hk_offset()
                    .from_local_datetime(&day.and_hms_opt(0, 0, 0).expect("valid midnight"))
                    .single()
                    .expect("fixed offset has a unique mapping")
                    .timestamp_millis();

                let sessions: &[(u32, u32)] = if info.is_half_day {
                    &[(MORNING_OPEN_MIN, MORNING_CLOSE_MIN)]
                } else {
                    &[
                        (MORNING_OPEN_MIN, MORNING_CLOSE_MIN),
                        (AFTERNOON_OPEN_MIN, AFTERNOON_CLOSE_MIN),
                    ]
                };

                for &(start_min, end_min) in sessions {
                    let s_ms = midnight + i64::from(start_min) * 60_000;
                    let e_ms = midnight + i64::from(end_min) * 60_000;
                    let lo = s_ms.max(from_ms);
                    let hi = e_ms.min(to_ms);
                    if hi > lo {
                        total += hi - lo;
                    }
                }
            }
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }

    total
}

/// Build a timestamp for `date_key` at `hour:minute` HK time. Test helper and
/// calendar seeding utility.
pub fn hk_timestamp_ms(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> i64 {
    hk_offset()
        .with_ymd_and_hms(year, month, day, hour, minute, 0)
        .single()
        .expect("valid HK datetime")
        .timestamp_millis()
}

/// Date key for an explicit calendar date.
pub fn date_key_for(year: i32, month: u32, day: u32) -> String {
    format!("{year:04}-{month:02}-{day:02}")
}

/// Convenience used when seeding the calendar from gateway responses.
pub fn date_key_of(date: NaiveDate) -> String {
    date_key_for(date.year(), date.month(), date.day())
}
