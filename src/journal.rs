// =============================================================================
// Trade Journal — one append-only JSON array per HK calendar date
// =============================================================================
//
// Every terminal order event (fill, cancel, reject) produces a record in
// `<log_root>/trades/YYYY-MM-DD.json`. Appends go through the read-modify-
// rename cycle so a crash mid-write never corrupts the day file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::hk_time;

/// One persisted trade event. All fields nullable so the schema never breaks
/// across versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub order_id: Option<String>,
    pub symbol: Option<String>,
    pub symbol_name: Option<String>,
    pub monitor_symbol: Option<String>,
    pub action: Option<String>,
    pub side: Option<String>,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub order_type: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
    pub signal_trigger_time: Option<String>,
    pub executed_at: Option<String>,
    pub executed_at_ms: Option<i64>,
    /// HK ISO-8601 timestamp of the journal append.
    pub timestamp: Option<String>,
    pub is_protective_clearance: Option<bool>,
}

/// Appender for the per-day trade files.
pub struct TradeJournal {
    root: PathBuf,
}

impl TradeJournal {
    pub fn new(log_root: impl AsRef<Path>) -> Self {
        Self {
            root: log_root.as_ref().to_path_buf(),
        }
    }

    fn day_file(&self, ts_ms: i64) -> PathBuf {
        self.root
            .join("trades")
            .join(format!("{}.json", hk_time::hk_date_key(ts_ms)))
    }

    /// Append `record` to the day file for `ts_ms`, stamping the HK
    /// timestamp. The existing array is re-read each time; an unreadable
    /// file is preserved under a `.corrupt` suffix rather than overwritten.
    pub fn append(&self, mut record: TradeRecord, ts_ms: i64) -> Result<()> {
        record.timestamp = Some(hk_time::hk_iso_timestamp(ts_ms));

        let path = self.day_file(ts_ms);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut records: Vec<TradeRecord> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            match serde_json::from_str(&content) {
                Ok(existing) => existing,
                Err(e) => {
                    let quarantine = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "trade journal unreadable — quarantining and starting fresh"
                    );
                    let _ = std::fs::rename(&path, &quarantine);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        records.push(record);

        let content =
            serde_json::to_string_pretty(&records).context("failed to serialise trade records")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        debug!(path = %path.display(), count = records.len(), "trade record appended");
        Ok(())
    }

    /// Read back a day's records (rehydration and tests).
    pub fn read_day(&self, ts_ms: i64) -> Result<Vec<TradeRecord>> {
        let path = self.day_file(ts_ms);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hk_time::hk_timestamp_ms;

    fn record(order_id: &str) -> TradeRecord {
        TradeRecord {
            order_id: Some(order_id.to_string()),
            symbol: Some("61999.HK".to_string()),
            symbol_name: Some("HSI BULL A".to_string()),
            monitor_symbol: Some("HSI.HK".to_string()),
            action: Some("BUYCALL".to_string()),
            side: Some("Buy".to_string()),
            quantity: Some(10_000.0),
            price: Some(0.345),
            order_type: Some("ELO".to_string()),
            status: Some("Filled".to_string()),
            is_protective_clearance: Some(false),
            ..Default::default()
        }
    }

    #[test]
    fn append_creates_day_file() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TradeJournal::new(dir.path());
        let ts = hk_timestamp_ms(2024, 3, 4, 10, 0);

        journal.append(record("ORD-1"), ts).unwrap();

        let path = dir.path().join("trades").join("2024-03-04.json");
        assert!(path.exists());

        let records = journal.read_day(ts).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].order_id.as_deref(), Some("ORD-1"));
        assert!(records[0].timestamp.as_deref().unwrap().contains("+08:00"));
    }

    #[test]
    fn appends_accumulate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TradeJournal::new(dir.path());
        let ts = hk_timestamp_ms(2024, 3, 4, 10, 0);

        journal.append(record("ORD-1"), ts).unwrap();
        journal.append(record("ORD-2"), ts + 1_000).unwrap();

        let records = journal.read_day(ts).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].order_id.as_deref(), Some("ORD-2"));
    }

    #[test]
    fn records_partition_by_hk_date() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TradeJournal::new(dir.path());

        let day1 = hk_timestamp_ms(2024, 3, 4, 23, 59);
        let day2 = hk_timestamp_ms(2024, 3, 5, 0, 1);
        journal.append(record("ORD-1"), day1).unwrap();
        journal.append(record("ORD-2"), day2).unwrap();

        assert_eq!(journal.read_day(day1).unwrap().len(), 1);
        assert_eq!(journal.read_day(day2).unwrap().len(), 1);
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TradeJournal::new(dir.path());
        let ts = hk_timestamp_ms(2024, 3, 4, 10, 0);

        let trades_dir = dir.path().join("trades");
        std::fs::create_dir_all(&trades_dir).unwrap();
        std::fs::write(trades_dir.join("2024-03-04.json"), "{not json").unwrap();

        journal.append(record("ORD-1"), ts).unwrap();
        assert_eq!(journal.read_day(ts).unwrap().len(), 1);
        assert!(trades_dir.join("2024-03-04.json.corrupt").exists());
    }

    #[test]
    fn camel_case_schema() {
        let json = serde_json::to_string(&record("ORD-1")).unwrap();
        assert!(json.contains("\"orderId\""));
        assert!(json.contains("\"symbolName\""));
        assert!(json.contains("\"isProtectiveClearance\""));
        assert!(json.contains("\"orderType\""));
    }
}
