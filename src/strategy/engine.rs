// =============================================================================
// Monitor Strategy — evaluates the four signal rules against each snapshot
// =============================================================================
//
// One strategy per monitored underlying. Every tick the engine hands it the
// underlying's indicator snapshot plus the current view of both seats; each
// configured rule that fires produces a signal addressed at the seat's
// warrant, stamped with the seat version observed at emission time.
//
// The emitted signal carries the indicator readings the delayed verifier
// needs as its baseline (the union of the rule's own fields and the
// verification fields for that side).
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::dsl::{IndicatorField, SignalRule};
use crate::config::MonitorConfig;
use crate::pipeline::{IndicatorPeriods, IndicatorSnapshot};
use crate::signal::Signal;
use crate::strategy::dsl::IndicatorSource;
use crate::types::{Direction, Quote, SignalAction};

/// What the strategy needs to know about one seat at evaluation time.
#[derive(Debug, Clone)]
pub struct SeatView {
    pub direction: Direction,
    pub symbol: String,
    pub symbol_name: String,
    pub seat_version: u32,
    pub quote: Option<Quote>,
}

struct RuleSlot {
    action: SignalAction,
    rule: SignalRule,
    /// Baseline fields captured on emission: rule fields plus the side's
    /// verification fields.
    baseline_fields: Vec<IndicatorField>,
}

pub struct MonitorStrategy {
    monitor_symbol: String,
    slots: Vec<RuleSlot>,
    periods: IndicatorPeriods,
}

impl MonitorStrategy {
    /// Parse the monitor's signal configs. Call at startup; errors abort.
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let buy_verification = config.verification.buy.parsed_fields()?;
        let sell_verification = config.verification.sell.parsed_fields()?;

        let mut slots = Vec::new();
        let mut periods = IndicatorPeriods::default();

        let entries = [
            (SignalAction::BuyCall, config.signal_config.buycall.as_ref()),
            (SignalAction::SellCall, config.signal_config.sellcall.as_ref()),
            (SignalAction::BuyPut, config.signal_config.buyput.as_ref()),
            (SignalAction::SellPut, config.signal_config.sellput.as_ref()),
        ];

        for (action, raw) in entries {
            let Some(raw) = raw else { continue };
            let rule = SignalRule::parse(raw)
                .with_context(|| format!("{} rule for {}", action, config.monitor_symbol))?;

            let verification = if action.is_buy() {
                &buy_verification
            } else {
                &sell_verification
            };
            let mut baseline_fields = rule.referenced_fields();
            for field in verification {
                if !baseline_fields.contains(field) {
                    baseline_fields.push(*field);
                }
            }

            periods.absorb_fields(&baseline_fields);
            info!(
                monitor = %config.monitor_symbol,
                %action,
                rule = %rule,
                "signal rule loaded"
            );
            slots.push(RuleSlot {
                action,
                rule,
                baseline_fields,
            });
        }

        periods.absorb_fields(&buy_verification);
        periods.absorb_fields(&sell_verification);

        Ok(Self {
            monitor_symbol: config.monitor_symbol.clone(),
            slots,
            periods,
        })
    }

    /// Indicator periods the pipeline must compute for this monitor.
    pub fn periods(&self) -> IndicatorPeriods {
        self.periods.clone()
    }

    /// Canonical rendering of the loaded rules (startup config echo).
    pub fn describe(&self) -> Vec<(SignalAction, String)> {
        self.slots
            .iter()
            .map(|s| (s.action, s.rule.to_string()))
            .collect()
    }

    /// Evaluate every rule against the underlying's snapshot and emit
    /// signals for the seats currently able to receive them.
    pub fn evaluate(
        &self,
        snapshot: &IndicatorSnapshot,
        long_seat: Option<&SeatView>,
        short_seat: Option<&SeatView>,
        now_ms: i64,
    ) -> Vec<Signal> {
        let mut signals = Vec::new();

        for slot in &self.slots {
            let seat = match slot.action.direction() {
                Some(Direction::Long) => long_seat,
                Some(Direction::Short) => short_seat,
                None => None,
            };
            let Some(seat) = seat else { continue };

            let Some(group_match) = slot.rule.evaluate(snapshot) else {
                continue;
            };

            debug!(
                monitor = %self.monitor_symbol,
                action = %slot.action,
                group = group_match.group_index,
                matched = group_match.matched,
                total = group_match.total,
                "signal rule triggered"
            );

            let mut signal = Signal::new(
                slot.action,
                seat.symbol.clone(),
                seat.symbol_name.clone(),
                now_ms,
                seat.seat_version,
            );
            signal.price = seat.quote.as_ref().map(|q| q.price);
            signal.lot_size = seat.quote.as_ref().map(|q| q.lot_size);
            signal.reason = Some(format!(
                "rule group {} matched {}/{} (threshold {})",
                group_match.group_index,
                group_match.matched,
                group_match.total,
                group_match.threshold
            ));
            signal.trigger_indicators = slot
                .baseline_fields
                .iter()
                .filter_map(|f| snapshot.indicator(f).map(|v| (*f, v)))
                .collect();

            signals.push(signal);
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Fingerprint;
    use std::collections::BTreeMap;

    fn config_with_rules() -> MonitorConfig {
        serde_json::from_str(
            r#"{
                "monitor_symbol": "HSI.HK",
                "signal_config": {
                    "buycall": "(RSI:6<20,MFI<15,D<20,J<-1)/3|(J<-20)",
                    "sellcall": "RSI:6>80",
                    "buyput": "RSI:6>85",
                    "sellput": "RSI:6<15"
                },
                "verification": {
                    "buy": { "delay_seconds": 60, "indicators": ["J"] }
                }
            }"#,
        )
        .unwrap()
    }

    fn snapshot(rsi6: f64, mfi: f64, d: f64, j: f64) -> IndicatorSnapshot {
        let mut rsi = BTreeMap::new();
        rsi.insert(6, rsi6);
        IndicatorSnapshot {
            symbol: "HSI.HK".to_string(),
            price: 20_000.0,
            change_percent: 0.0,
            rsi,
            ema: BTreeMap::new(),
            psy: BTreeMap::new(),
            mfi: Some(mfi),
            kdj: Some(crate::indicators::KdjValue { k: d, d, j }),
            macd: None,
            computed_at_ms: 0,
            fingerprint: Fingerprint {
                len: 0,
                last_close_bits: 0,
            },
        }
    }

    fn long_seat() -> SeatView {
        SeatView {
            direction: Direction::Long,
            symbol: "61999.HK".to_string(),
            symbol_name: "HSI BULL A".to_string(),
            seat_version: 7,
            quote: Some(Quote {
                symbol: "61999.HK".to_string(),
                name: "HSI BULL A".to_string(),
                price: 0.345,
                prev_close: 0.300,
                timestamp_ms: 0,
                lot_size: 10_000,
            }),
        }
    }

    #[test]
    fn oversold_snapshot_triggers_buycall() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        // Matches 3 of 4 in group 0 (J=-0.5 misses J<-1).
        let snap = snapshot(18.0, 12.0, 18.0, -0.5);

        let signals = strategy.evaluate(&snap, Some(&long_seat()), None, 1_000);
        assert_eq!(signals.len(), 1);

        let s = &signals[0];
        assert_eq!(s.action, SignalAction::BuyCall);
        assert_eq!(s.symbol, "61999.HK");
        assert_eq!(s.seat_version, 7);
        assert_eq!(s.price, Some(0.345));
        // Baseline carries rule fields plus the buy verification field J.
        assert!(s
            .trigger_indicators
            .iter()
            .any(|(f, _)| *f == IndicatorField::Rsi(6)));
        assert!(s
            .trigger_indicators
            .iter()
            .any(|(f, v)| *f == IndicatorField::J && (*v + 0.5).abs() < 1e-9));
    }

    #[test]
    fn deep_negative_j_triggers_second_group() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        let snap = snapshot(50.0, 50.0, 50.0, -25.0);

        let signals = strategy.evaluate(&snap, Some(&long_seat()), None, 1_000);
        assert_eq!(signals.len(), 1);
        assert!(signals[0].reason.as_deref().unwrap().contains("group 1"));
    }

    #[test]
    fn neutral_snapshot_triggers_nothing() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        let snap = snapshot(50.0, 50.0, 50.0, 10.0);
        assert!(strategy
            .evaluate(&snap, Some(&long_seat()), None, 1_000)
            .is_empty());
    }

    #[test]
    fn missing_seat_suppresses_signal() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        let snap = snapshot(18.0, 12.0, 18.0, -5.0);
        // No long seat: buycall cannot fire. sellput (RSI:6<15) needs a
        // short seat, also absent.
        assert!(strategy.evaluate(&snap, None, None, 1_000).is_empty());
    }

    #[test]
    fn overbought_triggers_sellcall_on_long_seat() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        let snap = snapshot(82.0, 50.0, 50.0, 10.0);

        let signals = strategy.evaluate(&snap, Some(&long_seat()), None, 1_000);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, SignalAction::SellCall);
    }

    #[test]
    fn periods_absorb_rule_fields() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        let periods = strategy.periods();
        assert!(periods.rsi.contains(&6));
    }

    #[test]
    fn describe_lists_loaded_rules() {
        let strategy = MonitorStrategy::from_config(&config_with_rules()).unwrap();
        let described = strategy.describe();
        assert_eq!(described.len(), 4);
        assert!(described
            .iter()
            .any(|(a, r)| *a == SignalAction::BuyCall && r.contains("J<-20")));
    }
}
