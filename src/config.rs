// =============================================================================
// Engine Configuration — per-underlying monitors plus global trading settings
// =============================================================================
//
// Loaded once at startup from a JSON file. Every field carries a serde
// default so older config files keep deserialising after new fields are
// added. Signal configs and verification indicator lists are validated
// eagerly: a malformed DSL string aborts startup instead of silently
// producing a monitor that can never trade.
//
// Persistence uses the atomic tmp + rename pattern.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::strategy::dsl::{IndicatorField, SignalRule};
use crate::types::OrderType;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_target_notional() -> f64 {
    20_000.0
}

fn default_max_position_notional() -> f64 {
    60_000.0
}

fn default_max_daily_loss() -> f64 {
    5_000.0
}

fn default_max_unrealized_loss() -> f64 {
    2_000.0
}

fn default_buy_interval_seconds() -> u64 {
    120
}

fn default_buy_order_timeout() -> u64 {
    30
}

fn default_sell_order_timeout() -> u64 {
    60
}

fn default_price_update_interval() -> u64 {
    10
}

fn default_open_protection_minutes() -> u32 {
    5
}

fn default_log_root() -> String {
    "logs".to_string()
}

fn default_min_distance_pct() -> f64 {
    1.0
}

fn default_min_turnover_per_minute() -> f64 {
    200_000.0
}

fn default_expiry_min_months() -> u32 {
    3
}

fn default_search_interval_seconds() -> u64 {
    60
}

fn default_max_search_failures_per_day() -> u32 {
    5
}

fn default_trading_order_type() -> OrderType {
    OrderType::Elo
}

fn default_liquidation_order_type() -> OrderType {
    OrderType::Mo
}

// =============================================================================
// Per-monitor configuration
// =============================================================================

/// Delayed-verification settings for one side (buy or sell).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationRule {
    /// 0 disables delayed verification: signals fire immediately.
    #[serde(default)]
    pub delay_seconds: u64,
    /// Indicator names to re-check, e.g. `["RSI:6", "J"]`.
    #[serde(default)]
    pub indicators: Vec<String>,
}

impl VerificationRule {
    pub fn is_delayed(&self) -> bool {
        self.delay_seconds > 0 && !self.indicators.is_empty()
    }

    /// Parse the indicator names into fields. Validated at startup.
    pub fn parsed_fields(&self) -> Result<Vec<IndicatorField>> {
        self.indicators
            .iter()
            .map(|s| IndicatorField::parse(s))
            .collect()
    }
}

/// Buy/sell verification pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub buy: VerificationRule,
    #[serde(default)]
    pub sell: VerificationRule,
}

/// The four optional signal rule strings of a monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfigSet {
    #[serde(default)]
    pub buycall: Option<String>,
    #[serde(default)]
    pub sellcall: Option<String>,
    #[serde(default)]
    pub buyput: Option<String>,
    #[serde(default)]
    pub sellput: Option<String>,
}

impl SignalConfigSet {
    pub fn entries(&self) -> [(&'static str, Option<&String>); 4] {
        [
            ("buycall", self.buycall.as_ref()),
            ("sellcall", self.sellcall.as_ref()),
            ("buyput", self.buyput.as_ref()),
            ("sellput", self.sellput.as_ref()),
        ]
    }
}

/// Post-liquidation buy-freeze policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum LiquidationCooldownConfig {
    /// Reject buys until `minutes` after the protective liquidation.
    #[serde(rename_all = "camelCase")]
    Minutes { minutes: u32 },
    /// Reject buys until the next HK midnight.
    MidnightEligible,
}

impl Default for LiquidationCooldownConfig {
    fn default() -> Self {
        Self::Minutes { minutes: 30 }
    }
}

/// Band of acceptable distance-to-call for a held warrant; leaving the band
/// triggers a seat switch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DistanceRange {
    pub low: f64,
    pub high: f64,
}

/// Automatic warrant search settings for one monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSearchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum distance-to-call (percent of underlying price) a candidate
    /// must have. Applied as a magnitude for both bull and bear warrants.
    #[serde(default = "default_min_distance_pct")]
    pub min_distance_pct: f64,
    /// Minimum average turnover per trading minute.
    #[serde(default = "default_min_turnover_per_minute")]
    pub min_turnover_per_minute: f64,
    /// Candidates expiring sooner than this many months are skipped.
    #[serde(default = "default_expiry_min_months")]
    pub expiry_min_months: u32,
    /// Switch away from the held warrant when its distance leaves this band.
    #[serde(default)]
    pub switch_distance_range: Option<DistanceRange>,
    #[serde(default = "default_search_interval_seconds")]
    pub search_interval_seconds: u64,
    /// When set, a held warrant is re-evaluated against the screener this
    /// often and rotated if a better candidate exists.
    #[serde(default)]
    pub switch_interval_seconds: Option<u64>,
    /// After this many failed searches the seat freezes for the day.
    #[serde(default = "default_max_search_failures_per_day")]
    pub max_search_failures_per_day: u32,
}

impl Default for AutoSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_distance_pct: default_min_distance_pct(),
            min_turnover_per_minute: default_min_turnover_per_minute(),
            expiry_min_months: default_expiry_min_months(),
            switch_distance_range: None,
            search_interval_seconds: default_search_interval_seconds(),
            switch_interval_seconds: None,
            max_search_failures_per_day: default_max_search_failures_per_day(),
        }
    }
}

/// Configuration of a single monitored underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Position in the original config file; used for stable log ordering.
    #[serde(default)]
    pub original_index: u32,

    /// The underlying being monitored, e.g. `HSI.HK`.
    pub monitor_symbol: String,

    /// Statically configured seats. Absent symbols are filled by auto-search.
    #[serde(default)]
    pub long_symbol: Option<String>,
    #[serde(default)]
    pub short_symbol: Option<String>,

    #[serde(default)]
    pub auto_search: Option<AutoSearchConfig>,

    /// Symbol -> underlying attribution for startup rehydration of orders
    /// whose warrants are no longer seated.
    #[serde(default)]
    pub order_ownership_mapping: HashMap<String, String>,

    /// Notional to deploy per buy.
    #[serde(default = "default_target_notional")]
    pub target_notional: f64,

    /// Hard cap on notional per seat (order + held position at cost).
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,

    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    #[serde(default = "default_max_unrealized_loss")]
    pub max_unrealized_loss_per_symbol: f64,

    /// Minimum spacing between buy attempts per direction.
    #[serde(default = "default_buy_interval_seconds")]
    pub buy_interval_seconds: u64,

    #[serde(default)]
    pub liquidation_cooldown: LiquidationCooldownConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub signal_config: SignalConfigSet,

    #[serde(default = "default_true")]
    pub smart_close_enabled: bool,
}

// =============================================================================
// Global configuration
// =============================================================================

/// Open-protection windows: suppress signal generation for N minutes after
/// each session open.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OpenProtectionConfig {
    #[serde(default = "default_open_protection_minutes")]
    pub morning_minutes: u32,
    #[serde(default = "default_open_protection_minutes")]
    pub afternoon_minutes: u32,
}

impl Default for OpenProtectionConfig {
    fn default() -> Self {
        Self {
            morning_minutes: default_open_protection_minutes(),
            afternoon_minutes: default_open_protection_minutes(),
        }
    }
}

/// Engine-wide settings shared by all monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Enables close-of-day buy rejection and auto-liquidation.
    #[serde(default = "default_true")]
    pub doomsday_protection: bool,

    #[serde(default)]
    pub open_protection: OpenProtectionConfig,

    #[serde(default = "default_trading_order_type")]
    pub trading_order_type: OrderType,

    #[serde(default = "default_liquidation_order_type")]
    pub liquidation_order_type: OrderType,

    #[serde(default = "default_buy_order_timeout")]
    pub buy_order_timeout_seconds: u64,

    #[serde(default = "default_sell_order_timeout")]
    pub sell_order_timeout_seconds: u64,

    /// How often pending limit orders are re-priced against fresh quotes.
    #[serde(default = "default_price_update_interval")]
    pub order_monitor_price_update_interval_seconds: u64,

    /// Root directory for the trade journal (`<log_root>/trades/...`).
    #[serde(default = "default_log_root")]
    pub log_root: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            doomsday_protection: true,
            open_protection: OpenProtectionConfig::default(),
            trading_order_type: default_trading_order_type(),
            liquidation_order_type: default_liquidation_order_type(),
            buy_order_timeout_seconds: default_buy_order_timeout(),
            sell_order_timeout_seconds: default_sell_order_timeout(),
            order_monitor_price_update_interval_seconds: default_price_update_interval(),
            log_root: default_log_root(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration for the Meridian engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
}

impl AppConfig {
    /// Load and validate configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.validate()?;

        info!(
            path = %path.display(),
            monitors = config.monitors.len(),
            "engine config loaded"
        );

        Ok(config)
    }

    /// Eagerly parse every signal rule and verification indicator list so a
    /// malformed config aborts startup.
    pub fn validate(&self) -> Result<()> {
        for monitor in &self.monitors {
            for (slot, rule) in monitor.signal_config.entries() {
                if let Some(raw) = rule {
                    SignalRule::parse(raw).with_context(|| {
                        format!(
                            "monitor {} has a malformed '{slot}' signal config",
                            monitor.monitor_symbol
                        )
                    })?;
                }
            }
            monitor.verification.buy.parsed_fields().with_context(|| {
                format!(
                    "monitor {} has malformed buy verification indicators",
                    monitor.monitor_symbol
                )
            })?;
            monitor.verification.sell.parsed_fields().with_context(|| {
                format!(
                    "monitor {} has malformed sell verification indicators",
                    monitor.monitor_symbol
                )
            })?;
        }
        Ok(())
    }

    /// Persist the configuration using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
