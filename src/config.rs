// =============================================================================
// Runtime configuration — hot-reloadable strategy/bot/hedge settings with
// atomic save.
// =============================================================================
//
// Central configuration hub for the agent. Every tunable parameter lives here
// so that the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default = "...")]` so that adding new
// fields never breaks loading an older config file.
//
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ApprovalMode, Instrument, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_mean_reversion_threshold() -> f64 {
    -2.0
}

fn default_crash_day_threshold() -> f64 {
    -1.5
}

fn default_crash_day_cutoff_time() -> String {
    "15:30".to_string()
}

fn default_pump_day_threshold() -> f64 {
    1.5
}

fn default_pump_day_cutoff_time() -> String {
    "15:30".to_string()
}

fn default_slippage_pct() -> f64 {
    0.02
}

fn default_reversal_threshold() -> f64 {
    -2.0
}

fn default_watch_pct() -> f64 {
    -1.0
}

fn default_high_alert_pct() -> f64 {
    -2.0
}

fn default_critical_pct() -> f64 {
    -3.0
}

fn default_max_position_pct() -> f64 {
    100.0
}

fn default_approval_timeout_minutes() -> u64 {
    10
}

fn default_paper_capital() -> f64 {
    10_000.0
}

fn default_hedge_tiers() -> Vec<HedgeTierConfig> {
    vec![
        HedgeTierConfig { gain_threshold_pct: 2.5, hedge_size_pct: 15.0 },
        HedgeTierConfig { gain_threshold_pct: 4.0, hedge_size_pct: 15.0 },
        HedgeTierConfig { gain_threshold_pct: 5.5, hedge_size_pct: 10.0 },
    ]
}

fn default_max_hedge_pct() -> f64 {
    40.0
}

fn default_min_gain_dollars() -> f64 {
    20.0
}

fn default_hedge_check_interval_seconds() -> u64 {
    300
}

fn default_instrument_map() -> HashMap<Instrument, String> {
    let mut m = HashMap::new();
    m.insert(Instrument::L1, "IBIT".to_string());
    m.insert(Instrument::L2, "BITU".to_string());
    m.insert(Instrument::S2, "SBIT".to_string());
    m
}

fn default_reference_underlying() -> String {
    "BTC-USD".to_string()
}

// =============================================================================
// StrategyConfig
// =============================================================================

/// Tunable parameters for the signal engine's decision procedure
/// (SPEC_FULL.md §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_true")]
    pub mean_reversion_enabled: bool,
    #[serde(default = "default_mean_reversion_threshold")]
    pub mean_reversion_threshold: f64,

    #[serde(default = "default_true")]
    pub short_thursday_enabled: bool,

    #[serde(default = "default_true")]
    pub crash_day_enabled: bool,
    #[serde(default = "default_crash_day_threshold")]
    pub crash_day_threshold: f64,
    #[serde(default = "default_crash_day_cutoff_time")]
    pub crash_day_cutoff_time: String,

    #[serde(default = "default_true")]
    pub pump_day_enabled: bool,
    #[serde(default = "default_pump_day_threshold")]
    pub pump_day_threshold: f64,
    #[serde(default = "default_pump_day_cutoff_time")]
    pub pump_day_cutoff_time: String,

    #[serde(default = "default_true")]
    pub ten_am_dump_enabled: bool,

    #[serde(default = "default_slippage_pct")]
    pub slippage_pct: f64,

    /// Feature-level gate for the reversal subsystem; the per-day one-shot
    /// latch lives on the executor's daily state, not here (SPEC_FULL.md §9
    /// open-question resolution).
    #[serde(default = "default_true")]
    pub reversal_enabled: bool,
    #[serde(default = "default_reversal_threshold")]
    pub reversal_threshold: f64,

    /// Weekend-gap alert thresholds (diagnostic only, SPEC_FULL.md §3).
    #[serde(default = "default_watch_pct")]
    pub weekend_gap_watch_pct: f64,
    #[serde(default = "default_high_alert_pct")]
    pub weekend_gap_high_alert_pct: f64,
    #[serde(default = "default_critical_pct")]
    pub weekend_gap_critical_pct: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            mean_reversion_enabled: true,
            mean_reversion_threshold: default_mean_reversion_threshold(),
            short_thursday_enabled: true,
            crash_day_enabled: true,
            crash_day_threshold: default_crash_day_threshold(),
            crash_day_cutoff_time: default_crash_day_cutoff_time(),
            pump_day_enabled: true,
            pump_day_threshold: default_pump_day_threshold(),
            pump_day_cutoff_time: default_pump_day_cutoff_time(),
            ten_am_dump_enabled: true,
            slippage_pct: default_slippage_pct(),
            reversal_enabled: true,
            reversal_threshold: default_reversal_threshold(),
            weekend_gap_watch_pct: default_watch_pct(),
            weekend_gap_high_alert_pct: default_high_alert_pct(),
            weekend_gap_critical_pct: default_critical_pct(),
        }
    }
}

// =============================================================================
// HedgeTierConfig / HedgeConfig
// =============================================================================

/// One rung of the trailing-hedge ladder (SPEC_FULL.md §4.4). Configuration
/// only — the live `triggered`/`triggered_at` state lives on
/// [`crate::hedge::HedgeTier`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HedgeTierConfig {
    pub gain_threshold_pct: f64,
    pub hedge_size_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hedge_tiers")]
    pub tiers: Vec<HedgeTierConfig>,
    #[serde(default = "default_max_hedge_pct")]
    pub max_hedge_pct: f64,
    #[serde(default = "default_min_gain_dollars")]
    pub min_gain_dollars: f64,
    #[serde(default = "default_hedge_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tiers: default_hedge_tiers(),
            max_hedge_pct: default_max_hedge_pct(),
            min_gain_dollars: default_min_gain_dollars(),
            check_interval_seconds: default_hedge_check_interval_seconds(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Operational settings for the executor (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub mode: TradingMode,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    #[serde(default)]
    pub max_position_usd: Option<f64>,
    #[serde(default)]
    pub account_handle: String,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default = "default_approval_timeout_minutes")]
    pub approval_timeout_minutes: u64,
    #[serde(default = "default_paper_capital")]
    pub paper_starting_capital: f64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: TradingMode::default(),
            max_position_pct: default_max_position_pct(),
            max_position_usd: None,
            account_handle: String::new(),
            approval_mode: ApprovalMode::default(),
            approval_timeout_minutes: default_approval_timeout_minutes(),
            paper_starting_capital: default_paper_capital(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the agent.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub hedge: HedgeConfig,

    /// `Instrument` → broker ticker symbol.
    #[serde(default = "default_instrument_map")]
    pub instruments: HashMap<Instrument, String>,
    /// Reference underlying spot symbol, used only for weekend-gap context.
    #[serde(default = "default_reference_underlying")]
    pub reference_underlying: String,

    /// Scheduler-level pause flag (SPEC_FULL.md §4.2); distinct from
    /// `bot.mode`.
    #[serde(default)]
    pub scheduler_paused: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            bot: BotConfig::default(),
            hedge: HedgeConfig::default(),
            instruments: default_instrument_map(),
            reference_underlying: default_reference_underlying(),
            scheduler_paused: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.bot.mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn symbol_for(&self, instrument: Instrument) -> &str {
        self.instruments
            .get(&instrument)
            .map(|s| s.as_str())
            .unwrap_or("")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.bot.mode, TradingMode::Paper);
        assert_eq!(cfg.strategy.crash_day_cutoff_time, "15:30");
        assert_eq!(cfg.strategy.pump_day_cutoff_time, "15:30");
        assert!((cfg.strategy.crash_day_threshold - (-1.5)).abs() < f64::EPSILON);
        assert!((cfg.strategy.mean_reversion_threshold - (-2.0)).abs() < f64::EPSILON);
        assert_eq!(cfg.hedge.tiers.len(), 3);
        assert!((cfg.hedge.max_hedge_pct - 40.0).abs() < f64::EPSILON);
        assert!((cfg.hedge.min_gain_dollars - 20.0).abs() < f64::EPSILON);
        assert_eq!(cfg.symbol_for(Instrument::L1), "IBIT");
        assert_eq!(cfg.symbol_for(Instrument::L2), "BITU");
        assert_eq!(cfg.symbol_for(Instrument::S2), "SBIT");
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bot.mode, TradingMode::Paper);
        assert!(cfg.strategy.crash_day_enabled);
        assert!(cfg.hedge.enabled);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "bot": { "mode": "Live" } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bot.mode, TradingMode::Live);
        assert_eq!(cfg.bot.approval_timeout_minutes, 10);
        assert_eq!(cfg.hedge.tiers.len(), 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bot.mode, cfg2.bot.mode);
        assert_eq!(cfg.hedge.tiers.len(), cfg2.hedge.tiers.len());
        assert_eq!(cfg.instruments.len(), cfg2.instruments.len());
    }

    #[test]
    fn crash_and_pump_cutoff_default_to_newer_convention() {
        // Open-question resolution (SPEC_FULL.md §9): 15:30, not 12:00.
        let cfg = StrategyConfig::default();
        assert_eq!(cfg.crash_day_cutoff_time, "15:30");
        assert_eq!(cfg.pump_day_cutoff_time, "15:30");
    }
}
