// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{AccountMode, TradingMode};

/// Single-writer, many-reader handle for `TradingConfig`, published
/// atomically via pointer/handle swap. A writer replaces the whole value
/// under a short write lock; a reader's `read()` always observes a
/// complete, never-torn `TradingConfig`.
pub type ConfigHandle = Arc<RwLock<TradingConfig>>;

/// Shared pause/resume/kill switch, read by every `HotLoop` on every tick
/// and written only by the dashboard's admin controls (ambient; not part
/// of data model, same discipline as `ConfigHandle`).
pub type TradingModeHandle = Arc<RwLock<TradingMode>>;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTC-USDT-PERP".to_string()]
}

fn default_max_concurrent_positions() -> u32 {
    3
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_drawdown_pct() -> f64 {
    5.0
}

fn default_min_equity() -> f64 {
    100.0
}

fn default_max_position_size() -> f64 {
    0.05
}

fn default_weight_obi() -> f64 {
    0.30
}

fn default_weight_rsi() -> f64 {
    0.25
}

fn default_weight_ema() -> f64 {
    0.25
}

fn default_weight_momentum() -> f64 {
    0.20
}

fn default_weight_funding() -> f64 {
    0.0
}

fn default_signal_threshold() -> f64 {
    0.2
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_cooldown_seconds() -> u64 {
    5
}

fn default_price_window_capacity() -> usize {
    100
}

fn default_decay_window_seconds() -> i64 {
    60
}

fn default_risk_per_trade() -> f64 {
    0.02
}

fn default_agent_interval_seconds() -> u64 {
    12
}

fn default_coordinator_interval_seconds() -> u64 {
    30
}

fn default_coordinator_warmup_seconds() -> u64 {
    10
}

// =============================================================================
// TradingConfig
// =============================================================================

/// Weights per signal channel, execution thresholds, and risk limits.
/// Updated by the `LeadCoordinator` after each advisory cycle (by replacing
/// the value in-place under a short write lock — see `app_state::AppState`
/// for the publish-once discipline); read by the `HotLoop` on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_weight_obi")]
    pub weight_obi: f64,
    #[serde(default = "default_weight_rsi")]
    pub weight_rsi: f64,
    #[serde(default = "default_weight_ema")]
    pub weight_ema: f64,
    #[serde(default = "default_weight_momentum")]
    pub weight_momentum: f64,
    #[serde(default = "default_weight_funding")]
    pub weight_funding: f64,

    /// Minimum `|s'|` to qualify a tick for order dispatch; the
    /// threshold comparison is inclusive (`>=`).
    #[serde(default = "default_signal_threshold")]
    pub signal_threshold: f64,
    /// Minimum effective advisory confidence to qualify a tick (`>=`).
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Minimum wall-time between order dispatches on one `HotLoop`.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Fraction of equity risked per trade, scaled by current price.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_min_equity")]
    pub min_equity: f64,

    #[serde(default = "default_price_window_capacity")]
    pub price_window_capacity: usize,
    #[serde(default = "default_decay_window_seconds")]
    pub decay_window_seconds: i64,

    #[serde(default = "default_agent_interval_seconds")]
    pub agent_interval_seconds: u64,
    #[serde(default = "default_coordinator_interval_seconds")]
    pub coordinator_interval_seconds: u64,
    #[serde(default = "default_coordinator_warmup_seconds")]
    pub coordinator_warmup_seconds: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            weight_obi: default_weight_obi(),
            weight_rsi: default_weight_rsi(),
            weight_ema: default_weight_ema(),
            weight_momentum: default_weight_momentum(),
            weight_funding: default_weight_funding(),
            signal_threshold: default_signal_threshold(),
            min_confidence: default_min_confidence(),
            cooldown_seconds: default_cooldown_seconds(),
            risk_per_trade: default_risk_per_trade(),
            max_position_size: default_max_position_size(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_drawdown_pct: default_max_drawdown_pct(),
            min_equity: default_min_equity(),
            price_window_capacity: default_price_window_capacity(),
            decay_window_seconds: default_decay_window_seconds(),
            agent_interval_seconds: default_agent_interval_seconds(),
            coordinator_interval_seconds: default_coordinator_interval_seconds(),
            coordinator_warmup_seconds: default_coordinator_warmup_seconds(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against real funds or simulated: Demo or Live.
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Symbols the engine is watching and trading.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Maximum number of concurrent open positions.
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    /// Signal weights, thresholds, and risk limits.
    #[serde(default)]
    pub trading: TradingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            trading: TradingConfig::default(),
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
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
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

    /// Load from `path`, falling back to defaults (and logging a warning) if
    /// the file is absent or unreadable. A missing tunables file at startup
    /// is not treated as a fatal configuration error — that category is
    /// reserved for missing credentials or an invalid symbol.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(&path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = %err, "runtime config not found or invalid, using defaults");
                Self::default()
            }
        }
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
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert!((cfg.trading.max_position_size - 0.05).abs() < f64::EPSILON);
        assert!((cfg.trading.signal_threshold - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert!((cfg.trading.min_confidence - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETH-USDT-PERP"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETH-USDT-PERP"]);
        assert!((cfg.trading.weight_obi - 0.30).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_trading_config_fills_remaining_defaults() {
        let json = r#"{ "trading": { "signal_threshold": 0.5 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.trading.signal_threshold - 0.5).abs() < f64::EPSILON);
        assert!((cfg.trading.weight_rsi - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.trading.cooldown_seconds, 5);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("meridian-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["SOL-USDT-PERP".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["SOL-USDT-PERP".to_string()]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
