// =============================================================================
// Runtime Configuration — persisted engine settings with atomic save
// =============================================================================
//
// Holds the operational mode, the auto-start (symbol, timeframe) matrix and
// a per-symbol TradingConfig, matching core spec §4.12. Persistence keeps
// the teacher's atomic tmp + rename pattern and `#[serde(default)]`-per-field
// idiom so adding a field never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::execution::TradingConfig;
use crate::types::{AccountMode, TradingMode};

fn default_auto_start() -> Vec<(String, String)> {
    vec![
        ("BTCUSDT".to_string(), "5m".to_string()),
        ("ETHUSDT".to_string(), "5m".to_string()),
        ("BNBUSDT".to_string(), "5m".to_string()),
        ("XRPUSDT".to_string(), "5m".to_string()),
        ("SOLUSDT".to_string(), "5m".to_string()),
    ]
}

fn default_trading_configs() -> HashMap<String, TradingConfig> {
    default_auto_start()
        .into_iter()
        .map(|(symbol, timeframe)| {
            let cfg = TradingConfig::new(&symbol, &timeframe);
            (symbol, cfg)
        })
        .collect()
}

/// Top-level runtime configuration for the engine.
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

    /// (symbol, timeframe) pairs the orchestrator auto-starts on boot.
    #[serde(default = "default_auto_start")]
    pub auto_start: Vec<(String, String)>,

    /// Per-symbol trading parameters, keyed by symbol.
    #[serde(default = "default_trading_configs")]
    pub trading_configs: HashMap<String, TradingConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            auto_start: default_auto_start(),
            trading_configs: default_trading_configs(),
        }
    }
}

impl RuntimeConfig {
    /// Return the TradingConfig for `symbol`/`timeframe`, falling back to
    /// freshly-constructed defaults if the symbol isn't configured.
    pub fn trading_config_for(&self, symbol: &str, timeframe: &str) -> TradingConfig {
        self.trading_configs
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| TradingConfig::new(symbol, timeframe))
    }

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
            auto_start = ?config.auto_start,
            trading_mode = %config.trading_mode,
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.auto_start.len(), 5);
        assert_eq!(cfg.auto_start[0], ("BTCUSDT".to_string(), "5m".to_string()));
        assert_eq!(cfg.trading_configs.len(), 5);
        assert!(cfg.trading_configs.contains_key("BTCUSDT"));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.auto_start.len(), 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "auto_start": [["ETHUSDT", "1m"]] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.auto_start, vec![("ETHUSDT".to_string(), "1m".to_string())]);
        assert_eq!(cfg.trading_configs.len(), 5);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.auto_start, cfg2.auto_start);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.trading_configs.len(), cfg2.trading_configs.len());
    }

    #[test]
    fn trading_config_for_falls_back_to_defaults_for_unknown_symbol() {
        let cfg = RuntimeConfig::default();
        let tc = cfg.trading_config_for("DOGEUSDT", "5m");
        assert_eq!(tc.symbol, "DOGEUSDT");
        assert_eq!(tc.timeframe, "5m");
    }

    #[test]
    fn enum_mode_assignment_compatible() {
        let mut cfg = RuntimeConfig::default();
        cfg.trading_mode = TradingMode::Paused;
        cfg.account_mode = AccountMode::Demo;
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
    }
}
