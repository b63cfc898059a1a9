//! Configuration - Type-safe, validated config
//!
//! Loaded once at startup as an immutable snapshot; the engine never
//! watches files or the environment itself. Risk limits can be swapped at
//! runtime only through `TradingEngine::reload_limits`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::broker::BrokerKind;
use crate::error::{Error, Result};
use crate::risk::RiskLimits;
use crate::strategy::StrategyKind;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,

    /// Venue selection
    pub broker: BrokerSettings,

    /// Trading loop settings
    pub trading: TradingConfig,

    /// Risk limits
    pub risk: RiskLimits,

    /// Enabled strategies
    pub strategies: Vec<StrategySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run mode: paper or live
    pub mode: RunMode,

    /// Log level filter (tracing EnvFilter syntax)
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Venue variant tag, resolved through the broker registry
    pub kind: BrokerKind,

    /// Venue name used for credential lookup
    pub venue: String,

    /// Use testnet endpoints
    pub testnet: bool,

    /// Leverage applied to every traded symbol at startup
    pub default_leverage: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Trading symbols
    pub symbols: Vec<String>,

    /// Order size as fraction of equity, scaled by signal confidence
    pub order_fraction: f64,

    /// Minimum confidence before a signal is submitted
    pub min_confidence: f64,

    /// Deadline for every broker call, milliseconds
    pub broker_timeout_ms: u64,

    /// Evaluation loop period, milliseconds
    pub evaluation_interval_ms: u64,

    /// Reconciliation loop period, milliseconds
    pub reconcile_interval_ms: u64,

    /// Market window capacity, samples
    pub window_capacity: usize,
}

/// One strategy instance: its variant tag plus variant-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySettings {
    pub kind: StrategyKind,

    /// Strategy-specific parameters
    #[serde(flatten)]
    pub params: toml::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                mode: RunMode::Paper,
                log_level: "info".to_string(),
            },
            broker: BrokerSettings {
                kind: BrokerKind::Paper,
                venue: "paper".to_string(),
                testnet: true,
                default_leverage: None,
            },
            trading: TradingConfig {
                symbols: vec!["BTC/USDT".to_string()],
                order_fraction: 0.1,
                min_confidence: 0.3,
                broker_timeout_ms: 5_000,
                evaluation_interval_ms: 1_000,
                reconcile_interval_ms: 10_000,
                window_capacity: 200,
            },
            risk: RiskLimits::default(),
            strategies: vec![],
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fatal-at-startup validation
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbols.is_empty() {
            return Err(Error::Config("no trading symbols configured".to_string()));
        }
        if !(0.0..=1.0).contains(&self.trading.order_fraction) || self.trading.order_fraction == 0.0
        {
            return Err(Error::Config(format!(
                "order_fraction must be in (0, 1], got {}",
                self.trading.order_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.trading.min_confidence) {
            return Err(Error::Config(format!(
                "min_confidence must be in [0, 1], got {}",
                self.trading.min_confidence
            )));
        }
        if self.trading.broker_timeout_ms == 0 {
            return Err(Error::Config("broker_timeout_ms must be positive".to_string()));
        }
        if self.trading.window_capacity < 2 {
            return Err(Error::Config(
                "window_capacity must be at least 2".to_string(),
            ));
        }
        self.risk.validate().map_err(Error::Config)?;
        Ok(())
    }
}
