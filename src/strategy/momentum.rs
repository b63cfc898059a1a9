//! Momentum strategy
//!
//! Buys sustained upward moves, sells sustained downward moves, and stands
//! aside when the window is too choppy (range volatility above threshold).

use chrono::Utc;
use serde::Deserialize;

use crate::error::Result;
use crate::indicators::IndicatorEngine;
use crate::types::{MarketWindow, Price, Signal, SignalAction};

use super::Strategy;

/// Momentum parameters. Thresholds are percentages (2.0 = 2%).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MomentumParams {
    pub buy_threshold_pct: f64,
    pub sell_threshold_pct: f64,
    /// Stand aside when the window range exceeds this
    pub volatility_threshold_pct: f64,
    /// Below this volume, confidence is damped
    pub min_volume: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            buy_threshold_pct: 2.0,
            sell_threshold_pct: -2.0,
            volatility_threshold_pct: 15.0,
            min_volume: 100_000.0,
        }
    }
}

pub struct MomentumStrategy {
    params: MomentumParams,
}

impl MomentumStrategy {
    pub fn new(params: MomentumParams) -> Self {
        Self { params }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn evaluate(&self, window: &MarketWindow, _indicators: &IndicatorEngine) -> Result<Signal> {
        let symbol = window.symbol().clone();
        let (Some(change), Some(volatility), Some(price)) = (
            window.change_pct(),
            window.range_volatility_pct(),
            window.last_price(),
        ) else {
            return Ok(Signal::hold(symbol, self.name(), "warming up"));
        };
        let volume = window.last_volume().unwrap_or(0.0);

        let calm = volatility < self.params.volatility_threshold_pct;
        let (action, stop_factor, target_factor) = if change > self.params.buy_threshold_pct && calm
        {
            (SignalAction::Buy, 0.98, 1.05)
        } else if change < self.params.sell_threshold_pct && calm {
            (SignalAction::Sell, 1.02, 0.95)
        } else {
            return Ok(Signal::hold(
                symbol,
                self.name(),
                format!(
                    "momentum: {:+.2}% change, {:.2}% range volatility",
                    change, volatility
                ),
            ));
        };

        // Normalized so a 5% move saturates near full confidence
        let mut confidence = (change.abs() / 5.0).min(0.95);
        if volume < self.params.min_volume {
            confidence *= 0.7;
        }

        Ok(Signal {
            symbol,
            action,
            confidence,
            entry_price: Some(Price::from_f64(price)),
            stop_loss: Some(Price::from_f64(price * stop_factor)),
            target_price: Some(Price::from_f64(price * target_factor)),
            reason: format!(
                "momentum: {:+.2}% change, {:.2}% range volatility",
                change, volatility
            ),
            strategy: self.name().to_string(),
            timestamp: Utc::now(),
        })
    }
}
