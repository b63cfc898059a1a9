//! VWAP deviation strategy
//!
//! Mean-reversion around the volume-weighted average price: buy when price
//! trades meaningfully below VWAP, sell when meaningfully above.

use chrono::Utc;
use serde::Deserialize;

use crate::error::Result;
use crate::indicators::{IndicatorEngine, IndicatorKind};
use crate::types::{MarketWindow, Price, Signal, SignalAction};

use super::Strategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VwapParams {
    /// Minimum deviation from VWAP before acting, percent
    pub min_deviation_pct: f64,
    /// Below this volume, confidence is damped
    pub min_volume: f64,
}

impl Default for VwapParams {
    fn default() -> Self {
        Self {
            min_deviation_pct: 1.0,
            min_volume: 50_000.0,
        }
    }
}

pub struct VwapStrategy {
    params: VwapParams,
}

impl VwapStrategy {
    pub fn new(params: VwapParams) -> Self {
        Self { params }
    }
}

impl Strategy for VwapStrategy {
    fn name(&self) -> &str {
        "vwap"
    }

    fn evaluate(&self, window: &MarketWindow, indicators: &IndicatorEngine) -> Result<Signal> {
        let symbol = window.symbol().clone();
        let vwap = indicators
            .compute(IndicatorKind::Vwap, window)
            .and_then(|v| v.as_simple());
        let (Some(vwap), Some(price)) = (vwap, window.last_price()) else {
            return Ok(Signal::hold(symbol, self.name(), "warming up"));
        };
        if vwap <= 0.0 {
            return Ok(Signal::hold(symbol, self.name(), "no volume"));
        }

        let deviation_pct = (price - vwap) / vwap * 100.0;
        let volume = window.last_volume().unwrap_or(0.0);

        let (action, stop_factor, target_factor) =
            if deviation_pct < -self.params.min_deviation_pct {
                (SignalAction::Buy, 0.99, 1.03)
            } else if deviation_pct > self.params.min_deviation_pct {
                (SignalAction::Sell, 1.01, 0.97)
            } else {
                return Ok(Signal::hold(
                    symbol,
                    self.name(),
                    format!("price within {:.2}% of VWAP", deviation_pct.abs()),
                ));
            };

        // A 3% stretch from VWAP saturates confidence
        let mut confidence = (deviation_pct.abs() / 3.0).min(0.9);
        if volume < self.params.min_volume {
            confidence *= 0.6;
        }

        Ok(Signal {
            symbol,
            action,
            confidence,
            entry_price: Some(Price::from_f64(price)),
            stop_loss: Some(Price::from_f64(vwap * stop_factor)),
            target_price: Some(Price::from_f64(vwap * target_factor)),
            reason: format!(
                "price {:.2} vs VWAP {:.2} ({:+.2}%)",
                price, vwap, deviation_pct
            ),
            strategy: self.name().to_string(),
            timestamp: Utc::now(),
        })
    }
}
