//! MACD trend-following strategy
//!
//! Trades the histogram (MACD line minus signal line): positive past the
//! gate means bullish crossover pressure, negative means bearish.
//! Magnitudes are normalized by price so the same parameters work across
//! symbols of any scale.

use chrono::Utc;
use serde::Deserialize;

use crate::error::Result;
use crate::indicators::{IndicatorEngine, IndicatorKind, IndicatorValue};
use crate::types::{MarketWindow, Price, Signal, SignalAction};

use super::Strategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MacdParams {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
    /// Histogram gate as a fraction of price (0.0001 = 1 bp)
    pub min_histogram_pct: f64,
    /// Histogram fraction of price at which confidence saturates
    pub confidence_scale_pct: f64,
}

impl Default for MacdParams {
    fn default() -> Self {
        Self {
            fast: 12,
            slow: 26,
            signal: 9,
            min_histogram_pct: 0.0001,
            confidence_scale_pct: 0.001,
        }
    }
}

pub struct MacdStrategy {
    params: MacdParams,
}

impl MacdStrategy {
    pub fn new(params: MacdParams) -> Self {
        Self { params }
    }
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        "macd"
    }

    fn evaluate(&self, window: &MarketWindow, indicators: &IndicatorEngine) -> Result<Signal> {
        let symbol = window.symbol().clone();
        let kind = IndicatorKind::Macd {
            fast: self.params.fast,
            slow: self.params.slow,
            signal: self.params.signal,
        };
        let (Some(IndicatorValue::Macd { histogram, .. }), Some(price)) =
            (indicators.compute(kind, window), window.last_price())
        else {
            return Ok(Signal::hold(symbol, self.name(), "warming up"));
        };
        if price <= 0.0 {
            return Ok(Signal::hold(symbol, self.name(), "no price"));
        }

        let histogram_pct = histogram / price;
        let (action, stop_factor, target_factor) =
            if histogram_pct > self.params.min_histogram_pct {
                (SignalAction::Buy, 0.96, 1.07)
            } else if histogram_pct < -self.params.min_histogram_pct {
                (SignalAction::Sell, 1.04, 0.93)
            } else {
                return Ok(Signal::hold(
                    symbol,
                    self.name(),
                    format!("MACD histogram {:+.6} flat", histogram),
                ));
            };

        let confidence = (histogram_pct.abs() / self.params.confidence_scale_pct).min(0.9);

        Ok(Signal {
            symbol,
            action,
            confidence,
            entry_price: Some(Price::from_f64(price)),
            stop_loss: Some(Price::from_f64(price * stop_factor)),
            target_price: Some(Price::from_f64(price * target_factor)),
            reason: format!("MACD histogram {:+.6} ({:+.2} bps of price)", histogram, histogram_pct * 10_000.0),
            strategy: self.name().to_string(),
            timestamp: Utc::now(),
        })
    }
}
