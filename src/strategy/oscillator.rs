//! RSI threshold strategy
//!
//! Buys oversold, sells overbought. Confidence grows linearly with the
//! distance past the threshold: (oversold - rsi) / oversold on the buy
//! side, (rsi - overbought) / (100 - overbought) on the sell side, capped
//! at `max_confidence`.

use chrono::Utc;
use serde::Deserialize;

use crate::error::Result;
use crate::indicators::{IndicatorEngine, IndicatorKind};
use crate::types::{MarketWindow, Price, Signal, SignalAction};

use super::Strategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RsiParams {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
    pub max_confidence: f64,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
            max_confidence: 0.9,
        }
    }
}

pub struct RsiStrategy {
    params: RsiParams,
}

impl RsiStrategy {
    pub fn new(params: RsiParams) -> Self {
        Self { params }
    }

    fn classify(&self, rsi: f64) -> (SignalAction, f64) {
        if rsi < self.params.oversold {
            let confidence =
                ((self.params.oversold - rsi) / self.params.oversold).min(self.params.max_confidence);
            (SignalAction::Buy, confidence)
        } else if rsi > self.params.overbought {
            let confidence = ((rsi - self.params.overbought) / (100.0 - self.params.overbought))
                .min(self.params.max_confidence);
            (SignalAction::Sell, confidence)
        } else {
            (SignalAction::Hold, 0.0)
        }
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "rsi"
    }

    fn evaluate(&self, window: &MarketWindow, indicators: &IndicatorEngine) -> Result<Signal> {
        let symbol = window.symbol().clone();
        let rsi = indicators
            .compute(IndicatorKind::Rsi(self.params.period), window)
            .and_then(|v| v.as_simple());
        let (Some(rsi), Some(price)) = (rsi, window.last_price()) else {
            return Ok(Signal::hold(symbol, self.name(), "warming up"));
        };

        let (action, confidence) = self.classify(rsi);
        let (stop_factor, target_factor, label) = match action {
            SignalAction::Buy => (0.97, 1.06, "oversold"),
            SignalAction::Sell => (1.03, 0.94, "overbought"),
            SignalAction::Hold => {
                return Ok(Signal::hold(
                    symbol,
                    self.name(),
                    format!("RSI {:.1} neutral", rsi),
                ));
            }
        };

        Ok(Signal {
            symbol,
            action,
            confidence,
            entry_price: Some(Price::from_f64(price)),
            stop_loss: Some(Price::from_f64(price * stop_factor)),
            target_price: Some(Price::from_f64(price * target_factor)),
            reason: format!("RSI {:.1} {}", rsi, label),
            strategy: self.name().to_string(),
            timestamp: Utc::now(),
        })
    }
}
