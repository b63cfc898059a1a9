//! Strategy framework - signal generation over market windows
//!
//! Strategies are pure with respect to engine state: they read a market
//! window and the indicator engine and return a [`Signal`]. They never
//! size orders (the engine scales size from confidence) and never touch
//! account state. Parameters are explicit serde-backed structs, resolved
//! through a tag registry at configuration-load time.

pub mod momentum;
pub mod oscillator;
pub mod trend;
pub mod volume;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::config::StrategySettings;
use crate::error::{Error, Result};
use crate::indicators::IndicatorEngine;
use crate::types::{MarketWindow, Signal};

pub use momentum::{MomentumParams, MomentumStrategy};
pub use oscillator::{RsiParams, RsiStrategy};
pub use trend::{MacdParams, MacdStrategy};
pub use volume::{VwapParams, VwapStrategy};

/// Base strategy trait
pub trait Strategy: Send + Sync {
    /// Strategy name; used as the owning-strategy id on orders
    fn name(&self) -> &str;

    /// Produce a signal from the window and indicator values.
    /// Hold is a valid answer; warmup must return Hold, not an error.
    fn evaluate(&self, window: &MarketWindow, indicators: &IndicatorEngine) -> Result<Signal>;
}

/// Supported strategy variants - the discriminated tag the registry keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Momentum,
    Rsi,
    Macd,
    Vwap,
}

type StrategyCtor = fn(&toml::Value) -> Result<Box<dyn Strategy>>;

/// Registry mapping strategy tags to constructors; resolved once at
/// configuration-load time, no string dispatch afterwards.
pub struct StrategyRegistry {
    ctors: HashMap<StrategyKind, StrategyCtor>,
}

fn params_from<T: serde::de::DeserializeOwned>(value: &toml::Value) -> Result<T> {
    value
        .clone()
        .try_into()
        .map_err(|e| Error::Config(format!("bad strategy parameters: {}", e)))
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(StrategyKind::Momentum, |params| {
            Ok(Box::new(MomentumStrategy::new(params_from(params)?)))
        });
        registry.register(StrategyKind::Rsi, |params| {
            Ok(Box::new(RsiStrategy::new(params_from(params)?)))
        });
        registry.register(StrategyKind::Macd, |params| {
            Ok(Box::new(MacdStrategy::new(params_from(params)?)))
        });
        registry.register(StrategyKind::Vwap, |params| {
            Ok(Box::new(VwapStrategy::new(params_from(params)?)))
        });
        registry
    }

    pub fn register(&mut self, kind: StrategyKind, ctor: StrategyCtor) {
        self.ctors.insert(kind, ctor);
    }

    pub fn build(&self, settings: &StrategySettings) -> Result<Box<dyn Strategy>> {
        let ctor = self.ctors.get(&settings.kind).ok_or_else(|| {
            Error::Config(format!("no strategy registered for {:?}", settings.kind))
        })?;
        ctor(&settings.params)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Bounded in-memory history of emitted signals, for diagnostics only.
/// Not authoritative state; the engine never reads it back.
pub struct SignalLog {
    entries: RwLock<VecDeque<Signal>>,
    capacity: usize,
}

impl SignalLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, signal: Signal) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(signal);
    }

    pub fn recent(&self, n: usize) -> Vec<Signal> {
        let entries = self.entries.read();
        entries.iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
