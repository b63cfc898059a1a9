//! Indicator engine - memoized derived signals over market windows
//!
//! The same indicator is typically requested by several strategies within
//! one evaluation cycle, so computed values are cached per
//! (symbol, kind, window version) with a short TTL. A new market sample
//! bumps the window version and `invalidate` drops the symbol's entries,
//! so a cached value can never outlive the data it was computed from.

pub mod math;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::{MarketWindow, Symbol};

/// Indicator identity + parameters; doubles as the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
    },
    /// `mult_x100` keeps the band multiplier hashable (200 = 2.0 sigma)
    Bollinger {
        period: usize,
        mult_x100: u32,
    },
    Vwap,
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorKind::Sma(period) => write!(f, "SMA({})", period),
            IndicatorKind::Ema(period) => write!(f, "EMA({})", period),
            IndicatorKind::Rsi(period) => write!(f, "RSI({})", period),
            IndicatorKind::Macd { fast, slow, signal } => {
                write!(f, "MACD({},{},{})", fast, slow, signal)
            }
            IndicatorKind::Bollinger { period, mult_x100 } => {
                write!(f, "BOLLINGER({},{})", period, *mult_x100 as f64 / 100.0)
            }
            IndicatorKind::Vwap => write!(f, "VWAP"),
        }
    }
}

/// Indicator output shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Simple(f64),
    Macd {
        line: f64,
        signal: f64,
        histogram: f64,
    },
    Bands {
        upper: f64,
        middle: f64,
        lower: f64,
    },
}

impl IndicatorValue {
    pub fn as_simple(&self) -> Option<f64> {
        match self {
            IndicatorValue::Simple(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: Symbol,
    kind: IndicatorKind,
}

struct CachedValue {
    value: IndicatorValue,
    version: u64,
    computed_at: Instant,
}

/// Memoizing indicator engine.
pub struct IndicatorEngine {
    cache: RwLock<HashMap<CacheKey, CachedValue>>,
    ttl: Duration,
    computations: AtomicU64,
}

impl IndicatorEngine {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
            computations: AtomicU64::new(0),
        }
    }

    /// Compute (or serve from cache) one indicator over the window.
    /// `None` during warmup.
    pub fn compute(&self, kind: IndicatorKind, window: &MarketWindow) -> Option<IndicatorValue> {
        let key = CacheKey {
            symbol: window.symbol().clone(),
            kind,
        };
        {
            let cache = self.cache.read();
            if let Some(cached) = cache.get(&key) {
                if cached.version == window.version() && cached.computed_at.elapsed() <= self.ttl {
                    return Some(cached.value);
                }
            }
        }

        self.computations.fetch_add(1, Ordering::Relaxed);
        let prices = window.prices();
        let value = match kind {
            IndicatorKind::Sma(period) => math::sma(&prices, period).map(IndicatorValue::Simple),
            IndicatorKind::Ema(period) => math::ema(&prices, period).map(IndicatorValue::Simple),
            IndicatorKind::Rsi(period) => math::rsi(&prices, period).map(IndicatorValue::Simple),
            IndicatorKind::Macd { fast, slow, signal } => math::macd(&prices, fast, slow, signal)
                .map(|(line, signal, histogram)| IndicatorValue::Macd {
                    line,
                    signal,
                    histogram,
                }),
            IndicatorKind::Bollinger { period, mult_x100 } => {
                math::bollinger(&prices, period, mult_x100 as f64 / 100.0).map(
                    |(upper, middle, lower)| IndicatorValue::Bands {
                        upper,
                        middle,
                        lower,
                    },
                )
            }
            IndicatorKind::Vwap => math::vwap(&prices, &window.volumes()).map(IndicatorValue::Simple),
        }?;

        self.cache.write().insert(
            key,
            CachedValue {
                value,
                version: window.version(),
                computed_at: Instant::now(),
            },
        );
        Some(value)
    }

    /// Drop every cached value for a symbol. Called on arrival of a new
    /// market sample, ahead of TTL expiry.
    pub fn invalidate(&self, symbol: &Symbol) {
        self.cache.write().retain(|key, _| key.symbol != *symbol);
    }

    /// Number of actual computations performed (cache misses).
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        // One evaluation cycle is well under a second
        Self::new(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketSample;
    use chrono::Utc;

    fn window_with(prices: &[f64]) -> MarketWindow {
        let mut window = MarketWindow::new(Symbol::new("BTC/USDT"), 256);
        for &price in prices {
            window.push(MarketSample {
                price,
                volume: 1_000.0,
                timestamp: Utc::now(),
            });
        }
        window
    }

    #[test]
    fn test_recompute_is_memoized() {
        let engine = IndicatorEngine::new(Duration::from_secs(60));
        let window = window_with(&(0..30).map(|i| 100.0 + i as f64).collect::<Vec<_>>());

        let first = engine.compute(IndicatorKind::Rsi(14), &window).unwrap();
        assert_eq!(engine.computations(), 1);

        let second = engine.compute(IndicatorKind::Rsi(14), &window).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.computations(), 1, "second call must hit the cache");
    }

    #[test]
    fn test_new_sample_invalidates_before_ttl() {
        let engine = IndicatorEngine::new(Duration::from_secs(60));
        let mut window = window_with(&(0..30).map(|i| 100.0 + i as f64).collect::<Vec<_>>());

        engine.compute(IndicatorKind::Sma(10), &window).unwrap();
        assert_eq!(engine.computations(), 1);

        window.push(MarketSample {
            price: 250.0,
            volume: 1_000.0,
            timestamp: Utc::now(),
        });
        engine.invalidate(window.symbol());

        let fresh = engine.compute(IndicatorKind::Sma(10), &window).unwrap();
        assert_eq!(engine.computations(), 2, "new sample must force recompute");
        let expected = engine.compute(IndicatorKind::Sma(10), &window).unwrap();
        assert_eq!(fresh, expected);
    }

    #[test]
    fn test_warmup_returns_none() {
        let engine = IndicatorEngine::default();
        let window = window_with(&[100.0, 101.0]);
        assert!(engine.compute(IndicatorKind::Rsi(14), &window).is_none());
        assert!(engine
            .compute(
                IndicatorKind::Macd {
                    fast: 12,
                    slow: 26,
                    signal: 9
                },
                &window
            )
            .is_none());
    }

    #[test]
    fn test_distinct_params_cached_separately() {
        let engine = IndicatorEngine::new(Duration::from_secs(60));
        let window = window_with(&(0..40).map(|i| 100.0 + i as f64).collect::<Vec<_>>());

        engine.compute(IndicatorKind::Sma(5), &window).unwrap();
        engine.compute(IndicatorKind::Sma(20), &window).unwrap();
        assert_eq!(engine.computations(), 2);
        engine.compute(IndicatorKind::Sma(5), &window).unwrap();
        assert_eq!(engine.computations(), 2);
    }
}
