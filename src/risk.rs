//! Risk Gate - hard limits checked before any order reaches a venue
//!
//! Pure decision logic: no I/O, no clock, no engine state beyond the
//! snapshot passed in. Rejections are expected outcomes, never errors.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::AccountSnapshot;
use crate::types::{Order, Price, Side};

/// Risk configuration limits.
///
/// Immutable at runtime except via `TradingEngine::reload_limits`.
/// Percentages are fractions of account equity (0.25 = 25%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Master switch; false rejects every order
    pub enabled: bool,
    /// Max single-position notional as fraction of equity
    pub max_position_pct: Decimal,
    /// Max total exposure (positions + open orders) as fraction of equity
    pub max_total_exposure_pct: Decimal,
    /// Max concurrent open positions
    pub max_open_positions: usize,
    /// Min order notional, to avoid dust
    pub min_order_notional: Decimal,
    /// Max order notional
    pub max_order_notional: Decimal,
    /// Default stop-loss distance, fraction of entry
    pub default_stop_loss_pct: Decimal,
    /// Default take-profit distance, fraction of entry
    pub default_take_profit_pct: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            max_position_pct: Decimal::from(25) / Decimal::from(100),
            max_total_exposure_pct: Decimal::from(80) / Decimal::from(100),
            max_open_positions: 8,
            min_order_notional: Decimal::from(10),
            max_order_notional: Decimal::from(50_000),
            default_stop_loss_pct: Decimal::from(2) / Decimal::from(100),
            default_take_profit_pct: Decimal::from(5) / Decimal::from(100),
        }
    }
}

impl RiskLimits {
    /// Sanity-check the limits themselves. Violations here are
    /// configuration faults, not business rejections.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_order_notional > self.max_order_notional {
            return Err(format!(
                "min order notional {} exceeds max {}",
                self.min_order_notional, self.max_order_notional
            ));
        }
        // Position/exposure fractions may exceed 1 on leveraged venues;
        // stop distances may not.
        for (name, pct) in [
            ("max_position_pct", self.max_position_pct),
            ("max_total_exposure_pct", self.max_total_exposure_pct),
        ] {
            if pct <= Decimal::ZERO {
                return Err(format!("{} must be positive, got {}", name, pct));
            }
        }
        for (name, pct) in [
            ("default_stop_loss_pct", self.default_stop_loss_pct),
            ("default_take_profit_pct", self.default_take_profit_pct),
        ] {
            if pct < Decimal::ZERO || pct > Decimal::ONE {
                return Err(format!("{} must be within [0, 1], got {}", name, pct));
            }
        }
        if self.max_open_positions == 0 {
            return Err("max_open_positions must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Why an order was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("risk checks disabled; trading halted")]
    Disabled,

    #[error("order notional {notional} below minimum {min}")]
    BelowMinSize { notional: Decimal, min: Decimal },

    #[error("order notional {notional} exceeds maximum {max}")]
    AboveMaxSize { notional: Decimal, max: Decimal },

    #[error("projected position {projected} exceeds per-symbol limit {limit}")]
    PositionTooLarge { projected: Decimal, limit: Decimal },

    #[error("open position count {open} at configured maximum {max}")]
    TooManyPositions { open: usize, max: usize },

    #[error("projected exposure {projected} exceeds limit {limit}")]
    ExposureExceeded { projected: Decimal, limit: Decimal },

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        required: Decimal,
        available: Decimal,
    },
}

/// Outcome of a risk check.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accept,
    Reject(RejectReason),
}

impl RiskDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, RiskDecision::Accept)
    }
}

/// Validate an order against the account snapshot, short-circuiting on the
/// first failed check. `mark` is the reference price for notional math: the
/// limit price for limit orders, the current mark for market orders.
///
/// Checks, in order: enabled flag, order size bounds, per-symbol position
/// limit, concurrent position count, total exposure, available balance.
pub fn validate(
    order: &Order,
    mark: Price,
    snapshot: &AccountSnapshot,
    limits: &RiskLimits,
) -> RiskDecision {
    if !limits.enabled {
        return RiskDecision::Reject(RejectReason::Disabled);
    }

    let notional = order.quantity.as_decimal() * mark.as_decimal();

    if notional < limits.min_order_notional {
        return RiskDecision::Reject(RejectReason::BelowMinSize {
            notional,
            min: limits.min_order_notional,
        });
    }
    if notional > limits.max_order_notional {
        return RiskDecision::Reject(RejectReason::AboveMaxSize {
            notional,
            max: limits.max_order_notional,
        });
    }

    let equity = snapshot.equity();
    let existing = snapshot.position_notional(&order.symbol);

    // Signed projection: buys grow the holding, sells shrink it (and may
    // flip it). |projected| is what the per-symbol limit bounds.
    let signed_existing = match snapshot.position_side(&order.symbol) {
        Some(Side::Sell) => -existing,
        _ => existing,
    };
    let delta = match order.side {
        Side::Buy => notional,
        Side::Sell => -notional,
    };
    let projected_symbol = (signed_existing + delta).abs();

    let position_limit = limits.max_position_pct * equity;
    if projected_symbol > position_limit {
        return RiskDecision::Reject(RejectReason::PositionTooLarge {
            projected: projected_symbol,
            limit: position_limit,
        });
    }

    let open = snapshot.open_position_count();
    let opens_new = !snapshot.has_position(&order.symbol);
    if opens_new && open >= limits.max_open_positions {
        return RiskDecision::Reject(RejectReason::TooManyPositions {
            open,
            max: limits.max_open_positions,
        });
    }

    let projected_exposure = snapshot.total_exposure() - existing + projected_symbol;
    let exposure_limit = limits.max_total_exposure_pct * equity;
    if projected_exposure > exposure_limit {
        return RiskDecision::Reject(RejectReason::ExposureExceeded {
            projected: projected_exposure,
            limit: exposure_limit,
        });
    }

    if order.side == Side::Buy && notional > snapshot.available {
        return RiskDecision::Reject(RejectReason::InsufficientBalance {
            required: notional,
            available: snapshot.available,
        });
    }

    RiskDecision::Accept
}
