//! Core types - Strong typing for safety

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Tradeable symbol (e.g., "BTC/USDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Price with arbitrary precision
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    pub fn new(value: impl Into<Decimal>) -> Self {
        Self(value.into())
    }

    pub fn from_f64(value: f64) -> Self {
        Self(Decimal::try_from(value).unwrap_or(Decimal::ZERO))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn as_f64(&self) -> f64 {
        self.0.to_string().parse().unwrap_or(0.0)
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Quantity/Size
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn new(value: impl Into<Decimal>) -> Self {
        Self(value.into())
    }

    pub fn from_f64(value: f64) -> Self {
        Self(Decimal::try_from(value).unwrap_or(Decimal::ZERO))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == Decimal::ZERO
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order status
///
/// ```text
/// Pending ──► Submitted ──► PartiallyFilled ──► Filled
///    │   │         │               │
///    │   │         └──► Cancelled ◄┘
///    │   ├──► PendingConfirmation ──► Submitted | Filled | Rejected
///    │   └──► Rejected
/// ```
///
/// Filled, Cancelled and Rejected are terminal: no further mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PendingConfirmation,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether `self -> to` is a legal lifecycle transition.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (*self, to),
            (Pending, Submitted)
                | (Pending, PendingConfirmation)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (PendingConfirmation, Submitted)
                | (PendingConfirmation, PartiallyFilled)
                | (PendingConfirmation, Filled)
                | (PendingConfirmation, Rejected)
                | (PendingConfirmation, Cancelled)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Cancelled)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::PendingConfirmation => "pending_confirmation",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Client-generated idempotency token.
///
/// One token = one logical order attempt. Resubmission with the same token
/// must never produce a second venue-side order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientToken(Uuid);

impl ClientToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for ClientToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order - one instruction to a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub client_token: ClientToken,
    pub venue_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
    pub status: OrderStatus,
    /// Human-readable rejection reason, set only in `Rejected` status
    pub reason: Option<String>,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    /// Owning strategy identifier
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new_market(
        symbol: Symbol,
        side: Side,
        quantity: Quantity,
        token: ClientToken,
        strategy: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            client_token: token,
            venue_order_id: None,
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            status: OrderStatus::Pending,
            reason: None,
            filled_quantity: Quantity::ZERO,
            avg_fill_price: None,
            strategy: strategy.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_limit(
        symbol: Symbol,
        side: Side,
        quantity: Quantity,
        price: Price,
        token: ClientToken,
        strategy: impl Into<String>,
    ) -> Self {
        let mut order = Self::new_market(symbol, side, quantity, token, strategy);
        order.order_type = OrderType::Limit;
        order.price = Some(price);
        order
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn remaining_quantity(&self) -> Quantity {
        Quantity::new(self.quantity.as_decimal() - self.filled_quantity.as_decimal())
    }
}

/// Position - net holding in one symbol at one venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Side,
    /// Always positive; a position reduced to zero is removed, never stored
    pub quantity: Quantity,
    /// Volume-weighted average entry
    pub entry_price: Price,
    pub mark_price: Price,
    pub unrealized_pnl: Decimal,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
    pub venue: String,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Notional value at the current mark
    pub fn notional(&self) -> Decimal {
        self.quantity.as_decimal() * self.mark_price.as_decimal()
    }

    /// Refresh the mark price and the derived unrealized PnL
    pub fn refresh_mark(&mut self, mark: Price) {
        self.mark_price = mark;
        let per_unit = match self.side {
            Side::Buy => mark.as_decimal() - self.entry_price.as_decimal(),
            Side::Sell => self.entry_price.as_decimal() - mark.as_decimal(),
        };
        self.unrealized_pnl = per_unit * self.quantity.as_decimal();
    }
}

/// Fill - one broker-reported execution against an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Venue-unique execution id; the deduplication key
    pub fill_id: String,
    pub order_id: Uuid,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Quantity,
    pub price: Price,
    /// 1-based, monotonically increasing per order; used for resequencing
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

/// Account balance as reported by a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Signal action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalAction::Buy => write!(f, "BUY"),
            SignalAction::Sell => write!(f, "SELL"),
            SignalAction::Hold => write!(f, "HOLD"),
        }
    }
}

/// Trade signal - strategy output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub action: SignalAction,
    /// In [0, 1], monotonic with signal strength
    pub confidence: f64,
    pub entry_price: Option<Price>,
    pub stop_loss: Option<Price>,
    pub target_price: Option<Price>,
    pub reason: String,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn hold(symbol: Symbol, strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            symbol,
            action: SignalAction::Hold,
            confidence: 0.0,
            entry_price: None,
            stop_loss: None,
            target_price: None,
            reason: reason.into(),
            strategy: strategy.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One market data sample
#[derive(Debug, Clone, Copy)]
pub struct MarketSample {
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Bounded, time-ordered window of market samples for one symbol.
///
/// `version` increments on every new sample; the indicator cache keys on it
/// so a fresh sample always invalidates memoized values.
#[derive(Debug, Clone)]
pub struct MarketWindow {
    symbol: Symbol,
    samples: VecDeque<MarketSample>,
    capacity: usize,
    version: u64,
}

impl MarketWindow {
    pub fn new(symbol: Symbol, capacity: usize) -> Self {
        Self {
            symbol,
            samples: VecDeque::with_capacity(capacity),
            capacity,
            version: 0,
        }
    }

    pub fn push(&mut self, sample: MarketSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.version += 1;
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.price).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.volume).collect()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.samples.back().map(|s| s.price)
    }

    pub fn last_volume(&self) -> Option<f64> {
        self.samples.back().map(|s| s.volume)
    }

    /// Percent change from first to last sample
    pub fn change_pct(&self) -> Option<f64> {
        let first = self.samples.front()?.price;
        let last = self.samples.back()?.price;
        if first == 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }

    /// Range volatility: (high - low) / low, in percent
    pub fn range_volatility_pct(&self) -> Option<f64> {
        let mut low = f64::MAX;
        let mut high = f64::MIN;
        for s in &self.samples {
            low = low.min(s.price);
            high = high.max(s.price);
        }
        if self.samples.is_empty() || low <= 0.0 {
            return None;
        }
        Some((high - low) / low * 100.0)
    }
}
