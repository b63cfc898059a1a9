//! Universal venue adapter - the core abstraction
//!
//! Every supported venue implements the same capability set and translates
//! its native responses into the core's Order/Position vocabulary, and its
//! native failures into the shared [`BrokerError`] taxonomy. Adapters never
//! retry internally beyond distinguishing "definitely not sent" from
//! "maybe sent" - the engine's idempotency tokens make retries safe.

pub mod bybit;
pub mod credentials;
pub mod paper;
pub mod signer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::BrokerSettings;
use crate::error::{BrokerError, Error, Result};
use crate::types::{
    Balance, ClientToken, Fill, OrderStatus, OrderType, Position, Price, Quantity, Side, Symbol,
};

pub use bybit::BybitBroker;
pub use credentials::{CredentialSource, Credentials, EnvCredentials};
pub use paper::{PaperBroker, PaperConfig};
pub use signer::HmacSigner;

/// Order submission request, already carrying the idempotency token.
///
/// `order_id` is the engine-side id; adapters stamp it onto the fills they
/// emit so the engine can route executions without a reverse lookup.
#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub order_id: uuid::Uuid,
    pub client_token: ClientToken,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
}

/// Venue acknowledgement of a submission.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub status: OrderStatus,
}

/// Venue-side order state, used by reconciliation.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub venue_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
}

/// Universal venue adapter trait.
///
/// All operations are async; the engine wraps each call in a deadline
/// (`tokio::time::timeout`), so implementations must be cancel-safe.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Venue name (e.g. "paper", "bybit")
    fn name(&self) -> &str;

    /// Establish connectivity / verify credentials
    async fn connect(&self) -> std::result::Result<(), BrokerError>;

    /// Account balance
    async fn balance(&self) -> std::result::Result<Balance, BrokerError>;

    /// Current venue-side positions
    async fn positions(&self) -> std::result::Result<Vec<Position>, BrokerError>;

    /// Submit an order. Must surface ambiguity rather than swallow it:
    /// a response lost after send is `BrokerError::Ambiguous`, never `Ok`.
    async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> std::result::Result<OrderAck, BrokerError>;

    /// Cancel a previously acknowledged order
    async fn cancel_order(&self, venue_order_id: &str) -> std::result::Result<(), BrokerError>;

    /// Venue-side status by idempotency token - the reconciliation hook
    async fn order_status(
        &self,
        token: &ClientToken,
    ) -> std::result::Result<StatusReport, BrokerError>;

    /// Current price for a symbol
    async fn current_price(&self, symbol: &Symbol) -> std::result::Result<Price, BrokerError>;

    /// Set leverage (venues without leverage return `Unsupported`)
    async fn set_leverage(
        &self,
        symbol: &Symbol,
        leverage: u32,
    ) -> std::result::Result<(), BrokerError>;

    /// Fill stream for this venue. Consumed by exactly one engine loop so
    /// per-order delivery order is preserved.
    fn fills(&self) -> flume::Receiver<Fill>;
}

/// Supported venue variants - the discriminated tag the registry keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Paper,
    Bybit,
}

type BrokerCtor =
    fn(&BrokerSettings, &dyn CredentialSource) -> Result<Arc<dyn BrokerAdapter>>;

/// Registry mapping venue tags to constructors, resolved once at
/// configuration-load time. No string dispatch on the hot path.
pub struct BrokerRegistry {
    ctors: HashMap<BrokerKind, BrokerCtor>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in venues.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BrokerKind::Paper, |settings, _creds| {
            Ok(Arc::new(PaperBroker::new(PaperConfig::from_settings(settings))))
        });
        registry.register(BrokerKind::Bybit, |settings, creds| {
            let credentials = creds.credentials(&settings.venue)?;
            let broker = Arc::new(BybitBroker::new(settings, credentials));
            // REST venues deliver executions by polling; must be built
            // inside a tokio runtime.
            broker.spawn_execution_poller(std::time::Duration::from_secs(2));
            Ok(broker)
        });
        registry
    }

    pub fn register(&mut self, kind: BrokerKind, ctor: BrokerCtor) {
        self.ctors.insert(kind, ctor);
    }

    pub fn build(
        &self,
        settings: &BrokerSettings,
        creds: &dyn CredentialSource,
    ) -> Result<Arc<dyn BrokerAdapter>> {
        let ctor = self.ctors.get(&settings.kind).ok_or_else(|| {
            Error::Config(format!("no adapter registered for {:?}", settings.kind))
        })?;
        ctor(settings, creds)
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
