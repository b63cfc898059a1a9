//! Trading Engine - the order & position orchestrator
//!
//! Owns the authoritative account state. Signals come in, validated orders
//! go out through the venue adapter, fills come back over the venue's fill
//! channel and are applied exactly once, in sequence.
//!
//! Locking rules: the account lock protects only the snapshot-validate and
//! apply-mutation steps and is never held across broker I/O. The one lock
//! deliberately held across a venue round-trip is the per-token submission
//! lock - that is what makes a concurrent retry wait for the first
//! attempt's outcome instead of double-submitting.

pub mod account;
pub mod events;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, PlaceOrderRequest};
use crate::config::TradingConfig;
use crate::error::{BrokerError, Error, Result};
use crate::risk::{self, RiskDecision, RiskLimits};
use crate::store::TradeStore;
use crate::types::{
    ClientToken, Fill, Order, OrderStatus, Position, Price, Quantity, Side, Signal, SignalAction,
    Symbol,
};

pub use account::{AccountSnapshot, AccountState, FillAdmission, FillOutcome, PositionEvent};
pub use events::{EngineEvent, EventBus};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline applied to every broker call
    pub broker_timeout: Duration,
    /// Order notional as fraction of equity, scaled by signal confidence
    pub order_fraction: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker_timeout: Duration::from_secs(5),
            order_fraction: 0.1,
        }
    }
}

impl EngineConfig {
    pub fn from_trading(config: &TradingConfig) -> Self {
        Self {
            broker_timeout: Duration::from_millis(config.broker_timeout_ms),
            order_fraction: config.order_fraction,
        }
    }
}

/// Caller-side context for a submission: who owns the order, which
/// idempotency token identifies the attempt, and an optional explicit
/// quantity (the engine sizes from confidence otherwise).
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub strategy: String,
    pub token: ClientToken,
    pub quantity: Option<Quantity>,
}

impl StrategyContext {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            token: ClientToken::generate(),
            quantity: None,
        }
    }

    pub fn with_token(mut self, token: ClientToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = Some(quantity);
        self
    }
}

#[derive(Default)]
struct TokenSlot {
    /// Set once the attempt reaches any outcome other than a transient
    /// failure; later submissions with the token return this order.
    order_id: Option<Uuid>,
}

/// The orchestrator.
pub struct TradingEngine {
    broker: Arc<dyn BrokerAdapter>,
    store: Arc<dyn TradeStore>,
    limits: RwLock<RiskLimits>,
    account: RwLock<AccountState>,
    tokens: Mutex<HashMap<ClientToken, Arc<tokio::sync::Mutex<TokenSlot>>>>,
    events: EventBus,
    config: EngineConfig,
    duplicate_fills: AtomicU64,
}

impl TradingEngine {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        store: Arc<dyn TradeStore>,
        limits: RiskLimits,
        config: EngineConfig,
    ) -> Self {
        let venue = broker.name().to_string();
        Self {
            broker,
            store,
            limits: RwLock::new(limits),
            account: RwLock::new(AccountState::new(venue, Decimal::ZERO)),
            tokens: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            config,
            duplicate_fills: AtomicU64::new(0),
        }
    }

    /// Connect, pull the venue balance, and recover open orders and
    /// positions from the persistence collaborator.
    pub async fn bootstrap(&self) -> Result<()> {
        match timeout(self.config.broker_timeout, self.broker.connect()).await {
            Ok(result) => result.map_err(Error::Broker)?,
            Err(_) => {
                return Err(Error::Broker(BrokerError::transient(
                    "connect deadline expired",
                )));
            }
        }

        let balance = self.read_call(self.broker.balance()).await?;
        let venue_positions = self.read_call(self.broker.positions()).await?;
        let orders = self.store.load_open_orders().await?;
        let positions = self.store.load_open_positions().await?;

        {
            let mut account = self.account.write();
            account.set_available(balance.free);
            for position in positions {
                account.seed_position(position);
            }
            // The venue is authoritative: adopt anything the store missed
            for position in venue_positions {
                if account.position(&position.symbol).is_none() {
                    warn!(symbol = %position.symbol, "venue position missing locally; adopting");
                    account.seed_position(position);
                }
            }
            let mut tokens = self.tokens.lock();
            for order in orders {
                let slot = tokens.entry(order.client_token).or_default().clone();
                if let Ok(mut slot) = slot.try_lock() {
                    slot.order_id = Some(order.id);
                }
                account.insert_order(order);
            }
        }

        info!(
            venue = self.broker.name(),
            balance = %balance.free,
            "engine bootstrapped"
        );
        Ok(())
    }

    /// Construct, validate and submit an order for a signal.
    ///
    /// Guarantees at-most-one venue submission per idempotency token: a
    /// concurrent or later attempt with the same token waits for the first
    /// attempt and then returns its recorded outcome. Risk rejections come
    /// back as an order in `Rejected` status with a reason - the venue is
    /// never contacted for them.
    pub async fn submit_order(&self, signal: &Signal, ctx: StrategyContext) -> Result<Order> {
        let side = match signal.action {
            SignalAction::Buy => Side::Buy,
            SignalAction::Sell => Side::Sell,
            SignalAction::Hold => {
                return Err(Error::InvalidState(
                    "hold signal cannot be submitted".to_string(),
                ));
            }
        };

        let slot = self.token_slot(&ctx.token);
        let mut guard = slot.lock().await;
        if let Some(order_id) = guard.order_id {
            debug!(token = %ctx.token, "token already resolved; returning recorded outcome");
            return self
                .account
                .read()
                .order(&order_id)
                .cloned()
                .ok_or_else(|| {
                    Error::InvalidState(format!("token {} maps to unknown order", ctx.token))
                });
        }

        // Reference price for sizing and risk math
        let mark = match signal.entry_price {
            Some(price) => price,
            None => self.read_call(self.broker.current_price(&signal.symbol)).await?,
        };

        let quantity = match ctx.quantity {
            Some(quantity) => quantity,
            None => self.size_order(mark, signal.confidence),
        };

        let mut order = match signal.entry_price {
            Some(price) => Order::new_limit(
                signal.symbol.clone(),
                side,
                quantity,
                price,
                ctx.token,
                ctx.strategy.clone(),
            ),
            None => Order::new_market(
                signal.symbol.clone(),
                side,
                quantity,
                ctx.token,
                ctx.strategy.clone(),
            ),
        };

        // Two-phase gate, phase 1: snapshot + validate + register under one
        // account lock, so concurrent validations see this order's exposure.
        let decision = {
            let mut account = self.account.write();
            let snapshot = account.snapshot();
            let decision = risk::validate(&order, mark, &snapshot, &self.limits.read());
            if let RiskDecision::Reject(reason) = &decision {
                order.status = OrderStatus::Rejected;
                order.reason = Some(reason.to_string());
            }
            account.insert_order(order.clone());
            decision
        };

        if let RiskDecision::Reject(reason) = decision {
            warn!(order = %order.id, %reason, "order rejected by risk gate");
            guard.order_id = Some(order.id);
            self.persist_and_emit(&order).await?;
            return Ok(order);
        }

        // Phase 2: the venue call, outside the account lock.
        let request = PlaceOrderRequest {
            order_id: order.id,
            client_token: order.client_token,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
        };
        let result = match timeout(self.config.broker_timeout, self.broker.place_order(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::ambiguous("no response within deadline")),
        };

        match result {
            Ok(ack) => {
                let updated = {
                    let mut account = self.account.write();
                    account.set_venue_order_id(&order.id, ack.venue_order_id);
                    account.transition_order(&order.id, OrderStatus::Submitted, None)?
                };
                guard.order_id = Some(order.id);
                info!(order = %updated.id, venue_id = ?updated.venue_order_id, "order submitted");
                self.persist_and_emit(&updated).await?;
                Ok(updated)
            }
            Err(BrokerError::Rejected(reason)) => {
                let updated = {
                    self.account.write().transition_order(
                        &order.id,
                        OrderStatus::Rejected,
                        Some(reason.clone()),
                    )?
                };
                guard.order_id = Some(order.id);
                warn!(order = %updated.id, %reason, "order rejected by venue");
                self.persist_and_emit(&updated).await?;
                Ok(updated)
            }
            Err(error @ BrokerError::Ambiguous(_)) => {
                // The order may be venue-side; hold it in pending
                // confirmation until a status poll says otherwise.
                let updated = {
                    self.account.write().transition_order(
                        &order.id,
                        OrderStatus::PendingConfirmation,
                        None,
                    )?
                };
                guard.order_id = Some(order.id);
                warn!(order = %updated.id, %error, "submission outcome ambiguous; awaiting reconciliation");
                self.persist_and_emit(&updated).await?;
                Ok(updated)
            }
            Err(error) => {
                // Definitely not venue-side: withdraw the order and release
                // the token so a legitimate retry can proceed.
                self.account.write().remove_order(&order.id);
                debug!(order = %order.id, %error, "submission failed before reaching the venue");
                Err(Error::Broker(error))
            }
        }
    }

    /// Cancel a non-terminal order.
    pub async fn cancel_order(&self, order_id: &Uuid) -> Result<Order> {
        let venue_order_id = {
            let account = self.account.read();
            let order = account
                .order(order_id)
                .ok_or_else(|| Error::InvalidState(format!("unknown order {}", order_id)))?;
            if order.status.is_terminal() {
                return Err(Error::InvalidState(format!(
                    "order {} already {}",
                    order_id, order.status
                )));
            }
            if order.status == OrderStatus::PendingConfirmation {
                return Err(Error::InvalidState(format!(
                    "order {} awaiting reconciliation; cannot cancel",
                    order_id
                )));
            }
            order.venue_order_id.clone()
        };

        if let Some(venue_id) = venue_order_id {
            match timeout(self.config.broker_timeout, self.broker.cancel_order(&venue_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => return Err(Error::Broker(error)),
                Err(_) => {
                    return Err(Error::Broker(BrokerError::ambiguous(
                        "cancel deadline expired",
                    )));
                }
            }
        }

        let updated = {
            self.account
                .write()
                .transition_order(order_id, OrderStatus::Cancelled, None)?
        };
        info!(order = %updated.id, "order cancelled");
        self.persist_and_emit(&updated).await?;
        Ok(updated)
    }

    /// Apply one venue fill. Idempotent by fill id; out-of-order fills are
    /// buffered until the sequence gap closes.
    pub async fn on_fill(&self, fill: Fill) -> Result<()> {
        let outcomes = {
            let mut account = self.account.write();
            let ready = match account.admit_fill(fill) {
                FillAdmission::Duplicate => {
                    self.duplicate_fills.fetch_add(1, Ordering::Relaxed);
                    debug!("duplicate fill absorbed");
                    return Ok(());
                }
                FillAdmission::Stashed => {
                    debug!("fill ahead of sequence; buffered");
                    return Ok(());
                }
                FillAdmission::Ready(fills) => fills,
            };
            let stops = {
                let limits = self.limits.read();
                Some((limits.default_stop_loss_pct, limits.default_take_profit_pct))
            };
            let mut outcomes = Vec::with_capacity(ready.len());
            for fill in &ready {
                outcomes.push(account.apply_fill(fill, stops)?);
            }
            outcomes
        };

        for outcome in outcomes {
            self.store.save_order(&outcome.order).await?;
            self.events
                .emit(EngineEvent::OrderStatusChanged(outcome.order.clone()));
            match outcome.position {
                PositionEvent::Opened(position) => {
                    info!(symbol = %position.symbol, qty = %position.quantity, "position opened");
                    self.store.save_position(&position).await?;
                    self.events.emit(EngineEvent::PositionOpened(position));
                }
                PositionEvent::Updated(position) => {
                    self.store.save_position(&position).await?;
                    self.events.emit(EngineEvent::PositionUpdated(position));
                }
                PositionEvent::Closed {
                    symbol,
                    realized_pnl,
                } => {
                    info!(%symbol, %realized_pnl, "position closed");
                    self.store.remove_position(&symbol).await?;
                    self.events.emit(EngineEvent::PositionClosed {
                        symbol,
                        realized_pnl,
                    });
                }
            }
        }
        Ok(())
    }

    /// Resolve every order stuck in `pending_confirmation` by polling the
    /// venue. Returns how many orders were resolved.
    pub async fn reconcile(&self) -> Result<usize> {
        let pending = self
            .account
            .read()
            .orders_with_status(OrderStatus::PendingConfirmation);
        let mut resolved = 0;

        for order in pending {
            let report = match timeout(
                self.config.broker_timeout,
                self.broker.order_status(&order.client_token),
            )
            .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(BrokerError::Rejected(reason))) => {
                    // The venue has no record: the submission never landed
                    let updated = self.account.write().transition_order(
                        &order.id,
                        OrderStatus::Rejected,
                        Some(reason),
                    )?;
                    info!(order = %updated.id, "reconciled: not found at venue, rejected");
                    self.persist_and_emit(&updated).await?;
                    resolved += 1;
                    continue;
                }
                Ok(Err(error)) => {
                    warn!(order = %order.id, %error, "reconcile poll failed; will retry");
                    continue;
                }
                Err(_) => {
                    warn!(order = %order.id, "reconcile poll deadline expired; will retry");
                    continue;
                }
            };

            // The venue knows the order. Move it to submitted and let the
            // fill stream account for executions; jumping straight to
            // filled here would bypass position and balance accounting.
            let updated = {
                let mut account = self.account.write();
                match account.order(&order.id).map(|o| o.status) {
                    Some(OrderStatus::PendingConfirmation) => {
                        if let Some(venue_id) = report.venue_order_id.clone() {
                            account.set_venue_order_id(&order.id, venue_id);
                        }
                        Some(account.transition_order(&order.id, OrderStatus::Submitted, None)?)
                    }
                    // Progressed while we were polling
                    _ => None,
                }
            };
            if let Some(updated) = updated {
                info!(order = %updated.id, venue_status = %report.status, "reconciled");
                self.persist_and_emit(&updated).await?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Refresh the mark price for a symbol, updating position PnL.
    pub async fn update_mark(&self, symbol: &Symbol, mark: Price) -> Result<()> {
        let updated = self.account.write().set_mark(symbol.clone(), mark);
        if let Some(position) = updated {
            self.store.save_position(&position).await?;
            self.events.emit(EngineEvent::PositionUpdated(position));
        }
        Ok(())
    }

    /// Submit an opposing market order for the full position quantity.
    pub async fn close_position(&self, symbol: &Symbol) -> Result<Order> {
        let position = self
            .account
            .read()
            .position(symbol)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("no open position in {}", symbol)))?;

        let action = match position.side {
            Side::Buy => SignalAction::Sell,
            Side::Sell => SignalAction::Buy,
        };
        let signal = Signal {
            symbol: symbol.clone(),
            action,
            confidence: 1.0,
            entry_price: None,
            stop_loss: None,
            target_price: None,
            reason: "close position".to_string(),
            strategy: "engine".to_string(),
            timestamp: chrono::Utc::now(),
        };
        let ctx = StrategyContext::new("engine").with_quantity(position.quantity);
        self.submit_order(&signal, ctx).await
    }

    /// Swap in new risk limits (explicit reconfiguration only).
    pub fn reload_limits(&self, limits: RiskLimits) -> Result<()> {
        limits.validate().map_err(Error::Config)?;
        *self.limits.write() = limits;
        info!("risk limits reloaded");
        Ok(())
    }

    // ── Read-only snapshots ──────────────────────────────────────────

    pub fn positions(&self) -> Vec<Position> {
        self.account.read().positions()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.account.read().open_orders()
    }

    pub fn order(&self, order_id: &Uuid) -> Option<Order> {
        self.account.read().order(order_id).cloned()
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        self.account.read().snapshot()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.account.read().realized_pnl()
    }

    pub fn duplicate_fills(&self) -> u64 {
        self.duplicate_fills.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ── Background loops ─────────────────────────────────────────────

    /// Single consumer of the venue's fill channel; per-order delivery
    /// order is preserved by having exactly one of these per venue.
    pub fn spawn_fill_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let fills = engine.broker.fills();
        tokio::spawn(async move {
            while let Ok(fill) = fills.recv_async().await {
                if let Err(error) = engine.on_fill(fill).await {
                    warn!(%error, "fill application failed");
                }
            }
        })
    }

    pub fn spawn_reconcile_loop(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match engine.reconcile().await {
                    Ok(0) => {}
                    Ok(n) => debug!(resolved = n, "reconciliation pass"),
                    Err(error) => warn!(%error, "reconciliation pass failed"),
                }
            }
        })
    }

    // ── Internals ────────────────────────────────────────────────────

    fn token_slot(&self, token: &ClientToken) -> Arc<tokio::sync::Mutex<TokenSlot>> {
        self.tokens.lock().entry(*token).or_default().clone()
    }

    /// Equity x order_fraction x confidence, at the reference price.
    fn size_order(&self, mark: Price, confidence: f64) -> Quantity {
        if mark.as_decimal() <= Decimal::ZERO {
            return Quantity::ZERO;
        }
        let equity = self.account.read().snapshot().equity();
        let scale = Decimal::try_from(self.config.order_fraction * confidence.clamp(0.0, 1.0))
            .unwrap_or(Decimal::ZERO);
        Quantity::new(equity * scale / mark.as_decimal())
    }

    async fn persist_and_emit(&self, order: &Order) -> Result<()> {
        self.store.save_order(order).await?;
        self.events
            .emit(EngineEvent::OrderStatusChanged(order.clone()));
        Ok(())
    }

    /// Deadline wrapper for read-style venue calls; expiry is transient
    /// (nothing was mutated venue-side).
    async fn read_call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, BrokerError>>,
    ) -> Result<T> {
        match timeout(self.config.broker_timeout, call).await {
            Ok(result) => result.map_err(Error::Broker),
            Err(_) => Err(Error::Broker(BrokerError::transient("deadline expired"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{PaperBroker, PaperConfig};
    use crate::store::MemoryStore;

    fn engine_with_paper() -> (Arc<TradingEngine>, Arc<PaperBroker>) {
        let broker = Arc::new(PaperBroker::new(PaperConfig {
            walk_bps: 0.0,
            ..PaperConfig::default()
        }));
        let engine = Arc::new(TradingEngine::new(
            broker.clone(),
            Arc::new(MemoryStore::new()),
            RiskLimits::default(),
            EngineConfig::default(),
        ));
        (engine, broker)
    }

    #[tokio::test]
    async fn test_hold_signal_is_a_fault() {
        let (engine, _broker) = engine_with_paper();
        engine.bootstrap().await.unwrap();
        let signal = Signal::hold(Symbol::new("BTC/USDT"), "test", "nothing to do");
        let result = engine
            .submit_order(&signal, StrategyContext::new("test"))
            .await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_sizing_scales_with_confidence() {
        let (engine, broker) = engine_with_paper();
        let symbol = Symbol::new("BTC/USDT");
        broker.set_price(&symbol, Decimal::from(100));
        engine.bootstrap().await.unwrap();

        // equity 100_000, fraction 0.1, confidence 0.5 -> 5_000 notional
        let quantity = engine.size_order(Price::new(100), 0.5);
        assert_eq!(quantity.as_decimal(), Decimal::from(50));

        // Confidence clamped to [0, 1]
        let clamped = engine.size_order(Price::new(100), 7.0);
        assert_eq!(clamped.as_decimal(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_fault() {
        let (engine, _broker) = engine_with_paper();
        engine.bootstrap().await.unwrap();
        let result = engine.cancel_order(&Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }
}
