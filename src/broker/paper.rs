//! Paper venue - in-process simulated exchange
//!
//! Market orders execute immediately at the mark (optionally with random
//! slippage); limit orders rest until a price tick crosses them. The fill
//! channel, fault injection and the placed-order counter make this the
//! reference venue for the integration tests and for paper-mode runs.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::RngExt;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use async_trait::async_trait;

use crate::broker::{BrokerAdapter, OrderAck, PlaceOrderRequest, StatusReport};
use crate::config::BrokerSettings;
use crate::error::BrokerError;
use crate::types::{
    Balance, ClientToken, Fill, OrderStatus, OrderType, Position, Price, Quantity, Side, Symbol,
};

/// Paper venue tuning.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub starting_balance: Decimal,
    /// Seed mark for symbols never priced explicitly
    pub start_price: Decimal,
    /// Random-walk amplitude for `current_price`, in basis points; 0 = flat
    pub walk_bps: f64,
    /// Max random slippage applied to market fills, in basis points
    pub slippage_bps: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_balance: Decimal::from(100_000),
            start_price: Decimal::from(30_000),
            walk_bps: 15.0,
            slippage_bps: 0.0,
        }
    }
}

impl PaperConfig {
    pub fn from_settings(_settings: &BrokerSettings) -> Self {
        Self::default()
    }
}

/// One-shot fault injected into the next `place_order` call.
#[derive(Debug, Clone)]
pub enum PaperFault {
    /// Venue refuses the order
    Reject(String),
    /// Request never reaches the venue
    Transient,
    /// Venue receives and executes, but the response is lost
    Ambiguous,
}

struct VenueOrder {
    venue_id: String,
    order_id: Uuid,
    token: ClientToken,
    symbol: Symbol,
    side: Side,
    order_type: OrderType,
    quantity: Decimal,
    limit_price: Option<Decimal>,
    filled: Decimal,
    avg_price: Option<Decimal>,
    status: OrderStatus,
    next_seq: u64,
}

impl VenueOrder {
    fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }
}

#[derive(Clone)]
struct VenuePosition {
    side: Side,
    quantity: Decimal,
    entry: Decimal,
}

/// Simulated venue.
pub struct PaperBroker {
    config: PaperConfig,
    balance: RwLock<Decimal>,
    marks: RwLock<HashMap<Symbol, Decimal>>,
    orders: RwLock<HashMap<String, VenueOrder>>,
    by_token: RwLock<HashMap<ClientToken, String>>,
    venue_positions: RwLock<HashMap<Symbol, VenuePosition>>,
    fill_tx: flume::Sender<Fill>,
    fill_rx: flume::Receiver<Fill>,
    placed: AtomicU64,
    next_id: AtomicU64,
    next_fault: Mutex<Option<PaperFault>>,
}

impl PaperBroker {
    pub fn new(config: PaperConfig) -> Self {
        let (fill_tx, fill_rx) = flume::unbounded();
        Self {
            balance: RwLock::new(config.starting_balance),
            config,
            marks: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            by_token: RwLock::new(HashMap::new()),
            venue_positions: RwLock::new(HashMap::new()),
            fill_tx,
            fill_rx,
            placed: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            next_fault: Mutex::new(None),
        }
    }

    /// Orders that actually reached the venue. The idempotency tests key
    /// on this staying at one under concurrent resubmission.
    pub fn placed_orders(&self) -> u64 {
        self.placed.load(Ordering::SeqCst)
    }

    /// Arm a one-shot fault for the next `place_order` call.
    pub fn inject_fault(&self, fault: PaperFault) {
        *self.next_fault.lock() = Some(fault);
    }

    /// Set the mark for a symbol and cross any resting limit orders.
    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        self.marks.write().insert(symbol.clone(), price);

        let crossed: Vec<String> = {
            let orders = self.orders.read();
            orders
                .values()
                .filter(|o| {
                    o.symbol == *symbol
                        && o.order_type == OrderType::Limit
                        && !o.status.is_terminal()
                        && o.limit_price.is_some_and(|limit| match o.side {
                            Side::Buy => price <= limit,
                            Side::Sell => price >= limit,
                        })
                })
                .map(|o| o.venue_id.clone())
                .collect()
        };
        for venue_id in crossed {
            let mut orders = self.orders.write();
            if let Some(order) = orders.get_mut(&venue_id) {
                // Resting limits fill at their limit price
                let px = order.limit_price.unwrap_or(price);
                self.execute(order, px);
            }
        }
    }

    fn mark_or_seed(&self, symbol: &Symbol) -> Decimal {
        *self
            .marks
            .write()
            .entry(symbol.clone())
            .or_insert(self.config.start_price)
    }

    fn next_venue_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn slipped(&self, price: Decimal, side: Side) -> Decimal {
        if self.config.slippage_bps <= 0.0 {
            return price;
        }
        let bps = rand::rng().random_range(0.0..self.config.slippage_bps);
        let factor = Decimal::try_from(bps / 10_000.0).unwrap_or(Decimal::ZERO);
        match side {
            Side::Buy => price * (Decimal::ONE + factor),
            Side::Sell => price * (Decimal::ONE - factor),
        }
    }

    /// Fill the full remaining quantity at `price` and emit the fill.
    fn execute(&self, order: &mut VenueOrder, price: Decimal) {
        let quantity = order.remaining();
        if quantity <= Decimal::ZERO {
            return;
        }
        let seq = order.next_seq;
        order.next_seq += 1;

        let prev_notional = order.avg_price.unwrap_or(Decimal::ZERO) * order.filled;
        order.filled += quantity;
        order.avg_price = Some((prev_notional + price * quantity) / order.filled);
        order.status = if order.filled >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        let notional = quantity * price;
        {
            let mut balance = self.balance.write();
            match order.side {
                Side::Buy => *balance -= notional,
                Side::Sell => *balance += notional,
            }
        }
        self.track_position(&order.symbol, order.side, quantity, price);

        let fill = Fill {
            fill_id: format!("{}-{}", order.venue_id, seq),
            order_id: order.order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: Quantity::new(quantity),
            price: Price::new(price),
            seq,
            timestamp: Utc::now(),
        };
        // Receiver may be gone in short-lived tests
        let _ = self.fill_tx.send(fill);
    }

    fn track_position(&self, symbol: &Symbol, side: Side, quantity: Decimal, price: Decimal) {
        let mut positions = self.venue_positions.write();
        match positions.get_mut(symbol) {
            None => {
                positions.insert(
                    symbol.clone(),
                    VenuePosition {
                        side,
                        quantity,
                        entry: price,
                    },
                );
            }
            Some(p) if p.side == side => {
                p.entry = (p.entry * p.quantity + price * quantity) / (p.quantity + quantity);
                p.quantity += quantity;
            }
            Some(p) => {
                if quantity >= p.quantity {
                    let flip = quantity - p.quantity;
                    if flip > Decimal::ZERO {
                        *p = VenuePosition {
                            side,
                            quantity: flip,
                            entry: price,
                        };
                    } else {
                        positions.remove(symbol);
                    }
                } else {
                    p.quantity -= quantity;
                }
            }
        }
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn balance(&self) -> Result<Balance, BrokerError> {
        Ok(Balance {
            asset: "USDT".to_string(),
            free: *self.balance.read(),
            locked: Decimal::ZERO,
        })
    }

    async fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        let marks = self.marks.read();
        Ok(self
            .venue_positions
            .read()
            .iter()
            .map(|(symbol, p)| {
                let mark = marks.get(symbol).copied().unwrap_or(p.entry);
                let mut position = Position {
                    symbol: symbol.clone(),
                    side: p.side,
                    quantity: Quantity::new(p.quantity),
                    entry_price: Price::new(p.entry),
                    mark_price: Price::new(mark),
                    unrealized_pnl: Decimal::ZERO,
                    stop_loss: None,
                    take_profit: None,
                    venue: "paper".to_string(),
                    opened_at: Utc::now(),
                };
                position.refresh_mark(Price::new(mark));
                position
            })
            .collect())
    }

    async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<OrderAck, BrokerError> {
        match self.next_fault.lock().take() {
            Some(PaperFault::Reject(reason)) => return Err(BrokerError::Rejected(reason)),
            Some(PaperFault::Transient) => {
                // Connection refused before the request left the process
                return Err(BrokerError::Transient("connect refused".to_string()));
            }
            Some(PaperFault::Ambiguous) => {
                // The venue executes but the response never arrives
                self.admit(&request);
                return Err(BrokerError::Ambiguous(
                    "response lost after send".to_string(),
                ));
            }
            None => {}
        }

        let venue_id = self.admit(&request);
        Ok(OrderAck {
            venue_order_id: venue_id,
            status: OrderStatus::Submitted,
        })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), BrokerError> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(venue_order_id)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", venue_order_id)))?;
        if order.status.is_terminal() {
            return Err(BrokerError::Rejected(format!(
                "order {} already {}",
                venue_order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn order_status(&self, token: &ClientToken) -> Result<StatusReport, BrokerError> {
        let by_token = self.by_token.read();
        let venue_id = by_token
            .get(token)
            .ok_or_else(|| BrokerError::Rejected(format!("no order for token {}", token)))?;
        let orders = self.orders.read();
        let order = orders
            .get(venue_id)
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", venue_id)))?;
        Ok(StatusReport {
            venue_order_id: Some(order.venue_id.clone()),
            status: order.status,
            filled_quantity: Quantity::new(order.filled),
            avg_fill_price: order.avg_price.map(Price::new),
        })
    }

    async fn current_price(&self, symbol: &Symbol) -> Result<Price, BrokerError> {
        let mut price = self.mark_or_seed(symbol);
        if self.config.walk_bps > 0.0 {
            let bps = rand::rng().random_range(-self.config.walk_bps..=self.config.walk_bps);
            let factor = Decimal::try_from(bps / 10_000.0).unwrap_or(Decimal::ZERO);
            price *= Decimal::ONE + factor;
            self.marks.write().insert(symbol.clone(), price);
        }
        Ok(Price::new(price))
    }

    async fn set_leverage(&self, symbol: &Symbol, leverage: u32) -> Result<(), BrokerError> {
        tracing::debug!("paper venue: leverage {}x on {}", leverage, symbol);
        Ok(())
    }

    fn fills(&self) -> flume::Receiver<Fill> {
        self.fill_rx.clone()
    }
}

impl PaperBroker {
    /// Record an admitted order, executing market orders and marketable
    /// limits immediately. Returns the venue order id.
    fn admit(&self, request: &PlaceOrderRequest) -> String {
        let venue_id = self.next_venue_id();
        let mark = self.mark_or_seed(&request.symbol);
        let mut order = VenueOrder {
            venue_id: venue_id.clone(),
            order_id: request.order_id,
            token: request.client_token,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity.as_decimal(),
            limit_price: request.price.map(|p| p.as_decimal()),
            filled: Decimal::ZERO,
            avg_price: None,
            status: OrderStatus::Submitted,
            next_seq: 1,
        };
        self.placed.fetch_add(1, Ordering::SeqCst);

        match order.order_type {
            OrderType::Market => {
                let price = self.slipped(mark, order.side);
                self.execute(&mut order, price);
            }
            OrderType::Limit => {
                if let Some(limit) = order.limit_price {
                    let marketable = match order.side {
                        Side::Buy => mark <= limit,
                        Side::Sell => mark >= limit,
                    };
                    if marketable {
                        self.execute(&mut order, limit);
                    }
                }
            }
        }

        self.by_token
            .write()
            .insert(order.token, venue_id.clone());
        self.orders.write().insert(venue_id.clone(), order);
        venue_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(side: Side, qty: i64, order_type: OrderType, price: Option<i64>) -> PlaceOrderRequest {
        PlaceOrderRequest {
            order_id: Uuid::new_v4(),
            client_token: ClientToken::generate(),
            symbol: Symbol::new("BTC/USDT"),
            side,
            order_type,
            quantity: Quantity::new(qty),
            price: price.map(Price::new),
        }
    }

    fn flat_broker() -> PaperBroker {
        PaperBroker::new(PaperConfig {
            walk_bps: 0.0,
            ..PaperConfig::default()
        })
    }

    #[tokio::test]
    async fn test_market_order_fills_immediately() {
        let broker = flat_broker();
        let symbol = Symbol::new("BTC/USDT");
        broker.set_price(&symbol, Decimal::from(100));

        let req = request(Side::Buy, 2, OrderType::Market, None);
        let order_id = req.order_id;
        broker.place_order(req).await.unwrap();

        let fill = broker.fills().try_recv().unwrap();
        assert_eq!(fill.order_id, order_id);
        assert_eq!(fill.seq, 1);
        assert_eq!(fill.quantity.as_decimal(), Decimal::from(2));
        assert_eq!(fill.price.as_decimal(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_crossed() {
        let broker = flat_broker();
        let symbol = Symbol::new("BTC/USDT");
        broker.set_price(&symbol, Decimal::from(100));

        let req = request(Side::Buy, 1, OrderType::Limit, Some(90));
        let token = req.client_token;
        broker.place_order(req).await.unwrap();
        assert!(broker.fills().try_recv().is_err());

        broker.set_price(&symbol, Decimal::from(89));
        let fill = broker.fills().try_recv().unwrap();
        assert_eq!(fill.price.as_decimal(), Decimal::from(90));

        let report = broker.order_status(&token).await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_ambiguous_fault_executes_without_response() {
        let broker = flat_broker();
        let symbol = Symbol::new("BTC/USDT");
        broker.set_price(&symbol, Decimal::from(100));
        broker.inject_fault(PaperFault::Ambiguous);

        let req = request(Side::Buy, 1, OrderType::Market, None);
        let token = req.client_token;
        let result = broker.place_order(req).await;
        assert!(matches!(result, Err(BrokerError::Ambiguous(_))));

        // The order is venue-side despite the lost response
        assert_eq!(broker.placed_orders(), 1);
        let report = broker.order_status(&token).await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_transient_fault_leaves_no_trace() {
        let broker = flat_broker();
        broker.inject_fault(PaperFault::Transient);
        let result = broker.place_order(request(Side::Buy, 1, OrderType::Market, None)).await;
        assert!(matches!(result, Err(BrokerError::Transient(_))));
        assert_eq!(broker.placed_orders(), 0);
    }

    #[tokio::test]
    async fn test_cancel_of_filled_order_is_rejected() {
        let broker = flat_broker();
        let symbol = Symbol::new("BTC/USDT");
        broker.set_price(&symbol, Decimal::from(100));
        let ack = broker
            .place_order(request(Side::Buy, 1, OrderType::Market, None))
            .await
            .unwrap();
        let result = broker.cancel_order(&ack.venue_order_id).await;
        assert!(matches!(result, Err(BrokerError::Rejected(_))));
    }
}
