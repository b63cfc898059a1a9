//! Lifecycle event fan-out
//!
//! At-least-once delivery to every registered listener; listeners must
//! tolerate duplicates. Disconnected listeners are dropped on the next emit.

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::types::{Order, Position, Symbol};

/// Typed engine lifecycle events
#[derive(Debug, Clone)]
pub enum EngineEvent {
    OrderStatusChanged(Order),
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed {
        symbol: Symbol,
        realized_pnl: Decimal,
    },
}

/// Fan-out bus over flume channels
pub struct EventBus {
    listeners: RwLock<Vec<flume::Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener; the receiver sees every event emitted after
    /// this call.
    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        self.listeners.write().push(tx);
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        self.listeners
            .write()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientToken, Order, OrderStatus, Quantity, Side, Symbol};

    #[test]
    fn test_every_listener_sees_events() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let order = Order::new_market(
            Symbol::new("BTC/USDT"),
            Side::Buy,
            Quantity::new(1),
            ClientToken::generate(),
            "test",
        );
        bus.emit(EngineEvent::OrderStatusChanged(order));

        for rx in [a, b] {
            match rx.try_recv() {
                Ok(EngineEvent::OrderStatusChanged(o)) => {
                    assert_eq!(o.status, OrderStatus::Pending)
                }
                other => panic!("expected order event, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        bus.emit(EngineEvent::PositionClosed {
            symbol: Symbol::new("BTC/USDT"),
            realized_pnl: Decimal::ZERO,
        });
        assert!(bus.listeners.read().is_empty());
    }
}
