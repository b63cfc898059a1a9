//! Persistence collaborator boundary
//!
//! The engine calls these hooks on every state transition, before it
//! reports success or emits events. Durability (write-ahead for terminal
//! orders) is the implementor's contract; the core only sequences the
//! calls.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Order, Position, Symbol};

/// Storage boundary for orders and positions.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save_order(&self, order: &Order) -> Result<()>;
    async fn save_position(&self, position: &Position) -> Result<()>;
    async fn remove_position(&self, symbol: &Symbol) -> Result<()>;
    async fn load_open_orders(&self) -> Result<Vec<Order>>;
    async fn load_open_positions(&self) -> Result<Vec<Position>>;
}

/// In-memory store: reference implementation for paper mode and tests.
pub struct MemoryStore {
    orders: RwLock<HashMap<Uuid, Order>>,
    positions: RwLock<HashMap<Symbol, Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStore for MemoryStore {
    async fn save_order(&self, order: &Order) -> Result<()> {
        self.orders.write().insert(order.id, order.clone());
        Ok(())
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .insert(position.symbol.clone(), position.clone());
        Ok(())
    }

    async fn remove_position(&self, symbol: &Symbol) -> Result<()> {
        self.positions.write().remove(symbol);
        Ok(())
    }

    async fn load_open_orders(&self) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .read()
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientToken, OrderStatus, Quantity, Side};

    #[tokio::test]
    async fn test_open_orders_survive_reload() {
        let store = MemoryStore::new();
        let mut open = Order::new_market(
            Symbol::new("BTC/USDT"),
            Side::Buy,
            Quantity::new(1),
            ClientToken::generate(),
            "test",
        );
        open.status = OrderStatus::Submitted;
        let mut done = open.clone();
        done.id = Uuid::new_v4();
        done.status = OrderStatus::Filled;

        store.save_order(&open).await.unwrap();
        store.save_order(&done).await.unwrap();

        let loaded = store.load_open_orders().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, open.id);
    }

    #[tokio::test]
    async fn test_position_save_and_remove() {
        let store = MemoryStore::new();
        let symbol = Symbol::new("ETH/USDT");
        let position = Position {
            symbol: symbol.clone(),
            side: Side::Buy,
            quantity: Quantity::new(1),
            entry_price: crate::types::Price::new(100),
            mark_price: crate::types::Price::new(100),
            unrealized_pnl: rust_decimal::Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            venue: "paper".to_string(),
            opened_at: chrono::Utc::now(),
        };
        store.save_position(&position).await.unwrap();
        assert_eq!(store.load_open_positions().await.unwrap().len(), 1);
        store.remove_position(&symbol).await.unwrap();
        assert!(store.load_open_positions().await.unwrap().is_empty());
    }
}
