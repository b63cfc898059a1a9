//! Account state - the engine's authoritative world view
//!
//! Owned exclusively by one `TradingEngine`; everything else sees cloned
//! snapshots. Fill deduplication and resequencing live here so the state
//! can never observe a duplicate or out-of-order execution.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Fill, Order, OrderStatus, Position, Price, Quantity, Side, Symbol};

/// Read-only view handed to the risk validator and other collaborators.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub available: Decimal,
    pub positions: Vec<Position>,
    pub open_orders: Vec<Order>,
    pub marks: HashMap<Symbol, Price>,
}

impl AccountSnapshot {
    /// Equity = available balance + notional of all open positions
    pub fn equity(&self) -> Decimal {
        self.available + self.positions.iter().map(|p| p.notional()).sum::<Decimal>()
    }

    /// Total exposure: open positions plus the unfilled remainder of open
    /// orders, both at the current mark.
    pub fn total_exposure(&self) -> Decimal {
        let positions: Decimal = self.positions.iter().map(|p| p.notional()).sum();
        let orders: Decimal = self
            .open_orders
            .iter()
            .map(|o| {
                let mark = self
                    .marks
                    .get(&o.symbol)
                    .copied()
                    .or(o.price)
                    .map(|p| p.as_decimal())
                    .unwrap_or(Decimal::ZERO);
                o.remaining_quantity().as_decimal() * mark
            })
            .sum();
        positions + orders
    }

    pub fn position_notional(&self, symbol: &Symbol) -> Decimal {
        self.positions
            .iter()
            .find(|p| &p.symbol == symbol)
            .map(|p| p.notional())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn position_side(&self, symbol: &Symbol) -> Option<Side> {
        self.positions
            .iter()
            .find(|p| &p.symbol == symbol)
            .map(|p| p.side)
    }

    pub fn has_position(&self, symbol: &Symbol) -> bool {
        self.positions.iter().any(|p| &p.symbol == symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }
}

/// What a fill did to the position book.
#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened(Position),
    Updated(Position),
    Closed { symbol: Symbol, realized_pnl: Decimal },
}

/// Result of applying one fill.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub order: Order,
    pub position: PositionEvent,
}

/// Admission decision for an incoming fill.
#[derive(Debug)]
pub enum FillAdmission {
    /// Already applied; absorb silently
    Duplicate,
    /// Ahead of the expected sequence; buffered until the gap closes
    Stashed,
    /// In order; the vector is this fill plus any stashed successors
    Ready(Vec<Fill>),
}

/// Engine-owned mutable account state.
pub struct AccountState {
    venue: String,
    available: Decimal,
    realized_pnl: Decimal,
    positions: HashMap<Symbol, Position>,
    orders: HashMap<Uuid, Order>,
    marks: HashMap<Symbol, Price>,
    applied_fills: HashSet<String>,
    next_fill_seq: HashMap<Uuid, u64>,
    stashed_fills: HashMap<Uuid, BTreeMap<u64, Fill>>,
}

impl AccountState {
    pub fn new(venue: impl Into<String>, available: Decimal) -> Self {
        Self {
            venue: venue.into(),
            available,
            realized_pnl: Decimal::ZERO,
            positions: HashMap::new(),
            orders: HashMap::new(),
            marks: HashMap::new(),
            applied_fills: HashSet::new(),
            next_fill_seq: HashMap::new(),
            stashed_fills: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            available: self.available,
            positions: self.positions.values().cloned().collect(),
            open_orders: self
                .orders
                .values()
                .filter(|o| o.is_open())
                .cloned()
                .collect(),
            marks: self.marks.clone(),
        }
    }

    pub fn available(&self) -> Decimal {
        self.available
    }

    pub fn set_available(&mut self, available: Decimal) {
        self.available = available;
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn mark(&self, symbol: &Symbol) -> Option<Price> {
        self.marks.get(symbol).copied()
    }

    pub fn set_mark(&mut self, symbol: Symbol, mark: Price) -> Option<Position> {
        self.marks.insert(symbol.clone(), mark);
        self.positions.get_mut(&symbol).map(|p| {
            p.refresh_mark(mark);
            p.clone()
        })
    }

    pub fn insert_order(&mut self, order: Order) {
        self.orders.insert(order.id, order);
    }

    pub fn remove_order(&mut self, id: &Uuid) -> Option<Order> {
        self.orders.remove(id)
    }

    pub fn order(&self, id: &Uuid) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn seed_position(&mut self, position: Position) {
        self.marks
            .insert(position.symbol.clone(), position.mark_price);
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }

    pub fn set_venue_order_id(&mut self, id: &Uuid, venue_order_id: String) -> Option<Order> {
        self.orders.get_mut(id).map(|order| {
            order.venue_order_id = Some(venue_order_id);
            order.updated_at = Utc::now();
            order.clone()
        })
    }

    /// Validated status transition. Programming faults (illegal transitions)
    /// surface as `Error::InvalidState`.
    pub fn transition_order(
        &mut self,
        id: &Uuid,
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order> {
        let order = self
            .orders
            .get_mut(id)
            .ok_or_else(|| Error::InvalidState(format!("unknown order {}", id)))?;
        if !order.status.can_transition_to(to) {
            return Err(Error::InvalidState(format!(
                "order {}: illegal transition {} -> {}",
                id, order.status, to
            )));
        }
        order.status = to;
        if reason.is_some() {
            order.reason = reason;
        }
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    /// Decide what to do with an incoming fill: absorb duplicates, buffer
    /// out-of-order deliveries, or release an in-order run for application.
    pub fn admit_fill(&mut self, fill: Fill) -> FillAdmission {
        if self.applied_fills.contains(&fill.fill_id) {
            return FillAdmission::Duplicate;
        }
        let expected = *self.next_fill_seq.get(&fill.order_id).unwrap_or(&1);
        if fill.seq < expected {
            // Same sequence slot seen under a different fill id; the venue
            // already reported this execution.
            return FillAdmission::Duplicate;
        }
        if fill.seq > expected {
            self.stashed_fills
                .entry(fill.order_id)
                .or_default()
                .insert(fill.seq, fill);
            return FillAdmission::Stashed;
        }

        let mut ready = vec![fill.clone()];
        let mut next = expected + 1;
        if let Some(stash) = self.stashed_fills.get_mut(&fill.order_id) {
            while let Some(f) = stash.remove(&next) {
                ready.push(f);
                next += 1;
            }
            if stash.is_empty() {
                self.stashed_fills.remove(&fill.order_id);
            }
        }
        FillAdmission::Ready(ready)
    }

    /// Apply one admitted, in-order fill: order progress, position book,
    /// balance, realized PnL.
    pub fn apply_fill(
        &mut self,
        fill: &Fill,
        default_stops: Option<(Decimal, Decimal)>,
    ) -> Result<FillOutcome> {
        let order = self
            .orders
            .get_mut(&fill.order_id)
            .ok_or_else(|| Error::InvalidState(format!("fill for unknown order {}", fill.order_id)))?;
        if order.status == OrderStatus::Rejected {
            return Err(Error::InvalidState(format!(
                "fill {} against rejected order {}",
                fill.fill_id, fill.order_id
            )));
        }

        // Order progress. Fills are authoritative; a fill racing a local
        // cancel still counts.
        let prev_filled = order.filled_quantity.as_decimal();
        let new_filled = prev_filled + fill.quantity.as_decimal();
        let prev_notional = order
            .avg_fill_price
            .map(|p| p.as_decimal() * prev_filled)
            .unwrap_or(Decimal::ZERO);
        let avg = (prev_notional + fill.price.as_decimal() * fill.quantity.as_decimal())
            / new_filled;
        order.filled_quantity = Quantity::new(new_filled);
        order.avg_fill_price = Some(Price::new(avg));
        order.status = if new_filled >= order.quantity.as_decimal() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.updated_at = Utc::now();
        let order_view = order.clone();

        // Balance
        let notional = fill.quantity.as_decimal() * fill.price.as_decimal();
        match fill.side {
            Side::Buy => self.available -= notional,
            Side::Sell => self.available += notional,
        }

        // Position book
        let position = self.update_position(fill, default_stops);

        self.applied_fills.insert(fill.fill_id.clone());
        self.next_fill_seq.insert(fill.order_id, fill.seq + 1);

        Ok(FillOutcome {
            order: order_view,
            position,
        })
    }

    fn update_position(
        &mut self,
        fill: &Fill,
        default_stops: Option<(Decimal, Decimal)>,
    ) -> PositionEvent {
        self.marks.insert(fill.symbol.clone(), fill.price);

        match self.positions.get_mut(&fill.symbol) {
            None => {
                let position = new_position(fill, &self.venue, default_stops);
                self.positions.insert(fill.symbol.clone(), position.clone());
                PositionEvent::Opened(position)
            }
            Some(position) if position.side == fill.side => {
                // Same direction: grow, re-average the entry
                let old_qty = position.quantity.as_decimal();
                let add_qty = fill.quantity.as_decimal();
                let entry = (position.entry_price.as_decimal() * old_qty
                    + fill.price.as_decimal() * add_qty)
                    / (old_qty + add_qty);
                position.quantity = Quantity::new(old_qty + add_qty);
                position.entry_price = Price::new(entry);
                position.refresh_mark(fill.price);
                PositionEvent::Updated(position.clone())
            }
            Some(position) => {
                // Opposite direction: reduce, possibly close, possibly flip
                let held = position.quantity.as_decimal();
                let closing = held.min(fill.quantity.as_decimal());
                let per_unit = match position.side {
                    Side::Buy => fill.price.as_decimal() - position.entry_price.as_decimal(),
                    Side::Sell => position.entry_price.as_decimal() - fill.price.as_decimal(),
                };
                let realized = per_unit * closing;
                self.realized_pnl += realized;

                let remaining = held - closing;
                let flip_qty = fill.quantity.as_decimal() - closing;
                if remaining > Decimal::ZERO {
                    position.quantity = Quantity::new(remaining);
                    position.refresh_mark(fill.price);
                    PositionEvent::Updated(position.clone())
                } else {
                    self.positions.remove(&fill.symbol);
                    if flip_qty > Decimal::ZERO {
                        let mut flip_fill = fill.clone();
                        flip_fill.quantity = Quantity::new(flip_qty);
                        let position = new_position(&flip_fill, &self.venue, default_stops);
                        self.positions.insert(fill.symbol.clone(), position.clone());
                        PositionEvent::Opened(position)
                    } else {
                        PositionEvent::Closed {
                            symbol: fill.symbol.clone(),
                            realized_pnl: realized,
                        }
                    }
                }
            }
        }
    }
}

fn new_position(
    fill: &Fill,
    venue: &str,
    default_stops: Option<(Decimal, Decimal)>,
) -> Position {
    let entry = fill.price.as_decimal();
    let (stop_loss, take_profit) = match default_stops {
        Some((sl_pct, tp_pct)) => {
            let (sl, tp) = match fill.side {
                Side::Buy => (entry * (Decimal::ONE - sl_pct), entry * (Decimal::ONE + tp_pct)),
                Side::Sell => (entry * (Decimal::ONE + sl_pct), entry * (Decimal::ONE - tp_pct)),
            };
            (Some(Price::new(sl)), Some(Price::new(tp)))
        }
        None => (None, None),
    };
    let mut position = Position {
        symbol: fill.symbol.clone(),
        side: fill.side,
        quantity: fill.quantity,
        entry_price: fill.price,
        mark_price: fill.price,
        unrealized_pnl: Decimal::ZERO,
        stop_loss,
        take_profit,
        venue: venue.to_string(),
        opened_at: Utc::now(),
    };
    position.refresh_mark(fill.price);
    position
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClientToken;

    fn submitted_order(side: Side, qty: i64) -> Order {
        let mut order = Order::new_market(
            Symbol::new("BTC/USDT"),
            side,
            Quantity::new(qty),
            ClientToken::generate(),
            "test",
        );
        order.status = OrderStatus::Submitted;
        order
    }

    fn fill_for(order: &Order, id: &str, seq: u64, qty: i64, price: i64) -> Fill {
        Fill {
            fill_id: id.to_string(),
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: Quantity::new(qty),
            price: Price::new(price),
            seq,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_fill_absorbed() {
        let mut account = AccountState::new("paper", Decimal::from(100_000));
        let order = submitted_order(Side::Buy, 2);
        account.insert_order(order.clone());

        let fill = fill_for(&order, "f-1", 1, 2, 100);
        match account.admit_fill(fill.clone()) {
            FillAdmission::Ready(fills) => {
                for f in fills {
                    account.apply_fill(&f, None).unwrap();
                }
            }
            other => panic!("expected ready, got {:?}", other),
        }
        assert!(matches!(account.admit_fill(fill), FillAdmission::Duplicate));

        let position = account.position(&Symbol::new("BTC/USDT")).unwrap();
        assert_eq!(position.quantity.as_decimal(), Decimal::from(2));
        assert_eq!(account.realized_pnl(), Decimal::ZERO);
    }

    #[test]
    fn test_out_of_order_fills_resequenced() {
        let mut account = AccountState::new("paper", Decimal::from(100_000));
        let order = submitted_order(Side::Buy, 4);
        account.insert_order(order.clone());

        let second = fill_for(&order, "f-2", 2, 2, 110);
        let first = fill_for(&order, "f-1", 1, 2, 100);

        assert!(matches!(
            account.admit_fill(second),
            FillAdmission::Stashed
        ));
        match account.admit_fill(first) {
            FillAdmission::Ready(fills) => {
                assert_eq!(fills.len(), 2);
                assert_eq!(fills[0].seq, 1);
                assert_eq!(fills[1].seq, 2);
                for f in fills {
                    account.apply_fill(&f, None).unwrap();
                }
            }
            other => panic!("expected ready run, got {:?}", other),
        }

        let position = account.position(&Symbol::new("BTC/USDT")).unwrap();
        assert_eq!(position.quantity.as_decimal(), Decimal::from(4));
        // VWAP of 2@100 and 2@110
        assert_eq!(position.entry_price.as_decimal(), Decimal::from(105));

        let order = account.order(&order.id).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn test_partial_fill_status() {
        let mut account = AccountState::new("paper", Decimal::from(100_000));
        let order = submitted_order(Side::Buy, 10);
        account.insert_order(order.clone());

        let outcome = account
            .apply_fill(&fill_for(&order, "f-1", 1, 4, 100), None)
            .unwrap();
        assert_eq!(outcome.order.status, OrderStatus::PartiallyFilled);
        assert_eq!(
            outcome.order.remaining_quantity().as_decimal(),
            Decimal::from(6)
        );
    }

    #[test]
    fn test_round_trip_removes_position() {
        let mut account = AccountState::new("paper", Decimal::from(100_000));
        let buy = submitted_order(Side::Buy, 3);
        account.insert_order(buy.clone());
        account
            .apply_fill(&fill_for(&buy, "f-1", 1, 3, 100), None)
            .unwrap();
        assert!(account.position(&Symbol::new("BTC/USDT")).is_some());

        let sell = submitted_order(Side::Sell, 3);
        account.insert_order(sell.clone());
        let outcome = account
            .apply_fill(&fill_for(&sell, "f-2", 1, 3, 120), None)
            .unwrap();

        assert!(account.position(&Symbol::new("BTC/USDT")).is_none());
        match outcome.position {
            PositionEvent::Closed { realized_pnl, .. } => {
                assert_eq!(realized_pnl, Decimal::from(60));
            }
            other => panic!("expected closed, got {:?}", other),
        }
        assert_eq!(account.realized_pnl(), Decimal::from(60));
        // 100k - 300 spent + 360 received
        assert_eq!(account.available(), Decimal::from(100_060));
    }

    #[test]
    fn test_oversized_closing_fill_flips_position() {
        let mut account = AccountState::new("paper", Decimal::from(100_000));
        let buy = submitted_order(Side::Buy, 2);
        account.insert_order(buy.clone());
        account
            .apply_fill(&fill_for(&buy, "f-1", 1, 2, 100), None)
            .unwrap();

        let sell = submitted_order(Side::Sell, 5);
        account.insert_order(sell.clone());
        let outcome = account
            .apply_fill(&fill_for(&sell, "f-2", 1, 5, 100), None)
            .unwrap();

        match outcome.position {
            PositionEvent::Opened(position) => {
                assert_eq!(position.side, Side::Sell);
                assert_eq!(position.quantity.as_decimal(), Decimal::from(3));
            }
            other => panic!("expected flip, got {:?}", other),
        }
    }

    #[test]
    fn test_default_stops_applied_on_open() {
        let mut account = AccountState::new("paper", Decimal::from(100_000));
        let buy = submitted_order(Side::Buy, 1);
        account.insert_order(buy.clone());
        let stops = (
            Decimal::from(2) / Decimal::from(100),
            Decimal::from(5) / Decimal::from(100),
        );
        let outcome = account
            .apply_fill(&fill_for(&buy, "f-1", 1, 1, 100), Some(stops))
            .unwrap();
        match outcome.position {
            PositionEvent::Opened(position) => {
                assert_eq!(position.stop_loss.unwrap().as_decimal(), Decimal::from(98));
                assert_eq!(
                    position.take_profit.unwrap().as_decimal(),
                    Decimal::from(105)
                );
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_illegal_transition_is_fault() {
        let mut account = AccountState::new("paper", Decimal::from(1_000));
        let mut order = submitted_order(Side::Buy, 1);
        order.status = OrderStatus::Filled;
        let id = order.id;
        account.insert_order(order);
        let result = account.transition_order(&id, OrderStatus::Cancelled, None);
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }
}
