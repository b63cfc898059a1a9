//! End-to-end engine properties against the paper venue.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;

use tradekit::broker::paper::PaperFault;
use tradekit::broker::{BrokerAdapter, PaperBroker, PaperConfig};
use tradekit::engine::{EngineConfig, EngineEvent, StrategyContext, TradingEngine};
use tradekit::error::{BrokerError, Error};
use tradekit::risk::RiskLimits;
use tradekit::store::MemoryStore;
use tradekit::types::{
    ClientToken, OrderStatus, Price, Quantity, Signal, SignalAction, Symbol,
};

fn flat_paper() -> PaperConfig {
    PaperConfig {
        walk_bps: 0.0,
        slippage_bps: 0.0,
        ..PaperConfig::default()
    }
}

fn loose_limits() -> RiskLimits {
    RiskLimits {
        max_position_pct: Decimal::from(5),
        max_total_exposure_pct: Decimal::from(5),
        max_order_notional: Decimal::from(1_000_000),
        ..RiskLimits::default()
    }
}

fn engine_with(limits: RiskLimits, paper: PaperConfig) -> (Arc<TradingEngine>, Arc<PaperBroker>) {
    let broker = Arc::new(PaperBroker::new(paper));
    let engine = Arc::new(TradingEngine::new(
        broker.clone(),
        Arc::new(MemoryStore::new()),
        limits,
        EngineConfig::default(),
    ));
    (engine, broker)
}

fn signal(symbol: &Symbol, action: SignalAction, entry: Option<i64>) -> Signal {
    Signal {
        symbol: symbol.clone(),
        action,
        confidence: 0.9,
        entry_price: entry.map(Price::new),
        stop_loss: None,
        target_price: None,
        reason: "test".to_string(),
        strategy: "test".to_string(),
        timestamp: Utc::now(),
    }
}

/// Apply every fill the venue has queued so far.
async fn drain_fills(engine: &TradingEngine, broker: &PaperBroker) {
    while let Ok(fill) = broker.fills().try_recv() {
        engine.on_fill(fill).await.unwrap();
    }
}

#[tokio::test]
async fn concurrent_submissions_share_one_venue_call() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    let token = ClientToken::generate();
    let buy = signal(&symbol, SignalAction::Buy, None);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let buy = buy.clone();
        handles.push(tokio::spawn(async move {
            engine
                .submit_order(
                    &buy,
                    StrategyContext::new("test")
                        .with_token(token)
                        .with_quantity(Quantity::new(1)),
                )
                .await
        }));
    }

    let mut order_ids = HashSet::new();
    for handle in handles {
        let order = handle.await.unwrap().unwrap();
        order_ids.insert(order.id);
    }

    assert_eq!(order_ids.len(), 1, "all attempts must resolve to one order");
    assert_eq!(broker.placed_orders(), 1, "exactly one venue submission");
}

#[tokio::test]
async fn duplicate_fill_redelivery_changes_nothing() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, None),
            StrategyContext::new("test").with_quantity(Quantity::new(2)),
        )
        .await
        .unwrap();

    let fill = broker.fills().try_recv().unwrap();
    engine.on_fill(fill.clone()).await.unwrap();

    let position_before = engine.positions();
    let realized_before = engine.realized_pnl();

    // At-least-once upstream delivery replays the same fill
    engine.on_fill(fill).await.unwrap();

    assert_eq!(engine.duplicate_fills(), 1);
    assert_eq!(engine.realized_pnl(), realized_before);
    let position_after = engine.positions();
    assert_eq!(position_after.len(), position_before.len());
    assert_eq!(
        position_after[0].quantity.as_decimal(),
        position_before[0].quantity.as_decimal()
    );
}

#[tokio::test]
async fn exposure_breach_never_reaches_the_venue() {
    let limits = RiskLimits {
        max_total_exposure_pct: Decimal::from(5) / Decimal::from(100),
        ..loose_limits()
    };
    let (engine, broker) = engine_with(limits, flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    // equity 100_000, exposure cap 5_000; this order is 10_000
    let order = engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, None),
            StrategyContext::new("test").with_quantity(Quantity::new(100)),
        )
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(order.reason.as_deref().unwrap_or("").contains("exposure"));
    assert_eq!(broker.placed_orders(), 0, "no venue call after rejection");
}

#[tokio::test]
async fn insufficient_balance_names_the_shortfall() {
    let paper = PaperConfig {
        starting_balance: Decimal::from(900),
        ..flat_paper()
    };
    let (engine, broker) = engine_with(loose_limits(), paper);
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(10));
    engine.bootstrap().await.unwrap();

    // $1,000 order against $900 available
    let order = engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, Some(10)),
            StrategyContext::new("test").with_quantity(Quantity::new(100)),
        )
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Rejected);
    assert!(
        order
            .reason
            .as_deref()
            .unwrap_or("")
            .contains("insufficient balance"),
        "reason was {:?}",
        order.reason
    );
    assert_eq!(broker.placed_orders(), 0);
}

#[tokio::test]
async fn jointly_breaching_orders_reject_the_second() {
    let limits = RiskLimits {
        max_position_pct: Decimal::from(35) / Decimal::from(100),
        max_total_exposure_pct: Decimal::from(50) / Decimal::from(100),
        ..loose_limits()
    };
    let (engine, broker) = engine_with(limits, flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    // Two resting buys of 27_000 notional each: individually inside the
    // 35_000 per-symbol cap, jointly past the 50_000 exposure cap.
    let first = engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, Some(90)),
            StrategyContext::new("test").with_quantity(Quantity::new(300)),
        )
        .await
        .unwrap();
    assert_eq!(first.status, OrderStatus::Submitted);

    let second = engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, Some(90)),
            StrategyContext::new("test").with_quantity(Quantity::new(300)),
        )
        .await
        .unwrap();

    assert_eq!(second.status, OrderStatus::Rejected);
    assert!(second.reason.as_deref().unwrap_or("").contains("exposure"));
    assert_eq!(broker.placed_orders(), 1);
}

#[tokio::test]
async fn buy_then_sell_round_trip_removes_the_position() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();
    let events = engine.subscribe();

    engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, None),
            StrategyContext::new("test").with_quantity(Quantity::new(3)),
        )
        .await
        .unwrap();
    drain_fills(&engine, &broker).await;
    assert_eq!(engine.positions().len(), 1);

    let close = engine.close_position(&symbol).await.unwrap();
    assert_eq!(close.quantity.as_decimal(), Decimal::from(3));
    drain_fills(&engine, &broker).await;

    assert!(engine.positions().is_empty(), "closed position must be removed");
    assert_eq!(engine.realized_pnl(), Decimal::ZERO);

    let mut saw_open = false;
    let mut saw_close = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::PositionOpened(_) => saw_open = true,
            EngineEvent::PositionClosed { .. } => saw_close = true,
            _ => {}
        }
    }
    assert!(saw_open && saw_close, "lifecycle events must be emitted");
}

#[tokio::test]
async fn ambiguous_submission_is_resolved_by_reconciliation() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    broker.inject_fault(PaperFault::Ambiguous);
    let order = engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, None),
            StrategyContext::new("test").with_quantity(Quantity::new(1)),
        )
        .await
        .unwrap();

    // Never assume "no response" means "not executed"
    assert_eq!(order.status, OrderStatus::PendingConfirmation);
    assert_eq!(broker.placed_orders(), 1);

    let resolved = engine.reconcile().await.unwrap();
    assert_eq!(resolved, 1);
    assert_eq!(
        engine.order(&order.id).unwrap().status,
        OrderStatus::Submitted
    );

    // The execution the venue performed during the lost-response window
    drain_fills(&engine, &broker).await;
    assert_eq!(engine.order(&order.id).unwrap().status, OrderStatus::Filled);
    assert_eq!(engine.positions().len(), 1);
}

#[tokio::test]
async fn transient_failure_releases_the_token_for_retry() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    let token = ClientToken::generate();
    let buy = signal(&symbol, SignalAction::Buy, None);
    let ctx = || {
        StrategyContext::new("test")
            .with_token(token)
            .with_quantity(Quantity::new(1))
    };

    broker.inject_fault(PaperFault::Transient);
    let first = engine.submit_order(&buy, ctx()).await;
    assert!(matches!(
        first,
        Err(Error::Broker(BrokerError::Transient(_)))
    ));
    assert_eq!(broker.placed_orders(), 0);
    assert!(engine.open_orders().is_empty(), "failed order is withdrawn");

    // Same token, legitimate retry
    let retry = engine.submit_order(&buy, ctx()).await.unwrap();
    assert_eq!(retry.status, OrderStatus::Submitted);
    assert_eq!(broker.placed_orders(), 1);
}

#[tokio::test]
async fn resting_limit_order_cancels_cleanly() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    let order = engine
        .submit_order(
            &signal(&symbol, SignalAction::Buy, Some(90)),
            StrategyContext::new("test").with_quantity(Quantity::new(1)),
        )
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Submitted);

    let cancelled = engine.cancel_order(&order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(engine.open_orders().is_empty());

    // Cancelling again is a caller fault
    assert!(matches!(
        engine.cancel_order(&order.id).await,
        Err(Error::InvalidState(_))
    ));
}

#[tokio::test]
async fn resubmission_after_outcome_returns_the_recorded_order() {
    let (engine, broker) = engine_with(loose_limits(), flat_paper());
    let symbol = Symbol::new("BTC/USDT");
    broker.set_price(&symbol, Decimal::from(100));
    engine.bootstrap().await.unwrap();

    let token = ClientToken::generate();
    let buy = signal(&symbol, SignalAction::Buy, None);

    let first = engine
        .submit_order(
            &buy,
            StrategyContext::new("test")
                .with_token(token)
                .with_quantity(Quantity::new(1)),
        )
        .await
        .unwrap();

    // A later retry (e.g. after a client crash) must not double-submit
    let second = engine
        .submit_order(
            &buy,
            StrategyContext::new("test")
                .with_token(token)
                .with_quantity(Quantity::new(1)),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(broker.placed_orders(), 1);
}
