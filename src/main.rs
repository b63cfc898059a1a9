use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

use tradekit::broker::{BrokerAdapter, BrokerRegistry, EnvCredentials};
use tradekit::config::{Config, RunMode};
use tradekit::engine::{EngineConfig, StrategyContext, TradingEngine};
use tradekit::indicators::IndicatorEngine;
use tradekit::store::MemoryStore;
use tradekit::strategy::{SignalLog, StrategyRegistry};
use tradekit::types::{MarketSample, MarketWindow, SignalAction, Symbol};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "tradekit.toml".to_string());
    let from_file = std::path::Path::new(&config_path).exists();
    let config = if from_file {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    // 1. Logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tradekit=debug", config.app.log_level)));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .init();

    if !from_file {
        tracing::warn!("no config at {}, using defaults", config_path);
    }
    tracing::info!(mode = ?config.app.mode, venue = ?config.broker.kind, "tradekit starting");
    if config.app.mode == RunMode::Live {
        tracing::warn!("live mode: orders will reach a real venue");
    }

    // 2. Resolve venue + strategies from the registries
    let broker = BrokerRegistry::with_defaults().build(&config.broker, &EnvCredentials)?;
    let strategy_registry = StrategyRegistry::with_defaults();
    let strategies = config
        .strategies
        .iter()
        .map(|settings| strategy_registry.build(settings))
        .collect::<Result<Vec<_>, _>>()?;
    if strategies.is_empty() {
        tracing::warn!("no strategies configured; running market tracking only");
    }

    // 3. Engine
    let store = Arc::new(MemoryStore::new());
    let engine = Arc::new(TradingEngine::new(
        broker.clone(),
        store,
        config.risk.clone(),
        EngineConfig::from_trading(&config.trading),
    ));
    engine.bootstrap().await?;

    let symbols: Vec<Symbol> = config
        .trading
        .symbols
        .iter()
        .map(|s| Symbol::new(s.as_str()))
        .collect();
    if let Some(leverage) = config.broker.default_leverage {
        for symbol in &symbols {
            if let Err(error) = broker.set_leverage(symbol, leverage).await {
                tracing::warn!(%symbol, %error, "failed to set leverage");
            }
        }
    }

    let _fill_loop = engine.spawn_fill_loop();
    let _reconcile_loop = engine
        .spawn_reconcile_loop(Duration::from_millis(config.trading.reconcile_interval_ms));

    // 4. Evaluation loop
    let indicators = IndicatorEngine::default();
    let signal_log = SignalLog::new(512);
    let mut windows: HashMap<Symbol, MarketWindow> = symbols
        .iter()
        .map(|s| {
            (
                s.clone(),
                MarketWindow::new(s.clone(), config.trading.window_capacity),
            )
        })
        .collect();

    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.trading.evaluation_interval_ms));
    tracing::info!(symbols = symbols.len(), strategies = strategies.len(), "entering trading loop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        for symbol in &symbols {
            let price = match broker.current_price(symbol).await {
                Ok(price) => price,
                Err(error) => {
                    tracing::warn!(%symbol, %error, "price fetch failed");
                    continue;
                }
            };

            let window = match windows.get_mut(symbol) {
                Some(window) => window,
                None => continue,
            };
            window.push(MarketSample {
                price: price.as_f64(),
                volume: 0.0,
                timestamp: chrono::Utc::now(),
            });
            indicators.invalidate(symbol);
            if let Err(error) = engine.update_mark(symbol, price).await {
                tracing::warn!(%symbol, %error, "mark update failed");
            }

            for strategy in &strategies {
                let signal = match strategy.evaluate(window, &indicators) {
                    Ok(signal) => signal,
                    Err(error) => {
                        tracing::warn!(strategy = strategy.name(), %error, "evaluation failed");
                        continue;
                    }
                };
                signal_log.record(signal.clone());
                if signal.action == SignalAction::Hold
                    || signal.confidence < config.trading.min_confidence
                {
                    continue;
                }

                tracing::info!(
                    strategy = strategy.name(),
                    %symbol,
                    action = %signal.action,
                    confidence = signal.confidence,
                    reason = %signal.reason,
                    "actionable signal"
                );
                match engine
                    .submit_order(&signal, StrategyContext::new(strategy.name()))
                    .await
                {
                    Ok(order) => {
                        tracing::info!(order = %order.id, status = %order.status, "order outcome")
                    }
                    Err(error) => tracing::warn!(%error, "submission failed"),
                }
            }
        }
    }

    // 5. Shutdown summary
    let positions = engine.positions();
    tracing::info!("shutting down");
    tracing::info!(
        realized_pnl = %engine.realized_pnl(),
        open_positions = positions.len(),
        open_orders = engine.open_orders().len(),
        duplicate_fills = engine.duplicate_fills(),
        "session summary"
    );
    for position in positions {
        tracing::info!(
            symbol = %position.symbol,
            side = %position.side,
            qty = %position.quantity,
            entry = %position.entry_price,
            unrealized = %position.unrealized_pnl,
            "open position"
        );
    }

    Ok(())
}
