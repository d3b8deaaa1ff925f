//! Ledger End-to-End Tests
//!
//! Exercises the full stack (store, reconciler, FIFO backfill,
//! analytics, and the stop-loss monitor) against an in-memory SQLite
//! backend with a mock quote feed.

use async_trait::async_trait;
use chrono::Utc;
use kestrel::domain::entities::order::OrderSide;
use kestrel::domain::repositories::quote_source::{Quote, QuoteError, QuoteSource};
use kestrel::domain::services::analytics::{OptimizationThresholds, StrategyAnalytics};
use kestrel::domain::services::backfill::PnlBackfill;
use kestrel::domain::services::reconciler::{BalanceReconciler, ReconcilerConfig};
use kestrel::domain::services::stop_monitor::{MonitorConfig, StopLossMonitor};
use kestrel::persistence::models::{OrderFilter, PlaceOrder};
use kestrel::persistence::{self, LedgerStore};
use std::collections::HashMap;
use std::sync::Arc;

struct StaticQuotes {
    prices: HashMap<String, f64>,
}

impl StaticQuotes {
    fn new(prices: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(Self {
            prices: prices.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
        })
    }
}

#[async_trait]
impl QuoteSource for StaticQuotes {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, QuoteError> {
        match self.prices.get(symbol) {
            Some(&price) => Ok(Quote {
                symbol: symbol.to_string(),
                price,
                timestamp: Utc::now(),
            }),
            None => Err(QuoteError::NotFound(symbol.to_string())),
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

async fn open_store() -> Arc<dyn LedgerStore> {
    persistence::connect("sqlite::memory:").await.unwrap()
}

fn order(side: OrderSide, symbol: &str, qty: f64, price: f64, strategy: Option<&str>) -> PlaceOrder {
    PlaceOrder {
        symbol: symbol.to_string(),
        side,
        quantity: qty,
        price,
        strategy: strategy.map(|s| s.to_string()),
        reason: None,
    }
}

#[tokio::test]
async fn discrepancy_detected_and_healed_end_to_end() {
    let store = open_store().await;
    store.init_account(10000.0).await.unwrap();

    // Spend half the cash, then let the market quadruple the position:
    // stored total is still the seeded 10,000
    store
        .place_order(&order(OrderSide::Buy, "NVDA", 100.0, 50.0, None))
        .await
        .unwrap();
    store.update_position_price("NVDA", 348.50).await.unwrap();

    let reconciler = BalanceReconciler::new(store.clone(), None, ReconcilerConfig::default());

    let check = reconciler.check().await.unwrap();
    assert!(check.flagged);
    assert!((check.drift - 29850.0).abs() < 0.01);

    let healed = reconciler.reconcile_now().await.unwrap();
    assert!((healed.snapshot.computed_total - 39850.0).abs() < 0.01);

    let account = store.get_account().await.unwrap().unwrap();
    assert!((account.total_value - 39850.0).abs() < 0.01);

    let recheck = reconciler.check().await.unwrap();
    assert!(!recheck.flagged);
    assert!(recheck.drift.abs() < 0.01);
}

#[tokio::test]
async fn total_value_matches_components_after_any_order_sequence() {
    let store = open_store().await;
    store.init_account(50000.0).await.unwrap();

    store
        .place_order(&order(OrderSide::Buy, "AAPL", 30.0, 180.0, None))
        .await
        .unwrap();
    store
        .place_order(&order(OrderSide::Buy, "TSLA", 20.0, 400.0, None))
        .await
        .unwrap();
    store
        .place_order(&order(OrderSide::Sell, "AAPL", 10.0, 190.0, None))
        .await
        .unwrap();
    store
        .place_order(&order(OrderSide::Buy, "AAPL", 5.0, 175.0, None))
        .await
        .unwrap();
    store.update_position_price("TSLA", 385.0).await.unwrap();

    let reconciler = BalanceReconciler::new(store.clone(), None, ReconcilerConfig::default());
    reconciler.reconcile_now().await.unwrap();

    let account = store.get_account().await.unwrap().unwrap();
    let positions = store.get_positions().await.unwrap();
    let components: f64 = positions.iter().map(|p| p.market_value()).sum::<f64>() + account.cash;
    assert!((account.total_value - components).abs() < 0.01);
}

#[tokio::test]
async fn fifo_backfill_consumes_oldest_lots_and_is_idempotent() {
    let store = open_store().await;
    store.init_account(100000.0).await.unwrap();

    store
        .place_order(&order(OrderSide::Buy, "TSLA", 50.0, 400.0, None))
        .await
        .unwrap();
    store
        .place_order(&order(OrderSide::Buy, "TSLA", 50.0, 410.0, None))
        .await
        .unwrap();
    store
        .place_order(&order(OrderSide::Sell, "TSLA", 100.0, 430.0, None))
        .await
        .unwrap();

    let backfill = PnlBackfill::new(store.clone());
    let plan = backfill.plan().await.unwrap();
    assert_eq!(plan.updates.len(), 1);
    assert!((plan.updates[0].new_pnl - 2500.0).abs() < 1e-9);
    backfill.apply(&plan).await.unwrap();

    let sells = store
        .get_orders(&OrderFilter {
            side: Some(OrderSide::Sell),
            ..OrderFilter::default()
        })
        .await
        .unwrap();
    assert!((sells[0].realized_pnl - 2500.0).abs() < 1e-9);

    // Unchanged history: a second replay writes nothing and changes nothing
    let second = backfill.plan().await.unwrap();
    assert!(second.is_empty());
    let sells_again = store
        .get_orders(&OrderFilter {
            side: Some(OrderSide::Sell),
            ..OrderFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(sells_again[0].realized_pnl, sells[0].realized_pnl);
}

fn build_monitor(
    store: Arc<dyn LedgerStore>,
    quotes: Arc<dyn QuoteSource>,
) -> StopLossMonitor {
    let reconciler = Arc::new(BalanceReconciler::new(
        store.clone(),
        Some(quotes.clone()),
        ReconcilerConfig::default(),
    ));
    let analytics = Arc::new(StrategyAnalytics::new(
        store.clone(),
        OptimizationThresholds::default(),
        10000.0,
    ));
    let backfill = Arc::new(PnlBackfill::new(store.clone()));
    StopLossMonitor::new(
        store,
        quotes,
        reconciler,
        analytics,
        backfill,
        MonitorConfig::default(),
    )
}

#[tokio::test]
async fn stop_loss_exit_keeps_ledger_consistent() {
    let store = open_store().await;
    store.init_account(10000.0).await.unwrap();
    store
        .place_order(&order(OrderSide::Buy, "AAPL", 10.0, 100.0, Some("breakout")))
        .await
        .unwrap();
    store
        .set_position_stops("AAPL", Some(95.0), None)
        .await
        .unwrap();

    let monitor = build_monitor(store.clone(), StaticQuotes::new(&[("AAPL", 94.0)]));
    let cycle = monitor.check_once().await.unwrap();
    assert_eq!(cycle.exits.len(), 1);

    // Exactly one full-quantity sell; the position is gone
    let orders = store.get_orders(&OrderFilter::all()).await.unwrap();
    let sells: Vec<_> = orders.iter().filter(|o| o.side == "sell").collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].quantity, 10.0);
    assert_eq!(sells[0].reason.as_deref(), Some("stop_loss"));
    assert!(store.get_position("AAPL").await.unwrap().is_none());

    // Realized P&L was backfilled and the balance invariant holds
    assert!((sells[0].realized_pnl - -60.0).abs() < 1e-9);
    let check = store.check_balance().await.unwrap();
    assert!(check.drift().abs() < 0.01);
    let account = store.get_account().await.unwrap().unwrap();
    assert!((account.cash - (10000.0 - 1000.0 + 940.0)).abs() < 0.01);
}

#[tokio::test]
async fn five_straight_losses_flag_the_strategy() {
    let store = open_store().await;
    store.init_account(100000.0).await.unwrap();

    for _ in 0..5 {
        store
            .place_order(&order(OrderSide::Buy, "GME", 10.0, 100.0, Some("meme_momo")))
            .await
            .unwrap();
        store
            .place_order(&order(OrderSide::Sell, "GME", 10.0, 90.0, Some("meme_momo")))
            .await
            .unwrap();
    }

    let backfill = PnlBackfill::new(store.clone());
    let plan = backfill.plan().await.unwrap();
    backfill.apply(&plan).await.unwrap();

    let analytics = StrategyAnalytics::new(
        store.clone(),
        OptimizationThresholds::default(),
        10000.0,
    );
    let record = analytics
        .update_strategy_performance("meme_momo")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.total_trades, 5);
    assert_eq!(record.consecutive_losses, 5);
    assert!(record.total_pnl < 0.0);

    let reason = analytics.should_optimize("meme_momo").await.unwrap();
    assert_eq!(reason.unwrap(), "5 consecutive losses");
}

#[tokio::test]
async fn oversell_rejected_without_side_effects() {
    let store = open_store().await;
    store.init_account(10000.0).await.unwrap();
    store
        .place_order(&order(OrderSide::Buy, "AMD", 5.0, 100.0, None))
        .await
        .unwrap();

    let result = store
        .place_order(&order(OrderSide::Sell, "AMD", 6.0, 100.0, None))
        .await;
    assert!(result.is_err());

    let orders = store.get_orders(&OrderFilter::all()).await.unwrap();
    assert_eq!(orders.len(), 1);
    let account = store.get_account().await.unwrap().unwrap();
    assert!((account.cash - 9500.0).abs() < 0.01);
}
