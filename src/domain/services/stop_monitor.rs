//! Stop-loss monitor
//!
//! Polls open positions that carry an armed stop, fetches a live quote
//! for each, and places a full-quantity market sell when the price
//! touches the stop. Per-symbol states: Watching → (trigger) →
//! ExitRequested → (fill confirmed) → removed. A quote failure leaves
//! the symbol Watching for the next tick; a failed exit order leaves it
//! ExitRequested so the sell is retried with a fresh quote.

use super::analytics::StrategyAnalytics;
use super::backfill::PnlBackfill;
use super::reconciler::BalanceReconciler;
use crate::domain::repositories::quote_source::QuoteSource;
use crate::domain::value_objects::price::Price;
use crate::persistence::models::PlaceOrder;
use crate::persistence::{DatabaseError, LedgerStore};
use crate::domain::entities::order::OrderSide;
use crate::ticker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub quote_timeout: Duration,
    pub storage_timeout: Duration,
    /// Emit a status line every this many ticks.
    pub status_every_ticks: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            quote_timeout: Duration::from_secs(10),
            storage_timeout: Duration::from_secs(5),
            status_every_ticks: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Watching,
    ExitRequested,
}

/// A stop that fired and was sold this cycle.
#[derive(Debug, Clone)]
pub struct TriggeredExit {
    pub symbol: String,
    pub quantity: f64,
    pub exit_price: f64,
    pub stop_loss: f64,
    pub entry_price: f64,
    pub estimated_pnl: f64,
    pub estimated_pnl_pct: f64,
}

/// Result of one monitoring pass.
#[derive(Debug, Clone, Default)]
pub struct MonitorCycle {
    pub monitored: usize,
    pub exits: Vec<TriggeredExit>,
}

pub struct StopLossMonitor {
    store: Arc<dyn LedgerStore>,
    quotes: Arc<dyn QuoteSource>,
    reconciler: Arc<BalanceReconciler>,
    analytics: Arc<StrategyAnalytics>,
    backfill: Arc<PnlBackfill>,
    config: MonitorConfig,
    states: Mutex<HashMap<String, WatchState>>,
}

impl StopLossMonitor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        quotes: Arc<dyn QuoteSource>,
        reconciler: Arc<BalanceReconciler>,
        analytics: Arc<StrategyAnalytics>,
        backfill: Arc<PnlBackfill>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            quotes,
            reconciler,
            analytics,
            backfill,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// One monitoring pass over every position with an armed stop.
    pub async fn check_once(&self) -> Result<MonitorCycle, DatabaseError> {
        let positions = match timeout(
            self.config.storage_timeout,
            self.store.positions_with_stop_loss(),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(DatabaseError::Unavailable(
                    "position scan timed out".to_string(),
                ))
            }
        };

        let mut states = self.states.lock().await;
        let live: Vec<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
        states.retain(|symbol, _| live.contains(&symbol.as_str()));

        let mut cycle = MonitorCycle {
            monitored: positions.len(),
            ..MonitorCycle::default()
        };

        for record in &positions {
            let mut position = match record.to_entity() {
                Ok(position) => position,
                Err(e) => {
                    warn!("Skipping malformed position row {}: {}", record.symbol, e);
                    continue;
                }
            };

            let quote = match timeout(
                self.config.quote_timeout,
                self.quotes.get_quote(&record.symbol),
            )
            .await
            {
                Ok(Ok(quote)) => quote,
                Ok(Err(e)) => {
                    debug!("No quote for {} this tick: {}", record.symbol, e);
                    continue;
                }
                Err(_) => {
                    debug!("Quote for {} timed out this tick", record.symbol);
                    continue;
                }
            };

            if let Err(e) = self
                .store
                .update_position_price(&record.symbol, quote.price)
                .await
            {
                warn!("Failed to update mark for {}: {}", record.symbol, e);
            }

            let mark = match Price::new(quote.price) {
                Ok(mark) => mark,
                Err(e) => {
                    warn!("Ignoring bad quote for {}: {}", record.symbol, e);
                    continue;
                }
            };
            position.update_price(mark);

            let state = states
                .get(record.symbol.as_str())
                .copied()
                .unwrap_or(WatchState::Watching);

            if !position.should_stop_loss() && state != WatchState::ExitRequested {
                continue;
            }

            let stop_loss = record.stop_loss.unwrap_or(0.0);
            info!(
                "Stop-loss triggered for {}: ${:.2} <= ${:.2}",
                record.symbol, quote.price, stop_loss
            );
            states.insert(record.symbol.clone(), WatchState::ExitRequested);

            let sell = PlaceOrder {
                symbol: record.symbol.clone(),
                side: OrderSide::Sell,
                quantity: record.quantity,
                price: quote.price,
                strategy: record.strategy.clone(),
                reason: Some("stop_loss".to_string()),
            };

            let placed = match timeout(self.config.storage_timeout, self.store.place_order(&sell))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(DatabaseError::Unavailable("order timed out".to_string())),
            };

            match placed {
                Ok(order) => {
                    let estimated_pnl = (quote.price - record.entry_price) * record.quantity;
                    let estimated_pnl_pct = if record.entry_price > 0.0 {
                        (quote.price - record.entry_price) / record.entry_price * 100.0
                    } else {
                        0.0
                    };
                    info!(
                        "Stop-loss exit: sold {} {} @ ${:.2} (entry ${:.2}, stop ${:.2}) \
                         est. P&L ${:.2} ({:+.2}%), order {}",
                        record.quantity,
                        record.symbol,
                        quote.price,
                        record.entry_price,
                        stop_loss,
                        estimated_pnl,
                        estimated_pnl_pct,
                        order.id
                    );
                    states.remove(record.symbol.as_str());
                    cycle.exits.push(TriggeredExit {
                        symbol: record.symbol.clone(),
                        quantity: record.quantity,
                        exit_price: quote.price,
                        stop_loss,
                        entry_price: record.entry_price,
                        estimated_pnl,
                        estimated_pnl_pct,
                    });

                    self.after_exit(&record.symbol, record.strategy.as_deref())
                        .await;
                }
                Err(DatabaseError::ConstraintViolation(e)) => {
                    // The position changed under us; stand down
                    warn!("Stop-loss sell for {} rejected: {}", record.symbol, e);
                    states.remove(record.symbol.as_str());
                }
                Err(e) => {
                    warn!(
                        "Stop-loss sell for {} failed, will retry next tick: {}",
                        record.symbol, e
                    );
                }
            }
        }

        Ok(cycle)
    }

    /// Keep derived state current after a fill: realized P&L for the
    /// symbol, the strategy's metrics, and the account total.
    async fn after_exit(&self, symbol: &str, strategy: Option<&str>) {
        if let Err(e) = self.backfill.backfill_symbol(symbol).await {
            warn!("Post-exit P&L backfill for {} failed: {}", symbol, e);
        }
        if let Some(strategy) = strategy {
            match self.analytics.update_strategy_performance(strategy).await {
                Ok(_) => {
                    if let Ok(Some(reason)) = self.analytics.should_optimize(strategy).await {
                        warn!("Strategy {} flagged for optimization: {}", strategy, reason);
                    }
                }
                Err(e) => warn!("Post-exit analytics for {} failed: {}", strategy, e),
            }
        }
        if let Err(e) = self.reconciler.reconcile_now().await {
            warn!("Post-exit reconcile failed: {}", e);
        }
    }

    /// Polling loop. Shutdown lets an in-flight pass finish rather than
    /// aborting mid-sell.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: watch::Receiver<bool>) {
        let status_every = self.config.status_every_ticks.max(1);
        let ticks = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let monitor = self.clone();

        ticker::run_every("stop-loss-monitor", period, shutdown, move || {
            let monitor = monitor.clone();
            let ticks = ticks.clone();
            async move {
                let cycle = monitor.check_once().await.map_err(|e| e.to_string())?;
                let n = ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                if n % status_every == 0 {
                    info!(
                        "Monitoring {} position(s) with stop-loss",
                        cycle.monitored
                    );
                }
                Ok(())
            }
        })
        .await;
    }
}
