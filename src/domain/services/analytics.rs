//! Strategy analytics
//!
//! Aggregates a strategy's closed trades into win rate, profit factor,
//! drawdown, consecutive-loss streak, and ROI, and evaluates the
//! optimization triggers that decide when a strategy should be handed to
//! the (out-of-scope) optimizer. The metric math is pure; the service
//! wrapper loads closed trades from the store and upserts the
//! `strategy_performance` row.

use crate::persistence::models::{OrderFilter, StrategyPerformanceRecord};
use crate::persistence::{DatabaseError, LedgerStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// One closed trade attributed to a strategy.
#[derive(Debug, Clone)]
pub struct ClosedTrade {
    pub pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// Thresholds for the optimization-trigger predicate. Configuration
/// values, not constants: see `LedgerConfig`.
#[derive(Debug, Clone)]
pub struct OptimizationThresholds {
    /// Trailing losing streak that flags a strategy on its own.
    pub consecutive_loss_limit: i64,
    /// Minimum sample size before win-rate and total-P&L triggers apply.
    pub min_trades_for_stats: i64,
    /// Win rate below this (with enough trades) flags the strategy.
    pub win_rate_floor: f64,
    /// Current drawdown above this flags the strategy.
    pub drawdown_limit: f64,
}

impl Default for OptimizationThresholds {
    fn default() -> Self {
        Self {
            consecutive_loss_limit: 5,
            min_trades_for_stats: 20,
            win_rate_floor: 0.40,
            drawdown_limit: 0.15,
        }
    }
}

/// Computed metrics over one strategy's closed trades.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyMetrics {
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub consecutive_losses: i64,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub current_drawdown: f64,
    pub roi_pct: f64,
}

impl StrategyMetrics {
    /// Weight consumed by the capital-allocation component.
    pub fn performance_weight(&self) -> f64 {
        self.win_rate
    }

    pub fn to_record(&self, strategy_id: &str) -> StrategyPerformanceRecord {
        StrategyPerformanceRecord {
            strategy_id: strategy_id.to_string(),
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            consecutive_losses: self.consecutive_losses,
            total_pnl: self.total_pnl,
            win_rate: self.win_rate,
            profit_factor: self.profit_factor,
            max_drawdown: self.max_drawdown,
            current_drawdown: self.current_drawdown,
            roi_pct: self.roi_pct,
            last_updated: Utc::now(),
        }
    }

    pub fn from_record(record: &StrategyPerformanceRecord) -> Self {
        Self {
            total_trades: record.total_trades,
            winning_trades: record.winning_trades,
            losing_trades: record.losing_trades,
            consecutive_losses: record.consecutive_losses,
            total_pnl: record.total_pnl,
            win_rate: record.win_rate,
            profit_factor: record.profit_factor,
            max_drawdown: record.max_drawdown,
            current_drawdown: record.current_drawdown,
            roi_pct: record.roi_pct,
        }
    }
}

/// Compute all metrics for a list of closed trades ordered by time.
pub fn compute_metrics(trades: &[ClosedTrade], initial_allocation: f64) -> StrategyMetrics {
    let total_trades = trades.len() as i64;
    let winning_trades = trades.iter().filter(|t| t.pnl > 0.0).count() as i64;
    let losing_trades = trades.iter().filter(|t| t.pnl < 0.0).count() as i64;
    let total_pnl: f64 = trades.iter().map(|t| t.pnl).sum();

    let win_rate = if total_trades > 0 {
        winning_trades as f64 / total_trades as f64
    } else {
        0.0
    };

    let (max_drawdown, current_drawdown) = drawdowns(trades);

    let roi_pct = if initial_allocation > 0.0 {
        total_pnl / initial_allocation * 100.0
    } else {
        0.0
    };

    StrategyMetrics {
        total_trades,
        winning_trades,
        losing_trades,
        consecutive_losses: consecutive_losses(trades),
        total_pnl,
        win_rate,
        profit_factor: profit_factor(trades),
        max_drawdown,
        current_drawdown,
        roi_pct,
    }
}

/// Trailing losing streak, most recent trade first, stopping at the first
/// non-negative trade.
fn consecutive_losses(trades: &[ClosedTrade]) -> i64 {
    trades.iter().rev().take_while(|t| t.pnl < 0.0).count() as i64
}

/// Gross profit over gross loss. With zero gross loss the result is the
/// gross profit itself when positive, else zero; never a division error.
fn profit_factor(trades: &[ClosedTrade]) -> f64 {
    let gross_profit: f64 = trades.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.pnl < 0.0)
        .map(|t| t.pnl.abs())
        .sum();

    if gross_loss == 0.0 {
        if gross_profit > 0.0 {
            gross_profit
        } else {
            0.0
        }
    } else {
        gross_profit / gross_loss
    }
}

/// Max and current drawdown over the cumulative-P&L series, each as
/// `(running_peak - value) / |running_peak|`.
fn drawdowns(trades: &[ClosedTrade]) -> (f64, f64) {
    if trades.is_empty() {
        return (0.0, 0.0);
    }

    let mut cumulative = Vec::with_capacity(trades.len());
    let mut running = 0.0;
    for trade in trades {
        running += trade.pnl;
        cumulative.push(running);
    }

    let mut max_drawdown: f64 = 0.0;
    let mut peak = cumulative[0];
    for &value in &cumulative {
        if value > peak {
            peak = value;
        }
        let drawdown = if peak != 0.0 {
            (peak - value) / peak.abs()
        } else {
            0.0
        };
        max_drawdown = max_drawdown.max(drawdown);
    }

    let latest_peak = cumulative.iter().cloned().fold(f64::MIN, f64::max);
    let last = *cumulative.last().expect("non-empty");
    let current_drawdown = if latest_peak != 0.0 {
        (latest_peak - last) / latest_peak.abs()
    } else {
        0.0
    };

    (max_drawdown, current_drawdown)
}

/// Evaluate the optimization triggers. Returns the first matching reason,
/// or None when the strategy is healthy.
pub fn optimization_trigger(
    metrics: &StrategyMetrics,
    thresholds: &OptimizationThresholds,
) -> Option<String> {
    if metrics.consecutive_losses >= thresholds.consecutive_loss_limit {
        return Some(format!(
            "{} consecutive losses",
            thresholds.consecutive_loss_limit
        ));
    }

    if metrics.total_trades >= thresholds.min_trades_for_stats
        && metrics.win_rate < thresholds.win_rate_floor
    {
        return Some(format!(
            "Win rate {:.1}% below {:.0}%",
            metrics.win_rate * 100.0,
            thresholds.win_rate_floor * 100.0
        ));
    }

    if metrics.current_drawdown > thresholds.drawdown_limit {
        return Some(format!(
            "Drawdown {:.1}% above {:.0}%",
            metrics.current_drawdown * 100.0,
            thresholds.drawdown_limit * 100.0
        ));
    }

    if metrics.total_trades >= thresholds.min_trades_for_stats && metrics.total_pnl < 0.0 {
        return Some(format!("Negative P&L: ${:.2}", metrics.total_pnl));
    }

    None
}

/// Store-backed analytics: loads closed trades, computes metrics, and
/// keeps the `strategy_performance` table current.
pub struct StrategyAnalytics {
    store: Arc<dyn LedgerStore>,
    thresholds: OptimizationThresholds,
    initial_allocation: f64,
}

impl StrategyAnalytics {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        thresholds: OptimizationThresholds,
        initial_allocation: f64,
    ) -> Self {
        Self {
            store,
            thresholds,
            initial_allocation,
        }
    }

    async fn closed_trades(&self, strategy_id: &str) -> Result<Vec<ClosedTrade>, DatabaseError> {
        let sells = self
            .store
            .get_orders(&OrderFilter::sells_for_strategy(strategy_id))
            .await?;
        Ok(sells
            .into_iter()
            .map(|o| ClosedTrade {
                pnl: o.realized_pnl,
                timestamp: o.timestamp,
            })
            .collect())
    }

    /// Recompute and upsert all metrics for one strategy. Returns None
    /// when the strategy has no closed trades yet.
    pub async fn update_strategy_performance(
        &self,
        strategy_id: &str,
    ) -> Result<Option<StrategyPerformanceRecord>, DatabaseError> {
        let trades = self.closed_trades(strategy_id).await?;
        if trades.is_empty() {
            debug!("No closed trades for strategy {}", strategy_id);
            return Ok(None);
        }

        let metrics = compute_metrics(&trades, self.initial_allocation);
        let record = metrics.to_record(strategy_id);
        self.store.upsert_strategy_performance(&record).await?;

        info!(
            "Strategy {}: {} trades, {:.1}% win rate, ${:.2} P&L, weight {:.2}",
            strategy_id,
            metrics.total_trades,
            metrics.win_rate * 100.0,
            metrics.total_pnl,
            metrics.performance_weight()
        );
        Ok(Some(record))
    }

    /// Check the stored metrics against the optimization triggers.
    pub async fn should_optimize(
        &self,
        strategy_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let Some(record) = self.store.get_strategy_performance(strategy_id).await? else {
            return Ok(None);
        };
        Ok(optimization_trigger(
            &StrategyMetrics::from_record(&record),
            &self.thresholds,
        ))
    }

    /// All tracked strategies ranked by win rate.
    pub async fn leaderboard(&self) -> Result<Vec<StrategyPerformanceRecord>, DatabaseError> {
        self.store.list_strategy_performance().await
    }

    /// System-wide totals across every tracked strategy.
    pub async fn aggregate_statistics(&self) -> Result<AggregateStatistics, DatabaseError> {
        let rows = self.store.list_strategy_performance().await?;
        if rows.is_empty() {
            return Ok(AggregateStatistics::default());
        }

        let total_trades = rows.iter().map(|r| r.total_trades).sum();
        let total_pnl = rows.iter().map(|r| r.total_pnl).sum();
        let avg_win_rate = rows.iter().map(|r| r.win_rate).sum::<f64>() / rows.len() as f64;
        let best = rows
            .iter()
            .max_by(|a, b| a.win_rate.total_cmp(&b.win_rate))
            .map(|r| r.strategy_id.clone());
        let worst = rows
            .iter()
            .min_by(|a, b| a.win_rate.total_cmp(&b.win_rate))
            .map(|r| r.strategy_id.clone());

        Ok(AggregateStatistics {
            total_strategies: rows.len(),
            total_trades,
            total_pnl,
            avg_win_rate,
            best_strategy: best,
            worst_strategy: worst,
        })
    }
}

/// Totals across all tracked strategies.
#[derive(Debug, Clone, Default)]
pub struct AggregateStatistics {
    pub total_strategies: usize,
    pub total_trades: i64,
    pub total_pnl: f64,
    pub avg_win_rate: f64,
    pub best_strategy: Option<String>,
    pub worst_strategy: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trades(pnls: &[f64]) -> Vec<ClosedTrade> {
        pnls.iter()
            .enumerate()
            .map(|(i, &pnl)| ClosedTrade {
                pnl,
                timestamp: Utc::now() + chrono::Duration::seconds(i as i64),
            })
            .collect()
    }

    #[test]
    fn test_win_rate_no_trades() {
        let metrics = compute_metrics(&[], 10000.0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.profit_factor, 0.0);
    }

    #[test]
    fn test_zero_pnl_trade_is_not_a_win() {
        let metrics = compute_metrics(&trades(&[0.0, 100.0]), 10000.0);
        assert_eq!(metrics.winning_trades, 1);
        assert_eq!(metrics.losing_trades, 0);
        assert_eq!(metrics.win_rate, 0.5);
    }

    #[test]
    fn test_profit_factor_with_zero_losses() {
        let metrics = compute_metrics(&trades(&[100.0, 200.0]), 10000.0);
        assert_eq!(metrics.profit_factor, 300.0);
    }

    #[test]
    fn test_profit_factor_all_losses() {
        let metrics = compute_metrics(&trades(&[-100.0, -50.0]), 10000.0);
        assert_eq!(metrics.profit_factor, 0.0);
    }

    #[test]
    fn test_profit_factor_mixed() {
        let metrics = compute_metrics(&trades(&[300.0, -100.0, -50.0]), 10000.0);
        assert!((metrics.profit_factor - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_consecutive_losses_trailing_only() {
        let metrics = compute_metrics(&trades(&[-10.0, 50.0, -10.0, -20.0, -30.0]), 10000.0);
        assert_eq!(metrics.consecutive_losses, 3);
    }

    #[test]
    fn test_consecutive_losses_reset_by_breakeven() {
        let metrics = compute_metrics(&trades(&[-10.0, -20.0, 0.0]), 10000.0);
        assert_eq!(metrics.consecutive_losses, 0);
    }

    #[test]
    fn test_drawdown() {
        // Cumulative: 100, 200, 140, 180; peak 200, trough 140
        let metrics = compute_metrics(&trades(&[100.0, 100.0, -60.0, 40.0]), 10000.0);
        assert!((metrics.max_drawdown - 0.30).abs() < 1e-9);
        assert!((metrics.current_drawdown - 0.10).abs() < 1e-9);
    }

    #[test]
    fn test_roi() {
        let metrics = compute_metrics(&trades(&[500.0, 500.0]), 10000.0);
        assert!((metrics.roi_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_performance_weight_equals_win_rate() {
        let metrics = compute_metrics(&trades(&[100.0, -50.0]), 10000.0);
        assert_eq!(metrics.performance_weight(), metrics.win_rate);
    }

    #[test]
    fn test_trigger_consecutive_losses() {
        // Profitable overall, but five straight losses still trigger
        let metrics = compute_metrics(
            &trades(&[1000.0, -10.0, -10.0, -10.0, -10.0, -10.0]),
            10000.0,
        );
        let reason = optimization_trigger(&metrics, &OptimizationThresholds::default());
        assert_eq!(reason.unwrap(), "5 consecutive losses");
    }

    #[test]
    fn test_trigger_low_win_rate_needs_sample_size() {
        let thresholds = OptimizationThresholds::default();
        let mut metrics = StrategyMetrics {
            total_trades: 19,
            winning_trades: 6,
            losing_trades: 13,
            consecutive_losses: 2,
            total_pnl: 120.0,
            win_rate: 6.0 / 19.0,
            profit_factor: 1.1,
            max_drawdown: 0.05,
            current_drawdown: 0.02,
            roi_pct: 1.2,
        };

        // 19 trades: below the sample-size floor, no trigger
        assert_eq!(optimization_trigger(&metrics, &thresholds), None);

        // 20 trades at the same win rate: now flagged
        metrics.total_trades = 20;
        metrics.losing_trades = 14;
        metrics.win_rate = 6.0 / 20.0;
        let reason = optimization_trigger(&metrics, &thresholds).unwrap();
        assert!(reason.contains("Win rate"));
    }

    #[test]
    fn test_trigger_drawdown() {
        // Cumulative peaks at 1000 then falls to 800: 20% drawdown
        let metrics = compute_metrics(&trades(&[1000.0, -100.0, -100.0, 0.0]), 10000.0);
        let reason =
            optimization_trigger(&metrics, &OptimizationThresholds::default()).unwrap();
        assert!(reason.contains("Drawdown"));
    }

    #[test]
    fn test_trigger_negative_pnl_with_sample() {
        let thresholds = OptimizationThresholds {
            // Disarm the other triggers to isolate this one
            consecutive_loss_limit: 100,
            drawdown_limit: 10.0,
            ..OptimizationThresholds::default()
        };
        let mut pnls = vec![50.0, -60.0];
        pnls.extend(std::iter::repeat([50.0, -60.0]).take(9).flatten());
        let metrics = compute_metrics(&trades(&pnls), 10000.0);
        assert_eq!(metrics.total_trades, 20);
        assert!(metrics.total_pnl < 0.0);
        let reason = optimization_trigger(&metrics, &thresholds).unwrap();
        assert!(reason.contains("Negative P&L"));
    }

    #[test]
    fn test_no_trigger_when_healthy() {
        let metrics = compute_metrics(&trades(&[100.0, -20.0, 150.0, 80.0]), 10000.0);
        assert_eq!(
            optimization_trigger(&metrics, &OptimizationThresholds::default()),
            None
        );
    }
}
