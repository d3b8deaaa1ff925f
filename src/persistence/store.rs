//! Ledger store interface
//!
//! One storage-backend contract for every component that reads or writes
//! ledger state. Two parallel implementations exist: SQLite for the
//! embedded file store and PostgreSQL for the client/server deployment,
//! each using its backend's native parameter syntax and locking. The
//! backend is chosen at construction time from the database URL.

use super::models::{
    AccountRecord, BalanceSnapshot, OrderFilter, OrderRecord, PerformanceRecord, PlaceOrder,
    PositionRecord, StrategyPerformanceRecord,
};
use super::DatabaseError;
use async_trait::async_trait;

/// Storage contract for the paper-trading ledger.
///
/// `place_order` and `reconcile_account` are the two transactional
/// operations: each runs as one atomic unit against the backend so that
/// concurrent loops (monitor, reconciler, order intake) serialize through
/// the database rather than an application mutex.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Seed the singleton account row if it does not exist yet.
    /// Returns the row either way.
    async fn init_account(&self, initial_cash: f64) -> Result<AccountRecord, DatabaseError>;

    async fn get_account(&self) -> Result<Option<AccountRecord>, DatabaseError>;

    async fn get_positions(&self) -> Result<Vec<PositionRecord>, DatabaseError>;

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionRecord>, DatabaseError>;

    /// Positions carrying an armed stop (stop_loss set and > 0).
    async fn positions_with_stop_loss(&self) -> Result<Vec<PositionRecord>, DatabaseError>;

    /// Refresh the mark price on one position row.
    async fn update_position_price(&self, symbol: &str, price: f64) -> Result<(), DatabaseError>;

    /// Arm or clear the stop-loss / profit-target on one position.
    async fn set_position_stops(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        profit_target: Option<f64>,
    ) -> Result<(), DatabaseError>;

    /// Execute an order as one atomic unit: append the order row, upsert
    /// the position (weighted-average on buy; decrement and delete-at-zero
    /// on sell), and adjust cash. Fails with `ConstraintViolation` before
    /// any write when the input is invalid or a sell exceeds the held
    /// quantity.
    async fn place_order(&self, order: &PlaceOrder) -> Result<OrderRecord, DatabaseError>;

    /// Order history matching the filter, ascending by (timestamp, id):
    /// the replay order the FIFO engine depends on.
    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderRecord>, DatabaseError>;

    /// Backfill a previously-zero `realized_pnl`. Returns false when the
    /// row is missing or already carries a non-zero value; no other order
    /// column can be modified through any store operation.
    async fn update_order_pnl(&self, order_id: i64, realized_pnl: f64)
        -> Result<bool, DatabaseError>;

    /// Recompute `cash + Σ quantity × current_price` over a consistent
    /// snapshot and overwrite the stored `total_value` with it, all inside
    /// one transaction. Returns the snapshot with the pre-overwrite stored
    /// total so callers can report drift.
    async fn reconcile_account(&self) -> Result<BalanceSnapshot, DatabaseError>;

    /// Same computation as `reconcile_account` but read-only.
    async fn check_balance(&self) -> Result<BalanceSnapshot, DatabaseError>;

    async fn record_performance_snapshot(
        &self,
        snapshot: &BalanceSnapshot,
    ) -> Result<(), DatabaseError>;

    /// Drop performance rows older than the retention window. Returns the
    /// number of rows removed.
    async fn prune_performance(&self, older_than_days: i64) -> Result<u64, DatabaseError>;

    async fn get_performance_history(
        &self,
        limit: i64,
    ) -> Result<Vec<PerformanceRecord>, DatabaseError>;

    async fn get_strategy_performance(
        &self,
        strategy_id: &str,
    ) -> Result<Option<StrategyPerformanceRecord>, DatabaseError>;

    async fn list_strategy_performance(
        &self,
    ) -> Result<Vec<StrategyPerformanceRecord>, DatabaseError>;

    async fn upsert_strategy_performance(
        &self,
        record: &StrategyPerformanceRecord,
    ) -> Result<(), DatabaseError>;
}
