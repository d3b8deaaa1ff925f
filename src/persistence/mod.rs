//! Persistence Layer
//!
//! Database persistence for the paper-trading ledger: the account
//! singleton, open positions, the append-only order history, performance
//! snapshots, and per-strategy metrics. Backed by SQLite for embedded use
//! and PostgreSQL for shared client/server deployments, both through sqlx
//! with async operations.
//!
//! # Schema
//!
//! ## account (singleton, id = 1)
//! - cash, total_value, last_updated
//!
//! ## positions
//! - symbol (PK), quantity, entry_price (weighted-average cost),
//!   current_price, stop_loss?, profit_target?, strategy?,
//!   classification?, entry_date, last_updated
//!
//! ## orders (append-only)
//! - id (PK autoincrement), symbol, side (buy|sell), quantity, price,
//!   timestamp, realized_pnl (default 0, backfill-only), strategy?, reason?
//!
//! ## performance (append-only time series)
//! - timestamp (PK), total_value, cash, positions_value
//!
//! ## strategy_performance
//! - strategy_id (PK), trade counts, streaks, P&L, win_rate,
//!   profit_factor, drawdowns, roi_pct, last_updated

pub mod models;
pub mod postgres;
pub mod sqlite;
pub mod store;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

pub use models::{
    AccountRecord, BalanceSnapshot, OrderFilter, OrderRecord, PerformanceRecord, PlaceOrder,
    PositionRecord, StrategyPerformanceRecord,
};
pub use postgres::PostgresLedgerStore;
pub use sqlite::SqliteLedgerStore;
pub use store::LedgerStore;

/// Storage failure taxonomy. `Unavailable` is transient and retried by
/// the owning loop's next tick; `ConstraintViolation` is rejected before
/// commit and never retried.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),
}

impl DatabaseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Unavailable(_))
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DatabaseError::Unavailable(e.to_string()),
            sqlx::Error::Database(db)
                if db.is_unique_violation()
                    || db.is_foreign_key_violation()
                    || db.is_check_violation() =>
            {
                DatabaseError::ConstraintViolation(e.to_string())
            }
            _ => DatabaseError::Query(e.to_string()),
        }
    }
}

/// Connect to the backend named by the URL and run migrations.
///
/// `sqlite://path` or `sqlite::memory:` selects the embedded store;
/// `postgres://...` selects the client/server store.
pub async fn connect(database_url: &str) -> Result<Arc<dyn LedgerStore>, DatabaseError> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        info!("Initializing PostgreSQL ledger store");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = PostgresLedgerStore::new(pool);
        store.run_migrations().await?;
        info!("✓ PostgreSQL ledger store ready");
        Ok(Arc::new(store))
    } else {
        info!("Initializing SQLite ledger store: {}", database_url);

        // Ensure the data directory exists for file-backed databases
        if let Some(db_path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Unavailable(format!("cannot create data dir: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| DatabaseError::Query(e.to_string()))?
            .create_if_missing(true);

        // A :memory: database exists per connection; the pool must not
        // hand out a second one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = SqliteLedgerStore::new(pool);
        store.run_migrations().await?;
        info!("✓ SQLite ledger store ready");
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let store = connect("sqlite::memory:").await;
        assert!(store.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteLedgerStore::new(pool.clone());
        store.run_migrations().await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('account', 'positions', 'orders', 'performance', 'strategy_performance')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 5);
    }
}
