//! PostgreSQL ledger store
//!
//! Client/server implementation for deployments where several process
//! instances share one backend. Uses PostgreSQL's native `$n`
//! placeholders and `SELECT ... FOR UPDATE` row locks so that concurrent
//! writers to the same account or position row serialize inside the
//! database, not in any single process.

use super::models::*;
use super::store::LedgerStore;
use super::DatabaseError;
use crate::domain::entities::order::OrderSide;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, error, warn};

const QTY_EPSILON: f64 = 1e-9;

pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account (
                id BIGINT PRIMARY KEY,
                cash DOUBLE PRECISION NOT NULL,
                total_value DOUBLE PRECISION NOT NULL DEFAULT 0,
                last_updated TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("account table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                quantity DOUBLE PRECISION NOT NULL CHECK(quantity > 0),
                entry_price DOUBLE PRECISION NOT NULL,
                current_price DOUBLE PRECISION NOT NULL,
                stop_loss DOUBLE PRECISION,
                profit_target DOUBLE PRECISION,
                strategy TEXT,
                classification TEXT,
                entry_date TIMESTAMPTZ NOT NULL,
                last_updated TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("positions table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id BIGSERIAL PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('buy', 'sell')),
                quantity DOUBLE PRECISION NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                realized_pnl DOUBLE PRECISION NOT NULL DEFAULT 0,
                strategy TEXT,
                reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("orders table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance (
                timestamp TIMESTAMPTZ PRIMARY KEY,
                total_value DOUBLE PRECISION NOT NULL,
                cash DOUBLE PRECISION NOT NULL,
                positions_value DOUBLE PRECISION NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("performance table: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS strategy_performance (
                strategy_id TEXT PRIMARY KEY,
                total_trades BIGINT NOT NULL DEFAULT 0,
                winning_trades BIGINT NOT NULL DEFAULT 0,
                losing_trades BIGINT NOT NULL DEFAULT 0,
                consecutive_losses BIGINT NOT NULL DEFAULT 0,
                total_pnl DOUBLE PRECISION NOT NULL DEFAULT 0,
                win_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
                profit_factor DOUBLE PRECISION NOT NULL DEFAULT 0,
                max_drawdown DOUBLE PRECISION NOT NULL DEFAULT 0,
                current_drawdown DOUBLE PRECISION NOT NULL DEFAULT 0,
                roi_pct DOUBLE PRECISION NOT NULL DEFAULT 0,
                last_updated TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("strategy_performance table: {}", e)))?;

        for index_sql in [
            "CREATE INDEX IF NOT EXISTS idx_orders_symbol_time ON orders(symbol, timestamp, id)",
            "CREATE INDEX IF NOT EXISTS idx_orders_strategy ON orders(strategy)",
            "CREATE INDEX IF NOT EXISTS idx_positions_strategy ON positions(strategy)",
        ] {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DatabaseError::Migration(format!("index: {}", e)))?;
        }

        debug!("PostgreSQL migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn init_account(&self, initial_cash: f64) -> Result<AccountRecord, DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO account (id, cash, total_value, last_updated) \
             VALUES (1, $1, $1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(initial_cash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let record = sqlx::query_as::<_, AccountRecord>("SELECT * FROM account WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_account(&self) -> Result<Option<AccountRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, AccountRecord>("SELECT * FROM account WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_positions(&self) -> Result<Vec<PositionRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions ORDER BY entry_date DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<PositionRecord>, DatabaseError> {
        let record =
            sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions WHERE symbol = $1")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn positions_with_stop_loss(&self) -> Result<Vec<PositionRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE stop_loss IS NOT NULL AND stop_loss > 0 \
             ORDER BY symbol",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn update_position_price(&self, symbol: &str, price: f64) -> Result<(), DatabaseError> {
        let rows = sqlx::query(
            "UPDATE positions SET current_price = $1, last_updated = $2 WHERE symbol = $3",
        )
        .bind(price)
        .bind(Utc::now())
        .bind(symbol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::Query(format!(
                "position not found: {}",
                symbol
            )));
        }
        Ok(())
    }

    async fn set_position_stops(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        profit_target: Option<f64>,
    ) -> Result<(), DatabaseError> {
        let rows = sqlx::query(
            "UPDATE positions SET stop_loss = $1, profit_target = $2, last_updated = $3 \
             WHERE symbol = $4",
        )
        .bind(stop_loss)
        .bind(profit_target)
        .bind(Utc::now())
        .bind(symbol)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::Query(format!(
                "position not found: {}",
                symbol
            )));
        }
        Ok(())
    }

    async fn place_order(&self, order: &PlaceOrder) -> Result<OrderRecord, DatabaseError> {
        order
            .validate()
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, AccountRecord>(
            "SELECT * FROM account WHERE id = 1 FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DatabaseError::Query("account not initialized; run `ledger init`".to_string())
        })?;

        let position = sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE symbol = $1 FOR UPDATE",
        )
        .bind(&order.symbol)
        .fetch_optional(&mut *tx)
        .await?;

        let gross = order.quantity * order.price;
        let new_cash = match order.side {
            OrderSide::Buy => {
                match &position {
                    Some(pos) => {
                        let new_qty = pos.quantity + order.quantity;
                        let new_avg = (pos.quantity * pos.entry_price + gross) / new_qty;
                        sqlx::query(
                            "UPDATE positions SET quantity = $1, entry_price = $2, \
                             current_price = $3, last_updated = $4 WHERE symbol = $5",
                        )
                        .bind(new_qty)
                        .bind(new_avg)
                        .bind(order.price)
                        .bind(now)
                        .bind(&order.symbol)
                        .execute(&mut *tx)
                        .await?;
                    }
                    None => {
                        sqlx::query(
                            "INSERT INTO positions (symbol, quantity, entry_price, \
                             current_price, strategy, entry_date, last_updated) \
                             VALUES ($1, $2, $3, $3, $4, $5, $5)",
                        )
                        .bind(&order.symbol)
                        .bind(order.quantity)
                        .bind(order.price)
                        .bind(&order.strategy)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                account.cash - gross
            }
            OrderSide::Sell => {
                let pos = position.ok_or_else(|| {
                    DatabaseError::ConstraintViolation(format!(
                        "no open position for {}",
                        order.symbol
                    ))
                })?;
                if order.quantity > pos.quantity + QTY_EPSILON {
                    return Err(DatabaseError::ConstraintViolation(format!(
                        "sell of {} {} exceeds held quantity {}",
                        order.quantity, order.symbol, pos.quantity
                    )));
                }

                let new_qty = pos.quantity - order.quantity;
                if new_qty <= QTY_EPSILON {
                    sqlx::query("DELETE FROM positions WHERE symbol = $1")
                        .bind(&order.symbol)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    sqlx::query(
                        "UPDATE positions SET quantity = $1, current_price = $2, \
                         last_updated = $3 WHERE symbol = $4",
                    )
                    .bind(new_qty)
                    .bind(order.price)
                    .bind(now)
                    .bind(&order.symbol)
                    .execute(&mut *tx)
                    .await?;
                }
                account.cash + gross
            }
        };

        if new_cash < 0.0 {
            warn!(
                "Cash went negative after {} {} {}: ${:.2}",
                order.side, order.quantity, order.symbol, new_cash
            );
        }

        let record = sqlx::query_as::<_, OrderRecord>(
            "INSERT INTO orders (symbol, side, quantity, price, timestamp, strategy, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.quantity)
        .bind(order.price)
        .bind(now)
        .bind(&order.strategy)
        .bind(&order.reason)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE account SET cash = $1, last_updated = $2 WHERE id = 1")
            .bind(new_cash)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            "Order {} filled: {} {} {} @ ${:.2}",
            record.id, record.side, record.quantity, record.symbol, record.price
        );
        Ok(record)
    }

    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderRecord>, DatabaseError> {
        let mut sql = String::from("SELECT * FROM orders");
        let mut clauses = Vec::new();
        let mut arg = 0usize;
        if filter.symbol.is_some() {
            arg += 1;
            clauses.push(format!("symbol = ${}", arg));
        }
        if filter.strategy.is_some() {
            arg += 1;
            clauses.push(format!("strategy = ${}", arg));
        }
        if filter.side.is_some() {
            arg += 1;
            clauses.push(format!("side = ${}", arg));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut query = sqlx::query_as::<_, OrderRecord>(&sql);
        if let Some(symbol) = &filter.symbol {
            query = query.bind(symbol.clone());
        }
        if let Some(strategy) = &filter.strategy {
            query = query.bind(strategy.clone());
        }
        if let Some(side) = filter.side {
            query = query.bind(side.as_str());
        }

        let records = query.fetch_all(&self.pool).await?;
        Ok(records)
    }

    async fn update_order_pnl(
        &self,
        order_id: i64,
        realized_pnl: f64,
    ) -> Result<bool, DatabaseError> {
        let rows = sqlx::query(
            "UPDATE orders SET realized_pnl = $1 WHERE id = $2 AND realized_pnl = 0",
        )
        .bind(realized_pnl)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to backfill P&L for order {}: {}", order_id, e);
            DatabaseError::from(e)
        })?
        .rows_affected();

        Ok(rows > 0)
    }

    async fn reconcile_account(&self) -> Result<BalanceSnapshot, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, AccountRecord>(
            "SELECT * FROM account WHERE id = 1 FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DatabaseError::Query("account not initialized; run `ledger init`".to_string())
        })?;

        let positions: Vec<(f64, f64)> =
            sqlx::query_as("SELECT quantity, current_price FROM positions")
                .fetch_all(&mut *tx)
                .await?;

        let positions_value: f64 = positions.iter().map(|(q, p)| q * p).sum();
        let computed_total = account.cash + positions_value;

        sqlx::query("UPDATE account SET total_value = $1, last_updated = $2 WHERE id = 1")
            .bind(computed_total)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(BalanceSnapshot {
            cash: account.cash,
            positions_value,
            computed_total,
            stored_total: account.total_value,
            position_count: positions.len(),
            checked_at: now,
        })
    }

    async fn check_balance(&self) -> Result<BalanceSnapshot, DatabaseError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let account =
            sqlx::query_as::<_, AccountRecord>("SELECT * FROM account WHERE id = 1")
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    DatabaseError::Query("account not initialized; run `ledger init`".to_string())
                })?;

        let positions: Vec<(f64, f64)> =
            sqlx::query_as("SELECT quantity, current_price FROM positions")
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        let positions_value: f64 = positions.iter().map(|(q, p)| q * p).sum();
        Ok(BalanceSnapshot {
            cash: account.cash,
            positions_value,
            computed_total: account.cash + positions_value,
            stored_total: account.total_value,
            position_count: positions.len(),
            checked_at: now,
        })
    }

    async fn record_performance_snapshot(
        &self,
        snapshot: &BalanceSnapshot,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO performance (timestamp, total_value, cash, positions_value) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (timestamp) DO UPDATE SET total_value = excluded.total_value, \
             cash = excluded.cash, positions_value = excluded.positions_value",
        )
        .bind(snapshot.checked_at)
        .bind(snapshot.computed_total)
        .bind(snapshot.cash)
        .bind(snapshot.positions_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_performance(&self, older_than_days: i64) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let rows = sqlx::query("DELETE FROM performance WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows)
    }

    async fn get_performance_history(
        &self,
        limit: i64,
    ) -> Result<Vec<PerformanceRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, PerformanceRecord>(
            "SELECT * FROM performance ORDER BY timestamp DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_strategy_performance(
        &self,
        strategy_id: &str,
    ) -> Result<Option<StrategyPerformanceRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, StrategyPerformanceRecord>(
            "SELECT * FROM strategy_performance WHERE strategy_id = $1",
        )
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_strategy_performance(
        &self,
    ) -> Result<Vec<StrategyPerformanceRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, StrategyPerformanceRecord>(
            "SELECT * FROM strategy_performance ORDER BY win_rate DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn upsert_strategy_performance(
        &self,
        record: &StrategyPerformanceRecord,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO strategy_performance (strategy_id, total_trades, winning_trades, \
             losing_trades, consecutive_losses, total_pnl, win_rate, profit_factor, \
             max_drawdown, current_drawdown, roi_pct, last_updated) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (strategy_id) DO UPDATE SET \
             total_trades = excluded.total_trades, \
             winning_trades = excluded.winning_trades, \
             losing_trades = excluded.losing_trades, \
             consecutive_losses = excluded.consecutive_losses, \
             total_pnl = excluded.total_pnl, \
             win_rate = excluded.win_rate, \
             profit_factor = excluded.profit_factor, \
             max_drawdown = excluded.max_drawdown, \
             current_drawdown = excluded.current_drawdown, \
             roi_pct = excluded.roi_pct, \
             last_updated = excluded.last_updated",
        )
        .bind(&record.strategy_id)
        .bind(record.total_trades)
        .bind(record.winning_trades)
        .bind(record.losing_trades)
        .bind(record.consecutive_losses)
        .bind(record.total_pnl)
        .bind(record.win_rate)
        .bind(record.profit_factor)
        .bind(record.max_drawdown)
        .bind(record.current_drawdown)
        .bind(record.roi_pct)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
