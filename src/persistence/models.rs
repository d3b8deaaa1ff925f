//! Database models
//!
//! Typed records for every persisted table plus the input structs used at
//! the storage boundary. All row access goes through these types; no
//! dynamically-shaped rows leave the persistence layer.

use crate::domain::entities::order::OrderSide;
use crate::domain::entities::position::Position;
use crate::domain::errors::ValidationError;
use crate::domain::value_objects::{price::Price, quantity::Quantity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The singleton account row (id = 1). Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountRecord {
    pub id: i64,
    pub cash: f64,
    pub total_value: f64,
    pub last_updated: DateTime<Utc>,
}

/// One open position per symbol. Removed when quantity reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub profit_target: Option<f64>,
    pub strategy: Option<String>,
    pub classification: Option<String>,
    pub entry_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PositionRecord {
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    /// Lift the raw row into the validated domain entity.
    pub fn to_entity(&self) -> Result<Position, ValidationError> {
        let mut position = Position::new(
            self.symbol.clone(),
            self.quantity,
            self.entry_price,
            self.entry_date,
        )?;
        position.update_price(Price::new(self.current_price)?);
        position.stop_loss = match self.stop_loss {
            Some(v) => Some(Price::new(v)?),
            None => None,
        };
        position.profit_target = match self.profit_target {
            Some(v) => Some(Price::new(v)?),
            None => None,
        };
        position.strategy = self.strategy.clone();
        position.classification = self.classification.clone();
        Ok(position)
    }
}

/// Append-only order row. `realized_pnl` starts at zero and may be set
/// once by the FIFO backfill; no other column is ever rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub realized_pnl: f64,
    pub strategy: Option<String>,
    pub reason: Option<String>,
}

impl OrderRecord {
    pub fn order_side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }
}

/// Point-in-time account valuation, appended by the reconciler and pruned
/// after the retention window.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PerformanceRecord {
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
    pub cash: f64,
    pub positions_value: f64,
}

/// Per-strategy aggregate metrics, upserted after every attributed trade.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StrategyPerformanceRecord {
    pub strategy_id: String,
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
    pub last_updated: DateTime<Utc>,
}

/// Order intake: anything a caller may submit to `place_order`.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub strategy: Option<String>,
    pub reason: Option<String>,
}

impl PlaceOrder {
    /// Reject malformed input before any row is touched.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::InvalidSymbol("empty symbol".to_string()));
        }
        Quantity::positive(self.quantity)
            .map_err(|e| ValidationError::InvalidQuantity(e.to_string()))?;
        Price::new(self.price).map_err(|e| ValidationError::InvalidPrice(e.to_string()))?;
        Ok(())
    }
}

/// Filter for order history queries. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub symbol: Option<String>,
    pub strategy: Option<String>,
    pub side: Option<OrderSide>,
}

impl OrderFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_symbol(symbol: &str) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            ..Self::default()
        }
    }

    pub fn sells_for_strategy(strategy: &str) -> Self {
        Self {
            strategy: Some(strategy.to_string()),
            side: Some(OrderSide::Sell),
            ..Self::default()
        }
    }
}

/// Result of one balance computation: the authoritative total derived
/// from cash plus mark-to-market positions, alongside the stored copy.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    pub cash: f64,
    pub positions_value: f64,
    pub computed_total: f64,
    pub stored_total: f64,
    pub position_count: usize,
    pub checked_at: DateTime<Utc>,
}

impl BalanceSnapshot {
    /// Signed difference between what the components say and what the
    /// account row claims.
    pub fn drift(&self) -> f64 {
        self.computed_total - self.stored_total
    }

    /// Drift as a percentage of the stored total. Undefined when the
    /// stored total is zero or negative.
    pub fn drift_pct(&self) -> Option<f64> {
        if self.stored_total > 0.0 {
            Some(self.drift() / self.stored_total * 100.0)
        } else {
            None
        }
    }
}
