//! Realized P&L backfill
//!
//! Recomputes realized P&L for historical sell orders from the FIFO
//! replay and writes it into `orders.realized_pnl`, the one permitted
//! write against otherwise-immutable order rows, and only into rows that
//! are still zero. Dry-run by default; `apply` commits the plan.
//!
//! Backfilled figures never feed the live balance: total value always
//! comes from the reconciler using current prices.

use super::fifo::{self, UnmatchedSell};
use crate::persistence::models::OrderFilter;
use crate::persistence::{DatabaseError, LedgerStore};
use std::sync::Arc;
use tracing::{info, warn};

/// One planned write.
#[derive(Debug, Clone, PartialEq)]
pub struct PnlUpdate {
    pub order_id: i64,
    pub symbol: String,
    pub old_pnl: f64,
    pub new_pnl: f64,
}

/// A stored non-zero value that disagrees with the FIFO recomputation.
/// Left untouched: only previously-zero rows may be backfilled.
#[derive(Debug, Clone, PartialEq)]
pub struct PnlConflict {
    pub order_id: i64,
    pub symbol: String,
    pub stored_pnl: f64,
    pub computed_pnl: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BackfillPlan {
    pub total_orders: usize,
    pub updates: Vec<PnlUpdate>,
    pub conflicts: Vec<PnlConflict>,
    pub warnings: Vec<UnmatchedSell>,
}

impl BackfillPlan {
    pub fn total_realized(&self) -> f64 {
        self.updates.iter().map(|u| u.new_pnl).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Differences smaller than this are treated as already correct.
const PNL_TOLERANCE: f64 = 0.001;

pub struct PnlBackfill {
    store: Arc<dyn LedgerStore>,
}

impl PnlBackfill {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    fn plan_from_orders(
        orders: &[crate::persistence::models::OrderRecord],
    ) -> BackfillPlan {
        let report = fifo::replay(orders);
        let mut plan = BackfillPlan {
            total_orders: orders.len(),
            warnings: report.warnings.clone(),
            ..BackfillPlan::default()
        };

        for trade in &report.realized {
            let Some(order) = orders.iter().find(|o| o.id == trade.order_id) else {
                continue;
            };
            if (trade.realized_pnl - order.realized_pnl).abs() <= PNL_TOLERANCE {
                continue;
            }
            if order.realized_pnl == 0.0 {
                plan.updates.push(PnlUpdate {
                    order_id: order.id,
                    symbol: order.symbol.clone(),
                    old_pnl: order.realized_pnl,
                    new_pnl: trade.realized_pnl,
                });
            } else {
                plan.conflicts.push(PnlConflict {
                    order_id: order.id,
                    symbol: order.symbol.clone(),
                    stored_pnl: order.realized_pnl,
                    computed_pnl: trade.realized_pnl,
                });
            }
        }

        plan
    }

    /// Replay the full order history and compute the pending writes.
    pub async fn plan(&self) -> Result<BackfillPlan, DatabaseError> {
        let orders = self.store.get_orders(&OrderFilter::all()).await?;
        let plan = Self::plan_from_orders(&orders);

        for warning in &plan.warnings {
            warn!(
                "Unmatched sell: order {} ({}) has {} share(s) with no buy lot; \
                 contributing zero P&L for the unmatched portion",
                warning.order_id, warning.symbol, warning.unmatched_quantity
            );
        }
        for conflict in &plan.conflicts {
            warn!(
                "Order {} ({}) already carries ${:.2} but FIFO says ${:.2}; leaving it alone",
                conflict.order_id, conflict.symbol, conflict.stored_pnl, conflict.computed_pnl
            );
        }

        Ok(plan)
    }

    /// Commit a plan. Returns the number of rows actually written.
    pub async fn apply(&self, plan: &BackfillPlan) -> Result<usize, DatabaseError> {
        let mut written = 0;
        for update in &plan.updates {
            if self
                .store
                .update_order_pnl(update.order_id, update.new_pnl)
                .await?
            {
                written += 1;
            }
        }
        info!(
            "Backfilled realized P&L into {} of {} planned order(s)",
            written,
            plan.updates.len()
        );
        Ok(written)
    }

    /// Replay one symbol's history and fill its zero rows. Called after a
    /// sell completes so strategy metrics see fresh realized figures.
    pub async fn backfill_symbol(&self, symbol: &str) -> Result<usize, DatabaseError> {
        let orders = self.store.get_orders(&OrderFilter::for_symbol(symbol)).await?;
        let plan = Self::plan_from_orders(&orders);
        self.apply(&plan).await
    }
}
