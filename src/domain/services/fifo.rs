//! FIFO matching engine
//!
//! Replays order history to compute realized P&L per closing trade using
//! oldest-lot-first consumption. The replay is pure and in-memory: it
//! reconstructs open lots from the order rows alone and never reads the
//! mutable position table, so the weighted-average cost kept there cannot
//! leak into realized figures.
//!
//! Replaying the same history twice yields identical results; the replay
//! order is total: ascending timestamp, ties broken by ascending
//! insertion id.

use crate::domain::entities::order::OrderSide;
use crate::persistence::models::OrderRecord;
use std::collections::{HashMap, VecDeque};

const QTY_EPSILON: f64 = 1e-9;

/// An open purchase lot awaiting consumption.
#[derive(Debug, Clone, PartialEq)]
pub struct Lot {
    pub quantity: f64,
    pub unit_cost: f64,
}

/// Realized P&L attributed to one sell order.
#[derive(Debug, Clone, PartialEq)]
pub struct RealizedTrade {
    pub order_id: i64,
    pub symbol: String,
    pub realized_pnl: f64,
}

/// A sell that ran out of lots to match, e.g. history predates a seeded
/// position. The unmatched portion contributes zero P&L rather than a
/// guessed cost basis.
#[derive(Debug, Clone, PartialEq)]
pub struct UnmatchedSell {
    pub order_id: i64,
    pub symbol: String,
    pub unmatched_quantity: f64,
}

/// Outcome of one replay over a set of orders.
#[derive(Debug, Clone, Default)]
pub struct FifoReport {
    pub realized: Vec<RealizedTrade>,
    pub warnings: Vec<UnmatchedSell>,
}

impl FifoReport {
    pub fn total_realized(&self) -> f64 {
        self.realized.iter().map(|t| t.realized_pnl).sum()
    }

    pub fn realized_for(&self, order_id: i64) -> Option<f64> {
        self.realized
            .iter()
            .find(|t| t.order_id == order_id)
            .map(|t| t.realized_pnl)
    }
}

/// Replay order history and compute realized P&L for every sell.
///
/// Accepts orders for any number of symbols; lot queues are kept per
/// symbol. Input order does not matter; rows are sorted by
/// (timestamp, id) before the replay.
pub fn replay(orders: &[OrderRecord]) -> FifoReport {
    let mut sorted: Vec<&OrderRecord> = orders.iter().collect();
    sorted.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut lots: HashMap<String, VecDeque<Lot>> = HashMap::new();
    let mut report = FifoReport::default();

    for order in sorted {
        let side = match order.order_side() {
            Some(side) => side,
            None => continue,
        };

        match side {
            OrderSide::Buy => {
                lots.entry(order.symbol.clone()).or_default().push_back(Lot {
                    quantity: order.quantity,
                    unit_cost: order.price,
                });
            }
            OrderSide::Sell => {
                let queue = lots.entry(order.symbol.clone()).or_default();
                let mut remaining = order.quantity;
                let mut realized = 0.0;

                while remaining > QTY_EPSILON {
                    let Some(oldest) = queue.front_mut() else {
                        break;
                    };
                    if oldest.quantity <= remaining + QTY_EPSILON {
                        realized += (order.price - oldest.unit_cost) * oldest.quantity;
                        remaining -= oldest.quantity;
                        queue.pop_front();
                    } else {
                        realized += (order.price - oldest.unit_cost) * remaining;
                        oldest.quantity -= remaining;
                        remaining = 0.0;
                    }
                }

                if remaining > QTY_EPSILON {
                    report.warnings.push(UnmatchedSell {
                        order_id: order.id,
                        symbol: order.symbol.clone(),
                        unmatched_quantity: remaining,
                    });
                }

                report.realized.push(RealizedTrade {
                    order_id: order.id,
                    symbol: order.symbol.clone(),
                    realized_pnl: realized,
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn order(id: i64, symbol: &str, side: &str, quantity: f64, price: f64) -> OrderRecord {
        OrderRecord {
            id,
            symbol: symbol.to_string(),
            side: side.to_string(),
            quantity,
            price,
            timestamp: Utc::now() + Duration::seconds(id),
            realized_pnl: 0.0,
            strategy: None,
            reason: None,
        }
    }

    #[test]
    fn test_two_lots_consumed_by_one_sell() {
        let orders = vec![
            order(1, "TSLA", "buy", 50.0, 400.0),
            order(2, "TSLA", "buy", 50.0, 410.0),
            order(3, "TSLA", "sell", 100.0, 430.0),
        ];
        let report = replay(&orders);

        // (430-400)*50 + (430-410)*50
        assert_eq!(report.realized_for(3).unwrap(), 2500.0);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_partial_lot_consumption() {
        let orders = vec![
            order(1, "AAPL", "buy", 100.0, 300.0),
            order(2, "AAPL", "sell", 30.0, 320.0),
            order(3, "AAPL", "sell", 40.0, 310.0),
        ];
        let report = replay(&orders);

        assert_eq!(report.realized_for(2).unwrap(), 600.0);
        assert_eq!(report.realized_for(3).unwrap(), 400.0);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_unmatched_sell_contributes_zero() {
        let orders = vec![
            order(1, "NVDA", "buy", 10.0, 500.0),
            order(2, "NVDA", "sell", 25.0, 550.0),
        ];
        let report = replay(&orders);

        // Only the matched 10 shares realize P&L
        assert_eq!(report.realized_for(2).unwrap(), 500.0);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].order_id, 2);
        assert!((report.warnings[0].unmatched_quantity - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_with_no_lots_at_all() {
        let orders = vec![order(1, "GME", "sell", 5.0, 20.0)];
        let report = replay(&orders);

        assert_eq!(report.realized_for(1).unwrap(), 0.0);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let orders = vec![
            order(1, "TSLA", "buy", 50.0, 400.0),
            order(2, "TSLA", "buy", 50.0, 410.0),
            order(3, "TSLA", "sell", 75.0, 430.0),
            order(4, "TSLA", "sell", 25.0, 390.0),
        ];
        let first = replay(&orders);
        let second = replay(&orders);
        assert_eq!(first.realized, second.realized);
        assert_eq!(first.warnings, second.warnings);
    }

    #[test]
    fn test_timestamp_ties_break_by_id() {
        let ts = Utc::now();
        let mut buy_cheap = order(2, "AMD", "buy", 10.0, 100.0);
        let mut buy_dear = order(1, "AMD", "buy", 10.0, 200.0);
        let mut sell_all = order(3, "AMD", "sell", 10.0, 210.0);
        buy_cheap.timestamp = ts;
        buy_dear.timestamp = ts;
        sell_all.timestamp = ts;

        // Same timestamp: id 1 (the $200 lot) must be consumed first
        let report = replay(&[buy_cheap, buy_dear, sell_all]);
        assert_eq!(report.realized_for(3).unwrap(), 100.0);
    }

    #[test]
    fn test_symbols_are_isolated() {
        let orders = vec![
            order(1, "AAPL", "buy", 10.0, 100.0),
            order(2, "TSLA", "buy", 10.0, 200.0),
            order(3, "AAPL", "sell", 10.0, 110.0),
        ];
        let report = replay(&orders);

        assert_eq!(report.realized_for(3).unwrap(), 100.0);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_losing_sell() {
        let orders = vec![
            order(1, "META", "buy", 20.0, 350.0),
            order(2, "META", "sell", 20.0, 330.0),
        ];
        let report = replay(&orders);
        assert_eq!(report.realized_for(2).unwrap(), -400.0);
    }
}
