use crate::domain::errors::ValidationError;
use crate::domain::value_objects::{pnl::PnL, price::Price, quantity::Quantity};
use chrono::{DateTime, Utc};

/// An open long position with its weighted-average cost basis.
///
/// `entry_price` is the running weighted-average over all buys still held.
/// It drives the unrealized P&L view only; realized P&L always comes from
/// the FIFO replay over order history, never from this field.
#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub quantity: Quantity,
    pub entry_price: Price,
    pub current_price: Option<Price>,
    pub stop_loss: Option<Price>,
    pub profit_target: Option<Price>,
    pub strategy: Option<String>,
    pub classification: Option<String>,
    pub entry_date: DateTime<Utc>,
}

impl Position {
    pub fn new(
        symbol: String,
        quantity: f64,
        entry_price: f64,
        entry_date: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if symbol.trim().is_empty() {
            return Err(ValidationError::InvalidSymbol("empty symbol".to_string()));
        }
        Ok(Position {
            symbol,
            quantity: Quantity::positive(quantity)?,
            entry_price: Price::new(entry_price)?,
            current_price: None,
            stop_loss: None,
            profit_target: None,
            strategy: None,
            classification: None,
            entry_date,
        })
    }

    pub fn update_price(&mut self, price: Price) {
        self.current_price = Some(price);
    }

    /// Capital committed at the weighted-average cost.
    pub fn invested(&self) -> f64 {
        self.quantity.value() * self.entry_price.value()
    }

    /// Mark-to-market value at the current price, if one is known.
    pub fn market_value(&self) -> Option<f64> {
        self.current_price
            .map(|p| self.quantity.value() * p.value())
    }

    /// Paper gain/loss versus the weighted-average cost.
    pub fn unrealized_pnl(&self) -> Option<PnL> {
        self.current_price.and_then(|current| {
            let diff = current.value() - self.entry_price.value();
            PnL::new(diff * self.quantity.value()).ok()
        })
    }

    pub fn unrealized_pnl_pct(&self) -> Option<f64> {
        let invested = self.invested();
        if invested <= 0.0 {
            return None;
        }
        self.unrealized_pnl().map(|p| p.value() / invested * 100.0)
    }

    /// A stop-loss at or above the current price means the position should
    /// be exited. Stops stored as zero are treated as unset.
    pub fn should_stop_loss(&self) -> bool {
        match (self.current_price, self.stop_loss) {
            (Some(current), Some(stop)) => stop.value() > 0.0 && current.value() <= stop.value(),
            _ => false,
        }
    }

    pub fn should_take_profit(&self) -> bool {
        match (self.current_price, self.profit_target) {
            (Some(current), Some(target)) => {
                target.value() > 0.0 && current.value() >= target.value()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(quantity: f64, entry: f64) -> Position {
        Position::new("AAPL".to_string(), quantity, entry, Utc::now()).unwrap()
    }

    #[test]
    fn test_position_new_rejects_empty_symbol() {
        let result = Position::new("".to_string(), 10.0, 100.0, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_position_new_rejects_zero_quantity() {
        let result = Position::new("AAPL".to_string(), 0.0, 100.0, Utc::now());
        assert_eq!(result.unwrap_err(), ValidationError::MustBePositive);
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut pos = position(10.0, 100.0);
        pos.update_price(Price::new(110.0).unwrap());
        assert_eq!(pos.unrealized_pnl().unwrap().value(), 100.0);
        assert_eq!(pos.unrealized_pnl_pct().unwrap(), 10.0);
    }

    #[test]
    fn test_unrealized_pnl_without_mark() {
        let pos = position(10.0, 100.0);
        assert!(pos.unrealized_pnl().is_none());
    }

    #[test]
    fn test_should_stop_loss_triggers_at_or_below() {
        let mut pos = position(10.0, 100.0);
        pos.stop_loss = Some(Price::new(95.0).unwrap());

        pos.update_price(Price::new(96.0).unwrap());
        assert!(!pos.should_stop_loss());

        pos.update_price(Price::new(95.0).unwrap());
        assert!(pos.should_stop_loss());

        pos.update_price(Price::new(94.0).unwrap());
        assert!(pos.should_stop_loss());
    }

    #[test]
    fn test_zero_stop_loss_is_unset() {
        let mut pos = position(10.0, 100.0);
        pos.stop_loss = Some(Price::new(0.0).unwrap());
        pos.update_price(Price::new(0.0).unwrap());
        assert!(!pos.should_stop_loss());
    }

    #[test]
    fn test_should_take_profit() {
        let mut pos = position(10.0, 100.0);
        pos.profit_target = Some(Price::new(120.0).unwrap());

        pos.update_price(Price::new(119.0).unwrap());
        assert!(!pos.should_take_profit());

        pos.update_price(Price::new(120.0).unwrap());
        assert!(pos.should_take_profit());
    }
}
