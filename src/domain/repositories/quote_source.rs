//! Quote source abstraction
//!
//! The ledger does not own market data. Live prices come from an external
//! quote feed that is rate-limited and may time out or serve stale data;
//! callers skip a symbol for the cycle when its quote is missing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A single quote for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Age of the quote relative to now. Stale quotes are still usable;
    /// the monitor only logs them.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }
}

/// Quote feed failures. All variants are transient from the caller's
/// point of view: skip the symbol this cycle, retry next tick.
#[derive(Debug, Error, Clone)]
pub enum QuoteError {
    #[error("Quote feed unavailable: {0}")]
    Unavailable(String),

    #[error("Quote request timed out")]
    Timeout,

    #[error("No quote for symbol: {0}")]
    NotFound(String),

    #[error("Malformed quote response: {0}")]
    Malformed(String),
}

/// External price feed consumed by the monitor and the reconciler.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, QuoteError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}
