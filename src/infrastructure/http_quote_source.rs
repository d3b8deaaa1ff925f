//! HTTP quote client
//!
//! Fetches live prices from the quote API configured in `LedgerConfig`
//! (`GET {base}/v1/quotes/{symbol}`). The feed is rate-limited and
//! unreliable; every request carries a timeout and all failures map to
//! transient `QuoteError`s that callers resolve by skipping the symbol
//! for the cycle.

use crate::domain::repositories::quote_source::{Quote, QuoteError, QuoteSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
    timestamp: Option<DateTime<Utc>>,
}

pub struct HttpQuoteSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpQuoteSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QuoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QuoteError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn get_quote(&self, symbol: &str) -> Result<Quote, QuoteError> {
        let url = format!("{}/v1/quotes/{}", self.base_url, symbol);
        debug!("Fetching quote: {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                QuoteError::Timeout
            } else {
                QuoteError::Unavailable(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(QuoteError::NotFound(symbol.to_string()));
        }
        if !response.status().is_success() {
            return Err(QuoteError::Unavailable(format!(
                "quote API returned {}",
                response.status()
            )));
        }

        let body: QuoteResponse = response
            .json()
            .await
            .map_err(|e| QuoteError::Malformed(e.to_string()))?;

        if !body.price.is_finite() || body.price < 0.0 {
            return Err(QuoteError::Malformed(format!(
                "bad price {} for {}",
                body.price, symbol
            )));
        }

        let quote = Quote {
            symbol: symbol.to_string(),
            price: body.price,
            timestamp: body.timestamp.unwrap_or_else(Utc::now),
        };
        if quote.age() > chrono::Duration::minutes(5) {
            debug!(
                "Quote for {} is {}s old",
                symbol,
                quote.age().num_seconds()
            );
        }
        Ok(quote)
    }

    fn name(&self) -> &str {
        "http"
    }
}
