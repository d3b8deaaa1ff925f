use crate::domain::services::analytics::OptimizationThresholds;
use std::time::Duration;

/// Runtime configuration for the ledger, its loops, and the optimization
/// triggers. Loaded from environment variables with validated fallbacks;
/// thresholds are configuration, not constants.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// `sqlite://path` or `postgres://...`
    pub database_url: String,
    /// Cash the account is seeded with on `ledger init`.
    pub initial_cash: f64,

    /// Seconds between reconciler cycles.
    pub reconcile_interval_secs: u64,
    /// Dollar drift that flags a discrepancy.
    pub discrepancy_threshold: f64,
    /// Days of performance snapshots to keep.
    pub performance_retention_days: i64,

    /// Seconds between stop-loss monitor ticks.
    pub monitor_interval_secs: u64,
    /// Monitor status line cadence, in ticks.
    pub monitor_status_every_ticks: u64,

    /// Base URL of the external quote API.
    pub quote_api_url: String,
    pub quote_timeout_secs: u64,
    pub storage_timeout_secs: u64,

    /// Capital assumed per strategy for ROI.
    pub initial_allocation: f64,
    pub optimization: OptimizationThresholds,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/ledger.db".to_string(),
            initial_cash: 10_000.0,
            reconcile_interval_secs: 300,
            discrepancy_threshold: 1.0,
            performance_retention_days: 30,
            monitor_interval_secs: 10,
            monitor_status_every_ticks: 6,
            quote_api_url: "http://localhost:5000/api".to_string(),
            quote_timeout_secs: 10,
            storage_timeout_secs: 5,
            initial_allocation: 10_000.0,
            optimization: OptimizationThresholds::default(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from environment variables, keeping defaults
    /// for anything unset or out of range.
    pub fn from_env() -> LedgerConfig {
        let mut config = LedgerConfig::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = url;
            }
        }

        if let Ok(cash) = std::env::var("INITIAL_CASH") {
            match cash.parse::<f64>() {
                Ok(value) if value > 0.0 && value.is_finite() => {
                    config.initial_cash = value;
                }
                Ok(value) => {
                    tracing::warn!(
                        "Invalid INITIAL_CASH value: {} (must be positive), using default: {}",
                        value,
                        config.initial_cash
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse INITIAL_CASH '{}': {}, using default: {}",
                        cash,
                        e,
                        config.initial_cash
                    );
                }
            }
        }

        if let Ok(interval) = std::env::var("RECONCILE_INTERVAL_SECONDS") {
            if let Ok(value) = interval.parse::<u64>() {
                if (10..=3600).contains(&value) {
                    config.reconcile_interval_secs = value;
                }
            }
        }

        if let Ok(threshold) = std::env::var("DISCREPANCY_THRESHOLD_DOLLARS") {
            if let Ok(value) = threshold.parse::<f64>() {
                if value > 0.0 && value.is_finite() {
                    config.discrepancy_threshold = value;
                }
            }
        }

        if let Ok(days) = std::env::var("PERFORMANCE_RETENTION_DAYS") {
            if let Ok(value) = days.parse::<i64>() {
                if (1..=3650).contains(&value) {
                    config.performance_retention_days = value;
                }
            }
        }

        if let Ok(interval) = std::env::var("MONITOR_INTERVAL_SECONDS") {
            if let Ok(value) = interval.parse::<u64>() {
                if (1..=600).contains(&value) {
                    config.monitor_interval_secs = value;
                }
            }
        }

        if let Ok(url) = std::env::var("QUOTE_API_URL") {
            if !url.trim().is_empty() {
                config.quote_api_url = url;
            }
        }

        if let Ok(timeout) = std::env::var("QUOTE_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                if (1..=120).contains(&value) {
                    config.quote_timeout_secs = value;
                }
            }
        }

        if let Ok(timeout) = std::env::var("STORAGE_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse::<u64>() {
                if (1..=60).contains(&value) {
                    config.storage_timeout_secs = value;
                }
            }
        }

        if let Ok(allocation) = std::env::var("STRATEGY_INITIAL_ALLOCATION") {
            if let Ok(value) = allocation.parse::<f64>() {
                if value > 0.0 && value.is_finite() {
                    config.initial_allocation = value;
                }
            }
        }

        if let Ok(limit) = std::env::var("OPT_CONSECUTIVE_LOSS_LIMIT") {
            if let Ok(value) = limit.parse::<i64>() {
                if (1..=100).contains(&value) {
                    config.optimization.consecutive_loss_limit = value;
                }
            }
        }

        if let Ok(min_trades) = std::env::var("OPT_MIN_TRADES_FOR_STATS") {
            if let Ok(value) = min_trades.parse::<i64>() {
                if (1..=10_000).contains(&value) {
                    config.optimization.min_trades_for_stats = value;
                }
            }
        }

        if let Ok(floor) = std::env::var("OPT_WIN_RATE_FLOOR") {
            if let Ok(value) = floor.parse::<f64>() {
                if (0.0..=1.0).contains(&value) {
                    config.optimization.win_rate_floor = value;
                }
            }
        }

        if let Ok(limit) = std::env::var("OPT_DRAWDOWN_LIMIT") {
            if let Ok(value) = limit.parse::<f64>() {
                if value > 0.0 && value.is_finite() {
                    config.optimization.drawdown_limit = value;
                }
            }
        }

        config
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn quote_timeout(&self) -> Duration {
        Duration::from_secs(self.quote_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.discrepancy_threshold, 1.0);
        assert_eq!(config.monitor_interval_secs, 10);
        assert_eq!(config.quote_timeout_secs, 10);
        assert_eq!(config.storage_timeout_secs, 5);
        assert_eq!(config.optimization.consecutive_loss_limit, 5);
        assert_eq!(config.optimization.min_trades_for_stats, 20);
        assert_eq!(config.optimization.win_rate_floor, 0.40);
        assert_eq!(config.optimization.drawdown_limit, 0.15);
    }

    #[test]
    fn test_interval_helpers() {
        let config = LedgerConfig::default();
        assert_eq!(config.reconcile_interval(), Duration::from_secs(300));
        assert_eq!(config.monitor_interval(), Duration::from_secs(10));
    }
}
