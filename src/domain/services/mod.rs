pub mod analytics;
pub mod backfill;
pub mod fifo;
pub mod reconciler;
pub mod stop_monitor;
