//! Kestrel Paper-Trading Ledger
//!
//! Core components for a simulated-money trading ledger: the
//! account/position/order store, balance reconciliation, FIFO realized
//! P&L matching, per-strategy performance analytics, and the stop-loss
//! monitor.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod ticker;
