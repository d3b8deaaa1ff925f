//! Ledger CLI
//!
//! Standalone tooling for the paper-trading ledger: schema init, balance
//! reconciliation, discrepancy checks, FIFO P&L backfill, and the
//! long-running stop-loss monitor / reconciler service.

use clap::{Parser, Subcommand};
use kestrel::config::LedgerConfig;
use kestrel::domain::repositories::quote_source::QuoteSource;
use kestrel::domain::services::analytics::StrategyAnalytics;
use kestrel::domain::services::backfill::PnlBackfill;
use kestrel::domain::services::reconciler::{BalanceReconciler, ReconcilerConfig};
use kestrel::domain::services::stop_monitor::{MonitorConfig, StopLossMonitor};
use kestrel::infrastructure::http_quote_source::HttpQuoteSource;
use kestrel::persistence::{self, LedgerStore};
use kestrel::ticker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Paper-trading ledger and strategy performance tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema and seed the account row
    Init {
        /// Starting cash balance
        #[arg(long)]
        cash: Option<f64>,
    },
    /// Recompute and persist the total account value
    Reconcile,
    /// Compare the stored total against cash + positions
    CheckDiscrepancy {
        /// Dollar drift to tolerate
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// FIFO-recompute realized P&L for historical sell orders
    BackfillPnl {
        /// Commit the recomputed values (default is a dry run)
        #[arg(long)]
        apply: bool,
    },
    /// Watch stop-losses and exit triggered positions until interrupted
    MonitorStops {
        /// Seconds between checks
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run the reconciler and stop-loss monitor together
    Run,
    /// Show the account, open positions, and strategy leaderboard
    Status,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel=info,ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = LedgerConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let code = dispatch(cli.command, config).await;
    std::process::exit(code);
}

async fn dispatch(command: Commands, config: LedgerConfig) -> i32 {
    let store = match persistence::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("Cannot open ledger store: {}", e);
            eprintln!("error: cannot open ledger store: {}", e);
            return 1;
        }
    };

    match command {
        Commands::Init { cash } => init(store, cash.unwrap_or(config.initial_cash)).await,
        Commands::Reconcile => reconcile(store, &config).await,
        Commands::CheckDiscrepancy { threshold } => {
            let threshold = threshold.unwrap_or(config.discrepancy_threshold);
            check_discrepancy(store, &config, threshold).await
        }
        Commands::BackfillPnl { apply } => backfill_pnl(store, apply).await,
        Commands::MonitorStops { interval } => {
            let period = Duration::from_secs(interval.unwrap_or(config.monitor_interval_secs));
            run_loops(store, &config, period, false).await
        }
        Commands::Run => {
            let period = config.monitor_interval();
            run_loops(store, &config, period, true).await
        }
        Commands::Status => status(store, &config).await,
    }
}

async fn init(store: Arc<dyn LedgerStore>, cash: f64) -> i32 {
    match store.init_account(cash).await {
        Ok(account) => {
            println!(
                "Account ready: cash ${:.2}, total ${:.2}",
                account.cash, account.total_value
            );
            0
        }
        Err(e) => {
            eprintln!("error: failed to initialize account: {}", e);
            1
        }
    }
}

fn reconciler_config(config: &LedgerConfig) -> ReconcilerConfig {
    ReconcilerConfig {
        discrepancy_threshold: config.discrepancy_threshold,
        performance_retention_days: config.performance_retention_days,
        quote_timeout: config.quote_timeout(),
        storage_timeout: config.storage_timeout(),
    }
}

async fn reconcile(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> i32 {
    let reconciler = BalanceReconciler::new(store, None, reconciler_config(config));
    match reconciler.reconcile_now().await {
        Ok(report) => {
            println!(
                "Total value set to ${:.2} (cash ${:.2} + {} position(s) worth ${:.2})",
                report.snapshot.computed_total,
                report.snapshot.cash,
                report.snapshot.position_count,
                report.snapshot.positions_value
            );
            if report.flagged {
                match report.drift_pct {
                    Some(pct) => println!(
                        "Healed a ${:.2} ({:+.2}%) discrepancy",
                        report.drift, pct
                    ),
                    None => println!("Healed a ${:.2} discrepancy", report.drift),
                }
            }
            0
        }
        Err(e) => {
            eprintln!("error: reconcile failed: {}", e);
            1
        }
    }
}

async fn check_discrepancy(
    store: Arc<dyn LedgerStore>,
    config: &LedgerConfig,
    threshold: f64,
) -> i32 {
    let mut reconciler_config = reconciler_config(config);
    reconciler_config.discrepancy_threshold = threshold;
    let reconciler = BalanceReconciler::new(store, None, reconciler_config);

    match reconciler.check().await {
        Ok(report) => {
            println!("Stored total:   ${:.2}", report.snapshot.stored_total);
            println!("Computed total: ${:.2}", report.snapshot.computed_total);
            match report.drift_pct {
                Some(pct) => println!("Drift:          ${:.2} ({:+.2}%)", report.drift, pct),
                None => println!("Drift:          ${:.2}", report.drift),
            }
            if report.flagged {
                println!("\nDiscrepancy exceeds ${:.2}; run `ledger reconcile`", threshold);
                2
            } else {
                println!("\nBalance is within the ${:.2} threshold", threshold);
                0
            }
        }
        Err(e) => {
            eprintln!("error: check failed: {}", e);
            1
        }
    }
}

async fn backfill_pnl(store: Arc<dyn LedgerStore>, apply: bool) -> i32 {
    let backfill = PnlBackfill::new(store);
    let plan = match backfill.plan().await {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("error: backfill planning failed: {}", e);
            return 1;
        }
    };

    println!(
        "{} order(s) scanned, {} sell(s) need realized P&L",
        plan.total_orders,
        plan.updates.len()
    );
    for update in plan.updates.iter().take(20) {
        println!(
            "  {:6} order {:4} | ${:8.2} -> ${:8.2}",
            update.symbol, update.order_id, update.old_pnl, update.new_pnl
        );
    }
    if plan.updates.len() > 20 {
        println!("  ... and {} more", plan.updates.len() - 20);
    }
    for warning in &plan.warnings {
        println!(
            "  warning: order {} ({}) has {} unmatched share(s); counted as zero P&L",
            warning.order_id, warning.symbol, warning.unmatched_quantity
        );
    }
    println!("Total recomputed P&L: ${:.2}", plan.total_realized());

    if plan.is_empty() {
        println!("Nothing to apply");
        return 0;
    }

    if apply {
        match backfill.apply(&plan).await {
            Ok(written) => {
                println!("Updated {} order(s)", written);
                0
            }
            Err(e) => {
                eprintln!("error: backfill apply failed: {}", e);
                1
            }
        }
    } else {
        println!("Dry run; re-run with --apply to commit");
        0
    }
}

async fn run_loops(
    store: Arc<dyn LedgerStore>,
    config: &LedgerConfig,
    monitor_period: Duration,
    with_reconciler: bool,
) -> i32 {
    let quotes: Arc<dyn QuoteSource> =
        match HttpQuoteSource::new(&config.quote_api_url, config.quote_timeout()) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                eprintln!("error: cannot build quote client: {}", e);
                return 1;
            }
        };

    let reconciler = Arc::new(BalanceReconciler::new(
        store.clone(),
        Some(quotes.clone()),
        reconciler_config(config),
    ));
    let analytics = Arc::new(StrategyAnalytics::new(
        store.clone(),
        config.optimization.clone(),
        config.initial_allocation,
    ));
    let backfill = Arc::new(PnlBackfill::new(store.clone()));
    let monitor = Arc::new(StopLossMonitor::new(
        store,
        quotes,
        reconciler.clone(),
        analytics,
        backfill,
        MonitorConfig {
            quote_timeout: config.quote_timeout(),
            storage_timeout: config.storage_timeout(),
            status_every_ticks: config.monitor_status_every_ticks,
        },
    ));

    let (shutdown_tx, shutdown_rx) = ticker::shutdown_channel();
    let mut handles = Vec::new();

    handles.push(tokio::spawn(
        monitor.run(monitor_period, shutdown_rx.clone()),
    ));
    if with_reconciler {
        handles.push(tokio::spawn(
            reconciler.run(config.reconcile_interval(), shutdown_rx),
        ));
    }

    info!("Running; press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested; letting in-flight work finish");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    0
}

async fn status(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> i32 {
    let account = match store.get_account().await {
        Ok(Some(account)) => account,
        Ok(None) => {
            eprintln!("error: account not initialized; run `ledger init`");
            return 1;
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };

    println!("Cash:        ${:.2}", account.cash);
    println!("Total value: ${:.2}", account.total_value);

    match store.get_positions().await {
        Ok(positions) if positions.is_empty() => println!("\nNo open positions"),
        Ok(positions) => {
            println!("\nOpen positions:");
            for record in &positions {
                match record.to_entity() {
                    Ok(position) => {
                        let pnl = position
                            .unrealized_pnl()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "n/a".to_string());
                        let pct = position
                            .unrealized_pnl_pct()
                            .map(|p| format!("{:+.2}%", p))
                            .unwrap_or_else(|| "n/a".to_string());
                        println!(
                            "  {:6} {:>10.2} @ ${:<8.2} mark ${:<8.2} P&L {} ({})",
                            record.symbol,
                            record.quantity,
                            record.entry_price,
                            record.current_price,
                            pnl,
                            pct
                        );
                    }
                    Err(e) => println!("  {:6} (unreadable row: {})", record.symbol, e),
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    }

    let analytics = StrategyAnalytics::new(
        store,
        config.optimization.clone(),
        config.initial_allocation,
    );
    match analytics.leaderboard().await {
        Ok(rows) if rows.is_empty() => {}
        Ok(rows) => {
            println!("\nStrategy leaderboard:");
            for (rank, row) in rows.iter().enumerate() {
                println!(
                    "  {}. {} | {:.1}% win rate | {} trades | ${:.2} P&L | PF {:.2}",
                    rank + 1,
                    row.strategy_id,
                    row.win_rate * 100.0,
                    row.total_trades,
                    row.total_pnl,
                    row.profit_factor
                );
                if let Ok(Some(reason)) = analytics.should_optimize(&row.strategy_id).await {
                    println!("     needs optimization: {}", reason);
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    }

    if let Ok(stats) = analytics.aggregate_statistics().await {
        if stats.total_strategies > 0 {
            println!(
                "\n{} strategies, {} closed trades, ${:.2} total P&L, {:.1}% avg win rate",
                stats.total_strategies,
                stats.total_trades,
                stats.total_pnl,
                stats.avg_win_rate * 100.0
            );
        }
    }

    0
}
