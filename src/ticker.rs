//! Cancellable interval runner
//!
//! Replaces raw sleep loops for the monitor and reconciler. Each loop is
//! driven by a tokio interval plus a watch-based shutdown flag; an
//! in-flight iteration always runs to completion before the loop exits,
//! so a triggered sell is never aborted mid-write.
//!
//! Failure policy: a failing iteration is logged and retried on the next
//! scheduled tick. There is no nested retry or backoff inside a tick,
//! so tick latency stays bounded, and the loop never panics; consecutive
//! failures are counted and reported so operators can see degradation.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Create a linked shutdown handle/receiver pair. Flip the sender to
/// `true` (or drop it) to stop every loop holding the receiver.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Run `tick` every `period` until shutdown is signalled.
///
/// The first tick fires immediately. Iterations are not raced against
/// the shutdown flag; it is only observed between ticks.
pub async fn run_every<F, Fut>(
    task_name: &str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    info!("Task '{}' started (every {:?})", task_name, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match tick().await {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            warn!(
                                "Task '{}' recovered after {} failed tick(s)",
                                task_name, consecutive_failures
                            );
                        }
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            "Task '{}' tick failed ({} consecutive): {}",
                            task_name, consecutive_failures, e
                        );
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Task '{}' stopped", task_name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let (tx, rx) = shutdown_channel();

        let handle = tokio::spawn(async move {
            run_every("test-task", Duration::from_millis(5), rx, move || {
                let ticks = ticks_clone.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let (tx, rx) = shutdown_channel();

        let handle = tokio::spawn(async move {
            run_every("failing-task", Duration::from_millis(5), rx, move || {
                let ticks = ticks_clone.clone();
                async move {
                    let n = ticks.fetch_add(1, Ordering::SeqCst);
                    if n % 2 == 0 {
                        Err("simulated failure".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_the_loop() {
        let (tx, rx) = shutdown_channel();
        drop(tx);

        // Must return promptly instead of looping forever
        tokio::time::timeout(
            Duration::from_secs(1),
            run_every("orphan-task", Duration::from_millis(5), rx, || async {
                Ok(())
            }),
        )
        .await
        .unwrap();
    }
}
