//! Periodic triggers — the polling cycle and the retry sweep.
//!
//! Two independent loops, each driving one service. A tick that fires
//! while the previous invocation is still running waits on the service's
//! cycle lock rather than overlapping it; missed ticks are skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::{EmailProcessor, RetryQueue};

/// Spawn the classification/routing cycle trigger.
///
/// Returns the task handle and a shutdown flag; set the flag to stop the
/// loop at its next tick.
pub fn spawn_processing_loop(
    processor: Arc<EmailProcessor>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Email processing loop started (every {}s)", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Email processing loop shutting down");
                return;
            }

            match processor.process_new().await {
                Ok(count) if count > 0 => info!(count, "Processed new emails"),
                Ok(_) => {}
                Err(e) => error!("Email processing cycle failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}

/// Spawn the retry-sweep trigger.
pub fn spawn_retry_loop(
    retries: Arc<RetryQueue>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Retry sweep loop started (every {}s)", interval.as_secs());

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Retry sweep loop shutting down");
                return;
            }

            match retries.sweep_due().await {
                Ok(count) if count > 0 => info!(count, "Processed due retries"),
                Ok(_) => {}
                Err(e) => error!("Retry sweep failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}
