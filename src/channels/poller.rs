//! Background poller: fetches new signals from a source and queues them.
//!
//! The poller does no processing itself. It only:
//! 1. Calls `SignalSource::fetch_new()` every tick
//! 2. Pushes each payload onto the intake queue
//!
//! The intake worker picks them up and runs the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::SignalSource;
use crate::pipeline::intake::IntakeSender;

/// Spawn a background task that polls `source` every `interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
/// The poller also stops on its own once the intake queue is closed.
pub fn spawn_source_poller(
    source: Arc<dyn SignalSource>,
    interval: Duration,
    intake: IntakeSender,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            source = source.name(),
            "Source poller started, polling every {}s",
            interval.as_secs()
        );

        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!(source = source.name(), "Source poller shutting down");
                return;
            }

            if !poll_once(source.as_ref(), &intake).await {
                warn!(source = source.name(), "Intake queue closed, stopping poller");
                return;
            }
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle. Returns `false` once the queue is closed.
async fn poll_once(source: &dyn SignalSource, intake: &IntakeSender) -> bool {
    let signals = match source.fetch_new().await {
        Ok(signals) => signals,
        Err(e) => {
            error!(source = source.name(), "Source poll failed: {e}");
            return true;
        }
    };

    if signals.is_empty() {
        return true;
    }
    debug!(source = source.name(), "Fetched {} new signals", signals.len());

    for signal in signals {
        if intake.send(signal).await.is_err() {
            return false;
        }
    }
    true
}
