//! Bounded intake queue feeding the processor.
//!
//! Sources and webhooks submit `NewSignal`s; a single worker drains the
//! queue and runs each signal end-to-end in its own task, with at most
//! `concurrency` signals in flight.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::pipeline::processor::SignalProcessor;
use crate::pipeline::types::{NewSignal, Source};

/// Producer side of the intake queue. Cheap to clone.
#[derive(Clone)]
pub struct IntakeSender {
    tx: mpsc::Sender<NewSignal>,
}

/// Consumer side, handed to `spawn_intake_worker`.
pub struct IntakeReceiver {
    rx: mpsc::Receiver<NewSignal>,
}

/// Create a bounded queue.
pub fn intake_queue(capacity: usize) -> (IntakeSender, IntakeReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IntakeSender { tx }, IntakeReceiver { rx })
}

impl IntakeSender {
    /// Enqueue without waiting. Fails when the queue is full or closed.
    pub fn submit(&self, signal: NewSignal) -> Result<(), ChannelError> {
        self.tx.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChannelError::QueueClosed,
        })
    }

    /// Enqueue, waiting for capacity. Used by pollers, which can afford to wait.
    pub async fn send(&self, signal: NewSignal) -> Result<(), ChannelError> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| ChannelError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl IntakeReceiver {
    pub async fn recv(&mut self) -> Option<NewSignal> {
        self.rx.recv().await
    }
}

/// Spawn the intake worker. Finishes once every sender is dropped and all
/// in-flight signals have settled.
pub fn spawn_intake_worker(
    processor: Arc<SignalProcessor>,
    mut receiver: IntakeReceiver,
    concurrency: usize,
) -> JoinHandle<()> {
    let concurrency = concurrency.max(1);
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        info!(concurrency, "Intake worker started");

        while let Some(new) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                let _permit = permit;
                handle(&processor, new).await;
            });
        }

        // Wait for in-flight signals before reporting completion.
        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        info!("Intake worker stopped");
    })
}

async fn handle(processor: &SignalProcessor, new: NewSignal) {
    if is_duplicate(processor, &new).await {
        debug!(
            source = %new.source,
            external_id = new.external_id.as_deref().unwrap_or(""),
            "Skipping already recorded signal"
        );
        return;
    }

    match processor.process(new).await {
        Ok(processed) => {
            if let Some(e) = processed.audit_error {
                warn!(signal_id = %processed.signal.id, error = %e, "Signal processed without audit record");
            }
        }
        Err(e) => warn!(error = %e, "Queued signal rejected"),
    }
}

async fn is_duplicate(processor: &SignalProcessor, new: &NewSignal) -> bool {
    let Some(external_id) = new.external_id.as_deref() else {
        return false;
    };
    let Ok(source) = new.source.parse::<Source>() else {
        return false;
    };
    match processor.audit().has_external_id(source, external_id).await {
        Ok(seen) => seen,
        Err(e) => {
            warn!(error = %e, "Dedup lookup failed, processing anyway");
            false
        }
    }
}
