//! Signal processor: validate, score, route, dispatch, audit.
//!
//! Flow:
//! 1. `SignalValidator` → rejects malformed input with `InvalidSignal`
//! 2. `ScoringEngine` + `RoutingPolicy` → `Decision`
//! 3. `Dispatcher` → concurrent delivery, `Outcome`
//! 4. `AuditSink::record` → failures are logged and surfaced, never fatal

use std::sync::Arc;

use futures::StreamExt;
use serde::{Serialize, Serializer};
use tracing::{error, info, warn};

use crate::error::{AuditError, PipelineError};
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::routing::RoutingPolicy;
use crate::pipeline::scoring::ScoringEngine;
use crate::pipeline::types::{Decision, NewSignal, Outcome, Signal, SignalValidator};
use crate::store::AuditSink;

/// Everything produced for one signal.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedSignal {
    pub signal: Signal,
    pub decision: Decision,
    pub outcome: Outcome,
    /// Set when the audit write failed. The outcome is still authoritative.
    #[serde(
        rename = "audit_warning",
        skip_serializing_if = "Option::is_none",
        serialize_with = "audit_error_message"
    )]
    pub audit_error: Option<AuditError>,
}

fn audit_error_message<S: Serializer>(
    error: &Option<AuditError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_str(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// End-to-end handler for a single signal.
pub struct SignalProcessor {
    validator: SignalValidator,
    scorer: ScoringEngine,
    router: RoutingPolicy,
    dispatcher: Dispatcher,
    audit: Arc<dyn AuditSink>,
}

impl SignalProcessor {
    pub fn new(
        validator: SignalValidator,
        scorer: ScoringEngine,
        router: RoutingPolicy,
        dispatcher: Dispatcher,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            validator,
            scorer,
            router,
            dispatcher,
            audit,
        }
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Score and route without side effects.
    pub fn evaluate(&self, signal: &Signal) -> Decision {
        let score = self.scorer.score(signal);
        let route = self.router.route(score.points);
        Decision {
            signal_id: signal.id,
            score: score.points,
            matched_rules: score.matched_rules,
            tier: route.tier,
            destinations: route.destinations,
        }
    }

    /// Validate then process a raw ingestion payload.
    pub async fn process(&self, new: NewSignal) -> Result<ProcessedSignal, PipelineError> {
        let signal = self.validator.validate(new).map_err(|e| {
            warn!(error = %e, "Signal rejected");
            e
        })?;
        Ok(self.process_signal(signal).await)
    }

    /// Process an already validated signal. Never fails; audit problems are
    /// reported through `audit_error`.
    pub async fn process_signal(&self, signal: Signal) -> ProcessedSignal {
        let decision = self.evaluate(&signal);
        info!(
            signal_id = %signal.id,
            source = %signal.source,
            score = decision.score,
            tier = decision.tier.as_str(),
            destinations = decision.destinations.len(),
            "Signal evaluated"
        );

        let signal = Arc::new(signal);
        let decision = Arc::new(decision);
        let outcome = self
            .dispatcher
            .dispatch(Arc::clone(&signal), Arc::clone(&decision))
            .await;

        let audit_error = match self.audit.record(&signal, &decision, &outcome).await {
            Ok(()) => None,
            Err(e) => {
                warn!(signal_id = %signal.id, error = %e, "Audit write failed");
                Some(e)
            }
        };

        ProcessedSignal {
            signal: Arc::unwrap_or_clone(signal),
            decision: Arc::unwrap_or_clone(decision),
            outcome,
            audit_error,
        }
    }

    /// Process several payloads with at most `concurrency` in flight.
    ///
    /// Rejected payloads are logged and left out of the result.
    pub async fn process_batch(
        &self,
        signals: Vec<NewSignal>,
        concurrency: usize,
    ) -> Vec<ProcessedSignal> {
        let count = signals.len();
        info!(count, "Processing signal batch");

        let results: Vec<ProcessedSignal> = futures::stream::iter(signals)
            .map(|new| self.process(new))
            .buffer_unordered(concurrency.max(1))
            .filter_map(|result| async move {
                match result {
                    Ok(processed) => Some(processed),
                    Err(e) => {
                        error!(error = %e, "Failed to process signal in batch");
                        None
                    }
                }
            })
            .collect()
            .await;

        info!(
            processed = results.len(),
            total = count,
            "Batch processing complete"
        );
        results
    }
}
