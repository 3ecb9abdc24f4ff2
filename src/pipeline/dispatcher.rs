//! Parallel dispatcher with per-destination retry and partial-failure handling.
//!
//! Every selected destination runs in its own task. Each task owns its retry
//! loop and writes exactly one result; the dispatcher joins all of them
//! before assembling the [`Outcome`]. A failing destination never blocks or
//! fails another, and the dispatcher itself never returns an error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::destinations::Destination;
use crate::error::AdapterError;
use crate::pipeline::types::{
    AggregateStatus, Decision, DestinationResult, DestinationStatus, Outcome, Signal,
};

/// Retry, backoff and timeout knobs for a single destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt: base · 2^(n-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Default)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    /// Optional wall-clock ceiling for one signal's whole dispatch.
    pub deadline: Option<Duration>,
}

/// Lifecycle of one destination within a dispatch.
///
/// `Pending → Attempting → {Succeeded | RetryScheduled → Attempting | Exhausted}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Attempting { attempt: u32 },
    RetryScheduled { attempt: u32, delay: Duration },
    Succeeded,
    Exhausted,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }
}

/// Fans a decision out to its destinations concurrently.
pub struct Dispatcher {
    destinations: HashMap<String, Arc<dyn Destination>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            destinations: HashMap::new(),
            config,
        }
    }

    /// Register an adapter under its own name. Replaces any previous one.
    pub fn register(&mut self, destination: Arc<dyn Destination>) {
        let name = destination.name().to_string();
        if self.destinations.insert(name.clone(), destination).is_some() {
            warn!(destination = %name, "Replacing previously registered destination");
        }
    }

    pub fn with_destination(mut self, destination: Arc<dyn Destination>) -> Self {
        self.register(destination);
        self
    }

    /// Registered destination names, sorted.
    pub fn destination_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.destinations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Deliver to every destination in the decision and wait for all of them.
    ///
    /// The returned outcome has exactly one entry per selected destination.
    pub async fn dispatch(&self, signal: Arc<Signal>, decision: Arc<Decision>) -> Outcome {
        if decision.destinations.is_empty() {
            debug!(signal_id = %decision.signal_id, "No destinations selected");
            return Outcome::no_destinations(decision.signal_id);
        }

        let started_at = Utc::now();
        let deadline = self.config.deadline.map(|d| Instant::now() + d);

        let mut slots: Vec<(String, Slot)> = Vec::with_capacity(decision.destinations.len());
        for name in &decision.destinations {
            let slot = match self.destinations.get(name) {
                Some(destination) => Slot::Running(DeliveryTask::spawn(
                    Arc::clone(destination),
                    Arc::clone(&signal),
                    Arc::clone(&decision),
                    self.config.retry.clone(),
                )),
                None => {
                    warn!(
                        signal_id = %decision.signal_id,
                        destination = %name,
                        "No adapter registered, skipping destination"
                    );
                    Slot::Settled(DestinationResult::skipped("no adapter registered"))
                }
            };
            slots.push((name.clone(), slot));
        }

        let mut per_destination = BTreeMap::new();
        for (name, slot) in slots {
            let result = match slot {
                Slot::Settled(result) => result,
                Slot::Running(mut task) => task.settle(&name, deadline).await,
            };
            per_destination.insert(name, result);
        }

        let aggregate_status = AggregateStatus::summarize(per_destination.values());
        info!(
            signal_id = %decision.signal_id,
            aggregate = aggregate_status.as_str(),
            destinations = per_destination.len(),
            "Dispatch settled"
        );

        Outcome {
            signal_id: decision.signal_id,
            per_destination,
            aggregate_status,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

enum Slot {
    Settled(DestinationResult),
    Running(DeliveryTask),
}

/// A spawned delivery. Aborted on drop, so an abandoned dispatch releases
/// the adapter future and whatever it holds.
struct DeliveryTask {
    handle: JoinHandle<DestinationResult>,
    attempts: Arc<AtomicU32>,
    started: Instant,
}

impl DeliveryTask {
    fn spawn(
        destination: Arc<dyn Destination>,
        signal: Arc<Signal>,
        decision: Arc<Decision>,
        policy: RetryPolicy,
    ) -> Self {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let handle = tokio::spawn(async move {
            deliver(destination, signal, decision, policy, counter).await
        });
        Self {
            handle,
            attempts,
            started: Instant::now(),
        }
    }

    async fn settle(&mut self, name: &str, deadline: Option<Instant>) -> DestinationResult {
        let joined = match deadline {
            Some(at) => match tokio::time::timeout_at(at, &mut self.handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.handle.abort();
                    warn!(destination = %name, "Dispatch deadline exceeded, abandoning destination");
                    return self.failed("dispatch deadline exceeded".into());
                }
            },
            None => (&mut self.handle).await,
        };

        match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(destination = %name, error = %e, "Delivery task did not complete");
                self.failed(format!("delivery task aborted: {e}"))
            }
        }
    }

    fn failed(&self, error: String) -> DestinationResult {
        DestinationResult {
            status: DestinationStatus::FailedAfterRetries,
            attempts: self.attempts.load(Ordering::Relaxed),
            error: Some(error),
            elapsed_ms: elapsed_ms(self.started),
            reference: None,
        }
    }
}

impl Drop for DeliveryTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Retry loop for one destination. Always returns a terminal result.
async fn deliver(
    destination: Arc<dyn Destination>,
    signal: Arc<Signal>,
    decision: Arc<Decision>,
    policy: RetryPolicy,
    attempts: Arc<AtomicU32>,
) -> DestinationResult {
    let name = destination.name().to_string();
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut state = AttemptState::Pending;
    debug!(destination = %name, signal_id = %signal.id, state = ?state, "Delivery queued");

    let mut attempt = 0;
    let error = loop {
        attempt += 1;
        attempts.store(attempt, Ordering::Relaxed);
        state = AttemptState::Attempting { attempt };
        debug!(destination = %name, signal_id = %signal.id, state = ?state, "Invoking destination");

        let error = match tokio::time::timeout(
            policy.attempt_timeout,
            destination.invoke(&signal, &decision),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                state = AttemptState::Succeeded;
                info!(
                    destination = %name,
                    signal_id = %signal.id,
                    attempt,
                    reference = receipt.reference.as_deref().unwrap_or("-"),
                    state = ?state,
                    "Destination delivered"
                );
                return DestinationResult {
                    status: DestinationStatus::Succeeded,
                    attempts: attempt,
                    error: None,
                    elapsed_ms: elapsed_ms(started),
                    reference: receipt.reference,
                };
            }
            Ok(Err(e)) => e,
            Err(_) => AdapterError::Timeout {
                destination: name.clone(),
                timeout: policy.attempt_timeout,
            },
        };

        if !error.is_retryable() || attempt >= max_attempts {
            break error;
        }

        let delay = policy.backoff(attempt);
        state = AttemptState::RetryScheduled { attempt, delay };
        warn!(
            destination = %name,
            signal_id = %signal.id,
            error = %error,
            state = ?state,
            "Destination attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    };

    state = AttemptState::Exhausted;
    warn!(
        destination = %name,
        signal_id = %signal.id,
        attempts = attempt,
        retryable = error.is_retryable(),
        error = %error,
        state = ?state,
        "Destination failed"
    );
    DestinationResult {
        status: DestinationStatus::FailedAfterRetries,
        attempts: attempt,
        error: Some(error.to_string()),
        elapsed_ms: elapsed_ms(started),
        reference: None,
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;

    use super::*;
    use crate::destinations::DeliveryReceipt;
    use crate::pipeline::routing::PriorityTier;
    use crate::pipeline::types::{NewSignal, SignalValidator};

    /// Scripted destination: fails `failures` times, then succeeds.
    struct Scripted {
        name: String,
        failures: u32,
        retryable: bool,
        delay: Duration,
        calls: AtomicU32,
    }

    impl Scripted {
        fn ok(name: &str) -> Arc<Self> {
            Self::build(name, 0, true, Duration::ZERO)
        }

        fn failing(name: &str, retryable: bool) -> Arc<Self> {
            Self::build(name, u32::MAX, retryable, Duration::ZERO)
        }

        fn build(name: &str, failures: u32, retryable: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                failures,
                retryable,
                delay,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Destination for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            _signal: &Signal,
            _decision: &Decision,
        ) -> Result<DeliveryReceipt, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.failures {
                return Err(if self.retryable {
                    AdapterError::transient(&self.name, format!("503 on call {call}"))
                } else {
                    AdapterError::permanent(&self.name, "401 unauthorized")
                });
            }
            Ok(DeliveryReceipt::with_reference(format!("{}-{call}", self.name)))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(2),
        }
    }

    fn dispatcher(policy: RetryPolicy) -> Dispatcher {
        Dispatcher::new(DispatchConfig {
            retry: policy,
            deadline: None,
        })
    }

    fn fixture(destinations: &[&str]) -> (Arc<Signal>, Arc<Decision>) {
        let signal = SignalValidator::default()
            .validate(NewSignal::new("mail", "Outage", "Everything is down"))
            .unwrap();
        let decision = Decision {
            signal_id: signal.id,
            score: 10,
            matched_rules: vec!["critical_keywords".into()],
            tier: PriorityTier::Critical,
            destinations: destinations.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        };
        (Arc::new(signal), Arc::new(decision))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn terminal_states() {
        assert!(AttemptState::Succeeded.is_terminal());
        assert!(AttemptState::Exhausted.is_terminal());
        assert!(!AttemptState::Pending.is_terminal());
        assert!(!AttemptState::Attempting { attempt: 1 }.is_terminal());
        assert!(
            !AttemptState::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
            .is_terminal()
        );
    }

    #[tokio::test]
    async fn empty_destination_set_short_circuits() {
        let board = Scripted::ok("board");
        let dispatcher = dispatcher(fast_policy()).with_destination(board.clone());
        let (signal, decision) = fixture(&[]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.aggregate_status, AggregateStatus::NoDestinations);
        assert!(outcome.per_destination.is_empty());
        assert_eq!(board.calls(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_is_isolated() {
        let board = Scripted::ok("board");
        let log = Scripted::failing("log", false);
        let chat = Scripted::ok("chat");
        let dispatcher = dispatcher(fast_policy())
            .with_destination(board.clone())
            .with_destination(log.clone())
            .with_destination(chat.clone());
        let (signal, decision) = fixture(&["board", "log", "chat"]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.aggregate_status, AggregateStatus::PartialSuccess);
        assert_eq!(outcome.per_destination.len(), 3);
        assert_eq!(outcome.count(DestinationStatus::Succeeded), 2);
        assert_eq!(outcome.count(DestinationStatus::FailedAfterRetries), 1);

        let failed = &outcome.per_destination["log"];
        assert_eq!(failed.attempts, 1);
        assert!(failed.error.as_deref().unwrap().contains("permanent"));
        assert_eq!(log.calls(), 1);
        assert_eq!(outcome.per_destination["board"].reference.as_deref(), Some("board-1"));
    }

    #[tokio::test]
    async fn transient_failure_exhausts_retry_budget() {
        let chat = Scripted::failing("chat", true);
        let dispatcher = dispatcher(fast_policy()).with_destination(chat.clone());
        let (signal, decision) = fixture(&["chat"]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.aggregate_status, AggregateStatus::AllFailed);
        let result = &outcome.per_destination["chat"];
        assert_eq!(result.status, DestinationStatus::FailedAfterRetries);
        assert_eq!(result.attempts, 3);
        assert!(result.error.as_deref().unwrap().contains("503 on call 3"));
        assert_eq!(chat.calls(), 3);
    }

    #[tokio::test]
    async fn transient_failure_recovers_within_budget() {
        let board = Scripted::build("board", 2, true, Duration::ZERO);
        let dispatcher = dispatcher(fast_policy()).with_destination(board.clone());
        let (signal, decision) = fixture(&["board"]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.aggregate_status, AggregateStatus::AllSucceeded);
        let result = &outcome.per_destination["board"];
        assert_eq!(result.attempts, 3);
        assert_eq!(result.reference.as_deref(), Some("board-3"));
    }

    #[tokio::test]
    async fn slow_attempts_time_out_and_count_as_retries() {
        let log = Scripted::build("log", 0, true, Duration::from_millis(500));
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let dispatcher = dispatcher(policy).with_destination(log.clone());
        let (signal, decision) = fixture(&["log"]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        let result = &outcome.per_destination["log"];
        assert_eq!(result.status, DestinationStatus::FailedAfterRetries);
        assert_eq!(result.attempts, 2);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(log.calls(), 2);
    }

    #[tokio::test]
    async fn unregistered_destination_is_skipped() {
        let board = Scripted::ok("board");
        let dispatcher = dispatcher(fast_policy()).with_destination(board);
        let (signal, decision) = fixture(&["board", "pager"]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.per_destination.len(), 2);
        assert_eq!(
            outcome.per_destination["pager"].status,
            DestinationStatus::Skipped
        );
        assert_eq!(outcome.aggregate_status, AggregateStatus::PartialSuccess);
    }

    #[tokio::test]
    async fn destinations_run_concurrently() {
        let delay = Duration::from_millis(150);
        let dispatcher = dispatcher(fast_policy())
            .with_destination(Scripted::build("board", 0, true, delay))
            .with_destination(Scripted::build("log", 0, true, delay))
            .with_destination(Scripted::build("chat", 0, true, delay));
        let (signal, decision) = fixture(&["board", "log", "chat"]);

        let started = std::time::Instant::now();
        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.aggregate_status, AggregateStatus::AllSucceeded);
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "sequential execution would take at least 450ms, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn failing_destination_does_not_delay_others() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
            attempt_timeout: Duration::from_secs(2),
        };
        let dispatcher = dispatcher(policy)
            .with_destination(Scripted::ok("board"))
            .with_destination(Scripted::failing("chat", true));
        let (signal, decision) = fixture(&["board", "chat"]);

        let outcome = dispatcher.dispatch(signal, decision).await;
        assert!(outcome.per_destination["board"].elapsed_ms < 100);
        assert!(outcome.per_destination["chat"].elapsed_ms >= 300);
    }

    #[tokio::test]
    async fn deadline_abandons_unfinished_destinations() {
        let dispatcher = Dispatcher::new(DispatchConfig {
            retry: fast_policy(),
            deadline: Some(Duration::from_millis(50)),
        })
        .with_destination(Scripted::ok("board"))
        .with_destination(Scripted::build("log", 0, true, Duration::from_secs(5)));
        let (signal, decision) = fixture(&["board", "log"]);

        let started = std::time::Instant::now();
        let outcome = dispatcher.dispatch(signal, decision).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.aggregate_status, AggregateStatus::PartialSuccess);
        let log = &outcome.per_destination["log"];
        assert_eq!(log.status, DestinationStatus::FailedAfterRetries);
        assert_eq!(log.attempts, 1);
        assert!(log.error.as_deref().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn registering_twice_replaces_adapter() {
        let first = Scripted::failing("board", false);
        let second = Scripted::ok("board");
        let dispatcher = dispatcher(fast_policy())
            .with_destination(first.clone())
            .with_destination(second.clone());
        assert_eq!(dispatcher.destination_names(), vec!["board".to_string()]);

        let (signal, decision) = fixture(&["board"]);
        let outcome = dispatcher.dispatch(signal, decision).await;
        assert_eq!(outcome.aggregate_status, AggregateStatus::AllSucceeded);
        assert_eq!(first.calls(), 0);
    }
}
