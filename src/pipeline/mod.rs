//! Signal processing pipeline.
//!
//! Every inbound signal, from any source, flows through:
//! 1. `SignalValidator::validate()`: boundary checks, identity assignment
//! 2. `ScoringEngine::score()`: deterministic 0–10 priority
//! 3. `RoutingPolicy::route()`: priority → destination set
//! 4. `Dispatcher::dispatch()`: concurrent delivery with per-destination retry
//! 5. `AuditSink::record()`: append-only audit trail
//!
//! Steps 1–3 are pure. Failures in step 4 are isolated per destination and
//! reported in the `Outcome`; failures in step 5 never alter the outcome.

pub mod dispatcher;
pub mod intake;
pub mod processor;
pub mod routing;
pub mod scoring;
pub mod types;

pub use dispatcher::{DispatchConfig, Dispatcher, RetryPolicy};
pub use intake::{IntakeReceiver, IntakeSender, intake_queue, spawn_intake_worker};
pub use processor::{ProcessedSignal, SignalProcessor};
pub use routing::{PriorityTier, RoutingConfig, RoutingPolicy, ScoreBand};
pub use scoring::{ScoringConfig, ScoringEngine};
