//! `AuditSink` trait: narrow append/query interface over the audit trail.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuditError, DatabaseError};
use crate::pipeline::types::{AggregateStatus, Decision, Outcome, Signal, Source};

/// Everything recorded for one processed signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub signal: Signal,
    pub decision: Decision,
    pub outcome: Outcome,
}

/// Query filter for `list_records`. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    pub source: Option<Source>,
    pub status: Option<AggregateStatus>,
    pub min_score: Option<u8>,
    pub limit: Option<u32>,
}

impl RecordFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 500;

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

/// Aggregate counters over the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_signals: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_source: BTreeMap<String, u64>,
    pub by_tier: BTreeMap<String, u64>,
    pub average_score: f64,
}

/// Persists Signal + Decision + Outcome. Append-only from the core's view.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one processed signal.
    async fn record(
        &self,
        signal: &Signal,
        decision: &Decision,
        outcome: &Outcome,
    ) -> Result<(), AuditError>;

    async fn get_record(&self, signal_id: Uuid) -> Result<Option<AuditRecord>, DatabaseError>;

    /// Most recent first.
    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<AuditRecord>, DatabaseError>;

    async fn stats(&self) -> Result<AuditStats, DatabaseError>;

    /// Whether a signal with this origin id has already been recorded.
    async fn has_external_id(&self, source: Source, external_id: &str)
    -> Result<bool, DatabaseError>;
}
