//! libSQL backend: async `AuditSink` implementation.
//!
//! Supports local file and in-memory databases. One row per signal in
//! `signals`, one row per destination result in `deliveries`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuditError, DatabaseError};
use crate::pipeline::routing::PriorityTier;
use crate::pipeline::types::{
    AggregateStatus, Attributes, Decision, DestinationResult, Outcome, Signal, Source,
};
use crate::store::migrations;
use crate::store::traits::{AuditRecord, AuditSink, AuditStats, RecordFilter};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
///
/// An audit write runs as one transaction on that connection while holding
/// `gate` exclusively. Readers share the gate, so a half-written record is
/// never observed and concurrent writes never nest transactions.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Write the signal row and all delivery rows, or nothing.
    async fn insert_record(
        &self,
        signal: &Signal,
        decision: &Decision,
        outcome: &Outcome,
    ) -> Result<(), DatabaseError> {
        let _gate = self.gate.write().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin audit write: {e}")))?;

        let written = insert_rows(&tx, signal, decision, outcome).await;
        match written {
            Ok(()) => tx
                .commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("commit audit write: {e}"))),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(signal_id = %signal.id, "Audit rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    async fn load_deliveries(
        &self,
        signal_id: &str,
    ) -> Result<BTreeMap<String, DestinationResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT destination, status, attempts, error, elapsed_ms, reference FROM deliveries WHERE signal_id = ?1",
                params![signal_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_deliveries: {e}")))?;

        let mut deliveries = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_delivery(&row) {
                Ok((name, result)) => {
                    deliveries.insert(name, result);
                }
                Err(e) => warn!(signal_id, "Skipping delivery row: {e}"),
            }
        }
        Ok(deliveries)
    }

    async fn group_counts(&self, column: &str) -> Result<BTreeMap<String, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {column}, COUNT(*) FROM signals GROUP BY {column}"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("group_counts({column}): {e}")))?;

        let mut counts = BTreeMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let key: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            counts.insert(key, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

async fn insert_rows(
    conn: &Connection,
    signal: &Signal,
    decision: &Decision,
    outcome: &Outcome,
) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO signals ({SIGNAL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            signal.id.to_string(),
            signal.source.as_str(),
            signal.subject.as_str(),
            signal.body.as_str(),
            to_json(&signal.attributes)?,
            opt_text(signal.external_id.as_deref()),
            i64::from(decision.score),
            decision.tier.as_str(),
            to_json(&decision.matched_rules)?,
            to_json(&decision.destinations)?,
            outcome.aggregate_status.as_str(),
            format_datetime(&signal.created_at),
            format_datetime(&outcome.started_at),
            format_datetime(&outcome.completed_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_signal: {e}")))?;

    for (destination, result) in &outcome.per_destination {
        conn.execute(
            "INSERT INTO deliveries (signal_id, destination, status, attempts, error, elapsed_ms, reference) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                signal.id.to_string(),
                destination.as_str(),
                result.status.as_str(),
                i64::from(result.attempts),
                opt_text(result.error.as_deref()),
                i64::try_from(result.elapsed_ms).unwrap_or(i64::MAX),
                opt_text(result.reference.as_deref()),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_delivery: {e}")))?;
    }
    Ok(())
}


const SIGNAL_COLUMNS: &str = "id, source, subject, body, attributes, external_id, score, tier, matched_rules, destinations, aggregate_status, created_at, dispatch_started_at, dispatch_completed_at";

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("column {column}: {e}")))
}

/// Column order matches SIGNAL_COLUMNS.
fn row_to_parts(row: &libsql::Row) -> Result<(Signal, Decision, SignalTimes), DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("signal row column {idx}: {e}")))
    };

    let id_str = get_text(0)?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("signal id {id_str}: {e}")))?;
    let source: Source = get_text(1)?
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("{e}")))?;
    let attributes: Attributes = from_json(&get_text(4)?, "attributes")?;
    let score: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("signal row score: {e}")))?;
    let tier: PriorityTier = get_text(7)?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let aggregate_status: AggregateStatus = get_text(10)?
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let signal = Signal {
        id,
        source,
        subject: get_text(2)?,
        body: get_text(3)?,
        attributes,
        external_id: row.get::<String>(5).ok(),
        created_at: parse_datetime(&get_text(11)?),
    };
    let decision = Decision {
        signal_id: id,
        score: u8::try_from(score).unwrap_or(0),
        matched_rules: from_json(&get_text(8)?, "matched_rules")?,
        tier,
        destinations: from_json(&get_text(9)?, "destinations")?,
    };
    let times = SignalTimes {
        aggregate_status,
        started_at: parse_datetime(&get_text(12)?),
        completed_at: parse_datetime(&get_text(13)?),
    };
    Ok((signal, decision, times))
}

struct SignalTimes {
    aggregate_status: AggregateStatus,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
}

fn row_to_delivery(row: &libsql::Row) -> Result<(String, DestinationResult), DatabaseError> {
    let name: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("delivery destination: {e}")))?;
    let status_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("delivery status: {e}")))?;
    let attempts: i64 = row.get(2).unwrap_or(0);
    let elapsed_ms: i64 = row.get(4).unwrap_or(0);

    let result = DestinationResult {
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        error: row.get::<String>(3).ok(),
        elapsed_ms: u64::try_from(elapsed_ms).unwrap_or(0),
        reference: row.get::<String>(5).ok(),
    };
    Ok((name, result))
}

// ── AuditSink implementation ────────────────────────────────────────

#[async_trait]
impl AuditSink for LibSqlBackend {
    async fn record(
        &self,
        signal: &Signal,
        decision: &Decision,
        outcome: &Outcome,
    ) -> Result<(), AuditError> {
        self.insert_record(signal, decision, outcome)
            .await
            .map_err(|source| AuditError::WriteFailed {
                signal_id: signal.id,
                source,
            })?;
        debug!(
            signal_id = %signal.id,
            aggregate = outcome.aggregate_status.as_str(),
            "Audit record written"
        );
        Ok(())
    }

    async fn get_record(&self, signal_id: Uuid) -> Result<Option<AuditRecord>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?1"),
                params![signal_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_record: {e}"))),
        };
        let (signal, decision, times) = row_to_parts(&row)?;
        let per_destination = self.load_deliveries(&signal.id.to_string()).await?;
        Ok(Some(assemble(signal, decision, times, per_destination)))
    }

    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<AuditRecord>, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(source) = filter.source {
            values.push(Value::Text(source.as_str().to_string()));
            clauses.push(format!("source = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("aggregate_status = ?{}", values.len()));
        }
        if let Some(min_score) = filter.min_score {
            values.push(Value::Integer(i64::from(min_score)));
            clauses.push(format!("score >= ?{}", values.len()));
        }
        values.push(Value::Integer(i64::from(filter.effective_limit())));
        let limit_idx = values.len();

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {SIGNAL_COLUMNS} FROM signals {where_clause} ORDER BY created_at DESC LIMIT ?{limit_idx}"
        );

        let mut rows = self
            .conn()
            .query(&sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("list_records: {e}")))?;

        let mut parts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_parts(&row) {
                Ok(p) => parts.push(p),
                Err(e) => warn!("Skipping signal row: {e}"),
            }
        }

        let mut records = Vec::with_capacity(parts.len());
        for (signal, decision, times) in parts {
            let per_destination = self.load_deliveries(&signal.id.to_string()).await?;
            records.push(assemble(signal, decision, times, per_destination));
        }
        Ok(records)
    }

    async fn stats(&self) -> Result<AuditStats, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*), COALESCE(AVG(score), 0.0) FROM signals", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;

        let (total, average) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<i64>(0).unwrap_or(0),
                row.get::<f64>(1).unwrap_or(0.0),
            ),
            _ => (0, 0.0),
        };

        Ok(AuditStats {
            total_signals: u64::try_from(total).unwrap_or(0),
            by_status: self.group_counts("aggregate_status").await?,
            by_source: self.group_counts("source").await?,
            by_tier: self.group_counts("tier").await?,
            average_score: (average * 100.0).round() / 100.0,
        })
    }

    async fn has_external_id(
        &self,
        source: Source,
        external_id: &str,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM signals WHERE source = ?1 AND external_id = ?2",
                params![source.as_str(), external_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_external_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }
}

fn assemble(
    signal: Signal,
    decision: Decision,
    times: SignalTimes,
    per_destination: BTreeMap<String, DestinationResult>,
) -> AuditRecord {
    let outcome = Outcome {
        signal_id: signal.id,
        per_destination,
        aggregate_status: times.aggregate_status,
        started_at: times.started_at,
        completed_at: times.completed_at,
    };
    AuditRecord {
        signal,
        decision,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::pipeline::types::{DestinationStatus, NewSignal, SignalValidator};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn delivered(status: DestinationStatus, attempts: u32) -> DestinationResult {
        DestinationResult {
            status,
            attempts,
            error: (status != DestinationStatus::Succeeded).then(|| "HTTP 503".to_string()),
            elapsed_ms: 12,
            reference: (status == DestinationStatus::Succeeded).then(|| "ref-1".to_string()),
        }
    }

    fn make_record(source: &str, score: u8, external_id: Option<&str>) -> AuditRecord {
        let mut new = NewSignal::new(source, "Checkout down", "payments failing")
            .with_attribute("affected_users", 250)
            .with_attribute("sender", "ops@corp.example");
        if let Some(id) = external_id {
            new = new.with_external_id(id);
        }
        let signal = SignalValidator::default().validate(new).unwrap();
        let routed = score >= 7;
        let destinations: BTreeSet<String> = if routed {
            ["board", "chat"].iter().map(|s| s.to_string()).collect()
        } else {
            BTreeSet::new()
        };
        let decision = Decision {
            signal_id: signal.id,
            score,
            matched_rules: vec!["critical_keywords".into()],
            tier: PriorityTier::from_score(score),
            destinations,
        };
        let outcome = if routed {
            let per_destination = BTreeMap::from([
                ("board".to_string(), delivered(DestinationStatus::Succeeded, 1)),
                (
                    "chat".to_string(),
                    delivered(DestinationStatus::FailedAfterRetries, 3),
                ),
            ]);
            Outcome {
                signal_id: signal.id,
                aggregate_status: AggregateStatus::summarize(per_destination.values()),
                per_destination,
                started_at: Utc::now(),
                completed_at: Utc::now(),
            }
        } else {
            Outcome::no_destinations(signal.id)
        };
        AuditRecord {
            signal,
            decision,
            outcome,
        }
    }

    async fn insert(db: &LibSqlBackend, record: &AuditRecord) {
        db.record(&record.signal, &record.decision, &record.outcome)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn record_and_get_roundtrip() {
        let db = test_db().await;
        let record = make_record("mail", 9, Some("msg-1"));
        insert(&db, &record).await;

        let fetched = db.get_record(record.signal.id).await.unwrap().unwrap();
        assert_eq!(fetched.signal.subject, "Checkout down");
        assert_eq!(fetched.signal.source, Source::Mail);
        assert_eq!(fetched.signal.external_id.as_deref(), Some("msg-1"));
        assert_eq!(fetched.decision, record.decision);
        assert_eq!(fetched.outcome.aggregate_status, AggregateStatus::PartialSuccess);
        assert_eq!(fetched.outcome.per_destination, record.outcome.per_destination);
        assert_eq!(
            fetched.signal.attribute("affected_users").and_then(|v| v.as_f64()),
            Some(250.0)
        );
    }

    #[tokio::test]
    async fn get_record_not_found() {
        let db = test_db().await;
        assert!(db.get_record(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_record_is_a_write_failure() {
        let db = test_db().await;
        let record = make_record("chat", 8, None);
        insert(&db, &record).await;

        let err = db
            .record(&record.signal, &record.decision, &record.outcome)
            .await
            .unwrap_err();
        let AuditError::WriteFailed { signal_id, .. } = err;
        assert_eq!(signal_id, record.signal.id);
    }

    #[tokio::test]
    async fn failed_delivery_write_rolls_back_whole_record() {
        let db = test_db().await;
        db.conn()
            .execute(
                "CREATE TRIGGER reject_chat BEFORE INSERT ON deliveries
                 WHEN NEW.destination = 'chat'
                 BEGIN SELECT RAISE(ABORT, 'chat rejected'); END",
                (),
            )
            .await
            .unwrap();

        let record = make_record("mail", 9, Some("msg-7"));
        let err = db
            .record(&record.signal, &record.decision, &record.outcome)
            .await
            .unwrap_err();
        let AuditError::WriteFailed { signal_id, .. } = err;
        assert_eq!(signal_id, record.signal.id);

        assert!(db.get_record(record.signal.id).await.unwrap().is_none());
        assert!(!db.has_external_id(Source::Mail, "msg-7").await.unwrap());
        let mut rows = db
            .conn()
            .query("SELECT COUNT(*) FROM deliveries", ())
            .await
            .unwrap();
        let orphans: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(orphans, 0);

        // The connection is usable again after the rollback.
        let next = make_record("mail", 3, None);
        insert(&db, &next).await;
        assert_eq!(db.stats().await.unwrap().total_signals, 1);
    }

    #[tokio::test]
    async fn list_records_filters_and_orders() {
        let db = test_db().await;
        let low = make_record("sheet", 3, None);
        insert(&db, &low).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let high = make_record("mail", 10, None);
        insert(&db, &high).await;

        let all = db.list_records(&RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].signal.id, high.signal.id);

        let mail = db
            .list_records(&RecordFilter {
                source: Some(Source::Mail),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mail.len(), 1);

        let unrouted = db
            .list_records(&RecordFilter {
                status: Some(AggregateStatus::NoDestinations),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unrouted.len(), 1);
        assert_eq!(unrouted[0].signal.id, low.signal.id);

        let limited = db
            .list_records(&RecordFilter {
                min_score: Some(0),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn stats_aggregate_counts() {
        let db = test_db().await;
        insert(&db, &make_record("mail", 9, None)).await;
        insert(&db, &make_record("mail", 3, None)).await;
        insert(&db, &make_record("chat", 6, None)).await;

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total_signals, 3);
        assert_eq!(stats.by_source.get("mail"), Some(&2));
        assert_eq!(stats.by_status.get("no-destinations"), Some(&2));
        assert_eq!(stats.by_status.get("partial-success"), Some(&1));
        assert_eq!(stats.by_tier.get("critical"), Some(&1));
        assert!((stats.average_score - 6.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stats_on_empty_db() {
        let db = test_db().await;
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total_signals, 0);
        assert!(stats.by_status.is_empty());
    }

    #[tokio::test]
    async fn external_id_lookup_is_per_source() {
        let db = test_db().await;
        insert(&db, &make_record("mail", 4, Some("abc"))).await;
        assert!(db.has_external_id(Source::Mail, "abc").await.unwrap());
        assert!(!db.has_external_id(Source::Chat, "abc").await.unwrap());
        assert!(!db.has_external_id(Source::Mail, "xyz").await.unwrap());
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.db");
        let record = make_record("generic", 7, None);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            insert(&db, &record).await;
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_record(record.signal.id).await.unwrap().is_some());
    }
}
