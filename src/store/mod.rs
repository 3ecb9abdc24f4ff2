//! Persistence layer: libSQL-backed audit trail.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AuditRecord, AuditSink, AuditStats, RecordFilter};
