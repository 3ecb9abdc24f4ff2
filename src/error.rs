//! Error types for the operations center.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A signal rejected at the ingestion boundary. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("Invalid signal: unknown source '{0}'")]
    UnknownSource(String),

    #[error("Invalid signal: body is {len} characters, maximum is {max}")]
    BodyTooLarge { len: usize, max: usize },

    #[error("Invalid signal: subject is {len} characters, maximum is {max}")]
    SubjectTooLarge { len: usize, max: usize },
}

/// Failure reported by a destination adapter.
///
/// The adapter decides whether a failure is transient; the dispatcher only
/// retries what `is_retryable()` admits.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("Destination {destination} failed (transient): {reason}")]
    Transient { destination: String, reason: String },

    #[error("Destination {destination} failed (permanent): {reason}")]
    Permanent { destination: String, reason: String },

    #[error("Destination {destination} timed out after {timeout:?}")]
    Timeout {
        destination: String,
        timeout: Duration,
    },
}

impl AdapterError {
    pub fn transient(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    /// Timeouts count as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// Failure to persist an audit record. Non-fatal to dispatch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("Failed to record audit entry for signal {signal_id}: {source}")]
    WriteFailed {
        signal_id: Uuid,
        #[source]
        source: DatabaseError,
    },
}

/// Ingestion source errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Source {name} fetch failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Invalid payload from source {name}: {reason}")]
    InvalidPayload { name: String, reason: String },

    #[error("Intake queue is full")]
    QueueFull,

    #[error("Intake queue is closed")]
    QueueClosed,
}

/// Errors surfaced at the processor call boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidSignal(#[from] SignalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_error_retry_classification() {
        assert!(AdapterError::transient("board", "503").is_retryable());
        assert!(
            AdapterError::Timeout {
                destination: "chat".into(),
                timeout: Duration::from_secs(30),
            }
            .is_retryable()
        );
        assert!(!AdapterError::permanent("log", "400 bad request").is_retryable());
    }

    #[test]
    fn signal_error_display() {
        let err = SignalError::BodyTooLarge {
            len: 10_001,
            max: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "Invalid signal: body is 10001 characters, maximum is 10000"
        );
        let err = SignalError::UnknownSource("fax".into());
        assert_eq!(err.to_string(), "Invalid signal: unknown source 'fax'");
    }

    #[test]
    fn pipeline_error_is_transparent_for_invalid_signal() {
        let err: PipelineError = SignalError::UnknownSource("pager".into()).into();
        assert_eq!(err.to_string(), "Invalid signal: unknown source 'pager'");
    }

    #[test]
    fn audit_error_carries_signal_id() {
        let id = Uuid::new_v4();
        let err = AuditError::WriteFailed {
            signal_id: id,
            source: DatabaseError::Query("disk full".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_string()));
        assert!(msg.contains("disk full"));
    }
}
