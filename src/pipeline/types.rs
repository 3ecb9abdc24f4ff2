//! Shared types for the signal pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SignalError;
use crate::pipeline::routing::PriorityTier;

// ── Source ──────────────────────────────────────────────────────────

/// Origin of a signal. Fixed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Mail,
    Sheet,
    Chat,
    Generic,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Sheet => "sheet",
            Self::Chat => "chat",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mail" | "email" | "gmail" => Ok(Self::Mail),
            "sheet" | "sheets" => Ok(Self::Sheet),
            "chat" | "slack" => Ok(Self::Chat),
            "generic" | "manual" | "api" => Ok(Self::Generic),
            _ => Err(SignalError::UnknownSource(s.to_string())),
        }
    }
}

// ── Attributes ──────────────────────────────────────────────────────

/// Scalar attribute value attached to a signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl AttributeValue {
    /// Numeric view. Numeric strings (e.g. sheet cells) parse leniently.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().replace(',', "").parse().ok(),
            Self::Bool(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON value, dropping anything that is not a scalar.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(Self::Number),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<f64> for AttributeValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

// ── Signals ─────────────────────────────────────────────────────────

/// Signal as handed over by an ingestion source, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSignal {
    /// Source tag: "mail", "sheet", "chat", "generic" (or an alias).
    pub source: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Identifier in the origin system, used for dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl NewSignal {
    pub fn new(source: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            subject: subject.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// A validated inbound operational event. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub source: Source,
    pub subject: String,
    pub body: String,
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// Validates ingestion payloads and assigns identity.
#[derive(Debug, Clone)]
pub struct SignalValidator {
    pub max_body_chars: usize,
    pub max_subject_chars: usize,
}

impl Default for SignalValidator {
    fn default() -> Self {
        Self {
            max_body_chars: 10_000,
            max_subject_chars: 500,
        }
    }
}

impl SignalValidator {
    pub fn validate(&self, new: NewSignal) -> Result<Signal, SignalError> {
        let source: Source = new.source.parse()?;

        let body_len = new.body.chars().count();
        if body_len > self.max_body_chars {
            return Err(SignalError::BodyTooLarge {
                len: body_len,
                max: self.max_body_chars,
            });
        }
        let subject_len = new.subject.chars().count();
        if subject_len > self.max_subject_chars {
            return Err(SignalError::SubjectTooLarge {
                len: subject_len,
                max: self.max_subject_chars,
            });
        }

        let attributes = new
            .attributes
            .iter()
            .filter_map(|(k, v)| AttributeValue::from_json(v).map(|v| (k.clone(), v)))
            .collect();

        Ok(Signal {
            id: Uuid::new_v4(),
            source,
            subject: new.subject,
            body: new.body,
            attributes,
            external_id: new.external_id,
            created_at: Utc::now(),
        })
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Scoring result for a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub signal_id: Uuid,
    pub score: u8,
    /// Rules that fired, in evaluation order.
    pub matched_rules: Vec<String>,
    pub tier: PriorityTier,
    pub destinations: BTreeSet<String>,
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Terminal status of one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationStatus {
    Succeeded,
    FailedAfterRetries,
    Skipped,
}

impl DestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::FailedAfterRetries => "failed-after-retries",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for DestinationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed-after-retries" => Ok(Self::FailedAfterRetries),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown destination status: {other}")),
        }
    }
}

/// Settled result for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationResult {
    pub status: DestinationStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Reference returned by the destination (card id, message id...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl DestinationResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: DestinationStatus::Skipped,
            attempts: 0,
            error: Some(reason.into()),
            elapsed_ms: 0,
            reference: None,
        }
    }
}

/// Summary over all destinations of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateStatus {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
    NoDestinations,
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllSucceeded => "all-succeeded",
            Self::PartialSuccess => "partial-success",
            Self::AllFailed => "all-failed",
            Self::NoDestinations => "no-destinations",
        }
    }

    /// Pure summary of independently settled results.
    pub fn summarize<'a>(results: impl IntoIterator<Item = &'a DestinationResult>) -> Self {
        let (mut total, mut succeeded) = (0usize, 0usize);
        for result in results {
            total += 1;
            if result.status == DestinationStatus::Succeeded {
                succeeded += 1;
            }
        }
        match (total, succeeded) {
            (0, _) => Self::NoDestinations,
            (t, s) if t == s => Self::AllSucceeded,
            (_, 0) => Self::AllFailed,
            _ => Self::PartialSuccess,
        }
    }
}

impl FromStr for AggregateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all-succeeded" => Ok(Self::AllSucceeded),
            "partial-success" => Ok(Self::PartialSuccess),
            "all-failed" => Ok(Self::AllFailed),
            "no-destinations" => Ok(Self::NoDestinations),
            other => Err(format!("unknown aggregate status: {other}")),
        }
    }
}

/// Settled result of dispatching a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub signal_id: Uuid,
    pub per_destination: BTreeMap<String, DestinationResult>,
    pub aggregate_status: AggregateStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl Outcome {
    pub fn no_destinations(signal_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            signal_id,
            per_destination: BTreeMap::new(),
            aggregate_status: AggregateStatus::NoDestinations,
            started_at: now,
            completed_at: now,
        }
    }

    pub fn count(&self, status: DestinationStatus) -> usize {
        self.per_destination
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}
