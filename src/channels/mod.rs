//! Ingestion sources: where signals come from.
//!
//! Sources only produce `NewSignal`s; validation, scoring and delivery
//! happen behind the intake queue.

pub mod chat;
pub mod feed;
pub mod mail;
pub mod poller;
pub mod sheets;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::pipeline::types::{NewSignal, SignalValidator, truncate_chars};

pub use chat::{ChatEnvelope, ChatEvent, ChatNormalizer};
pub use feed::{FeedKind, HttpFeedSource};
pub use mail::{MailItem, classify_email, parse_raw_email};
pub use poller::spawn_source_poller;

/// A pollable source of signals.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Source name for logs.
    fn name(&self) -> &str;

    /// Fetch whatever is new since the last call.
    async fn fetch_new(&self) -> Result<Vec<NewSignal>, ChannelError>;
}

/// Truncate subject and body so the payload passes validation.
pub fn fit_to_limits(mut signal: NewSignal, limits: &SignalValidator) -> NewSignal {
    if signal.subject.chars().count() > limits.max_subject_chars {
        signal.subject = truncate_chars(&signal.subject, limits.max_subject_chars);
    }
    if signal.body.chars().count() > limits.max_body_chars {
        signal.body = truncate_chars(&signal.body, limits.max_body_chars);
    }
    signal
}
