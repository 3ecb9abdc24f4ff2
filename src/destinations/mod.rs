//! Destination adapters: the capabilities a decision fans out to.
//!
//! Each adapter implements [`Destination`]. The dispatcher never branches on
//! destination names; new targets are added by implementing the trait and
//! registering the adapter.

pub mod render;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;
use crate::pipeline::types::{Decision, Signal};

pub use render::PayloadKind;
pub use webhook::WebhookDestination;

/// What a destination hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    /// Identifier in the target system (card id, page id, message ts).
    pub reference: Option<String>,
}

impl DeliveryReceipt {
    pub fn with_reference(reference: impl Into<String>) -> Self {
        Self {
            reference: Some(reference.into()),
        }
    }
}

/// A target capability (task board, knowledge log, chat alert...).
#[async_trait]
pub trait Destination: Send + Sync {
    /// Capability name used by routing ("board", "log", "chat").
    fn name(&self) -> &str;

    /// Deliver one signal. Must classify failures as transient or permanent.
    async fn invoke(
        &self,
        signal: &Signal,
        decision: &Decision,
    ) -> Result<DeliveryReceipt, AdapterError>;
}
