//! Generic HTTP webhook destination.
//!
//! Posts the rendered payload as JSON. Status classification:
//! 2xx succeeds; 408, 429, 5xx and connection/timeout errors are transient;
//! every other status is permanent.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::destinations::{DeliveryReceipt, Destination, PayloadKind};
use crate::error::AdapterError;
use crate::pipeline::types::{Decision, Signal};

/// Webhook-backed destination.
pub struct WebhookDestination {
    name: String,
    url: String,
    kind: PayloadKind,
    token: Option<SecretString>,
    client: reqwest::Client,
}

impl WebhookDestination {
    pub fn new(name: impl Into<String>, url: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind,
            token: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Share a client (connection pool) across destinations.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        signal: &Signal,
        decision: &Decision,
    ) -> Result<DeliveryReceipt, AdapterError> {
        let payload = self.kind.render(signal, decision);
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                AdapterError::permanent(&self.name, format!("invalid request: {e}"))
            } else {
                AdapterError::transient(&self.name, e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(destination = %self.name, status = %status, "Webhook responded");

        if status.is_success() {
            return Ok(DeliveryReceipt {
                reference: reference_from_body(&body),
            });
        }

        let reason = format!("HTTP {status}: {}", snippet(&body));
        if is_transient_status(status) {
            Err(AdapterError::transient(&self.name, reason))
        } else {
            Err(AdapterError::permanent(&self.name, reason))
        }
    }
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

/// Pull an identifier out of a JSON response, if the target returned one.
fn reference_from_body(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["id", "url", "ts"].iter().find_map(|key| match value.get(*key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "<empty body>".into()
    } else {
        crate::pipeline::types::truncate_chars(trimmed, 200)
    }
}
