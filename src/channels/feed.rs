//! HTTP JSON feed source.
//!
//! Polls a URL that returns a JSON array. The array's element shape
//! depends on the feed kind: mail items, sheet tables, or chat events.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::channels::chat::{ChatEvent, ChatNormalizer};
use crate::channels::mail::MailItem;
use crate::channels::sheets::SheetTable;
use crate::channels::{SignalSource, fit_to_limits};
use crate::error::ChannelError;
use crate::pipeline::types::{NewSignal, SignalValidator};

/// Element shape of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Mail,
    Sheet,
    Chat,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Sheet => "sheet",
            Self::Chat => "chat",
        }
    }
}

/// Polls a JSON feed over HTTP.
pub struct HttpFeedSource {
    name: String,
    url: String,
    kind: FeedKind,
    token: Option<SecretString>,
    client: reqwest::Client,
    normalizer: ChatNormalizer,
    limits: SignalValidator,
}

impl HttpFeedSource {
    pub fn new(
        url: impl Into<String>,
        kind: FeedKind,
        limits: SignalValidator,
    ) -> Result<Self, ChannelError> {
        let normalizer = ChatNormalizer::new().map_err(|e| ChannelError::InvalidPayload {
            name: kind.as_str().into(),
            reason: format!("chat normalizer: {e}"),
        })?;
        Ok(Self {
            name: format!("{}-feed", kind.as_str()),
            url: url.into(),
            kind,
            token: None,
            client: reqwest::Client::new(),
            normalizer,
            limits,
        })
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn fetch_failed(&self, reason: impl Into<String>) -> ChannelError {
        ChannelError::FetchFailed {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SignalSource for HttpFeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_new(&self) -> Result<Vec<NewSignal>, ChannelError> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.fetch_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.fetch_failed(format!("HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| self.fetch_failed(e.to_string()))?;

        let signals = decode_feed(self.kind, &body, Utc::now().date_naive(), &self.normalizer)
            .map_err(|reason| ChannelError::InvalidPayload {
                name: self.name.clone(),
                reason,
            })?;
        debug!(source = %self.name, count = signals.len(), "Feed fetched");

        Ok(signals
            .into_iter()
            .map(|s| fit_to_limits(s, &self.limits))
            .collect())
    }
}

/// Decode a feed body into ingestion payloads.
pub fn decode_feed(
    kind: FeedKind,
    body: &str,
    today: NaiveDate,
    normalizer: &ChatNormalizer,
) -> Result<Vec<NewSignal>, String> {
    let signals = match kind {
        FeedKind::Mail => serde_json::from_str::<Vec<MailItem>>(body)
            .map_err(|e| e.to_string())?
            .into_iter()
            .map(MailItem::into_signal)
            .collect(),
        FeedKind::Sheet => serde_json::from_str::<Vec<SheetTable>>(body)
            .map_err(|e| e.to_string())?
            .into_iter()
            .flat_map(|table| table.signals(today))
            .collect(),
        FeedKind::Chat => serde_json::from_str::<Vec<ChatEvent>>(body)
            .map_err(|e| e.to_string())?
            .into_iter()
            .filter_map(|event| normalizer.event_to_signal(event))
            .collect(),
    };
    Ok(signals)
}
