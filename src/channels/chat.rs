//! Chat ingestion: event payloads and message text normalization.

use regex::Regex;
use serde::Deserialize;

use crate::pipeline::types::NewSignal;

/// Event callback envelope, as posted by the chat platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatEnvelope {
    #[serde(default)]
    pub event: Option<ChatEvent>,
}

/// A single chat event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub channel: String,
    /// Platform timestamp, unique per channel.
    #[serde(default)]
    pub ts: Option<String>,
}

/// Rewrites platform markup into plain text.
///
/// `<@U123>` → `@U123`, `<#C1|ops>` → `#ops`, `<https://x|label>` → `label`,
/// `<https://x>` → `https://x`; whitespace runs collapse to one space.
#[derive(Debug, Clone)]
pub struct ChatNormalizer {
    mention: Regex,
    channel: Regex,
    link: Regex,
    whitespace: Regex,
}

impl ChatNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            mention: Regex::new(r"<@([A-Z0-9]+)(?:\|[^>]*)?>")?,
            channel: Regex::new(r"<#[A-Z0-9]+\|([^>]+)>")?,
            link: Regex::new(r"<((?:https?|mailto):[^|>]+)(?:\|([^>]+))?>")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn normalize(&self, text: &str) -> String {
        let text = self.mention.replace_all(text, "@$1");
        let text = self.channel.replace_all(&text, "#$1");
        let text = self.link.replace_all(&text, |caps: &regex::Captures<'_>| {
            caps.get(2)
                .or_else(|| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        });
        self.whitespace.replace_all(text.trim(), " ").into_owned()
    }

    /// Convert an event into an ingestion payload. Only `message` events
    /// produce a signal.
    pub fn event_to_signal(&self, event: ChatEvent) -> Option<NewSignal> {
        if event.kind != "message" {
            return None;
        }
        let user = if event.user.is_empty() {
            "unknown"
        } else {
            event.user.as_str()
        };
        let mut signal = NewSignal::new(
            "chat",
            format!("Chat message from {user}"),
            self.normalize(&event.text),
        )
        .with_attribute("sender", user)
        .with_attribute("channel", event.channel.as_str())
        .with_attribute("signal_type", "chat_message");
        signal.external_id = event.ts.map(|ts| format!("{}:{ts}", event.channel));
        Some(signal)
    }
}
