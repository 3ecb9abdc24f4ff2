//! Payload rendering for the three capability kinds.
//!
//! Pure functions from (signal, decision) to the JSON body a webhook receives.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::pipeline::types::{AttributeValue, Decision, Signal, truncate_chars};

/// Shape of payload a destination expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Task-board card.
    Board,
    /// Knowledge-log page.
    Log,
    /// Chat alert.
    Chat,
}

impl PayloadKind {
    pub fn render(&self, signal: &Signal, decision: &Decision) -> Value {
        match self {
            Self::Board => board_card(signal, decision),
            Self::Log => log_page(signal, decision),
            Self::Chat => chat_alert(signal, decision),
        }
    }
}

/// Team mailbox responsible for a signal, keyed on its `signal_type` attribute.
pub fn assignee(signal: &Signal) -> &'static str {
    match signal.attribute("signal_type").and_then(AttributeValue::as_text) {
        Some("customer_complaint") => "support",
        Some("urgent_email") => "management",
        Some("deadline") | Some("high_priority_task") => "project-lead",
        Some("system_alert") => "devops",
        Some("financial") => "finance",
        _ => "operations",
    }
}

fn sender(signal: &Signal) -> &str {
    signal
        .attribute("sender")
        .and_then(AttributeValue::as_text)
        .unwrap_or("unknown")
}

fn board_card(signal: &Signal, decision: &Decision) -> Value {
    let tier = decision.tier;
    let desc = format!(
        "**Priority:** {}/10\n\n**Source:** {}\n**From:** {}\n**Detected:** {}\n\n\
         **Matched rules:** {}\n\n**Recommended action:**\n{}\n\n**Details:**\n{}",
        decision.score,
        signal.source,
        sender(signal),
        signal.created_at.format("%Y-%m-%d %H:%M"),
        decision.matched_rules.join(", "),
        tier.recommended_action(),
        truncate_chars(&signal.body, 1000),
    );
    json!({
        "name": format!("[P{}] {}", decision.score, signal.subject),
        "desc": desc,
        "list": tier.board_list(),
        "pos": "top",
        "labels": [tier.as_str(), signal.source.as_str()],
        "assignee": assignee(signal),
        "signal_id": signal.id,
    })
}

fn log_page(signal: &Signal, decision: &Decision) -> Value {
    json!({
        "title": truncate_chars(&signal.subject, 100),
        "properties": {
            "priority": decision.score,
            "tier": decision.tier.as_str(),
            "status": "In Progress",
            "source": signal.source.as_str(),
            "assigned": assignee(signal),
            "matched_rules": decision.matched_rules,
            "detected_at": signal.created_at.to_rfc3339(),
        },
        "sections": [
            { "heading": "Summary", "text": truncate_chars(&signal.body, 2000) },
            { "heading": "Recommended Action", "text": decision.tier.recommended_action() },
        ],
        "signal_id": signal.id,
    })
}

fn chat_alert(signal: &Signal, decision: &Decision) -> Value {
    let tier = decision.tier;
    let text = format!(
        "{} {}\nPriority: {}/10 | Source: {} | From: {}\nAction: {}",
        tier.emoji(),
        tier.headline(&signal.subject),
        decision.score,
        signal.source,
        sender(signal),
        tier.recommended_action(),
    );
    json!({
        "text": text,
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": format!("{} New {} signal", tier.emoji(), tier.label()) }
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*Priority:*\n{}/10", decision.score) },
                    { "type": "mrkdwn", "text": format!("*Source:*\n{}", signal.source) },
                    { "type": "mrkdwn", "text": format!("*From:*\n{}", sender(signal)) },
                    { "type": "mrkdwn", "text": format!("*Detected:*\n{}", signal.created_at.format("%Y-%m-%d %H:%M")) }
                ]
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Subject:*\n{}", signal.subject) }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Recommended Action:*\n{}", tier.recommended_action()) }
            }
        ],
        "signal_id": signal.id,
    })
}
