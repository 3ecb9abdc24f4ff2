//! Mail ingestion: feed items, raw RFC 822 messages, and content classification.

use mail_parser::MessageParser;
use serde::Deserialize;

use crate::error::ChannelError;
use crate::pipeline::types::NewSignal;

/// One message from a mail feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailItem {
    /// Message id in the mailbox, used for dedup.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// Content class of a mail message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailKind {
    CustomerComplaint,
    UrgentEmail,
    Deadline,
    SystemAlert,
    General,
}

impl MailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerComplaint => "customer_complaint",
            Self::UrgentEmail => "urgent_email",
            Self::Deadline => "deadline",
            Self::SystemAlert => "system_alert",
            Self::General => "general_email",
        }
    }
}

const COMPLAINT_TERMS: &[&str] = &[
    "complaint",
    "issue",
    "problem",
    "dissatisfied",
    "disappointed",
    "terrible",
    "awful",
];
const URGENT_TERMS: &[&str] = &["urgent", "asap", "immediate", "critical", "emergency"];
const DEADLINE_TERMS: &[&str] = &["deadline", "due date", "overdue", "expired"];

/// Classify a message. First match wins: complaint, urgent (subject only),
/// deadline, system alert.
pub fn classify_email(subject: &str, body: &str, sender: &str) -> MailKind {
    let subject = subject.to_lowercase();
    let body = body.to_lowercase();
    let in_either = |terms: &[&str]| {
        terms
            .iter()
            .any(|t| subject.contains(t) || body.contains(t))
    };

    if in_either(COMPLAINT_TERMS) {
        MailKind::CustomerComplaint
    } else if URGENT_TERMS.iter().any(|t| subject.contains(t)) {
        MailKind::UrgentEmail
    } else if in_either(DEADLINE_TERMS) {
        MailKind::Deadline
    } else if sender.to_lowercase().contains("noreply") || subject.contains("alert") {
        MailKind::SystemAlert
    } else {
        MailKind::General
    }
}

impl MailItem {
    /// Convert to an ingestion payload tagged with sender and content class.
    pub fn into_signal(self) -> NewSignal {
        let kind = classify_email(&self.subject, &self.body, &self.from);
        let mut signal = NewSignal::new("mail", self.subject, self.body)
            .with_attribute("sender", self.from)
            .with_attribute("signal_type", kind.as_str());
        signal.external_id = self.id;
        signal
    }
}

/// Parse a raw RFC 822 message.
pub fn parse_raw_email(raw: &[u8]) -> Result<MailItem, ChannelError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ChannelError::InvalidPayload {
            name: "mail".into(),
            reason: "not an RFC 822 message".into(),
        })?;

    let from = message
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .unwrap_or_default()
        .to_string();

    Ok(MailItem {
        id: message.message_id().map(str::to_string),
        from,
        subject: message.subject().unwrap_or_default().to_string(),
        body: message
            .body_text(0)
            .map(|b| b.trim().to_string())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complaint_wins_over_urgency() {
        assert_eq!(
            classify_email("URGENT problem with order", "", "a@b.c"),
            MailKind::CustomerComplaint
        );
    }

    #[test]
    fn urgency_only_counts_in_subject() {
        assert_eq!(
            classify_email("Server status", "this is urgent", "ops@corp.example"),
            MailKind::General
        );
        assert_eq!(
            classify_email("ASAP: sign contract", "", "ops@corp.example"),
            MailKind::UrgentEmail
        );
    }

    #[test]
    fn deadline_and_alert_classes() {
        assert_eq!(
            classify_email("Reminder", "the due date is tomorrow", "pm@corp.example"),
            MailKind::Deadline
        );
        assert_eq!(
            classify_email("Nightly job", "finished", "noreply@ci.example"),
            MailKind::SystemAlert
        );
        assert_eq!(
            classify_email("Disk alert on db-2", "", "monitor@corp.example"),
            MailKind::SystemAlert
        );
    }

    #[test]
    fn mail_item_becomes_tagged_signal() {
        let item = MailItem {
            id: Some("m-1".into()),
            from: "ceo@corp.example".into(),
            subject: "Customer complaint".into(),
            body: "They are angry".into(),
        };
        let signal = item.into_signal();
        assert_eq!(signal.source, "mail");
        assert_eq!(signal.external_id.as_deref(), Some("m-1"));
        assert_eq!(signal.attributes["sender"], "ceo@corp.example");
        assert_eq!(signal.attributes["signal_type"], "customer_complaint");
    }

    #[test]
    fn parses_raw_rfc822() {
        let raw = b"From: Jane Ops <jane@corp.example>\r\n\
To: ops@corp.example\r\n\
Subject: Payment gateway outage\r\n\
Message-ID: <abc123@corp.example>\r\n\
\r\n\
Checkout has been failing for 20 minutes.\r\n";
        let item = parse_raw_email(raw).unwrap();
        assert_eq!(item.from, "jane@corp.example");
        assert_eq!(item.subject, "Payment gateway outage");
        assert_eq!(item.id.as_deref(), Some("abc123@corp.example"));
        assert!(item.body.contains("failing for 20 minutes"));
    }
}
