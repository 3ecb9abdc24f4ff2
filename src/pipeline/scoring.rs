//! Priority scoring engine.
//!
//! Weighted additive rules, evaluated in a fixed order and clamped to 0–10:
//! - keyword classes against the lower-cased subject + body (critical,
//!   urgency, negative sentiment), each firing at most once
//! - numeric threshold rules against attributes (revenue impact, affected users)
//! - executive escalation marker in selected text attributes
//!
//! Pure and synchronous: no I/O, no clock, no randomness.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::types::{AttributeValue, Signal};

/// Highest possible score.
pub const MAX_SCORE: i32 = 10;

/// A class of keywords that contributes `weight` if any term is a substring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub name: String,
    pub weight: i32,
    pub terms: Vec<String>,
}

impl KeywordRule {
    pub fn new(name: &str, weight: i32, terms: &[&str]) -> Self {
        Self {
            name: name.into(),
            weight,
            terms: terms.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Fires when a numeric attribute is strictly above `threshold`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub name: String,
    pub attribute: String,
    pub threshold: f64,
    pub weight: i32,
}

/// Fires when any of `attributes` contains one of `markers` (case-insensitive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    pub name: String,
    pub attributes: Vec<String>,
    pub markers: Vec<String>,
    pub weight: i32,
}

/// Scoring configuration, immutable once the engine is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub base_score: i32,
    pub keyword_rules: Vec<KeywordRule>,
    pub threshold_rules: Vec<ThresholdRule>,
    pub escalation: EscalationRule,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_score: 3,
            keyword_rules: vec![
                KeywordRule::new(
                    "critical_keywords",
                    4,
                    &["emergency", "critical", "down", "outage", "crash", "failed"],
                ),
                KeywordRule::new(
                    "urgency_keywords",
                    3,
                    &["urgent", "asap", "immediate", "escalation"],
                ),
                KeywordRule::new(
                    "negative_sentiment",
                    2,
                    &[
                        "angry",
                        "unacceptable",
                        "disappointed",
                        "terrible",
                        "awful",
                        "frustrated",
                    ],
                ),
            ],
            threshold_rules: vec![
                ThresholdRule {
                    name: "revenue_impact".into(),
                    attribute: "revenue_loss_per_hour".into(),
                    threshold: 5_000.0,
                    weight: 2,
                },
                ThresholdRule {
                    name: "affected_users".into(),
                    attribute: "affected_users".into(),
                    threshold: 100.0,
                    weight: 1,
                },
            ],
            escalation: EscalationRule {
                name: "executive_escalation".into(),
                attributes: vec![
                    "escalation".into(),
                    "escalation_level".into(),
                    "sender".into(),
                ],
                markers: vec![
                    "ceo".into(),
                    "cto".into(),
                    "cfo".into(),
                    "coo".into(),
                    "executive".into(),
                ],
                weight: 1,
            },
        }
    }
}

impl ScoringConfig {
    /// Name of the optional repeat-complaint rule.
    pub const REPEAT_ISSUE: &'static str = "repeat_issue";

    /// Add +`weight` when `complaint_count` is above `threshold`.
    /// Off by default.
    pub fn with_repeat_issue(mut self, threshold: f64, weight: i32) -> Self {
        self.threshold_rules.retain(|r| r.name != Self::REPEAT_ISSUE);
        self.threshold_rules.push(ThresholdRule {
            name: Self::REPEAT_ISSUE.into(),
            attribute: "complaint_count".into(),
            threshold,
            weight,
        });
        self
    }

    pub fn keyword_rule_mut(&mut self, name: &str) -> Option<&mut KeywordRule> {
        self.keyword_rules.iter_mut().find(|r| r.name == name)
    }

    pub fn threshold_rule_mut(&mut self, name: &str) -> Option<&mut ThresholdRule> {
        self.threshold_rules.iter_mut().find(|r| r.name == name)
    }
}

/// Points plus the rules that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Score {
    pub points: u8,
    pub matched_rules: Vec<String>,
}

/// Rule-based scorer.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    /// Build an engine. Terms and markers are lower-cased once here.
    ///
    /// Fails on configuration that could never score sensibly: no keyword
    /// classes, a class without terms, or blank terms.
    pub fn new(mut config: ScoringConfig) -> Result<Self, ConfigError> {
        if config.keyword_rules.is_empty() {
            return Err(invalid("scoring.keyword_rules", "at least one keyword class is required"));
        }
        for rule in &mut config.keyword_rules {
            if rule.terms.is_empty() {
                return Err(invalid(
                    &format!("scoring.{}", rule.name),
                    "keyword class has no terms",
                ));
            }
            for term in &mut rule.terms {
                *term = term.trim().to_lowercase();
                if term.is_empty() {
                    return Err(invalid(&format!("scoring.{}", rule.name), "blank keyword term"));
                }
            }
        }
        config.escalation.markers = config
            .escalation
            .markers
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();

        Ok(Self { config })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score a signal. Reads only subject, body and attributes.
    pub fn score(&self, signal: &Signal) -> Score {
        let text = format!("{} {}", signal.subject, signal.body).to_lowercase();
        let mut total = self.config.base_score;
        let mut matched_rules = Vec::new();

        for rule in &self.config.keyword_rules {
            if rule.terms.iter().any(|term| text.contains(term.as_str())) {
                total += rule.weight;
                matched_rules.push(rule.name.clone());
            }
        }

        for rule in &self.config.threshold_rules {
            let value = signal.attribute(&rule.attribute).and_then(AttributeValue::as_f64);
            if value.is_some_and(|v| v > rule.threshold) {
                total += rule.weight;
                matched_rules.push(rule.name.clone());
            }
        }

        let escalation = &self.config.escalation;
        let escalated = escalation
            .attributes
            .iter()
            .filter_map(|key| signal.attribute(key).and_then(AttributeValue::as_text))
            .map(str::to_lowercase)
            .any(|value| escalation.markers.iter().any(|m| value.contains(m.as_str())));
        if escalated {
            total += escalation.weight;
            matched_rules.push(escalation.name.clone());
        }

        let points = total.clamp(0, MAX_SCORE) as u8;
        debug!(
            signal_id = %signal.id,
            raw = total,
            points,
            rules = ?matched_rules,
            "Signal scored"
        );

        Score {
            points,
            matched_rules,
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    }
}
