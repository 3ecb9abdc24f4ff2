//! Routing policy: score → destination set and response expectation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ── Priority tier ───────────────────────────────────────────────────

/// Response-time expectation class derived from the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityTier {
    pub fn from_score(score: u8) -> Self {
        match score {
            9.. => Self::Critical,
            7..=8 => Self::High,
            5..=6 => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Upper-case label used in headlines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH PRIORITY",
            Self::Critical => "CRITICAL",
        }
    }

    /// Expected response window. `None` means no commitment.
    pub fn response_window(&self) -> Option<Duration> {
        match self {
            Self::Critical => Some(Duration::ZERO),
            Self::High => Some(Duration::from_secs(60 * 60)),
            Self::Medium => Some(Duration::from_secs(4 * 60 * 60)),
            Self::Low => None,
        }
    }

    pub fn recommended_action(&self) -> &'static str {
        match self {
            Self::Critical => "Immediate executive escalation and emergency response required",
            Self::High => "Urgent team action required within 1 hour",
            Self::Medium => "Standard response required within 4 hours",
            Self::Low => "Standard review and response",
        }
    }

    /// Board list a card for this tier lands in.
    pub fn board_list(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High Priority",
            Self::Medium => "Medium Priority",
            Self::Low => "Low Priority",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Critical => "🚨",
            Self::High => "⚠️",
            Self::Medium => "📌",
            Self::Low => "ℹ️",
        }
    }

    /// One-line headline, e.g. `CRITICAL: Production down`.
    pub fn headline(&self, subject: &str) -> String {
        let subject: String = subject.chars().take(100).collect();
        format!("{}: {}", self.label(), subject)
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown priority tier: {other}")),
        }
    }
}

// ── Routing policy ──────────────────────────────────────────────────

/// Destinations selected for scores at or above `min_score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBand {
    pub min_score: u8,
    pub destinations: BTreeSet<String>,
}

/// Routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    pub threshold: u8,
    pub destinations: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            threshold: 7,
            destinations: vec!["board".into(), "log".into(), "chat".into()],
        }
    }
}

/// Result of routing a score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub tier: PriorityTier,
    pub destinations: BTreeSet<String>,
}

/// Pure lookup from score to destinations.
///
/// Bands are kept sorted by descending `min_score`; the first band whose
/// minimum is met wins. Scores below every band route nowhere (audit only).
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    bands: Vec<ScoreBand>,
}

impl RoutingPolicy {
    /// Binary policy: `score >= threshold` → full set, otherwise nothing.
    pub fn binary(config: &RoutingConfig) -> Result<Self, ConfigError> {
        if config.destinations.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "routing.destinations".into(),
                message: "destination set is empty".into(),
            });
        }
        Self::tiered(vec![ScoreBand {
            min_score: config.threshold,
            destinations: config.destinations.iter().cloned().collect(),
        }])
    }

    /// Tiered policy with one destination set per score band.
    pub fn tiered(mut bands: Vec<ScoreBand>) -> Result<Self, ConfigError> {
        if bands.is_empty() || bands.iter().any(|b| b.destinations.is_empty()) {
            return Err(ConfigError::InvalidValue {
                key: "routing.bands".into(),
                message: "destination set is empty".into(),
            });
        }
        if let Some(band) = bands.iter().find(|b| b.min_score > 10) {
            return Err(ConfigError::InvalidValue {
                key: "routing.threshold".into(),
                message: format!("{} is outside 0-10", band.min_score),
            });
        }
        bands.sort_by(|a, b| b.min_score.cmp(&a.min_score));
        Ok(Self { bands })
    }

    /// Lowest score that routes anywhere.
    pub fn threshold(&self) -> Option<u8> {
        self.bands.iter().map(|b| b.min_score).min()
    }

    pub fn route(&self, score: u8) -> Route {
        let destinations = self
            .bands
            .iter()
            .find(|band| score >= band.min_score)
            .map(|band| band.destinations.clone())
            .unwrap_or_default();
        Route {
            tier: PriorityTier::from_score(score),
            destinations,
        }
    }
}
