//! Configuration types.
//!
//! Everything is read once at startup from `OPS_*` environment variables
//! and passed down explicitly. `from_lookup` takes any key → value function
//! so tests never touch the process environment.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::FeedKind;
use crate::destinations::PayloadKind;
use crate::error::ConfigError;
use crate::pipeline::dispatcher::{DispatchConfig, RetryPolicy};
use crate::pipeline::routing::{RoutingConfig, RoutingPolicy, ScoreBand};
use crate::pipeline::scoring::ScoringConfig;
use crate::pipeline::types::SignalValidator;

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Intake queue and worker settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub queue_capacity: usize,
    pub concurrency: usize,
}

/// Webhook endpoints per capability. A missing URL leaves the capability
/// unregistered.
#[derive(Debug, Clone, Default)]
pub struct DestinationsConfig {
    pub board_url: Option<String>,
    pub log_url: Option<String>,
    pub chat_url: Option<String>,
    pub token: Option<SecretString>,
}

impl DestinationsConfig {
    /// Configured `(name, url, kind)` triples.
    pub fn endpoints(&self) -> Vec<(&'static str, &str, PayloadKind)> {
        [
            ("board", &self.board_url, PayloadKind::Board),
            ("log", &self.log_url, PayloadKind::Log),
            ("chat", &self.chat_url, PayloadKind::Chat),
        ]
        .into_iter()
        .filter_map(|(name, url, kind)| url.as_deref().map(|u| (name, u, kind)))
        .collect()
    }
}

/// Polled feeds.
#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub mail_feed_url: Option<String>,
    pub sheet_feed_url: Option<String>,
    pub chat_feed_url: Option<String>,
    pub token: Option<SecretString>,
    pub poll_interval: Duration,
}

impl SourcesConfig {
    pub fn feeds(&self) -> Vec<(&str, FeedKind)> {
        [
            (&self.mail_feed_url, FeedKind::Mail),
            (&self.sheet_feed_url, FeedKind::Sheet),
            (&self.chat_feed_url, FeedKind::Chat),
        ]
        .into_iter()
        .filter_map(|(url, kind)| url.as_deref().map(|u| (u, kind)))
        .collect()
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub limits: SignalValidator,
    pub intake: IntakeConfig,
    pub scoring: ScoringConfig,
    pub routing: RoutingConfig,
    /// Tiered routing bands. When set, they replace the binary threshold.
    pub routing_bands: Option<Vec<ScoreBand>>,
    pub dispatch: DispatchConfig,
    pub destinations: DestinationsConfig,
    pub sources: SourcesConfig,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server = ServerConfig {
            host: get("OPS_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "OPS_PORT", 8000)?,
        };

        let limits = SignalValidator {
            max_body_chars: parse_or(&get, "OPS_MAX_BODY_CHARS", 10_000)?,
            max_subject_chars: parse_or(&get, "OPS_MAX_SUBJECT_CHARS", 500)?,
        };

        let intake = IntakeConfig {
            queue_capacity: parse_or(&get, "OPS_INTAKE_CAPACITY", 256)?,
            concurrency: parse_or(&get, "OPS_INTAKE_CONCURRENCY", 8)?,
        };

        let scoring = scoring_from_lookup(&lookup, &get)?;

        let destinations = match lookup("OPS_DESTINATIONS") {
            Some(raw) => split_list(&raw),
            None => RoutingConfig::default().destinations,
        };
        if destinations.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "OPS_DESTINATIONS".into(),
                message: "destination set is empty".into(),
            });
        }
        let threshold: u8 = parse_or(&get, "OPS_PRIORITY_THRESHOLD", 7)?;
        if threshold > 10 {
            return Err(ConfigError::InvalidValue {
                key: "OPS_PRIORITY_THRESHOLD".into(),
                message: format!("{threshold} is outside 0-10"),
            });
        }
        let routing = RoutingConfig {
            threshold,
            destinations,
        };
        let routing_bands = get("OPS_ROUTING_BANDS")
            .map(|raw| parse_bands(&raw))
            .transpose()?;

        let max_attempts: u32 = parse_or(&get, "OPS_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OPS_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        let dispatch = DispatchConfig {
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(parse_or(&get, "OPS_BACKOFF_BASE_MS", 2_000)?),
                max_delay: Duration::from_millis(parse_or(&get, "OPS_BACKOFF_MAX_MS", 10_000)?),
                attempt_timeout: Duration::from_secs(parse_or(&get, "OPS_ATTEMPT_TIMEOUT_SECS", 30)?),
            },
            deadline: get("OPS_DISPATCH_DEADLINE_SECS")
                .map(|v| parse_value::<u64>("OPS_DISPATCH_DEADLINE_SECS", &v))
                .transpose()?
                .map(Duration::from_secs),
        };

        let destinations = DestinationsConfig {
            board_url: get("OPS_BOARD_URL"),
            log_url: get("OPS_LOG_URL"),
            chat_url: get("OPS_CHAT_URL"),
            token: get("OPS_DESTINATION_TOKEN").map(SecretString::from),
        };

        let poll_secs: u64 = parse_or(&get, "OPS_POLL_INTERVAL_SECS", 60)?;
        let sources = SourcesConfig {
            mail_feed_url: get("OPS_MAIL_FEED_URL"),
            sheet_feed_url: get("OPS_SHEET_FEED_URL"),
            chat_feed_url: get("OPS_CHAT_FEED_URL"),
            token: get("OPS_FEED_TOKEN").map(SecretString::from),
            poll_interval: Duration::from_secs(poll_secs.max(1)),
        };

        Ok(Self {
            server,
            database_path: get("OPS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/ops-center.db")),
            log_dir: get("OPS_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./logs")),
            limits,
            intake,
            scoring,
            routing,
            routing_bands,
            dispatch,
            destinations,
            sources,
        })
    }

    /// Build the routing policy this configuration describes.
    pub fn routing_policy(&self) -> Result<RoutingPolicy, ConfigError> {
        match &self.routing_bands {
            Some(bands) => RoutingPolicy::tiered(bands.clone()),
            None => RoutingPolicy::binary(&self.routing),
        }
    }
}

fn scoring_from_lookup<F, G>(lookup: &F, get: &G) -> Result<ScoringConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    G: Fn(&str) -> Option<String>,
{
    let mut scoring = ScoringConfig::default();
    scoring.base_score = parse_or(get, "OPS_BASE_SCORE", scoring.base_score)?;

    for (terms_key, weight_key, rule_name) in [
        ("OPS_CRITICAL_KEYWORDS", "OPS_CRITICAL_WEIGHT", "critical_keywords"),
        ("OPS_URGENCY_KEYWORDS", "OPS_URGENCY_WEIGHT", "urgency_keywords"),
        ("OPS_NEGATIVE_KEYWORDS", "OPS_NEGATIVE_WEIGHT", "negative_sentiment"),
    ] {
        let terms = lookup(terms_key).map(|raw| non_empty_list(terms_key, &raw)).transpose()?;
        if let Some(rule) = scoring.keyword_rule_mut(rule_name) {
            if let Some(terms) = terms {
                rule.terms = terms;
            }
            rule.weight = parse_or(get, weight_key, rule.weight)?;
        }
    }

    for (threshold_key, weight_key, rule_name) in [
        ("OPS_REVENUE_THRESHOLD", "OPS_REVENUE_WEIGHT", "revenue_impact"),
        (
            "OPS_AFFECTED_USERS_THRESHOLD",
            "OPS_AFFECTED_USERS_WEIGHT",
            "affected_users",
        ),
    ] {
        if let Some(rule) = scoring.threshold_rule_mut(rule_name) {
            rule.threshold = parse_or(get, threshold_key, rule.threshold)?;
            rule.weight = parse_or(get, weight_key, rule.weight)?;
        }
    }

    if let Some(raw) = lookup("OPS_EXECUTIVE_MARKERS") {
        scoring.escalation.markers = non_empty_list("OPS_EXECUTIVE_MARKERS", &raw)?;
    }
    scoring.escalation.weight = parse_or(get, "OPS_EXECUTIVE_WEIGHT", scoring.escalation.weight)?;

    if let Some(raw) = get("OPS_REPEAT_COMPLAINT_THRESHOLD") {
        let threshold: f64 = parse_value("OPS_REPEAT_COMPLAINT_THRESHOLD", &raw)?;
        let weight = parse_or(get, "OPS_REPEAT_COMPLAINT_WEIGHT", 1)?;
        scoring = scoring.with_repeat_issue(threshold, weight);
    }

    Ok(scoring)
}

/// Comma list that must name at least one entry once the key is set.
fn non_empty_list(key: &str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let items = split_list(raw);
    if items.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "list is empty".into(),
        });
    }
    Ok(items)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.into(),
        message: format!("'{raw}': {e}"),
    })
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `"9:board,log,chat;5:log"` → two bands.
fn parse_bands(raw: &str) -> Result<Vec<ScoreBand>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "OPS_ROUTING_BANDS".into(),
        message,
    };
    let bands = raw
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|band| {
            let (min, names) = band
                .split_once(':')
                .ok_or_else(|| invalid(format!("'{band}' is not <min>:<destinations>")))?;
            let min_score: u8 = min
                .trim()
                .parse()
                .map_err(|e| invalid(format!("'{min}': {e}")))?;
            let destinations: BTreeSet<String> = split_list(names).into_iter().collect();
            if destinations.is_empty() {
                return Err(invalid(format!("band {min_score} has no destinations")));
            }
            Ok(ScoreBand {
                min_score,
                destinations,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if bands.is_empty() {
        return Err(invalid("no bands given".into()));
    }
    Ok(bands)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.server.bind_addr(), "0.0.0.0:8000");
        assert_eq!(config.routing.threshold, 7);
        assert_eq!(config.routing.destinations, vec!["board", "log", "chat"]);
        assert_eq!(config.dispatch.retry, RetryPolicy::default());
        assert!(config.dispatch.deadline.is_none());
        assert_eq!(config.limits.max_body_chars, 10_000);
        assert_eq!(config.limits.max_subject_chars, 500);
        assert_eq!(config.intake.queue_capacity, 256);
        assert_eq!(config.intake.concurrency, 8);
        assert_eq!(config.sources.poll_interval, Duration::from_secs(60));
        assert_eq!(config.database_path, PathBuf::from("./data/ops-center.db"));
        assert!(config.destinations.endpoints().is_empty());
        assert!(config.sources.feeds().is_empty());
    }

    #[test]
    fn overrides_apply() {
        let config = load(&[
            ("OPS_PORT", "9090"),
            ("OPS_PRIORITY_THRESHOLD", "5"),
            ("OPS_DESTINATIONS", "board, chat"),
            ("OPS_MAX_ATTEMPTS", "5"),
            ("OPS_BACKOFF_BASE_MS", "100"),
            ("OPS_DISPATCH_DEADLINE_SECS", "45"),
            ("OPS_CHAT_URL", "https://hooks.example/chat"),
            ("OPS_DESTINATION_TOKEN", "tok"),
            ("OPS_CRITICAL_KEYWORDS", "sev1, p0"),
        ])
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.routing.threshold, 5);
        assert_eq!(config.routing.destinations, vec!["board", "chat"]);
        assert_eq!(config.dispatch.retry.max_attempts, 5);
        assert_eq!(config.dispatch.retry.base_delay, Duration::from_millis(100));
        assert_eq!(config.dispatch.deadline, Some(Duration::from_secs(45)));
        let endpoints = config.destinations.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].0, "chat");
        assert_eq!(config.scoring.keyword_rules[0].terms, vec!["sev1", "p0"]);
    }

    #[test]
    fn scoring_weights_thresholds_and_markers_apply() {
        let config = load(&[
            ("OPS_CRITICAL_WEIGHT", "5"),
            ("OPS_URGENCY_WEIGHT", "2"),
            ("OPS_NEGATIVE_WEIGHT", "1"),
            ("OPS_REVENUE_THRESHOLD", "1000.5"),
            ("OPS_REVENUE_WEIGHT", "3"),
            ("OPS_AFFECTED_USERS_THRESHOLD", "50"),
            ("OPS_AFFECTED_USERS_WEIGHT", "2"),
            ("OPS_EXECUTIVE_MARKERS", "CEO, founder"),
            ("OPS_EXECUTIVE_WEIGHT", "2"),
            ("OPS_REPEAT_COMPLAINT_THRESHOLD", "2"),
        ])
        .unwrap();
        let scoring = &config.scoring;
        let weights: Vec<i32> = scoring.keyword_rules.iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![5, 2, 1]);

        let revenue = &scoring.threshold_rules[0];
        assert_eq!(revenue.name, "revenue_impact");
        assert_eq!((revenue.threshold, revenue.weight), (1000.5, 3));
        let users = &scoring.threshold_rules[1];
        assert_eq!((users.threshold, users.weight), (50.0, 2));
        let repeat = &scoring.threshold_rules[2];
        assert_eq!(repeat.name, ScoringConfig::REPEAT_ISSUE);
        assert_eq!((repeat.threshold, repeat.weight), (2.0, 1));

        assert_eq!(scoring.escalation.markers, vec!["CEO", "founder"]);
        assert_eq!(scoring.escalation.weight, 2);
    }

    #[test]
    fn repeat_complaint_rule_is_off_by_default() {
        let config = load(&[]).unwrap();
        assert!(
            config
                .scoring
                .threshold_rules
                .iter()
                .all(|r| r.name != ScoringConfig::REPEAT_ISSUE)
        );
    }

    #[test]
    fn bad_scoring_values_are_rejected() {
        assert!(load(&[("OPS_REVENUE_THRESHOLD", "lots")]).is_err());
        assert!(load(&[("OPS_CRITICAL_WEIGHT", "4.5")]).is_err());
        assert!(load(&[("OPS_EXECUTIVE_MARKERS", " , ")]).is_err());
    }

    #[test]
    fn unparseable_value_names_the_key() {
        let err = load(&[("OPS_MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(err.to_string().contains("OPS_MAX_ATTEMPTS"));
    }

    #[test]
    fn empty_destination_set_is_rejected() {
        assert!(load(&[("OPS_DESTINATIONS", " , ")]).is_err());
    }

    #[test]
    fn empty_keyword_list_is_rejected() {
        assert!(load(&[("OPS_URGENCY_KEYWORDS", ",")]).is_err());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        assert!(load(&[("OPS_PRIORITY_THRESHOLD", "11")]).is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(load(&[("OPS_MAX_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn routing_bands_switch_to_tiered_policy() {
        let config = load(&[("OPS_ROUTING_BANDS", "9:board,log,chat; 5:log")]).unwrap();
        let policy = config.routing_policy().unwrap();
        assert_eq!(policy.threshold(), Some(5));
        assert_eq!(policy.route(6).destinations.len(), 1);
        assert_eq!(policy.route(9).destinations.len(), 3);

        assert!(load(&[("OPS_ROUTING_BANDS", "nine:board")]).is_err());
        assert!(load(&[("OPS_ROUTING_BANDS", "5:")]).is_err());
        assert!(load(&[("OPS_ROUTING_BANDS", ";")]).is_err());
        assert!(load(&[("OPS_ROUTING_BANDS", " ; ;")]).is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let config = load(&[("OPS_DESTINATION_TOKEN", "hunter2")]).unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
