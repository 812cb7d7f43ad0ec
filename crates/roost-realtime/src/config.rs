//! Realtime configuration
//!
//! Defaults match the production client. Overrides can come from a TOML file
//! (path given directly or through `ROOST_REALTIME_CONFIG`) and from
//! individual `ROOST_REALTIME_*` environment variables, applied in that order.

use crate::error::RealtimeError;
use crate::spec::DEFAULT_SCHEMA;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming a TOML config file
pub const CONFIG_PATH_ENV: &str = "ROOST_REALTIME_CONFIG";

const MAX_EVENTS_PER_SECOND_ENV: &str = "ROOST_REALTIME_MAX_EVENTS_PER_SECOND";
const BATCH_WINDOW_MS_ENV: &str = "ROOST_REALTIME_BATCH_WINDOW_MS";
const MAX_BATCH_SIZE_ENV: &str = "ROOST_REALTIME_MAX_BATCH_SIZE";
const MAX_RETRIES_ENV: &str = "ROOST_REALTIME_MAX_RETRIES";

/// Per-channel event throttle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Ceiling before events are queued instead of delivered immediately
    pub max_events_per_second: f64,
    /// Maximum delay before a partial batch is flushed
    pub batch_window_ms: u64,
    /// Events drained per flush, and the forced-flush trigger
    pub max_batch_size: usize,
}

impl RateLimitConfig {
    /// Batch window as duration
    #[inline]
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events_per_second: 10.0,
            batch_window_ms: 100,
            max_batch_size: 50,
        }
    }
}

/// Reconnection backoff schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Upper bound on any delay
    pub max_delay_ms: u64,
    /// Retries before giving up
    pub max_retries: u32,
}

impl BackoffPolicy {
    /// `min(base * multiplier^attempt, max)`
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // delays are far below 2^52 ms
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_secs_f64(capped / 1000.0)
    }

    /// Whether another retry is allowed after `attempt` retries
    #[inline]
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 1.5,
            max_delay_ms: 30_000,
            max_retries: 10,
        }
    }
}

/// Realtime layer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Event throttle applied per channel
    pub rate_limit: RateLimitConfig,
    /// Reconnection schedule applied per channel
    pub backoff: BackoffPolicy,
    /// Schema for specs that do not name one
    pub default_schema: String,
    /// Error text markers classifying a failure as permanent
    pub permanent_error_markers: Vec<String>,
    /// Error text markers flagging an authentication failure in the logs
    pub auth_error_markers: Vec<String>,
}

impl RealtimeConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With rate limit
    #[inline]
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// With backoff
    #[inline]
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// With default schema
    #[inline]
    #[must_use]
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }

    /// Parse from TOML; missing keys keep their defaults
    ///
    /// # Errors
    /// Parse failure or out-of-range values
    pub fn from_toml_str(contents: &str) -> Result<Self, RealtimeError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the TOML file at `path` (or `ROOST_REALTIME_CONFIG`),
    /// then individual environment overrides
    ///
    /// # Errors
    /// Unreadable or invalid file, unparsable override, out-of-range values
    pub fn from_env_or_file(path: Option<&Path>) -> Result<Self, RealtimeError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .map_err(|source| RealtimeError::ConfigIo { path, source })?;
                toml::from_str(&contents)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROOST_REALTIME_*` overrides read through `lookup`
    ///
    /// # Errors
    /// An override that does not parse
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), RealtimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, MAX_EVENTS_PER_SECOND_ENV)? {
            self.rate_limit.max_events_per_second = v;
        }
        if let Some(v) = parse_override(&lookup, BATCH_WINDOW_MS_ENV)? {
            self.rate_limit.batch_window_ms = v;
        }
        if let Some(v) = parse_override(&lookup, MAX_BATCH_SIZE_ENV)? {
            self.rate_limit.max_batch_size = v;
        }
        if let Some(v) = parse_override(&lookup, MAX_RETRIES_ENV)? {
            self.backoff.max_retries = v;
        }
        Ok(())
    }

    /// Check value ranges
    ///
    /// # Errors
    /// First out-of-range value found
    pub fn validate(&self) -> Result<(), RealtimeError> {
        let invalid = |msg: &str| Err(RealtimeError::InvalidConfig(msg.to_string()));

        if !(self.rate_limit.max_events_per_second > 0.0) {
            return invalid("max_events_per_second must be positive");
        }
        if self.rate_limit.max_batch_size == 0 {
            return invalid("max_batch_size must be at least 1");
        }
        if !(self.backoff.multiplier >= 1.0) {
            return invalid("backoff multiplier must be at least 1.0");
        }
        if self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return invalid("max_delay_ms must not be below base_delay_ms");
        }
        if self.default_schema.is_empty() {
            return invalid("default_schema must not be empty");
        }
        Ok(())
    }

    /// Whether `message` marks a failure that retrying cannot fix
    #[must_use]
    pub fn is_permanent_error(&self, message: &str) -> bool {
        contains_any(message, &self.permanent_error_markers)
    }

    /// Whether `message` looks like an authentication failure
    #[must_use]
    pub fn is_auth_error(&self, message: &str) -> bool {
        contains_any(message, &self.auth_error_markers)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffPolicy::default(),
            default_schema: DEFAULT_SCHEMA.to_string(),
            permanent_error_markers: vec![
                "publication".to_string(),
                "replica".to_string(),
                "not found".to_string(),
            ],
            auth_error_markers: vec![
                "jwt".to_string(),
                "token".to_string(),
                "unauthorized".to_string(),
                "authentication".to_string(),
            ],
        }
    }
}

fn contains_any(message: &str, markers: &[String]) -> bool {
    let message = message.to_lowercase();
    markers
        .iter()
        .any(|marker| message.contains(&marker.to_lowercase()))
}

fn parse_override<T, F>(lookup: &F, name: &str) -> Result<Option<T>, RealtimeError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| RealtimeError::InvalidConfig(format!("{name}: cannot parse '{raw}'"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_production_client() {
        let config = RealtimeConfig::default();
        assert_eq!(config.rate_limit.max_events_per_second, 10.0);
        assert_eq!(config.rate_limit.batch_window(), Duration::from_millis(100));
        assert_eq!(config.rate_limit.max_batch_size, 50);
        assert_eq!(config.backoff.base_delay_ms, 2_000);
        assert_eq!(config.backoff.multiplier, 1.5);
        assert_eq!(config.backoff.max_delay_ms, 30_000);
        assert_eq!(config.backoff.max_retries, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(3_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4_500));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_is_monotonic_and_capped_over_retry_budget() {
        let policy = BackoffPolicy::default();
        let delays: Vec<Duration> = (0..policy.max_retries)
            .map(|attempt| policy.delay_for_attempt(attempt))
            .collect();

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(30_000)));
    }

    #[test]
    fn should_retry_stops_at_budget() {
        let policy = BackoffPolicy::default();
        assert!(policy.should_retry(9));
        assert!(!policy.should_retry(10));
    }

    #[test]
    fn toml_overrides_keep_other_defaults() {
        let config = RealtimeConfig::from_toml_str(
            r#"
            [rate_limit]
            max_batch_size = 20

            [backoff]
            max_retries = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.max_batch_size, 20);
        assert_eq!(config.rate_limit.batch_window_ms, 100);
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.default_schema, "public");
    }

    #[test]
    fn toml_rejects_zero_batch_size() {
        let result = RealtimeConfig::from_toml_str("[rate_limit]\nmax_batch_size = 0\n");
        assert!(matches!(result, Err(RealtimeError::InvalidConfig(_))));
    }

    #[test]
    fn toml_parse_error_is_reported() {
        let result = RealtimeConfig::from_toml_str("[rate_limit\n");
        assert!(matches!(result, Err(RealtimeError::ConfigParse(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = RealtimeConfig::from_env_or_file(Some(Path::new("/nonexistent/roost.toml")));
        assert!(matches!(result, Err(RealtimeError::ConfigIo { .. })));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (MAX_EVENTS_PER_SECOND_ENV, "25"),
            (BATCH_WINDOW_MS_ENV, "250"),
            (MAX_RETRIES_ENV, " 4 "),
        ]
        .into_iter()
        .collect();

        let mut config = RealtimeConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.rate_limit.max_events_per_second, 25.0);
        assert_eq!(config.rate_limit.batch_window_ms, 250);
        assert_eq!(config.rate_limit.max_batch_size, 50);
        assert_eq!(config.backoff.max_retries, 4);
    }

    #[test]
    fn bad_env_override_is_rejected() {
        let mut config = RealtimeConfig::default();
        let result = config.apply_overrides(|name| {
            (name == MAX_BATCH_SIZE_ENV).then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(RealtimeError::InvalidConfig(_))));
    }

    #[test]
    fn permanent_markers_are_case_insensitive() {
        let config = RealtimeConfig::default();
        assert!(config.is_permanent_error("relation is not part of any Publication"));
        assert!(config.is_permanent_error("REPLICA IDENTITY missing"));
        assert!(config.is_permanent_error("table not found"));
        assert!(!config.is_permanent_error("connection reset by peer"));
    }

    #[test]
    fn auth_markers() {
        let config = RealtimeConfig::default();
        assert!(config.is_auth_error("JWT expired"));
        assert!(!config.is_auth_error("socket closed"));
    }

    proptest! {
        #[test]
        fn prop_backoff_never_exceeds_cap(
            base in 1u64..10_000,
            extra in 0u64..100_000,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let policy = BackoffPolicy {
                base_delay_ms: base,
                multiplier,
                max_delay_ms: base + extra,
                max_retries: 10,
            };
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= Duration::from_millis(base + extra));
            prop_assert!(delay <= policy.delay_for_attempt(attempt + 1));
        }
    }
}
