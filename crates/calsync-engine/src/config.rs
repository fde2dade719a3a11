//! Engine configuration.
//!
//! Every field has a default, so an empty `[engine]` table (or none at all)
//! yields a working engine. Durations use humantime syntax in TOML
//! (`"5m"`, `"100ms"`, `"7days"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub activity: ActivityConfig,
    pub batcher: BatcherConfig,
    pub lease: LeaseConfig,
}

impl EngineConfig {
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_activity(mut self, activity: ActivityConfig) -> Self {
        self.activity = activity;
        self
    }

    pub fn with_batcher(mut self, batcher: BatcherConfig) -> Self {
        self.batcher = batcher;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}

/// Cache TTLs and sweep cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "serde_duration")]
    pub events_ttl: Duration,
    #[serde(with = "serde_duration")]
    pub account_ttl: Duration,
    #[serde(with = "serde_duration")]
    pub calendars_ttl: Duration,
    /// How often expired entries are purged.
    #[serde(with = "serde_duration")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            events_ttl: Duration::from_secs(5 * 60),
            account_ttl: Duration::from_secs(5 * 60),
            calendars_ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Sync scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps without checking for due jobs.
    #[serde(with = "serde_duration")]
    pub tick_interval: Duration,
    pub max_concurrent_jobs: usize,
    /// Per-execution timeout.
    #[serde(with = "serde_duration")]
    pub job_timeout: Duration,
    /// Offset between the first runs of consecutive accounts.
    #[serde(with = "serde_duration")]
    pub stagger: Duration,
    #[serde(with = "serde_duration")]
    pub events_interval: Duration,
    #[serde(with = "serde_duration")]
    pub account_interval: Duration,
    #[serde(with = "serde_duration")]
    pub calendars_interval: Duration,
    /// Span of the window that background event syncs fetch.
    #[serde(with = "serde_duration")]
    pub sync_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            max_concurrent_jobs: 2,
            job_timeout: Duration::from_secs(60),
            stagger: Duration::from_secs(2),
            events_interval: Duration::from_secs(10 * 60),
            account_interval: Duration::from_secs(30 * 60),
            calendars_interval: Duration::from_secs(60 * 60),
            sync_window: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    /// Builder: set max concurrent jobs (at least one).
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Builder: set the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Builder: set the tick interval.
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    /// Builder: set the per-account stagger.
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }
}

/// When background syncs may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// No recorded activity for this long means idle.
    #[serde(with = "serde_duration")]
    pub idle_threshold: Duration,
    pub enabled_when_idle: bool,
    pub enabled_when_active: bool,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(5 * 60),
            enabled_when_idle: true,
            enabled_when_active: true,
        }
    }
}

/// Request batcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Collection window opened by the first pending request.
    #[serde(with = "serde_duration")]
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
    pub max_concurrent_batches: usize,
    /// Default per-request deadline, measured from submission.
    #[serde(with = "serde_duration")]
    pub request_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_timeout: Duration::from_millis(100),
            max_batch_size: 10,
            max_concurrent_batches: 4,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl BatcherConfig {
    /// Builder: set batch size and concurrency (both at least one).
    pub fn with_limits(mut self, max_batch_size: usize, max_concurrent_batches: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self.max_concurrent_batches = max_concurrent_batches.max(1);
        self
    }

    /// Builder: set the collection window.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Builder: set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Credential lease refresh settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// How long before expiry a lease is refreshed.
    #[serde(with = "serde_duration")]
    pub refresh_margin: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(5 * 60),
        }
    }
}

impl LeaseConfig {
    /// The margin as a chrono duration, for wall-clock arithmetic.
    pub fn margin(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_margin).unwrap_or(chrono::Duration::zero())
    }
}

/// Humantime (de)serialization for `std::time::Duration` fields.
pub(crate) mod serde_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.events_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.calendars_ttl, Duration::from_secs(1800));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(30));
        assert_eq!(config.scheduler.max_concurrent_jobs, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.batcher.batch_timeout, Duration::from_millis(100));
        assert_eq!(config.batcher.max_batch_size, 10);
        assert_eq!(config.batcher.max_concurrent_batches, 4);
        assert_eq!(config.lease.margin(), chrono::Duration::minutes(5));
        assert!(config.activity.enabled_when_idle);
    }

    #[test]
    fn empty_table_is_default() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn humantime_durations() {
        let config: EngineConfig = toml::from_str(
            r#"
            [cache]
            events_ttl = "2m"

            [batcher]
            batch_timeout = "250ms"
            max_batch_size = 5

            [retry]
            max_attempts = 5
            initial_delay = "1s"

            [activity]
            enabled_when_idle = false
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.events_ttl, Duration::from_secs(120));
        assert_eq!(config.cache.account_ttl, Duration::from_secs(300));
        assert_eq!(config.batcher.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.batcher.max_batch_size, 5);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retry.max_delay, Duration::from_secs(300));
        assert!(!config.activity.enabled_when_idle);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let result: Result<EngineConfig, _> = toml::from_str("[cache]\nevents_ttl = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn serializes_back_to_humantime() {
        let text = toml::to_string(&EngineConfig::default()).unwrap();
        assert!(text.contains("batch_timeout = \"100ms\""));
        assert!(text.contains("events_ttl = \"5m\""));
    }
}
