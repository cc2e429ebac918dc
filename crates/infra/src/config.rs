//! Process configuration loaded from environment variables.
//!
//! Unset variables fall back to defaults; a variable that is set but cannot
//! be parsed is an error rather than a silent default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::orchestrator::PipelineConfig;
use crate::jobs::policy::{PolicyTable, RetryPolicy};
use crate::jobs::worker::WorkerConfig;

/// Upper bound for every configured duration. Keeps deadline and staleness
/// arithmetic on timestamps far inside the representable range.
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub worker_concurrency: usize,
    pub worker_poll: Duration,
    pub queue_visibility_timeout: Duration,
    pub step_timeout: Duration,
    pub job_deadline: Duration,
    pub estimated_wait: Duration,
    pub stale_after: Duration,
    pub watchdog_interval: Duration,
    pub retry: RetryPolicy,
    pub retry_invalid_output: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            redis_url: None,
            fixtures_dir: PathBuf::from("./fixtures"),
            worker_concurrency: 4,
            worker_poll: Duration::from_millis(500),
            queue_visibility_timeout: Duration::from_secs(120),
            step_timeout: Duration::from_secs(60),
            job_deadline: Duration::from_secs(600),
            estimated_wait: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            retry_invalid_output: true,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let config = Self {
            bind_addr: env.parsed("BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            database_url: env.string("DATABASE_URL"),
            redis_url: env.string("REDIS_URL"),
            fixtures_dir: env.string("FIXTURES_DIR").map(PathBuf::from).unwrap_or(defaults.fixtures_dir),
            worker_concurrency: match env.parsed::<usize>("WORKER_CONCURRENCY")? {
                Some(0) => return Err(invalid("WORKER_CONCURRENCY", "0")),
                Some(n) => n,
                None => defaults.worker_concurrency,
            },
            worker_poll: env.millis("WORKER_POLL_MS")?.unwrap_or(defaults.worker_poll),
            queue_visibility_timeout: env
                .secs("QUEUE_VISIBILITY_TIMEOUT_SECS")?
                .unwrap_or(defaults.queue_visibility_timeout),
            step_timeout: env.secs("STEP_TIMEOUT_SECS")?.unwrap_or(defaults.step_timeout),
            job_deadline: env.secs("JOB_DEADLINE_SECS")?.unwrap_or(defaults.job_deadline),
            estimated_wait: env.secs("ESTIMATED_WAIT_SECS")?.unwrap_or(defaults.estimated_wait),
            stale_after: env.secs("STALE_AFTER_SECS")?.unwrap_or(defaults.stale_after),
            watchdog_interval: env.secs("WATCHDOG_INTERVAL_SECS")?.unwrap_or(defaults.watchdog_interval),
            retry: RetryPolicy {
                max_attempts: match env.parsed::<u32>("RETRY_MAX_ATTEMPTS")? {
                    Some(0) => return Err(invalid("RETRY_MAX_ATTEMPTS", "0")),
                    Some(n) => n,
                    None => defaults.retry.max_attempts,
                },
                base_delay: env.millis("RETRY_BASE_DELAY_MS")?.unwrap_or(defaults.retry.base_delay),
                max_delay: env.millis("RETRY_MAX_DELAY_MS")?.unwrap_or(defaults.retry.max_delay),
                strategy: env.parsed("RETRY_STRATEGY")?.unwrap_or(defaults.retry.strategy),
                ..defaults.retry
            },
            retry_invalid_output: env.flag("RETRY_INVALID_OUTPUT")?.unwrap_or(defaults.retry_invalid_output),
        };
        config.validate()?;
        Ok(config)
    }

    /// Range and cross-field checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("WORKER_POLL_MS", self.worker_poll),
            ("QUEUE_VISIBILITY_TIMEOUT_SECS", self.queue_visibility_timeout),
            ("STEP_TIMEOUT_SECS", self.step_timeout),
            ("JOB_DEADLINE_SECS", self.job_deadline),
            ("ESTIMATED_WAIT_SECS", self.estimated_wait),
            ("STALE_AFTER_SECS", self.stale_after),
            ("WATCHDOG_INTERVAL_SECS", self.watchdog_interval),
            ("RETRY_BASE_DELAY_MS", self.retry.base_delay),
            ("RETRY_MAX_DELAY_MS", self.retry.max_delay),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::Inconsistent(format!(
                    "{key} ({}s) exceeds the {}s limit",
                    value.as_secs(),
                    MAX_DURATION.as_secs()
                )));
            }
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Inconsistent(
                "RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".to_string(),
            ));
        }
        // A live worker writes at least once per step timeout plus one backoff.
        if self.stale_after <= self.step_timeout + self.retry.max_delay {
            return Err(ConfigError::Inconsistent(format!(
                "STALE_AFTER_SECS ({}s) must exceed STEP_TIMEOUT_SECS + RETRY_MAX_DELAY_MS ({}s)",
                self.stale_after.as_secs(),
                (self.step_timeout + self.retry.max_delay).as_secs()
            )));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            retry: self.retry.clone(),
            policy: PolicyTable::default().retry_invalid_output(self.retry_invalid_output),
            step_timeout: self.step_timeout,
            job_deadline: self.job_deadline,
            stale_after: self.stale_after,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            stale_after: self.stale_after,
            ..WorkerConfig::default()
        }
        .with_concurrency(self.worker_concurrency)
        .with_poll_interval(self.worker_poll)
        .with_watchdog_interval(self.watchdog_interval)
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    /// Trimmed value; blank counts as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            Some(raw) => raw.parse().map(Some).map_err(|_| invalid(key, &raw)),
            None => Ok(None),
        }
    }

    fn secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.duration(key, Duration::from_secs)
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        self.duration(key, Duration::from_millis)
    }

    fn duration(&self, key: &'static str, unit: fn(u64) -> Duration) -> Result<Option<Duration>, ConfigError> {
        match self.parsed::<u64>(key)?.map(unit) {
            Some(d) if d > MAX_DURATION => Err(invalid(key, &self.string(key).unwrap_or_default())),
            other => Ok(other),
        }
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.string(key) {
            Some(raw) => parse_bool(&raw).map(Some).ok_or_else(|| invalid(key, &raw)),
            None => Ok(None),
        }
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

/// Accepts `1/true/yes/on` and `0/false/no/off`, case-insensitive.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
