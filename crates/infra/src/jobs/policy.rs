//! Retry budget, backoff curve and the failure policy table.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gitgauge_core::ErrorKind;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy `{other}`")),
        }
    }
}

/// Attempt ceiling and backoff curve shared by every step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts a job may use, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Same curve without jitter, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempt.saturating_sub(1).min(62) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
        }
        .min(max_ms);

        // Deterministic spread keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Next delay, honouring an upstream wait hint as a lower bound.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        match hint {
            Some(hint) => computed.max(hint).min(self.max_delay),
            None => computed,
        }
    }

    /// Whether a job that just spent `attempt` may start another one.
    pub fn has_budget(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Classified step failure, the key of the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    FetchRateLimited,
    FetchTransient,
    FetchTimeout,
    FetchNotFound,
    FetchPermanent,
    GenerationTransient,
    GenerationTimeout,
    InvalidOutput,
    GenerationPermanent,
}

impl FailureClass {
    pub fn is_fetch(self) -> bool {
        matches!(
            self,
            FailureClass::FetchRateLimited
                | FailureClass::FetchTransient
                | FailureClass::FetchTimeout
                | FailureClass::FetchNotFound
                | FailureClass::FetchPermanent
        )
    }

    /// Terminal kind when the attempt budget runs out on this class.
    pub fn exhausted_kind(self) -> ErrorKind {
        if self.is_fetch() {
            ErrorKind::FetchExhausted
        } else {
            ErrorKind::GenerationExhausted
        }
    }

    /// Detail kept in `JobError::last_failure` when it adds information.
    pub fn last_failure(self) -> Option<ErrorKind> {
        match self {
            FailureClass::InvalidOutput => Some(ErrorKind::InvalidOutput),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::FetchRateLimited => "fetch_rate_limited",
            FailureClass::FetchTransient => "fetch_transient",
            FailureClass::FetchTimeout => "fetch_timeout",
            FailureClass::FetchNotFound => "fetch_not_found",
            FailureClass::FetchPermanent => "fetch_permanent",
            FailureClass::GenerationTransient => "generation_transient",
            FailureClass::GenerationTimeout => "generation_timeout",
            FailureClass::InvalidOutput => "invalid_output",
            FailureClass::GenerationPermanent => "generation_permanent",
        }
    }
}

impl core::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off and try again while the attempt budget lasts.
    Retry,
    /// Fail the job right away with this kind.
    Fail(ErrorKind),
}

/// Maps each failure class to what the orchestrator does about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    entries: HashMap<FailureClass, Disposition>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        use Disposition::*;
        use FailureClass::*;
        let entries = [
            (FetchRateLimited, Retry),
            (FetchTransient, Retry),
            (FetchTimeout, Retry),
            (FetchNotFound, Fail(ErrorKind::NotFound)),
            (FetchPermanent, Fail(ErrorKind::FetchExhausted)),
            (GenerationTransient, Retry),
            (GenerationTimeout, Retry),
            (InvalidOutput, Retry),
            (GenerationPermanent, Fail(ErrorKind::GenerationExhausted)),
        ]
        .into_iter()
        .collect();
        Self { entries }
    }
}

impl PolicyTable {
    pub fn with(mut self, class: FailureClass, disposition: Disposition) -> Self {
        self.entries.insert(class, disposition);
        self
    }

    /// Toggle retrying schema-invalid generator output.
    pub fn retry_invalid_output(self, retry: bool) -> Self {
        let disposition = if retry {
            Disposition::Retry
        } else {
            Disposition::Fail(ErrorKind::InvalidOutput)
        };
        self.with(FailureClass::InvalidOutput, disposition)
    }

    pub fn disposition(&self, class: FailureClass) -> Disposition {
        self.entries
            .get(&class)
            .copied()
            .unwrap_or(Disposition::Fail(ErrorKind::InternalError))
    }
}
