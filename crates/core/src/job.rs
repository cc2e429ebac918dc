//! Job record and its state machine.
//!
//! `Job::transitioned` is the single place where the lifecycle rules live.
//! Stores call it inside their compare-and-swap so every backend enforces the
//! same invariants:
//!
//! - `queued -> running -> completed | failed`, plus `running -> running`
//!   for retries/stage changes and `queued -> failed` for jobs picked up past
//!   their deadline
//! - terminal records never change
//! - `report` and `sources` only on `completed`, `error` only on `failed`
//! - `attempt_count` only grows, one step at a time

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::input::JobInput;
use crate::report::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the lifecycle ever permits `self -> next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Failed) | (Running, Running) | (Running, Completed) | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-state of a `running` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Fetching,
    Generating,
    Persisting,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Fetching => "fetching",
            PipelineStage::Generating => "generating",
            PipelineStage::Persisting => "persisting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetching" => Some(PipelineStage::Fetching),
            "generating" => Some(PipelineStage::Generating),
            "persisting" => Some(PipelineStage::Persisting),
            _ => None,
        }
    }
}

impl core::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    FetchExhausted,
    NotFound,
    GenerationExhausted,
    InvalidOutput,
    DeadlineExceeded,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::FetchExhausted => "fetch_exhausted",
            ErrorKind::NotFound => "not_found",
            ErrorKind::GenerationExhausted => "generation_exhausted",
            ErrorKind::InvalidOutput => "invalid_output",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure detail stored on a `failed` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Set when the job failed because its attempt budget ran out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_exhausted: Option<u32>,
    /// The classification of the last failed attempt, when it differs from `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<ErrorKind>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retries_exhausted: None,
            last_failure: None,
        }
    }

    pub fn with_retries_exhausted(mut self, attempts: u32) -> Self {
        self.retries_exhausted = Some(attempts);
        self
    }

    pub fn with_last_failure(mut self, kind: ErrorKind) -> Self {
        self.last_failure = Some(kind);
        self
    }
}

/// Authoritative job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub input: JobInput,
    pub report: Option<Report>,
    /// Fetched evidence the report was generated from, kept as opaque JSON.
    pub sources: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub stage: Option<PipelineStage>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A freshly created job: `queued`, no attempts yet.
    pub fn new(id: JobId, input: JobInput, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Queued,
            input,
            report: None,
            sources: None,
            error: None,
            stage: None,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            generated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status,
            github_username: self.input.github_username().to_string(),
            stage: self.stage,
            attempt_count: self.attempt_count,
            error_kind: self.error.as_ref().map(|e| e.kind),
            created_at: self.created_at,
            updated_at: self.updated_at,
            generated_at: self.generated_at,
        }
    }

    /// Apply a compare-and-swap transition, returning the updated record.
    ///
    /// Returns `Conflict` when the stored status or owning attempt does not
    /// match the caller's expectation (including any write to a terminal
    /// record) and `InvalidTransition` when the request itself breaks the
    /// lifecycle rules.
    pub fn transitioned(
        &self,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> DomainResult<Job> {
        if self.status != expected {
            return Err(DomainError::conflict(format!(
                "job {} is {}, expected {}",
                self.id, self.status, expected
            )));
        }
        if self.status.is_terminal() {
            return Err(DomainError::conflict(format!(
                "job {} is terminal ({})",
                self.id, self.status
            )));
        }
        if let Some(owner) = patch.expected_attempt {
            if owner != self.attempt_count {
                return Err(DomainError::conflict(format!(
                    "job {} is owned by attempt {}, not {}",
                    self.id, self.attempt_count, owner
                )));
            }
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invalid_transition(format!(
                "{} -> {}",
                self.status, next
            )));
        }

        match next {
            JobStatus::Completed => {
                if patch.report.is_none() || patch.error.is_some() {
                    return Err(DomainError::invalid_transition(
                        "completed requires a report and no error",
                    ));
                }
            }
            JobStatus::Failed => {
                if patch.error.is_none() || patch.report.is_some() || patch.sources.is_some() {
                    return Err(DomainError::invalid_transition(
                        "failed requires an error and no report",
                    ));
                }
            }
            JobStatus::Queued | JobStatus::Running => {
                if patch.report.is_some() || patch.error.is_some() || patch.sources.is_some() {
                    return Err(DomainError::invalid_transition(
                        "report/sources/error may only be attached on a terminal transition",
                    ));
                }
            }
        }

        let mut job = self.clone();
        if let Some(attempt) = patch.attempt_count {
            if attempt != self.attempt_count + 1 {
                return Err(DomainError::invalid_transition(format!(
                    "attempt_count must advance from {} to {}, got {}",
                    self.attempt_count,
                    self.attempt_count + 1,
                    attempt
                )));
            }
            job.attempt_count = attempt;
        }
        if let Some(stage) = patch.stage {
            job.stage = Some(stage);
        }

        job.status = next;
        job.updated_at = now.max(self.updated_at);
        if next == JobStatus::Completed {
            job.report = patch.report;
            job.sources = patch.sources;
            job.generated_at = Some(patch.generated_at.unwrap_or(job.updated_at).max(self.created_at));
        }
        if next == JobStatus::Failed {
            job.error = patch.error;
        }
        Ok(job)
    }
}

/// Listing projection: everything except the report body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub github_username: String,
    pub stage: Option<PipelineStage>,
    pub attempt_count: u32,
    pub error_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub generated_at: Option<DateTime<Utc>>,
}

/// Field updates carried by a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    /// New attempt number; must be exactly one more than the stored value.
    pub attempt_count: Option<u32>,
    /// Ownership fence: the write only applies while the stored attempt equals this.
    pub expected_attempt: Option<u32>,
    pub stage: Option<PipelineStage>,
    pub report: Option<Report>,
    pub sources: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub generated_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(report: Report, generated_at: DateTime<Utc>) -> Self {
        Self {
            report: Some(report),
            generated_at: Some(generated_at),
            stage: Some(PipelineStage::Persisting),
            ..Self::default()
        }
    }

    pub fn with_sources(mut self, sources: serde_json::Value) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn fail(error: JobError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_count = Some(attempt);
        self
    }

    pub fn fenced(mut self, owner: u32) -> Self {
        self.expected_attempt = Some(owner);
        self
    }

    pub fn with_stage(mut self, stage: PipelineStage) -> Self {
        self.stage = Some(stage);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::NewJob;
    use crate::report::tests::sample_report;
    use chrono::Duration;
    use proptest::prelude::*;

    fn job() -> Job {
        let input = JobInput::new(NewJob::new("octocat", vec!["Python".into()])).unwrap();
        Job::new(JobId::new(), input, Utc::now())
    }

    #[test]
    fn new_job_is_queued_with_no_attempts() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.report.is_none() && job.error.is_none() && job.generated_at.is_none());
    }

    #[test]
    fn claim_then_complete() {
        let job = job();
        let t1 = job.created_at + Duration::seconds(1);
        let running = job
            .transitioned(
                JobStatus::Queued,
                JobStatus::Running,
                JobPatch::new().with_attempt(1).with_stage(PipelineStage::Fetching),
                t1,
            )
            .unwrap();
        assert_eq!(running.attempt_count, 1);
        assert_eq!(running.stage, Some(PipelineStage::Fetching));
        assert_eq!(running.updated_at, t1);

        let t2 = t1 + Duration::seconds(1);
        let done = running
            .transitioned(
                JobStatus::Running,
                JobStatus::Completed,
                JobPatch::complete(sample_report("octocat"), t2).fenced(1),
                t2,
            )
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.report.is_some());
        assert_eq!(done.generated_at, Some(t2));
        assert!(done.generated_at.unwrap() >= done.created_at);
    }

    #[test]
    fn stale_expectation_is_a_conflict() {
        let job = job();
        let err = job
            .transitioned(JobStatus::Running, JobStatus::Completed, JobPatch::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn wrong_owner_is_a_conflict() {
        let running = job()
            .transitioned(JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1), Utc::now())
            .unwrap();
        let err = running
            .transitioned(
                JobStatus::Running,
                JobStatus::Running,
                JobPatch::new().fenced(0).with_stage(PipelineStage::Generating),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn terminal_records_reject_everything() {
        let failed = job()
            .transitioned(
                JobStatus::Queued,
                JobStatus::Failed,
                JobPatch::fail(JobError::new(ErrorKind::DeadlineExceeded, "late")),
                Utc::now(),
            )
            .unwrap();
        for next in [JobStatus::Queued, JobStatus::Running, JobStatus::Completed, JobStatus::Failed] {
            let err = failed
                .transitioned(JobStatus::Failed, next, JobPatch::new(), Utc::now())
                .unwrap_err();
            assert!(matches!(err, DomainError::Conflict(_)));
        }
    }

    #[test]
    fn sources_are_kept_only_on_completion() {
        let running = job()
            .transitioned(JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1), Utc::now())
            .unwrap();
        let sources = serde_json::json!([{ "full_name": "octocat/pytools" }]);

        let err = running
            .transitioned(
                JobStatus::Running,
                JobStatus::Running,
                JobPatch::new().with_sources(sources.clone()),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        let done = running
            .transitioned(
                JobStatus::Running,
                JobStatus::Completed,
                JobPatch::complete(sample_report("octocat"), Utc::now()).with_sources(sources.clone()),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(done.sources, Some(sources));
    }

    #[test]
    fn completion_requires_a_report() {
        let running = job()
            .transitioned(JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1), Utc::now())
            .unwrap();
        let err = running
            .transitioned(JobStatus::Running, JobStatus::Completed, JobPatch::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn attempt_count_cannot_skip_or_rewind() {
        let job = job();
        for bad in [0, 2] {
            let err = job
                .transitioned(JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(bad), Utc::now())
                .unwrap_err();
            assert!(matches!(err, DomainError::InvalidTransition(_)));
        }
    }

    #[test]
    fn error_serializes_with_snake_case_kind() {
        let err = JobError::new(ErrorKind::GenerationExhausted, "gave up")
            .with_retries_exhausted(3)
            .with_last_failure(ErrorKind::InvalidOutput);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "generation_exhausted");
        assert_eq!(json["retries_exhausted"], 3);
        assert_eq!(json["last_failure"], "invalid_output");
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Queued),
            Just(JobStatus::Running),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
        ]
    }

    fn patch_for(next: JobStatus, bump: bool, current: u32) -> JobPatch {
        let mut patch = match next {
            JobStatus::Completed => JobPatch::complete(sample_report("octocat"), Utc::now()),
            JobStatus::Failed => JobPatch::fail(JobError::new(ErrorKind::InternalError, "boom")),
            _ => JobPatch::new(),
        };
        if bump {
            patch = patch.with_attempt(current + 1);
        }
        patch
    }

    proptest! {
        #[test]
        fn status_never_regresses_and_attempts_never_shrink(
            steps in proptest::collection::vec((status_strategy(), status_strategy(), any::<bool>()), 1..40)
        ) {
            let mut current = job();
            for (expected, next, bump) in steps {
                let before = current.clone();
                let patch = patch_for(next, bump, current.attempt_count);
                match current.transitioned(expected, next, patch, Utc::now()) {
                    Ok(updated) => {
                        prop_assert!(!before.status.is_terminal());
                        prop_assert!(before.status.can_transition_to(updated.status));
                        prop_assert!(updated.attempt_count >= before.attempt_count);
                        prop_assert_eq!(updated.report.is_some(), updated.status == JobStatus::Completed);
                        prop_assert_eq!(updated.error.is_some(), updated.status == JobStatus::Failed);
                        current = updated;
                    }
                    Err(_) => prop_assert_eq!(&current, &before),
                }
            }
        }
    }
}
