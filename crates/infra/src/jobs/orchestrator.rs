//! Pipeline orchestrator: drives one delivered job id to a terminal state.
//!
//! ## Per delivery
//!
//! 1. Load the job; missing or terminal records are discarded.
//! 2. Claim it: `queued -> running` (attempt 1), or reclaim a `running` job
//!    whose owner went silent for `stale_after` (attempt + 1). Losing either
//!    compare-and-swap means someone else owns the job; discard.
//! 3. Fetch, then generate. Step failures go through the policy table:
//!    retryable ones back off and bump `attempt_count` (fenced on the owned
//!    attempt), the rest fail the job at once.
//! 4. Persist: `running -> completed` with the validated report.
//!
//! Every write after the claim carries the owned attempt as a fence, so a
//! worker that was presumed dead cannot overwrite its successor's progress.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, field, info, instrument, warn, Span};

use gitgauge_analysis::{
    AnalysisGenerator, Artifact, DataFetcher, FetchErrorKind, GenerationErrorKind, GenerationRequest,
    ItemFilters,
};
use gitgauge_core::{
    ErrorKind, Job, JobError, JobId, JobInput, JobPatch, JobStatus, PipelineStage, Report,
};

use super::clock::{chrono_duration, Clock};
use super::policy::{Disposition, FailureClass, PolicyTable, RetryPolicy};
use super::store::{JobStore, JobStoreError};

const NO_MATCHES: &str = "no repositories matched the requested skills";

/// Retry, timeout and deadline settings for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub policy: PolicyTable,
    /// Upper bound for a single fetch or generate call.
    pub step_timeout: Duration,
    /// Wall-clock budget per job, measured from `created_at`.
    pub job_deadline: Duration,
    /// A `running` job untouched for this long is considered abandoned.
    pub stale_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            policy: PolicyTable::default(),
            step_timeout: Duration::from_secs(60),
            job_deadline: Duration::from_secs(600),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(ErrorKind),
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The id does not exist in the store.
    Missing,
    /// The job already reached `completed` or `failed`.
    Terminal,
    /// Another worker holds (or just took) the job.
    ClaimedElsewhere,
    /// Our attempt was superseded mid-run.
    LostOwnership,
}

/// Faults that leave the job untouched; the delivery should not be acked.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("job store unavailable: {0}")]
    Store(#[from] JobStoreError),
}

#[derive(Debug)]
struct StepFailure {
    class: FailureClass,
    message: String,
    retry_after: Option<Duration>,
}

#[derive(Debug)]
enum StepError {
    Failed(StepFailure),
    Deadline(String),
}

impl StepError {
    fn failed(class: FailureClass, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        StepError::Failed(StepFailure {
            class,
            message: message.into(),
            retry_after,
        })
    }
}

enum Claim {
    Owned(Job),
    Done(Outcome),
}

pub struct PipelineOrchestrator {
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn DataFetcher>,
    generator: Arc<dyn AnalysisGenerator>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn DataFetcher>,
        generator: Arc<dyn AnalysisGenerator>,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            generator,
            clock,
            config,
        }
    }

    /// Process one delivery of `job_id`.
    #[instrument(skip(self), fields(job_id = %job_id, attempt = field::Empty))]
    pub async fn process(&self, job_id: JobId) -> Result<Outcome, PipelineError> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => {
                debug!("job not in store, discarding delivery");
                return Ok(Outcome::Discarded(DiscardReason::Missing));
            }
            Err(e) => return Err(e.into()),
        };
        if job.is_terminal() {
            debug!(status = %job.status, "job already terminal, discarding delivery");
            return Ok(Outcome::Discarded(DiscardReason::Terminal));
        }

        let deadline = job
            .created_at
            .checked_add_signed(chrono_duration(self.config.job_deadline))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let job = match self.claim(job, deadline).await? {
            Claim::Owned(job) => job,
            Claim::Done(outcome) => return Ok(outcome),
        };
        Span::current().record("attempt", job.attempt_count);

        let attempt = job.attempt_count;
        match self.run(job, deadline).await {
            Err(PipelineError::Store(JobStoreError::InvalidTransition(reason))) => {
                // The pipeline asked for something the lifecycle forbids.
                let job = self.store.get(job_id).await?;
                if job.attempt_count != attempt || job.is_terminal() {
                    return Ok(Outcome::Discarded(DiscardReason::LostOwnership));
                }
                let error = JobError::new(ErrorKind::InternalError, format!("invalid transition: {reason}"));
                self.finish_failed(&job, error).await
            }
            other => other,
        }
    }

    /// Fail a job whose pipeline crashed outside the classified error paths.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn record_internal_failure(&self, job_id: JobId, message: &str) -> Result<Outcome, PipelineError> {
        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(JobStoreError::NotFound(_)) => return Ok(Outcome::Discarded(DiscardReason::Missing)),
            Err(e) => return Err(e.into()),
        };
        if job.is_terminal() {
            return Ok(Outcome::Discarded(DiscardReason::Terminal));
        }
        self.finish_failed(&job, JobError::new(ErrorKind::InternalError, message)).await
    }

    async fn claim(&self, job: Job, deadline: DateTime<Utc>) -> Result<Claim, PipelineError> {
        let now = self.clock.now();
        match job.status {
            JobStatus::Queued => {
                if now >= deadline {
                    let error = JobError::new(
                        ErrorKind::DeadlineExceeded,
                        "job deadline passed before a worker picked it up",
                    );
                    return self.finish_failed(&job, error).await.map(Claim::Done);
                }
                let patch = JobPatch::new()
                    .with_attempt(job.attempt_count + 1)
                    .with_stage(PipelineStage::Fetching)
                    .fenced(job.attempt_count);
                match self.write(job.id, JobStatus::Queued, JobStatus::Running, patch).await? {
                    Some(job) => {
                        info!(attempt = job.attempt_count, "claimed job");
                        Ok(Claim::Owned(job))
                    }
                    None => {
                        debug!("job claimed by another worker, discarding delivery");
                        Ok(Claim::Done(Outcome::Discarded(DiscardReason::ClaimedElsewhere)))
                    }
                }
            }
            JobStatus::Running => {
                let idle = now - job.updated_at;
                if idle < chrono_duration(self.config.stale_after) {
                    debug!(attempt = job.attempt_count, "job is owned by a live attempt, discarding delivery");
                    return Ok(Claim::Done(Outcome::Discarded(DiscardReason::ClaimedElsewhere)));
                }
                warn!(
                    attempt = job.attempt_count,
                    idle_secs = idle.num_seconds(),
                    stage = ?job.stage,
                    "reclaiming abandoned job"
                );
                if now >= deadline {
                    let error = JobError::new(
                        ErrorKind::DeadlineExceeded,
                        "job deadline passed while its worker was unresponsive",
                    );
                    return self.finish_failed(&job, error).await.map(Claim::Done);
                }
                if !self.config.retry.has_budget(job.attempt_count) {
                    let error = JobError::new(
                        ErrorKind::InternalError,
                        format!(
                            "worker for attempt {} stopped responding and the attempt budget is spent",
                            job.attempt_count
                        ),
                    )
                    .with_retries_exhausted(job.attempt_count);
                    return self.finish_failed(&job, error).await.map(Claim::Done);
                }
                let patch = JobPatch::new()
                    .with_attempt(job.attempt_count + 1)
                    .with_stage(PipelineStage::Fetching)
                    .fenced(job.attempt_count);
                match self.write(job.id, JobStatus::Running, JobStatus::Running, patch).await? {
                    Some(job) => Ok(Claim::Owned(job)),
                    None => Ok(Claim::Done(Outcome::Discarded(DiscardReason::ClaimedElsewhere))),
                }
            }
            JobStatus::Completed | JobStatus::Failed => {
                Ok(Claim::Done(Outcome::Discarded(DiscardReason::Terminal)))
            }
        }
    }

    async fn run(&self, job: Job, deadline: DateTime<Utc>) -> Result<Outcome, PipelineError> {
        let id = job.id;
        let input = job.input;
        let filters = ItemFilters::from(&input);
        let mut attempt = job.attempt_count;
        let mut fetched: Option<Vec<Artifact>> = None;

        loop {
            let step_error = match &fetched {
                None => match self.fetch_step(&input, &filters, deadline).await {
                    Ok(artifacts) if artifacts.is_empty() => {
                        let error = JobError::new(ErrorKind::NotFound, NO_MATCHES);
                        return self.fail(id, attempt, error).await;
                    }
                    Ok(artifacts) => {
                        debug!(attempt, artifacts = artifacts.len(), "fetch step succeeded");
                        fetched = Some(artifacts);
                        let patch = JobPatch::new().with_stage(PipelineStage::Generating).fenced(attempt);
                        if self.write(id, JobStatus::Running, JobStatus::Running, patch).await?.is_none() {
                            return Ok(self.lost_ownership(attempt));
                        }
                        continue;
                    }
                    Err(e) => e,
                },
                Some(artifacts) => match self.generate_step(&input, artifacts, deadline).await {
                    Ok(report) => return self.complete(id, attempt, report, artifacts).await,
                    Err(e) => e,
                },
            };

            let failure = match step_error {
                StepError::Deadline(message) => {
                    return self.fail(id, attempt, JobError::new(ErrorKind::DeadlineExceeded, message)).await;
                }
                StepError::Failed(failure) => failure,
            };

            match self.config.policy.disposition(failure.class) {
                Disposition::Fail(kind) => {
                    return self.fail(id, attempt, JobError::new(kind, failure.message)).await;
                }
                Disposition::Retry => {}
            }

            if !self.config.retry.has_budget(attempt) {
                let mut error = JobError::new(
                    failure.class.exhausted_kind(),
                    format!("gave up after {attempt} attempt(s): {}", failure.message),
                )
                .with_retries_exhausted(attempt);
                if let Some(last) = failure.class.last_failure() {
                    error = error.with_last_failure(last);
                }
                return self.fail(id, attempt, error).await;
            }

            let delay = self.config.retry.delay(attempt, failure.retry_after);
            let resumes_at = self.clock.now().checked_add_signed(chrono_duration(delay));
            if resumes_at.is_none_or(|at| at >= deadline) {
                let mut error = JobError::new(
                    ErrorKind::DeadlineExceeded,
                    format!("next retry would start after the job deadline: {}", failure.message),
                );
                if let Some(last) = failure.class.last_failure() {
                    error = error.with_last_failure(last);
                }
                return self.fail(id, attempt, error).await;
            }

            warn!(
                attempt,
                kind = %failure.class,
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "step failed, backing off"
            );
            self.clock.sleep(delay).await;

            let stage = if fetched.is_some() {
                PipelineStage::Generating
            } else {
                PipelineStage::Fetching
            };
            let patch = JobPatch::new().with_attempt(attempt + 1).with_stage(stage).fenced(attempt);
            match self.write(id, JobStatus::Running, JobStatus::Running, patch).await? {
                Some(job) => {
                    attempt = job.attempt_count;
                    Span::current().record("attempt", attempt);
                }
                None => return Ok(self.lost_ownership(attempt)),
            }
        }
    }

    async fn fetch_step(
        &self,
        input: &JobInput,
        filters: &ItemFilters,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Artifact>, StepError> {
        let (budget, cut_by_deadline) = self.step_budget(deadline)?;
        let call = self
            .fetcher
            .fetch(input.github_username(), input.repo_limit() as usize, filters);

        match tokio::time::timeout(budget, call).await {
            Ok(Ok(artifacts)) => Ok(artifacts),
            Ok(Err(e)) => {
                let class = match e.kind {
                    FetchErrorKind::RateLimited => FailureClass::FetchRateLimited,
                    FetchErrorKind::NotFound => FailureClass::FetchNotFound,
                    FetchErrorKind::Transient => FailureClass::FetchTransient,
                    FetchErrorKind::Permanent => FailureClass::FetchPermanent,
                };
                Err(StepError::failed(class, e.message, e.retry_after))
            }
            Err(_) if cut_by_deadline => Err(StepError::Deadline("fetch cut short by the job deadline".into())),
            Err(_) => Err(StepError::failed(
                FailureClass::FetchTimeout,
                format!("fetch timed out after {}ms", budget.as_millis()),
                None,
            )),
        }
    }

    async fn generate_step(
        &self,
        input: &JobInput,
        artifacts: &[Artifact],
        deadline: DateTime<Utc>,
    ) -> Result<Report, StepError> {
        let (budget, cut_by_deadline) = self.step_budget(deadline)?;
        let request = GenerationRequest {
            identity: input.github_username(),
            artifacts,
            skills: input.skills(),
            guidance: input.notes_for_ai(),
        };

        match tokio::time::timeout(budget, self.generator.generate(request)).await {
            Ok(Ok(value)) => Report::from_value(value)
                .map(|report| report.normalized(input.github_username(), input.skills()))
                .map_err(|violation| StepError::failed(FailureClass::InvalidOutput, violation.to_string(), None)),
            Ok(Err(e)) => {
                let class = match e.kind {
                    GenerationErrorKind::Transient => FailureClass::GenerationTransient,
                    GenerationErrorKind::InvalidOutput => FailureClass::InvalidOutput,
                    GenerationErrorKind::Permanent => FailureClass::GenerationPermanent,
                };
                Err(StepError::failed(class, e.message, None))
            }
            Err(_) if cut_by_deadline => {
                Err(StepError::Deadline("generation cut short by the job deadline".into()))
            }
            Err(_) => Err(StepError::failed(
                FailureClass::GenerationTimeout,
                format!("generation timed out after {}ms", budget.as_millis()),
                None,
            )),
        }
    }

    /// Time allowed for the next external call, and whether the deadline (not the step timeout) bounds it.
    fn step_budget(&self, deadline: DateTime<Utc>) -> Result<(Duration, bool), StepError> {
        let remaining = (deadline - self.clock.now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| StepError::Deadline("job deadline passed".into()))?;
        if remaining < self.config.step_timeout {
            Ok((remaining, true))
        } else {
            Ok((self.config.step_timeout, false))
        }
    }

    async fn complete(
        &self,
        id: JobId,
        attempt: u32,
        report: Report,
        artifacts: &[Artifact],
    ) -> Result<Outcome, PipelineError> {
        let mut patch = JobPatch::complete(report, self.clock.now()).fenced(attempt);
        match serde_json::to_value(artifacts) {
            Ok(sources) => patch = patch.with_sources(sources),
            Err(e) => warn!(error = %e, "could not encode fetched sources, storing report only"),
        }
        match self.write(id, JobStatus::Running, JobStatus::Completed, patch).await? {
            Some(_) => {
                info!(attempt, "job completed");
                Ok(Outcome::Completed)
            }
            None => Ok(self.lost_ownership(attempt)),
        }
    }

    async fn fail(&self, id: JobId, attempt: u32, error: JobError) -> Result<Outcome, PipelineError> {
        let kind = error.kind;
        let patch = JobPatch::fail(error).fenced(attempt);
        match self.write(id, JobStatus::Running, JobStatus::Failed, patch).await? {
            Some(_) => {
                info!(attempt, kind = %kind, "job failed");
                Ok(Outcome::Failed(kind))
            }
            None => Ok(self.lost_ownership(attempt)),
        }
    }

    /// Fail from whatever non-terminal status `job` was loaded in.
    async fn finish_failed(&self, job: &Job, error: JobError) -> Result<Outcome, PipelineError> {
        let kind = error.kind;
        let patch = JobPatch::fail(error).fenced(job.attempt_count);
        match self.write(job.id, job.status, JobStatus::Failed, patch).await? {
            Some(_) => {
                info!(attempt = job.attempt_count, kind = %kind, "job failed");
                Ok(Outcome::Failed(kind))
            }
            None => Ok(Outcome::Discarded(DiscardReason::ClaimedElsewhere)),
        }
    }

    fn lost_ownership(&self, attempt: u32) -> Outcome {
        warn!(attempt, "attempt superseded by another worker, abandoning");
        Outcome::Discarded(DiscardReason::LostOwnership)
    }

    /// Compare-and-swap; `None` when the record moved on without us.
    async fn write(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<Option<Job>, PipelineError> {
        match self.store.transition(id, expected, next, patch).await {
            Ok(job) => Ok(Some(job)),
            Err(JobStoreError::Conflict(reason)) => {
                debug!(%reason, "transition rejected");
                Ok(None)
            }
            Err(JobStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::store::InMemoryJobStore;
    use async_trait::async_trait;
    use gitgauge_analysis::{FetchError, GenerationError, HeuristicGenerator};
    use gitgauge_core::NewJob;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Plays back scripted results, repeating the last one.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<Vec<Artifact>, FetchError>>>,
        calls: AtomicU32,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<Vec<Artifact>, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataFetcher for ScriptedFetcher {
        async fn fetch(&self, _: &str, _: usize, _: &ItemFilters) -> Result<Vec<Artifact>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    struct ScriptedGenerator {
        script: Mutex<VecDeque<Result<serde_json::Value, GenerationError>>>,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Result<serde_json::Value, GenerationError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl AnalysisGenerator for ScriptedGenerator {
        async fn generate(&self, _: GenerationRequest<'_>) -> Result<serde_json::Value, GenerationError> {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    struct PanickingFetcher;

    #[async_trait]
    impl DataFetcher for PanickingFetcher {
        async fn fetch(&self, _: &str, _: usize, _: &ItemFilters) -> Result<Vec<Artifact>, FetchError> {
            panic!("fetcher exploded");
        }
    }

    /// Sleeps for the next scripted delay (repeating the last), then succeeds.
    struct SlowFetcher {
        delays: Mutex<VecDeque<Duration>>,
        calls: AtomicU32,
    }

    impl SlowFetcher {
        fn new(delays: Vec<Duration>) -> Arc<Self> {
            Arc::new(Self {
                delays: Mutex::new(delays.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl DataFetcher for SlowFetcher {
        async fn fetch(&self, _: &str, _: usize, _: &ItemFilters) -> Result<Vec<Artifact>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = next_delay(&self.delays);
            tokio::time::sleep(delay).await;
            Ok(two_repos())
        }
    }

    struct SlowGenerator {
        delays: Mutex<VecDeque<Duration>>,
    }

    #[async_trait]
    impl AnalysisGenerator for SlowGenerator {
        async fn generate(&self, _: GenerationRequest<'_>) -> Result<serde_json::Value, GenerationError> {
            let delay = next_delay(&self.delays);
            tokio::time::sleep(delay).await;
            Ok(well_formed())
        }
    }

    fn next_delay(delays: &Mutex<VecDeque<Duration>>) -> Duration {
        let mut delays = delays.lock().unwrap();
        if delays.len() > 1 {
            delays.pop_front().unwrap()
        } else {
            delays.front().copied().unwrap()
        }
    }

    const HANG: Duration = Duration::from_secs(30);
    const SHORT_STEP: Duration = Duration::from_millis(50);

    fn two_repos() -> Vec<Artifact> {
        vec![
            Artifact::new("pytools", "octocat").with_language("Python", 1000),
            Artifact::new("scripts", "octocat").with_language("Python", 200),
        ]
    }

    fn rate_limited() -> Result<Vec<Artifact>, FetchError> {
        Err(FetchError::rate_limited("slow down", None))
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        orchestrator: PipelineOrchestrator,
    }

    fn harness(fetcher: Arc<dyn DataFetcher>, generator: Arc<dyn AnalysisGenerator>, max_attempts: u32) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let config = PipelineConfig {
            retry: RetryPolicy::exponential(max_attempts, Duration::from_secs(1), Duration::from_secs(30))
                .without_jitter(),
            ..PipelineConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(store.clone(), fetcher, generator, clock.clone(), config);
        Harness {
            store,
            clock,
            orchestrator,
        }
    }

    async fn submit(store: &InMemoryJobStore) -> Job {
        let input = JobInput::new(NewJob::new("octocat", vec!["Python".into()])).unwrap();
        store.create(input).await.unwrap()
    }

    fn well_formed() -> serde_json::Value {
        json!({
            "candidate": { "github_username": "someone", "summary_of_work": "Python tooling" },
            "skills_match": [{ "skill": "Python", "strength": 4 }],
            "code_quality": {
                "style": "ok", "readability": "ok", "testing": "ok", "documentation": "ok", "security": "ok"
            },
            "commit_habits": { "frequency": "weekly", "message_quality": "ok", "collaboration_signals": "some" },
            "interview_questions": [],
            "risk_flags": [],
            "overall_assessment": { "decision_hint": "yes", "justification": "fine" }
        })
    }

    #[tokio::test]
    async fn happy_path_completes_with_normalized_report() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        let job = submit(&h.store).await;

        let outcome = h.orchestrator.process(job.id).await.unwrap();
        assert_eq!(outcome, Outcome::Completed);

        let done = h.store.get(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 1);
        assert!(done.error.is_none());
        let sources = done.sources.as_ref().and_then(|s| s.as_array()).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0]["full_name"], "octocat/pytools");
        let report = done.report.unwrap();
        assert_eq!(report.candidate.github_username, "octocat");
        assert!(!report.skills_match.is_empty());
        assert_eq!(report.interview_questions.len(), 1);
        assert!(done.generated_at.unwrap() >= done.created_at);
    }

    #[tokio::test]
    async fn heuristic_generator_end_to_end() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            Arc::new(HeuristicGenerator::new()),
            3,
        );
        let job = submit(&h.store).await;
        assert_eq!(h.orchestrator.process(job.id).await.unwrap(), Outcome::Completed);
    }

    #[tokio::test]
    async fn not_found_fails_without_retry() {
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::not_found("no such user"))]);
        let h = harness(fetcher.clone(), ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::NotFound)
        );
        let failed = h.store.get(job.id).await.unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.error.unwrap().kind, ErrorKind::NotFound);
        assert!(failed.report.is_none());
        assert_eq!(fetcher.calls(), 1);
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_then_success_reaches_generation_on_last_attempt() {
        let n = 4;
        let mut script: Vec<_> = (0..n - 1).map(|_| rate_limited()).collect();
        script.push(Ok(two_repos()));
        let fetcher = ScriptedFetcher::new(script);
        // Generator keeps failing transiently so we can observe running(generating).
        let generator = ScriptedGenerator::new(vec![Err(GenerationError::transient("busy"))]);
        let h = harness(fetcher.clone(), generator, n);
        let job = submit(&h.store).await;

        let outcome = h.orchestrator.process(job.id).await.unwrap();
        assert_eq!(outcome, Outcome::Failed(ErrorKind::GenerationExhausted));
        assert_eq!(fetcher.calls(), n);

        let failed = h.store.get(job.id).await.unwrap();
        assert_eq!(failed.attempt_count, n);
        assert_eq!(failed.stage, Some(PipelineStage::Generating));
        assert_eq!(failed.error.unwrap().retries_exhausted, Some(n));
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn rate_limited_every_time_exhausts_fetch() {
        let n = 3;
        let h = harness(
            ScriptedFetcher::new(vec![rate_limited()]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            n,
        );
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::FetchExhausted)
        );
        let failed = h.store.get(job.id).await.unwrap();
        assert_eq!(failed.attempt_count, n);
        let error = failed.error.unwrap();
        assert_eq!(error.kind, ErrorKind::FetchExhausted);
        assert_eq!(error.retries_exhausted, Some(n));
    }

    #[tokio::test]
    async fn rate_limit_hint_sets_the_floor() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::rate_limited("reset soon", Some(Duration::from_secs(10)))),
            Ok(two_repos()),
        ]);
        let h = harness(fetcher, ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        let job = submit(&h.store).await;

        assert_eq!(h.orchestrator.process(job.id).await.unwrap(), Outcome::Completed);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn malformed_output_every_time_exhausts_generation() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(json!({ "not": "a report" }))]),
            3,
        );
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::GenerationExhausted)
        );
        let failed = h.store.get(job.id).await.unwrap();
        assert!(failed.report.is_none());
        let error = failed.error.unwrap();
        assert_eq!(error.kind, ErrorKind::GenerationExhausted);
        assert_eq!(error.last_failure, Some(ErrorKind::InvalidOutput));
    }

    #[tokio::test]
    async fn malformed_output_can_be_made_terminal() {
        let mut h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(json!([]))]),
            3,
        );
        h.orchestrator.config.policy = PolicyTable::default().retry_invalid_output(false);
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::InvalidOutput)
        );
    }

    #[tokio::test]
    async fn empty_fetch_result_is_not_found() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(vec![])]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        let job = submit(&h.store).await;
        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::NotFound)
        );
        let error = h.store.get(job.id).await.unwrap().error.unwrap();
        assert_eq!(error.message, NO_MATCHES);
    }

    #[tokio::test]
    async fn duplicate_delivery_of_claimed_job_is_discarded() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        let job = submit(&h.store).await;
        // Another worker claimed it a moment ago.
        h.store
            .transition(
                job.id,
                JobStatus::Queued,
                JobStatus::Running,
                JobPatch::new().with_attempt(1).with_stage(PipelineStage::Fetching),
            )
            .await
            .unwrap();

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Discarded(DiscardReason::ClaimedElsewhere)
        );
        let still = h.store.get(job.id).await.unwrap();
        assert_eq!(still.status, JobStatus::Running);
        assert_eq!(still.attempt_count, 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_process_once() {
        let fetcher = ScriptedFetcher::new(vec![Ok(two_repos())]);
        let h = harness(fetcher.clone(), ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        let job = submit(&h.store).await;

        let (a, b) = tokio::join!(h.orchestrator.process(job.id), h.orchestrator.process(job.id));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Completed).count(), 1);
        assert!(outcomes.iter().any(|o| matches!(o, Outcome::Discarded(_))));
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(h.store.get(job.id).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn terminal_and_missing_jobs_are_discarded() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        let job = submit(&h.store).await;
        assert_eq!(h.orchestrator.process(job.id).await.unwrap(), Outcome::Completed);
        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Discarded(DiscardReason::Terminal)
        );
        assert_eq!(
            h.orchestrator.process(JobId::new()).await.unwrap(),
            Outcome::Discarded(DiscardReason::Missing)
        );
    }

    #[tokio::test]
    async fn abandoned_job_is_reclaimed_with_next_attempt() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        let job = submit(&h.store).await;
        h.store
            .transition(job.id, JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1))
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(301));

        assert_eq!(h.orchestrator.process(job.id).await.unwrap(), Outcome::Completed);
        assert_eq!(h.store.get(job.id).await.unwrap().attempt_count, 2);

        // The dead worker wakes up and tries to finish attempt 1.
        let err = h
            .store
            .transition(
                job.id,
                JobStatus::Running,
                JobStatus::Failed,
                JobPatch::fail(JobError::new(ErrorKind::InternalError, "late")).fenced(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn abandoned_job_without_budget_fails_internal() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            1,
        );
        let job = submit(&h.store).await;
        h.store
            .transition(job.id, JobStatus::Queued, JobStatus::Running, JobPatch::new().with_attempt(1))
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(301));

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::InternalError)
        );
        let error = h.store.get(job.id).await.unwrap().error.unwrap();
        assert_eq!(error.retries_exhausted, Some(1));
    }

    #[tokio::test]
    async fn queued_job_past_deadline_fails_without_running() {
        let fetcher = ScriptedFetcher::new(vec![Ok(two_repos())]);
        let h = harness(fetcher.clone(), ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        let job = submit(&h.store).await;
        h.clock.advance(Duration::from_secs(601));

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::DeadlineExceeded)
        );
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(h.store.get(job.id).await.unwrap().attempt_count, 0);
    }

    #[tokio::test]
    async fn backoff_that_crosses_the_deadline_fails_early() {
        let mut h = harness(
            ScriptedFetcher::new(vec![Err(FetchError::transient("reset"))]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            10,
        );
        h.orchestrator.config.job_deadline = Duration::from_secs(5);
        h.orchestrator.config.stale_after = Duration::from_secs(5);
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::DeadlineExceeded)
        );
        // 1s + 2s fit in the 5s budget; the 4s backoff would not.
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(h.store.get(job.id).await.unwrap().attempt_count, 3);
    }

    #[tokio::test]
    async fn fetch_timeout_is_retried() {
        let fetcher = SlowFetcher::new(vec![HANG, Duration::ZERO]);
        let mut h = harness(fetcher.clone(), ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        h.orchestrator.config.step_timeout = SHORT_STEP;
        let job = submit(&h.store).await;

        assert_eq!(h.orchestrator.process(job.id).await.unwrap(), Outcome::Completed);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.store.get(job.id).await.unwrap().attempt_count, 2);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn generation_timeout_every_time_exhausts_generation() {
        let generator = Arc::new(SlowGenerator {
            delays: Mutex::new(vec![HANG].into()),
        });
        let mut h = harness(ScriptedFetcher::new(vec![Ok(two_repos())]), generator, 2);
        h.orchestrator.config.step_timeout = SHORT_STEP;
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::GenerationExhausted)
        );
        let failed = h.store.get(job.id).await.unwrap();
        assert_eq!(failed.attempt_count, 2);
        let error = failed.error.unwrap();
        assert_eq!(error.retries_exhausted, Some(2));
        assert!(error.message.contains("timed out"), "{}", error.message);
    }

    #[tokio::test]
    async fn call_cut_short_by_the_deadline_is_deadline_exceeded() {
        let fetcher = SlowFetcher::new(vec![HANG]);
        let mut h = harness(fetcher.clone(), ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        h.orchestrator.config.step_timeout = Duration::from_secs(10);
        h.orchestrator.config.job_deadline = SHORT_STEP;
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::DeadlineExceeded)
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.get(job.id).await.unwrap().attempt_count, 1);
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn permanent_fetch_error_fails_immediately() {
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::permanent("account suspended"))]);
        let h = harness(fetcher.clone(), ScriptedGenerator::new(vec![Ok(well_formed())]), 3);
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::FetchExhausted)
        );
        let failed = h.store.get(job.id).await.unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.error.unwrap().retries_exhausted, None);
        assert_eq!(fetcher.calls(), 1);
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn permanent_generation_error_fails_immediately() {
        let h = harness(
            ScriptedFetcher::new(vec![Ok(two_repos())]),
            ScriptedGenerator::new(vec![Err(GenerationError::permanent("model rejected the prompt"))]),
            3,
        );
        let job = submit(&h.store).await;

        assert_eq!(
            h.orchestrator.process(job.id).await.unwrap(),
            Outcome::Failed(ErrorKind::GenerationExhausted)
        );
        let failed = h.store.get(job.id).await.unwrap();
        assert_eq!(failed.attempt_count, 1);
        assert!(failed.sources.is_none());
        assert!(h.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn extreme_deadline_does_not_overflow() {
        let mut h = harness(
            ScriptedFetcher::new(vec![rate_limited(), Ok(two_repos())]),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        h.orchestrator.config.job_deadline = Duration::from_secs(u64::MAX);
        let job = submit(&h.store).await;

        assert_eq!(h.orchestrator.process(job.id).await.unwrap(), Outcome::Completed);
        assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn panicking_collaborator_can_be_recorded_as_internal_error() {
        let h = harness(
            Arc::new(PanickingFetcher),
            ScriptedGenerator::new(vec![Ok(well_formed())]),
            3,
        );
        let job = submit(&h.store).await;
        let orchestrator = Arc::new(h.orchestrator);

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.process(job.id).await })
        };
        let join = task.await.unwrap_err();
        assert!(join.is_panic());

        assert_eq!(
            orchestrator.record_internal_failure(job.id, "fetcher exploded").await.unwrap(),
            Outcome::Failed(ErrorKind::InternalError)
        );
        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
    }
}
