//! Job record store: trait, error type and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gitgauge_core::{DomainError, Job, JobId, JobInput, JobPatch, JobStatus, JobSummary};

use super::clock::{Clock, SystemClock};

/// Authoritative persistence for job records.
///
/// `transition` is the only write after `create` and the sole concurrency
/// primitive of the system: it applies `Job::transitioned` atomically against
/// the stored record.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new `queued` job for `input`.
    async fn create(&self, input: JobInput) -> Result<Job, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Newest-first summaries.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<JobSummary>, JobStoreError>;

    /// Compare-and-swap `expected -> next`, applying `patch`.
    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError>;

    /// Non-terminal jobs whose last write is older than `before`.
    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub(crate) fn from_domain(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => JobStoreError::Conflict(msg),
            DomainError::InvalidTransition(msg) => JobStoreError::InvalidTransition(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobStoreError::Storage(msg),
        }
    }
}

#[async_trait]
impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    async fn create(&self, input: JobInput) -> Result<Job, JobStoreError> {
        (**self).create(input).await
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(id).await
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<JobSummary>, JobStoreError> {
        (**self).list(limit, offset).await
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        (**self).transition(id, expected, next, patch).await
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        (**self).list_stale(before, limit).await
    }
}

/// In-memory job store for tests/dev.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore").field("jobs", &self.len()).finish()
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, input: JobInput) -> Result<Job, JobStoreError> {
        let job = Job::new(JobId::new(), input, self.clock.now());
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<JobSummary>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut all: Vec<&Job> = jobs.values().collect();
        // v7 ids are time-ordered, which breaks ties between equal timestamps.
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(all.into_iter().skip(offset).take(limit).map(Job::summary).collect())
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        patch: JobPatch,
    ) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let current = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let updated = current
            .transitioned(expected, next, patch, now)
            .map_err(JobStoreError::from_domain)?;
        *current = updated.clone();
        Ok(updated)
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut stale: Vec<&Job> = jobs
            .values()
            .filter(|j| !j.is_terminal() && j.updated_at < before)
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale.into_iter().take(limit).map(|j| j.id).collect())
    }
}
