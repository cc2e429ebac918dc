//! Submission and read side used by the HTTP layer.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use gitgauge_core::{DomainError, Job, JobId, JobInput, JobStatus, JobSummary, NewJob};

use super::queue::JobQueue;
use super::store::{JobStore, JobStoreError};

pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const MAX_LIST_LIMIT: usize = 100;

/// Acknowledgement returned for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub estimated_wait_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    estimated_wait: Duration,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService")
            .field("estimated_wait", &self.estimated_wait)
            .finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            store,
            queue,
            estimated_wait: Duration::from_secs(300),
        }
    }

    pub fn with_estimated_wait(mut self, wait: Duration) -> Self {
        self.estimated_wait = wait;
        self
    }

    /// Validate, persist as `queued`, then enqueue.
    ///
    /// The record is written before the id is handed to the queue. If the
    /// enqueue fails the job is still accepted; the stale-job sweep picks it up.
    #[instrument(skip(self, request), fields(github_username = %request.github_username), err)]
    pub async fn create(&self, request: NewJob) -> Result<CreatedJob, ServiceError> {
        let input = JobInput::new(request).map_err(|e| match e {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => ServiceError::Validation(msg),
            other => ServiceError::Validation(other.to_string()),
        })?;
        let job = self.store.create(input).await?;

        if let Err(e) = self.queue.enqueue(job.id).await {
            warn!(job_id = %job.id, error = %e, "enqueue failed; job left for the stale sweep");
        }
        info!(job_id = %job.id, "job accepted");

        Ok(CreatedJob {
            job_id: job.id,
            status: job.status,
            estimated_wait_seconds: self.estimated_wait.as_secs(),
        })
    }

    pub async fn get(&self, id: JobId) -> Result<Job, ServiceError> {
        match self.store.get(id).await {
            Ok(job) => Ok(job),
            Err(JobStoreError::NotFound(id)) => Err(ServiceError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Newest-first page; `limit` defaults to 10 and is capped at 100.
    pub async fn list(&self, limit: Option<usize>, offset: Option<usize>) -> Result<Vec<JobSummary>, ServiceError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list(limit, offset.unwrap_or(0)).await?)
    }

    /// Whether the job store answers a minimal read.
    pub async fn storage_ok(&self) -> bool {
        match self.store.list(1, 0).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "job store health check failed");
                false
            }
        }
    }
}
