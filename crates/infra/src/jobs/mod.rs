//! Analysis job pipeline: record store, queue, orchestrator and workers.
//!
//! ## Components
//!
//! - `JobStore`: authoritative job records with compare-and-swap transitions
//! - `JobQueue`: at-least-once hand-off of job ids (in-memory or Redis Streams)
//! - `PipelineOrchestrator`: claims a job and drives fetch -> generate -> persist
//! - `WorkerPool`: bounded workers plus the stale-job watchdog
//! - `JobService`: create/get/list surface used by the HTTP layer
//!
//! The queue only carries ids; every decision is made against the store, so
//! duplicate and late deliveries are harmless.

pub mod clock;
pub mod orchestrator;
pub mod policy;
pub mod postgres;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod service;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use orchestrator::{DiscardReason, Outcome, PipelineConfig, PipelineError, PipelineOrchestrator};
pub use policy::{BackoffStrategy, Disposition, FailureClass, PolicyTable, RetryPolicy};
pub use postgres::PostgresJobStore;
pub use queue::{Delivery, InMemoryJobQueue, JobQueue, QueueError};
#[cfg(feature = "redis")]
pub use redis_queue::RedisStreamsJobQueue;
pub use service::{CreatedJob, JobService, ServiceError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use worker::{WorkerConfig, WorkerPool, WorkerPoolHandle, WorkerStats};
