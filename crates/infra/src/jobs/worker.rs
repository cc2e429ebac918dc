//! Worker pool: pulls deliveries off the queue and hands them to the orchestrator.
//!
//! Each worker loops `dequeue -> process -> ack`. A delivery is acked once the
//! orchestrator reports any outcome (including discards), and left unacked
//! when the store was unreachable so the queue redelivers it later.
//!
//! A watchdog task periodically re-enqueues non-terminal jobs that have not
//! been written for `stale_after`, covering lost enqueues and dead workers.
//! A job is re-enqueued at most once per `stale_after` window, so a backlog
//! that is merely slow to drain does not pile up duplicate deliveries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gitgauge_core::JobId;

use super::clock::{chrono_duration, Clock};
use super::orchestrator::{Outcome, PipelineOrchestrator};
use super::queue::{Delivery, JobQueue};
use super::store::{JobStore, JobStoreError};

const STALE_SCAN_LIMIT: usize = 100;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Number of concurrent worker loops
    pub concurrency: usize,
    /// How long a single dequeue waits before re-checking for shutdown
    pub poll_interval: Duration,
    /// How often the watchdog scans for stale jobs
    pub watchdog_interval: Duration,
    /// Jobs untouched for this long are re-enqueued
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "gitgauge-worker".to_string(),
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            watchdog_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    /// Deliveries left unacked because the store was unavailable.
    pub errors: u64,
    /// Ids re-enqueued by the watchdog.
    pub requeued: u64,
    pub running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    clock: Arc<dyn Clock>,
    /// When the watchdog last re-enqueued each job.
    requeued_at: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            orchestrator,
            clock,
            requeued_at: Mutex::new(HashMap::new()),
        }
    }

    /// Start `config.concurrency` workers plus the watchdog on the current runtime.
    pub fn spawn(self, config: WorkerConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let pool = Arc::new(self);
        let mut joins = Vec::with_capacity(config.concurrency + 1);

        info!(
            name = %config.name,
            concurrency = config.concurrency,
            "starting worker pool"
        );

        for index in 0..config.concurrency.max(1) {
            let pool = pool.clone();
            let stats = stats.clone();
            let shutdown = shutdown_rx.clone();
            let name = format!("{}-{index}", config.name);
            let poll = config.poll_interval;
            joins.push(tokio::spawn(async move {
                pool.worker_loop(name, poll, shutdown, stats).await;
            }));
        }

        {
            let pool = pool.clone();
            let stats = stats.clone();
            let mut shutdown = shutdown_rx;
            let interval = config.watchdog_interval;
            let stale_after = config.stale_after;
            joins.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    match pool.sweep(stale_after).await {
                        Ok(requeued) => lock(&stats).requeued += requeued as u64,
                        Err(e) => warn!(error = %e, "stale job sweep failed"),
                    }
                }
                debug!("watchdog stopped");
            }));
        }

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }

    async fn worker_loop(
        self: Arc<Self>,
        name: String,
        poll: Duration,
        mut shutdown: watch::Receiver<bool>,
        stats: Arc<Mutex<WorkerStats>>,
    ) {
        debug!(worker = %name, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                res = self.queue.dequeue(poll) => res,
            };
            match delivery {
                Ok(Some(delivery)) => self.handle(&name, delivery, &stats).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = %name, error = %e, "dequeue failed");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        debug!(worker = %name, "worker stopped");
    }

    async fn handle(&self, worker: &str, delivery: Delivery, stats: &Mutex<WorkerStats>) {
        let job_id = delivery.job_id;
        lock(stats).running += 1;

        // Run in its own task so a panic inside a collaborator is contained.
        let orchestrator = self.orchestrator.clone();
        let result = tokio::spawn(async move { orchestrator.process(job_id).await }).await;

        let outcome = match result {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!(worker, job_id = %job_id, error = %e, "job store unavailable, leaving delivery for redelivery");
                None
            }
            Err(join_error) => {
                let message = panic_message(join_error);
                error!(worker, job_id = %job_id, panic = %message, "pipeline panicked");
                match self
                    .orchestrator
                    .record_internal_failure(job_id, &format!("pipeline panicked: {message}"))
                    .await
                {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        warn!(worker, job_id = %job_id, error = %e, "could not record panic");
                        None
                    }
                }
            }
        };

        {
            let mut stats = lock(stats);
            stats.running = stats.running.saturating_sub(1);
            match outcome {
                Some(outcome) => {
                    stats.processed += 1;
                    match outcome {
                        Outcome::Completed => stats.completed += 1,
                        Outcome::Failed(_) => stats.failed += 1,
                        Outcome::Discarded(_) => stats.discarded += 1,
                    }
                }
                None => stats.errors += 1,
            }
        }

        if outcome.is_some() {
            if let Err(e) = self.queue.ack(&delivery).await {
                warn!(worker, job_id = %job_id, error = %e, "ack failed; delivery will repeat");
            }
        }
    }

    /// Re-enqueue non-terminal jobs idle for longer than `stale_after`.
    ///
    /// Jobs this pool already re-enqueued within the last `stale_after` are
    /// skipped: their earlier delivery is still waiting in the queue.
    pub async fn sweep(&self, stale_after: Duration) -> Result<usize, JobStoreError> {
        let now = self.clock.now();
        let before = now
            .checked_sub_signed(chrono_duration(stale_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale: Vec<JobId> = self.store.list_stale(before, STALE_SCAN_LIMIT).await?;

        let due: Vec<JobId> = {
            let mut requeued_at = self.requeued_at.lock().unwrap_or_else(|p| p.into_inner());
            requeued_at.retain(|_, at| *at > before);
            stale
                .into_iter()
                .filter(|id| {
                    let recent = requeued_at.contains_key(id);
                    if recent {
                        debug!(job_id = %id, "stale job already re-enqueued this window");
                    }
                    !recent
                })
                .collect()
        };

        let mut requeued = 0;
        for job_id in due {
            match self.queue.enqueue(job_id).await {
                Ok(()) => {
                    requeued += 1;
                    self.requeued_at
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(job_id, now);
                    info!(job_id = %job_id, "re-enqueued stale job");
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to re-enqueue stale job"),
            }
        }
        Ok(requeued)
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
