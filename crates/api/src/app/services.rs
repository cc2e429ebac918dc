//! Backend wiring: store, queue, collaborators, orchestrator and workers.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use gitgauge_analysis::{AnalysisGenerator, DataFetcher, FixtureFetcher, HeuristicGenerator};
use gitgauge_infra::AppConfig;
use gitgauge_infra::jobs::{
    Clock, InMemoryJobQueue, InMemoryJobStore, JobQueue, JobService, JobStore, PipelineOrchestrator,
    PostgresJobStore, SystemClock, WorkerPool, WorkerPoolHandle,
};

#[cfg(feature = "redis")]
use gitgauge_infra::jobs::RedisStreamsJobQueue;

/// Everything the HTTP layer and `main` hold on to.
pub struct AppServices {
    pub jobs: JobService,
    pub workers: WorkerPoolHandle,
}

/// Build the backends selected by `config` and start the worker pool.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = build_store(config, clock.clone()).await?;
    let queue = build_queue(config).await?;

    let fetcher: Arc<dyn DataFetcher> = Arc::new(FixtureFetcher::new(config.fixtures_dir.clone()));
    let generator: Arc<dyn AnalysisGenerator> = Arc::new(HeuristicGenerator::new());

    Ok(wire(config, store, queue, fetcher, generator, clock))
}

/// Assemble services from already-built backends.
pub fn wire(
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    fetcher: Arc<dyn DataFetcher>,
    generator: Arc<dyn AnalysisGenerator>,
    clock: Arc<dyn Clock>,
) -> AppServices {
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        store.clone(),
        fetcher,
        generator,
        clock.clone(),
        config.pipeline_config(),
    ));
    let workers = WorkerPool::new(store.clone(), queue.clone(), orchestrator, clock).spawn(config.worker_config());
    let jobs = JobService::new(store, queue).with_estimated_wait(config.estimated_wait);

    AppServices { jobs, workers }
}

async fn build_store(config: &AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            let store = PostgresJobStore::new(pool).with_clock(clock);
            store.migrate().await.context("creating job tables")?;
            tracing::info!("using postgres job store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; jobs are kept in memory and lost on restart");
            Ok(Arc::new(InMemoryJobStore::with_clock(clock)))
        }
    }
}

async fn build_queue(config: &AppConfig) -> anyhow::Result<Arc<dyn JobQueue>> {
    if let Some(url) = &config.redis_url {
        #[cfg(feature = "redis")]
        {
            let queue = RedisStreamsJobQueue::connect(url, config.queue_visibility_timeout)
                .await
                .context("connecting to REDIS_URL")?;
            tracing::info!("using redis streams job queue");
            return Ok(Arc::new(queue));
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(redis_url = %url, "REDIS_URL set but redis feature not enabled, falling back to in-memory queue");
        }
    }
    Ok(Arc::new(InMemoryJobQueue::new(config.queue_visibility_timeout)))
}
