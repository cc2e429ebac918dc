//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream Key**: `gitgauge:jobs`, one entry per enqueue carrying `job_id`
//! - **Consumer Group**: `gitgauge-workers`; every worker process is a named
//!   consumer in it, so each entry goes to one consumer
//! - **Redelivery**: entries pending longer than the visibility timeout are
//!   taken over with XCLAIM by whichever consumer polls next
//! - **Ack**: XACK removes the entry from the group's pending list

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamReadReply};
use redis::RedisResult;
use tracing::{instrument, warn};

use gitgauge_core::JobId;

use super::queue::{Delivery, JobQueue, QueueError};

const DEFAULT_STREAM_KEY: &str = "gitgauge:jobs";
const DEFAULT_GROUP: &str = "gitgauge-workers";
const JOB_ID_FIELD: &str = "job_id";

#[derive(Debug, Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl RedisStreamsJobQueue {
    /// Connect and make sure the consumer group exists.
    pub async fn connect(redis_url: &str, visibility_timeout: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(backend("open"))?;
        let queue = Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("worker-{}", uuid::Uuid::now_v7()),
            visibility_timeout,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    /// XGROUP CREATE ... MKSTREAM; an existing group (BUSYGROUP) is fine.
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let created: RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Backend(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    // Blocking reads tie up a connection, so every call gets its own.
    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend("connect"))
    }

    /// Take over one entry another consumer left pending for too long.
    async fn claim_abandoned(&self, conn: &mut MultiplexedConnection) -> Result<Option<Delivery>, QueueError> {
        let min_idle_ms = self.visibility_timeout.as_millis() as u64;
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(backend("XPENDING"))?;

        let Some((entry_id, previous_owner, _idle, times_delivered)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(&entry_id)
            .query_async(conn)
            .await
            .map_err(backend("XCLAIM"))?;

        // Another consumer may have claimed it between XPENDING and XCLAIM.
        let Some(entry) = claimed.ids.into_iter().next() else {
            return Ok(None);
        };
        warn!(
            entry_id = %entry_id,
            previous_owner = %previous_owner,
            delivery_count = times_delivered + 1,
            "reclaimed abandoned queue entry"
        );
        self.delivery_from(entry, times_delivered as u32 + 1).map(Some)
    }

    fn delivery_from(&self, entry: StreamId, delivery_count: u32) -> Result<Delivery, QueueError> {
        let raw: String = entry
            .get(JOB_ID_FIELD)
            .ok_or_else(|| QueueError::Malformed(format!("entry {} has no {JOB_ID_FIELD}", entry.id)))?;
        let job_id = raw
            .parse::<JobId>()
            .map_err(|e| QueueError::Malformed(format!("entry {}: {e}", entry.id)))?;
        Ok(Delivery {
            job_id,
            receipt: entry.id,
            delivery_count,
        })
    }
}

fn backend(op: &'static str) -> impl Fn(redis::RedisError) -> QueueError {
    move |e| QueueError::Backend(format!("{op} failed: {e}"))
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(JOB_ID_FIELD)
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(backend("XADD"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(consumer = %self.consumer), err)]
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;

        if let Some(delivery) = self.claim_abandoned(&mut conn).await? {
            return Ok(Some(delivery));
        }

        let block_ms = (wait.as_millis() as u64).max(1);
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(backend("XREADGROUP"))?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        match entry {
            Some(entry) => {
                let entry_id = entry.id.clone();
                match self.delivery_from(entry, 1) {
                    Ok(delivery) => Ok(Some(delivery)),
                    Err(e) => {
                        // Unparseable entries would be redelivered forever; drop them.
                        warn!(entry_id = %entry_id, error = %e, "discarding malformed queue entry");
                        let _: RedisResult<i64> = redis::cmd("XACK")
                            .arg(&self.stream_key)
                            .arg(&self.group)
                            .arg(&entry_id)
                            .query_async(&mut conn)
                            .await;
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id, receipt = %delivery.receipt), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await
            .map_err(backend("XACK"))?;
        Ok(())
    }
}
