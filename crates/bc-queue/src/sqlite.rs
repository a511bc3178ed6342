//! SQLite-backed job queue.
//!
//! One table of pending entries; consumers claim with an optimistic DELETE
//! so each entry goes to exactly one worker. `visible_at` defers retried
//! jobs without a separate delay mechanism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, warn};

use bc_common::SendJob;

use crate::{JobQueue, QueueError, Result};

pub struct SqliteJobQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    poll_interval: Duration,
    running: AtomicBool,
}

impl SqliteJobQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            poll_interval,
            running: AtomicBool::new(true),
        }
    }

    /// Create the queue table and polling index.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS send_queue (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_send_queue_visible
            ON send_queue (queue_name, visible_at, enqueued_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "Job queue schema initialized");
        Ok(())
    }

    /// Try to claim one visible entry. `Ok(None)` means nothing claimable
    /// right now; a lost race against another consumer also lands here.
    async fn try_claim(&self) -> Result<Option<SendJob>> {
        let now = Utc::now().timestamp();

        let Some(row) = sqlx::query(
            r#"
            SELECT id, payload FROM send_queue
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY enqueued_at, rowid
            LIMIT 1
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let id: String = row.get("id");
        let payload: String = row.get("payload");

        let deleted = sqlx::query("DELETE FROM send_queue WHERE id = ? AND queue_name = ?")
            .bind(&id)
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await?;

        if deleted.rows_affected() == 0 {
            // Another consumer grabbed this entry
            return Ok(None);
        }

        match serde_json::from_str::<SendJob>(&payload) {
            Ok(job) => {
                debug!(queue = %self.queue_name, job_id = %job.job_id, "Claimed job");
                Ok(Some(job))
            }
            Err(e) => {
                // Malformed entry: already deleted above, so just report it
                warn!(
                    queue = %self.queue_name,
                    entry_id = %id,
                    error = %e,
                    "Discarding malformed queue entry"
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn enqueue(&self, job: SendJob, delay: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let visible_at = now.timestamp() + delay.map(|d| d.as_secs() as i64).unwrap_or(0);
        let payload = serde_json::to_string(&job)?;

        sqlx::query(
            r#"
            INSERT INTO send_queue (id, queue_name, visible_at, payload, enqueued_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&self.queue_name)
        .bind(visible_at)
        .bind(&payload)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(
            queue = %self.queue_name,
            job_id = %job.job_id,
            attempt = job.attempt,
            delay_seconds = delay.map(|d| d.as_secs()).unwrap_or(0),
            "Job enqueued"
        );
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<SendJob>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if !self.running.load(Ordering::SeqCst) {
                return Err(QueueError::Stopped);
            }

            if let Some(job) = self.try_claim().await? {
                return Ok(Some(job));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn len(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM send_queue WHERE queue_name = ?")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as u64)
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "Job queue stopped");
    }
}
