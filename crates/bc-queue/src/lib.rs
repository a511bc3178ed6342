use std::time::Duration;

use async_trait::async_trait;
use bc_common::SendJob;

pub mod error;
pub mod sqlite;

pub use error::QueueError;
pub use sqlite::SqliteJobQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Durable, ordered, at-least-once work queue for send jobs.
///
/// Multiple concurrent consumers are supported; each entry is handed to
/// exactly one consumer (claim-and-delete). FIFO is best effort - retried
/// jobs re-enter at the tail. The queue is not the system of record: once an
/// entry is claimed it is gone, and the Recipient row carries the state.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue identifier, for logs and metrics
    fn identifier(&self) -> &str;

    /// Append a job at the tail. `delay` defers visibility (retry backoff).
    ///
    /// Fails only on storage error (`QueueError::Unavailable`).
    async fn enqueue(&self, job: SendJob, delay: Option<Duration>) -> Result<()>;

    /// Claim the next visible job, polling until one appears or `timeout`
    /// elapses. Returns `None` on timeout; never blocks forever.
    ///
    /// Corrupted entries are discarded with a warning and never surface.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<SendJob>>;

    /// Number of entries still on the queue, including not-yet-visible ones.
    async fn len(&self) -> Result<u64>;

    fn is_healthy(&self) -> bool;

    /// Stop handing out work. Pending entries stay on the queue.
    async fn stop(&self);
}
