//! Dispatch worker pool.
//!
//! A fixed set of workers claim jobs from the queue, call the provider, and
//! record outcomes. Retryable failures re-enter the queue with exponential
//! backoff until `max_attempts`; permanent failures finalize immediately.
//! A supervisor restarts workers that die so the pool is never silently
//! short-staffed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use bc_common::{PoolStats, SendJob, SendOutcome};
use bc_common::DeliveryStatus;
use bc_provider::ProviderClient;
use bc_queue::{JobQueue, QueueError};

use crate::tracker::StatusTracker;

/// How often the supervisor checks for dead workers
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);
/// Restarts allowed before a dead worker slot is abandoned
const MAX_WORKER_RESTARTS: u32 = 3;
/// Grace allowed for in-flight sends during shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DispatchPoolConfig {
    /// Number of concurrent workers
    pub worker_pool_size: u32,
    /// Maximum send attempts per recipient (>= 1)
    pub max_attempts: u32,
    /// How long one dequeue call waits before the loop re-checks shutdown
    pub dequeue_timeout: Duration,
    /// Base retry delay; doubles per attempt
    pub retry_backoff: Duration,
    /// Upper bound on the retry delay
    pub retry_backoff_cap: Duration,
}

impl Default for DispatchPoolConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            max_attempts: 3,
            dequeue_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
            retry_backoff_cap: Duration::from_secs(300),
        }
    }
}

/// A job currently being processed by some worker
#[derive(Debug, Clone)]
struct InFlightJob {
    broadcast_id: String,
    recipient_id: String,
    worker_id: u32,
    started_at: Instant,
}

/// A job that has been in flight beyond the stall threshold
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledJob {
    pub job_id: String,
    pub broadcast_id: String,
    pub recipient_id: String,
    pub worker_id: u32,
    pub elapsed_seconds: u64,
}

pub struct DispatchPool {
    config: DispatchPoolConfig,
    queue: Arc<dyn JobQueue>,
    provider: Arc<dyn ProviderClient>,
    tracker: Arc<StatusTracker>,

    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,

    /// Workers currently alive
    active_workers: Arc<AtomicU32>,
    /// Jobs claimed but not yet recorded, keyed by job id
    in_flight: Arc<DashMap<String, InFlightJob>>,
    worker_restarts: Arc<AtomicU32>,
    worker_handles: Mutex<Vec<(u32, JoinHandle<()>)>>,
}

impl DispatchPool {
    pub fn new(
        config: DispatchPoolConfig,
        queue: Arc<dyn JobQueue>,
        provider: Arc<dyn ProviderClient>,
        tracker: Arc<StatusTracker>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            queue,
            provider,
            tracker,
            shutdown_tx,
            started: AtomicBool::new(false),
            active_workers: Arc::new(AtomicU32::new(0)),
            in_flight: Arc::new(DashMap::new()),
            worker_restarts: Arc::new(AtomicU32::new(0)),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the workers and the supervisor. Idempotent - later calls are
    /// no-ops, so the orchestrator can call this on every submit.
    pub async fn ensure_started(self: Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            workers = self.config.worker_pool_size,
            max_attempts = self.config.max_attempts,
            "Starting dispatch pool"
        );

        let mut handles = self.worker_handles.lock().await;
        for worker_id in 0..self.config.worker_pool_size {
            handles.push((worker_id, self.spawn_worker(worker_id, None)));
        }
        drop(handles);

        Self::spawn_supervisor(self);
    }

    /// Bounded-run mode: spawn the workers and return once the queue has
    /// been empty for `grace` with nothing in flight. Used by one-shot runs
    /// and tests; the pool must not have been started in continuous mode.
    pub async fn run_until_drained(&self, grace: Duration) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("run_until_drained called on an already-started pool");
            return;
        }

        info!(workers = self.config.worker_pool_size, "Starting bounded dispatch run");

        let handles: Vec<_> = (0..self.config.worker_pool_size)
            .map(|worker_id| self.spawn_worker(worker_id, Some(grace)))
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Dispatch worker terminated abnormally");
            }
        }

        self.started.store(false, Ordering::SeqCst);
        info!("Bounded dispatch run drained");
    }

    fn spawn_worker(&self, worker_id: u32, idle_grace: Option<Duration>) -> JoinHandle<()> {
        self.active_workers.fetch_add(1, Ordering::SeqCst);

        let ctx = WorkerContext {
            worker_id,
            queue: self.queue.clone(),
            provider: self.provider.clone(),
            tracker: self.tracker.clone(),
            config: self.config.clone(),
            in_flight: self.in_flight.clone(),
            active_workers: self.active_workers.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            idle_grace,
        };

        tokio::spawn(run_worker(ctx))
    }

    fn spawn_supervisor(pool: Arc<Self>) {
        let mut shutdown_rx = pool.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reap_dead_workers().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Worker supervisor shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Replace workers that exited outside shutdown, up to a bounded number
    /// of restarts. Past the bound the slot is abandoned and the reduced
    /// `workers_alive` count shows up in [`DispatchPool::stats`].
    async fn reap_dead_workers(&self) {
        let mut handles = self.worker_handles.lock().await;
        let mut i = 0;

        while i < handles.len() {
            if !handles[i].1.is_finished() {
                i += 1;
                continue;
            }

            let (worker_id, handle) = handles.swap_remove(i);
            match handle.await {
                Ok(()) => {
                    warn!(worker_id, "Dispatch worker exited unexpectedly");
                }
                Err(e) if e.is_panic() => {
                    error!(worker_id, "Dispatch worker panicked");
                }
                Err(_) => {}
            }

            // A stop may have landed while we held a finished handle; never
            // respawn into a pool that is shutting down.
            if !self.started.load(Ordering::SeqCst) {
                continue;
            }

            let restarts = self.worker_restarts.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::counter!("dispatch.workers.restarted_total").increment(1);

            if restarts <= MAX_WORKER_RESTARTS {
                warn!(
                    worker_id,
                    restart = restarts,
                    max_restarts = MAX_WORKER_RESTARTS,
                    "Restarting dead dispatch worker"
                );
                handles.push((worker_id, self.spawn_worker(worker_id, None)));
            } else {
                error!(
                    worker_id,
                    restarts,
                    "Worker restart budget exhausted - pool is running short-staffed"
                );
            }
        }
    }

    /// Graceful stop: workers observe the signal between jobs, in-flight
    /// sends finish, unclaimed queue entries stay put for a future run.
    pub async fn shutdown(&self) {
        info!("Dispatch pool shutting down...");
        // Flip started before signalling so the supervisor stops respawning.
        self.started.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let mut handles = self.worker_handles.lock().await;
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;

        for (worker_id, handle) in handles.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!(worker_id, "Worker did not stop within shutdown timeout");
            }
        }

        info!("Dispatch pool shutdown complete");
    }

    /// Nothing queued and nothing being processed.
    pub async fn is_drained(&self) -> bool {
        self.in_flight.is_empty() && self.queue.len().await.map(|n| n == 0).unwrap_or(false)
    }

    /// Jobs that have been processing longer than `threshold` - a stuck
    /// provider call or a wedged worker, surfaced for health monitoring.
    pub fn stalled_jobs(&self, threshold: Duration) -> Vec<StalledJob> {
        self.in_flight
            .iter()
            .filter(|entry| entry.value().started_at.elapsed() >= threshold)
            .map(|entry| {
                let job = entry.value();
                StalledJob {
                    job_id: entry.key().clone(),
                    broadcast_id: job.broadcast_id.clone(),
                    recipient_id: job.recipient_id.clone(),
                    worker_id: job.worker_id,
                    elapsed_seconds: job.started_at.elapsed().as_secs(),
                }
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers_configured: self.config.worker_pool_size,
            workers_alive: self.active_workers.load(Ordering::SeqCst),
            jobs_in_flight: self.in_flight.len() as u32,
            worker_restarts: self.worker_restarts.load(Ordering::SeqCst),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

struct WorkerContext {
    worker_id: u32,
    queue: Arc<dyn JobQueue>,
    provider: Arc<dyn ProviderClient>,
    tracker: Arc<StatusTracker>,
    config: DispatchPoolConfig,
    in_flight: Arc<DashMap<String, InFlightJob>>,
    active_workers: Arc<AtomicU32>,
    shutdown_rx: broadcast::Receiver<()>,
    idle_grace: Option<Duration>,
}

/// Decrements the live-worker count however the worker exits, panics
/// included.
struct WorkerGuard {
    active_workers: Arc<AtomicU32>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_worker(mut ctx: WorkerContext) {
    let _guard = WorkerGuard {
        active_workers: ctx.active_workers.clone(),
    };

    info!(worker_id = ctx.worker_id, "Dispatch worker started");
    let mut idle_since: Option<Instant> = None;

    loop {
        // The stop signal is observed between jobs, never mid-claim, so an
        // in-flight send always runs to completion.
        match ctx.shutdown_rx.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => {
                info!(worker_id = ctx.worker_id, "Dispatch worker stopping");
                break;
            }
        }

        match ctx.queue.dequeue(ctx.config.dequeue_timeout).await {
            Ok(Some(job)) => {
                idle_since = None;
                process_job(&ctx, job).await;
            }
            Ok(None) => {
                if let Some(grace) = ctx.idle_grace {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    // delayed retries are invisible to dequeue but still
                    // pending work, so check the full queue length too
                    if since.elapsed() >= grace
                        && ctx.in_flight.is_empty()
                        && matches!(ctx.queue.len().await, Ok(0))
                    {
                        debug!(worker_id = ctx.worker_id, "Queue drained, worker exiting");
                        break;
                    }
                }
            }
            Err(QueueError::Stopped) => {
                info!(worker_id = ctx.worker_id, "Queue stopped, worker exiting");
                break;
            }
            Err(e) => {
                error!(worker_id = ctx.worker_id, error = %e, "Error polling queue");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    info!(worker_id = ctx.worker_id, "Dispatch worker exited");
}

/// Process one claimed job. Any failure here is contained to this recipient;
/// the worker loop never sees an error.
async fn process_job(ctx: &WorkerContext, job: SendJob) {
    let attempt = job.attempt + 1;

    ctx.in_flight.insert(
        job.job_id.clone(),
        InFlightJob {
            broadcast_id: job.broadcast_id.clone(),
            recipient_id: job.recipient_id.clone(),
            worker_id: ctx.worker_id,
            started_at: Instant::now(),
        },
    );

    if let Err(e) = ctx
        .tracker
        .record(&job.recipient_id, DeliveryStatus::Sending, attempt, None, None)
        .await
    {
        // The claimed entry is gone from the queue; dropping the job here is
        // the accepted at-least-once gap. The recipient row still shows its
        // last recorded state.
        error!(
            worker_id = ctx.worker_id,
            recipient_id = %job.recipient_id,
            error = %e,
            "Failed to record sending status, dropping job"
        );
        metrics::counter!("dispatch.jobs.dropped_total").increment(1);
        ctx.in_flight.remove(&job.job_id);
        return;
    }

    let outcome = ctx.provider.send(&job.phone_number, &job.payload).await;
    let result = apply_outcome(ctx, &job, attempt, outcome).await;

    if let Err(e) = result {
        error!(
            worker_id = ctx.worker_id,
            recipient_id = %job.recipient_id,
            attempt,
            error = %e,
            "Failed to record attempt outcome"
        );
    }

    ctx.in_flight.remove(&job.job_id);
}

async fn apply_outcome(
    ctx: &WorkerContext,
    job: &SendJob,
    attempt: u32,
    outcome: SendOutcome,
) -> crate::Result<()> {
    match outcome {
        SendOutcome::Delivered {
            provider_message_id,
        } => {
            debug!(
                worker_id = ctx.worker_id,
                recipient_id = %job.recipient_id,
                attempt,
                "Message delivered"
            );
            metrics::counter!("dispatch.jobs.sent_total").increment(1);
            ctx.tracker
                .record(
                    &job.recipient_id,
                    DeliveryStatus::Sent,
                    attempt,
                    None,
                    provider_message_id.as_deref(),
                )
                .await
        }
        SendOutcome::RetryableFailure { reason } => {
            if attempt < ctx.config.max_attempts {
                // Record first, then re-enqueue: the recipient only re-enters
                // the queue after this attempt's outcome is on the row.
                ctx.tracker
                    .record(
                        &job.recipient_id,
                        DeliveryStatus::Queued,
                        attempt,
                        Some(&reason),
                        None,
                    )
                    .await?;

                let delay = retry_delay(&ctx.config, attempt);
                warn!(
                    worker_id = ctx.worker_id,
                    recipient_id = %job.recipient_id,
                    attempt,
                    delay_seconds = delay.as_secs(),
                    reason = %reason,
                    "Transient failure, re-enqueueing"
                );
                metrics::counter!("dispatch.jobs.retried_total").increment(1);

                if let Err(e) = ctx.queue.enqueue(job.next_attempt(), Some(delay)).await {
                    // Can't get the retry onto the queue - finalize rather
                    // than leave the recipient parked in Queued forever.
                    error!(
                        recipient_id = %job.recipient_id,
                        error = %e,
                        "Re-enqueue failed, finalizing recipient as failed"
                    );
                    ctx.tracker
                        .record(
                            &job.recipient_id,
                            DeliveryStatus::Failed,
                            attempt,
                            Some(&reason),
                            None,
                        )
                        .await?;
                }
                Ok(())
            } else {
                warn!(
                    worker_id = ctx.worker_id,
                    recipient_id = %job.recipient_id,
                    attempt,
                    reason = %reason,
                    "Retries exhausted, finalizing as failed"
                );
                metrics::counter!("dispatch.jobs.failed_total").increment(1);
                ctx.tracker
                    .record(
                        &job.recipient_id,
                        DeliveryStatus::Failed,
                        attempt,
                        Some(&reason),
                        None,
                    )
                    .await
            }
        }
        SendOutcome::PermanentFailure { reason } => {
            warn!(
                worker_id = ctx.worker_id,
                recipient_id = %job.recipient_id,
                attempt,
                reason = %reason,
                "Permanent failure, finalizing without retry"
            );
            metrics::counter!("dispatch.jobs.failed_total").increment(1);
            ctx.tracker
                .record(
                    &job.recipient_id,
                    DeliveryStatus::Failed,
                    attempt,
                    Some(&reason),
                    None,
                )
                .await
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
fn retry_delay(config: &DispatchPoolConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    config.retry_backoff.saturating_mul(factor).min(config.retry_backoff_cap)
}
