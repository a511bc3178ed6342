//! Dispatch engine integration tests.
//!
//! A scripted provider plays back per-recipient outcomes while the real
//! queue, store, tracker, pool, and orchestrator run against an in-memory
//! SQLite database.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bc_common::{DeliveryStatus, MessagePayload, SendOutcome};
use bc_dispatch::{
    BroadcastOrchestrator, BroadcastRequest, DispatchError, DispatchPool, DispatchPoolConfig,
    StatusTracker,
};
use bc_provider::ProviderClient;
use bc_queue::{JobQueue, SqliteJobQueue};
use bc_store::{BroadcastRepository, Recipient, RecipientRepository};
use sqlx::sqlite::SqlitePoolOptions;

/// Provider that plays back a scripted outcome sequence per destination.
/// Unscripted destinations always deliver.
struct ScriptedProvider {
    scripts: parking_lot::Mutex<HashMap<String, VecDeque<SendOutcome>>>,
    call_counts: parking_lot::Mutex<HashMap<String, u32>>,
    panics: parking_lot::Mutex<HashSet<String>>,
    delay: Duration,
}

impl ScriptedProvider {
    fn new() -> Self {
        Self {
            scripts: parking_lot::Mutex::new(HashMap::new()),
            call_counts: parking_lot::Mutex::new(HashMap::new()),
            panics: parking_lot::Mutex::new(HashSet::new()),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn script(&self, destination: &str, outcomes: Vec<SendOutcome>) {
        self.scripts
            .lock()
            .insert(destination.to_string(), outcomes.into());
    }

    /// Panic on the first call for this destination (simulated worker crash)
    fn panic_once(&self, destination: &str) {
        self.panics.lock().insert(destination.to_string());
    }

    fn calls(&self, destination: &str) -> u32 {
        self.call_counts
            .lock()
            .get(destination)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    async fn send(&self, destination: &str, _payload: &MessagePayload) -> SendOutcome {
        *self
            .call_counts
            .lock()
            .entry(destination.to_string())
            .or_insert(0) += 1;

        if self.panics.lock().remove(destination) {
            panic!("scripted provider panic for {destination}");
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.scripts
            .lock()
            .get_mut(destination)
            .and_then(|script| script.pop_front())
            .unwrap_or_else(|| SendOutcome::delivered("wamid.default"))
    }
}

struct Harness {
    orchestrator: BroadcastOrchestrator,
    pool: Arc<DispatchPool>,
    queue: Arc<SqliteJobQueue>,
    broadcasts: BroadcastRepository,
    recipients: RecipientRepository,
}

async fn harness(
    pool_size: u32,
    max_attempts: u32,
    provider: Arc<ScriptedProvider>,
) -> Harness {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let queue = Arc::new(SqliteJobQueue::new(
        db.clone(),
        "dispatch-test",
        Duration::from_millis(10),
    ));
    queue.init_schema().await.unwrap();

    let broadcasts = BroadcastRepository::new(db.clone());
    let recipients = RecipientRepository::new(db);
    broadcasts.init_schema().await.unwrap();
    recipients.init_schema().await.unwrap();

    let tracker = Arc::new(StatusTracker::new(broadcasts.clone(), recipients.clone()));
    let pool = Arc::new(DispatchPool::new(
        DispatchPoolConfig {
            worker_pool_size: pool_size,
            max_attempts,
            dequeue_timeout: Duration::from_millis(50),
            // immediate retries keep the tests fast
            retry_backoff: Duration::ZERO,
            retry_backoff_cap: Duration::ZERO,
        },
        queue.clone(),
        provider,
        tracker.clone(),
    ));

    let orchestrator = BroadcastOrchestrator::new(
        broadcasts.clone(),
        recipients.clone(),
        queue.clone(),
        tracker,
        pool.clone(),
    );

    Harness {
        orchestrator,
        pool,
        queue,
        broadcasts,
        recipients,
    }
}

fn request(recipients: Vec<&str>) -> BroadcastRequest {
    BroadcastRequest {
        user_id: "user-1".to_string(),
        message_content: None,
        template_name: Some("hello_world".to_string()),
        language_code: "en_US".to_string(),
        business_account_id: "biz-1".to_string(),
        sender_phone_id: "sender-1".to_string(),
        recipients: recipients.into_iter().map(String::from).collect(),
    }
}

/// Poll until every recipient of the broadcast is terminal.
async fn wait_until_terminal(h: &Harness, broadcast_id: &str, expected: usize) -> Vec<Recipient> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let rows = h.recipients.find_by_broadcast(broadcast_id).await.unwrap();
        if rows.len() == expected && rows.iter().all(|r| r.status.is_terminal()) {
            return rows;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("broadcast {broadcast_id} did not reach terminal state: {rows:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn submit_creates_rows_and_does_not_wait_for_delivery() {
    let provider = Arc::new(ScriptedProvider::with_delay(Duration::from_millis(300)));
    let h = harness(2, 3, provider).await;

    let numbers: Vec<String> = (0..10).map(|i| format!("+1555000010{i}")).collect();
    let handle = h
        .orchestrator
        .submit(request(numbers.iter().map(String::as_str).collect()))
        .await
        .unwrap();

    assert_eq!(handle.recipient_count, 10);

    // submit returned while the first provider calls were still sleeping, so
    // nothing can be Sent yet and all ten rows already exist
    let rows = h
        .recipients
        .find_by_broadcast(&handle.broadcast_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|r| !r.status.is_terminal()));

    wait_until_terminal(&h, &handle.broadcast_id, 10).await;
    h.pool.shutdown().await;
}

#[tokio::test]
async fn empty_recipient_list_is_rejected_without_side_effects() {
    let h = harness(1, 3, Arc::new(ScriptedProvider::new())).await;

    let err = h.orchestrator.submit(request(vec![])).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRequest(_)));
    assert_eq!(h.queue.len().await.unwrap(), 0);
    assert!(!h.pool.is_started());
}

#[tokio::test]
async fn invalid_phone_number_is_rejected() {
    let h = harness(1, 3, Arc::new(ScriptedProvider::new())).await;

    let err = h
        .orchestrator
        .submit(request(vec!["+15551234567", "bogus"]))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidRequest(_)));
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn retryable_failures_exhaust_after_max_attempts() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.script(
        "+15550000001",
        vec![
            SendOutcome::retryable("HTTP 503"),
            SendOutcome::retryable("HTTP 503"),
            SendOutcome::retryable("HTTP 503"),
        ],
    );
    let h = harness(2, 3, provider.clone()).await;

    let handle = h
        .orchestrator
        .submit(request(vec!["+15550000001"]))
        .await
        .unwrap();
    let rows = wait_until_terminal(&h, &handle.broadcast_id, 1).await;

    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert_eq!(rows[0].attempt_count, 3);
    assert_eq!(rows[0].last_error.as_deref(), Some("HTTP 503"));
    assert_eq!(provider.calls("+15550000001"), 3);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_finalizes_after_one_attempt() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.script(
        "+15550000002",
        vec![SendOutcome::permanent("HTTP 400: unknown template")],
    );
    let h = harness(2, 3, provider.clone()).await;

    let handle = h
        .orchestrator
        .submit(request(vec!["+15550000002"]))
        .await
        .unwrap();
    let rows = wait_until_terminal(&h, &handle.broadcast_id, 1).await;

    assert_eq!(rows[0].status, DeliveryStatus::Failed);
    assert_eq!(rows[0].attempt_count, 1);
    assert_eq!(provider.calls("+15550000002"), 1);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn delivery_on_second_attempt_is_never_retried_again() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.script(
        "+15550000003",
        vec![
            SendOutcome::retryable("HTTP 500"),
            SendOutcome::delivered("wamid.retry-win"),
        ],
    );
    let h = harness(2, 3, provider.clone()).await;

    let handle = h
        .orchestrator
        .submit(request(vec!["+15550000003"]))
        .await
        .unwrap();
    let rows = wait_until_terminal(&h, &handle.broadcast_id, 1).await;

    assert_eq!(rows[0].status, DeliveryStatus::Sent);
    assert_eq!(rows[0].attempt_count, 2);
    assert_eq!(
        rows[0].provider_message_id.as_deref(),
        Some("wamid.retry-win")
    );

    // no further attempts after the terminal state
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(provider.calls("+15550000003"), 2);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn aggregate_sums_to_recipient_count_and_marks_completion() {
    // Worked example: [Delivered, Retryable x3, Retryable x3], max_attempts 3
    let provider = Arc::new(ScriptedProvider::new());
    provider.script("+15550000010", vec![SendOutcome::delivered("wamid.ok")]);
    for phone in ["+15550000011", "+15550000012"] {
        provider.script(
            phone,
            vec![
                SendOutcome::retryable("HTTP 503"),
                SendOutcome::retryable("HTTP 503"),
                SendOutcome::retryable("HTTP 503"),
            ],
        );
    }
    let h = harness(3, 3, provider).await;

    let handle = h
        .orchestrator
        .submit(request(vec![
            "+15550000010",
            "+15550000011",
            "+15550000012",
        ]))
        .await
        .unwrap();
    wait_until_terminal(&h, &handle.broadcast_id, 3).await;

    let counts = h.orchestrator.get_status(&handle.broadcast_id).await.unwrap();
    assert_eq!(counts.get(&DeliveryStatus::Sent), Some(&1));
    assert_eq!(counts.get(&DeliveryStatus::Failed), Some(&2));
    assert_eq!(counts.values().sum::<u64>(), 3);

    let broadcast = h
        .broadcasts
        .find_by_id(&handle.broadcast_id)
        .await
        .unwrap()
        .unwrap();
    assert!(broadcast.completed);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn get_status_for_unknown_broadcast_is_not_found() {
    let h = harness(1, 3, Arc::new(ScriptedProvider::new())).await;
    let err = h.orchestrator.get_status("no-such-id").await.unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(_)));
}

#[tokio::test]
async fn concurrent_workers_keep_disjoint_recipients_consistent() {
    let provider = Arc::new(ScriptedProvider::new());
    let numbers: Vec<String> = (0..12).map(|i| format!("+155500002{i:02}")).collect();
    // every third recipient is rejected outright, the rest deliver
    for (i, phone) in numbers.iter().enumerate() {
        if i % 3 == 0 {
            provider.script(phone, vec![SendOutcome::permanent("HTTP 400")]);
        }
    }
    let h = harness(4, 3, provider).await;

    let handle = h
        .orchestrator
        .submit(request(numbers.iter().map(String::as_str).collect()))
        .await
        .unwrap();
    let rows = wait_until_terminal(&h, &handle.broadcast_id, 12).await;

    for row in &rows {
        let idx: usize = numbers
            .iter()
            .position(|n| *n == row.phone_number)
            .unwrap();
        let expected = if idx % 3 == 0 {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Sent
        };
        assert_eq!(row.status, expected, "recipient {}", row.phone_number);
    }

    let counts = h.orchestrator.get_status(&handle.broadcast_id).await.unwrap();
    assert_eq!(counts.get(&DeliveryStatus::Sent), Some(&8));
    assert_eq!(counts.get(&DeliveryStatus::Failed), Some(&4));
    h.pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_leaves_unprocessed_entries_on_the_queue() {
    let provider = Arc::new(ScriptedProvider::with_delay(Duration::from_millis(200)));
    let h = harness(1, 3, provider).await;

    let numbers: Vec<String> = (0..6).map(|i| format!("+155500003{i:02}")).collect();
    let handle = h
        .orchestrator
        .submit(request(numbers.iter().map(String::as_str).collect()))
        .await
        .unwrap();

    // let the single worker pick up at most one job, then stop the pool
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.pool.shutdown().await;

    // the in-flight send finished; everything else survived on the queue
    assert!(h.queue.len().await.unwrap() > 0);
    let rows = h
        .recipients
        .find_by_broadcast(&handle.broadcast_id)
        .await
        .unwrap();
    assert_eq!(rows.len(), 6);
    assert!(rows
        .iter()
        .all(|r| matches!(r.status, DeliveryStatus::Queued | DeliveryStatus::Sent)));
}

#[tokio::test]
async fn dead_worker_is_restarted_by_supervisor() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.panic_once("+15550000050");
    let h = harness(1, 3, provider).await;

    let handle = h
        .orchestrator
        .submit(request(vec!["+15550000050", "+15550000051"]))
        .await
        .unwrap();

    // the only worker dies on the first recipient; the supervisor replaces
    // it and the replacement drains the second one
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let rows = h
            .recipients
            .find_by_broadcast(&handle.broadcast_id)
            .await
            .unwrap();
        let survivor = rows
            .iter()
            .find(|r| r.phone_number == "+15550000051")
            .unwrap();
        if survivor.status == DeliveryStatus::Sent {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker was never restarted: {rows:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats = h.pool.stats();
    assert_eq!(stats.worker_restarts, 1);
    assert_eq!(stats.workers_alive, 1);

    // the job that crashed mid-send was claimed but never recorded - the
    // accepted at-least-once gap leaves its recipient parked in Sending
    let rows = h
        .recipients
        .find_by_broadcast(&handle.broadcast_id)
        .await
        .unwrap();
    let crashed = rows
        .iter()
        .find(|r| r.phone_number == "+15550000050")
        .unwrap();
    assert_eq!(crashed.status, DeliveryStatus::Sending);

    h.pool.shutdown().await;
}

#[tokio::test]
async fn run_until_drained_processes_backlog_and_exits() {
    let provider = Arc::new(ScriptedProvider::new());
    let h = harness(2, 3, provider).await;

    // seed work directly, bypassing the orchestrator's auto-start
    let broadcast = bc_store::Broadcast::new(
        "user-1",
        None,
        Some("hello_world".to_string()),
        "en_US",
        "biz-1",
        "sender-1",
    );
    h.broadcasts.insert(&broadcast).await.unwrap();
    let payload = broadcast.payload();

    let mut ids = Vec::new();
    for i in 0..3 {
        let recipient = Recipient::new(&broadcast.id, format!("+155500004{i:02}"));
        h.recipients
            .insert_many(std::slice::from_ref(&recipient))
            .await
            .unwrap();
        h.recipients
            .update_status(&recipient.id, DeliveryStatus::Queued, 0, None, None)
            .await
            .unwrap();
        h.queue
            .enqueue(
                bc_common::SendJob::new(
                    &broadcast.id,
                    &recipient.id,
                    &recipient.phone_number,
                    payload.clone(),
                ),
                None,
            )
            .await
            .unwrap();
        ids.push(recipient.id);
    }

    h.pool.run_until_drained(Duration::from_millis(200)).await;

    assert!(!h.pool.is_started());
    assert_eq!(h.queue.len().await.unwrap(), 0);
    for id in &ids {
        let row = h.recipients.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Sent);
    }
}
