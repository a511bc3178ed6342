//! Broadcast orchestration: accept a request, persist it, fan out send
//! jobs, and hand off to the worker pool without waiting on delivery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use bc_common::DeliveryStatus;
use bc_common::SendJob;
use bc_queue::JobQueue;
use bc_store::{Broadcast, BroadcastRepository, Recipient, RecipientRepository};

use crate::pool::DispatchPool;
use crate::tracker::StatusTracker;
use crate::{DispatchError, Result};

/// E.164-ish destination format
const PHONE_PATTERN: &str = r"^\+?[1-9]\d{1,14}$";

fn phone_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PHONE_PATTERN).expect("valid phone pattern"))
}

/// An accepted broadcast request. `user_id` comes from the authentication
/// collaborator and is trusted as-is.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub user_id: String,
    #[serde(default)]
    pub message_content: Option<String>,
    #[serde(default)]
    pub template_name: Option<String>,
    pub language_code: String,
    pub business_account_id: String,
    pub sender_phone_id: String,
    pub recipients: Vec<String>,
}

/// What the caller gets back immediately: no delivery has happened yet.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastHandle {
    pub broadcast_id: String,
    pub recipient_count: usize,
    pub created_at: DateTime<Utc>,
}

pub struct BroadcastOrchestrator {
    broadcasts: BroadcastRepository,
    recipients: RecipientRepository,
    queue: Arc<dyn JobQueue>,
    tracker: Arc<StatusTracker>,
    pool: Arc<DispatchPool>,
}

impl BroadcastOrchestrator {
    pub fn new(
        broadcasts: BroadcastRepository,
        recipients: RecipientRepository,
        queue: Arc<dyn JobQueue>,
        tracker: Arc<StatusTracker>,
        pool: Arc<DispatchPool>,
    ) -> Self {
        Self {
            broadcasts,
            recipients,
            queue,
            tracker,
            pool,
        }
    }

    /// Accept a broadcast: validate, persist one recipient row per address,
    /// enqueue one send job per recipient, make sure the pool is consuming,
    /// and return. Enqueue cost is O(N); the caller never waits on a send.
    ///
    /// Infrastructure failures roll back everything created so far and
    /// surface synchronously - at this point no caller-visible work exists.
    pub async fn submit(&self, request: BroadcastRequest) -> Result<BroadcastHandle> {
        Self::validate(&request)?;

        let broadcast = Broadcast::new(
            &request.user_id,
            request.message_content.clone(),
            request.template_name.clone(),
            &request.language_code,
            &request.business_account_id,
            &request.sender_phone_id,
        );
        self.broadcasts.insert(&broadcast).await?;

        let rows: Vec<Recipient> = request
            .recipients
            .iter()
            .map(|phone| Recipient::new(&broadcast.id, phone))
            .collect();

        if let Err(e) = self.recipients.insert_many(&rows).await {
            self.rollback(&broadcast.id).await;
            return Err(e.into());
        }

        let payload = broadcast.payload();
        for row in &rows {
            // Flip to Queued before the entry is visible so a worker's
            // Sending update can never be overwritten by this loop.
            let queued = self
                .recipients
                .update_status(&row.id, DeliveryStatus::Queued, 0, None, None)
                .await
                .map_err(DispatchError::from);

            let enqueued = match queued {
                Ok(()) => {
                    let job =
                        SendJob::new(&broadcast.id, &row.id, &row.phone_number, payload.clone());
                    self.queue.enqueue(job, None).await.map_err(DispatchError::from)
                }
                Err(e) => Err(e),
            };

            if let Err(e) = enqueued {
                error!(
                    broadcast_id = %broadcast.id,
                    error = %e,
                    "Failed to enqueue broadcast, rolling back"
                );
                self.rollback(&broadcast.id).await;
                return Err(e);
            }
        }

        self.pool.clone().ensure_started().await;

        info!(
            broadcast_id = %broadcast.id,
            user_id = %broadcast.user_id,
            recipients = rows.len(),
            "Broadcast accepted"
        );
        metrics::counter!("dispatch.broadcasts.accepted_total").increment(1);
        metrics::counter!("dispatch.jobs.enqueued_total").increment(rows.len() as u64);

        Ok(BroadcastHandle {
            broadcast_id: broadcast.id,
            recipient_count: rows.len(),
            created_at: broadcast.created_at,
        })
    }

    /// Status-name -> count for one broadcast. `NotFound` for unknown ids.
    pub async fn get_status(&self, broadcast_id: &str) -> Result<BTreeMap<DeliveryStatus, u64>> {
        self.tracker.aggregate(broadcast_id).await
    }

    fn validate(request: &BroadcastRequest) -> Result<()> {
        if request.recipients.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "recipient list must not be empty".to_string(),
            ));
        }

        if request.message_content.is_none() && request.template_name.is_none() {
            return Err(DispatchError::InvalidRequest(
                "either message content or a template name is required".to_string(),
            ));
        }

        for phone in &request.recipients {
            if !phone_regex().is_match(phone) {
                return Err(DispatchError::InvalidRequest(format!(
                    "invalid phone number: {phone}"
                )));
            }
        }

        Ok(())
    }

    /// Best-effort cleanup of a partially created broadcast. Orphaned queue
    /// entries for deleted rows are handled by the workers' contained
    /// not-found path.
    async fn rollback(&self, broadcast_id: &str) {
        if let Err(e) = self.recipients.delete_by_broadcast(broadcast_id).await {
            error!(broadcast_id = %broadcast_id, error = %e, "Rollback: failed to delete recipients");
        }
        if let Err(e) = self.broadcasts.delete(broadcast_id).await {
            error!(broadcast_id = %broadcast_id, error = %e, "Rollback: failed to delete broadcast");
        }
    }
}
