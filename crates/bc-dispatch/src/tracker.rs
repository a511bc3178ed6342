//! Per-recipient status tracking and broadcast-level aggregation.

use std::collections::BTreeMap;

use tracing::{debug, info};

use bc_common::DeliveryStatus;
use bc_store::{BroadcastRepository, RecipientRepository};

use crate::{DispatchError, Result};

/// Records state transitions for recipients and derives broadcast
/// completion. Safe for concurrent use from all workers - each call touches
/// a single recipient row.
pub struct StatusTracker {
    broadcasts: BroadcastRepository,
    recipients: RecipientRepository,
}

impl StatusTracker {
    pub fn new(broadcasts: BroadcastRepository, recipients: RecipientRepository) -> Self {
        Self {
            broadcasts,
            recipients,
        }
    }

    /// Persist the outcome of one attempt. Storage errors surface to the
    /// caller; they are never swallowed here.
    ///
    /// When a recipient reaches a terminal status and no non-terminal
    /// siblings remain, the parent broadcast is marked complete.
    pub async fn record(
        &self,
        recipient_id: &str,
        status: DeliveryStatus,
        attempt_count: u32,
        error: Option<&str>,
        provider_message_id: Option<&str>,
    ) -> Result<()> {
        self.recipients
            .update_status(recipient_id, status, attempt_count, error, provider_message_id)
            .await?;

        debug!(
            recipient_id = %recipient_id,
            status = %status,
            attempt = attempt_count,
            "Recorded recipient status"
        );

        if status.is_terminal() {
            self.check_broadcast_complete(recipient_id).await?;
        }

        Ok(())
    }

    async fn check_broadcast_complete(&self, recipient_id: &str) -> Result<()> {
        let Some(recipient) = self.recipients.find_by_id(recipient_id).await? else {
            return Ok(());
        };

        let remaining = self
            .recipients
            .count_non_terminal(&recipient.broadcast_id)
            .await?;
        if remaining == 0 && self.broadcasts.mark_completed(&recipient.broadcast_id).await? {
            info!(broadcast_id = %recipient.broadcast_id, "Broadcast complete");
            metrics::counter!("dispatch.broadcasts.completed_total").increment(1);
        }

        Ok(())
    }

    /// Status -> recipient count for one broadcast, every bucket present.
    ///
    /// One GROUP BY scan per call: a consistent snapshot where each
    /// recipient is counted in exactly one bucket.
    pub async fn aggregate(&self, broadcast_id: &str) -> Result<BTreeMap<DeliveryStatus, u64>> {
        if self.broadcasts.find_by_id(broadcast_id).await?.is_none() {
            return Err(DispatchError::NotFound(broadcast_id.to_string()));
        }

        let counts = self.recipients.count_by_status(broadcast_id).await?;

        let mut full = BTreeMap::new();
        for status in DeliveryStatus::all() {
            full.insert(status, counts.get(&status).copied().unwrap_or(0));
        }
        Ok(full)
    }
}
