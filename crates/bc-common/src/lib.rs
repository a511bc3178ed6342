use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Delivery status
// ============================================================================

/// Per-recipient delivery status.
///
/// Transitions: `Pending -> Queued -> Sending -> {Sent | Failed}`.
/// A retryable failure with attempts remaining goes back to `Queued`;
/// `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Recipient row created, not yet on the queue
    Pending,
    /// Send job is on the queue awaiting a worker
    Queued,
    /// A worker has claimed the job and is calling the provider
    Sending,
    /// Provider accepted the message
    Sent,
    /// Gave up: permanent rejection or retries exhausted
    Failed,
}

impl Default for DeliveryStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Stable string form used for persistence and status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "QUEUED" => Some(Self::Queued),
            "SENDING" => Some(Self::Sending),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// All states, in lifecycle order. Status reports include every bucket
    /// even when its count is zero.
    pub fn all() -> [DeliveryStatus; 5] {
        [
            Self::Pending,
            Self::Queued,
            Self::Sending,
            Self::Sent,
            Self::Failed,
        ]
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message payload
// ============================================================================

/// What gets sent to one destination: the sender channel plus either a
/// template reference or a plain text body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Provider-side sender channel (phone number id)
    pub sender_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageBody {
    #[serde(rename_all = "camelCase")]
    Template {
        name: String,
        language_code: String,
    },
    Text {
        body: String,
    },
}

// ============================================================================
// Send jobs
// ============================================================================

/// One unit of work on the job queue: deliver `payload` to `phone_number`.
///
/// Ephemeral - the Recipient row is the system of record. `attempt` is the
/// number of attempts already made when this entry was enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendJob {
    pub job_id: String,
    pub broadcast_id: String,
    pub recipient_id: String,
    pub phone_number: String,
    pub payload: MessagePayload,
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl SendJob {
    pub fn new(
        broadcast_id: impl Into<String>,
        recipient_id: impl Into<String>,
        phone_number: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            broadcast_id: broadcast_id.into(),
            recipient_id: recipient_id.into(),
            phone_number: phone_number.into(),
            payload,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Copy of this job for the next attempt, with a fresh job id.
    pub fn next_attempt(&self) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

// ============================================================================
// Provider outcomes
// ============================================================================

/// Result of one provider send call.
///
/// Expected failures are values, not errors - the worker applies retry
/// policy uniformly off this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Provider accepted the message
    Delivered { provider_message_id: Option<String> },
    /// Transient: network error, timeout, 5xx, rate limit
    RetryableFailure { reason: String },
    /// Definitive rejection: validation error, unknown template
    PermanentFailure { reason: String },
}

impl SendOutcome {
    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self::Delivered {
            provider_message_id: Some(provider_message_id.into()),
        }
    }

    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

// ============================================================================
// Pool statistics
// ============================================================================

/// Snapshot of dispatch pool health, exposed on the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub workers_configured: u32,
    pub workers_alive: u32,
    pub jobs_in_flight: u32,
    pub worker_restarts: u32,
}
