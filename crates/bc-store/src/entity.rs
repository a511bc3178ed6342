//! Broadcast and Recipient entities.

use bc_common::{DeliveryStatus, MessageBody, MessagePayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bulk-send operation. Immutable after creation except the derived
/// `completed` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Broadcast {
    pub id: String,
    pub user_id: String,
    /// Text body; used when no template is named
    pub message_content: Option<String>,
    pub template_name: Option<String>,
    pub language_code: String,
    pub business_account_id: String,
    /// Provider-side sender channel (phone number id)
    pub sender_phone_id: String,
    /// Set once every recipient has reached a terminal status
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    pub fn new(
        user_id: impl Into<String>,
        message_content: Option<String>,
        template_name: Option<String>,
        language_code: impl Into<String>,
        business_account_id: impl Into<String>,
        sender_phone_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            message_content,
            template_name,
            language_code: language_code.into(),
            business_account_id: business_account_id.into(),
            sender_phone_id: sender_phone_id.into(),
            completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The payload every recipient of this broadcast receives. A named
    /// template wins over a plain text body.
    pub fn payload(&self) -> MessagePayload {
        let body = match &self.template_name {
            Some(name) => MessageBody::Template {
                name: name.clone(),
                language_code: self.language_code.clone(),
            },
            None => MessageBody::Text {
                body: self.message_content.clone().unwrap_or_default(),
            },
        };
        MessagePayload {
            sender_id: self.sender_phone_id.clone(),
            body,
        }
    }
}

/// One destination within a broadcast, tracked independently through send
/// attempts. `attempt_count` only ever grows; once it reaches the configured
/// maximum the recipient is never retried again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: String,
    pub broadcast_id: String,
    pub phone_number: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    pub fn new(broadcast_id: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            broadcast_id: broadcast_id.into(),
            phone_number: phone_number.into(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_error: None,
            provider_message_id: None,
            updated_at: Utc::now(),
        }
    }
}
