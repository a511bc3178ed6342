//! WhatsApp Cloud API client.
//!
//! POSTs to `{base}/{sender_phone_id}/messages` with bearer auth and
//! classifies responses: 2xx delivered, 408/429/5xx and transport errors
//! retryable, remaining 4xx permanent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use bc_common::{MessageBody, MessagePayload, SendOutcome};

use crate::ProviderClient;

#[derive(Debug, Clone)]
pub struct WhatsAppClientConfig {
    /// Graph API base, without trailing slash
    pub api_base_url: String,
    pub access_token: String,
    /// Per-request timeout
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for WhatsAppClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://graph.facebook.com/v22.0".to_string(),
            access_token: String::new(),
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct WhatsAppClient {
    client: Client,
    config: WhatsAppClientConfig,
}

/// Successful send response: `{"messages": [{"id": "wamid..."}]}`
#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

/// Graph API error envelope: `{"error": {"message": ..., "code": ...}}`
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize, Serialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

impl WhatsAppClient {
    pub fn new(config: WhatsAppClientConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        info!(
            base_url = %config.api_base_url,
            timeout_secs = config.timeout.as_secs(),
            "WhatsApp client initialized"
        );

        Self { client, config }
    }

    fn request_body(destination: &str, body: &MessageBody) -> serde_json::Value {
        match body {
            MessageBody::Template {
                name,
                language_code,
            } => json!({
                "messaging_product": "whatsapp",
                "to": destination,
                "type": "template",
                "template": {
                    "name": name,
                    "language": { "code": language_code }
                }
            }),
            MessageBody::Text { body } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": destination,
                "type": "text",
                "text": { "body": body }
            }),
        }
    }

    /// Pull the provider's error message out of a failure body, falling back
    /// to the raw text.
    fn error_reason(status: u16, body: &str) -> String {
        match serde_json::from_str::<ErrorResponse>(body) {
            Ok(parsed) => format!(
                "HTTP {}: {} (code {})",
                status, parsed.error.message, parsed.error.code
            ),
            Err(_) => format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>()),
        }
    }
}

#[async_trait]
impl ProviderClient for WhatsAppClient {
    async fn send(&self, destination: &str, payload: &MessagePayload) -> SendOutcome {
        let url = format!(
            "{}/{}/messages",
            self.config.api_base_url, payload.sender_id
        );
        let body = Self::request_body(destination, &payload.body);

        debug!(destination = %destination, url = %url, "Sending message");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                let kind = if e.is_timeout() {
                    "Request timeout"
                } else if e.is_connect() {
                    "Connection error"
                } else {
                    "Request failed"
                };
                warn!(destination = %destination, error = %e, "{kind}");
                return SendOutcome::retryable(format!("{kind}: {e}"));
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            let provider_message_id = response
                .json::<SendResponse>()
                .await
                .ok()
                .and_then(|r| r.messages.into_iter().next())
                .map(|m| m.id);

            debug!(
                destination = %destination,
                provider_message_id = ?provider_message_id,
                "Message accepted by provider"
            );
            return SendOutcome::Delivered {
                provider_message_id,
            };
        }

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body_text = response.text().await.unwrap_or_default();
        let reason = Self::error_reason(status_code, &body_text);

        // 408/429/5xx are transient; the remaining 4xx are definitive
        // rejections (bad destination, unknown template, auth problems)
        if status_code == 408 || status_code == 429 || status.is_server_error() {
            let reason = match retry_after {
                Some(after) => format!("{reason} (Retry-After: {after}s)"),
                None => reason,
            };
            warn!(
                destination = %destination,
                status_code = status_code,
                "Transient provider failure - will retry"
            );
            SendOutcome::retryable(reason)
        } else {
            warn!(
                destination = %destination,
                status_code = status_code,
                reason = %reason,
                "Provider rejected message"
            );
            SendOutcome::permanent(reason)
        }
    }
}
