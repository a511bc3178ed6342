//! Message provider clients.
//!
//! A provider takes one destination + payload and reports the outcome as a
//! value: delivered, retryable failure, or permanent failure. Workers apply
//! retry policy off the outcome, so expected failures never surface as
//! errors here.

use async_trait::async_trait;
use bc_common::{MessagePayload, SendOutcome};

pub mod whatsapp;

pub use whatsapp::{WhatsAppClient, WhatsAppClientConfig};

/// Outbound send seam. One network call per invocation, bounded by the
/// configured request timeout so a hung call cannot starve a worker.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn send(&self, destination: &str, payload: &MessagePayload) -> SendOutcome;
}
