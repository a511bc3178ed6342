use thiserror::Error;

use bc_queue::QueueError;
use bc_store::StoreError;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Caller error - rejected synchronously, no side effects performed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Broadcast not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Persistence(#[from] StoreError),
}
