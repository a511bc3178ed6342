use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Storage/connection failure - the queue cannot accept or hand out work
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue is stopped")]
    Stopped,
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}
