//! Persistent store for broadcasts and recipients (SQLite via sqlx).
//!
//! The queue holds ephemeral work; these rows are the system of record for
//! delivery state.

pub mod entity;
pub mod error;
pub mod repository;

pub use entity::{Broadcast, Recipient};
pub use error::StoreError;
pub use repository::{BroadcastRepository, RecipientRepository};

pub type Result<T> = std::result::Result<T, StoreError>;
