//! The broadcast dispatch engine.
//!
//! [`BroadcastOrchestrator`] accepts a broadcast, fans it out into one send
//! job per recipient on the [`bc_queue::JobQueue`], and returns immediately.
//! The [`DispatchPool`] runs a fixed set of workers that claim jobs, call the
//! provider, and report every attempt to the [`StatusTracker`], retrying
//! transient failures up to a bounded attempt count.

pub mod error;
pub mod orchestrator;
pub mod pool;
pub mod tracker;

pub use error::DispatchError;
pub use orchestrator::{BroadcastHandle, BroadcastOrchestrator, BroadcastRequest};
pub use pool::{DispatchPool, DispatchPoolConfig, StalledJob};
pub use tracker::StatusTracker;

pub type Result<T> = std::result::Result<T, DispatchError>;
