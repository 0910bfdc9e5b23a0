//! Error types for the id allocation service.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable error case of the allocator. All variants are
//! `Clone` so a single failure can be handed to every caller waiting on the
//! same in-flight allocation.
//!
//! ## Error Cases
//! - `PoolExhausted`: nothing left in the pool hierarchy after a full
//!   replenishment attempt.
//! - `IdKeyNotFound`: release called for a key with no committed mapping.
//! - `LockAcquisitionFailure`: the distributed lock could not be taken in time.
//! - `PoolNotFound`: the pool has no persisted record.
//! - `InvalidRequest`: the caller supplied malformed names, keys or ranges.
//! - `Store` / `Codec`: a collaborator or (de)serialization failure.
//! - `RequestCancelled`: the allocation this caller was waiting on vanished.
//! - `ServiceShutdown`: work arrived while the coordinator was shutting down.

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for the id allocation service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// No ids left in the pool, its quarantine, or any idle sibling.
    #[error("Pool {pool} exhausted")]
    PoolExhausted { pool: String },

    /// Release was called for a key that holds no ids.
    #[error("No ids committed for key {key} in pool {pool}")]
    IdKeyNotFound { pool: String, key: String },

    /// The named distributed lock could not be acquired before the timeout.
    #[error("Failed to acquire lock {name}")]
    LockAcquisitionFailure { name: String },

    /// The pool has no persisted record.
    #[error("Pool {pool} not found")]
    PoolNotFound { pool: String },

    /// The request was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The backing store failed.
    #[error("Store error: {context}")]
    Store { context: String },

    /// A persisted record could not be encoded or decoded.
    #[error("Codec error: {context}")]
    Codec { context: String },

    /// Internal channel send/receive failure.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The in-flight allocation being awaited was dropped before completing.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The coordinator is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn store(context: impl Into<String>) -> Self {
        Self::Store {
            context: context.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec {
            context: err.to_string(),
        }
    }
}
