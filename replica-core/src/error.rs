//! Error types exposed by the replica engine.

use thiserror::Error;

/// A result type where the error variant is always a `ReplicaError`.
pub type ReplicaResult<T> = std::result::Result<T, ReplicaError>;

/// Errors surfaced by the replica to its callers.
///
/// Transient transport failures are absorbed by the replication loop, which simply
/// re-attempts on the next heartbeat; they only appear here when a client-facing
/// operation cannot complete. `IllegalState` is different: it indicates an invariant
/// violation inside the engine, is never recovered internally, and is logged as fatal.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The operation was submitted before `open()` or after `close()`.
    #[error("replica is not open")]
    NotOpen,
    /// A client request arrived at a node with no known leader and no forwarding target.
    #[error("cluster has no known leader")]
    NoLeader,
    /// An attempted mutation would have violated a replica invariant.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// An RPC did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,
    /// The underlying network failed while carrying a request.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
    /// The log store reported an I/O failure. Fatal to the current role: the replica
    /// falls back to the `Start` role with `open=false` and a supervisor may re-open it.
    #[error("storage fault: {0}")]
    Storage(anyhow::Error),
    /// The request was superseded by a step-down or a close.
    #[error("request aborted")]
    Aborted,
}

impl ReplicaError {
    /// Shorthand for building an `IllegalState` error from a formatted message.
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }
}
