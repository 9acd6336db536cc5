//! Observable state snapshots of a running replica.
//!
//! The replica publishes a `ReplicaMetrics` snapshot on a `watch` channel every
//! time externally observable state changes. The `Wait` helper turns that channel
//! into condition-based awaiting, which is what the integration test-suite and the
//! term provider are built on.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::core::RoleKind;
use crate::NodeId;

/// A snapshot of the externally observable state of a replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetrics {
    /// The ID of the local node.
    pub id: NodeId,
    /// The active role.
    pub role: RoleKind,
    /// The current election epoch.
    pub current_term: u64,
    /// The leader believed for the current term, if any.
    pub current_leader: Option<NodeId>,
    /// The index of the last entry in the local log.
    pub last_log_index: u64,
    /// The highest log index known committed.
    pub commit_index: u64,
    /// The highest log index applied to the state machine.
    pub last_applied: u64,
    /// The highest log index authorised for discard.
    pub recycle_index: u64,
    /// The freshest cluster configuration snapshot observed.
    pub version: u64,
    /// True until the replica has applied its first observed commit index.
    pub recovering: bool,
}

impl ReplicaMetrics {
    /// The initial metrics payload of a freshly created, still-closed replica.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            role: RoleKind::Start,
            current_term: 0,
            current_leader: None,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            recycle_index: 0,
            version: 0,
            recovering: true,
        }
    }
}

/// An error returned while waiting for a metrics condition.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("replica is shutting down")]
    ShuttingDown,
}

/// A handle for awaiting a metrics condition with a timeout.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ReplicaMetrics>,
}

impl Wait {
    /// Wait until `func` returns true for the latest metrics, or until the timeout expires.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<ReplicaMetrics, WaitError>
    where T: Fn(&ReplicaMetrics) -> bool + Send {
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                tracing::debug!(?latest, "wait condition satisfied: {}", msg.to_string());
                return Ok(latest);
            }

            let delay = tokio::time::timeout(self.timeout, rx.changed()).await;
            let changed = delay.map_err(|_| WaitError::Timeout(self.timeout, msg.to_string()))?;
            changed.map_err(|_| WaitError::ShuttingDown)?;
        }
    }

    /// Wait for `last_log_index` to reach `want_log`.
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log,
            format!("{} .last_log_index >= {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for `last_applied` to reach `want`.
    pub async fn applied(&self, want: u64, msg: impl ToString) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(|m| m.last_applied >= want, format!("{} .last_applied >= {}", msg.to_string(), want)).await
    }

    /// Wait for `commit_index` to reach `want`.
    pub async fn committed(&self, want: u64, msg: impl ToString) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(|m| m.commit_index >= want, format!("{} .commit_index >= {}", msg.to_string(), want)).await
    }

    /// Wait for the replica to assume the given role.
    pub async fn role(&self, want: RoleKind, msg: impl ToString) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(|m| m.role == want, format!("{} .role == {:?}", msg.to_string(), want)).await
    }

    /// Wait for the given node to be believed leader.
    pub async fn current_leader(&self, leader: NodeId, msg: impl ToString) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader),
            format!("{} .current_leader == {}", msg.to_string(), leader),
        )
        .await
    }

    /// Wait for the current term to reach `want`.
    pub async fn term(&self, want: u64, msg: impl ToString) -> Result<ReplicaMetrics, WaitError> {
        self.metrics(|m| m.current_term >= want, format!("{} .current_term >= {}", msg.to_string(), want)).await
    }
}
