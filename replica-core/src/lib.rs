//! The core consensus engine of a Raft-style replicated log replica.
//!
//! This crate implements the replica-side state of the Raft protocol: the
//! election epoch and leadership bookkeeping, the persistent operation log,
//! the commit frontier, and the role state machine (`Start`, `Passive`,
//! `Remote`, `Follower`, `Candidate`, `Leader`) which drives participation
//! in the cluster protocol. Storage, transport and membership are injected
//! through the [`LogStore`], [`Transport`] and [`Cluster`] traits; the
//! [`Replica`] handle is the client-facing gateway.

mod cluster;
mod config;
mod context;
mod core;
pub mod error;
mod log;
pub mod metrics;
mod network;
mod quorum;
pub mod replica;
mod replication;
pub mod storage;
pub mod term;

use serde::Deserialize;
use serde::Serialize;

pub use async_trait;

pub use crate::cluster::Cluster;
pub use crate::cluster::Member;
pub use crate::cluster::NodeKind;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::config::ConfigError;
pub use crate::context::PeerState;
pub use crate::core::RoleKind;
pub use crate::error::ReplicaError;
pub use crate::error::ReplicaResult;
pub use crate::metrics::ReplicaMetrics;
pub use crate::network::Transport;
pub use crate::replica::ReadConsistency;
pub use crate::replica::Replica;
pub use crate::storage::CommitHandler;
pub use crate::storage::LogStore;
pub use crate::term::Term;
pub use crate::term::TermProvider;

/// A Raft node's ID.
pub type NodeId = u64;

/// The identity of a log entry.
///
/// The pair is ordered lexicographically by `(term, index)`, which is exactly the
/// "at least as up-to-date" comparison used when judging a candidate's log (§5.4.1).
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[display(fmt = "{}-{}", term, index)]
pub struct LogId {
    /// The term in which the entry was created.
    pub term: u64,
    /// The position of the entry in the log. 1-based, strictly increasing, no gaps.
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// A trait for types which can produce a condensed one-line description of themselves.
///
/// Implementors are messages flowing through the replica; the summary is what lands in the
/// tracing output instead of a full debug dump of entry payloads.
pub trait MessageSummary {
    /// Return a brief summary of the message for logging purposes.
    fn summary(&self) -> String;
}

impl MessageSummary for Option<NodeId> {
    fn summary(&self) -> String {
        match self {
            Some(id) => format!("{}", id),
            None => "None".to_string(),
        }
    }
}
