//! The cluster membership collaborator.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// The participation kind of a node within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A full protocol participant: replicates the log, votes, and may lead.
    Active,
    /// A non-voting learner: replicates the log but never campaigns or votes.
    Passive,
    /// A read-only observer holding no persistent log; forwards client requests
    /// to a known leader.
    Remote,
}

impl NodeKind {
    /// Check if this kind takes part in elections.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if this kind replicates the log without voting.
    pub fn is_passive(&self) -> bool {
        matches!(self, Self::Passive)
    }

    /// Check if this kind is a log-less observer.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote)
    }
}

/// A single member of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub kind: NodeKind,
}

/// The cluster membership view injected into the replica.
///
/// The engine treats this collaborator as read-only: membership discovery and any
/// change of the configuration happen outside the engine and are reflected here.
/// `version()` is an opaque monotone counter identifying the freshest configuration
/// snapshot; the replica folds it into its context whenever it takes a membership
/// snapshot (on candidacy and on assuming leadership).
pub trait Cluster: Send + Sync + 'static {
    /// The ID of the local node.
    fn local_id(&self) -> NodeId;

    /// The participation kind of the local node.
    fn local_kind(&self) -> NodeKind;

    /// The IDs of all voting members, in stable ascending order.
    fn members(&self) -> BTreeSet<NodeId>;

    /// The IDs of all non-voting learners replicated to but excluded from elections.
    fn learners(&self) -> BTreeSet<NodeId> {
        BTreeSet::new()
    }

    /// Look up a member by ID.
    fn member(&self, id: NodeId) -> Option<Member>;

    /// A monotone counter tracking the freshest configuration snapshot observed.
    fn version(&self) -> u64 {
        0
    }
}
