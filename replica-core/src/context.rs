//! The authoritative mutable state of a replica.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ReplicaError;
use crate::error::ReplicaResult;
use crate::NodeId;

/// Per-peer replication bookkeeping maintained while leading.
#[derive(Clone, Debug)]
pub struct PeerState {
    /// The index of the next entry to send to this peer.
    pub next_index: u64,
    /// The highest index known to be replicated on this peer.
    pub match_index: u64,
    /// The term of the entry at `match_index`.
    pub matched_term: u64,
    /// The last time this peer acknowledged a payload.
    pub last_contact: Option<Instant>,
    /// Whether a replication stream is currently running for this peer.
    pub in_flight: bool,
    /// Consecutive failed deliveries since the last acknowledgement.
    pub failures: u64,
}

impl PeerState {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            matched_term: 0,
            last_contact: None,
            in_flight: false,
            failures: 0,
        }
    }
}

pub(crate) type OpenWaiter = oneshot::Sender<ReplicaResult<()>>;

/// The process-wide state of one replica.
///
/// Exclusively owned by the replica's core task, which is the engine's single
/// execution context: every read and write of these fields happens through `&mut`
/// access on that task, so the single-writer discipline is enforced by ownership
/// rather than a runtime thread check. The setters guard the monotonicity and
/// exclusivity invariants and fail with `IllegalState` on a violating transition.
pub(crate) struct ReplicaContext {
    /// The current election epoch. Never decreases.
    term: u64,
    /// The leader believed for the current term, if any.
    leader: Option<NodeId>,
    /// The candidate granted this replica's vote in the current term, if any.
    voted_for: Option<NodeId>,
    /// The freshest cluster configuration snapshot observed. Never decreases.
    version: u64,
    /// The highest log index known committed. Never decreases.
    commit_index: u64,
    /// The first commit index observed after startup; set once, then immutable.
    first_commit_index: Option<u64>,
    /// The highest log index applied to the state machine. Never decreases.
    last_applied: u64,
    /// The highest log index authorised for discard. Never decreases.
    recycle_index: u64,
    /// True until `last_applied` first reaches `first_commit_index`.
    recovering: bool,
    /// Lifecycle flag.
    open: bool,
    /// Per-peer replication bookkeeping.
    peers: BTreeMap<NodeId, PeerState>,
    /// Futures completed when a leader first becomes known.
    open_waiters: Vec<OpenWaiter>,
}

impl ReplicaContext {
    pub(crate) fn new() -> Self {
        Self {
            term: 0,
            leader: None,
            voted_for: None,
            version: 0,
            commit_index: 0,
            first_commit_index: None,
            last_applied: 0,
            recycle_index: 0,
            recovering: true,
            open: false,
            peers: BTreeMap::new(),
            open_waiters: Vec::new(),
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Accessors /////////////////////////////////////////////////////////////

    pub(crate) fn term(&self) -> u64 {
        self.term
    }

    pub(crate) fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    pub(crate) fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn commit_index(&self) -> u64 {
        self.commit_index
    }

    pub(crate) fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub(crate) fn recycle_index(&self) -> u64 {
        self.recycle_index
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn peers(&self) -> &BTreeMap<NodeId, PeerState> {
        &self.peers
    }

    pub(crate) fn peers_mut(&mut self) -> &mut BTreeMap<NodeId, PeerState> {
        &mut self.peers
    }

    //////////////////////////////////////////////////////////////////////////
    // Mutations /////////////////////////////////////////////////////////////

    /// Restore the epoch state recorded by a previous run. Only valid while closed.
    pub(crate) fn restore(&mut self, term: u64, voted_for: Option<NodeId>) {
        self.term = term;
        self.voted_for = voted_for;
        self.leader = None;
    }

    /// Advance to the given term, returning `true` if the term changed.
    ///
    /// Entering a new epoch invalidates the leader and the vote of the old one.
    /// Calling with the current or an older term is a no-op.
    pub(crate) fn set_term(&mut self, term: u64) -> bool {
        if term <= self.term {
            return false;
        }
        tracing::debug!(old = self.term, new = term, "epoch change");
        self.term = term;
        self.leader = None;
        self.voted_for = None;
        true
    }

    /// Update the leader believed for the current term.
    ///
    /// Once a leader is known the election it may have been voted into is settled,
    /// so the vote record for the term is cleared. The first transition from no
    /// leader to a known leader completes all pending open futures.
    pub(crate) fn set_leader(&mut self, leader: Option<NodeId>) {
        if self.leader == leader {
            return;
        }
        tracing::debug!(old = ?self.leader, new = ?leader, "leader change");
        let had_none = self.leader.is_none();
        self.leader = leader;
        if self.leader.is_some() {
            self.voted_for = None;
        }
        if had_none && self.leader.is_some() {
            for tx in self.open_waiters.drain(..) {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Record a vote for the current term.
    ///
    /// A vote is granted at most once per term: re-assigning a non-`None` vote, or
    /// voting while a leader is already known for the term, is an invariant violation.
    pub(crate) fn set_voted_for(&mut self, candidate: Option<NodeId>) -> ReplicaResult<()> {
        if candidate.is_some() {
            if self.voted_for.is_some() {
                return Err(ReplicaError::illegal_state(format!(
                    "vote already granted to {:?} in term {}",
                    self.voted_for, self.term
                )));
            }
            if self.leader.is_some() {
                return Err(ReplicaError::illegal_state(format!(
                    "cannot vote while leader {:?} is known in term {}",
                    self.leader, self.term
                )));
            }
        }
        self.voted_for = candidate;
        Ok(())
    }

    /// Advance the commit frontier. The first call also records `first_commit_index`,
    /// which marks the end of recovery once applied.
    pub(crate) fn set_commit_index(&mut self, index: u64) -> ReplicaResult<()> {
        if index < self.commit_index {
            return Err(ReplicaError::illegal_state(format!(
                "commit index regression: {} < {}",
                index, self.commit_index
            )));
        }
        self.commit_index = index;
        if self.first_commit_index.is_none() {
            self.first_commit_index = Some(index);
        }
        Ok(())
    }

    /// Advance the applied frontier. Clears `recovering` once the first observed
    /// commit index has been applied.
    pub(crate) fn set_last_applied(&mut self, index: u64) -> ReplicaResult<()> {
        if index < self.last_applied {
            return Err(ReplicaError::illegal_state(format!(
                "last applied regression: {} < {}",
                index, self.last_applied
            )));
        }
        if index > self.commit_index {
            return Err(ReplicaError::illegal_state(format!(
                "cannot apply {} beyond commit index {}",
                index, self.commit_index
            )));
        }
        self.last_applied = index;
        if let Some(first_commit) = self.first_commit_index {
            if self.recovering && index >= first_commit {
                tracing::info!(index, first_commit, "recovery complete");
                self.recovering = false;
            }
        }
        Ok(())
    }

    /// Advance the recycle frontier. Only applied entries may be recycled.
    pub(crate) fn set_recycle_index(&mut self, index: u64) -> ReplicaResult<()> {
        if index < self.recycle_index {
            return Err(ReplicaError::illegal_state(format!(
                "recycle index regression: {} < {}",
                index, self.recycle_index
            )));
        }
        if index > self.last_applied {
            return Err(ReplicaError::illegal_state(format!(
                "cannot recycle {} beyond last applied {}",
                index, self.last_applied
            )));
        }
        self.recycle_index = index;
        Ok(())
    }

    /// Fold in a configuration version observation.
    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = std::cmp::max(self.version, version);
    }

    pub(crate) fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// Register a waiter completed when a leader first becomes known.
    ///
    /// If a leader is already known the waiter completes immediately.
    pub(crate) fn add_open_waiter(&mut self, tx: OpenWaiter) {
        if self.leader.is_some() {
            let _ = tx.send(Ok(()));
        } else {
            self.open_waiters.push(tx);
        }
    }

    /// Fail all pending open futures; used when a close or fault unwinds an opening.
    pub(crate) fn abort_open_waiters(&mut self) {
        for tx in self.open_waiters.drain(..) {
            let _ = tx.send(Err(ReplicaError::Aborted));
        }
    }

    /// Rebuild the peer table for a fresh leadership term.
    pub(crate) fn reset_peers(&mut self, targets: impl IntoIterator<Item = NodeId>, next_index: u64) {
        self.peers.clear();
        for target in targets {
            self.peers.insert(target, PeerState::new(next_index));
        }
    }
}
