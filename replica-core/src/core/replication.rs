use tokio::time::Instant;

use crate::cluster::Cluster;
use crate::core::LeaderRole;
use crate::core::RoleKind;
use crate::error::ReplicaResult;
use crate::network::Transport;
use crate::quorum;
use crate::replication::PeerEvent;
use crate::replication::ReplicationEvent;
use crate::replication::ReplicationStream;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

impl<'a, C: Cluster, N: Transport, S: LogStore> LeaderRole<'a, C, N, S> {
    /// Spawn a new replication stream for the target peer.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_replication_stream(&mut self, target: NodeId) -> ReplicationStream {
        if let Some(peer) = self.core.ctx.peers_mut().get_mut(&target) {
            peer.in_flight = true;
        }
        ReplicationStream::new(
            self.core.id,
            target,
            self.core.ctx.term(),
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.ctx.commit_index(),
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        )
    }

    /// Handle an event coming from one of the replication streams.
    #[tracing::instrument(level="trace", skip(self, event), fields(event=%event.summary()))]
    pub(super) async fn handle_peer_event(&mut self, event: PeerEvent) -> ReplicaResult<()> {
        match event {
            PeerEvent::UpdateMatched { target, matched } => self.handle_update_matched(target, matched).await,
            PeerEvent::Unreachable { target } => {
                self.handle_unreachable(target);
                Ok(())
            }
            PeerEvent::HigherTerm { target, term } => self.handle_higher_term(target, term).await,
        }
    }

    /// Handle an updated match index for the target peer, advancing the commit
    /// frontier when a majority has the next entry of this term (§5.3, §5.4.2).
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_update_matched(&mut self, target: NodeId, matched: LogId) -> ReplicaResult<()> {
        match self.core.ctx.peers_mut().get_mut(&target) {
            Some(peer) => {
                peer.match_index = matched.index;
                peer.matched_term = matched.term;
                peer.next_index = matched.index + 1;
                peer.last_contact = Some(Instant::now());
                peer.failures = 0;
            }
            // A stale event from a stream of a previous term.
            None => return Ok(()),
        }

        let new_commit = self.calc_commit_index();
        if new_commit <= self.core.ctx.commit_index() {
            return Ok(());
        }
        self.core.ctx.set_commit_index(new_commit)?;

        // Fan the new frontier out to all replication streams.
        for stream in self.nodes.values().chain(self.learners.values()) {
            let _ = stream.repl_tx.send((
                ReplicationEvent::UpdateCommitIndex { commit_index: new_commit },
                tracing::debug_span!("CH"),
            ));
        }

        // Resolve any client requests whose entries are now committed.
        let committed_up_to = self
            .awaiting_committed
            .iter()
            .enumerate()
            .take_while(|(_idx, elem)| elem.entry.log_id.index <= new_commit)
            .last()
            .map(|(idx, _)| idx);
        if let Some(offset) = committed_up_to {
            for request in self.awaiting_committed.drain(..=offset).collect::<Vec<_>>() {
                self.client_request_post_commit(request).await?;
            }
        }

        self.core.report_metrics();
        Ok(())
    }

    /// Record a failed delivery to the target peer.
    ///
    /// Unreachable peers do not force a step-down; only responses carrying a higher
    /// term do. The stream re-attempts on its next heartbeat.
    #[tracing::instrument(level = "trace", skip(self))]
    fn handle_unreachable(&mut self, target: NodeId) {
        if let Some(peer) = self.core.ctx.peers_mut().get_mut(&target) {
            peer.failures += 1;
            peer.in_flight = false;
        }
    }

    /// A replication stream observed a higher term: step down immediately.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_higher_term(&mut self, target: NodeId, term: u64) -> ReplicaResult<()> {
        if term > self.core.ctx.term() {
            tracing::info!(target, term, "replication stream observed a higher term, stepping down");
            self.core.ctx.set_term(term);
            self.core.save_hard_state().await?;
            self.core.set_target_role(RoleKind::Follower);
            self.core.report_metrics();
        }
        Ok(())
    }

    /// Compute the highest committable index from the cluster's match state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn calc_commit_index(&self) -> u64 {
        let members = self.core.cluster.members();
        let mut indices = Vec::with_capacity(members.len());
        for id in members.iter() {
            if *id == self.core.id {
                indices.push((self.core.last_log_id.index, self.core.last_log_id.term));
                continue;
            }
            match self.core.ctx.peers().get(id) {
                Some(peer) => indices.push((peer.match_index, peer.matched_term)),
                // A member without a peer record has replicated nothing this term.
                None => indices.push((0, 0)),
            }
        }
        calculate_new_commit_index(indices, self.core.ctx.commit_index(), self.core.ctx.term())
    }
}

/// Determine the value for `commit_index` based on the known match state of the
/// cluster members.
///
/// - `entries`: the highest known `(index, term)` replicated on each voting member,
///   including the leader itself.
/// - `current_commit`: the current commit index. The output of this function will
///   never be less than this value.
/// - `leader_term`: the current leader term; only entries of the leader's own term
///   are committed by counting replicas (§5.4.2).
fn calculate_new_commit_index(mut entries: Vec<(u64, u64)>, current_commit: u64, leader_term: u64) -> u64 {
    if entries.is_empty() {
        return current_commit;
    }

    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let majority = quorum::majority_of(entries.len());
    let offset = entries.len() - majority;
    let new_val = entries[offset];

    if new_val.0 > current_commit && new_val.1 == leader_term {
        new_val.0
    } else {
        current_commit
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
