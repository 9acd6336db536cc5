use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::cluster::Cluster;
use crate::core::CandidateRole;
use crate::core::ReplicaCore;
use crate::core::RoleKind;
use crate::error::ReplicaResult;
use crate::network::Transport;
use crate::replica::VoteRequest;
use crate::replica::VoteResponse;
use crate::storage::LogStore;
use crate::MessageSummary;
use crate::NodeId;

impl<C: Cluster, N: Transport, S: LogStore> ReplicaCore<C, N, S> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> ReplicaResult<VoteResponse> {
        // Don't respond to lesser terms.
        if msg.term < self.ctx.term() {
            tracing::debug!({current_term=self.ctx.term(), rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.ctx.term(),
                vote_granted: false,
            });
        }

        // Acknowledge a newer term; a leader or candidate observing one steps down.
        if self.ctx.set_term(msg.term) {
            self.save_hard_state().await?;
            if self.target_role.is_leader() || self.target_role.is_candidate() {
                self.set_target_role(RoleKind::Follower);
            }
            self.report_metrics();
        }

        // Passive and remote nodes never grant votes.
        if !self.cluster.local_kind().is_active() {
            return Ok(VoteResponse {
                term: self.ctx.term(),
                vote_granted: false,
            });
        }

        // While a leader is known for this term there is nothing to elect: stick
        // with it and let the candidate discover the leader through its heartbeats.
        if self.ctx.leader().is_some() {
            return Ok(VoteResponse {
                term: self.ctx.term(),
                vote_granted: false,
            });
        }

        // The candidate's log must be at least as up-to-date as ours (§5.4.1).
        let candidate_log_id = crate::LogId::new(msg.last_log_term, msg.last_log_index);
        let local_log_id = self.last_log_id;
        if candidate_log_id < local_log_id {
            tracing::debug!(
                candidate = msg.candidate_id,
                %candidate_log_id, %local_log_id,
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.ctx.term(),
                vote_granted: false,
            });
        }

        // A vote is granted at most once per term, first-come-first-served; a
        // repeated request from the candidate we voted for is re-acknowledged.
        match self.ctx.voted_for() {
            Some(candidate) if candidate == msg.candidate_id => {
                self.update_next_election_timeout(false);
                Ok(VoteResponse {
                    term: self.ctx.term(),
                    vote_granted: true,
                })
            }
            Some(_) => Ok(VoteResponse {
                term: self.ctx.term(),
                vote_granted: false,
            }),
            None => {
                self.ctx.set_voted_for(Some(msg.candidate_id))?;
                self.save_hard_state().await?;
                self.update_next_election_timeout(false);
                tracing::debug!(candidate = msg.candidate_id, term = self.ctx.term(), "vote granted");
                Ok(VoteResponse {
                    term: self.ctx.term(),
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, C: Cluster, N: Transport, S: LogStore> CandidateRole<'a, C, N, S> {
    /// Spawn a parallel vote request to each cluster member.
    ///
    /// Each request carries a deadline of half the base election timeout, so a slow
    /// peer cannot make a round outlive the election it belongs to.
    #[tracing::instrument(level = "trace", skip(self, members))]
    pub(super) fn spawn_parallel_vote_requests(
        &self,
        members: &BTreeSet<NodeId>,
    ) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members: Vec<_> = members.iter().copied().filter(|member| *member != self.core.id).collect();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));

        let rpc = VoteRequest::new(
            self.core.ctx.term(),
            self.core.id,
            self.core.last_log_id.index,
            self.core.last_log_id.term,
        );
        let vote_timeout = Duration::from_millis(self.core.config.election_timeout / 2);

        for member in all_members {
            let rpc = rpc.clone();
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            tokio::spawn(
                async move {
                    let res = timeout(vote_timeout, network.send_vote(member, rpc)).await;
                    match res {
                        Ok(Ok(res)) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!({error=%err, target=member}, "error while requesting vote from peer")
                        }
                        Err(_) => {
                            tracing::warn!({target=member}, "timeout while requesting vote from peer")
                        }
                    }
                }
                .instrument(tracing::debug_span!("vote_request", target = member)),
            );
        }
        rx
    }

    /// Handle a vote response from a peer.
    #[tracing::instrument(level = "trace", skip(self, res, target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> ReplicaResult<()> {
        // A newer term ends this candidacy on the spot.
        if res.term > self.core.ctx.term() {
            tracing::debug!({target, term=res.term}, "observed greater term in vote response, reverting to follower");
            self.core.ctx.set_term(res.term);
            self.core.save_hard_state().await?;
            self.core.set_target_role(RoleKind::Follower);
            self.core.report_metrics();
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                tracing::info!(id = self.core.id, term = self.core.ctx.term(), "transitioning to leader");
                self.core.set_target_role(RoleKind::Leader);
            }
        }
        Ok(())
    }
}
