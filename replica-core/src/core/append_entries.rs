use crate::cluster::Cluster;
use crate::core::ReplicaCore;
use crate::core::RoleKind;
use crate::error::ReplicaResult;
use crate::network::Transport;
use crate::replica::AppendEntriesRequest;
use crate::replica::AppendEntriesResponse;
use crate::replica::ConflictOpt;
use crate::replica::Entry;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;

impl<C: Cluster, N: Transport, S: LogStore> ReplicaCore<C, N, S> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest,
    ) -> ReplicaResult<AppendEntriesResponse> {
        // If the message's term is less than the most recent term, we do not honor the request.
        if msg.term < self.ctx.term() {
            tracing::debug!({current_term=self.ctx.term(), rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse {
                term: self.ctx.term(),
                success: false,
                conflict_opt: None,
            });
        }

        // A valid append from the leader of the current (or a newer) term resets the
        // election timer.
        self.update_next_election_timeout(true);
        let mut report_metrics = false;

        // Acknowledge the epoch and its leader.
        if self.ctx.set_term(msg.term) {
            self.save_hard_state().await?;
            report_metrics = true;
        }
        if self.ctx.leader() != Some(msg.leader_id) {
            self.ctx.set_leader(Some(msg.leader_id));
            report_metrics = true;
        }

        // A candidate (or a deposed leader) observing an active leader at its own
        // term or newer falls back to follower.
        if self.target_role.is_candidate() || self.target_role.is_leader() {
            self.set_target_role(RoleKind::Follower);
        }

        // Log consistency check (§5.3): the entry preceding the payload must match.
        if msg.prev_log_id.index > 0 {
            let local_term =
                self.log.term_at(msg.prev_log_id.index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            if local_term != msg.prev_log_id.term {
                let conflict_opt = Some(self.find_conflict_hint(&msg.prev_log_id, local_term).await?);
                if report_metrics {
                    self.report_metrics();
                }
                return Ok(AppendEntriesResponse {
                    term: self.ctx.term(),
                    success: false,
                    conflict_opt,
                });
            }
        }

        if !msg.entries.is_empty() {
            self.append_log_entries(&msg.entries).await?;
            report_metrics = true;
        }

        // The commit frontier follows the leader, clamped to the portion of the
        // local log this exchange has verified: anything past the leader's previous
        // entry that it did not send may still diverge.
        let last_verified = msg.prev_log_id.index + msg.entries.len() as u64;
        let new_commit = std::cmp::min(msg.leader_commit, last_verified);
        if new_commit > self.ctx.commit_index() {
            self.ctx.set_commit_index(new_commit)?;
            report_metrics = true;
        }
        self.apply_up_to(self.ctx.commit_index()).await?;

        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.ctx.term(),
            success: true,
            conflict_opt: None,
        })
    }

    /// AppendEntries as seen by a remote observer.
    ///
    /// A remote node holds no log, so the payload itself is discarded; the RPC still
    /// carries the epoch and leadership information the observer exists to track.
    /// Remotes are never replication targets, so the ack carries no match weight.
    #[tracing::instrument(level="trace", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_observed(
        &mut self,
        msg: AppendEntriesRequest,
    ) -> ReplicaResult<AppendEntriesResponse> {
        if msg.term < self.ctx.term() {
            return Ok(AppendEntriesResponse {
                term: self.ctx.term(),
                success: false,
                conflict_opt: None,
            });
        }

        let mut report_metrics = false;
        if self.ctx.set_term(msg.term) {
            report_metrics = true;
        }
        if self.ctx.leader() != Some(msg.leader_id) {
            self.ctx.set_leader(Some(msg.leader_id));
            report_metrics = true;
        }
        if report_metrics {
            self.report_metrics();
        }
        Ok(AppendEntriesResponse {
            term: self.ctx.term(),
            success: true,
            conflict_opt: None,
        })
    }

    /// Build the conflict hint for a failed consistency check.
    ///
    /// The hint names our most recent entry which does not conflict with the
    /// leader's `prev_log_id`, letting the leader walk past a whole conflicting
    /// term in one round instead of probing an index at a time (§5.3).
    async fn find_conflict_hint(&mut self, prev_log_id: &LogId, local_term: u64) -> ReplicaResult<ConflictOpt> {
        // Our log ends before the leader's previous entry: everything we have is a
        // plausible match point.
        if self.last_log_id.index < prev_log_id.index || local_term == 0 {
            return Ok(ConflictOpt {
                log_id: self.last_log_id,
            });
        }

        // We hold a conflicting entry. Walk to the first index of its term, bounded
        // to a small window; everything before that run is non-conflicting.
        let first = self.log.first_index().await.map_err(|err| self.map_fatal_storage_error(err))?.max(1);
        let window_start = std::cmp::max(prev_log_id.index.saturating_sub(50), first);
        let entries = self
            .log
            .entries(window_start, prev_log_id.index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        let mut first_of_term = prev_log_id.index;
        for entry in entries.iter().rev() {
            if entry.log_id.term != local_term {
                break;
            }
            first_of_term = entry.log_id.index;
        }

        if first_of_term <= 1 {
            return Ok(ConflictOpt {
                log_id: LogId::new(0, 0),
            });
        }
        let hint_index = first_of_term - 1;
        let hint_term = self.log.term_at(hint_index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(ConflictOpt {
            log_id: LogId::new(hint_term, hint_index),
        })
    }

    /// Append the given entries to the log.
    ///
    /// Entries already present with a matching term are left untouched; at the
    /// first divergence the local suffix is truncated and the leader's entries take
    /// its place (§5.3). Appends which only re-deliver known entries are no-ops, so
    /// the handler is safe under RPC retries.
    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append_log_entries(&mut self, entries: &[Entry]) -> ReplicaResult<()> {
        let mut append_from = entries.len();
        for (offset, entry) in entries.iter().enumerate() {
            let index = entry.log_id.index;
            let local_term = self.log.term_at(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            if local_term == 0 {
                // Absent: everything from here on is new.
                append_from = offset;
                break;
            }
            if local_term != entry.log_id.term {
                // Divergence: drop our suffix from this point.
                tracing::debug!(index, local_term, leader_term = entry.log_id.term, "truncating conflicting suffix");
                self.log.truncate_suffix(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
                let prev_term = self.log.term_at(index - 1).await.map_err(|err| self.map_fatal_storage_error(err))?;
                self.last_log_id = LogId::new(prev_term, index - 1);
                append_from = offset;
                break;
            }
        }

        let new_entries = &entries[append_from..];
        if new_entries.is_empty() {
            return Ok(());
        }
        let entry_refs: Vec<_> = new_entries.iter().collect();
        self.log.append_all(&entry_refs).await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(entry) = new_entries.last() {
            self.last_log_id = entry.log_id;
        }
        Ok(())
    }
}
