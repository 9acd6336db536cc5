use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::stream::StreamExt;
use tokio::time::timeout;
use tokio::time::Duration;
use tracing_futures::Instrument;

use crate::cluster::Cluster;
use crate::core::LeaderRole;
use crate::core::RoleKind;
use crate::error::ReplicaError;
use crate::error::ReplicaResult;
use crate::network::Transport;
use crate::quorum;
use crate::replica::AppendEntriesRequest;
use crate::replica::ClientTx;
use crate::replica::DeleteRequest;
use crate::replica::Entry;
use crate::replica::EntryNormal;
use crate::replica::EntryPayload;
use crate::replica::ReadConsistency;
use crate::replica::ReadRequest;
use crate::replica::WriteRequest;
use crate::replication::ReplicationEvent;
use crate::storage::LogStore;
use crate::LogId;

/// A client request which has been appended to the log, along with its response channel.
pub(super) struct ClientRequestEntry {
    /// The Arc'd entry of the client request.
    ///
    /// This value is Arc'd so that it may be sent across task boundaries for
    /// replication without having to clone the data payload itself.
    pub entry: Arc<Entry>,
    /// The response channel for the request. `None` for entries the leader creates
    /// on its own behalf, such as the initial blank entry of a new term.
    pub tx: Option<ClientTx>,
}

impl ClientRequestEntry {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry(entry: Entry, tx: Option<ClientTx>) -> Self {
        Self {
            entry: Arc::new(entry),
            tx,
        }
    }
}

impl<'a, C: Cluster, N: Transport, S: LogStore> LeaderRole<'a, C, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when
    /// first coming to power, per §8.
    ///
    /// Entries from previous terms can never be counted toward the commit frontier
    /// directly; committing a blank entry of the new term drags everything before
    /// it across the line as well.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> ReplicaResult<()> {
        let entry = self.append_payload_to_log(EntryPayload::Blank).await?;
        // This only ever needs to be updated once per term.
        self.core.last_log_id.term = self.core.ctx.term();

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await?;
        Ok(())
    }

    /// Handle a client read request.
    ///
    /// `Sequential` serves from local state once everything committed at the time
    /// of the request has been applied. `Linearizable` additionally confirms
    /// leadership by exchanging a heartbeat round with a majority of the cluster
    /// before serving (§8): a deposed leader's information may be stale, and must
    /// not answer.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    pub(super) async fn handle_client_read(&mut self, req: ReadRequest, tx: ClientTx) {
        if let ReadConsistency::Linearizable = req.consistency {
            if !self.confirm_leadership().await {
                // A discovered higher term supersedes the request; a round that
                // simply failed to reach a majority is a timeout.
                let err = if self.core.target_role.is_leader() {
                    ReplicaError::Timeout
                } else {
                    ReplicaError::Aborted
                };
                let _ = tx.send(Err(err));
                return;
            }
        }

        let commit_index = self.core.ctx.commit_index();
        if let Err(err) = self.core.apply_up_to(commit_index).await {
            let _ = tx.send(Err(err));
            return;
        }
        let _ = tx.send(Ok(self.core.handler.read(&req.key)));
    }

    /// Handle a client write request.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    pub(super) async fn handle_client_write(&mut self, req: WriteRequest, tx: ClientTx) {
        let payload = EntryPayload::Normal(EntryNormal {
            key: req.key,
            data: req.data,
        });
        self.append_and_replicate(payload, tx).await;
    }

    /// Handle a client delete request.
    ///
    /// A delete is a command entry whose data buffer is empty; the commit handler
    /// applies it as a removal.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    pub(super) async fn handle_client_delete(&mut self, req: DeleteRequest, tx: ClientTx) {
        let payload = EntryPayload::Normal(EntryNormal {
            key: req.key,
            data: Vec::new(),
        });
        self.append_and_replicate(payload, tx).await;
    }

    async fn append_and_replicate(&mut self, payload: EntryPayload, tx: ClientTx) {
        let entry = match self.append_payload_to_log(payload).await {
            Ok(entry) => ClientRequestEntry::from_entry(entry, Some(tx)),
            Err(err) => {
                let _ = tx.send(Err(err));
                return;
            }
        };
        if let Err(err) = self.replicate_client_request(entry).await {
            tracing::error!(error=%err, "error while replicating client request");
        }
    }

    /// Confirm that this node is still the cluster leader by exchanging a heartbeat
    /// round with a majority (§8).
    ///
    /// Returns false if the round could not be confirmed, which includes the
    /// discovery of a higher term; in that case the step-down is already underway.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn confirm_leadership(&mut self) -> bool {
        let members = self.core.cluster.members();
        let needed = quorum::majority_of(members.len());
        // We count for ourselves.
        let mut confirmed = 1usize;
        if confirmed >= needed {
            return true;
        }

        // Spawn parallel heartbeats, all with the standard heartbeat deadline.
        let mut pending = FuturesUnordered::new();
        for (id, peer) in self.core.ctx.peers() {
            if !members.contains(id) {
                continue;
            }
            let rpc = AppendEntriesRequest {
                term: self.core.ctx.term(),
                leader_id: self.core.id,
                prev_log_id: LogId::new(peer.matched_term, peer.match_index),
                entries: vec![],
                leader_commit: self.core.ctx.commit_index(),
            };
            let target = *id;
            let network = self.core.network.clone();
            let ttl = Duration::from_millis(self.core.config.heartbeat_interval);
            pending.push(
                async move {
                    match timeout(ttl, network.send_append_entries(target, rpc)).await {
                        Ok(Ok(res)) => Ok((target, res)),
                        Ok(Err(err)) => Err((target, err)),
                        Err(_) => Err((target, anyhow::anyhow!("timeout waiting for leadership confirmation"))),
                    }
                }
                .instrument(tracing::debug_span!("confirm_leadership", target = *id)),
            );
        }

        // Handle responses as they return.
        while let Some(res) = pending.next().await {
            let (target, data) = match res {
                Ok(res) => res,
                Err((target, err)) => {
                    tracing::warn!(target, error=%err, "error confirming leadership for read request");
                    continue;
                }
            };

            // A response with a greater term deposes us; abort the request.
            if data.term > self.core.ctx.term() {
                self.core.ctx.set_term(data.term);
                if let Err(err) = self.core.save_hard_state().await {
                    tracing::error!(error=%err, "error saving hard state while stepping down");
                }
                self.core.set_target_role(RoleKind::Follower);
                self.core.report_metrics();
                return false;
            }

            confirmed += 1;
            if confirmed >= needed {
                return true;
            }
        }

        // Too many requests failed; the caller gets an abort rather than a
        // possibly-stale read.
        tracing::warn!("could not confirm leadership with a majority");
        false
    }

    /// Transform the given payload into an entry, assign an index and term, and
    /// append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> ReplicaResult<Entry> {
        let entry = Entry {
            log_id: LogId::new(self.core.ctx.term(), self.core.last_log_id.index + 1),
            payload,
        };
        self.core.log.append(&entry).await.map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;
        self.core.report_metrics();
        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// This routine does not wait for the request to finish replication; once the
    /// entry is committed by the cluster, its response is resolved from the
    /// replication event path.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry) -> ReplicaResult<()> {
        let entry_arc = req.entry.clone();

        if self.nodes.is_empty() && self.learners.is_empty() {
            // There are no other members: the entry is committed the moment it hits
            // our own log.
            self.core.ctx.set_commit_index(entry_arc.log_id.index)?;
            self.core.report_metrics();
            self.client_request_post_commit(req).await?;
            return Ok(());
        }

        self.awaiting_committed.push(req);
        for stream in self.nodes.values().chain(self.learners.values()) {
            let _ = stream.repl_tx.send((
                ReplicationEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.ctx.commit_index(),
                },
                tracing::debug_span!("CH"),
            ));
        }
        Ok(())
    }

    /// Handle the post-commit logic for a client request: apply it and resolve the
    /// caller with the commit handler's output.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn client_request_post_commit(&mut self, req: ClientRequestEntry) -> ReplicaResult<()> {
        let entry = &req.entry;

        // Apply any outstanding committed entries from before this one first; this
        // only happens when a fresh leader still carries unapplied log from before
        // its term.
        if entry.log_id.index > 0 {
            self.core.apply_up_to(entry.log_id.index - 1).await?;
        }

        let result = match &entry.payload {
            EntryPayload::Normal(normal) => Some(self.core.handler.commit(&normal.key, &normal.data)),
            EntryPayload::Blank => None,
            EntryPayload::Config(_) => None,
        };
        self.core.ctx.set_last_applied(entry.log_id.index)?;
        self.core.report_metrics();

        if let Some(tx) = req.tx {
            let _ = tx.send(Ok(result.unwrap_or_default()));
        }
        Ok(())
    }
}
