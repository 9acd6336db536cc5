//! The core logic of a replica.

mod append_entries;
mod client;
mod replication;
mod vote;

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::cluster::Cluster;
use crate::cluster::NodeKind;
use crate::config::Config;
use crate::context::ReplicaContext;
use crate::core::client::ClientRequestEntry;
use crate::error::ReplicaError;
use crate::error::ReplicaResult;
use crate::log::LogView;
use crate::metrics::ReplicaMetrics;
use crate::network::Transport;
use crate::replica::ClientTx;
use crate::replica::DeleteRequest;
use crate::replica::EntryPayload;
use crate::replica::ReadRequest;
use crate::replica::ReplicaMsg;
use crate::replica::RpcTx;
use crate::replica::WriteRequest;
use crate::replication::PeerEvent;
use crate::replication::ReplicationEvent;
use crate::replication::ReplicationStream;
use crate::storage::CommitHandler;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::LogId;
use crate::NodeId;

/// The core type implementing the replica protocol.
///
/// This struct is the replica's authoritative context plus its execution anchor:
/// it is owned by a single spawned task, and every mutation of replica state
/// happens on that task. Role code borrows the core for the duration of one
/// reaction to an event; transitions never interleave with RPC handling.
pub struct ReplicaCore<C: Cluster, N: Transport, S: LogStore> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The cluster membership view.
    cluster: Arc<C>,
    /// The `Transport` implementation.
    network: Arc<N>,
    /// The `LogStore` implementation.
    storage: Arc<S>,
    /// The narrow log interface used by role code.
    log: LogView<S>,
    /// The owner-installed hook applying committed entries.
    handler: Box<dyn CommitHandler>,

    /// The authoritative mutable state: term, leadership, vote, commit frontier,
    /// apply frontier, recycle frontier, recovery flag and the peer table.
    ctx: ReplicaContext,

    /// The role the system should be in.
    target_role: RoleKind,
    /// The id of the last entry appended to the local log.
    last_log_id: LogId,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The instant at which the election timer fires next.
    next_election_timeout: Option<Instant>,

    /// Set once a shutdown has been requested; the main loop exits at the next
    /// quiescent point.
    shutdown: bool,
    /// The response channel of an in-progress `close()`, resolved once the `Start`
    /// role has released storage.
    pending_close: Option<RpcTx<()>>,

    rx_api: mpsc::UnboundedReceiver<(ReplicaMsg, Span)>,
    tx_metrics: watch::Sender<ReplicaMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<C: Cluster, N: Transport, S: LogStore> ReplicaCore<C, N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        config: Arc<Config>,
        cluster: Arc<C>,
        network: Arc<N>,
        storage: Arc<S>,
        handler: Box<dyn CommitHandler>,
        rx_api: mpsc::UnboundedReceiver<(ReplicaMsg, Span)>,
        tx_metrics: watch::Sender<ReplicaMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<ReplicaResult<()>> {
        let id = cluster.local_id();
        let log = LogView::new(storage.clone());
        let this = Self {
            id,
            config,
            cluster,
            network,
            storage,
            log,
            handler,
            ctx: ReplicaContext::new(),
            target_role: RoleKind::Start,
            last_log_id: LogId::new(0, 0),
            last_heartbeat: None,
            next_election_timeout: None,
            shutdown: false,
            pending_close: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(
            async move {
                let res = this.main().await;
                if let Err(ref err) = res {
                    tracing::error!(error=%err, "replica task exited with fatal error");
                }
                res
            }
            .instrument(tracing::debug_span!("spawn")),
        )
    }

    /// The main loop of the replica protocol.
    ///
    /// The replica assumes one of six roles based on lifecycle and cluster state.
    /// Control is delegated to the role loops; a role loop only returns once a
    /// transition or a shutdown is required, so a role's exit actions always
    /// complete before its successor's entry actions begin.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> ReplicaResult<()> {
        tracing::debug!("replica is initializing");
        loop {
            if self.shutdown {
                tracing::info!("replica has shutdown");
                return Ok(());
            }
            match &self.target_role {
                RoleKind::Start => StartRole::new(&mut self).run().await?,
                RoleKind::Passive => PassiveRole::new(&mut self).run().await?,
                RoleKind::Remote => RemoteRole::new(&mut self).run().await?,
                RoleKind::Follower => FollowerRole::new(&mut self).run().await?,
                RoleKind::Candidate => CandidateRole::new(&mut self).run().await?,
                RoleKind::Leader => LeaderRole::new(&mut self).run().await?,
            }
        }
    }

    /// Report a metrics payload on the current state of the replica.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(ReplicaMetrics {
            id: self.id,
            role: self.target_role,
            current_term: self.ctx.term(),
            current_leader: self.ctx.leader(),
            last_log_index: self.last_log_id.index,
            commit_index: self.ctx.commit_index(),
            last_applied: self.ctx.last_applied(),
            recycle_index: self.ctx.recycle_index(),
            version: self.ctx.version(),
            recovering: self.ctx.is_recovering(),
        });
        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Durably save the replica's hard state.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> ReplicaResult<()> {
        let hs = HardState {
            current_term: self.ctx.term(),
            voted_for: self.ctx.voted_for(),
        };
        self.storage.save_hard_state(&hs).await.map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update the target role, ensuring the node's cluster kind is honored.
    ///
    /// A transition to the current role is a no-op. Passive and remote nodes never
    /// take part in elections, so election-path targets collapse back to their
    /// resident role.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_role(&mut self, target: RoleKind) {
        if target == self.target_role {
            return;
        }
        let target = match (self.cluster.local_kind(), target) {
            (NodeKind::Passive, RoleKind::Follower)
            | (NodeKind::Passive, RoleKind::Candidate)
            | (NodeKind::Passive, RoleKind::Leader) => RoleKind::Passive,
            (NodeKind::Remote, RoleKind::Follower)
            | (NodeKind::Remote, RoleKind::Candidate)
            | (NodeKind::Remote, RoleKind::Leader) => RoleKind::Remote,
            (_, target) => target,
        };
        tracing::debug!(id = self.id, from = ?self.target_role, to = ?target, "role transition");
        self.target_role = target;
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Map a storage fault, which is fatal to the current role.
    ///
    /// The replica falls back to the `Start` role, which releases storage and flags
    /// the replica closed; a supervisor may re-open it.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> ReplicaError {
        tracing::error!({error=?err, id=self.id}, "fatal storage fault, leaving the cluster protocol");
        self.set_target_role(RoleKind::Start);
        ReplicaError::Storage(err)
    }

    /// Bring the replica into the cluster protocol.
    ///
    /// Storage is opened and the recorded epoch state restored, then the replica
    /// enters the role matching its cluster kind. The response channel is parked as
    /// an open-waiter: it resolves once a leader is first known.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    async fn handle_open(&mut self, tx: RpcTx<()>) {
        if self.ctx.is_open() {
            self.ctx.add_open_waiter(tx);
            return;
        }
        if let Err(err) = self.do_open().await {
            let _ = tx.send(Err(err));
            return;
        }
        self.ctx.add_open_waiter(tx);
    }

    async fn do_open(&mut self) -> ReplicaResult<()> {
        self.storage.open().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let state = self.storage.initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let last_index = self.log.last_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        if last_index != state.last_log_id.index {
            return Err(ReplicaError::illegal_state(format!(
                "log store reports last index {} but its initial state says {}",
                last_index, state.last_log_id.index
            )));
        }
        self.last_log_id = state.last_log_id;
        self.ctx.restore(state.hard_state.current_term, state.hard_state.voted_for);
        self.ctx.set_open(true);
        self.ctx.set_version(self.cluster.version());

        let role = match self.cluster.local_kind() {
            NodeKind::Active => RoleKind::Follower,
            NodeKind::Passive => RoleKind::Passive,
            NodeKind::Remote => RoleKind::Remote,
        };
        tracing::info!(id = self.id, ?role, term = self.ctx.term(), "replica opened");
        self.set_target_role(role);
        self.report_metrics();
        Ok(())
    }

    /// Leave the cluster protocol.
    ///
    /// The transition to `Start` happens through the main loop, so the current
    /// role's exit actions run first; the `Start` role then releases storage and
    /// resolves the pending close.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    fn handle_close(&mut self, tx: RpcTx<()>) {
        if !self.ctx.is_open() {
            let _ = tx.send(Ok(()));
            return;
        }
        self.ctx.abort_open_waiters();
        self.pending_close = Some(tx);
        self.set_target_role(RoleKind::Start);
    }

    /// The node to forward client requests to: the known leader, unless it is us.
    fn forward_target(&self) -> Option<NodeId> {
        self.ctx.leader().filter(|leader| *leader != self.id)
    }

    /// Forward a client read to the known leader, or fail with `NoLeader`.
    ///
    /// The forward itself runs on a spawned task so a slow leader never stalls the
    /// replica's own event loop.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_read(&self, req: ReadRequest, tx: ClientTx) {
        let target = match self.forward_target() {
            Some(target) => target,
            None => {
                let _ = tx.send(Err(ReplicaError::NoLeader));
                return;
            }
        };
        let network = self.network.clone();
        tokio::spawn(
            async move {
                let res = network.forward_read(target, req).await.map_err(ReplicaError::Transport);
                let _ = tx.send(res);
            }
            .instrument(tracing::debug_span!("forward_read", target = target)),
        );
    }

    /// Forward a client write to the known leader, or fail with `NoLeader`.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_write(&self, req: WriteRequest, tx: ClientTx) {
        let target = match self.forward_target() {
            Some(target) => target,
            None => {
                let _ = tx.send(Err(ReplicaError::NoLeader));
                return;
            }
        };
        let network = self.network.clone();
        tokio::spawn(
            async move {
                let res = network.forward_write(target, req).await.map_err(ReplicaError::Transport);
                let _ = tx.send(res);
            }
            .instrument(tracing::debug_span!("forward_write", target = target)),
        );
    }

    /// Forward a client delete to the known leader, or fail with `NoLeader`.
    #[tracing::instrument(level = "trace", skip(self, req, tx))]
    fn forward_client_delete(&self, req: DeleteRequest, tx: ClientTx) {
        let target = match self.forward_target() {
            Some(target) => target,
            None => {
                let _ = tx.send(Err(ReplicaError::NoLeader));
                return;
            }
        };
        let network = self.network.clone();
        tokio::spawn(
            async move {
                let res = network.forward_delete(target, req).await.map_err(ReplicaError::Transport);
                let _ = tx.send(res);
            }
            .instrument(tracing::debug_span!("forward_delete", target = target)),
        );
    }

    /// Apply committed entries through the commit handler, up to the given index.
    ///
    /// Entries apply strictly in log order on this task; blank and config entries
    /// advance the applied frontier without touching the handler. Completing the
    /// first observed commit index here is what ends recovery.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn apply_up_to(&mut self, upto: u64) -> ReplicaResult<()> {
        let upto = std::cmp::min(upto, self.ctx.commit_index());
        let start = self.ctx.last_applied() + 1;
        if upto < start {
            return Ok(());
        }
        let entries = self.log.entries(start, upto).await.map_err(|err| self.map_fatal_storage_error(err))?;
        for entry in &entries {
            if let EntryPayload::Normal(req) = &entry.payload {
                let _ = self.handler.commit(&req.key, &req.data);
            }
            self.ctx.set_last_applied(entry.log_id.index)?;
        }
        self.report_metrics();
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible roles of a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleKind {
    /// The null role held while closed and during open/close transitions; rejects
    /// everything with `NotOpen`.
    Start,
    /// A non-voting learner: replicates entries, but neither votes nor times out.
    Passive,
    /// A log-less observer which forwards client requests to a known leader.
    Remote,
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the cluster leader.
    Leader,
}

impl RoleKind {
    /// Check if currently in the start role.
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Check if currently in the passive role.
    pub fn is_passive(&self) -> bool {
        matches!(self, Self::Passive)
    }

    /// Check if currently in the remote role.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote)
    }

    /// Check if currently in the follower role.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in the candidate role.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in the leader role.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// The null role, held while the replica is closed.
struct StartRole<'a, C: Cluster, N: Transport, S: LogStore> {
    core: &'a mut ReplicaCore<C, N, S>,
}

impl<'a, C: Cluster, N: Transport, S: LogStore> StartRole<'a, C, N, S> {
    pub(self) fn new(core: &'a mut ReplicaCore<C, N, S>) -> Self {
        Self { core }
    }

    /// Entry actions: release storage if the replica is falling out of a live role,
    /// and resolve a pending close.
    async fn open(&mut self) -> ReplicaResult<()> {
        if self.core.ctx.is_open() {
            self.core.ctx.abort_open_waiters();
            if let Err(err) = self.core.storage.close().await {
                tracing::error!(error=%err, "error closing log store");
            }
            self.core.ctx.set_open(false);
        }
        if let Some(tx) = self.core.pending_close.take() {
            let _ = tx.send(Ok(()));
        }
        self.core.report_metrics();
        Ok(())
    }

    /// Run the start loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, role="start"))]
    pub(self) async fn run(mut self) -> ReplicaResult<()> {
        self.open().await?;
        loop {
            if !self.core.target_role.is_start() || self.core.shutdown {
                return Ok(());
            }

            tokio::select! {
                msg = self.core.rx_api.recv() => match msg {
                    Some((msg, span)) => match msg {
                        ReplicaMsg::Open{tx} => self.core.handle_open(tx).instrument(span).await,
                        ReplicaMsg::Close{tx} => {
                            let _ = tx.send(Ok(()));
                        }
                        ReplicaMsg::AppendEntries{tx, ..} => {
                            let _ = tx.send(Err(ReplicaError::NotOpen));
                        }
                        ReplicaMsg::Vote{tx, ..} => {
                            let _ = tx.send(Err(ReplicaError::NotOpen));
                        }
                        ReplicaMsg::Read{tx, ..} => {
                            let _ = tx.send(Err(ReplicaError::NotOpen));
                        }
                        ReplicaMsg::Write{tx, ..} => {
                            let _ = tx.send(Err(ReplicaError::NotOpen));
                        }
                        ReplicaMsg::Delete{tx, ..} => {
                            let _ = tx.send(Err(ReplicaError::NotOpen));
                        }
                        ReplicaMsg::SetRecycleIndex{tx, ..} => {
                            let _ = tx.send(Err(ReplicaError::NotOpen));
                        }
                    },
                    None => self.core.shutdown = true,
                },
                // A dropped sender means the handle is gone; treat it as shutdown too.
                _ = &mut self.core.rx_shutdown => self.core.shutdown = true,
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the follower role.
struct FollowerRole<'a, C: Cluster, N: Transport, S: LogStore> {
    core: &'a mut ReplicaCore<C, N, S>,
}

impl<'a, C: Cluster, N: Transport, S: LogStore> FollowerRole<'a, C, N, S> {
    pub(self) fn new(core: &'a mut ReplicaCore<C, N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, role="follower"))]
    pub(self) async fn run(self) -> ReplicaResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_follower() || self.core.shutdown {
                return Ok(());
            }
            // The timer value is refreshed as heartbeats arrive.
            let election_timeout = sleep_until(self.core.get_next_election_timeout());

            tokio::select! {
                // If the election timer fires we transition to candidate.
                _ = election_timeout => self.core.set_target_role(RoleKind::Candidate),
                msg = self.core.rx_api.recv() => match msg {
                    Some((msg, span)) => match msg {
                        ReplicaMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Vote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Read{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_read(req, tx);
                        }
                        ReplicaMsg::Write{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_write(req, tx);
                        }
                        ReplicaMsg::Delete{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_delete(req, tx);
                        }
                        ReplicaMsg::Open{tx} => self.core.handle_open(tx).instrument(span).await,
                        ReplicaMsg::Close{tx} => {
                            let _ent = span.enter();
                            self.core.handle_close(tx);
                        }
                        ReplicaMsg::SetRecycleIndex{index, tx} => {
                            let _ent = span.enter();
                            let _ = tx.send(self.core.ctx.set_recycle_index(index));
                        }
                    },
                    None => self.core.shutdown = true,
                },
                // A dropped sender means the handle is gone; treat it as shutdown too.
                _ = &mut self.core.rx_shutdown => self.core.shutdown = true,
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the passive role.
///
/// Identical replication semantics to a follower, but no election timer: a passive
/// node never campaigns, and its vote handler never grants.
struct PassiveRole<'a, C: Cluster, N: Transport, S: LogStore> {
    core: &'a mut ReplicaCore<C, N, S>,
}

impl<'a, C: Cluster, N: Transport, S: LogStore> PassiveRole<'a, C, N, S> {
    pub(self) fn new(core: &'a mut ReplicaCore<C, N, S>) -> Self {
        Self { core }
    }

    /// Run the passive loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, role="passive"))]
    pub(self) async fn run(self) -> ReplicaResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_passive() || self.core.shutdown {
                return Ok(());
            }

            tokio::select! {
                msg = self.core.rx_api.recv() => match msg {
                    Some((msg, span)) => match msg {
                        ReplicaMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Vote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Read{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_read(req, tx);
                        }
                        ReplicaMsg::Write{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_write(req, tx);
                        }
                        ReplicaMsg::Delete{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_delete(req, tx);
                        }
                        ReplicaMsg::Open{tx} => self.core.handle_open(tx).instrument(span).await,
                        ReplicaMsg::Close{tx} => {
                            let _ent = span.enter();
                            self.core.handle_close(tx);
                        }
                        ReplicaMsg::SetRecycleIndex{index, tx} => {
                            let _ent = span.enter();
                            let _ = tx.send(self.core.ctx.set_recycle_index(index));
                        }
                    },
                    None => self.core.shutdown = true,
                },
                // A dropped sender means the handle is gone; treat it as shutdown too.
                _ = &mut self.core.rx_shutdown => self.core.shutdown = true,
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the remote role.
///
/// A remote node holds no log: it only tracks the epoch and leadership gleaned
/// from observed traffic, so it can forward client requests. Until an
/// advertisement arrives, client requests fail with `NoLeader`.
struct RemoteRole<'a, C: Cluster, N: Transport, S: LogStore> {
    core: &'a mut ReplicaCore<C, N, S>,
}

impl<'a, C: Cluster, N: Transport, S: LogStore> RemoteRole<'a, C, N, S> {
    pub(self) fn new(core: &'a mut ReplicaCore<C, N, S>) -> Self {
        Self { core }
    }

    /// Run the remote loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, role="remote"))]
    pub(self) async fn run(self) -> ReplicaResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_role.is_remote() || self.core.shutdown {
                return Ok(());
            }

            tokio::select! {
                msg = self.core.rx_api.recv() => match msg {
                    Some((msg, span)) => match msg {
                        ReplicaMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_observed(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Vote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Read{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_read(req, tx);
                        }
                        ReplicaMsg::Write{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_write(req, tx);
                        }
                        ReplicaMsg::Delete{req, tx} => {
                            let _ent = span.enter();
                            self.core.forward_client_delete(req, tx);
                        }
                        ReplicaMsg::Open{tx} => self.core.handle_open(tx).instrument(span).await,
                        ReplicaMsg::Close{tx} => {
                            let _ent = span.enter();
                            self.core.handle_close(tx);
                        }
                        ReplicaMsg::SetRecycleIndex{index, tx} => {
                            let _ent = span.enter();
                            let _ = tx.send(self.core.ctx.set_recycle_index(index));
                        }
                    },
                    None => self.core.shutdown = true,
                },
                // A dropped sender means the handle is gone; treat it as shutdown too.
                _ = &mut self.core.rx_shutdown => self.core.shutdown = true,
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the candidate role.
struct CandidateRole<'a, C: Cluster, N: Transport, S: LogStore> {
    core: &'a mut ReplicaCore<C, N, S>,
    /// The number of votes which have been granted by peer nodes.
    votes_granted: u64,
    /// The number of votes needed in order to become the cluster leader.
    votes_needed: u64,
}

impl<'a, C: Cluster, N: Transport, S: LogStore> CandidateRole<'a, C, N, S> {
    pub(self) fn new(core: &'a mut ReplicaCore<C, N, S>) -> Self {
        Self {
            core,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, role="candidate"))]
    pub(self) async fn run(mut self) -> ReplicaResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_role.is_candidate() || self.core.shutdown {
                return Ok(());
            }

            let members = self.core.cluster.members();
            self.core.ctx.set_version(self.core.cluster.version());

            // We vote for ourselves, and need a simple majority.
            self.votes_granted = 1;
            self.votes_needed = crate::quorum::majority_of(members.len()) as u64;

            // Setup new term.
            self.core.update_next_election_timeout(false);
            let new_term = self.core.ctx.term() + 1;
            self.core.ctx.set_term(new_term);
            self.core.ctx.set_voted_for(Some(self.core.id))?;
            self.core.save_hard_state().await?;
            self.core.report_metrics();
            tracing::info!(id = self.core.id, term = new_term, "campaigning for leadership");

            if self.votes_granted >= self.votes_needed {
                // Single-node cluster: leadership is immediate.
                self.core.set_target_role(RoleKind::Leader);
                continue;
            }

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests(&members);

            // Inner processing loop for this term.
            loop {
                if !self.core.target_role.is_candidate() || self.core.shutdown {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                tokio::select! {
                    // This election has timed out. Break to the outer loop, which starts a new term.
                    _ = timeout_fut => break,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    msg = self.core.rx_api.recv() => match msg {
                        Some((msg, span)) => match msg {
                            ReplicaMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).instrument(span).await);
                            }
                            ReplicaMsg::Vote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).instrument(span).await);
                            }
                            ReplicaMsg::Read{req, tx} => {
                                let _ent = span.enter();
                                self.core.forward_client_read(req, tx);
                            }
                            ReplicaMsg::Write{req, tx} => {
                                let _ent = span.enter();
                                self.core.forward_client_write(req, tx);
                            }
                            ReplicaMsg::Delete{req, tx} => {
                                let _ent = span.enter();
                                self.core.forward_client_delete(req, tx);
                            }
                            ReplicaMsg::Open{tx} => self.core.handle_open(tx).instrument(span).await,
                            ReplicaMsg::Close{tx} => {
                                let _ent = span.enter();
                                self.core.handle_close(tx);
                            }
                            ReplicaMsg::SetRecycleIndex{index, tx} => {
                                let _ent = span.enter();
                                let _ = tx.send(self.core.ctx.set_recycle_index(index));
                            }
                        },
                        None => self.core.shutdown = true,
                    },
                    // A dropped sender means the handle is gone; treat it as shutdown too.
                _ = &mut self.core.rx_shutdown => self.core.shutdown = true,
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the leader role.
struct LeaderRole<'a, C: Cluster, N: Transport, S: LogStore> {
    pub(super) core: &'a mut ReplicaCore<C, N, S>,
    /// The replication streams to voting members.
    pub(super) nodes: std::collections::BTreeMap<NodeId, ReplicationStream>,
    /// The replication streams to non-voting learners.
    pub(super) learners: std::collections::BTreeMap<NodeId, ReplicationStream>,

    /// The stream of events coming from the per-peer replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(PeerEvent, Span)>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,

    /// A buffer of client requests which have been appended locally and are waiting
    /// to be committed by the cluster.
    pub(super) awaiting_committed: Vec<ClientRequestEntry>,
}

impl<'a, C: Cluster, N: Transport, S: LogStore> LeaderRole<'a, C, N, S> {
    pub(self) fn new(core: &'a mut ReplicaCore<C, N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: Default::default(),
            learners: Default::default(),
            replication_rx,
            replication_tx,
            awaiting_committed: Vec::new(),
        }
    }

    /// Run the leader loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, role="leader"))]
    pub(self) async fn run(mut self) -> ReplicaResult<()> {
        let members = self.core.cluster.members();
        let learners = self.core.cluster.learners();
        self.core.ctx.set_version(self.core.cluster.version());

        // Rebuild the peer table for the new term, then spawn replication streams.
        let targets: Vec<_> = members
            .iter()
            .chain(learners.iter())
            .copied()
            .filter(|target| *target != self.core.id)
            .collect();
        self.core.ctx.reset_peers(targets.iter().copied(), self.core.last_log_id.index + 1);
        for target in targets {
            let stream = self.spawn_replication_stream(target);
            if members.contains(&target) {
                self.nodes.insert(target, stream);
            } else {
                self.learners.insert(target, stream);
            }
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.ctx.set_leader(Some(self.core.id));
        self.core.report_metrics();

        // Commit an initial entry as part of becoming the cluster leader (§8): until
        // an entry of this term is committed, earlier-term entries cannot be counted
        // toward the commit frontier.
        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_role.is_leader() || self.core.shutdown {
                tracing::info!(id = self.core.id, to = ?self.core.target_role, "leaving leader role");

                // Exit actions: terminate the replication streams and abort waiters
                // which can no longer be resolved by this node.
                for stream in self.nodes.values().chain(self.learners.values()) {
                    let _ = stream.repl_tx.send((ReplicationEvent::Terminate, tracing::debug_span!("CH")));
                }
                for req in self.awaiting_committed.drain(..) {
                    if let Some(tx) = req.tx {
                        let _ = tx.send(Err(ReplicaError::Aborted));
                    }
                }
                return Ok(());
            }

            tokio::select! {
                msg = self.core.rx_api.recv() => match msg {
                    Some((msg, span)) => match msg {
                        ReplicaMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Vote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).instrument(span).await);
                        }
                        ReplicaMsg::Read{req, tx} => self.handle_client_read(req, tx).instrument(span).await,
                        ReplicaMsg::Write{req, tx} => self.handle_client_write(req, tx).instrument(span).await,
                        ReplicaMsg::Delete{req, tx} => self.handle_client_delete(req, tx).instrument(span).await,
                        ReplicaMsg::Open{tx} => self.core.handle_open(tx).instrument(span).await,
                        ReplicaMsg::Close{tx} => {
                            let _ent = span.enter();
                            self.core.handle_close(tx);
                        }
                        ReplicaMsg::SetRecycleIndex{index, tx} => {
                            let _ent = span.enter();
                            let _ = tx.send(self.core.ctx.set_recycle_index(index));
                        }
                    },
                    None => self.core.shutdown = true,
                },
                event = self.replication_rx.recv() => match event {
                    Some((event, span)) => self.handle_peer_event(event).instrument(span).await?,
                    None => self.core.shutdown = true,
                },
                // A dropped sender means the handle is gone; treat it as shutdown too.
                _ = &mut self.core.rx_shutdown => self.core.shutdown = true,
            }
        }
    }
}
