//! Public replica interface and data types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::core::ReplicaCore;
use crate::error::ReplicaError;
use crate::error::ReplicaResult;
use crate::metrics::ReplicaMetrics;
use crate::metrics::Wait;
use crate::network::Transport;
use crate::storage::CommitHandler;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

struct ReplicaInner {
    tx_api: mpsc::UnboundedSender<(ReplicaMsg, Span)>,
    rx_metrics: watch::Receiver<ReplicaMetrics>,
    core_handle: Mutex<Option<JoinHandle<ReplicaResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The client-facing gateway to a running replica.
///
/// Construction spawns the replica's core task, which is the single execution
/// context owning all replica state; this handle submits work to that task and
/// awaits completions. The replica starts closed, in the `Start` role; call
/// [`Replica::open`] to bring it into the cluster protocol.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself
/// is very cheap and helps to facilitate use with async workflows.
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl Replica {
    /// Create and spawn a new replica task.
    ///
    /// ### `config`
    /// The replica's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `cluster`
    /// The membership view: the local node's identity and kind, and the member table.
    ///
    /// ### `network`
    /// An implementation of the `Transport` trait used for RPCs to peer nodes.
    ///
    /// ### `storage`
    /// An implementation of the `LogStore` trait which owns durability of the log.
    ///
    /// ### `handler`
    /// The commit handler invoked, on the replica task, as committed entries apply.
    #[tracing::instrument(level="trace", skip(config, cluster, network, storage, handler), fields(cluster=%config.cluster_name))]
    pub fn new<C, N, S>(
        config: Arc<Config>,
        cluster: Arc<C>,
        network: Arc<N>,
        storage: Arc<S>,
        handler: Box<dyn CommitHandler>,
    ) -> Self
    where
        C: Cluster,
        N: Transport,
        S: LogStore,
    {
        let id = cluster.local_id();
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(ReplicaMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle =
            ReplicaCore::spawn(config, cluster, network, storage, handler, rx_api, tx_metrics, rx_shutdown);
        let inner = ReplicaInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Open the replica: open the log store and enter the role matching the local
    /// node kind.
    ///
    /// The returned future resolves once a leader is known for the current term,
    /// i.e. once the replica is actually able to serve; opening an already open
    /// replica is a no-op that waits on the same condition.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn open(&self) -> ReplicaResult<()> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::Open { tx }, rx).await
    }

    /// Close the replica: leave the cluster protocol, fall back to the `Start` role
    /// and close the log store. In-flight requests resolve with `Aborted`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self) -> ReplicaResult<()> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::Close { tx }, rx).await
    }

    /// Submit an AppendEntries RPC to this replica.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3),
    /// and are also used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> ReplicaResult<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a RequestVote RPC to this replica.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting
    /// to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> ReplicaResult<VoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::Vote { rpc, tx }, rx).await
    }

    /// Read the value of a key.
    ///
    /// On the leader, `Sequential` serves from local state once everything committed
    /// at the time of the request has been applied; `Linearizable` first confirms
    /// leadership with a majority heartbeat round (§8). On any other open role the
    /// request is forwarded to the known leader, or fails with `NoLeader`.
    #[tracing::instrument(level = "debug", skip(self, key))]
    pub async fn read(&self, key: Vec<u8>, consistency: ReadConsistency) -> ReplicaResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::Read { req: ReadRequest { key, consistency }, tx }, rx).await
    }

    /// Write a key/value pair through the replicated log.
    ///
    /// The returned future resolves with the commit handler's output once the entry
    /// has been committed by a cluster majority and applied locally.
    #[tracing::instrument(level = "debug", skip(self, key, data))]
    pub async fn write(&self, key: Vec<u8>, data: Vec<u8>) -> ReplicaResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::Write { req: WriteRequest { key, data }, tx }, rx).await
    }

    /// Delete a key through the replicated log.
    ///
    /// Completion semantics match [`Replica::write`].
    #[tracing::instrument(level = "debug", skip(self, key))]
    pub async fn delete(&self, key: Vec<u8>) -> ReplicaResult<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::Delete { req: DeleteRequest { key }, tx }, rx).await
    }

    /// Advance the recycle frontier: the highest log index the owner has authorised
    /// for discard.
    ///
    /// The engine never advances this value itself; the compaction policy lives with
    /// the owner, which must guarantee the index is durably covered elsewhere before
    /// authorising it here.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_recycle_index(&self, index: u64) -> ReplicaResult<()> {
        let (tx, rx) = oneshot::channel();
        self.call(ReplicaMsg::SetRecycleIndex { index, tx }, rx).await
    }

    /// Get the ID of the current leader from this replica.
    ///
    /// This is based on the replica's metrics and may be momentarily stale; use
    /// `read` with `ReadConsistency::Linearizable` to guard against stale reads.
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ReplicaMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = timeout.unwrap_or_else(|| Duration::from_millis(500));
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this replica's core task entirely.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }

    /// Submit a message to the core task and await its completion.
    async fn call<T>(&self, msg: ReplicaMsg, rx: oneshot::Receiver<ReplicaResult<T>>) -> ReplicaResult<T> {
        let span = tracing::debug_span!("CH");
        self.inner.tx_api.send((msg, span)).map_err(|_| ReplicaError::Aborted)?;
        rx.await.map_err(|_| ReplicaError::Aborted).and_then(|res| res)
    }
}

impl Clone for Replica {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RpcTx<T> = oneshot::Sender<ReplicaResult<T>>;
pub(crate) type ClientTx = oneshot::Sender<ReplicaResult<Vec<u8>>>;

/// A message coming from the replica API.
pub(crate) enum ReplicaMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: RpcTx<AppendEntriesResponse>,
    },
    Vote {
        rpc: VoteRequest,
        tx: RpcTx<VoteResponse>,
    },
    Read {
        req: ReadRequest,
        tx: ClientTx,
    },
    Write {
        req: WriteRequest,
        tx: ClientTx,
    },
    Delete {
        req: DeleteRequest,
        tx: ClientTx,
    },
    Open {
        tx: RpcTx<()>,
    },
    Close {
        tx: RpcTx<()>,
    },
    SetRecycleIndex {
        index: u64,
        tx: RpcTx<()>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,
    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if the follower contained an entry matching `prev_log_id`.
    pub success: bool,
    /// A hint used to implement the conflicting-term optimization outlined in §5.3.
    ///
    /// This value will only be present, and should only be considered, when
    /// `success` is `false`.
    pub conflict_opt: Option<ConflictOpt>,
}

/// A hint for fast-backtracking a rejected AppendEntries exchange (§5.3).
///
/// Carries the most recent local entry which does not conflict with the received
/// request, letting the leader move its `next_index` for the peer back in one round
/// instead of probing one index at a time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: NodeId,
    /// The index of the candidate's last log entry (§5.4).
    pub last_log_index: u64,
    /// The term of the candidate's last log entry (§5.4).
    pub last_log_term: u64,
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        self.iter().map(|x| x.summary()).collect::<Vec<_>>().join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Blank,
    /// A normal command entry carrying a client operation.
    Normal(EntryNormal),
    /// A configuration snapshot entry recorded by the membership layer.
    Config(EntryConfig),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Blank => "blank".to_string(),
            EntryPayload::Normal(_) => "normal".to_string(),
            EntryPayload::Config(c) => format!("config: version {}", c.version),
        }
    }
}

/// A normal command entry.
///
/// An empty `data` buffer encodes a removal of `key`; the commit handler applies it
/// as such.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryNormal {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// A configuration snapshot entry.
///
/// The engine never creates these itself; the membership layer may record the
/// configurations it distributes here so that they replicate and survive with the
/// log. They are skipped during apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryConfig {
    /// The configuration version counter at the time of the snapshot.
    pub version: u64,
    /// The voting member set of the configuration.
    pub members: Vec<NodeId>,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The consistency level demanded of a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Serve once everything committed at the time of the request has applied locally.
    Sequential,
    /// Additionally confirm leadership with a majority before serving, guarding
    /// against reads from a deposed leader (§8).
    Linearizable,
}

/// A client request to read a key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub key: Vec<u8>,
    pub consistency: ReadConsistency,
}

/// A client request to write a key/value pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// A client request to delete a key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: Vec<u8>,
}
