//! Fixtures for testing the replica engine.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use memlog::KvHandler;
use memlog::MemLog;
use replica_core::async_trait::async_trait;
use replica_core::metrics::ReplicaMetrics;
use replica_core::metrics::Wait;
use replica_core::replica::AppendEntriesRequest;
use replica_core::replica::AppendEntriesResponse;
use replica_core::replica::DeleteRequest;
use replica_core::replica::ReadRequest;
use replica_core::replica::VoteRequest;
use replica_core::replica::VoteResponse;
use replica_core::replica::WriteRequest;
use replica_core::Cluster;
use replica_core::Config;
use replica_core::Member;
use replica_core::NodeId;
use replica_core::NodeKind;
use replica_core::ReadConsistency;
use replica_core::Replica;
use replica_core::ReplicaResult;
use replica_core::RoleKind;
use replica_core::Transport;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

macro_rules! func_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let n = &name[..name.len() - 3];
        let nn = n.replace("::{{closure}}", "");
        nn
    }};
}

macro_rules! init_ut {
    () => {{
        fixtures::init_tracing();

        let name = func_name!();
        let span = tracing::debug_span!("ut", "{}", name.split("::").last().unwrap());
        ((), span)
    }};
}

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed membership view handed to each node under test.
pub struct StaticCluster {
    local: NodeId,
    kind: NodeKind,
    members: BTreeSet<NodeId>,
    learners: BTreeSet<NodeId>,
    version: u64,
}

impl StaticCluster {
    pub fn new(
        local: NodeId,
        kind: NodeKind,
        members: BTreeSet<NodeId>,
        learners: BTreeSet<NodeId>,
    ) -> Self {
        Self {
            local,
            kind,
            members,
            learners,
            version: 1,
        }
    }
}

impl Cluster for StaticCluster {
    fn local_id(&self) -> NodeId {
        self.local
    }

    fn local_kind(&self) -> NodeKind {
        self.kind
    }

    fn members(&self) -> BTreeSet<NodeId> {
        self.members.clone()
    }

    fn learners(&self) -> BTreeSet<NodeId> {
        self.learners.clone()
    }

    fn member(&self, id: NodeId) -> Option<Member> {
        if self.members.contains(&id) {
            Some(Member {
                id,
                kind: NodeKind::Active,
            })
        } else if self.learners.contains(&id) {
            Some(Member {
                id,
                kind: NodeKind::Passive,
            })
        } else {
            None
        }
    }

    fn version(&self) -> u64 {
        self.version
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

struct NodeHandles {
    replica: Replica,
    storage: Arc<MemLog>,
    kv: KvHandler,
}

/// A type which emulates a network transport and implements the `Transport` trait.
pub struct ClusterRouter {
    /// The runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, NodeHandles>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,
}

impl ClusterRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        }
    }

    /// Create and register a new replica bearing the given ID, on a fresh store.
    pub async fn new_node(
        self: &Arc<Self>,
        id: NodeId,
        kind: NodeKind,
        members: BTreeSet<NodeId>,
        learners: BTreeSet<NodeId>,
    ) {
        let storage = Arc::new(MemLog::new());
        self.new_node_with_storage(id, kind, members, learners, storage).await
    }

    /// Create and register a new replica on an existing store, emulating a restart.
    pub async fn new_node_with_storage(
        self: &Arc<Self>,
        id: NodeId,
        kind: NodeKind,
        members: BTreeSet<NodeId>,
        learners: BTreeSet<NodeId>,
        storage: Arc<MemLog>,
    ) {
        let kv = KvHandler::new();
        let cluster = Arc::new(StaticCluster::new(id, kind, members, learners));
        let replica = Replica::new(
            self.config.clone(),
            cluster,
            self.clone(),
            storage.clone(),
            Box::new(kv.clone()),
        );
        let mut rt = self.routing_table.write().await;
        rt.insert(id, NodeHandles { replica, storage, kv });
    }

    /// Get a clone of the replica handle for the target node.
    pub async fn replica(&self, id: NodeId) -> Result<Replica> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(node.replica.clone())
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn storage(&self, id: NodeId) -> Result<Arc<MemLog>> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(node.storage.clone())
    }

    /// Get a handle to the key/value state for the target node.
    pub async fn kv(&self, id: NodeId) -> Result<KvHandler> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&id).with_context(|| format!("node {} not found in routing table", id))?;
        Ok(node.kv.clone())
    }

    /// Open the target replica, waiting until it knows a leader.
    pub async fn open(&self, id: NodeId) -> Result<()> {
        self.replica(id).await?.open().await?;
        Ok(())
    }

    /// Open the target replica without waiting for a leader to be known.
    pub async fn open_detached(&self, id: NodeId) -> Result<()> {
        let replica = self.replica(id).await?;
        tokio::spawn(async move {
            if let Err(err) = replica.open().await {
                tracing::warn!(error=%err, "detached open did not complete");
            }
        });
        Ok(())
    }

    /// Open all registered replicas concurrently and wait for every open to resolve.
    pub async fn open_all(&self) -> Result<()> {
        let ids: Vec<_> = {
            let rt = self.routing_table.read().await;
            rt.keys().copied().collect()
        };
        self.open_nodes(&ids).await
    }

    /// Open the given replicas concurrently and wait for every open to resolve.
    pub async fn open_nodes(&self, ids: &[NodeId]) -> Result<()> {
        let mut opens = Vec::new();
        for id in ids {
            let replica = self.replica(*id).await?;
            opens.push(tokio::spawn(async move { replica.open().await }));
        }
        for open in opens {
            open.await??;
        }
        Ok(())
    }

    /// Shutdown the target replica's core task.
    pub async fn shutdown(&self, id: NodeId) -> Result<()> {
        self.replica(id).await?.shutdown().await?;
        Ok(())
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) {
        {
            let mut rt = self.routing_table.write().await;
            rt.remove(&id);
        }
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<ReplicaMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.replica.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current, non-isolated leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await.clone();
        self.latest_metrics().await.into_iter().find_map(|m| {
            if m.role == RoleKind::Leader && !isolated.contains(&m.id) {
                Some(m.id)
            } else {
                None
            }
        })
    }

    /// Get a wait handle on the target node's metrics.
    pub async fn wait(&self, id: NodeId, timeout: Option<Duration>) -> Result<Wait> {
        Ok(self.replica(id).await?.wait(timeout))
    }

    /// Wait for the given nodes to reach the given commit index.
    pub async fn wait_for_commit(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(*id, timeout).await?.committed(want, msg).await?;
        }
        Ok(())
    }

    /// Wait for the given nodes to apply up to the given index.
    pub async fn wait_for_applied(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids {
            self.wait(*id, timeout).await?.applied(want, msg).await?;
        }
        Ok(())
    }

    /// Wait until some non-isolated node reports itself leader, and return its ID.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> Result<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return Ok(leader);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("timeout waiting for a leader: {}", msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Send a client write to the target node.
    pub async fn write(&self, target: NodeId, key: &[u8], data: &[u8]) -> ReplicaResult<Vec<u8>> {
        let replica = self.replica(target).await.expect("unknown node");
        replica.write(key.to_vec(), data.to_vec()).await
    }

    /// Send a client read to the target node.
    pub async fn read(&self, target: NodeId, key: &[u8], consistency: ReadConsistency) -> ReplicaResult<Vec<u8>> {
        let replica = self.replica(target).await.expect("unknown node");
        replica.read(key.to_vec(), consistency).await
    }

    /// Send a client delete to the target node.
    pub async fn delete(&self, target: NodeId, key: &[u8]) -> ReplicaResult<Vec<u8>> {
        let replica = self.replica(target).await.expect("unknown node");
        replica.delete(key.to_vec()).await
    }

    /// Inject an AppendEntries RPC directly into the target node.
    pub async fn append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> ReplicaResult<AppendEntriesResponse> {
        let replica = self.replica(target).await.expect("unknown node");
        replica.append_entries(rpc).await
    }

    /// Inject a RequestVote RPC directly into the target node.
    pub async fn vote(&self, target: NodeId, rpc: VoteRequest) -> ReplicaResult<VoteResponse> {
        let replica = self.replica(target).await.expect("unknown node");
        replica.vote(rpc).await
    }
}

#[async_trait]
impl Transport for ClusterRouter {
    /// Send an AppendEntries RPC to the target node.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        drop(isolated);
        let replica = self.replica(target).await?;
        Ok(replica.append_entries(rpc).await?)
    }

    /// Send a RequestVote RPC to the target node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        drop(isolated);
        let replica = self.replica(target).await?;
        Ok(replica.vote(rpc).await?)
    }

    /// Forward a client read to the target node.
    async fn forward_read(&self, target: NodeId, req: ReadRequest) -> Result<Vec<u8>> {
        if self.isolated_nodes.read().await.contains(&target) {
            return Err(anyhow!("target node is isolated"));
        }
        let replica = self.replica(target).await?;
        replica.read(req.key, req.consistency).await.map_err(anyhow::Error::new)
    }

    /// Forward a client write to the target node.
    async fn forward_write(&self, target: NodeId, req: WriteRequest) -> Result<Vec<u8>> {
        if self.isolated_nodes.read().await.contains(&target) {
            return Err(anyhow!("target node is isolated"));
        }
        let replica = self.replica(target).await?;
        replica.write(req.key, req.data).await.map_err(anyhow::Error::new)
    }

    /// Forward a client delete to the target node.
    async fn forward_delete(&self, target: NodeId, req: DeleteRequest) -> Result<Vec<u8>> {
        if self.isolated_nodes.read().await.contains(&target) {
            return Err(anyhow!("target node is isolated"));
        }
        let replica = self.replica(target).await?;
        replica.delete(req.key).await.map_err(anyhow::Error::new)
    }
}
