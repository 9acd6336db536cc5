//! The wire transport collaborator.

use anyhow::Result;
use async_trait::async_trait;

use crate::replica::AppendEntriesRequest;
use crate::replica::AppendEntriesResponse;
use crate::replica::DeleteRequest;
use crate::replica::ReadRequest;
use crate::replica::VoteRequest;
use crate::replica::VoteResponse;
use crate::replica::WriteRequest;
use crate::NodeId;

/// The interface used by the replica to reach its peers.
///
/// Responses always carry the responder's current term, which is how the engine
/// observes higher terms and steps down. Errors returned here are treated as
/// transient: the replication loop re-attempts on its next heartbeat, and vote
/// rounds simply proceed without the unreachable peer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target node (§5.3); also carries heartbeats (§5.2).
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target node (§5.2).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Forward a client read to the target node, returning the result buffer.
    async fn forward_read(&self, target: NodeId, req: ReadRequest) -> Result<Vec<u8>>;

    /// Forward a client write to the target node, returning the result buffer.
    async fn forward_write(&self, target: NodeId, req: WriteRequest) -> Result<Vec<u8>>;

    /// Forward a client delete to the target node, returning the result buffer.
    async fn forward_delete(&self, target: NodeId, req: DeleteRequest) -> Result<Vec<u8>>;
}
