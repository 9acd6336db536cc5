//! The log storage interface and data types.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::replica::Entry;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a replica.
///
/// This is the slice of replica state which must be durable before the replica may
/// answer a vote or acknowledge a higher term: losing it across a restart could lead
/// to a double vote within one term.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this replica.
    pub current_term: u64,
    /// The ID of the node voted for in `current_term`.
    pub voted_for: Option<NodeId>,
}

/// The state a replica needs when first opening its log store.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The id of the last entry in the log.
    pub last_log_id: LogId,
    /// The saved hard state of the replica.
    pub hard_state: HardState,
}

impl InitialState {
    /// Create a new instance for a pristine replica.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId::new(0, 0),
            hard_state: HardState::default(),
        }
    }
}

/// The interface to the replica's persistent operation log.
///
/// The store owns durability: any index acknowledged by `append` must be recoverable
/// after a crash occurring once the call has returned. All mutating calls are made
/// from the replica's single execution context; reads may race an in-flight leader
/// replication task and must therefore be internally consistent.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Open the store. Opening an already open store is a no-op.
    async fn open(&self) -> Result<()>;

    /// Close the store. Closing an already closed store is a no-op.
    async fn close(&self) -> Result<()>;

    /// Fetch the state recorded by previous runs of the replica.
    ///
    /// A pristine store returns `InitialState::new_initial()`.
    async fn initial_state(&self) -> Result<InitialState>;

    /// Durably save the replica's hard state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Append a payload of entries to the log, durable before return.
    ///
    /// Entries are presented in order and their indexes are strictly contiguous with
    /// the current tail of the log.
    async fn append(&self, entries: &[&Entry]) -> Result<()>;

    /// Delete all entries with `index >= from`.
    async fn truncate_suffix(&self, from: u64) -> Result<()>;

    /// Fetch the entries in the inclusive range `[from, to]`.
    async fn entries(&self, from: u64, to: u64) -> Result<Vec<Entry>>;

    /// The term of the entry at the given index, or 0 if there is no such entry.
    async fn term_at(&self, index: u64) -> Result<u64>;

    /// The index of the first entry in the log, or 0 if the log is empty.
    async fn first_index(&self) -> Result<u64>;

    /// The index of the last entry in the log, or 0 if the log is empty.
    async fn last_index(&self) -> Result<u64>;
}

/// The application hook invoked as committed entries are applied.
///
/// Installed by the owner of the replica and invoked only on the replica's execution
/// context, in strict log order. The handler owns the materialized state the log
/// describes; `read` serves client reads against that state once the replica has
/// established the required read consistency.
pub trait CommitHandler: Send + 'static {
    /// Apply a committed command entry, returning the result buffer handed back to
    /// the waiting client.
    ///
    /// An empty `data` buffer is a removal of `key`.
    fn commit(&mut self, key: &[u8], data: &[u8]) -> Vec<u8>;

    /// Execute a read of `key` against the currently applied state.
    fn read(&self, key: &[u8]) -> Vec<u8>;
}
