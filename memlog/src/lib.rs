//! An in-memory implementation of the `replica-core::LogStore` trait, plus a
//! key/value `CommitHandler`.
//!
//! `MemLog` keeps the log, the hard state and an open flag behind async locks and
//! is intended for testing and demonstration: durability extends exactly as far as
//! the process lifetime, but the trait contract (contiguous indexes, idempotent
//! open/close, truncate semantics) is honored precisely so the engine can be
//! exercised against it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use replica_core::replica::Entry;
use replica_core::storage::HardState;
use replica_core::storage::InitialState;
use replica_core::CommitHandler;
use replica_core::LogId;
use replica_core::LogStore;
use tokio::sync::RwLock;

/// An in-memory log store.
pub struct MemLog {
    log: RwLock<BTreeMap<u64, Entry>>,
    hard_state: RwLock<HardState>,
    open: RwLock<bool>,
}

impl MemLog {
    /// Create a new `MemLog` instance.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(BTreeMap::new()),
            hard_state: RwLock::new(HardState::default()),
            open: RwLock::new(false),
        }
    }

    /// Read the current hard state; test inspection helper.
    pub async fn read_hard_state(&self) -> HardState {
        self.hard_state.read().await.clone()
    }

    /// Read a full copy of the log; test inspection helper.
    pub async fn read_log(&self) -> BTreeMap<u64, Entry> {
        self.log.read().await.clone()
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemLog {
    async fn open(&self) -> Result<()> {
        let mut open = self.open.write().await;
        *open = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut open = self.open.write().await;
        *open = false;
        Ok(())
    }

    async fn initial_state(&self) -> Result<InitialState> {
        let log = self.log.read().await;
        let hard_state = self.hard_state.read().await.clone();
        let last_log_id = log.values().next_back().map(|entry| entry.log_id).unwrap_or_else(|| LogId::new(0, 0));
        Ok(InitialState { last_log_id, hard_state })
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let mut hard_state = self.hard_state.write().await;
        *hard_state = hs.clone();
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append(&self, entries: &[&Entry]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            let expected = log.keys().next_back().map(|index| index + 1).unwrap_or(1);
            if entry.log_id.index != expected {
                return Err(anyhow!(
                    "non-contiguous append: index {} where {} was expected",
                    entry.log_id.index,
                    expected
                ));
            }
            log.insert(entry.log_id.index, (*entry).clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn truncate_suffix(&self, from: u64) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&from);
        Ok(())
    }

    async fn entries(&self, from: u64, to: u64) -> Result<Vec<Entry>> {
        let log = self.log.read().await;
        Ok(log.range(from..=to).map(|(_, entry)| entry.clone()).collect())
    }

    async fn term_at(&self, index: u64) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log.get(&index).map(|entry| entry.log_id.term).unwrap_or(0))
    }

    async fn first_index(&self) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log.keys().next().copied().unwrap_or(0))
    }

    async fn last_index(&self) -> Result<u64> {
        let log = self.log.read().await;
        Ok(log.keys().next_back().copied().unwrap_or(0))
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A key/value commit handler over a shared in-memory map.
///
/// Clones share the same map, so a test can keep one handle for inspection while
/// the replica owns another. The handler echoes the written value back as the
/// result buffer, and returns the removed value (or an empty buffer) for deletes.
#[derive(Clone, Default)]
pub struct KvHandler {
    state: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl KvHandler {
    /// Create a new, empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the value of a key; test inspection helper.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state.lock().expect("kv state poisoned").get(key).cloned()
    }

    /// The number of live keys; test inspection helper.
    pub fn len(&self) -> usize {
        self.state.lock().expect("kv state poisoned").len()
    }

    /// Check whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CommitHandler for KvHandler {
    fn commit(&mut self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().expect("kv state poisoned");
        if data.is_empty() {
            state.remove(key).unwrap_or_default()
        } else {
            state.insert(key.to_vec(), data.to_vec());
            data.to_vec()
        }
    }

    fn read(&self, key: &[u8]) -> Vec<u8> {
        self.get(key).unwrap_or_default()
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
