//! A thin view over the injected `LogStore` used by role code.

use std::sync::Arc;

use anyhow::Result;

use crate::replica::Entry;
use crate::storage::LogStore;

/// The operations role code is allowed to perform against the log.
///
/// This is a deliberately narrow adapter: role handlers append, truncate and read
/// through this view only, so the full breadth of the `LogStore` trait (hard state,
/// lifecycle) stays confined to the core's open/close paths.
pub(crate) struct LogView<S: LogStore> {
    storage: Arc<S>,
}

impl<S: LogStore> LogView<S> {
    pub(crate) fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Append a single entry, returning its index.
    pub(crate) async fn append(&self, entry: &Entry) -> Result<u64> {
        self.storage.append(&[entry]).await?;
        Ok(entry.log_id.index)
    }

    /// Append a batch of entries.
    pub(crate) async fn append_all(&self, entries: &[&Entry]) -> Result<()> {
        self.storage.append(entries).await
    }

    /// Delete all entries with `index >= from`.
    pub(crate) async fn truncate_suffix(&self, from: u64) -> Result<()> {
        self.storage.truncate_suffix(from).await
    }

    /// Fetch the entries in the inclusive range `[from, to]`.
    pub(crate) async fn entries(&self, from: u64, to: u64) -> Result<Vec<Entry>> {
        self.storage.entries(from, to).await
    }

    /// The term of the entry at the given index, or 0 if there is no such entry.
    pub(crate) async fn term_at(&self, index: u64) -> Result<u64> {
        self.storage.term_at(index).await
    }

    /// The index of the first entry in the log, or 0 if the log is empty.
    pub(crate) async fn first_index(&self) -> Result<u64> {
        self.storage.first_index().await
    }

    /// The index of the last entry in the log, or 0 if the log is empty.
    pub(crate) async fn last_index(&self) -> Result<u64> {
        self.storage.last_index().await
    }
}
