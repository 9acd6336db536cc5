//! Term advertisement for upstream partition managers.
//!
//! The provider maps the replica's election outcome into a `Term` descriptor:
//! the epoch, the elected primary, and the ordered follower set truncated to the
//! configured replication factor. Upstream consumers either poll (`get_term`) or
//! register listeners invoked on every change of the descriptor.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::ReplicaError;
use crate::error::ReplicaResult;
use crate::metrics::ReplicaMetrics;
use crate::replica::Replica;
use crate::NodeId;

/// A term descriptor advertised to upstream consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    /// The election epoch.
    pub term: u64,
    /// The elected primary.
    pub leader: NodeId,
    /// The ordered candidate list, primary excluded, truncated to the replication
    /// factor.
    pub followers: Vec<NodeId>,
}

/// A handle identifying a registered term listener.
///
/// Registration hands out the handle; removal by handle is O(1) and avoids any
/// notion of closure equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type TermListener = Box<dyn Fn(&Term) + Send + 'static>;

/// Maps the replica's election outcome into term descriptors for upstream
/// consumers.
pub struct TermProvider {
    rx_metrics: watch::Receiver<ReplicaMetrics>,
    members: Vec<NodeId>,
    replication_factor: Option<u64>,
    listeners: Arc<Mutex<HashMap<u64, TermListener>>>,
    next_listener_id: AtomicU64,
    watcher: JoinHandle<()>,
}

impl TermProvider {
    /// Create a new provider observing the given replica.
    ///
    /// `members` is the stable candidate order used when advertising followers.
    pub fn new(replica: &Replica, config: &Config, members: &BTreeSet<NodeId>) -> Self {
        let members: Vec<_> = members.iter().copied().collect();
        let listeners: Arc<Mutex<HashMap<u64, TermListener>>> = Default::default();
        let rx_metrics = replica.metrics();
        let replication_factor = config.replication_factor;

        let watcher = {
            let mut rx = replica.metrics();
            let members = members.clone();
            let listeners = listeners.clone();
            tokio::spawn(
                async move {
                    let mut last: Option<Term> = None;
                    loop {
                        let current = map_term(&rx.borrow().clone(), &members, replication_factor);
                        if current.is_some() && current != last {
                            if let Some(term) = current.as_ref() {
                                let listeners = listeners.lock().expect("term listener registry poisoned");
                                for listener in listeners.values() {
                                    listener(term);
                                }
                            }
                            last = current;
                        }
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
                .instrument(tracing::debug_span!("term_watcher")),
            )
        };

        Self {
            rx_metrics,
            members,
            replication_factor,
            listeners,
            next_listener_id: AtomicU64::new(0),
            watcher,
        }
    }

    /// Get the current term descriptor, waiting until a leader is known.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_term(&self) -> ReplicaResult<Term> {
        let mut rx = self.rx_metrics.clone();
        loop {
            if let Some(term) = map_term(&rx.borrow().clone(), &self.members, self.replication_factor) {
                return Ok(term);
            }
            rx.changed().await.map_err(|_| ReplicaError::Aborted)?;
        }
    }

    /// Register a listener invoked on each term change. Returns the handle used for
    /// removal.
    pub fn add_listener(&self, listener: impl Fn(&Term) + Send + 'static) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().expect("term listener registry poisoned").insert(id, Box::new(listener));
        ListenerId(id)
    }

    /// Remove a previously registered listener. Returns true if it was present.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.lock().expect("term listener registry poisoned").remove(&id.0).is_some()
    }

    /// Enter the election on behalf of the local member.
    ///
    /// Participation itself starts when the replica is opened; this future resolves
    /// once the election has produced a leader.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn join(&self) -> ReplicaResult<()> {
        self.get_term().await.map(|_| ())
    }

    /// Withdraw from the election.
    ///
    /// Withdrawal is not supported by the election protocol; this is a no-op kept
    /// for interface symmetry with `join`.
    pub async fn leave(&self) -> ReplicaResult<()> {
        Ok(())
    }
}

impl Drop for TermProvider {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

/// Map a metrics snapshot to a term descriptor, if a leader is known.
///
/// Followers are the candidate list with the primary excluded, order preserved,
/// truncated to `min(len, replication_factor)`.
fn map_term(metrics: &ReplicaMetrics, members: &[NodeId], replication_factor: Option<u64>) -> Option<Term> {
    let leader = metrics.current_leader?;
    let mut followers: Vec<_> = members.iter().copied().filter(|member| *member != leader).collect();
    if let Some(factor) = replication_factor {
        followers.truncate(std::cmp::min(followers.len(), factor as usize));
    }
    Some(Term {
        term: metrics.current_term,
        leader,
        followers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RoleKind;

    fn metrics(term: u64, leader: Option<NodeId>) -> ReplicaMetrics {
        ReplicaMetrics {
            id: 1,
            role: RoleKind::Follower,
            current_term: term,
            current_leader: leader,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            recycle_index: 0,
            version: 0,
            recovering: false,
        }
    }

    #[test]
    fn test_map_term_requires_a_leader() {
        assert_eq!(map_term(&metrics(1, None), &[1, 2, 3], None), None);
    }

    #[test]
    fn test_map_term_excludes_the_primary_and_preserves_order() {
        let term = map_term(&metrics(4, Some(2)), &[1, 2, 3], None).unwrap();
        assert_eq!(term.term, 4);
        assert_eq!(term.leader, 2);
        assert_eq!(term.followers, vec![1, 3]);
    }

    #[test]
    fn test_map_term_truncates_to_replication_factor() {
        let term = map_term(&metrics(4, Some(1)), &[1, 2, 3, 4, 5], Some(2)).unwrap();
        assert_eq!(term.followers, vec![2, 3]);

        // A factor larger than the candidate list advertises everyone.
        let term = map_term(&metrics(4, Some(1)), &[1, 2, 3], Some(10)).unwrap();
        assert_eq!(term.followers, vec![2, 3]);
    }
}
