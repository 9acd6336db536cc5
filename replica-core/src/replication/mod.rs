//! Per-peer replication streams.

use std::sync::Arc;

use futures::future::FutureExt;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Interval;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::network::Transport;
use crate::replica::AppendEntriesRequest;
use crate::replica::Entry;
use crate::storage::LogStore;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// The leader-side handle to a spawned replication stream.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    pub repl_tx: mpsc::UnboundedSender<(ReplicationEvent, Span)>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<N: Transport, S: LogStore>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        core_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,
    ) -> Self {
        ReplicationCore::spawn(id, target, term, config, last_log, commit_index, network, storage, core_tx)
    }
}

/// A task responsible for sending replication events to a target peer.
///
/// We do not stack replication requests to a target because that could result in
/// out-of-order delivery. Entries are buffered until a success response arrives,
/// then the next payload goes out.
struct ReplicationCore<N: Transport, S: LogStore> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this node.
    id: NodeId,
    /// The ID of the target peer which replication events are to be sent to.
    target: NodeId,
    /// The leader's term, which never changes during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the replica core.
    core_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,
    /// A channel for receiving events from the replica core.
    repl_rx: mpsc::UnboundedReceiver<(ReplicationEvent, Span)>,

    /// The `Transport` interface.
    network: Arc<N>,
    /// The `LogStore` interface, used read-only for catch-up payloads.
    storage: Arc<S>,

    /// The replica's runtime config.
    config: Arc<Config>,
    /// The configured max payload entries, simply as a usize.
    max_payload_entries: usize,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the entry most recently appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed.
    commit_index: u64,

    /// The index of the next log entry to send.
    ///
    /// Initialized to the leader's last log index + 1. Per the protocol, the value
    /// is walked backwards as rejections come in from a peer whose log diverges,
    /// until the logs line up and replication proceeds (§5.3). The conflict hint in
    /// rejections lets that walk cover a whole conflicting term per round.
    next_index: u64,
    /// The last log id known to be successfully replicated on the target.
    matched: LogId,

    /// A buffer of entries hot off the leader, pending replication.
    replication_buffer: Vec<Arc<Entry>>,
    /// A buffer of entries which are in the process of being sent to the peer.
    ///
    /// Entries stay here until the peer acknowledges the payload, allowing
    /// retransmission in the face of transient errors.
    outbound_buffer: Vec<OutboundEntry>,
    /// The heartbeat ticker ensuring the peer hears from us at a steady rate.
    heartbeat: Interval,
    /// The deadline applied to every outbound RPC.
    heartbeat_timeout: Duration,
}

impl<N: Transport, S: LogStore> ReplicationCore<N, S> {
    /// Spawn a new replication task for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<Config>,
        last_log: LogId,
        commit_index: u64,
        network: Arc<N>,
        storage: Arc<S>,
        core_tx: mpsc::UnboundedSender<(PeerEvent, Span)>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let heartbeat_timeout = Duration::from_millis(config.heartbeat_interval);
        let max_payload_entries = config.max_payload_entries as usize;
        let this = Self {
            id,
            target,
            term,
            core_tx,
            repl_rx,
            network,
            storage,
            config,
            max_payload_entries,
            target_state: TargetReplState::Lagging,
            last_log_index: last_log.index,
            commit_index,
            next_index: last_log.index + 1,
            matched: last_log,
            replication_buffer: Vec::new(),
            outbound_buffer: Vec::new(),
            heartbeat: interval(heartbeat_timeout),
            heartbeat_timeout,
        };

        let _handle = tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // Perform an initial heartbeat.
        self.send_append_entries().await;

        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Lagging => self.lagging_loop().await,
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// The request times out at the heartbeat interval; an expired or failed round
    /// is reported to the core as an unreachable peer and re-attempted on the next
    /// tick.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn send_append_entries(&mut self) {
        // Attempt to fill the send buffer from the replication buffer.
        if self.outbound_buffer.is_empty() {
            let repl_len = self.replication_buffer.len();
            if repl_len > 0 {
                let chunk_size = std::cmp::min(repl_len, self.max_payload_entries);
                self.outbound_buffer.extend(self.replication_buffer.drain(..chunk_size).map(OutboundEntry::Arc));
            }
        }

        // Build the payload to be sent to the peer.
        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id: self.matched,
            leader_commit: self.commit_index,
            entries: self.outbound_buffer.iter().map(|entry| entry.as_ref().clone()).collect(),
        };

        // Send the payload.
        tracing::debug!("start sending append_entries, timeout: {:?}", self.heartbeat_timeout);
        let res = match timeout(self.heartbeat_timeout, self.network.send_append_entries(self.target, payload)).await
        {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                let _ = self.core_tx.send((PeerEvent::Unreachable { target: self.target }, tracing::debug_span!("CH")));
                return;
            }
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                let _ = self.core_tx.send((PeerEvent::Unreachable { target: self.target }, tracing::debug_span!("CH")));
                return;
            }
        };
        let last_log_id = self.outbound_buffer.last().map(|last| last.as_ref().log_id);

        // Once a payload of entries has been accepted, don't send those entries again.
        self.outbound_buffer.clear();

        // Handle success conditions.
        if res.success {
            tracing::debug!("append entries succeeded to {:?}", last_log_id);

            // If this was a proper replication event (entries were sent), then update state.
            if let Some(log_id) = last_log_id {
                self.next_index = log_id.index + 1;
                self.matched = log_id;
                let _ = self.core_tx.send((
                    PeerEvent::UpdateMatched {
                        target: self.target,
                        matched: log_id,
                    },
                    tracing::debug_span!("CH"),
                ));

                // If the peer has fallen too far behind the live feed, switch to
                // catching it up from storage.
                let is_lagging = self
                    .last_log_index
                    .checked_sub(self.matched.index)
                    .map(|diff| diff > self.config.replication_lag_threshold)
                    .unwrap_or(false);
                if is_lagging {
                    self.target_state = TargetReplState::Lagging;
                }
            } else {
                // A plain heartbeat ack still confirms the peer is contactable at
                // the matched position.
                let _ = self.core_tx.send((
                    PeerEvent::UpdateMatched {
                        target: self.target,
                        matched: self.matched,
                    },
                    tracing::debug_span!("CH"),
                ));
            }
            return;
        }

        // Replication was not successful. If a newer term has been returned, the
        // leader must step down.
        if res.term > self.term {
            tracing::debug!({ res.term }, "append entries failed, reverting to follower");
            let _ = self.core_tx.send((
                PeerEvent::HigherTerm {
                    target: self.target,
                    term: res.term,
                },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Shutdown;
            return;
        }

        // Replication was not successful: handle the conflict hint, walking
        // `next_index` back to the peer's last non-conflicting entry.
        if let Some(conflict) = res.conflict_opt {
            tracing::debug!(?conflict, res.term, "append entries failed, handling conflict hint");

            // A hint beyond our own log is a logical error on the peer's side; take
            // no action and let the next round probe again.
            if conflict.log_id.index > self.last_log_index {
                return;
            }
            self.next_index = conflict.log_id.index + 1;
            self.matched = conflict.log_id;

            // A hint of 0 means nothing matches: replicate from the beginning.
            if conflict.log_id.index == 0 {
                self.target_state = TargetReplState::Lagging;
                let _ = self.core_tx.send((
                    PeerEvent::UpdateMatched {
                        target: self.target,
                        matched: self.matched,
                    },
                    tracing::debug_span!("CH"),
                ));
                return;
            }

            // If we hold the hinted entry, our own term for it is authoritative.
            match self.storage.term_at(conflict.log_id.index).await {
                Ok(term) if term > 0 => {
                    self.matched.term = term;
                }
                Ok(_) => {
                    // The hinted entry is below the head of our log, which only
                    // happens once entries have been recycled; this stream cannot
                    // catch the peer up.
                    tracing::warn!(
                        target = self.target,
                        index = conflict.log_id.index,
                        "conflict hint points below the log head, stopping replication to target"
                    );
                    let _ = self
                        .core_tx
                        .send((PeerEvent::Unreachable { target: self.target }, tracing::debug_span!("CH")));
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
                Err(err) => {
                    tracing::error!(error=?err, "error fetching log entry term for conflict hint");
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            let _ = self.core_tx.send((
                PeerEvent::UpdateMatched {
                    target: self.target,
                    matched: self.matched,
                },
                tracing::debug_span!("CH"),
            ));
            self.target_state = TargetReplState::Lagging;
        }
    }

    /// Fully drain the channel coming in from the leader.
    pub(self) fn drain_leader_rx(&mut self, first: ReplicationEvent, span: Span) {
        let mut event_opt = Some((first, span));
        let mut iters = 0;
        loop {
            // Just ensure we don't get stuck draining a REALLY hot replication feed.
            if iters > self.max_payload_entries {
                return;
            }

            let (event, span) = match event_opt.take() {
                Some(event) => event,
                None => return,
            };
            let _ent = span.enter();

            match event {
                ReplicationEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = commit_index;
                }
                ReplicationEvent::Replicate { entry, commit_index } => {
                    self.commit_index = commit_index;
                    self.last_log_index = entry.log_id.index;
                    if self.target_state == TargetReplState::LineRate {
                        self.replication_buffer.push(entry);
                    }
                }
                ReplicationEvent::Terminate => {
                    self.target_state = TargetReplState::Shutdown;
                    return;
                }
            }

            // Attempt to unpack the next event for the next loop iteration.
            if let Some(event_span) = self.repl_rx.recv().now_or_never() {
                event_opt = event_span;
            }
            iters += 1;
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    pub async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            // We always prioritize draining our buffers first.
            let next_buf_index = self
                .outbound_buffer
                .first()
                .map(|entry| entry.as_ref().log_id.index)
                .or_else(|| self.replication_buffer.first().map(|entry| entry.log_id.index));

            // When converting from lagging the buffers were cleared, in which case
            // any uncommitted live entries have to be resent from storage; otherwise
            // they would only replicate once a new client write lands.
            let index = match next_buf_index {
                Some(i) => i,
                None => self.last_log_index + 1,
            };

            // Ensure that our buffered data matches up with `next_index`. New data
            // may have skipped this stream while it was transitioning state; a
            // single fetch from storage puts the stream back on track.
            if self.next_index != index {
                self.frontload_outbound_buffer(self.next_index, index).await;
                if self.target_state != TargetReplState::LineRate {
                    return;
                }

                self.send_append_entries().await;
                continue;
            }

            tokio::select! {
                _ = self.heartbeat.tick() => self.send_append_entries().await,

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_leader_rx(event, span),
                        None => self.target_state = TargetReplState::Shutdown,
                    }
                }
            }
        }
    }

    /// Ensure there are no gaps in the outbound buffer due to transition from lagging.
    ///
    /// Fetches the entries in `[start, stop)` and prepends them.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn frontload_outbound_buffer(&mut self, start: u64, stop: u64) {
        if stop <= start {
            return;
        }
        let entries = match self.storage.entries(start, stop - 1).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error while frontloading outbound buffer");
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        // Prepend.
        self.outbound_buffer.reverse();
        self.outbound_buffer.extend(entries.into_iter().rev().map(OutboundEntry::Raw));
        self.outbound_buffer.reverse();
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "lagging"))]
    pub async fn lagging_loop(&mut self) {
        self.replication_buffer.clear();
        self.outbound_buffer.clear();
        loop {
            if self.target_state != TargetReplState::Lagging {
                return;
            }

            // Prep entries from storage and send them off for replication.
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }
            self.prep_outbound_buffer_from_storage().await;
            self.send_append_entries().await;
            if self.is_up_to_speed() {
                self.target_state = TargetReplState::LineRate;
                return;
            }

            // Check the leader channel to ensure we are staying up-to-date, then loop.
            if let Some(Some((event, span))) = self.repl_rx.recv().now_or_never() {
                self.drain_leader_rx(event, span);
            }
        }
    }

    /// Check if this replication stream is now up-to-speed.
    #[tracing::instrument(level = "trace", skip(self))]
    fn is_up_to_speed(&self) -> bool {
        self.next_index > self.commit_index
    }

    /// Prep the outbound buffer with the next payload of entries to append.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn prep_outbound_buffer_from_storage(&mut self) {
        if !self.outbound_buffer.is_empty() {
            return;
        }

        // Underflow is guarded against by the `is_up_to_speed` check in the outer loop.
        let distance_behind = self.commit_index - self.next_index;

        let is_within_payload_distance = distance_behind < self.max_payload_entries as u64;
        let stop_idx = if is_within_payload_distance {
            // Will continue in lagging state until the outer loop cycles.
            self.target_state = TargetReplState::LineRate;
            self.commit_index
        } else {
            self.next_index + self.max_payload_entries as u64 - 1
        };

        let entries = match self.storage.entries(self.next_index, stop_idx).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error=%err, "error fetching logs from storage");
                self.target_state = TargetReplState::Shutdown;
                return;
            }
        };

        self.outbound_buffer.extend(entries.into_iter().map(OutboundEntry::Raw));
    }
}

/// A type which wraps two possible forms of an outbound entry for replication.
enum OutboundEntry {
    /// An entry owned by an Arc, hot off the replication stream from the leader.
    Arc(Arc<Entry>),
    /// An entry which was fetched directly from storage.
    Raw(Entry),
}

impl AsRef<Entry> for OutboundEntry {
    fn as_ref(&self) -> &Entry {
        match self {
            Self::Arc(inner) => inner.as_ref(),
            Self::Raw(inner) => inner,
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of a replication stream.
#[derive(Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is lagging behind and feeding from storage.
    Lagging,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the leader to a replication stream.
pub(crate) enum ReplicationEvent {
    Replicate {
        /// The new entry which needs to be replicated.
        ///
        /// This entry will always be the most recent entry to have been appended to
        /// the log, so its index is the new last_log_index value.
        entry: Arc<Entry>,
        /// The index of the highest log entry which is known to be committed.
        commit_index: u64,
    },
    /// A message from the leader indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
pub(crate) enum PeerEvent {
    /// The target peer has acknowledged replication up to the given log id.
    UpdateMatched {
        target: NodeId,
        matched: LogId,
    },
    /// The target peer could not be reached within the RPC deadline.
    Unreachable {
        target: NodeId,
    },
    /// The target peer answered with a higher term; the leader must step down.
    HigherTerm {
        target: NodeId,
        term: u64,
    },
}

impl MessageSummary for PeerEvent {
    fn summary(&self) -> String {
        match self {
            PeerEvent::UpdateMatched { target, matched } => {
                format!("UpdateMatched: target: {}, matched: {}", target, matched)
            }
            PeerEvent::Unreachable { target } => format!("Unreachable: target: {}", target),
            PeerEvent::HigherTerm { target, term } => {
                format!("HigherTerm: target: {}, term: {}", target, term)
            }
        }
    }
}
