//! Peer synchronization.
//!
//! The [`Synchronizer`] is a pure state machine over peers: it consumes
//! heartbeat ticks and inbound [`SyncMessage`]s, mutates the replica store and
//! returns the messages to send. Actual sending happens in one writer task
//! per peer ([`PeerWriters`]), which retries failed sends and reports peers
//! that stay unreachable.
//!
//! Peer lifecycle:
//!
//! ```text
//! Unknown --first contact--> Syncing --full state--> InSync
//! InSync --silence > suspect_timeout--> Suspect --heartbeat--> InSync
//! Suspect --silence > down_timeout--> Down --heartbeat--> Syncing
//! ```
//!
//! Declaring a peer `Down` records a purge floor at the highest dot seen from
//! it. Floors travel in every heartbeat and full state, so the whole cluster,
//! the purged node included, drops that contribution for good.

use crate::clock::{NodeId, VersionVector};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::protocol::{self, SyncMessage};
use crate::state::{Delta, ReplicaStore};
use crate::transport::Transport;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Consecutive lagging heartbeats before our own dots are re-sent.
const LAG_THRESHOLD: u32 = 2;

/// Synchronization state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Known from membership but never heard from.
    Unknown,
    /// Heard from; waiting for its full state.
    Syncing,
    /// Full state merged and heartbeats arriving.
    InSync,
    /// Heartbeats missing or sends failing; deltas still applied.
    Suspect,
    /// Declared gone; its contribution has been purged.
    Down,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Unknown => "unknown",
            PeerStatus::Syncing => "syncing",
            PeerStatus::InSync => "in_sync",
            PeerStatus::Suspect => "suspect",
            PeerStatus::Down => "down",
        };
        f.write_str(s)
    }
}

/// A message to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    /// Destination node.
    pub to: NodeId,
    /// The message.
    pub message: SyncMessage,
}

#[derive(Debug)]
struct Peer {
    status: PeerStatus,
    last_seen: Option<Instant>,
    /// Whether a full state from this peer has been merged since it was
    /// last declared down.
    synced: bool,
    /// Version vector from the peer's last heartbeat.
    version: VersionVector,
    /// Our clock when the previous heartbeat went out; the peer is expected
    /// to have acknowledged at least this much.
    expected: u64,
    lagging: u32,
}

impl Peer {
    fn new() -> Self {
        Self {
            status: PeerStatus::Unknown,
            last_seen: None,
            synced: false,
            version: VersionVector::new(),
            expected: 0,
            lagging: 0,
        }
    }

    /// Whether this peer's acknowledgements gate tombstone collection.
    fn acknowledges(&self) -> bool {
        matches!(
            self.status,
            PeerStatus::Syncing | PeerStatus::InSync | PeerStatus::Suspect
        )
    }
}

/// Per-node peer state machine.
pub struct Synchronizer {
    node: NodeId,
    peers: BTreeMap<NodeId, Peer>,
    suspect_timeout: Duration,
    down_timeout: Duration,
    tombstone_grace: Duration,
    /// Our clock at the last heartbeat tick.
    last_tick_clock: u64,
}

impl Synchronizer {
    /// Create a synchronizer with no known peers.
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            node: config.node.clone(),
            peers: BTreeMap::new(),
            suspect_timeout: config.suspect_timeout,
            down_timeout: config.down_timeout,
            tombstone_grace: config.tombstone_grace,
            last_tick_clock: 0,
        }
    }

    /// Learn about cluster members. New members start out `Unknown`.
    pub fn discover(&mut self, members: impl IntoIterator<Item = NodeId>) {
        for member in members {
            if member != self.node {
                self.peers.entry(member).or_insert_with(Peer::new);
            }
        }
    }

    /// Status of one peer.
    pub fn status(&self, node: &NodeId) -> Option<PeerStatus> {
        self.peers.get(node).map(|p| p.status)
    }

    /// Status of every known peer.
    pub fn peers(&self) -> BTreeMap<NodeId, PeerStatus> {
        self.peers
            .iter()
            .map(|(node, peer)| (node.clone(), peer.status))
            .collect()
    }

    /// Peers that should receive deltas: everyone not `Down`.
    pub fn broadcast_targets(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|(_, p)| p.status != PeerStatus::Down)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Address a local delta to every broadcast target.
    pub fn delta_messages(&self, delta: Delta) -> Vec<Outgoing> {
        let message = SyncMessage::Delta {
            from: self.node.clone(),
            delta,
        };
        self.broadcast_targets()
            .into_iter()
            .map(|to| Outgoing {
                to,
                message: message.clone(),
            })
            .collect()
    }

    /// Periodic work: failure detection, heartbeats, pending transfer
    /// requests and tombstone collection.
    pub fn tick(&mut self, store: &mut ReplicaStore, now: Instant) -> Vec<Outgoing> {
        self.detect_failures(store, now);

        let mut out = Vec::new();
        let heartbeat = SyncMessage::Heartbeat {
            from: self.node.clone(),
            clock: store.clock(),
            version: store.version().clone(),
            floors: store.floors().clone(),
        };
        for (node, peer) in &self.peers {
            out.push(Outgoing {
                to: node.clone(),
                message: heartbeat.clone(),
            });
            if peer.status == PeerStatus::Syncing {
                out.push(Outgoing {
                    to: node.clone(),
                    message: SyncMessage::TransferRequest {
                        from: self.node.clone(),
                    },
                });
            }
        }
        self.last_tick_clock = store.clock();

        let acks: Vec<&VersionVector> = self
            .peers
            .values()
            .filter(|p| p.acknowledges())
            .map(|p| &p.version)
            .collect();
        let collected = store.collect_garbage(self.tombstone_grace, |tag| {
            acks.iter()
                .all(|version| version.get(&tag.node).copied().unwrap_or(0) >= tag.clock)
        });
        if collected > 0 {
            tracing::debug!(node = %self.node, collected, "collected tombstones");
        }

        out
    }

    /// Handle one inbound message.
    pub fn handle(
        &mut self,
        store: &mut ReplicaStore,
        message: SyncMessage,
        now: Instant,
    ) -> Vec<Outgoing> {
        let from = message.from().clone();
        if from == self.node {
            return Vec::new();
        }

        let mut out = Vec::new();
        self.touch(&from, now, &mut out);

        match message {
            SyncMessage::Heartbeat {
                version, floors, ..
            } => {
                for (node, floor) in &floors {
                    if store.purge_node(node, *floor) {
                        tracing::info!(
                            node = %self.node,
                            purged = %node,
                            floor,
                            via = %from,
                            "applied node-down floor"
                        );
                    }
                }
                if let Some(resend) = self.record_ack(&from, version, store) {
                    out.push(resend);
                }
            }
            SyncMessage::Delta { delta, .. } => {
                let changed = store.merge(&delta);
                tracing::trace!(
                    node = %self.node,
                    from = %from,
                    adds = delta.adds.len(),
                    removals = delta.removals.len(),
                    changed,
                    "merged delta"
                );
            }
            SyncMessage::TransferRequest { .. } => {
                tracing::debug!(node = %self.node, to = %from, "sending full state");
                out.push(Outgoing {
                    to: from.clone(),
                    message: SyncMessage::FullState {
                        from: self.node.clone(),
                        snapshot: store.full_state(),
                    },
                });
            }
            SyncMessage::FullState { snapshot, .. } => {
                let changed = store.merge_full_state(&snapshot);
                tracing::debug!(
                    node = %self.node,
                    from = %from,
                    entries = snapshot.entries.len(),
                    changed,
                    "merged full state"
                );
                if let Some(peer) = self.peers.get_mut(&from) {
                    peer.synced = true;
                    if peer.status == PeerStatus::Syncing {
                        transition(&self.node, &from, peer, PeerStatus::InSync);
                    }
                }
            }
        }

        out
    }

    /// A peer stayed unreachable after every send attempt.
    pub fn mark_unreachable(&mut self, node: &NodeId) {
        let Some(peer) = self.peers.get_mut(node) else {
            return;
        };
        if matches!(peer.status, PeerStatus::InSync | PeerStatus::Syncing) {
            transition(&self.node, node, peer, PeerStatus::Suspect);
        }
    }

    /// Record that `from` is alive, moving it out of `Unknown`, `Suspect`
    /// or `Down`.
    fn touch(&mut self, from: &NodeId, now: Instant, out: &mut Vec<Outgoing>) {
        let node = &self.node;
        let peer = self.peers.entry(from.clone()).or_insert_with(Peer::new);
        peer.last_seen = Some(now);

        match peer.status {
            PeerStatus::Unknown | PeerStatus::Down => {
                peer.synced = false;
                peer.lagging = 0;
                transition(node, from, peer, PeerStatus::Syncing);
                out.push(Outgoing {
                    to: from.clone(),
                    message: SyncMessage::TransferRequest { from: node.clone() },
                });
            }
            PeerStatus::Suspect => {
                let next = if peer.synced {
                    PeerStatus::InSync
                } else {
                    PeerStatus::Syncing
                };
                transition(node, from, peer, next);
            }
            PeerStatus::Syncing | PeerStatus::InSync => {}
        }
    }

    /// Store a peer's acknowledgement and decide whether it needs our dots
    /// again.
    fn record_ack(
        &mut self,
        from: &NodeId,
        version: VersionVector,
        store: &ReplicaStore,
    ) -> Option<Outgoing> {
        let peer = self.peers.get_mut(from)?;
        let acked = version.get(&self.node).copied().unwrap_or(0);
        peer.version = version;

        if acked < peer.expected {
            peer.lagging += 1;
        } else {
            peer.lagging = 0;
        }
        peer.expected = self.last_tick_clock;

        if peer.lagging < LAG_THRESHOLD {
            return None;
        }
        peer.lagging = 0;

        let delta = store.extract_since(acked);
        if delta.is_empty() {
            return None;
        }
        tracing::debug!(
            node = %self.node,
            peer = %from,
            acked,
            adds = delta.adds.len(),
            removals = delta.removals.len(),
            "peer lagging, re-sending own changes"
        );
        Some(Outgoing {
            to: from.clone(),
            message: SyncMessage::Delta {
                from: self.node.clone(),
                delta,
            },
        })
    }

    fn detect_failures(&mut self, store: &mut ReplicaStore, now: Instant) {
        for (node, peer) in self.peers.iter_mut() {
            let Some(last_seen) = peer.last_seen else {
                continue;
            };
            if matches!(peer.status, PeerStatus::Unknown | PeerStatus::Down) {
                continue;
            }

            let silence = now.saturating_duration_since(last_seen);
            if silence >= self.down_timeout {
                transition(&self.node, node, peer, PeerStatus::Down);
                peer.synced = false;

                let floor = store.max_seen(node);
                let changed = store.purge_node(node, floor);
                tracing::info!(
                    node = %self.node,
                    peer = %node,
                    floor,
                    changed,
                    "peer down, purged its presences"
                );
            } else if silence >= self.suspect_timeout && peer.status != PeerStatus::Suspect {
                transition(&self.node, node, peer, PeerStatus::Suspect);
            }
        }
    }
}

fn transition(node: &NodeId, peer_id: &NodeId, peer: &mut Peer, next: PeerStatus) {
    if peer.status == next {
        return;
    }
    tracing::info!(
        node = %node,
        peer = %peer_id,
        from = %peer.status,
        to = %next,
        "peer status changed"
    );
    peer.status = next;
}

/// Per-peer outbound writer tasks.
///
/// Each peer gets its own queue and task so a slow or unreachable peer never
/// delays the others, and messages to one peer keep their order.
pub struct PeerWriters {
    transport: Arc<dyn Transport>,
    writers: HashMap<NodeId, Writer>,
    max_attempts: u32,
    backoff: Duration,
    failures: mpsc::UnboundedSender<TrackerError>,
}

struct Writer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl PeerWriters {
    /// Create writers sending through `transport`. Peers that stay
    /// unreachable are reported on `failures` as `PeerUnreachable`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &TrackerConfig,
        failures: mpsc::UnboundedSender<TrackerError>,
    ) -> Self {
        Self {
            transport,
            writers: HashMap::new(),
            max_attempts: config.max_send_attempts.max(1),
            backoff: config.retry_backoff,
            failures,
        }
    }

    /// Encode and queue every message.
    pub fn dispatch(&mut self, outgoing: Vec<Outgoing>) {
        for Outgoing { to, message } in outgoing {
            match protocol::encode(&message) {
                Ok(payload) => self.send(to, payload),
                Err(err) => {
                    tracing::warn!(to = %to, kind = message.kind(), error = %err, "failed to encode message");
                }
            }
        }
    }

    /// Queue an encoded payload for `to`.
    pub fn send(&mut self, to: NodeId, payload: Vec<u8>) {
        let payload = match self.writers.get(&to) {
            Some(writer) => match writer.tx.send(payload) {
                Ok(()) => return,
                Err(closed) => closed.0,
            },
            None => payload,
        };

        let writer = self.spawn(to.clone());
        let _ = writer.tx.send(payload);
        self.writers.insert(to, writer);
    }

    /// Stop every writer. Queued payloads are discarded.
    pub fn shutdown(&mut self) {
        for (_, writer) in self.writers.drain() {
            writer.task.abort();
        }
    }

    fn spawn(&self, to: NodeId) -> Writer {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let transport = Arc::clone(&self.transport);
        let failures = self.failures.clone();
        let max_attempts = self.max_attempts;
        let backoff = self.backoff;

        let task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let mut attempt = 1;
                let result = loop {
                    match transport.send(&to, payload.clone()).await {
                        Ok(()) => break Ok(()),
                        Err(err) if attempt >= max_attempts => break Err(err),
                        Err(err) => {
                            tracing::trace!(to = %to, attempt, error = %err, "send failed, retrying");
                            attempt += 1;
                            tokio::time::sleep(backoff).await;
                        }
                    }
                };

                if let Err(source) = result {
                    // Heartbeat anti-entropy and resync repair whatever was
                    // queued behind the failure.
                    let mut dropped = 0usize;
                    while rx.try_recv().is_ok() {
                        dropped += 1;
                    }
                    tracing::debug!(
                        to = %to,
                        attempts = max_attempts,
                        dropped,
                        error = %source,
                        "peer unreachable"
                    );
                    let _ = failures.send(TrackerError::PeerUnreachable {
                        node: to.clone(),
                        source,
                    });
                }
            }
        });

        Writer { tx, task }
    }
}

impl Drop for PeerWriters {
    fn drop(&mut self) {
        self.shutdown();
    }
}
