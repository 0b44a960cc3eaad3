//! The tracker node: public handle plus coordinator task.
//!
//! One coordinator task per node owns the [`ReplicaStore`], the
//! [`LocalTracker`] and the [`Synchronizer`], and is the only thing that ever
//! mutates them. Callers talk to it through a cloneable [`Tracker`] handle:
//! mutations are commands answered over a oneshot channel, while `list` and
//! `get_by_key` read the last published per-topic snapshot directly and never
//! wait on the coordinator.
//!
//! # Example
//!
//! ```no_run
//! use presence_tracker::{LivenessGuard, MemoryNetwork, Metadata, Tracker, TrackerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> presence_tracker::Result<()> {
//! let network = MemoryNetwork::new();
//! let (transport, inbound) = network.join("node-a");
//!
//! let config = TrackerConfig::new(
//!     "node-a",
//!     Duration::from_secs(1),
//!     Duration::from_secs(3),
//!     Duration::from_secs(10),
//!     Duration::from_secs(60),
//! );
//! let tracker = Tracker::start(config, transport)?;
//! tracker.attach_inbound(inbound);
//!
//! let connection = LivenessGuard::new();
//! let presence_ref = tracker
//!     .track(
//!         "room:1",
//!         "user:7",
//!         Metadata::new().with("status", "online"),
//!         connection.watch(),
//!     )
//!     .await?;
//!
//! assert_eq!(tracker.get_by_key("room:1", "user:7")[0].presence_ref, presence_ref);
//! # Ok(())
//! # }
//! ```

use crate::broadcast::{DiffBroadcaster, SubscriberId, Subscription};
use crate::clock::NodeId;
use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::liveness::LivenessHandle;
use crate::protocol;
use crate::state::ReplicaStore;
use crate::sync::{PeerStatus, PeerWriters, Synchronizer};
use crate::tracker::{BindingId, LocalTracker};
use crate::transport::Transport;
use crate::types::{Metadata, PresenceDiff, PresenceMeta, PresenceRef, Presences};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Requests handled by the coordinator.
enum Command {
    Track {
        presence_ref: Option<PresenceRef>,
        topic: String,
        key: String,
        metadata: Metadata,
        liveness: Box<dyn LivenessHandle>,
        reply: oneshot::Sender<Result<PresenceRef>>,
    },
    Update {
        presence_ref: PresenceRef,
        metadata: Metadata,
        reply: oneshot::Sender<Result<PresenceRef>>,
    },
    Untrack {
        presence_ref: PresenceRef,
        reply: oneshot::Sender<()>,
    },
    Receive {
        payload: Vec<u8>,
    },
    Peers {
        reply: oneshot::Sender<BTreeMap<NodeId, PeerStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running tracker node.
///
/// Cheap to clone. The coordinator stops on [`Tracker::shutdown`] or once
/// every handle has been dropped; tasks started by
/// [`Tracker::attach_inbound`] do not keep it alive.
#[derive(Clone)]
pub struct Tracker {
    node: NodeId,
    commands: mpsc::UnboundedSender<Command>,
    broadcaster: Arc<DiffBroadcaster>,
}

impl Tracker {
    /// Validate `config` and spawn the coordinator on the current runtime.
    pub fn start(config: TrackerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        if *transport.local_node() != config.node {
            return Err(TrackerError::InvalidConfig(format!(
                "transport belongs to {}, config is for {}",
                transport.local_node(),
                config.node
            )));
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(DiffBroadcaster::new());

        let coordinator = Coordinator {
            node: config.node.clone(),
            store: ReplicaStore::new(config.node.clone()),
            local: LocalTracker::new(terminated_tx),
            sync: Synchronizer::new(&config),
            writers: PeerWriters::new(Arc::clone(&transport), &config, failures_tx),
            transport,
            broadcaster: Arc::clone(&broadcaster),
            config: config.clone(),
        };

        tracing::info!(node = %config.node, "presence tracker started");
        tokio::spawn(coordinator.run(command_rx, terminated_rx, failures_rx));

        Ok(Self {
            node: config.node,
            commands,
            broadcaster,
        })
    }

    /// This node's id.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Track a presence under a generated ref.
    ///
    /// The presence is untracked automatically once `liveness` terminates.
    pub async fn track(
        &self,
        topic: impl Into<String>,
        key: impl Into<String>,
        metadata: Metadata,
        liveness: impl LivenessHandle,
    ) -> Result<PresenceRef> {
        self.track_inner(None, topic.into(), key.into(), metadata, Box::new(liveness))
            .await
    }

    /// Track a presence under a caller-chosen ref.
    ///
    /// Fails with [`TrackerError::DuplicateRef`] if the ref is already live
    /// on this node.
    pub async fn track_with_ref(
        &self,
        presence_ref: PresenceRef,
        topic: impl Into<String>,
        key: impl Into<String>,
        metadata: Metadata,
        liveness: impl LivenessHandle,
    ) -> Result<PresenceRef> {
        self.track_inner(
            Some(presence_ref),
            topic.into(),
            key.into(),
            metadata,
            Box::new(liveness),
        )
        .await
    }

    async fn track_inner(
        &self,
        presence_ref: Option<PresenceRef>,
        topic: String,
        key: String,
        metadata: Metadata,
        liveness: Box<dyn LivenessHandle>,
    ) -> Result<PresenceRef> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::Track {
                presence_ref,
                topic,
                key,
                metadata,
                liveness,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Replace a presence's metadata. Returns the new ref; the old one is
    /// invalid from now on.
    pub async fn update(&self, presence_ref: &PresenceRef, metadata: Metadata) -> Result<PresenceRef> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::Update {
                presence_ref: presence_ref.clone(),
                metadata,
                reply,
            },
            rx,
        )
        .await?
    }

    /// Untrack a presence. Unknown refs are ignored.
    pub async fn untrack(&self, presence_ref: &PresenceRef) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            Command::Untrack {
                presence_ref: presence_ref.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Presences of `topic`, by key.
    pub fn list(&self, topic: &str) -> Arc<Presences> {
        self.broadcaster.view(topic)
    }

    /// Presences of one key. Empty if the key is not present.
    pub fn get_by_key(&self, topic: &str, key: &str) -> Vec<PresenceMeta> {
        self.broadcaster
            .view(topic)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Topics with at least one presence.
    pub fn list_topics(&self) -> Vec<String> {
        self.broadcaster.topics()
    }

    /// Receive the diffs of `topic` on a channel.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        self.broadcaster.subscribe(topic)
    }

    /// Call `on_diff(topic, diff)` for every change to `topic`.
    ///
    /// The callback runs on the coordinator task and should return quickly.
    pub fn subscribe_with<F>(&self, topic: &str, on_diff: F) -> SubscriberId
    where
        F: Fn(&str, &PresenceDiff) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe_with(topic, Arc::new(on_diff))
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        self.broadcaster.unsubscribe(topic, id);
    }

    /// Hand an inbound payload from the transport to the coordinator.
    ///
    /// Malformed payloads are logged and dropped by the coordinator.
    pub fn receive(&self, payload: Vec<u8>) -> Result<()> {
        self.commands
            .send(Command::Receive { payload })
            .map_err(|_| TrackerError::Shutdown)
    }

    /// Feed every payload from `inbound` to the coordinator until the queue
    /// closes or the tracker stops.
    ///
    /// The task does not count as a handle: dropping every [`Tracker`] still
    /// stops the coordinator.
    pub fn attach_inbound(&self, mut inbound: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
        let commands = self.commands.downgrade();
        tokio::spawn(async move {
            while let Some(payload) = inbound.recv().await {
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands.send(Command::Receive { payload }).is_err() {
                    break;
                }
            }
        })
    }

    /// Synchronization status of every known peer.
    pub async fn peers(&self) -> Result<BTreeMap<NodeId, PeerStatus>> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Peers { reply }, rx).await
    }

    /// Stop the coordinator, its liveness watchers and outbound writers.
    ///
    /// Subscriptions close and later calls fail with
    /// [`TrackerError::Shutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Shutdown { reply }, rx).await
    }

    async fn call<T>(&self, command: Command, rx: oneshot::Receiver<T>) -> Result<T> {
        self.commands
            .send(command)
            .map_err(|_| TrackerError::Shutdown)?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }
}

/// Owner of all mutable state of one node.
struct Coordinator {
    node: NodeId,
    config: TrackerConfig,
    store: ReplicaStore,
    local: LocalTracker,
    sync: Synchronizer,
    writers: PeerWriters,
    transport: Arc<dyn Transport>,
    broadcaster: Arc<DiffBroadcaster>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut terminated: mpsc::UnboundedReceiver<BindingId>,
        mut failures: mpsc::UnboundedReceiver<TrackerError>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut broadcast = tokio::time::interval(self.config.broadcast_period);
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(binding) = terminated.recv() => {
                    self.local.liveness_lost(&mut self.store, binding);
                    self.after_change();
                }
                Some(failure) = failures.recv() => self.handle_failure(failure),
                _ = heartbeat.tick() => self.heartbeat(),
                _ = broadcast.tick() => self.flush(),
            }
        }

        self.stop();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Track {
                presence_ref,
                topic,
                key,
                metadata,
                liveness,
                reply,
            } => {
                let result = self
                    .local
                    .track(&mut self.store, presence_ref, &topic, &key, metadata, liveness)
                    .map(|(presence_ref, _)| presence_ref);
                self.after_change();
                let _ = reply.send(result);
            }
            Command::Update {
                presence_ref,
                metadata,
                reply,
            } => {
                let result = self
                    .local
                    .update(&mut self.store, &presence_ref, metadata)
                    .map(|(presence_ref, _)| presence_ref);
                self.after_change();
                let _ = reply.send(result);
            }
            Command::Untrack {
                presence_ref,
                reply,
            } => {
                self.local.untrack(&mut self.store, &presence_ref);
                self.after_change();
                let _ = reply.send(());
            }
            Command::Receive { payload } => self.receive(payload),
            Command::Peers { reply } => {
                let _ = reply.send(self.sync.peers());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn receive(&mut self, payload: Vec<u8>) {
        let message = match protocol::decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    node = %self.node,
                    bytes = payload.len(),
                    error = %err,
                    "dropping malformed payload"
                );
                return;
            }
        };

        let out = self.sync.handle(&mut self.store, message, Instant::now());
        self.writers.dispatch(out);
        self.after_change();
    }

    fn handle_failure(&mut self, failure: TrackerError) {
        let TrackerError::PeerUnreachable { node, source } = failure else {
            return;
        };
        let before = self.sync.status(&node);
        self.sync.mark_unreachable(&node);
        if before != self.sync.status(&node) {
            tracing::warn!(
                node = %self.node,
                peer = %node,
                error = %source,
                "peer unreachable"
            );
        }
    }

    fn heartbeat(&mut self) {
        self.sync.discover(self.transport.members());
        let out = self.sync.tick(&mut self.store, Instant::now());
        self.writers.dispatch(out);
        self.after_change();
    }

    /// Ship the batched local delta.
    fn flush(&mut self) {
        let Some(delta) = self.store.take_delta() else {
            return;
        };
        tracing::trace!(
            node = %self.node,
            adds = delta.adds.len(),
            removals = delta.removals.len(),
            "broadcasting delta"
        );
        let out = self.sync.delta_messages(delta);
        self.writers.dispatch(out);
    }

    /// Reconcile local bookkeeping and publish changed topics.
    fn after_change(&mut self) {
        let purged = self.store.take_purged_local();
        if !purged.is_empty() {
            let forgotten = self.local.forget_tags(&purged);
            tracing::info!(
                node = %self.node,
                count = forgotten.len(),
                "local presences purged by a node-down floor"
            );
        }

        for topic in self.store.take_dirty() {
            let view = self.store.list(&topic);
            self.broadcaster.publish(&topic, view);
        }
    }

    fn stop(&mut self) {
        self.writers.shutdown();
        self.local.shutdown();
        self.broadcaster.close();
        tracing::info!(node = %self.node, "presence tracker stopped");
    }
}
