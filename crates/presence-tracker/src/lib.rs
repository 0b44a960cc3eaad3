//! # presence-tracker - distributed, conflict-free presence tracking
//!
//! Many independent nodes agree, without central coordination, on who is
//! currently present under a topic. Every presence carries arbitrary
//! metadata, survives network partitions and converges automatically once
//! the partition heals.
//!
//! # Overview
//!
//! - **Clock**: per-node logical counter; every mutation gets a unique dot
//! - **ReplicaStore**: observed-remove set with tombstones, merged by join
//! - **LocalTracker**: the presences this node owns, bound to liveness handles
//! - **Synchronizer**: heartbeats, delta shipping, full-state transfer and
//!   node-down detection over an injected [`Transport`]
//! - **DiffBroadcaster**: `{joins, leaves}` per topic for local subscribers
//!
//! A [`Tracker`] runs all of them inside one coordinator task per node.
//!
//! # Quick Start
//!
//! ```no_run
//! use presence_tracker::{LivenessGuard, MemoryNetwork, Metadata, Tracker, TrackerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> presence_tracker::Result<()> {
//! let network = MemoryNetwork::new();
//! let (transport, inbound) = network.join("node-a");
//! let config = TrackerConfig::from_toml_str(
//!     r#"
//!     node = "node-a"
//!     heartbeat_interval_ms = 1000
//!     suspect_timeout_ms = 3000
//!     down_timeout_ms = 10000
//!     tombstone_grace_ms = 60000
//!     "#,
//! )?;
//!
//! let tracker = Tracker::start(config, transport)?;
//! tracker.attach_inbound(inbound);
//!
//! let mut diffs = tracker.subscribe("room:1");
//! let connection = LivenessGuard::new();
//! tracker
//!     .track("room:1", "user:7", Metadata::new().with("status", "online"), connection.watch())
//!     .await?;
//!
//! let diff = diffs.recv().await;
//! println!("{diff:?}");
//!
//! // Dropping the guard untracks everything bound to it.
//! drop(connection);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Logical clocks, dots and causal context.
pub mod clock;

/// Error types.
pub mod error;

/// Presence refs, metadata and diffs.
pub mod types;

/// The replicated CRDT store.
pub mod state;

/// Liveness handles bound to tracked presences.
pub mod liveness;

/// Registry of presences owned by this node.
pub mod tracker;

/// Per-topic diffs and subscribers.
pub mod broadcast;

/// Inter-node wire messages.
pub mod protocol;

/// Transport seam and in-memory network.
pub mod transport;

/// Peer state machine and outbound writers.
pub mod sync;

/// Tracker handle and coordinator.
pub mod server;

/// Node configuration.
pub mod config;

pub use broadcast::{DiffBroadcaster, SubscriberId, Subscription, compute_diff};
pub use clock::{CausalContext, Clock, NodeId, Tag, VersionVector};
pub use config::TrackerConfig;
pub use error::{Result, TrackerError, TransportError};
pub use liveness::{LivenessGuard, LivenessHandle, LivenessWatch};
pub use protocol::SyncMessage;
pub use server::Tracker;
pub use state::{Delta, Mutation, Removal, ReplicaStore, Snapshot, TrackedEntry};
pub use sync::{Outgoing, PeerStatus, Synchronizer};
pub use tracker::{BindingId, LocalTracker};
pub use transport::{MemoryNetwork, MemoryTransport, Transport};
pub use types::{Metadata, PresenceDiff, PresenceMeta, PresenceRef, Presences};
