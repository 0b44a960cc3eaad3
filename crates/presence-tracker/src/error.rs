//! Error types for presence tracking.

use crate::clock::NodeId;
use crate::types::PresenceRef;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

/// Errors surfaced by the tracker.
///
/// Only `DuplicateRef`, `UnknownRef`, `InvalidMetadata` and `Shutdown` ever
/// reach callers of `track`/`update`/`untrack`. Peer and payload failures are
/// absorbed by the synchronizer and only show up in logs.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The caller supplied a ref that is already live on this node.
    #[error("duplicate presence ref: {0}")]
    DuplicateRef(PresenceRef),

    /// The ref is not tracked on this node.
    #[error("unknown presence ref: {0}")]
    UnknownRef(PresenceRef),

    /// A peer could not be reached after all send attempts.
    #[error("peer unreachable: {node}: {source}")]
    PeerUnreachable {
        /// The peer that could not be reached.
        node: NodeId,
        /// The last transport failure.
        #[source]
        source: TransportError,
    },

    /// A remote payload could not be decoded.
    #[error("malformed delta: {0}")]
    MalformedDelta(String),

    /// Metadata was not a JSON object or failed to (de)serialize.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The coordinator has stopped.
    #[error("tracker has shut down")]
    Shutdown,
}

impl From<postcard::Error> for TrackerError {
    fn from(err: postcard::Error) -> Self {
        TrackerError::MalformedDelta(err.to_string())
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The destination node is not a member of the cluster.
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// The link to the destination is down.
    #[error("link down: {0}")]
    LinkDown(NodeId),

    /// The destination stopped receiving.
    #[error("connection closed")]
    Closed,

    /// Any other transport specific failure.
    #[error("transport error: {0}")]
    Other(String),
}
