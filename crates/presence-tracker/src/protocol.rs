//! Inter-node wire messages.
//!
//! Every payload handed to the [`Transport`](crate::transport::Transport) is
//! one postcard-encoded [`SyncMessage`]. Framing is left to the transport.

use crate::clock::{NodeId, VersionVector};
use crate::error::{Result, TrackerError};
use crate::state::{Delta, Snapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages exchanged between tracker nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Periodic liveness signal and acknowledgement.
    Heartbeat {
        /// The sending node.
        from: NodeId,
        /// The sender's last issued counter.
        clock: u64,
        /// Contiguous dots the sender has observed, per node.
        version: VersionVector,
        /// The sender's node-down purge floors.
        floors: BTreeMap<NodeId, u64>,
    },
    /// Incremental changes.
    Delta {
        /// The sending node.
        from: NodeId,
        /// The changes.
        delta: Delta,
    },
    /// Ask the receiver for its full state.
    TransferRequest {
        /// The requesting node.
        from: NodeId,
    },
    /// Reply to a transfer request.
    FullState {
        /// The sending node.
        from: NodeId,
        /// Everything the sender knows.
        snapshot: Snapshot,
    },
}

impl SyncMessage {
    /// The node that sent this message.
    pub fn from(&self) -> &NodeId {
        match self {
            SyncMessage::Heartbeat { from, .. }
            | SyncMessage::Delta { from, .. }
            | SyncMessage::TransferRequest { from }
            | SyncMessage::FullState { from, .. } => from,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Heartbeat { .. } => "heartbeat",
            SyncMessage::Delta { .. } => "delta",
            SyncMessage::TransferRequest { .. } => "transfer_request",
            SyncMessage::FullState { .. } => "full_state",
        }
    }
}

/// Encode a message for the wire.
pub fn encode(msg: &SyncMessage) -> Result<Vec<u8>> {
    postcard::to_allocvec(msg).map_err(|e| TrackerError::MalformedDelta(e.to_string()))
}

/// Decode a message received from the wire.
pub fn decode(bytes: &[u8]) -> Result<SyncMessage> {
    Ok(postcard::from_bytes(bytes)?)
}
