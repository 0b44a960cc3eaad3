//! Liveness binding between a presence and whatever owns it.
//!
//! Every tracked presence is bound to a [`LivenessHandle`]. When the handle
//! reports termination the owning node untracks the presence, exactly once,
//! whether or not the caller also untracked it explicitly.
//!
//! The built-in pair is [`LivenessGuard`] (held by the connection or process
//! that owns the presence) and [`LivenessWatch`] (handed to the tracker).
//! Dropping the guard, or calling [`LivenessGuard::close`], terminates every
//! watch created from it.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Anything that can notify the tracker that its owner has terminated.
#[async_trait]
pub trait LivenessHandle: Send + Sync + 'static {
    /// Resolve once the owner has terminated.
    async fn terminated(&self);
}

#[async_trait]
impl LivenessHandle for CancellationToken {
    async fn terminated(&self) {
        self.cancelled().await;
    }
}

/// Owner side of a liveness binding.
#[derive(Debug)]
pub struct LivenessGuard {
    token: CancellationToken,
}

impl LivenessGuard {
    /// Create a new guard.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A watch that terminates together with this guard.
    pub fn watch(&self) -> LivenessWatch {
        LivenessWatch {
            token: self.token.clone(),
        }
    }

    /// Terminate explicitly, e.g. on a clean disconnect.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether the guard has been closed.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for LivenessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Tracker side of a liveness binding.
#[derive(Debug, Clone)]
pub struct LivenessWatch {
    token: CancellationToken,
}

impl LivenessWatch {
    /// Whether the owner has already terminated.
    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
impl LivenessHandle for LivenessWatch {
    async fn terminated(&self) {
        self.token.cancelled().await;
    }
}
