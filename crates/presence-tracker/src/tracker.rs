//! Registry of presences created on this node.
//!
//! The local tracker is the single writer for this node's contribution. It
//! validates caller refs, turns `track`/`update`/`untrack` into store
//! mutations and binds every ref to a liveness watcher task.

use crate::clock::Tag;
use crate::error::{Result, TrackerError};
use crate::liveness::LivenessHandle;
use crate::state::{Delta, Mutation, ReplicaStore};
use crate::types::{Metadata, PresenceRef};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Identifies one liveness binding. Survives `update`, which swaps the ref.
pub type BindingId = u64;

/// A presence owned by this node.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPresence {
    /// Topic the presence lives under.
    pub topic: String,
    /// Key the presence lives under.
    pub key: String,
    /// Tag of the live entry in the store.
    pub tag: Tag,
    /// Liveness binding of the entry.
    pub binding: BindingId,
}

struct Binding {
    presence_ref: PresenceRef,
    watcher: JoinHandle<()>,
}

/// Per-node registry of local presences and their liveness watchers.
pub struct LocalTracker {
    refs: HashMap<PresenceRef, LocalPresence>,
    by_tag: HashMap<Tag, PresenceRef>,
    bindings: HashMap<BindingId, Binding>,
    next_binding: BindingId,
    terminated_tx: mpsc::UnboundedSender<BindingId>,
}

impl LocalTracker {
    /// Create a tracker reporting terminated bindings on `terminated_tx`.
    pub fn new(terminated_tx: mpsc::UnboundedSender<BindingId>) -> Self {
        Self {
            refs: HashMap::new(),
            by_tag: HashMap::new(),
            bindings: HashMap::new(),
            next_binding: 0,
            terminated_tx,
        }
    }

    /// Track a new presence and bind it to `liveness`.
    ///
    /// Fails with `DuplicateRef` when `presence_ref` is already live here.
    pub fn track(
        &mut self,
        store: &mut ReplicaStore,
        presence_ref: Option<PresenceRef>,
        topic: &str,
        key: &str,
        metadata: Metadata,
        liveness: Box<dyn LivenessHandle>,
    ) -> Result<(PresenceRef, Delta)> {
        let presence_ref = presence_ref.unwrap_or_default();
        if self.refs.contains_key(&presence_ref) {
            return Err(TrackerError::DuplicateRef(presence_ref));
        }

        let delta = store.apply_local(
            topic,
            Mutation::Track {
                key: key.to_string(),
                presence_ref: presence_ref.clone(),
                metadata,
            },
        );
        let tag = added_tag(&delta, &presence_ref)?;

        let binding = self.next_binding;
        self.next_binding += 1;

        let tx = self.terminated_tx.clone();
        let watcher = tokio::spawn(async move {
            liveness.terminated().await;
            let _ = tx.send(binding);
        });
        self.bindings.insert(
            binding,
            Binding {
                presence_ref: presence_ref.clone(),
                watcher,
            },
        );

        self.by_tag.insert(tag.clone(), presence_ref.clone());
        self.refs.insert(
            presence_ref.clone(),
            LocalPresence {
                topic: topic.to_string(),
                key: key.to_string(),
                tag,
                binding,
            },
        );

        tracing::debug!(
            topic = %topic,
            key = %key,
            presence_ref = %presence_ref,
            binding,
            "tracked local presence"
        );

        Ok((presence_ref, delta))
    }

    /// Replace a presence's metadata under a fresh ref.
    ///
    /// The old ref is invalid as soon as this returns; the liveness binding
    /// carries over to the new ref.
    pub fn update(
        &mut self,
        store: &mut ReplicaStore,
        presence_ref: &PresenceRef,
        metadata: Metadata,
    ) -> Result<(PresenceRef, Delta)> {
        let Some(local) = self.refs.remove(presence_ref) else {
            return Err(TrackerError::UnknownRef(presence_ref.clone()));
        };
        self.by_tag.remove(&local.tag);

        let new_ref = PresenceRef::new();
        let delta = store.apply_local(
            &local.topic,
            Mutation::Update {
                tag: local.tag.clone(),
                presence_ref: new_ref.clone(),
                metadata,
            },
        );
        let tag = match added_tag(&delta, presence_ref) {
            Ok(tag) => tag,
            Err(err) => {
                // The entry vanished underneath us (purged); drop the binding.
                self.drop_binding(local.binding);
                return Err(err);
            }
        };

        if let Some(binding) = self.bindings.get_mut(&local.binding) {
            binding.presence_ref = new_ref.clone();
        }
        self.by_tag.insert(tag.clone(), new_ref.clone());
        self.refs.insert(
            new_ref.clone(),
            LocalPresence {
                tag,
                ..local
            },
        );

        Ok((new_ref, delta))
    }

    /// Untrack a presence. Unknown refs are a no-op and yield an empty delta.
    pub fn untrack(&mut self, store: &mut ReplicaStore, presence_ref: &PresenceRef) -> Delta {
        let Some(local) = self.refs.remove(presence_ref) else {
            return Delta::default();
        };
        self.by_tag.remove(&local.tag);
        self.drop_binding(local.binding);

        store.apply_local(&local.topic, Mutation::Untrack { tag: local.tag })
    }

    /// Untrack whatever is currently bound to `binding`, after its liveness
    /// handle terminated. A binding already released is a no-op.
    pub fn liveness_lost(&mut self, store: &mut ReplicaStore, binding: BindingId) -> Delta {
        let Some(bound) = self.bindings.get(&binding) else {
            return Delta::default();
        };
        let presence_ref = bound.presence_ref.clone();

        tracing::debug!(
            presence_ref = %presence_ref,
            binding,
            "liveness handle terminated, untracking"
        );
        self.untrack(store, &presence_ref)
    }

    /// Forget presences the store removed on its own (node-down purge).
    ///
    /// Returns the refs that were dropped.
    pub fn forget_tags(&mut self, tags: &[Tag]) -> Vec<PresenceRef> {
        let mut forgotten = Vec::new();
        for tag in tags {
            let Some(presence_ref) = self.by_tag.remove(tag) else {
                continue;
            };
            if let Some(local) = self.refs.remove(&presence_ref) {
                self.drop_binding(local.binding);
                forgotten.push(presence_ref);
            }
        }
        forgotten
    }

    /// Look up a local presence.
    pub fn get(&self, presence_ref: &PresenceRef) -> Option<&LocalPresence> {
        self.refs.get(presence_ref)
    }

    /// Whether the ref is live on this node.
    pub fn contains(&self, presence_ref: &PresenceRef) -> bool {
        self.refs.contains_key(presence_ref)
    }

    /// Number of local presences.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Whether there are no local presences.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Stop every liveness watcher.
    pub fn shutdown(&mut self) {
        for (_, binding) in self.bindings.drain() {
            binding.watcher.abort();
        }
        self.refs.clear();
        self.by_tag.clear();
    }

    fn drop_binding(&mut self, binding: BindingId) {
        if let Some(binding) = self.bindings.remove(&binding) {
            binding.watcher.abort();
        }
    }
}

impl Drop for LocalTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tag of the entry a track or update produced. No add means the store no
/// longer holds the entry behind `presence_ref`.
fn added_tag(delta: &Delta, presence_ref: &PresenceRef) -> Result<Tag> {
    delta
        .adds
        .first()
        .map(|entry| entry.tag.clone())
        .ok_or_else(|| TrackerError::UnknownRef(presence_ref.clone()))
}
