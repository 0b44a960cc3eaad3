//! Observed-remove set with tombstones for presence tracking.
//!
//! This is a delta-state CRDT in the spirit of Phoenix.Tracker.State:
//! - Every add and every removal is stamped with a unique [`Tag`] (dot)
//! - A [`CausalContext`] records every dot a replica has observed
//! - Removals leave a tombstone keyed by the removed entry's dot
//! - A removal also marks the removed dot as observed, so a late or duplicated
//!   add for the same entry is ignored even after its tombstone is collected
//! - Per-node purge floors implement node-down bulk removal
//!
//! Merging is a join: commutative, associative and idempotent. Two replicas
//! that have merged the same deltas, in any order and any number of times,
//! expose the same visible entries.

use crate::clock::{CausalContext, Clock, NodeId, Tag, VersionVector};
use crate::types::{Metadata, PresenceMeta, PresenceRef, Presences};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// A tracked presence entry with CRDT semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntry {
    /// The topic this entry belongs to.
    pub topic: String,
    /// The key identifying this presence within the topic.
    pub key: String,
    /// Caller-facing reference.
    pub presence_ref: PresenceRef,
    /// The ref this entry replaced, for updates.
    pub prev_ref: Option<PresenceRef>,
    /// Caller supplied metadata.
    pub metadata: Metadata,
    /// Unique tag for conflict resolution.
    pub tag: Tag,
}

impl TrackedEntry {
    /// Public view of this entry.
    pub fn to_meta(&self) -> PresenceMeta {
        PresenceMeta {
            presence_ref: self.presence_ref.clone(),
            prev_ref: self.prev_ref.clone(),
            node: self.tag.node.clone(),
            metadata: self.metadata.clone(),
            tag: self.tag.clone(),
        }
    }
}

/// Removal of a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    /// Topic of the removed entry.
    pub topic: String,
    /// Key of the removed entry.
    pub key: String,
    /// Tag of the removed entry.
    pub tag: Tag,
    /// Tag of the removal itself.
    pub removed: Tag,
}

/// A local mutation against this node's own contribution.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Add a new entry under the given key.
    Track {
        /// The key to track.
        key: String,
        /// The ref for the new entry.
        presence_ref: PresenceRef,
        /// Metadata for the new entry.
        metadata: Metadata,
    },
    /// Remove the entry with this tag.
    Untrack {
        /// Tag of the entry to remove.
        tag: Tag,
    },
    /// Replace the entry with this tag by a fresh one under the same key.
    Update {
        /// Tag of the entry to replace.
        tag: Tag,
        /// The ref for the replacement.
        presence_ref: PresenceRef,
        /// Metadata for the replacement.
        metadata: Metadata,
    },
}

/// Incremental changes produced by one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Entries that joined.
    pub adds: Vec<TrackedEntry>,
    /// Entries that left.
    pub removals: Vec<Removal>,
}

impl Delta {
    /// Check if the delta is empty.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removals.is_empty()
    }

    /// Append another delta.
    pub fn extend(&mut self, other: Delta) {
        self.adds.extend(other.adds);
        self.removals.extend(other.removals);
    }

    /// Topics touched by this delta.
    pub fn topics(&self) -> BTreeSet<&str> {
        self.adds
            .iter()
            .map(|e| e.topic.as_str())
            .chain(self.removals.iter().map(|r| r.topic.as_str()))
            .collect()
    }
}

/// Full replica state, used for initial and recovery sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every live entry.
    pub entries: Vec<TrackedEntry>,
    /// Every tombstone not yet collected.
    pub tombstones: Vec<Removal>,
    /// Everything the sender has observed.
    pub context: CausalContext,
    /// Node-down purge floors.
    pub floors: BTreeMap<NodeId, u64>,
}

#[derive(Debug, Clone)]
struct Tombstone {
    removal: Removal,
    recorded_at: Instant,
}

/// CRDT state for presence tracking on one node.
///
/// Provides conflict-free replicated presence tracking with:
/// - Unique tagging of entries for deduplication
/// - Causal context for ordering and for ignoring stale adds
/// - Delta-based synchronization with a pending outgoing buffer
/// - Node-down purging through replicated floors
pub struct ReplicaStore {
    /// Our logical clock.
    clock: Clock,
    /// Every dot this replica has observed.
    context: CausalContext,
    /// Live entries by tag.
    entries: HashMap<Tag, TrackedEntry>,
    /// topic -> key -> tags, in the order entries became visible.
    index: HashMap<String, BTreeMap<String, Vec<Tag>>>,
    /// Tombstones by the removed entry's tag.
    tombstones: HashMap<Tag, Tombstone>,
    /// Per-node purge floors: every dot at or below is gone for good.
    floors: BTreeMap<NodeId, u64>,
    /// Pending delta since last broadcast.
    pending: Delta,
    /// Topics whose visible state changed since last drained.
    dirty: BTreeSet<String>,
    /// Own entries removed by a purge floor since last drained.
    purged_local: Vec<Tag>,
}

impl ReplicaStore {
    /// Create new CRDT state for the given node.
    pub fn new(node: NodeId) -> Self {
        Self {
            clock: Clock::new(node),
            context: CausalContext::new(),
            entries: HashMap::new(),
            index: HashMap::new(),
            tombstones: HashMap::new(),
            floors: BTreeMap::new(),
            pending: Delta::default(),
            dirty: BTreeSet::new(),
            purged_local: Vec::new(),
        }
    }

    /// Our node id.
    pub fn node(&self) -> &NodeId {
        self.clock.node()
    }

    /// Our last issued counter.
    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    /// Current causal context.
    pub fn context(&self) -> &CausalContext {
        &self.context
    }

    /// Contiguous version vector, used as the acknowledgement in heartbeats.
    pub fn version(&self) -> &VersionVector {
        self.context.version()
    }

    /// Node-down purge floors.
    pub fn floors(&self) -> &BTreeMap<NodeId, u64> {
        &self.floors
    }

    /// Record a local mutation and return the delta to propagate.
    ///
    /// `Untrack` and `Update` of an entry that is not live under `topic`
    /// produce an empty delta. For `Track` and `Update` the returned delta's
    /// single add is the new entry.
    pub fn apply_local(&mut self, topic: &str, mutation: Mutation) -> Delta {
        let mut delta = Delta::default();

        match mutation {
            Mutation::Track {
                key,
                presence_ref,
                metadata,
            } => {
                let entry = self.new_entry(topic, key, presence_ref, None, metadata);
                delta.adds.push(entry);
            }
            Mutation::Untrack { tag } => {
                if let Some(removal) = self.remove_local(topic, &tag) {
                    delta.removals.push(removal);
                }
            }
            Mutation::Update {
                tag,
                presence_ref,
                metadata,
            } => {
                let prev_ref = self.entries.get(&tag).map(|e| e.presence_ref.clone());
                if let Some(removal) = self.remove_local(topic, &tag) {
                    let key = removal.key.clone();
                    delta.removals.push(removal);
                    let entry = self.new_entry(topic, key, presence_ref, prev_ref, metadata);
                    delta.adds.push(entry);
                }
            }
        }

        self.pending.extend(delta.clone());
        delta
    }

    fn new_entry(
        &mut self,
        topic: &str,
        key: String,
        presence_ref: PresenceRef,
        prev_ref: Option<PresenceRef>,
        metadata: Metadata,
    ) -> TrackedEntry {
        let tag = self.clock.tick();
        self.context.insert(tag.clone());

        let entry = TrackedEntry {
            topic: topic.to_string(),
            key,
            presence_ref,
            prev_ref,
            metadata,
            tag,
        };
        self.insert_entry(entry.clone());
        entry
    }

    fn remove_local(&mut self, topic: &str, tag: &Tag) -> Option<Removal> {
        if tag.node != *self.node() {
            return None;
        }
        match self.entries.get(tag) {
            Some(entry) if entry.topic == topic => {}
            _ => return None,
        }

        let removed = self.clock.tick();
        self.context.insert(removed.clone());
        let entry = self.remove_entry(tag)?;

        let removal = Removal {
            topic: entry.topic,
            key: entry.key,
            tag: tag.clone(),
            removed,
        };
        self.tombstones.insert(
            tag.clone(),
            Tombstone {
                removal: removal.clone(),
                recorded_at: Instant::now(),
            },
        );
        Some(removal)
    }

    /// Merge a remote delta.
    ///
    /// Returns whether the visible state of any topic changed.
    pub fn merge(&mut self, delta: &Delta) -> bool {
        let mut changed = false;

        // Process removals first so an add and its removal in the same batch
        // never flash into view.
        for removal in &delta.removals {
            changed |= self.apply_removal(removal);
        }
        for entry in &delta.adds {
            changed |= self.apply_add(entry);
        }

        changed
    }

    /// Snapshot of everything this replica knows.
    pub fn full_state(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.values().cloned().collect(),
            tombstones: self
                .tombstones
                .values()
                .map(|t| t.removal.clone())
                .collect(),
            context: self.context.clone(),
            floors: self.floors.clone(),
        }
    }

    /// Merge a peer's full state.
    ///
    /// Besides joining entries, tombstones and floors, this drops remote
    /// entries the sender has observed but no longer holds: they were removed
    /// there and the tombstone has already been collected.
    pub fn merge_full_state(&mut self, snapshot: &Snapshot) -> bool {
        let mut changed = false;

        for (node, &floor) in &snapshot.floors {
            changed |= self.purge_node(node, floor);
        }
        for removal in &snapshot.tombstones {
            changed |= self.apply_removal(removal);
        }
        for entry in &snapshot.entries {
            changed |= self.apply_add(entry);
        }

        let live: HashSet<&Tag> = snapshot.entries.iter().map(|e| &e.tag).collect();
        let own = self.node().clone();
        let stale: Vec<Tag> = self
            .entries
            .keys()
            .filter(|tag| tag.node != own && snapshot.context.contains(tag) && !live.contains(tag))
            .cloned()
            .collect();
        for tag in stale {
            self.remove_entry(&tag);
            changed = true;
        }

        self.context.merge(&snapshot.context);
        changed
    }

    /// Own adds and removals the holder of `version` has not seen yet.
    pub fn extract_since(&self, version: u64) -> Delta {
        let own = self.node();
        let mut adds: Vec<TrackedEntry> = self
            .entries
            .values()
            .filter(|e| e.tag.node == *own && e.tag.clock > version)
            .cloned()
            .collect();
        adds.sort_by(|a, b| a.tag.cmp(&b.tag));

        let mut removals: Vec<Removal> = self
            .tombstones
            .values()
            .filter(|t| t.removal.removed.node == *own && t.removal.removed.clock > version)
            .map(|t| t.removal.clone())
            .collect();
        removals.sort_by(|a, b| a.removed.cmp(&b.removed));

        Delta { adds, removals }
    }

    /// Bulk-remove everything `node` contributed up to `floor`.
    ///
    /// The floor is replicated and max-merged. Returns whether visible state
    /// changed.
    pub fn purge_node(&mut self, node: &NodeId, floor: u64) -> bool {
        if floor <= self.floors.get(node).copied().unwrap_or(0) {
            return false;
        }
        self.floors.insert(node.clone(), floor);
        self.context.raise(node, floor);

        let is_local = node == self.node();
        if is_local {
            self.clock.advance_to(floor);
        }

        let doomed: Vec<Tag> = self
            .entries
            .keys()
            .filter(|t| t.node == *node && t.clock <= floor)
            .cloned()
            .collect();
        let changed = !doomed.is_empty();
        for tag in doomed {
            self.remove_entry(&tag);
            if is_local {
                self.purged_local.push(tag);
            }
        }

        self.tombstones
            .retain(|_, t| !(t.removal.removed.node == *node && t.removal.removed.clock <= floor));

        changed
    }

    /// Highest dot observed from `node`.
    pub fn max_seen(&self, node: &NodeId) -> u64 {
        self.context.max_seen(node)
    }

    /// Collect tombstones older than `grace` whose removal every peer has
    /// acknowledged.
    ///
    /// Returns the number of tombstones collected.
    pub fn collect_garbage<F>(&mut self, grace: Duration, acknowledged: F) -> usize
    where
        F: Fn(&Tag) -> bool,
    {
        let now = Instant::now();
        let before = self.tombstones.len();
        self.tombstones.retain(|_, t| {
            now.duration_since(t.recorded_at) < grace || !acknowledged(&t.removal.removed)
        });
        before - self.tombstones.len()
    }

    fn apply_add(&mut self, entry: &TrackedEntry) -> bool {
        if self.context.contains(&entry.tag) {
            return false;
        }
        self.context.insert(entry.tag.clone());
        if self.tombstones.contains_key(&entry.tag) {
            return false;
        }
        self.insert_entry(entry.clone());
        true
    }

    fn apply_removal(&mut self, removal: &Removal) -> bool {
        if self.context.contains(&removal.removed) {
            return false;
        }
        self.context.insert(removal.removed.clone());
        self.context.insert(removal.tag.clone());

        let removed = self.remove_entry(&removal.tag);
        self.tombstones.insert(
            removal.tag.clone(),
            Tombstone {
                removal: removal.clone(),
                recorded_at: Instant::now(),
            },
        );
        removed.is_some()
    }

    fn insert_entry(&mut self, entry: TrackedEntry) {
        self.index
            .entry(entry.topic.clone())
            .or_default()
            .entry(entry.key.clone())
            .or_default()
            .push(entry.tag.clone());
        self.dirty.insert(entry.topic.clone());
        self.entries.insert(entry.tag.clone(), entry);
    }

    fn remove_entry(&mut self, tag: &Tag) -> Option<TrackedEntry> {
        let entry = self.entries.remove(tag)?;

        if let Some(keys) = self.index.get_mut(&entry.topic) {
            if let Some(tags) = keys.get_mut(&entry.key) {
                tags.retain(|t| t != tag);
                if tags.is_empty() {
                    keys.remove(&entry.key);
                }
            }
            if keys.is_empty() {
                self.index.remove(&entry.topic);
            }
        }
        self.dirty.insert(entry.topic.clone());
        Some(entry)
    }

    /// List all presences for a topic.
    pub fn list(&self, topic: &str) -> Presences {
        let Some(keys) = self.index.get(topic) else {
            return Presences::new();
        };
        keys.iter()
            .map(|(key, tags)| {
                let metas = tags
                    .iter()
                    .filter_map(|t| self.entries.get(t))
                    .map(TrackedEntry::to_meta)
                    .collect();
                (key.clone(), metas)
            })
            .collect()
    }

    /// Entries for one key, in visibility order.
    pub fn get(&self, topic: &str, key: &str) -> Vec<PresenceMeta> {
        self.index
            .get(topic)
            .and_then(|keys| keys.get(key))
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| self.entries.get(t))
                    .map(TrackedEntry::to_meta)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterate over all live entries.
    pub fn entries(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.values()
    }

    /// Topics with at least one live entry.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.index.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Get pending delta and reset it.
    pub fn take_delta(&mut self) -> Option<Delta> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Check if there are pending changes.
    pub fn has_delta(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Topics whose visible state changed since the last call.
    pub fn take_dirty(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.dirty)
    }

    /// Own entries removed by a purge floor since the last call.
    pub fn take_purged_local(&mut self) -> Vec<Tag> {
        std::mem::take(&mut self.purged_local)
    }

    /// Number of retained tombstones.
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
