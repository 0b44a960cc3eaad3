//! Logical clocks and causal context.
//!
//! Every local mutation is stamped with a [`Tag`] (a *dot*): the node that
//! produced it plus that node's next counter value. A [`CausalContext`]
//! records which dots a replica has observed, compacted into a contiguous
//! [`VersionVector`] plus a small cloud of dots that arrived out of order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of a running tracker instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Highest contiguous counter observed per node.
pub type VersionVector = BTreeMap<NodeId, u64>;

/// Causal tag for a single mutation.
///
/// Tags consist of (node, clock) and are unique across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// The node that produced the mutation.
    pub node: NodeId,
    /// The node's counter value when it did.
    pub clock: u64,
}

impl Tag {
    /// Create a new tag.
    pub fn new(node: impl Into<NodeId>, clock: u64) -> Self {
        Self {
            node: node.into(),
            clock,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.clock)
    }
}

/// Monotonic per-node counter.
#[derive(Debug, Clone)]
pub struct Clock {
    node: NodeId,
    counter: u64,
}

impl Clock {
    /// Create a clock for `node`, starting at zero.
    pub fn new(node: NodeId) -> Self {
        Self { node, counter: 0 }
    }

    /// The node this clock belongs to.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// The last issued counter value.
    pub fn current(&self) -> u64 {
        self.counter
    }

    /// Issue the next tag.
    pub fn tick(&mut self) -> Tag {
        self.counter += 1;
        Tag::new(self.node.clone(), self.counter)
    }

    /// Make sure future tags are issued above `counter`.
    pub fn advance_to(&mut self, counter: u64) {
        if counter > self.counter {
            self.counter = counter;
        }
    }
}

/// The set of dots a replica has observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalContext {
    version: VersionVector,
    cloud: BTreeSet<Tag>,
}

impl CausalContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `tag` has been observed.
    pub fn contains(&self, tag: &Tag) -> bool {
        self.get(&tag.node) >= tag.clock || self.cloud.contains(tag)
    }

    /// Record `tag` as observed.
    pub fn insert(&mut self, tag: Tag) {
        if self.contains(&tag) {
            return;
        }
        let node = tag.node.clone();
        self.cloud.insert(tag);
        self.compact(&node);
    }

    /// Record every dot of `node` up to and including `clock` as observed.
    pub fn raise(&mut self, node: &NodeId, clock: u64) {
        if self.get(node) >= clock {
            return;
        }
        self.version.insert(node.clone(), clock);
        self.compact(node);
    }

    /// Join with another context.
    pub fn merge(&mut self, other: &CausalContext) {
        for (node, &clock) in &other.version {
            if self.get(node) < clock {
                self.version.insert(node.clone(), clock);
            }
        }
        for tag in &other.cloud {
            if !self.contains(tag) {
                self.cloud.insert(tag.clone());
            }
        }
        let nodes: BTreeSet<NodeId> = self
            .version
            .keys()
            .chain(self.cloud.iter().map(|t| &t.node))
            .cloned()
            .collect();
        for node in &nodes {
            self.compact(node);
        }
    }

    /// Highest contiguous counter observed from `node`.
    pub fn get(&self, node: &NodeId) -> u64 {
        self.version.get(node).copied().unwrap_or(0)
    }

    /// Highest counter observed from `node`, contiguous or not.
    pub fn max_seen(&self, node: &NodeId) -> u64 {
        let cloud_max = self
            .cloud
            .range(Tag::new(node.clone(), 0)..=Tag::new(node.clone(), u64::MAX))
            .next_back()
            .map(|t| t.clock)
            .unwrap_or(0);
        self.get(node).max(cloud_max)
    }

    /// The contiguous version vector.
    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Number of out-of-order dots not yet folded into the version vector.
    pub fn cloud_len(&self) -> usize {
        self.cloud.len()
    }

    fn compact(&mut self, node: &NodeId) {
        let mut current = self.get(node);

        // Drop cloud dots already covered by the version vector.
        let covered: Vec<Tag> = self
            .cloud
            .range(Tag::new(node.clone(), 0)..=Tag::new(node.clone(), current))
            .cloned()
            .collect();
        for tag in covered {
            self.cloud.remove(&tag);
        }

        while self.cloud.remove(&Tag::new(node.clone(), current + 1)) {
            current += 1;
        }
        if current > 0 {
            self.version.insert(node.clone(), current);
        }
    }
}
