//! Per-topic diffs and local subscribers.
//!
//! The broadcaster keeps the last published view of every topic. After each
//! change the coordinator hands it the new view; the broadcaster diffs it
//! against the old one, swaps the published snapshot and pushes the diff to
//! every subscriber of the topic.

use crate::clock::Tag;
use crate::types::{PresenceDiff, PresenceMeta, Presences};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Callback invoked with `(topic, diff)`.
pub type DiffCallback = Arc<dyn Fn(&str, &PresenceDiff) + Send + Sync>;

/// Identifies a subscriber within a topic.
pub type SubscriberId = u64;

#[derive(Clone)]
enum Sink {
    Channel(mpsc::UnboundedSender<PresenceDiff>),
    Callback(DiffCallback),
}

#[derive(Clone)]
struct Subscriber {
    id: SubscriberId,
    sink: Sink,
}

impl Subscriber {
    /// Deliver a diff. Returns false once the subscriber is gone.
    fn deliver(&self, topic: &str, diff: &PresenceDiff) -> bool {
        match &self.sink {
            Sink::Channel(tx) => tx.send(diff.clone()).is_ok(),
            Sink::Callback(callback) => {
                callback(topic, diff);
                true
            }
        }
    }
}

/// Channel-backed subscription to one topic.
///
/// Dropping it unsubscribes lazily: the broadcaster prunes the closed channel
/// on the next diff for the topic.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<PresenceDiff>,
}

impl Subscription {
    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// This subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next diff. `None` once the tracker has shut down.
    pub async fn recv(&mut self) -> Option<PresenceDiff> {
        self.rx.recv().await
    }

    /// Take a diff if one is already queued.
    pub fn try_recv(&mut self) -> Option<PresenceDiff> {
        self.rx.try_recv().ok()
    }
}

/// Diff `old` against `new` by set difference over entry tags, per key.
///
/// An entry present on only one side becomes a join or a leave under its
/// key. Refs are not compared: two nodes may use the same ref, and a node may
/// reuse a ref after untracking it.
/// A key that keeps some of its entries only reports the entries that moved.
pub fn compute_diff(old: &Presences, new: &Presences) -> PresenceDiff {
    let mut diff = PresenceDiff::default();

    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let before = old.get(key.as_str()).map(Vec::as_slice).unwrap_or_default();
        let after = new.get(key.as_str()).map(Vec::as_slice).unwrap_or_default();

        let joins = missing_from(after, before);
        if !joins.is_empty() {
            diff.joins.insert(key.clone(), joins);
        }
        let leaves = missing_from(before, after);
        if !leaves.is_empty() {
            diff.leaves.insert(key.clone(), leaves);
        }
    }

    diff
}

/// Entries of `from` whose tag does not appear in `other`.
fn missing_from(from: &[PresenceMeta], other: &[PresenceMeta]) -> Vec<PresenceMeta> {
    let tags: BTreeSet<&Tag> = other.iter().map(|m| &m.tag).collect();
    from.iter()
        .filter(|m| !tags.contains(&m.tag))
        .cloned()
        .collect()
}

/// Published topic views plus their subscribers.
#[derive(Default)]
pub struct DiffBroadcaster {
    views: DashMap<String, Arc<Presences>>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl DiffBroadcaster {
    /// Create an empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last published view of `topic`.
    pub fn view(&self, topic: &str) -> Arc<Presences> {
        self.views
            .get(topic)
            .map(|v| Arc::clone(v.value()))
            .unwrap_or_default()
    }

    /// Topics with at least one visible presence, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.views.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Subscribe to `topic` through a channel.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add(topic, Sink::Channel(tx));
        Subscription {
            topic: topic.to_string(),
            id,
            rx,
        }
    }

    /// Subscribe to `topic` with a callback.
    ///
    /// The callback runs on the coordinator task and should return quickly.
    pub fn subscribe_with(&self, topic: &str, callback: DiffCallback) -> SubscriberId {
        self.add(topic, Sink::Callback(callback))
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) {
        let now_empty = match self.subscribers.get_mut(topic) {
            Some(mut subs) => {
                subs.retain(|s| s.id != id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subscribers.remove_if(topic, |_, subs| subs.is_empty());
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Diff `old` against `new` and push the result to every subscriber of
    /// `topic`. Subscribers whose channel has closed are pruned.
    pub fn notify(&self, topic: &str, old: &Presences, new: &Presences) -> PresenceDiff {
        let diff = compute_diff(old, new);
        if diff.is_empty() {
            return diff;
        }

        // Deliver outside the shard lock so callbacks may use the broadcaster.
        let subs: Vec<Subscriber> = self
            .subscribers
            .get(topic)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        let closed: Vec<SubscriberId> = subs
            .iter()
            .filter(|s| !s.deliver(topic, &diff))
            .map(|s| s.id)
            .collect();
        for id in closed {
            self.unsubscribe(topic, id);
        }

        tracing::trace!(
            topic = %topic,
            joins = diff.joins.len(),
            leaves = diff.leaves.len(),
            "broadcast presence diff"
        );
        diff
    }

    /// Publish the new view of `topic` and notify subscribers of the change.
    pub fn publish(&self, topic: &str, new: Presences) -> PresenceDiff {
        let old = self.view(topic);
        let new = Arc::new(new);

        // Swap first so a subscriber reading the view sees the new state.
        if new.is_empty() {
            self.views.remove(topic);
        } else {
            self.views.insert(topic.to_string(), Arc::clone(&new));
        }
        self.notify(topic, &old, &new)
    }

    /// Drop every subscriber, closing all subscription channels.
    pub fn close(&self) {
        self.subscribers.clear();
    }

    fn add(&self, topic: &str, sink: Sink) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        id
    }
}
