//! Presence types.

use crate::clock::{NodeId, Tag};
use crate::error::{Result, TrackerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A unique reference for a presence entry.
///
/// One is created per `track` call (or supplied by the caller) and is the
/// handle used for `update` and `untrack`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceRef(String);

impl PresenceRef {
    /// Generate a new unique reference.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a PresenceRef from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the ref as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PresenceRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PresenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PresenceRef {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

/// Arbitrary key/value metadata attached to a presence entry.
///
/// Stored as a JSON object. On the wire it travels as JSON text so the
/// enclosing envelope can stay in a compact binary format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Build metadata from a JSON value; it must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(TrackerError::InvalidMetadata(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Build metadata from any serializable struct or map.
    pub fn from_serialize<M: Serialize>(meta: &M) -> Result<Self> {
        let value =
            serde_json::to_value(meta).map_err(|e| TrackerError::InvalidMetadata(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode the metadata into a typed value.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| TrackerError::InvalidMetadata(e.to_string()))
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Metadata {
    type Error = TrackerError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let text = serde_json::to_string(&self.0).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let map = serde_json::from_str(&text).map_err(serde::de::Error::custom)?;
        Ok(Self(map))
    }
}

/// A single visible presence entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Unique reference for this entry.
    pub presence_ref: PresenceRef,
    /// The ref this entry replaced, when it was produced by `update`.
    pub prev_ref: Option<PresenceRef>,
    /// The node that owns this entry.
    pub node: NodeId,
    /// Caller supplied metadata.
    pub metadata: Metadata,
    /// Dot of the entry. Refs are only unique per node and may be reused
    /// after an untrack; the tag identifies the entry cluster-wide.
    pub tag: Tag,
}

/// Presences of one topic grouped by key.
///
/// Keys are sorted; entries under a key keep the order in which they became
/// visible on this node.
pub type Presences = BTreeMap<String, Vec<PresenceMeta>>;

/// A diff representing presence changes on one topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Entries that became visible, by key.
    pub joins: Presences,
    /// Entries that went away, by key.
    pub leaves: Presences,
}

impl PresenceDiff {
    /// Check if the diff is empty.
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }

    /// Apply this diff to a client-side copy of a topic's presences.
    ///
    /// Entries are matched by tag. Joins are applied before leaves so an
    /// update (leave of the old entry, join of the new one) never makes the
    /// key vanish. A key is removed only once its last entry has left.
    pub fn apply_to(&self, state: &mut Presences) {
        for (key, joined) in &self.joins {
            let metas = state.entry(key.clone()).or_default();
            for meta in joined {
                metas.retain(|m| m.tag != meta.tag);
                metas.push(meta.clone());
            }
        }

        for (key, left) in &self.leaves {
            if let Some(metas) = state.get_mut(key) {
                metas.retain(|m| !left.iter().any(|l| l.tag == m.tag));
                if metas.is_empty() {
                    state.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta_on(node: &str, clock: u64, r: &str, status: &str) -> PresenceMeta {
        PresenceMeta {
            presence_ref: PresenceRef::from(r),
            prev_ref: None,
            node: NodeId::new(node),
            metadata: Metadata::new().with("status", status),
            tag: Tag::new(node, clock),
        }
    }

    fn meta(clock: u64, r: &str, status: &str) -> PresenceMeta {
        meta_on("a", clock, r, status)
    }

    #[test]
    fn test_presence_ref_is_unique() {
        assert_ne!(PresenceRef::new(), PresenceRef::new());
    }

    #[test]
    fn test_metadata_requires_object() {
        assert!(Metadata::from_value(json!({"status": "online"})).is_ok());
        assert!(matches!(
            Metadata::from_value(json!(["online"])),
            Err(TrackerError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_metadata_typed_decode() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct UserMeta {
            status: String,
            typing: bool,
        }

        let typed = UserMeta {
            status: "online".into(),
            typing: true,
        };
        let metadata = Metadata::from_serialize(&typed).unwrap();
        assert_eq!(metadata.get("typing"), Some(&json!(true)));
        assert_eq!(metadata.decode::<UserMeta>().unwrap(), typed);
    }

    #[test]
    fn test_metadata_survives_postcard() {
        let metadata = Metadata::new()
            .with("status", "away")
            .with("devices", json!(["phone", "laptop"]));
        let bytes = postcard::to_allocvec(&metadata).unwrap();
        let decoded: Metadata = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_presence_diff_empty() {
        assert!(PresenceDiff::default().is_empty());
    }

    #[test]
    fn test_apply_update_keeps_key() {
        let mut state = Presences::new();
        state.insert("user:7".into(), vec![meta(1, "r1", "online")]);

        let diff = PresenceDiff {
            joins: [("user:7".to_string(), vec![meta(2, "r2", "away")])].into(),
            leaves: [("user:7".to_string(), vec![meta(1, "r1", "online")])].into(),
        };
        diff.apply_to(&mut state);

        assert_eq!(state["user:7"], vec![meta(2, "r2", "away")]);
    }

    #[test]
    fn test_apply_partial_leave() {
        let mut state = Presences::new();
        state.insert(
            "user:7".into(),
            vec![meta(3, "phone", "online"), meta(4, "laptop", "online")],
        );

        let diff = PresenceDiff {
            joins: Presences::new(),
            leaves: [("user:7".to_string(), vec![meta(3, "phone", "online")])].into(),
        };
        diff.apply_to(&mut state);
        assert_eq!(state["user:7"], vec![meta(4, "laptop", "online")]);

        let diff = PresenceDiff {
            joins: Presences::new(),
            leaves: [("user:7".to_string(), vec![meta(4, "laptop", "online")])].into(),
        };
        diff.apply_to(&mut state);
        assert!(!state.contains_key("user:7"));
    }

    #[test]
    fn test_apply_join_keeps_same_ref_from_other_node() {
        let mut state = Presences::new();
        state.insert("user:7".into(), vec![meta_on("b", 1, "conn-1", "online")]);

        let diff = PresenceDiff {
            joins: [("user:7".to_string(), vec![meta_on("a", 1, "conn-1", "away")])].into(),
            leaves: Presences::new(),
        };
        diff.apply_to(&mut state);
        assert_eq!(state["user:7"].len(), 2);

        let diff = PresenceDiff {
            joins: Presences::new(),
            leaves: [("user:7".to_string(), vec![meta_on("a", 1, "conn-1", "away")])].into(),
        };
        diff.apply_to(&mut state);
        assert_eq!(state["user:7"], vec![meta_on("b", 1, "conn-1", "online")]);
    }
}
