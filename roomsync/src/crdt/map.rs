//! Last-writer-wins map container.
//!
//! Each key independently resolves concurrent writes by a total order over
//! `(lamport, replica)`. Removals are LWW writes of an empty value and keep
//! their timestamp, so a late-arriving older write cannot resurrect a
//! removed key.
//!
//! Reference: Shapiro et al. — CRDTs (2011), LWW-Register composition

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::{ReplicaId, Value};

/// One map slot: the winning value plus the write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSlot {
    /// `None` means the key was removed (LWW tombstone).
    pub value: Option<Value>,
    pub lamport: u64,
    pub replica: ReplicaId,
}

/// Last-writer-wins map keyed by string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LwwMap {
    slots: HashMap<String, MapSlot>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Visible value for a key (`None` if absent or removed).
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.slots.get(key).and_then(|s| s.value.as_ref())
    }

    /// Number of visible (non-removed) keys.
    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a write (set or remove). Returns `true` if the write won and
    /// the visible state changed.
    ///
    /// The incoming write wins when `(lamport, replica)` is strictly greater
    /// than the stored pair; the comparison is the same on every replica, so
    /// concurrent writes resolve identically everywhere.
    pub fn apply_write(
        &mut self,
        key: &str,
        value: Option<Value>,
        lamport: u64,
        replica: ReplicaId,
    ) -> bool {
        match self.slots.get(key) {
            Some(existing) if (existing.lamport, existing.replica) >= (lamport, replica) => false,
            _ => {
                self.slots.insert(
                    key.to_string(),
                    MapSlot {
                        value,
                        lamport,
                        replica,
                    },
                );
                true
            }
        }
    }

    /// Snapshot of all visible entries, ordered by key.
    pub fn to_view(&self) -> BTreeMap<String, Value> {
        self.slots
            .iter()
            .filter_map(|(k, s)| s.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Iterate over visible entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.slots
            .iter()
            .filter_map(|(k, s)| s.value.as_ref().map(|v| (k.as_str(), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_set_and_get() {
        let mut map = LwwMap::new();
        let r = Uuid::new_v4();
        assert!(map.apply_write("title", Some(Value::from("draft")), 1, r));
        assert_eq!(map.get("title"), Some(&Value::from("draft")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_newer_lamport_wins() {
        let mut map = LwwMap::new();
        let r = Uuid::new_v4();
        map.apply_write("k", Some(Value::Int(1)), 5, r);
        assert!(!map.apply_write("k", Some(Value::Int(2)), 3, r));
        assert_eq!(map.get("k"), Some(&Value::Int(1)));

        assert!(map.apply_write("k", Some(Value::Int(3)), 9, r));
        assert_eq!(map.get("k"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_replica_tie_break() {
        let lo = Uuid::from_u128(1);
        let hi = Uuid::from_u128(2);

        // Same lamport from two replicas: higher replica id wins, in either
        // arrival order.
        let mut a = LwwMap::new();
        a.apply_write("k", Some(Value::Int(1)), 7, lo);
        a.apply_write("k", Some(Value::Int(2)), 7, hi);

        let mut b = LwwMap::new();
        b.apply_write("k", Some(Value::Int(2)), 7, hi);
        b.apply_write("k", Some(Value::Int(1)), 7, lo);

        assert_eq!(a.get("k"), Some(&Value::Int(2)));
        assert_eq!(b.get("k"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_remove_is_lww() {
        let mut map = LwwMap::new();
        let r = Uuid::new_v4();
        map.apply_write("k", Some(Value::Int(1)), 1, r);
        map.apply_write("k", None, 2, r);
        assert_eq!(map.get("k"), None);
        assert!(map.is_empty());

        // Older concurrent write does not resurrect the key.
        assert!(!map.apply_write("k", Some(Value::Int(9)), 1, r));
        assert_eq!(map.get("k"), None);
    }

    #[test]
    fn test_view_ordering() {
        let mut map = LwwMap::new();
        let r = Uuid::new_v4();
        map.apply_write("b", Some(Value::Int(2)), 1, r);
        map.apply_write("a", Some(Value::Int(1)), 2, r);
        let view = map.to_view();
        let keys: Vec<_> = view.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
