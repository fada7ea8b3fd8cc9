//! Ordered sequence container with fractional position keys.
//!
//! Every element carries an absolute position key ([`PosKey`]) allocated
//! between its neighbors at insertion time, so merging is a pure insertion
//! sort by key: no origin tracking, no integration pass, and convergence is
//! a direct consequence of the total key order. Concurrent inserts between
//! the same neighbors produce distinct keys (the inserting replica id is
//! part of the key) and resolve to the same relative order on every replica.
//!
//! A multi-element insert shares one base key and places its elements in a
//! sub-level under it, so a run inserted by one operation never interleaves
//! with a concurrent run at the same position.
//!
//! Deletions tombstone elements (marked, not removed) until
//! [`OrderedSeq::compact`] can prove every replica has observed both the
//! insert and the delete.
//!
//! Reference: Weiss et al. — Logoot (ICDCS 2009)
//! Reference: Nédelec et al. — LSEQ (DocEng 2013)

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{OpId, ReplicaId};

/// Digit step used when appending past the current tail. Small enough to
/// keep digits compact, large enough that interleaved append/insert
/// workloads rarely need a deeper level.
const APPEND_STEP: u64 = 32;

/// Fractional position key: a path of `(digit, replica)` levels.
///
/// Keys order lexicographically, digit first and replica id as tie-break,
/// with a strict prefix sorting before its extensions. The final level of
/// every generated key carries the inserting replica's id, which makes keys
/// globally unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PosKey(Vec<(u64, ReplicaId)>);

impl PosKey {
    /// Allocate a key strictly between `left` and `right` (`None` meaning
    /// the open start/end of the sequence).
    pub fn between(left: Option<&PosKey>, right: Option<&PosKey>, replica: ReplicaId) -> PosKey {
        let lpath: &[(u64, ReplicaId)] = left.map(|k| k.0.as_slice()).unwrap_or(&[]);
        let rpath: &[(u64, ReplicaId)] = right.map(|k| k.0.as_slice()).unwrap_or(&[]);

        let mut path = Vec::new();
        let mut right_bounds = true;
        let mut level = 0usize;
        loop {
            let (ld, lr) = lpath.get(level).copied().unwrap_or((0, Uuid::nil()));
            let rd = if right_bounds {
                rpath.get(level).map(|&(d, _)| d).unwrap_or(u64::MAX)
            } else {
                u64::MAX
            };

            if rd.saturating_sub(ld) > 1 {
                let digit = if rd == u64::MAX {
                    ld.saturating_add(APPEND_STEP).min(u64::MAX - 1)
                } else {
                    ld + (rd - ld) / 2
                };
                path.push((digit, replica));
                return PosKey(path);
            }

            // No room at this level: copy the left component and descend.
            path.push((ld, lr));
            if rd > ld {
                right_bounds = false;
            }
            level += 1;
        }
    }

    /// Extend this key with one sub-level, used to place the elements of a
    /// multi-element insert under a shared base.
    pub fn child(&self, digit: u64, replica: ReplicaId) -> PosKey {
        let mut path = self.0.clone();
        path.push((digit, replica));
        PosKey(path)
    }

    /// Number of levels (mainly interesting for depth diagnostics).
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

/// Identifier of a single sequence element: the inserting operation plus
/// the element's offset within that operation's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElemId {
    pub replica: ReplicaId,
    pub counter: u64,
    pub offset: u32,
}

/// One sequence element. `deleted` records the deleting operation so
/// compaction can prove the delete has been observed everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Elem<T> {
    id: ElemId,
    key: PosKey,
    value: T,
    deleted: Option<OpId>,
}

/// Out-of-range local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfRange {
    pub index: usize,
    pub len: usize,
}

/// Ordered CRDT sequence. `OrderedSeq<Value>` backs list containers and
/// `OrderedSeq<char>` backs text containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedSeq<T> {
    elems: Vec<Elem<T>>,
    /// Deletes that arrived before their target element (cross-replica
    /// reordering). Applied the moment the element is inserted.
    deferred_deletes: HashMap<ElemId, OpId>,
}

impl<T: Clone> OrderedSeq<T> {
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            deferred_deletes: HashMap::new(),
        }
    }

    /// Number of visible (non-tombstoned) elements.
    pub fn visible_len(&self) -> usize {
        self.elems.iter().filter(|e| e.deleted.is_none()).count()
    }

    /// Number of stored elements including tombstones.
    pub fn total_len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len() == 0
    }

    /// Snapshot of the visible elements in order.
    pub fn to_vec(&self) -> Vec<T> {
        self.elems
            .iter()
            .filter(|e| e.deleted.is_none())
            .map(|e| e.value.clone())
            .collect()
    }

    /// Underlying index of the `visible`-th visible element, or the slot
    /// just past the tail when `visible == visible_len`.
    fn underlying_index(&self, visible: usize) -> usize {
        let mut seen = 0;
        for (u, e) in self.elems.iter().enumerate() {
            if e.deleted.is_none() {
                if seen == visible {
                    return u;
                }
                seen += 1;
            }
        }
        self.elems.len()
    }

    fn visible_index_of(&self, underlying: usize) -> usize {
        self.elems[..underlying]
            .iter()
            .filter(|e| e.deleted.is_none())
            .count()
    }

    /// Insert `values` at visible `index`, allocating keys for them.
    ///
    /// Returns the wire items `(id, key, value)` for the operation payload.
    /// Neighbors are taken from the underlying order (tombstones included)
    /// so a freshly allocated key can never collide with a tombstoned one.
    pub fn local_insert(
        &mut self,
        index: usize,
        values: Vec<T>,
        op: OpId,
    ) -> Result<Vec<(ElemId, PosKey, T)>, OutOfRange> {
        let len = self.visible_len();
        if index > len {
            return Err(OutOfRange { index, len });
        }

        let u = self.underlying_index(index);
        let left = if u > 0 {
            Some(self.elems[u - 1].key.clone())
        } else {
            None
        };
        let right = self.elems.get(u).map(|e| e.key.clone());

        let base = PosKey::between(left.as_ref(), right.as_ref(), op.replica);
        let items: Vec<(ElemId, PosKey, T)> = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let id = ElemId {
                    replica: op.replica,
                    counter: op.counter,
                    offset: i as u32,
                };
                (id, base.child(i as u64, op.replica), value)
            })
            .collect();

        for (i, (id, key, value)) in items.iter().enumerate() {
            self.elems.insert(
                u + i,
                Elem {
                    id: *id,
                    key: key.clone(),
                    value: value.clone(),
                    deleted: None,
                },
            );
        }
        Ok(items)
    }

    /// Merge a remote insert. Returns `(visible_index, visible)` per element
    /// actually inserted; elements whose key is already present are skipped
    /// (idempotence).
    pub fn apply_insert(&mut self, items: &[(ElemId, PosKey, T)]) -> Vec<(usize, T)> {
        let mut inserted = Vec::new();
        for (id, key, value) in items {
            let u = match self.elems.binary_search_by(|e| e.key.cmp(key)) {
                Ok(_) => continue,
                Err(u) => u,
            };
            let deleted = self.deferred_deletes.remove(id);
            let visible = deleted.is_none();
            let vis_index = self.visible_index_of(u);
            self.elems.insert(
                u,
                Elem {
                    id: *id,
                    key: key.clone(),
                    value: value.clone(),
                    deleted,
                },
            );
            if visible {
                inserted.push((vis_index, value.clone()));
            }
        }
        inserted
    }

    /// Tombstone `len` visible elements starting at visible `index`.
    ///
    /// Returns the element ids for the operation payload.
    pub fn local_delete(
        &mut self,
        index: usize,
        len: usize,
        op: OpId,
    ) -> Result<Vec<ElemId>, OutOfRange> {
        let visible = self.visible_len();
        if index + len > visible {
            return Err(OutOfRange {
                index: index + len,
                len: visible,
            });
        }

        let mut ids = Vec::with_capacity(len);
        let mut remaining = len;
        let mut seen = 0;
        for e in self.elems.iter_mut() {
            if e.deleted.is_some() {
                continue;
            }
            if seen >= index && remaining > 0 {
                e.deleted = Some(op);
                ids.push(e.id);
                remaining -= 1;
            }
            seen += 1;
            if remaining == 0 && seen > index {
                break;
            }
        }
        Ok(ids)
    }

    /// Merge a remote delete. Returns the visible index each element held
    /// just before it was tombstoned, in application order. Unknown ids are
    /// deferred until their insert arrives.
    pub fn apply_delete(&mut self, ids: &[ElemId], op: OpId) -> Vec<usize> {
        let mut removed = Vec::new();
        for id in ids {
            match self.elems.iter().position(|e| e.id == *id) {
                Some(u) => {
                    if self.elems[u].deleted.is_none() {
                        let vis_index = self.visible_index_of(u);
                        self.elems[u].deleted = Some(op);
                        removed.push(vis_index);
                    }
                }
                None => {
                    self.deferred_deletes.entry(*id).or_insert(op);
                }
            }
        }
        removed
    }

    /// Drop tombstones that every replica is known to have observed.
    ///
    /// `floor` is the pointwise minimum of all known replica version
    /// vectors. A tombstone is removable only when both its insert and its
    /// delete fall at or below the floor, so no replica can still resurrect
    /// or re-deliver it.
    pub fn compact(&mut self, floor: &HashMap<ReplicaId, u64>) -> usize {
        let observed = |replica: ReplicaId, counter: u64| {
            floor.get(&replica).is_some_and(|&c| c >= counter)
        };
        let before = self.elems.len();
        self.elems.retain(|e| match e.deleted {
            Some(del) => {
                !(observed(del.replica, del.counter) && observed(e.id.replica, e.id.counter))
            }
            None => true,
        });
        before - self.elems.len()
    }
}

impl<T: Clone> Default for OrderedSeq<T> {
    fn default() -> Self {
        Self::new()
    }
}
