//! The shared document store: named CRDT containers plus the operation
//! plumbing that keeps replicas convergent.
//!
//! ```text
//! apply_local(container, mutation)        apply_remote(op)
//!        │                                      │
//!        ▼                                      ▼
//! ┌─────────────┐   counter order gate   ┌─────────────┐
//! │ mutate now  │ ◄───────────────────── │ seen / gap? │──► pending buffer
//! │ assign      │                        │ duplicate?  │──► no-op
//! │ (r, n)      │                        └──────┬──────┘
//! └──────┬──────┘                               │
//!        │          both paths                  ▼
//!        └──────────────────────────► subscribers (diffs)
//! ```
//!
//! Operations from one replica are applied in strict counter order; an
//! operation whose predecessor has not arrived is buffered until the gap
//! closes. Operations from different replicas interleave freely — the
//! container merge functions commute, so every interleaving converges.
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Replication)

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::map::LwwMap;
use super::sequence::{ElemId, OrderedSeq, PosKey};
use super::{OpId, ReplicaId, Value};

/// Per-replica counter summary: the highest contiguously-applied counter
/// for every replica this document has heard from (itself included).
pub type StateVector = HashMap<ReplicaId, u64>;

/// One named container inside a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Container {
    Map(LwwMap),
    Sequence(OrderedSeq<Value>),
    Text(OrderedSeq<char>),
}

impl Container {
    fn kind_name(&self) -> &'static str {
        match self {
            Container::Map(_) => "map",
            Container::Sequence(_) => "sequence",
            Container::Text(_) => "text",
        }
    }
}

/// Read snapshot of a container.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerView {
    Map(BTreeMap<String, Value>),
    Sequence(Vec<Value>),
    Text(String),
}

/// Local mutation request, addressed by visible position.
#[derive(Debug, Clone)]
pub enum Mutation {
    MapSet { key: String, value: Value },
    MapRemove { key: String },
    SeqInsert { index: usize, values: Vec<Value> },
    SeqRemove { index: usize, len: usize },
    TextInsert { index: usize, text: String },
    TextRemove { index: usize, len: usize },
}

/// Wire payload of an operation. Sequence payloads carry absolute position
/// keys, so remote application is pure insertion by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpPayload {
    MapWrite { key: String, value: Option<Value> },
    SeqInsert { items: Vec<(ElemId, PosKey, Value)> },
    SeqRemove { ids: Vec<ElemId> },
    TextInsert { items: Vec<(ElemId, PosKey, char)> },
    TextRemove { ids: Vec<ElemId> },
}

impl OpPayload {
    fn kind_name(&self) -> &'static str {
        match self {
            OpPayload::MapWrite { .. } => "map",
            OpPayload::SeqInsert { .. } | OpPayload::SeqRemove { .. } => "sequence",
            OpPayload::TextInsert { .. } | OpPayload::TextRemove { .. } => "text",
        }
    }

    fn empty_container(&self) -> Container {
        match self {
            OpPayload::MapWrite { .. } => Container::Map(LwwMap::new()),
            OpPayload::SeqInsert { .. } | OpPayload::SeqRemove { .. } => {
                Container::Sequence(OrderedSeq::new())
            }
            OpPayload::TextInsert { .. } | OpPayload::TextRemove { .. } => {
                Container::Text(OrderedSeq::new())
            }
        }
    }
}

/// Immutable, causally-dependent mutation record exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub replica: ReplicaId,
    /// Per-replica monotone counter; `(replica, counter)` detects replays.
    pub counter: u64,
    /// Lamport clock at emission, totally ordering LWW writes.
    pub lamport: u64,
    pub container: String,
    pub payload: OpPayload,
}

impl Operation {
    pub fn id(&self) -> OpId {
        OpId::new(self.replica, self.counter)
    }
}

/// Fine-grained change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct DocDiff {
    pub container: String,
    pub kind: DiffKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffKind {
    /// A map key changed; `None` means removed.
    MapEntry { key: String, value: Option<Value> },
    /// Elements spliced in/out of a sequence at a visible index.
    Spliced {
        index: usize,
        removed: usize,
        inserted: Vec<Value>,
    },
    /// Characters spliced in/out of a text container.
    TextSpliced {
        index: usize,
        removed: usize,
        inserted: String,
    },
}

/// Outcome of [`Document::apply_remote`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppliedResult {
    /// Applied (possibly unblocking buffered successors); carries the diffs
    /// produced by this operation itself.
    Applied(Vec<DocDiff>),
    /// Already seen; no effect.
    Duplicate,
    /// Causal predecessor missing; buffered until the gap closes.
    Buffered,
    /// Payload did not fit the target container; dropped with a warning.
    Discarded,
}

/// Document store errors. `ContainerNotFound` and friends are programmer
/// errors surfaced synchronously; everything else in the sync pipeline is
/// recovered without interrupting editing.
#[derive(Debug, Clone, PartialEq)]
pub enum DocError {
    ContainerNotFound(String),
    KindMismatch {
        container: String,
        expected: &'static str,
        actual: &'static str,
    },
    IndexOutOfRange {
        container: String,
        index: usize,
        len: usize,
    },
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::ContainerNotFound(name) => write!(f, "container not found: {name}"),
            DocError::KindMismatch {
                container,
                expected,
                actual,
            } => write!(f, "container {container} is a {actual}, expected {expected}"),
            DocError::IndexOutOfRange {
                container,
                index,
                len,
            } => write!(f, "index {index} out of range for {container} (len {len})"),
            DocError::Serialization(e) => write!(f, "document serialization error: {e}"),
            DocError::Deserialization(e) => write!(f, "document deserialization error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// Counters for monitoring merge health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocStats {
    pub ops_applied: u64,
    pub ops_duplicate: u64,
    pub ops_buffered: u64,
    pub ops_discarded: u64,
}

/// Handle returned by [`Document::subscribe`]; pass back to
/// [`Document::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct PendingOp {
    op: Operation,
    buffered_at: Instant,
}

/// Serialized form of a document (what the durable cache stores).
#[derive(Serialize, Deserialize)]
struct DocState {
    replica: ReplicaId,
    counter: u64,
    lamport: u64,
    containers: HashMap<String, Container>,
    seen: StateVector,
    log: HashMap<ReplicaId, Vec<Operation>>,
}

/// One replica's copy of a collaborative document.
pub struct Document {
    replica: ReplicaId,
    counter: u64,
    lamport: u64,
    containers: HashMap<String, Container>,
    seen: StateVector,
    /// Full operation history per replica, ascending by counter. Serves
    /// sync responses and survives cache round-trips.
    log: HashMap<ReplicaId, Vec<Operation>>,
    /// Operations waiting for a causal predecessor, per replica.
    pending: HashMap<ReplicaId, BTreeMap<u64, PendingOp>>,
    subscribers: Vec<(SubscriptionId, Box<dyn Fn(&DocDiff) + Send>)>,
    next_sub: u64,
    stats: DocStats,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            counter: 0,
            lamport: 0,
            containers: HashMap::new(),
            seen: StateVector::new(),
            log: HashMap::new(),
            pending: HashMap::new(),
            subscribers: Vec::new(),
            next_sub: 0,
            stats: DocStats::default(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    pub fn stats(&self) -> DocStats {
        self.stats
    }

    // ── Typed container accessors ────────────────────────────────────

    /// Map view, creating the container on first use.
    pub fn get_map(&mut self, name: &str) -> Result<BTreeMap<String, Value>, DocError> {
        match self
            .containers
            .entry(name.to_string())
            .or_insert_with(|| Container::Map(LwwMap::new()))
        {
            Container::Map(m) => Ok(m.to_view()),
            other => Err(DocError::KindMismatch {
                container: name.to_string(),
                expected: "map",
                actual: other.kind_name(),
            }),
        }
    }

    /// Sequence view, creating the container on first use.
    pub fn get_sequence(&mut self, name: &str) -> Result<Vec<Value>, DocError> {
        match self
            .containers
            .entry(name.to_string())
            .or_insert_with(|| Container::Sequence(OrderedSeq::new()))
        {
            Container::Sequence(s) => Ok(s.to_vec()),
            other => Err(DocError::KindMismatch {
                container: name.to_string(),
                expected: "sequence",
                actual: other.kind_name(),
            }),
        }
    }

    /// Text view, creating the container on first use.
    pub fn get_text(&mut self, name: &str) -> Result<String, DocError> {
        match self
            .containers
            .entry(name.to_string())
            .or_insert_with(|| Container::Text(OrderedSeq::new()))
        {
            Container::Text(s) => Ok(s.to_vec().into_iter().collect()),
            other => Err(DocError::KindMismatch {
                container: name.to_string(),
                expected: "text",
                actual: other.kind_name(),
            }),
        }
    }

    /// Snapshot of an existing container (does not create).
    pub fn snapshot(&self, name: &str) -> Result<ContainerView, DocError> {
        match self.containers.get(name) {
            None => Err(DocError::ContainerNotFound(name.to_string())),
            Some(Container::Map(m)) => Ok(ContainerView::Map(m.to_view())),
            Some(Container::Sequence(s)) => Ok(ContainerView::Sequence(s.to_vec())),
            Some(Container::Text(s)) => {
                Ok(ContainerView::Text(s.to_vec().into_iter().collect()))
            }
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    // ── Local mutation ───────────────────────────────────────────────

    /// Apply a local mutation immediately (optimistic, never blocks) and
    /// return the operation to hand to the transport.
    ///
    /// Clocks are committed only after the mutation succeeds, so a rejected
    /// call leaves the causal chain untouched and no counter goes unused.
    pub fn apply_local(&mut self, container: &str, mutation: Mutation) -> Result<Operation, DocError> {
        let op_id = OpId::new(self.replica, self.counter + 1);
        let lamport = self.lamport + 1;

        let target = self
            .containers
            .get_mut(container)
            .ok_or_else(|| DocError::ContainerNotFound(container.to_string()))?;

        let out_of_range = |e: super::sequence::OutOfRange| DocError::IndexOutOfRange {
            container: container.to_string(),
            index: e.index,
            len: e.len,
        };

        let (payload, diff) = match (target, mutation) {
            (Container::Map(m), Mutation::MapSet { key, value }) => {
                m.apply_write(&key, Some(value.clone()), lamport, op_id.replica);
                (
                    OpPayload::MapWrite {
                        key: key.clone(),
                        value: Some(value.clone()),
                    },
                    DiffKind::MapEntry {
                        key,
                        value: Some(value),
                    },
                )
            }
            (Container::Map(m), Mutation::MapRemove { key }) => {
                m.apply_write(&key, None, lamport, op_id.replica);
                (
                    OpPayload::MapWrite {
                        key: key.clone(),
                        value: None,
                    },
                    DiffKind::MapEntry { key, value: None },
                )
            }
            (Container::Sequence(s), Mutation::SeqInsert { index, values }) => {
                let items = s
                    .local_insert(index, values.clone(), op_id)
                    .map_err(out_of_range)?;
                (
                    OpPayload::SeqInsert { items },
                    DiffKind::Spliced {
                        index,
                        removed: 0,
                        inserted: values,
                    },
                )
            }
            (Container::Sequence(s), Mutation::SeqRemove { index, len }) => {
                let ids = s.local_delete(index, len, op_id).map_err(out_of_range)?;
                (
                    OpPayload::SeqRemove { ids },
                    DiffKind::Spliced {
                        index,
                        removed: len,
                        inserted: Vec::new(),
                    },
                )
            }
            (Container::Text(s), Mutation::TextInsert { index, text }) => {
                let chars: Vec<char> = text.chars().collect();
                let items = s.local_insert(index, chars, op_id).map_err(out_of_range)?;
                (
                    OpPayload::TextInsert { items },
                    DiffKind::TextSpliced {
                        index,
                        removed: 0,
                        inserted: text,
                    },
                )
            }
            (Container::Text(s), Mutation::TextRemove { index, len }) => {
                let ids = s.local_delete(index, len, op_id).map_err(out_of_range)?;
                (
                    OpPayload::TextRemove { ids },
                    DiffKind::TextSpliced {
                        index,
                        removed: len,
                        inserted: String::new(),
                    },
                )
            }
            (other, m) => {
                let expected = match m {
                    Mutation::MapSet { .. } | Mutation::MapRemove { .. } => "map",
                    Mutation::SeqInsert { .. } | Mutation::SeqRemove { .. } => "sequence",
                    Mutation::TextInsert { .. } | Mutation::TextRemove { .. } => "text",
                };
                return Err(DocError::KindMismatch {
                    container: container.to_string(),
                    expected,
                    actual: other.kind_name(),
                });
            }
        };

        self.counter = op_id.counter;
        self.lamport = lamport;
        let op = Operation {
            replica: op_id.replica,
            counter: op_id.counter,
            lamport,
            container: container.to_string(),
            payload,
        };
        self.seen.insert(self.replica, self.counter);
        self.log.entry(self.replica).or_default().push(op.clone());
        self.stats.ops_applied += 1;

        let diffs = vec![DocDiff {
            container: container.to_string(),
            kind: diff,
        }];
        self.notify(&diffs);
        Ok(op)
    }

    // ── Remote merge ─────────────────────────────────────────────────

    /// Merge a remote operation. Safe to call with duplicates and in any
    /// causally-consistent order; gaps in a replica's counter sequence are
    /// buffered until the missing predecessor arrives.
    pub fn apply_remote(&mut self, op: Operation) -> AppliedResult {
        let seen = self.seen.get(&op.replica).copied().unwrap_or(0);
        if op.counter <= seen {
            self.stats.ops_duplicate += 1;
            return AppliedResult::Duplicate;
        }
        if op.counter > seen + 1 {
            self.stats.ops_buffered += 1;
            self.pending.entry(op.replica).or_default().insert(
                op.counter,
                PendingOp {
                    op,
                    buffered_at: Instant::now(),
                },
            );
            return AppliedResult::Buffered;
        }

        let (mut diffs, discarded) = self.integrate(&op);
        let result = if discarded {
            AppliedResult::Discarded
        } else {
            AppliedResult::Applied(diffs.clone())
        };
        self.advance(op);

        // The gap may have closed for buffered successors.
        diffs.extend(self.drain_pending());
        self.notify(&diffs);
        result
    }

    /// Apply the payload to its container. Returns `(diffs, discarded)`.
    fn integrate(&mut self, op: &Operation) -> (Vec<DocDiff>, bool) {
        let target = self
            .containers
            .entry(op.container.clone())
            .or_insert_with(|| op.payload.empty_container());

        let mut diffs = Vec::new();
        let mut push = |kind: DiffKind| {
            diffs.push(DocDiff {
                container: op.container.clone(),
                kind,
            })
        };

        match (target, &op.payload) {
            (Container::Map(m), OpPayload::MapWrite { key, value }) => {
                if m.apply_write(key, value.clone(), op.lamport, op.replica) {
                    push(DiffKind::MapEntry {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
            (Container::Sequence(s), OpPayload::SeqInsert { items }) => {
                for (index, value) in s.apply_insert(items) {
                    push(DiffKind::Spliced {
                        index,
                        removed: 0,
                        inserted: vec![value],
                    });
                }
            }
            (Container::Sequence(s), OpPayload::SeqRemove { ids }) => {
                for index in s.apply_delete(ids, op.id()) {
                    push(DiffKind::Spliced {
                        index,
                        removed: 1,
                        inserted: Vec::new(),
                    });
                }
            }
            (Container::Text(s), OpPayload::TextInsert { items }) => {
                for (index, ch) in s.apply_insert(items) {
                    push(DiffKind::TextSpliced {
                        index,
                        removed: 0,
                        inserted: ch.to_string(),
                    });
                }
            }
            (Container::Text(s), OpPayload::TextRemove { ids }) => {
                for index in s.apply_delete(ids, op.id()) {
                    push(DiffKind::TextSpliced {
                        index,
                        removed: 1,
                        inserted: String::new(),
                    });
                }
            }
            (other, payload) => {
                // Should not occur given the CRDT design; dropping the
                // operation preserves convergence at worst cost of a lost
                // edit.
                log::warn!(
                    "discarding op ({}, {}) for container {:?}: payload kind {} does not fit {}",
                    op.replica,
                    op.counter,
                    op.container,
                    payload.kind_name(),
                    other.kind_name()
                );
                self.stats.ops_discarded += 1;
                return (diffs, true);
            }
        }
        (diffs, false)
    }

    /// Record an integrated (or deliberately discarded) op as seen.
    fn advance(&mut self, op: Operation) {
        self.seen.insert(op.replica, op.counter);
        self.lamport = self.lamport.max(op.lamport);
        self.stats.ops_applied += 1;
        self.log.entry(op.replica).or_default().push(op);
    }

    /// Apply buffered operations whose causal gap has closed.
    fn drain_pending(&mut self) -> Vec<DocDiff> {
        let mut diffs = Vec::new();
        loop {
            let mut progressed = false;
            let replicas: Vec<ReplicaId> = self.pending.keys().copied().collect();
            for replica in replicas {
                let next_counter = self.seen.get(&replica).copied().unwrap_or(0) + 1;
                let ready = match self.pending.get_mut(&replica) {
                    Some(buf) => buf.remove(&next_counter),
                    None => None,
                };
                if let Some(pending) = ready {
                    let (mut d, _) = self.integrate(&pending.op);
                    self.advance(pending.op);
                    diffs.append(&mut d);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.pending.retain(|_, buf| !buf.is_empty());
        diffs
    }

    /// Number of operations currently buffered awaiting a predecessor.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|b| b.len()).sum()
    }

    /// True if any buffered operation has waited longer than `timeout`.
    /// The session uses this to trigger a full resync instead of waiting
    /// forever on a lost predecessor.
    pub fn has_stale_pending(&self, timeout: Duration) -> bool {
        self.pending
            .values()
            .flat_map(|b| b.values())
            .any(|p| p.buffered_at.elapsed() > timeout)
    }

    // ── Sync exchange ────────────────────────────────────────────────

    pub fn state_vector(&self) -> StateVector {
        self.seen.clone()
    }

    /// Operations the holder of `remote` has not seen yet, per replica in
    /// ascending counter order.
    pub fn missing_ops(&self, remote: &StateVector) -> Vec<Operation> {
        let mut out = Vec::new();
        for (replica, ops) in &self.log {
            let from = remote.get(replica).copied().unwrap_or(0);
            for op in ops {
                if op.counter > from {
                    out.push(op.clone());
                }
            }
        }
        out
    }

    /// Garbage-collect tombstones observed by every replica in `floor`
    /// (the pointwise minimum of all known version vectors). Returns the
    /// number of tombstones dropped.
    pub fn compact(&mut self, floor: &StateVector) -> usize {
        let mut dropped = 0;
        for container in self.containers.values_mut() {
            match container {
                Container::Sequence(s) => dropped += s.compact(floor),
                Container::Text(s) => dropped += s.compact(floor),
                Container::Map(_) => {}
            }
        }
        dropped
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register a diff observer, notified synchronously after each
    /// successful apply. Returns a handle for [`Self::unsubscribe`].
    pub fn subscribe(&mut self, f: impl Fn(&DocDiff) + Send + 'static) -> SubscriptionId {
        self.next_sub += 1;
        let id = SubscriptionId(self.next_sub);
        self.subscribers.push((id, Box::new(f)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    fn notify(&self, diffs: &[DocDiff]) {
        for diff in diffs {
            for (_, f) in &self.subscribers {
                f(diff);
            }
        }
    }

    // ── State codec ──────────────────────────────────────────────────

    /// Serialize the full document (containers, history, clocks) for the
    /// durable cache.
    pub fn encode_state(&self) -> Result<Vec<u8>, DocError> {
        let state = DocState {
            replica: self.replica,
            counter: self.counter,
            lamport: self.lamport,
            containers: self.containers.clone(),
            seen: self.seen.clone(),
            log: self.log.clone(),
        };
        bincode::serde::encode_to_vec(&state, bincode::config::standard())
            .map_err(|e| DocError::Serialization(e.to_string()))
    }

    /// Restore a document from [`Self::encode_state`] output. The restored
    /// replica resumes its identity and counter, so ops emitted after a
    /// reload continue the same causal chain.
    pub fn decode_state(bytes: &[u8]) -> Result<Self, DocError> {
        let (state, _): (DocState, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| DocError::Deserialization(e.to_string()))?;
        Ok(Self {
            replica: state.replica,
            counter: state.counter,
            lamport: state.lamport,
            containers: state.containers,
            seen: state.seen,
            log: state.log,
            pending: HashMap::new(),
            subscribers: Vec::new(),
            next_sub: 0,
            stats: DocStats::default(),
        })
    }
}
