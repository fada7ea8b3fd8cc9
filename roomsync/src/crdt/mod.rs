//! Conflict-free replicated document containers.
//!
//! A [`Document`](doc::Document) owns a set of named containers, each one of:
//!
//! - [`LwwMap`](map::LwwMap) — last-writer-wins map keyed by string
//! - [`OrderedSeq<Value>`](sequence::OrderedSeq) — ordered list with
//!   concurrent insert/delete
//! - [`OrderedSeq<char>`](sequence::OrderedSeq) — text specialization
//!
//! Replicas exchange [`Operation`](doc::Operation)s. Applying the same set of
//! operations in any order (respecting per-replica counter order) converges
//! to the same container state on every replica; re-applying a seen
//! operation is a no-op.
//!
//! Reference: Shapiro et al. — Conflict-free Replicated Data Types (2011)
//! Reference: Kleppmann — DDIA, Chapter 5 (Leaderless Replication)

pub mod doc;
pub mod map;
pub mod sequence;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use doc::{
    AppliedResult, ContainerView, DiffKind, DocDiff, DocError, DocStats, Document, Mutation,
    OpPayload, Operation, StateVector, SubscriptionId,
};
pub use map::LwwMap;
pub use sequence::{ElemId, OrderedSeq, PosKey};

/// A replica is one client's copy of a document plus its operation counter.
pub type ReplicaId = Uuid;

/// Identifier of a single operation: `(replica, counter)`.
///
/// `counter` increases monotonically per replica, forming a Lamport-style
/// causal chain: operation `(r, n)` depends on `(r, n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

/// Scalar value stored in map entries and sequence items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
