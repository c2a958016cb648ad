//! # Intention Records
//!
//! An intention is the ordered record of everything a transaction did: its
//! reads, writes, and deletes, in issue order, together with the snapshot it
//! observed at begin and the token identifying the submitting client. It is
//! sealed and appended to the shared log at commit; conflict detection and
//! replay both consume it from there.
//!
//! ## Issue Order vs. Observation Order
//!
//! The op list preserves issue order because replay must reproduce the
//! transaction's writes exactly. Conflict detection, however, only cares
//! about the *first* observation of each key:
//!
//! - a `Get` or `Delete` of a key the transaction has not yet written
//!   observed the snapshot, so it joins the read set;
//! - a `Get` after a same-transaction `Put` or `Delete` of that key reads
//!   the transaction's own write and cannot be invalidated by a concurrent
//!   writer, so it stays out of the read set;
//! - every `Put` and `Delete` joins the write set.
//!
//! ## Snapshot Field
//!
//! `snapshot` is the exclusive lower bound of the conflict window: the first
//! log position whose effects the transaction did *not* observe. A fresh
//! database hands out snapshot 0.

use hashbrown::HashSet;
use smallvec::SmallVec;

/// A single operation, recorded in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Get(Vec<u8>),
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl Op {
    pub fn key(&self) -> &[u8] {
        match self {
            Op::Get(key) | Op::Put(key, _) | Op::Delete(key) => key,
        }
    }

    /// True for ops that mutate the tree.
    pub fn is_write(&self) -> bool {
        matches!(self, Op::Put(_, _) | Op::Delete(_))
    }
}

/// Ordered record of a transaction's operations plus its snapshot bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intention {
    snapshot: u64,
    token: u64,
    ops: SmallVec<[Op; 8]>,
    pos: Option<u64>,
}

impl Intention {
    pub fn new(snapshot: u64, token: u64) -> Self {
        Self {
            snapshot,
            token,
            ops: SmallVec::new(),
            pos: None,
        }
    }

    /// Reconstructs an intention decoded from the log. The position is
    /// attached separately by the reader that knows where it came from.
    pub fn from_parts(snapshot: u64, token: u64, ops: SmallVec<[Op; 8]>) -> Self {
        Self {
            snapshot,
            token,
            ops,
            pos: None,
        }
    }

    pub fn record_get(&mut self, key: &[u8]) {
        self.ops.push(Op::Get(key.to_vec()));
    }

    pub fn record_put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(Op::Put(key.to_vec(), value.to_vec()));
    }

    pub fn record_delete(&mut self, key: &[u8]) {
        self.ops.push(Op::Delete(key.to_vec()));
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Log position assigned on append; `None` until then.
    pub fn position(&self) -> Option<u64> {
        self.pos
    }

    pub fn set_position(&mut self, pos: u64) {
        self.pos = Some(pos);
    }

    /// Keys whose outcome was observed from the snapshot: first observations
    /// by `Get` or `Delete`, excluding keys this transaction had already
    /// written.
    pub fn read_set(&self) -> HashSet<&[u8]> {
        let mut reads: HashSet<&[u8]> = HashSet::new();
        let mut written: HashSet<&[u8]> = HashSet::new();
        for op in &self.ops {
            match op {
                Op::Get(key) => {
                    if !written.contains(key.as_slice()) {
                        reads.insert(key.as_slice());
                    }
                }
                Op::Delete(key) => {
                    if !written.contains(key.as_slice()) {
                        reads.insert(key.as_slice());
                    }
                    written.insert(key.as_slice());
                }
                Op::Put(key, _) => {
                    written.insert(key.as_slice());
                }
            }
        }
        reads
    }

    /// Keys mutated by this transaction.
    pub fn write_set(&self) -> HashSet<&[u8]> {
        self.ops
            .iter()
            .filter(|op| op.is_write())
            .map(|op| op.key())
            .collect()
    }

    pub fn has_writes(&self) -> bool {
        self.ops.iter().any(Op::is_write)
    }
}
