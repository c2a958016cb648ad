//! # Transaction Handle
//!
//! The per-client façade. Reads and writes go to the transaction's private
//! copy-on-write tree and are recorded in its intention; `commit` seals the
//! intention, appends it to the log, and blocks until the processor has a
//! verdict. A transaction that never changed the tree commits immediately
//! without touching the log.
//!
//! Dropping an uncommitted transaction abandons it: the private tree and
//! its nodes are garbage once the handle is gone.

use std::sync::Arc;

use eyre::{bail, Result, WrapErr};

use super::intention::Intention;
use crate::database::{CommitOutcome, CommitWaiter, DbShared};
use crate::tree::PersistentTree;

pub struct Transaction {
    shared: Arc<DbShared>,
    tree: PersistentTree,
    intention: Intention,
    token: u64,
}

impl Transaction {
    pub(crate) fn new(
        shared: Arc<DbShared>,
        tree: PersistentTree,
        intention: Intention,
        token: u64,
    ) -> Self {
        Self {
            shared,
            tree,
            intention,
            token,
        }
    }

    /// Reads `key` at this transaction's snapshot, observing the
    /// transaction's own earlier writes.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_usable()?;
        self.intention.record_get(key);
        self.tree.get(key)
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_usable()?;
        self.intention.record_put(key, value);
        self.tree.put(key, value)
    }

    /// Records a delete. Absent keys are tolerated: the tree is unchanged
    /// but the delete still participates in conflict detection if the
    /// transaction reaches the log.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.check_usable()?;
        self.intention.record_delete(key);
        self.tree.delete(key)
    }

    /// Proposes the transaction for commit. Returns `Ok(true)` when it
    /// committed, `Ok(false)` when conflict detection aborted it, and an
    /// error when the database shut down or is poisoned.
    ///
    /// Read-only transactions short-circuit to success without a log
    /// append.
    pub fn commit(self) -> Result<bool> {
        self.check_usable()?;
        if self.tree.is_read_only() {
            return Ok(true);
        }

        let Transaction {
            shared,
            tree,
            intention,
            token,
        } = self;

        let waiter = Arc::new(CommitWaiter::new());
        shared.register_inflight(token, tree, Arc::clone(&waiter));
        if let Err(e) = shared.entries.append_intention(intention) {
            shared.drop_inflight(token);
            return Err(e).wrap_err("commit failed before reaching the log");
        }

        match waiter.wait(&shared) {
            CommitOutcome::Committed => Ok(true),
            CommitOutcome::Conflict => Ok(false),
            CommitOutcome::Cancelled => {
                bail!("commit cancelled: database is shutting down or poisoned")
            }
        }
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(message) = self.shared.poison_message() {
            bail!("database is poisoned: {message}");
        }
        if self.shared.entries.stopped() {
            bail!("database is closed");
        }
        Ok(())
    }
}
