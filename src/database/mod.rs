//! # Database Handle
//!
//! The public entry point tying the subsystems together. Opening a database
//! boots, in order:
//!
//! 1. the entry service (tail reader + intention dispatcher),
//! 2. the transaction processor, consuming an intention queue anchored at
//!    the start position,
//! 3. the finalizer, draining the after-image matcher,
//!
//! then blocks until replay has caught up with the log tail observed at
//! open. Close stops the service - which wakes every queue and the matcher
//! - joins the workers, and fails whatever commits were still in flight.
//!
//! ## Committed State
//!
//! The committed root and snapshot bound are published under one mutex and
//! swapped atomically by the processor. Published roots are `Nil` or
//! `Remote`, never `Resident`: readers resolve them through the node store,
//! which keeps residency bounded and makes a freshly opened database serve
//! reads straight out of after-images.
//!
//! ## In-Flight Commits
//!
//! `commit` registers the transaction's private tree and a waiter under the
//! transaction's token before appending the intention. The processor takes
//! the tree for the fast path and signals aborts; the finalizer signals
//! success once the after-image is matched back off the log. Tokens are
//! drawn from a process-random base so replayed intentions from earlier
//! incarnations never collide with live waiters.
//!
//! ## Poisoning
//!
//! A fatal fault anywhere - corrupt entry, failed append, consistency
//! violation - poisons the handle: in-flight commits fail, every
//! subsequent operation reports the original fault, and shutdown remains
//! orderly.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use eyre::{bail, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::config::{CATCH_UP_POLL, COMMIT_POLL, NODE_CACHE_CAP};
use crate::log::SharedLog;
use crate::service::EntryService;
use crate::tree::{NodePtr, NodeStore, PersistentTree};
use crate::txn::{Intention, Transaction, TransactionProcessor};

/// Verdict delivered to a blocked `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    Committed,
    Conflict,
    Cancelled,
}

/// One-shot completion a committing client blocks on.
pub(crate) struct CommitWaiter {
    outcome: Mutex<Option<CommitOutcome>>,
    cond: Condvar,
}

impl CommitWaiter {
    pub(crate) fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, outcome: CommitOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        self.cond.notify_all();
    }

    /// Blocks until a verdict arrives, polling for a poisoned database so a
    /// dead worker cannot strand the caller.
    pub(crate) fn wait(&self, shared: &DbShared) -> CommitOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = *slot {
                return outcome;
            }
            if shared.is_poisoned() || shared.entries.stopped() {
                return (*slot).unwrap_or(CommitOutcome::Cancelled);
            }
            let _ = self.cond.wait_for(&mut slot, COMMIT_POLL);
        }
    }
}

struct DbState {
    root: NodePtr,
    /// Exclusive lower bound of the next transaction's conflict window.
    snapshot: u64,
    /// Position of the last intention the processor finished with.
    applied: Option<u64>,
}

struct InflightCommit {
    tree: Option<PersistentTree>,
    waiter: Arc<CommitWaiter>,
}

/// State shared by the handle, the processor, the finalizer, and every
/// transaction.
pub(crate) struct DbShared {
    pub(crate) log: Arc<dyn SharedLog>,
    pub(crate) entries: Arc<EntryService>,
    pub(crate) store: Arc<NodeStore>,
    state: Mutex<DbState>,
    inflight: Mutex<HashMap<u64, InflightCommit>>,
    next_rid: AtomicI64,
    token_base: u64,
    token_counter: AtomicU64,
    poisoned: Mutex<Option<String>>,
}

impl DbShared {
    pub(crate) fn committed_state(&self) -> (NodePtr, u64) {
        let state = self.state.lock();
        (state.root.clone(), state.snapshot)
    }

    /// Swaps in the root produced by the intention at `pos` and advances
    /// the snapshot bound past it.
    pub(crate) fn publish_root(&self, root: NodePtr, pos: u64) {
        let mut state = self.state.lock();
        state.root = root;
        state.snapshot = pos + 1;
        state.applied = Some(pos);
    }

    pub(crate) fn mark_applied(&self, pos: u64) {
        self.state.lock().applied = Some(pos);
    }

    /// A fresh private resolution identity, strictly negative.
    pub(crate) fn next_rid(&self) -> i64 {
        self.next_rid.fetch_sub(1, Ordering::SeqCst)
    }

    pub(crate) fn next_token(&self) -> u64 {
        self.token_base
            .wrapping_add(self.token_counter.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register_inflight(
        &self,
        token: u64,
        tree: PersistentTree,
        waiter: Arc<CommitWaiter>,
    ) {
        self.inflight.lock().insert(
            token,
            InflightCommit {
                tree: Some(tree),
                waiter,
            },
        );
    }

    pub(crate) fn drop_inflight(&self, token: u64) {
        self.inflight.lock().remove(&token);
    }

    /// Takes the private tree of a locally submitted intention, leaving the
    /// waiter registered for the finalizer.
    pub(crate) fn take_local_tree(&self, token: u64) -> Option<PersistentTree> {
        let mut inflight = self.inflight.lock();
        inflight.get_mut(&token).and_then(|entry| entry.tree.take())
    }

    /// Fails a local commit after conflict detection rejected it.
    pub(crate) fn fail_local(&self, token: u64) {
        let entry = self.inflight.lock().remove(&token);
        if let Some(entry) = entry {
            entry.waiter.complete(CommitOutcome::Conflict);
        }
    }

    /// Completes a local commit once its after-image has been matched.
    pub(crate) fn finish_local(&self, token: u64) {
        let entry = self.inflight.lock().remove(&token);
        if let Some(entry) = entry {
            entry.waiter.complete(CommitOutcome::Committed);
        }
    }

    fn cancel_inflight(&self) {
        let drained: Vec<InflightCommit> = self.inflight.lock().drain().map(|(_, v)| v).collect();
        for entry in drained {
            entry.waiter.complete(CommitOutcome::Cancelled);
        }
    }

    pub(crate) fn poison(&self, message: &str) {
        tracing::error!(%message, "database poisoned");
        {
            let mut poisoned = self.poisoned.lock();
            if poisoned.is_none() {
                *poisoned = Some(message.to_string());
            }
        }
        self.entries.stop();
        self.cancel_inflight();
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.lock().is_some() || self.entries.fault().is_some()
    }

    pub(crate) fn poison_message(&self) -> Option<String> {
        if let Some(message) = self.poisoned.lock().clone() {
            return Some(message);
        }
        self.entries.fault()
    }
}

pub struct Database {
    shared: Arc<DbShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens a database over `log`, replaying entries from `start_pos`
    /// until the state observed at open is reconstructed. A database that
    /// was cleanly written can always be reopened at `start_pos = 0`.
    pub fn open(log: Arc<dyn SharedLog>, start_pos: u64) -> Result<Database> {
        let entries = Arc::new(EntryService::new(Arc::clone(&log)));
        let store = Arc::new(NodeStore::new(Arc::clone(&entries), NODE_CACHE_CAP));
        let shared = Arc::new(DbShared {
            log,
            entries: Arc::clone(&entries),
            store,
            state: Mutex::new(DbState {
                root: NodePtr::Nil,
                snapshot: start_pos,
                applied: None,
            }),
            inflight: Mutex::new(HashMap::new()),
            next_rid: AtomicI64::new(-1),
            token_base: generate_token_base(),
            token_counter: AtomicU64::new(1),
            poisoned: Mutex::new(None),
        });

        let mut workers = entries.start(start_pos)?;
        let queue = entries.new_intention_queue(start_pos);
        {
            let shared = Arc::clone(&shared);
            workers.push(
                thread::Builder::new()
                    .name("strand-processor".into())
                    .spawn(move || TransactionProcessor::new(shared, queue).run())
                    .wrap_err("failed to spawn transaction processor")?,
            );
        }
        {
            let shared = Arc::clone(&shared);
            workers.push(
                thread::Builder::new()
                    .name("strand-finalizer".into())
                    .spawn(move || run_finalizer(shared))
                    .wrap_err("failed to spawn finalizer")?,
            );
        }

        let db = Database {
            shared,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
        };
        db.catch_up()?;
        Ok(db)
    }

    /// Begins a transaction against the current committed root.
    pub fn begin(&self) -> Result<Transaction> {
        self.check_open()?;
        let (root, snapshot) = self.shared.committed_state();
        let rid = self.shared.next_rid();
        let token = self.shared.next_token();
        let tree = PersistentTree::at(Arc::clone(&self.shared.store), root, rid);
        let intention = Intention::new(snapshot, token);
        Ok(Transaction::new(
            Arc::clone(&self.shared),
            tree,
            intention,
            token,
        ))
    }

    /// Stops the workers and fails in-flight commits. Idempotent; also runs
    /// on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing database");
        self.shared.entries.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("worker panicked during shutdown");
            }
        }
        self.shared.cancel_inflight();
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("database is closed");
        }
        if let Some(message) = self.shared.poison_message() {
            bail!("database is poisoned: {message}");
        }
        Ok(())
    }

    /// Blocks until the tail reader has passed the tail observed at open
    /// and the processor has applied every intention the reader saw.
    fn catch_up(&self) -> Result<()> {
        let target = self
            .shared
            .log
            .tail()
            .wrap_err("failed to check log tail")?;
        if target == 0 {
            return Ok(());
        }
        tracing::debug!(target, "replaying log");
        loop {
            if let Some(message) = self.shared.poison_message() {
                bail!("database poisoned during replay: {message}");
            }
            if self.shared.entries.reader_pos() >= target {
                match self.shared.entries.last_intention_pos() {
                    None => break,
                    Some(last) => {
                        let applied = self.shared.state.lock().applied;
                        if applied.map_or(false, |pos| pos >= last) {
                            break;
                        }
                    }
                }
            }
            thread::sleep(CATCH_UP_POLL);
        }
        tracing::debug!("replay complete");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drains the matcher: stamps each matched tree with its after-image
/// position and releases the local waiter, if any.
fn run_finalizer(shared: Arc<DbShared>) {
    tracing::debug!("finalizer started");
    while let Some((mut image, ai_pos)) = shared.entries.matcher().match_next() {
        image.tree.set_after_image(ai_pos);
        tracing::trace!(
            intention = image.intention_pos,
            ai_pos,
            "after image matched"
        );
        shared.finish_local(image.token);
    }
    tracing::debug!("finalizer stopped");
}

/// Process-random token base, in the same spirit as a WAL salt: wall-clock
/// nanos folded with the pid. Tokens only need to be unique enough that a
/// replayed intention from an earlier process never resolves to a live
/// waiter.
fn generate_token_base() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let folded = (nanos as u64) ^ ((nanos >> 64) as u64);
    folded ^ (u64::from(std::process::id()) << 32)
}
