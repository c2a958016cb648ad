//! # Transaction Processor
//!
//! The single worker that linearizes the database. It consumes intentions
//! from an intention queue in log order and, for each one, decides commit
//! or abort and materializes the outcome:
//!
//! ```text
//! intention I at position p, snapshot s
//!     │
//!     ├─ conflict? some committed J with s <= J.pos < p wrote a key
//!     │  I read or wrote ──────────────> abort (signal local waiter)
//!     │
//!     ├─ local fast-path: I's private tree is registered under its token
//!     │  and nothing committed since s ──> reuse the private tree
//!     │
//!     ├─ otherwise: replay I's writes against the current committed root
//!     │
//!     └─ seal the delta, stamp it with p, install it in the node store,
//!        append the after-image, publish the new root and snapshot p+1,
//!        and watch the matcher for the image to come back off the log
//! ```
//!
//! ## Conflict Detection
//!
//! Serializable-snapshot validation over the intention history. The
//! processor remembers which positions committed; the conflict window for
//! `I` is the committed positions in `[s, p)`, whose intentions it fetches
//! through the entry service's batch read. Aborted intentions never
//! materialized writes and do not participate. First-committer wins on
//! write-write overlap; read-write overlap aborts the reader.
//!
//! ## Local vs. Foreign Intentions
//!
//! A locally submitted intention has its private tree registered under its
//! token, but the tree is only valid as the next version if nothing
//! committed after its snapshot. Whenever something did, the processor
//! rebuilds the effect by replaying the intention's writes against the
//! current committed root - the same path every foreign intention takes.
//! Replay is deterministic, so any process reaches an identical image.
//!
//! ## Fatal Errors
//!
//! Any I/O or consistency failure while processing poisons the database:
//! pending commits fail, the queue drains to its sentinel, and the worker
//! exits.

use std::collections::BTreeSet;
use std::sync::Arc;

use eyre::{eyre, Result};
use hashbrown::HashSet;

use super::intention::{Intention, Op};
use crate::database::DbShared;
use crate::service::{CommittedImage, IntentionQueue};
use crate::tree::PersistentTree;

pub struct TransactionProcessor {
    shared: Arc<DbShared>,
    queue: Arc<IntentionQueue>,
    /// Log positions of intentions that committed, in order.
    committed: BTreeSet<u64>,
}

impl TransactionProcessor {
    pub(crate) fn new(shared: Arc<DbShared>, queue: Arc<IntentionQueue>) -> Self {
        Self {
            shared,
            queue,
            committed: BTreeSet::new(),
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("transaction processor started");
        while let Some(intention) = self.queue.wait() {
            let result = intention
                .position()
                .ok_or_else(|| eyre!("intention delivered without a position"))
                .and_then(|pos| self.process(&intention, pos));
            if let Err(e) = result {
                self.shared.poison(&format!("transaction processor: {e:#}"));
                break;
            }
        }
        tracing::debug!("transaction processor stopped");
    }

    fn process(&mut self, intention: &Arc<Intention>, pos: u64) -> Result<()> {
        let token = intention.token();
        if self.conflicts(intention, pos)? {
            tracing::debug!(pos, token, "intention aborted by conflict");
            self.shared.fail_local(token);
            self.shared.mark_applied(pos);
            return Ok(());
        }

        let (root, snapshot) = self.shared.committed_state();
        let local = self.shared.take_local_tree(token);
        let mut tree = match local {
            Some(tree) if intention.snapshot() == snapshot => tree,
            _ => {
                // replay against the current committed root; intervening
                // commits make the private tree stale even for local
                // intentions
                let mut tree =
                    PersistentTree::at(Arc::clone(&self.shared.store), root, self.shared.next_rid());
                for op in intention.ops() {
                    match op {
                        Op::Get(_) => {}
                        Op::Put(key, value) => tree.put(key, value)?,
                        Op::Delete(key) => tree.delete(key)?,
                    }
                }
                tree
            }
        };

        tree.seal();
        tree.set_intention(pos);
        self.shared.store.install(tree.delta())?;
        let image = tree.to_after_image()?;
        let new_root = tree.sealed_root_ref()?;
        self.shared.entries.append_after_image(&image)?;
        self.shared.publish_root(new_root, pos);
        self.committed.insert(pos);

        let delta = tree.delta().to_vec();
        self.shared.entries.matcher().watch(CommittedImage {
            intention_pos: pos,
            token,
            delta,
            tree,
        });
        tracing::debug!(pos, token, "intention committed");
        Ok(())
    }

    /// True when a committed intention in `[snapshot, pos)` wrote a key
    /// this intention read or wrote.
    fn conflicts(&self, intention: &Intention, pos: u64) -> Result<bool> {
        let snapshot = intention.snapshot();
        if snapshot >= pos {
            return Ok(false);
        }
        let window: Vec<u64> = self.committed.range(snapshot..pos).copied().collect();
        if window.is_empty() {
            return Ok(false);
        }
        let mut touched: HashSet<&[u8]> = intention.read_set();
        for key in intention.write_set() {
            touched.insert(key);
        }
        if touched.is_empty() {
            return Ok(false);
        }
        let others = self.shared.entries.read_intentions(&window)?;
        for other in &others {
            for op in other.ops() {
                let clashes = match op {
                    Op::Put(key, _) | Op::Delete(key) => touched.contains(key.as_slice()),
                    Op::Get(_) => false,
                };
                if clashes {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
