//! # After-Image Matcher
//!
//! Pairs each committed intention's in-memory tree with the first
//! after-image the log holds for that intention position. The two sides
//! arrive independently and in either order:
//!
//! - the transaction processor *watches* an intention position, submitting
//!   the committed delta and tree;
//! - the tail reader *pushes* the log position of every after-image it
//!   encounters.
//!
//! Whichever side arrives first is parked; the second completes the match
//! and the pair is handed to the finalizer through [`match_next`].
//!
//! ## Watermark
//!
//! `watermark` is one past the highest intention position fully matched and
//! retired. Late duplicates - a second after-image for the same intention
//! appended by another processor during replay, or a replayed watch - land
//! below the watermark and are dropped silently. Entries are retired in
//! intention-position order so the watermark stays meaningful: it only
//! advances past positions with nothing left pending.
//!
//! [`match_next`]: AfterImageMatcher::match_next

use std::collections::{BTreeMap, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::tree::{PersistentTree, SharedNode};

/// A committed intention's in-memory result, parked until its after-image
/// shows up in the log.
pub struct CommittedImage {
    pub intention_pos: u64,
    pub token: u64,
    pub delta: Vec<SharedNode>,
    pub tree: PersistentTree,
}

struct Pending {
    ai_pos: Option<u64>,
    image: Option<CommittedImage>,
    done: bool,
}

struct MatcherInner {
    pending: BTreeMap<u64, Pending>,
    matched: VecDeque<(CommittedImage, u64)>,
    watermark: u64,
    shutdown: bool,
}

pub struct AfterImageMatcher {
    inner: Mutex<MatcherInner>,
    cond: Condvar,
}

impl Default for AfterImageMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AfterImageMatcher {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MatcherInner {
                pending: BTreeMap::new(),
                matched: VecDeque::new(),
                watermark: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Parks a committed intention's tree, or completes the match if its
    /// after-image position already arrived.
    pub fn watch(&self, image: CommittedImage) {
        let mut inner = self.inner.lock();
        if image.intention_pos < inner.watermark {
            return;
        }
        let ipos = image.intention_pos;
        let state = &mut *inner;
        match state.pending.entry(ipos) {
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(Pending {
                    ai_pos: None,
                    image: Some(image),
                    done: false,
                });
            }
            std::collections::btree_map::Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut();
                if pending.done || pending.image.is_some() {
                    return; // duplicate watch
                }
                match pending.ai_pos.take() {
                    Some(ai_pos) => {
                        pending.done = true;
                        state.matched.push_back((image, ai_pos));
                        self.cond.notify_one();
                    }
                    None => pending.image = Some(image),
                }
            }
        }
        Self::gc(&mut inner);
    }

    /// Records an after-image seen in the log, or completes the match if
    /// the intention's tree is already parked. Only the first after-image
    /// per intention position counts.
    pub fn push(&self, intention_pos: u64, ai_pos: u64) {
        let mut inner = self.inner.lock();
        if intention_pos < inner.watermark {
            return;
        }
        let state = &mut *inner;
        match state.pending.entry(intention_pos) {
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(Pending {
                    ai_pos: Some(ai_pos),
                    image: None,
                    done: false,
                });
            }
            std::collections::btree_map::Entry::Occupied(mut occupied) => {
                let pending = occupied.get_mut();
                if pending.done || pending.ai_pos.is_some() {
                    return; // duplicate after-image
                }
                match pending.image.take() {
                    Some(image) => {
                        pending.done = true;
                        state.matched.push_back((image, ai_pos));
                        self.cond.notify_one();
                    }
                    None => pending.ai_pos = Some(ai_pos),
                }
            }
        }
        Self::gc(&mut inner);
    }

    /// Blocks for the next matched pair; `None` after shutdown.
    pub fn match_next(&self) -> Option<(CommittedImage, u64)> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(pair) = inner.matched.pop_front() {
                return Some(pair);
            }
            if inner.shutdown {
                return None;
            }
            self.cond.wait(&mut inner);
        }
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Retires fully matched entries from the front of the index. The
    /// watermark may only move past positions with nothing pending, so it
    /// stops at the first entry still waiting for a side.
    fn gc(inner: &mut MatcherInner) {
        loop {
            let Some((&ipos, pending)) = inner.pending.iter().next() else {
                break;
            };
            if !pending.done {
                break;
            }
            inner.pending.remove(&ipos);
            inner.watermark = ipos + 1;
        }
    }

    #[cfg(test)]
    fn watermark(&self) -> u64 {
        self.inner.lock().watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemLog;
    use crate::service::EntryService;
    use crate::tree::{NodePtr, NodeStore};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn committed_image(ipos: u64) -> CommittedImage {
        let log = Arc::new(MemLog::new());
        let entries = Arc::new(EntryService::new(log));
        let store = Arc::new(NodeStore::new(entries, 16));
        let mut tree = PersistentTree::at(store, NodePtr::Nil, -1);
        tree.put(b"k", b"v").unwrap();
        tree.seal();
        tree.set_intention(ipos);
        let delta = tree.delta().to_vec();
        CommittedImage {
            intention_pos: ipos,
            token: 99,
            delta,
            tree,
        }
    }

    #[test]
    fn watch_then_push_delivers_one_pair() {
        let matcher = AfterImageMatcher::new();
        matcher.watch(committed_image(0));
        matcher.push(0, 1);
        let (image, ai_pos) = matcher.match_next().unwrap();
        assert_eq!(image.intention_pos, 0);
        assert_eq!(ai_pos, 1);
        assert_eq!(matcher.watermark(), 1);
    }

    #[test]
    fn push_then_watch_delivers_one_pair() {
        let matcher = AfterImageMatcher::new();
        matcher.push(4, 6);
        matcher.watch(committed_image(4));
        let (image, ai_pos) = matcher.match_next().unwrap();
        assert_eq!(image.intention_pos, 4);
        assert_eq!(ai_pos, 6);
    }

    #[test]
    fn duplicate_after_image_is_ignored() {
        let matcher = AfterImageMatcher::new();
        matcher.push(2, 3);
        matcher.push(2, 9);
        matcher.watch(committed_image(2));
        let (_, ai_pos) = matcher.match_next().unwrap();
        assert_eq!(ai_pos, 3, "first after-image in the log wins");
    }

    #[test]
    fn retired_positions_drop_late_arrivals() {
        let matcher = AfterImageMatcher::new();
        matcher.watch(committed_image(0));
        matcher.push(0, 1);
        matcher.match_next().unwrap();
        assert_eq!(matcher.watermark(), 1);
        matcher.push(0, 7);
        matcher.watch(committed_image(0));
        assert!(matcher.inner.lock().matched.is_empty());
        assert!(matcher.inner.lock().pending.is_empty());
    }

    #[test]
    fn watermark_waits_for_gaps() {
        let matcher = AfterImageMatcher::new();
        matcher.push(5, 8);
        matcher.watch(committed_image(3));
        assert_eq!(matcher.watermark(), 0);
        matcher.push(3, 4);
        matcher.match_next().unwrap();
        // 3 retired; 5 still waits for its watch
        assert_eq!(matcher.watermark(), 4);
        matcher.watch(committed_image(5));
        matcher.match_next().unwrap();
        assert_eq!(matcher.watermark(), 6);
    }

    #[test]
    fn shutdown_wakes_blocked_consumer_with_sentinel() {
        let matcher = Arc::new(AfterImageMatcher::new());
        let consumer = {
            let matcher = Arc::clone(&matcher);
            thread::spawn(move || matcher.match_next())
        };
        thread::sleep(Duration::from_millis(20));
        matcher.shutdown();
        assert!(consumer.join().unwrap().is_none());
    }
}
