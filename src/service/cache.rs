//! Bounded cache of parsed log entries, keyed by log position. Insertion
//! order doubles as eviction order; positions are admitted roughly in log
//! order, so the cache retains a window ending at the tail - exactly the
//! region conflict detection and the matcher read from.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::encoding::AfterImage;
use crate::txn::Intention;

/// A parsed entry, shared between the cache and its consumers.
#[derive(Clone)]
pub enum CachedEntry {
    Intention(Arc<Intention>),
    AfterImage(Arc<AfterImage>),
}

struct CacheInner {
    map: HashMap<u64, CachedEntry>,
    order: VecDeque<u64>,
    cap: usize,
}

pub struct EntryCache {
    inner: Mutex<CacheInner>,
}

impl EntryCache {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                cap,
            }),
        }
    }

    pub fn insert(&self, pos: u64, entry: CachedEntry) {
        let mut inner = self.inner.lock();
        if inner.map.insert(pos, entry).is_none() {
            inner.order.push_back(pos);
        }
        while inner.map.len() > inner.cap {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.map.remove(&old);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, pos: u64) -> Option<CachedEntry> {
        self.inner.lock().map.get(&pos).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intention_entry(pos: u64) -> CachedEntry {
        let mut intention = Intention::new(0, pos);
        intention.set_position(pos);
        CachedEntry::Intention(Arc::new(intention))
    }

    #[test]
    fn inserted_entries_are_found() {
        let cache = EntryCache::new(4);
        cache.insert(3, intention_entry(3));
        assert!(matches!(cache.get(3), Some(CachedEntry::Intention(_))));
        assert!(cache.get(4).is_none());
    }

    #[test]
    fn eviction_drops_oldest_insertions() {
        let cache = EntryCache::new(3);
        for pos in 0..5 {
            cache.insert(pos, intention_entry(pos));
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(0).is_none());
        assert!(cache.get(1).is_none());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn reinsert_does_not_double_count() {
        let cache = EntryCache::new(2);
        cache.insert(0, intention_entry(0));
        cache.insert(0, intention_entry(0));
        cache.insert(1, intention_entry(1));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(0).is_some());
        assert!(cache.get(1).is_some());
    }
}
