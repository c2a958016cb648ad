//! # Entry Service
//!
//! The log-following demultiplexer. One instance per database handle owns
//! the entry cache, the intention queues, the after-image matcher, and the
//! two workers that keep them fed:
//!
//! ```text
//!                        ┌──────────────────────────────────┐
//!   shared log ──read──> │ tail reader                      │
//!                        │   · caches every entry by pos    │
//!                        │   · indexes after-images         │
//!                        │   · pushes them to the matcher   │
//!                        └──────────────────────────────────┘
//!                        ┌──────────────────────────────────┐
//!   shared log ──read──> │ intention dispatcher             │
//!                        │   · walks from the lowest queue  │
//!                        │     position, cache first        │
//!                        │   · delivers intentions to every │
//!                        │     queue at or past their pos   │
//!                        └──────────────────────────────────┘
//! ```
//!
//! Appends go the other way: the service wraps intentions and after-images
//! into framed log entries, appends them, and caches the result under the
//! assigned position so followers rarely re-read their own writes.
//!
//! ## Locking Discipline
//!
//! The entry cache, the queue list, the after-image index, and the matcher
//! each have their own lock, and none is ever held across a log call. The
//! workers read the log unlocked, then take the relevant lock briefly to
//! publish what they found; a slow log stalls progress but never blocks a
//! cache or queue lookup.
//!
//! ## Faults and Shutdown
//!
//! A corrupt entry or a failed log call is fatal: the worker records the
//! first fault, stops the service, and every queue and the matcher wake
//! with their shutdown sentinels. The database maps a recorded fault to a
//! poisoned state. Orderly shutdown takes the same path minus the fault.

mod cache;
mod matcher;
mod queue;

pub use cache::{CachedEntry, EntryCache};
pub use matcher::{AfterImageMatcher, CommittedImage};
pub use queue::IntentionQueue;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use eyre::{bail, eyre, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::{ENTRY_CACHE_CAP, HOLE_BACKOFF, IDLE_BACKOFF};
use crate::encoding::{encode_after_image, encode_intention, AfterImage, LogEntry};
use crate::log::SharedLog;
use crate::txn::Intention;

/// Sentinel for "no intention seen yet" in [`EntryService::last_intention_pos`].
const NO_INTENTION: u64 = u64::MAX;

pub struct EntryService {
    log: Arc<dyn SharedLog>,
    cache: EntryCache,
    queues: Mutex<Vec<Arc<IntentionQueue>>>,
    matcher: AfterImageMatcher,
    /// intention position -> log position of its first known after-image.
    ai_index: Mutex<HashMap<u64, u64>>,
    stop: AtomicBool,
    fault: Mutex<Option<String>>,
    /// Next position the tail reader will consume.
    reader_pos: AtomicU64,
    /// Highest intention position the tail reader has seen.
    last_intention: AtomicU64,
}

impl EntryService {
    pub fn new(log: Arc<dyn SharedLog>) -> Self {
        Self {
            log,
            cache: EntryCache::new(ENTRY_CACHE_CAP),
            queues: Mutex::new(Vec::new()),
            matcher: AfterImageMatcher::new(),
            ai_index: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            fault: Mutex::new(None),
            reader_pos: AtomicU64::new(0),
            last_intention: AtomicU64::new(NO_INTENTION),
        }
    }

    /// Spawns the tail reader and the intention dispatcher. The handles are
    /// returned to the owner, which joins them after [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>, start_pos: u64) -> Result<Vec<thread::JoinHandle<()>>> {
        self.reader_pos.store(start_pos, Ordering::SeqCst);
        let tail_reader = {
            let service = Arc::clone(self);
            thread::Builder::new()
                .name("strand-tail-reader".into())
                .spawn(move || service.run_tail_reader(start_pos))
                .wrap_err("failed to spawn tail reader")?
        };
        let dispatcher = {
            let service = Arc::clone(self);
            thread::Builder::new()
                .name("strand-dispatcher".into())
                .spawn(move || service.run_dispatcher())
                .wrap_err("failed to spawn intention dispatcher")?
        };
        Ok(vec![tail_reader, dispatcher])
    }

    /// Stops the workers and wakes every queue and the matcher.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.matcher.shutdown();
        for queue in self.queues.lock().iter() {
            queue.stop();
        }
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// The first fatal fault a worker hit, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub fn matcher(&self) -> &AfterImageMatcher {
        &self.matcher
    }

    /// Next position the tail reader will consume.
    pub fn reader_pos(&self) -> u64 {
        self.reader_pos.load(Ordering::SeqCst)
    }

    /// Highest intention position the tail reader has observed.
    pub fn last_intention_pos(&self) -> Option<u64> {
        match self.last_intention.load(Ordering::SeqCst) {
            NO_INTENTION => None,
            pos => Some(pos),
        }
    }

    /// Registers an intention queue anchored at `pos`.
    pub fn new_intention_queue(&self, pos: u64) -> Arc<IntentionQueue> {
        let queue = Arc::new(IntentionQueue::new(pos));
        self.queues.lock().push(Arc::clone(&queue));
        if self.stopped() {
            queue.stop();
        }
        queue
    }

    /// Wraps an intention in a log entry, appends it, and caches the result
    /// under its assigned position.
    pub fn append_intention(&self, mut intention: Intention) -> Result<Arc<Intention>> {
        let blob = encode_intention(&intention);
        let pos = self
            .log
            .append(&blob)
            .wrap_err("failed to append intention")?;
        intention.set_position(pos);
        let shared = Arc::new(intention);
        self.cache
            .insert(pos, CachedEntry::Intention(Arc::clone(&shared)));
        Ok(shared)
    }

    /// Appends an after-image unless one for the same intention is already
    /// indexed; replay is the common source of such duplicates. Returns the
    /// log position of the image that counts.
    pub fn append_after_image(&self, image: &AfterImage) -> Result<u64> {
        if let Some(&pos) = self.ai_index.lock().get(&image.intention_pos()) {
            return Ok(pos);
        }
        let blob = encode_after_image(image);
        let pos = self
            .log
            .append(&blob)
            .wrap_err("failed to append after image")?;
        self.cache
            .insert(pos, CachedEntry::AfterImage(Arc::new(image.clone())));
        let mut index = self.ai_index.lock();
        Ok(*index.entry(image.intention_pos()).or_insert(pos))
    }

    /// Batch read of intentions by position: cache first, log for misses,
    /// cache populated on the way out.
    pub fn read_intentions(&self, positions: &[u64]) -> Result<Vec<Arc<Intention>>> {
        let mut out = Vec::with_capacity(positions.len());
        for &pos in positions {
            if let Some(CachedEntry::Intention(intention)) = self.cache.get(pos) {
                out.push(intention);
                continue;
            }
            let blob = self
                .log
                .read(pos)
                .wrap_err_with(|| format!("failed to read log position {pos}"))?
                .ok_or_else(|| eyre!("log position {pos} is unwritten"))?;
            let entry = LogEntry::decode(&blob)
                .wrap_err_with(|| format!("corrupt log entry at position {pos}"))?;
            match self.admit(pos, entry) {
                CachedEntry::Intention(intention) => out.push(intention),
                CachedEntry::AfterImage(_) => bail!("expected intention at position {pos}"),
            }
        }
        Ok(out)
    }

    /// The after-image of the intention committed at `intention_pos`. Uses
    /// the index when the tail reader has seen the image; otherwise scans
    /// forward from the intention, which is where the image must be.
    pub fn after_image(&self, intention_pos: u64) -> Result<Arc<AfterImage>> {
        let indexed = self.ai_index.lock().get(&intention_pos).copied();
        if let Some(ai_pos) = indexed {
            if let Some(CachedEntry::AfterImage(image)) = self.cache.get(ai_pos) {
                return Ok(image);
            }
            let blob = self
                .log
                .read(ai_pos)
                .wrap_err_with(|| format!("failed to read log position {ai_pos}"))?
                .ok_or_else(|| eyre!("log position {ai_pos} is unwritten"))?;
            let entry = LogEntry::decode(&blob)
                .wrap_err_with(|| format!("corrupt log entry at position {ai_pos}"))?;
            match self.admit(ai_pos, entry) {
                CachedEntry::AfterImage(image) => return Ok(image),
                CachedEntry::Intention(_) => {
                    bail!("position {ai_pos} does not hold an after image")
                }
            }
        }

        let mut pos = intention_pos + 1;
        loop {
            if self.stopped() {
                bail!("entry service is shutting down");
            }
            let tail = self.log.tail().wrap_err("failed to check log tail")?;
            if pos >= tail {
                bail!("no after image found for intention {intention_pos}");
            }
            match self
                .log
                .read(pos)
                .wrap_err_with(|| format!("failed to read log position {pos}"))?
            {
                None => thread::sleep(HOLE_BACKOFF),
                Some(blob) => {
                    let entry = LogEntry::decode(&blob)
                        .wrap_err_with(|| format!("corrupt log entry at position {pos}"))?;
                    if let CachedEntry::AfterImage(image) = self.admit(pos, entry) {
                        self.ai_index
                            .lock()
                            .entry(image.intention_pos())
                            .or_insert(pos);
                        if image.intention_pos() == intention_pos {
                            return Ok(image);
                        }
                    }
                    pos += 1;
                }
            }
        }
    }

    /// Parses-and-caches glue shared by every reader path.
    fn admit(&self, pos: u64, entry: LogEntry) -> CachedEntry {
        let cached = match entry {
            LogEntry::Intention(mut intention) => {
                intention.set_position(pos);
                CachedEntry::Intention(Arc::new(intention))
            }
            LogEntry::AfterImage(image) => CachedEntry::AfterImage(Arc::new(image)),
        };
        self.cache.insert(pos, cached.clone());
        cached
    }

    /// Tail reader: walks the log from the database's start position to the
    /// tail, caching every entry and forwarding after-images to the matcher
    /// and the index. Holes are retried with backoff.
    fn run_tail_reader(&self, start_pos: u64) {
        let mut next = start_pos;
        tracing::debug!(start_pos, "tail reader started");
        'outer: while !self.stopped() {
            let tail = match self.log.tail() {
                Ok(tail) => tail,
                Err(e) => {
                    self.set_fault(format!("tail check failed: {e:#}"));
                    return;
                }
            };
            if next >= tail {
                thread::sleep(IDLE_BACKOFF);
                continue;
            }
            while next < tail {
                if self.stopped() {
                    break 'outer;
                }
                if let Some(entry) = self.cache.get(next) {
                    self.note_entry(next, &entry);
                    next += 1;
                    self.reader_pos.store(next, Ordering::SeqCst);
                    continue;
                }
                match self.log.read(next) {
                    Ok(Some(blob)) => match LogEntry::decode(&blob) {
                        Ok(entry) => {
                            let cached = self.admit(next, entry);
                            self.note_entry(next, &cached);
                            next += 1;
                            self.reader_pos.store(next, Ordering::SeqCst);
                        }
                        Err(e) => {
                            self.set_fault(format!("corrupt log entry at {next}: {e:#}"));
                            return;
                        }
                    },
                    // a hole: someone claimed the position but has not
                    // written it yet, so retry the same position
                    Ok(None) => thread::sleep(HOLE_BACKOFF),
                    Err(e) => {
                        self.set_fault(format!("log read failed at {next}: {e:#}"));
                        return;
                    }
                }
            }
        }
        tracing::debug!("tail reader stopped");
    }

    fn note_entry(&self, pos: u64, entry: &CachedEntry) {
        match entry {
            CachedEntry::Intention(_) => {
                let current = self.last_intention.load(Ordering::SeqCst);
                if current == NO_INTENTION || pos > current {
                    self.last_intention.store(pos, Ordering::SeqCst);
                }
            }
            CachedEntry::AfterImage(image) => {
                self.ai_index
                    .lock()
                    .entry(image.intention_pos())
                    .or_insert(pos);
                self.matcher.push(image.intention_pos(), pos);
            }
        }
    }

    /// Intention dispatcher: walks positions from the lowest queue anchor,
    /// consulting the cache before the log, and delivers intention entries
    /// to every queue whose position they satisfy.
    fn run_dispatcher(&self) {
        let mut pos: u64 = 0;
        let mut last_min: Option<u64> = None;
        tracing::debug!("intention dispatcher started");
        while !self.stopped() {
            let min_pos = {
                let queues = self.queues.lock();
                queues.iter().map(|q| q.position()).min()
            };
            let Some(min_pos) = min_pos else {
                last_min = None;
                thread::sleep(IDLE_BACKOFF);
                continue;
            };
            // a queue anchored behind the cursor resets the walk
            if last_min.map_or(true, |last| min_pos < last) {
                pos = min_pos;
            }
            last_min = Some(min_pos);

            let tail = match self.log.tail() {
                Ok(tail) => tail,
                Err(e) => {
                    self.set_fault(format!("tail check failed: {e:#}"));
                    return;
                }
            };
            if pos >= tail {
                thread::sleep(IDLE_BACKOFF);
                continue;
            }

            let entry = match self.fetch_entry(pos) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    thread::sleep(HOLE_BACKOFF);
                    continue;
                }
                Err(e) => {
                    self.set_fault(format!("dispatcher failed at {pos}: {e:#}"));
                    return;
                }
            };
            if let CachedEntry::Intention(intention) = entry {
                let targets: Vec<Arc<IntentionQueue>> = {
                    let queues = self.queues.lock();
                    queues
                        .iter()
                        .filter(|q| pos >= q.position())
                        .map(Arc::clone)
                        .collect()
                };
                for queue in targets {
                    if let Err(e) = queue.push(Arc::clone(&intention)) {
                        self.set_fault(format!("queue delivery failed at {pos}: {e:#}"));
                        return;
                    }
                }
            }
            pos += 1;
        }
        tracing::debug!("intention dispatcher stopped");
    }

    fn fetch_entry(&self, pos: u64) -> Result<Option<CachedEntry>> {
        if let Some(entry) = self.cache.get(pos) {
            return Ok(Some(entry));
        }
        let Some(blob) = self
            .log
            .read(pos)
            .wrap_err_with(|| format!("failed to read log position {pos}"))?
        else {
            return Ok(None);
        };
        let entry = LogEntry::decode(&blob)
            .wrap_err_with(|| format!("corrupt log entry at position {pos}"))?;
        Ok(Some(self.admit(pos, entry)))
    }

    fn set_fault(&self, message: String) {
        tracing::error!(%message, "entry service fault");
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(message);
            }
        }
        self.stop();
    }
}
