//! # StrandDB Configuration Constants
//!
//! This module centralizes tuning constants. Constants that depend on each
//! other are co-located and their relationships documented, so a change in
//! one place does not silently invalidate another.
//!
//! ## Dependency Notes
//!
//! ```text
//! ENTRY_CACHE_CAP (64 entries)
//!       │
//!       └─> Must comfortably exceed the typical conflict-detection window
//!           (snapshot..commit distance). A window longer than the cache
//!           falls back to log reads, which is correct but slow.
//!
//! NODE_CACHE_CAP (4096 nodes)
//!       │
//!       └─> Bounds the node store only. Nodes reachable from a live root
//!           stay resident through their parents regardless of this cap;
//!           eviction merely drops the (pos, slot) resolution entry.
//!
//! HOLE_BACKOFF (1ms)
//!       │
//!       └─> Sleep between retries of a log position that returned no
//!           entry. With a single sequencer, holes only occur at the tail
//!           and fill within one append latency.
//!
//! IDLE_BACKOFF / CATCH_UP_POLL / COMMIT_POLL
//!       └─> Worker idle sleeps. Shutdown latency is bounded by the
//!           largest of these, so keep them in the low-millisecond range.
//! ```

use std::time::Duration;

/// Maximum number of log entries retained in the entry cache.
pub const ENTRY_CACHE_CAP: usize = 64;

/// Maximum number of resolution entries in the node store.
pub const NODE_CACHE_CAP: usize = 4096;

/// Upper bound on a single log entry payload. Guards frame parsing against
/// corrupt length fields.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Sleep between retries when a log position reads back empty (a hole or a
/// position just past a concurrent append).
pub const HOLE_BACKOFF: Duration = Duration::from_micros(1000);

/// Sleep for workers with nothing to do (tail reached, no queues).
pub const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Interval at which a blocked commit re-checks for a poisoned database.
pub const COMMIT_POLL: Duration = Duration::from_millis(10);

/// Interval at which `Database::open` polls replay progress.
pub const CATCH_UP_POLL: Duration = Duration::from_millis(1);
