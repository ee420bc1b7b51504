//! # Domain Types for snapdb
//!
//! The engine's vocabulary lives here: snapshot timestamps and the clock
//! that mints them, cache keys, changesets and the per-key hints derived
//! from them, memory-pressure levels, and the open-time configuration.
//!
//! ## Why `WriteTimestamp` Is Not a Bare `f64`
//!
//! The engine compares timestamps drawn from three places (the
//! coordinator's memory, the `yap` table inside SQLite, and each
//! connection's cache watermark), and every coherence decision, from
//! keeping the cache through declaring corruption, hangs on those
//! comparisons. Giving the stamp its own type keeps arbitrary floats out
//! of that role, and gives the blob codec, `Display`, and the zero
//! sentinel a single definition to agree on. [`CacheKey`] earns its struct
//! the same way: collection and row key travel together through every
//! cache lookup and invalidation decision, so they move as one value
//! rather than two loose strings.
//!
//! ## Invariants
//!
//! - [`WriteTimestamp`]: monotonically non-decreasing across the database's
//!   lifetime; strictly increasing across commits. Sourced from
//!   [`MonotonicClock`], never from wall-clock time.
//! - [`Changeset`]: one record per committed read-write transaction.
//!   Successive mutations of the same key coalesce, last writer wins.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// =============================================================================
// Write Timestamps
// =============================================================================

/// A logical snapshot timestamp, in seconds of process uptime.
///
/// # What is a Write Timestamp?
///
/// Every committed read-write transaction is stamped with a fresh timestamp
/// from the database's [`MonotonicClock`]. The stamp is held in memory by the
/// coordinator (the "yap-level" snapshot) and persisted inside SQLite (the
/// "sql-level" snapshot); comparing the two is how a connection decides
/// whether its caches are still coherent.
///
/// # Why f64?
///
/// The value is a duration since process start, and it is persisted as an
/// 8-byte little-endian blob in the `yap` table. Sub-microsecond resolution
/// matters (two commits can land within the same millisecond), integer
/// overflow does not.
///
/// # Validity
///
/// Timestamps are only meaningful within one process lifetime. The value
/// read back from disk at open time is a watermark from a *previous* process
/// and is never compared against fresh stamps.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct WriteTimestamp(f64);

impl WriteTimestamp {
    /// The zero timestamp: "never written".
    pub const ZERO: WriteTimestamp = WriteTimestamp(0.0);

    /// Creates a timestamp from a raw seconds value.
    pub fn from_raw(secs: f64) -> Self {
        Self(secs)
    }

    /// Returns the raw seconds value.
    pub fn as_raw(&self) -> f64 {
        self.0
    }

    /// Whether this is the "never written" timestamp.
    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

impl fmt::Display for WriteTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

// =============================================================================
// Monotonic Clock
// =============================================================================

/// A process-local monotonic clock issuing strictly increasing timestamps.
///
/// # Why Not Wall Clock?
///
/// Wall-clock time can jump backwards (NTP, manual adjustment, suspend), and
/// a timestamp that moves backwards would break every coherence check in the
/// engine. `Instant` is guaranteed monotonic by the platform.
///
/// # Strictness
///
/// Two calls to [`MonotonicClock::next`] in quick succession could observe
/// the same `Instant` reading on a coarse timer. `next` tracks the last
/// issued value and nudges forward when needed, so successive commits always
/// carry strictly increasing stamps.
#[derive(Debug)]
pub struct MonotonicClock {
    /// Anchor; timestamps are seconds elapsed since this point.
    origin: Instant,

    /// Last issued value, for strictness under coarse timers.
    last: Mutex<f64>,
}

/// Minimum forward step when the timer hasn't advanced between calls.
const MIN_CLOCK_STEP: f64 = 1e-9;

impl MonotonicClock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: Mutex::new(0.0),
        }
    }

    /// Issues the next timestamp, strictly greater than any issued before.
    pub fn next(&self) -> WriteTimestamp {
        let elapsed = self.origin.elapsed().as_secs_f64();
        let mut last = self.last.lock().expect("clock mutex poisoned");
        let value = if elapsed > *last {
            elapsed
        } else {
            *last + MIN_CLOCK_STEP
        };
        *last = value;
        WriteTimestamp(value)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Cache Keys
// =============================================================================

/// The key of one cached row: a (collection, key) pair.
///
/// Collections partition the key space; the engine treats both halves as
/// opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The collection the row belongs to.
    pub collection: String,
    /// The row key within the collection.
    pub key: String,
}

impl CacheKey {
    /// Creates a cache key from a collection and row key.
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

// =============================================================================
// Change Operations & Hints
// =============================================================================

/// The logical operation recorded for one key in a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// The key was set (inserted or overwritten).
    Updated,
    /// The key was removed.
    Removed,
}

/// What a cache-changeset block reports for one key.
///
/// The numeric values mirror the block contract: `-1` deleted, `0`
/// unchanged, `+1` modified. A cache view drops the entry on anything
/// non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ChangeHint {
    /// The key/value pair was deleted.
    Removed = -1,
    /// The key/value pair was unchanged.
    Unchanged = 0,
    /// The key/value pair was modified.
    Updated = 1,
}

impl ChangeHint {
    /// Returns the raw `-1 / 0 / +1` value.
    pub fn as_raw(&self) -> i8 {
        *self as i8
    }

    /// Whether a cached entry for this key must be dropped.
    pub fn invalidates(&self) -> bool {
        !matches!(self, ChangeHint::Unchanged)
    }
}

// =============================================================================
// Changesets
// =============================================================================

/// The record of one committed read-write transaction.
///
/// # Lifecycle
///
/// A changeset is accumulated by a read-write transaction, stamped with a
/// fresh [`WriteTimestamp`] just before commit, reported to the coordinator
/// as *pending*, then promoted to *committed* and broadcast to every sibling
/// connection once the SQLite `COMMIT` returns. It is retained in the
/// committed log until every live connection's snapshot has advanced past
/// its timestamp.
///
/// # Coalescing
///
/// Successive mutations of the same key collapse to the last operation:
/// `set(k, v1); set(k, v2)` records a single `Updated`, `set(k, v);
/// remove(k)` records a single `Removed`. `remove_all(collection)` discards
/// the per-key map for that collection and marks the whole collection
/// cleared.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    /// The commit stamp. Zero until the changeset is sealed for commit.
    pub last_write_timestamp: WriteTimestamp,

    /// Per-collection modification maps, last writer wins per key.
    pub collections: HashMap<String, HashMap<String, ChangeOp>>,

    /// Collections hit by `remove_all` during this transaction.
    pub cleared: HashSet<String>,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a `set` of `(collection, key)`.
    pub fn record_set(&mut self, collection: &str, key: &str) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), ChangeOp::Updated);
    }

    /// Records a `remove` of `(collection, key)`.
    pub fn record_remove(&mut self, collection: &str, key: &str) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), ChangeOp::Removed);
    }

    /// Records a `remove_all` of `collection`.
    ///
    /// Per-key history for the collection becomes irrelevant: every key a
    /// sibling might hold cached for it is gone.
    pub fn record_remove_all(&mut self, collection: &str) {
        self.collections.remove(collection);
        self.cleared.insert(collection.to_string());
    }

    /// Whether the transaction mutated anything at all.
    pub fn is_empty(&self) -> bool {
        self.collections.values().all(|m| m.is_empty()) && self.cleared.is_empty()
    }

    /// Total number of per-key entries (excluding cleared collections).
    pub fn len(&self) -> usize {
        self.collections.values().map(|m| m.len()).sum()
    }

    /// What this changeset implies for one cached key.
    ///
    /// Keys written after a `remove_all` of their collection report
    /// `Updated`; keys in a cleared collection with no later write report
    /// `Removed`; everything else reports `Unchanged`.
    pub fn hint_for(&self, key: &CacheKey) -> ChangeHint {
        if let Some(ops) = self.collections.get(&key.collection) {
            if let Some(op) = ops.get(&key.key) {
                return match op {
                    ChangeOp::Updated => ChangeHint::Updated,
                    ChangeOp::Removed => ChangeHint::Removed,
                };
            }
        }
        if self.cleared.contains(&key.collection) {
            return ChangeHint::Removed;
        }
        ChangeHint::Unchanged
    }
}

/// A cache-changeset block: derived from one [`Changeset`], reports what the
/// commit implies for any given key.
///
/// This is the only way cache views learn about writes. Boxed so schema
/// hooks can substitute their own derivation.
pub type ChangesetBlock = Box<dyn Fn(&CacheKey) -> ChangeHint + Send + Sync>;

// =============================================================================
// Memory Pressure
// =============================================================================

/// How aggressively `flush_memory` sheds cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushLevel {
    /// Keep everything.
    None,
    /// Trim each cache view to half its current population.
    Soft,
    /// Drop every entry from every cache view.
    Full,
}

// =============================================================================
// Checkpoint Policy
// =============================================================================

/// Who runs WAL checkpoints.
///
/// # The Trade-Off
///
/// Checkpointing moves WAL frames back into the main database file. Doing it
/// inline keeps the WAL slim but taxes every write commit; handing it to a
/// dedicated background lane makes writes complete faster at the cost of a
/// larger WAL between passes. A large WAL penalizes the next open, so the
/// default stays inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    /// SQLite auto-checkpoint stays enabled on every connection;
    /// checkpointing happens opportunistically during write commits.
    #[default]
    Inline,
    /// Auto-checkpoint is disabled everywhere; a low-priority background
    /// lane with its own read-write handle checkpoints after each commit.
    Dedicated,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// LRU capacity of each connection's object (value) cache. 0 disables.
    pub object_cache_limit: usize,

    /// LRU capacity of each connection's metadata (sidecar) cache. 0 disables.
    pub metadata_cache_limit: usize,

    /// Checkpoint policy; see [`CheckpointMode`].
    pub checkpoint_mode: CheckpointMode,

    /// Capacity of each connection's prepared-statement cache.
    pub statement_cache_capacity: usize,

    /// SQLite busy-handler budget. Lock contention past this surfaces as
    /// [`Error::Busy`](crate::Error::Busy).
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            object_cache_limit: 250,
            metadata_cache_limit: 500,
            checkpoint_mode: CheckpointMode::Inline,
            statement_cache_capacity: 20,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Successive clock reads are strictly increasing, even when the
    /// underlying timer hasn't ticked between calls.
    #[test]
    fn test_clock_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut prev = WriteTimestamp::ZERO;
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > prev, "clock went backwards: {} -> {}", prev, next);
            prev = next;
        }
    }

    #[test]
    fn test_timestamp_ordering_and_zero() {
        assert!(WriteTimestamp::ZERO.is_zero());
        assert!(!WriteTimestamp::from_raw(0.5).is_zero());
        assert!(WriteTimestamp::from_raw(1.0) < WriteTimestamp::from_raw(1.1));
        assert_eq!(WriteTimestamp::from_raw(2.5).as_raw(), 2.5);
    }

    /// `set(k, v); set(k, v)` coalesces to a single effective mutation.
    #[test]
    fn test_changeset_set_coalesces() {
        let mut cs = Changeset::new();
        cs.record_set("c", "k");
        cs.record_set("c", "k");

        assert_eq!(cs.len(), 1);
        assert_eq!(cs.hint_for(&CacheKey::new("c", "k")), ChangeHint::Updated);
    }

    /// `remove(k); remove(k)` is indistinguishable from `remove(k)`.
    #[test]
    fn test_changeset_remove_idempotent() {
        let mut cs = Changeset::new();
        cs.record_remove("c", "k");
        cs.record_remove("c", "k");

        assert_eq!(cs.len(), 1);
        assert_eq!(cs.hint_for(&CacheKey::new("c", "k")), ChangeHint::Removed);
    }

    /// Last writer wins within a transaction.
    #[test]
    fn test_changeset_last_writer_wins() {
        let mut cs = Changeset::new();
        cs.record_set("c", "k");
        cs.record_remove("c", "k");
        assert_eq!(cs.hint_for(&CacheKey::new("c", "k")), ChangeHint::Removed);

        cs.record_set("c", "k");
        assert_eq!(cs.hint_for(&CacheKey::new("c", "k")), ChangeHint::Updated);
    }

    /// `remove_all` clears the per-key map and hints removal for any key in
    /// the collection; later writes to the cleared collection hint update.
    #[test]
    fn test_changeset_remove_all() {
        let mut cs = Changeset::new();
        cs.record_set("c", "k1");
        cs.record_remove_all("c");

        assert_eq!(cs.hint_for(&CacheKey::new("c", "k1")), ChangeHint::Removed);
        assert_eq!(
            cs.hint_for(&CacheKey::new("c", "never-seen")),
            ChangeHint::Removed
        );
        assert_eq!(
            cs.hint_for(&CacheKey::new("other", "k1")),
            ChangeHint::Unchanged
        );

        cs.record_set("c", "k2");
        assert_eq!(cs.hint_for(&CacheKey::new("c", "k2")), ChangeHint::Updated);
        assert!(!cs.is_empty());
    }

    #[test]
    fn test_change_hint_raw_values() {
        assert_eq!(ChangeHint::Removed.as_raw(), -1);
        assert_eq!(ChangeHint::Unchanged.as_raw(), 0);
        assert_eq!(ChangeHint::Updated.as_raw(), 1);
        assert!(ChangeHint::Removed.invalidates());
        assert!(ChangeHint::Updated.invalidates());
        assert!(!ChangeHint::Unchanged.invalidates());
    }

    #[test]
    fn test_default_config() {
        let cfg = DatabaseConfig::default();
        assert_eq!(cfg.object_cache_limit, 250);
        assert_eq!(cfg.metadata_cache_limit, 500);
        assert_eq!(cfg.checkpoint_mode, CheckpointMode::Inline);
    }
}
