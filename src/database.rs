//! # The Database Coordinator
//!
//! This module implements the coordinator that lets many connections share
//! one SQLite file: it owns the snapshot clock, the per-connection
//! bookkeeping, and the changeset log, and it routes every commit's
//! invalidation traffic to sibling connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Clients                                 │
//! └───────┬──────────────────────┬──────────────────────┬────────────┘
//!         │                      │                      │
//!         ▼                      ▼                      ▼
//!  ┌─────────────┐        ┌─────────────┐        ┌─────────────┐
//!  │ Connection  │        │ Connection  │        │ Connection  │
//!  │   (lane)    │        │   (lane)    │        │   (lane)    │
//!  └──────┬──────┘        └──────┬──────┘        └──────┬──────┘
//!         │  begin/end, changesets, race repair         │
//!         └──────────────────────┼──────────────────────┘
//!                                ▼
//!                       ┌─────────────────┐     ┌──────────────────┐
//!                       │  Snapshot lane  │────▶│ Checkpoint lane  │
//!                       │  (coordinator)  │     │    (optional)    │
//!                       └────────┬────────┘     └──────────────────┘
//!                                │ broadcast (submit, never block)
//!                                ▼
//!                       sibling connection lanes
//! ```
//!
//! ## The Two Snapshots
//!
//! `lastWriteTimestamp` exists twice: in the coordinator's memory (the
//! "yap-level" snapshot, guarded by the snapshot lane) and inside SQLite
//! (the "sql-level" snapshot, a row of the `yap` table rewritten by every
//! read-write commit). Commits update SQL first, memory second — commits
//! are deliberately *not* run on the snapshot lane, because a commit can be
//! slow and must not block readers' bookkeeping. The price is a narrow race
//! (reader probes memory, writer commits, reader begins its SQLite
//! transaction) which the pre-read protocol detects by comparing the two
//! snapshots and repairs by replaying the intermediate changesets. That is
//! why [`note_pending_changes`](SnapshotState::note_pending_changes) runs
//! *before* the SQLite `COMMIT`: the moment a commit is visible at the SQL
//! level, its changeset is already fetchable from the log.
//!
//! ## Changeset Retention
//!
//! The committed log keeps every changeset newer than the oldest snapshot
//! any live connection still sits on, and prunes the rest as connections
//! advance or drop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::cache::SharedCache;
use crate::checkpoint::CheckpointWorker;
use crate::connection::{Connection, ConnectionCore};
use crate::error::{Error, Result};
use crate::lane::{Lane, LaneSender};
use crate::schema::{self, SchemaHooks};
use crate::types::{
    CacheKey, ChangeHint, Changeset, CheckpointMode, DatabaseConfig, MonotonicClock,
    WriteTimestamp,
};

// =============================================================================
// Connection Bookkeeping
// =============================================================================

/// What a connection is doing right now, as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    /// No transaction in flight.
    Idle,
    /// Inside a read transaction.
    Read,
    /// Inside a read-write transaction.
    ReadWrite,
}

/// The coordinator's per-connection record.
///
/// Owned by the snapshot lane; connections never touch their own record
/// directly. The record holds no strong reference back to the
/// [`Connection`] — only a lane sender, so dropping the last user handle
/// actually tears the connection down.
pub struct ConnectionState {
    /// Stable id, assigned at registration.
    pub id: u64,

    /// Submission handle for the connection's lane (broadcast target).
    pub(crate) lane: LaneSender<ConnectionCore>,

    /// Current transaction phase.
    pub phase: TransactionPhase,

    /// The snapshot this connection has fully processed. Changesets at or
    /// below this stamp can never be needed by this connection again.
    pub snapshot: WriteTimestamp,
}

// =============================================================================
// Snapshot Lane State
// =============================================================================

/// Everything the snapshot lane owns. Jobs on the lane are the only code
/// that ever sees this struct; there is deliberately no lock anywhere in it.
pub struct SnapshotState {
    /// The coordinator's own SQLite handle (open-time init, `prepare` hook).
    conn: rusqlite::Connection,

    /// The yap-level snapshot: stamp of the newest committed write.
    last_write_timestamp: WriteTimestamp,

    /// One record per live connection.
    states: Vec<ConnectionState>,

    /// Changesets reported before their SQLite `COMMIT`, in stamp order.
    pending: Vec<Arc<Changeset>>,

    /// Changesets whose `COMMIT` succeeded, in stamp order.
    committed: Vec<Arc<Changeset>>,
}

impl SnapshotState {
    /// Passes each connection state to `f`.
    ///
    /// Only reachable from snapshot-lane jobs, which is exactly the access
    /// rule: all `ConnectionState` traffic happens on this lane.
    pub fn enumerate_connection_states(&self, mut f: impl FnMut(&ConnectionState)) {
        for state in &self.states {
            f(state);
        }
    }

    /// The yap-level snapshot.
    pub fn last_write_timestamp(&self) -> WriteTimestamp {
        self.last_write_timestamp
    }

    fn state_mut(&mut self, id: u64) -> Option<&mut ConnectionState> {
        self.states.iter_mut().find(|s| s.id == id)
    }

    /// Appends a changeset to the pending log. Runs before the reporting
    /// connection issues its SQLite `COMMIT`.
    fn note_pending_changes(&mut self, changeset: Arc<Changeset>, from: u64) {
        trace!(
            ts = changeset.last_write_timestamp.as_raw(),
            from,
            "pending changeset"
        );
        self.pending.push(changeset);
    }

    /// Promotes a pending changeset to committed and returns the sibling
    /// broadcast list. Runs after the SQLite `COMMIT` succeeded.
    fn note_committed_changes(
        &mut self,
        changeset: &Arc<Changeset>,
        from: u64,
    ) -> Vec<LaneSender<ConnectionCore>> {
        let ts = changeset.last_write_timestamp;
        self.pending
            .retain(|cs| cs.last_write_timestamp != ts);
        self.committed.push(Arc::clone(changeset));
        self.last_write_timestamp = ts;

        // The writer has trivially processed its own commit.
        if let Some(state) = self.state_mut(from) {
            state.snapshot = ts;
        }

        trace!(ts = ts.as_raw(), from, "committed changeset");

        self.states
            .iter()
            .filter(|s| s.id != from)
            .map(|s| s.lane.clone())
            .collect()
    }

    /// Discards a pending changeset after a failed commit.
    fn note_rolled_back(&mut self, ts: WriteTimestamp, from: u64) {
        self.pending.retain(|cs| cs.last_write_timestamp != ts);
        trace!(ts = ts.as_raw(), from, "rolled back changeset");
    }

    /// All pending and committed changesets in `(since, until]`, in stamp
    /// order. This is the race-repair fetch.
    fn pending_and_committed_changes_since(
        &self,
        since: WriteTimestamp,
        until: WriteTimestamp,
    ) -> Vec<Arc<Changeset>> {
        let mut out: Vec<Arc<Changeset>> = self
            .committed
            .iter()
            .chain(self.pending.iter())
            .filter(|cs| cs.last_write_timestamp > since && cs.last_write_timestamp <= until)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.last_write_timestamp
                .partial_cmp(&b.last_write_timestamp)
                .expect("changeset stamps are never NaN")
        });
        out
    }

    /// Records that a connection has fully processed changesets up to `ts`,
    /// then prunes the committed log.
    fn note_processed(&mut self, id: u64, ts: WriteTimestamp) {
        if let Some(state) = self.state_mut(id) {
            if ts > state.snapshot {
                state.snapshot = ts;
            }
        }
        self.prune();
    }

    /// Drops committed changesets no live connection can still need.
    fn prune(&mut self) {
        let Some(floor) = self
            .states
            .iter()
            .map(|s| s.snapshot)
            .min_by(|a, b| a.partial_cmp(b).expect("snapshots are never NaN"))
        else {
            // No connections: the whole committed log is unreachable.
            self.committed.clear();
            return;
        };
        self.committed
            .retain(|cs| cs.last_write_timestamp > floor);
    }
}

// =============================================================================
// Shared Coordinator Handle
// =============================================================================

/// State shared between the [`Database`] handle and every [`Connection`].
pub(crate) struct DatabaseShared {
    pub(crate) path: String,
    pub(crate) config: DatabaseConfig,
    pub(crate) hooks: Arc<SchemaHooks>,
    pub(crate) cache: SharedCache,

    /// The snapshot clock. Commits stamp their changesets from here.
    pub(crate) clock: MonotonicClock,

    /// Submission handle for the snapshot lane.
    pub(crate) snapshot: LaneSender<SnapshotState>,

    /// The write lane. One read-write transaction holds it from begin to
    /// commit/rollback, externally enforcing SQLite's single-writer rule.
    /// It admits work rather than running it (the transaction body must run
    /// on its connection's lane, where the SQLite handle lives), so a mutex
    /// is the whole implementation.
    pub(crate) write_gate: Mutex<()>,

    /// Set once by a fatal corruption; checked at every entry point.
    closed: AtomicBool,

    /// The persisted `lastWriteTimestamp` found at open, before the reset.
    /// A watermark from a previous process lifetime; diagnostics only.
    pub(crate) previous_write_watermark: WriteTimestamp,

    /// Background checkpoint worker, in [`CheckpointMode::Dedicated`] only.
    pub(crate) checkpoint: Option<CheckpointWorker>,

    next_connection_id: AtomicU64,
}

impl DatabaseShared {
    /// Whether the database has been fatally closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the database fatally closed. Every connection becomes invalid;
    /// pending async work completes with [`Error::Cancelled`].
    pub(crate) fn mark_corrupt(&self, reason: &str) {
        warn!(reason, "database marked corrupt, closing");
        self.closed.store(true, Ordering::Release);
    }

    /// Guard used at every client entry point.
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot-lane requests (connections call these from their own lanes)
    // -------------------------------------------------------------------------

    /// Marks the connection as entering a transaction and returns the
    /// yap-level snapshot it should expect at the SQL level.
    pub(crate) fn begin_transaction(
        &self,
        id: u64,
        phase: TransactionPhase,
    ) -> Result<WriteTimestamp> {
        self.snapshot.run(move |state| {
            let ts = state.last_write_timestamp;
            if let Some(s) = state.state_mut(id) {
                s.phase = phase;
                s.snapshot = ts;
            }
            ts
        })
    }

    /// Marks the connection idle at `snapshot` and prunes the log.
    pub(crate) fn end_transaction(&self, id: u64, snapshot: WriteTimestamp) -> Result<()> {
        self.snapshot.run(move |state| {
            if let Some(s) = state.state_mut(id) {
                s.phase = TransactionPhase::Idle;
                s.snapshot = snapshot;
            }
            state.prune();
        })
    }

    /// Reports a changeset before its SQLite `COMMIT`.
    pub(crate) fn note_pending_changes(&self, changeset: Arc<Changeset>, from: u64) -> Result<()> {
        self.snapshot
            .run(move |state| state.note_pending_changes(changeset, from))
    }

    /// Reports a successful commit: promotes the changeset, advances the
    /// yap-level snapshot, broadcasts invalidation to every sibling, and
    /// signals the checkpoint worker.
    ///
    /// The broadcast is submit-only. Each sibling lane applies the block to
    /// its cache views when it gets there, then reports back so the log can
    /// be pruned.
    pub(crate) fn note_committed_changes(&self, changeset: Arc<Changeset>, from: u64) -> Result<()> {
        let block: Arc<dyn Fn(&CacheKey) -> ChangeHint + Send + Sync> =
            Arc::from((self.hooks.cache_changeset_block)(&changeset));

        let siblings = self.snapshot.run({
            let changeset = Arc::clone(&changeset);
            move |state| state.note_committed_changes(&changeset, from)
        })?;

        for lane in siblings {
            let changeset = Arc::clone(&changeset);
            let block = Arc::clone(&block);
            // A sibling that already shut down is fine to skip: its state
            // record goes away with it.
            let _ = lane.submit(move |core| core.apply_committed_changes(&changeset, &block));
        }

        if let Some(worker) = &self.checkpoint {
            worker.maybe_run_checkpoint();
        }

        Ok(())
    }

    /// Discards a pending changeset after a failed commit.
    pub(crate) fn note_rolled_back(&self, ts: WriteTimestamp, from: u64) -> Result<()> {
        self.snapshot
            .run(move |state| state.note_rolled_back(ts, from))
    }

    /// The race-repair fetch: every changeset in `(since, until]`.
    pub(crate) fn pending_and_committed_changes_since(
        &self,
        since: WriteTimestamp,
        until: WriteTimestamp,
    ) -> Result<Vec<Arc<Changeset>>> {
        self.snapshot
            .run(move |state| state.pending_and_committed_changes_since(since, until))
    }

    /// A connection reporting it has processed broadcasts up to `ts`.
    /// Submit-only: called from sibling lanes, must never block them.
    pub(crate) fn note_processed(&self, id: u64, ts: WriteTimestamp) {
        let _ = self.snapshot.submit(move |state| state.note_processed(id, ts));
    }

    /// Removes a connection's record and prunes the log. Called from
    /// [`Connection`]'s teardown.
    pub(crate) fn drop_connection(&self, id: u64) {
        let _ = self.snapshot.run(move |state| {
            state.states.retain(|s| s.id != id);
            state.prune();
        });
        debug!(id, "connection dropped");
    }
}

// =============================================================================
// Database
// =============================================================================

/// An open snapdb database: the SQLite file plus its coordination state.
///
/// `Database` is a cheap cloneable handle; the coordinator itself lives as
/// long as any handle or [`Connection`] does. All data access goes through
/// connections — the `Database` only opens the file and mints them.
///
/// # Example
///
/// ```rust,ignore
/// use snapdb::{Database, DatabaseConfig};
///
/// let db = Database::open("app.db", DatabaseConfig::default())?;
/// let conn = db.new_connection()?;
///
/// conn.read_write(|tx| {
///     tx.set("settings", "theme", b"dark".to_vec())?;
///     Ok(())
/// })?;
///
/// let theme = conn.read(|tx| tx.get("settings", "theme"))?;
/// assert_eq!(theme, Some(b"dark".to_vec()));
/// ```
#[derive(Clone)]
pub struct Database {
    shared: Arc<DatabaseShared>,
}

impl Database {
    /// Opens (creating if necessary) a database with the default `kv`
    /// schema hooks.
    ///
    /// # Errors
    ///
    /// - [`Error::Open`] if the file cannot be opened or is not a database
    /// - [`Error::SchemaMismatch`] if the file was written by a newer build
    /// - [`Error::Corrupt`] if engine metadata is malformed
    pub fn open(path: impl AsRef<std::path::Path>, config: DatabaseConfig) -> Result<Self> {
        Self::open_with_hooks(path, config, SchemaHooks::default())
    }

    /// Opens a database with a custom schema bound through `hooks`.
    pub fn open_with_hooks(
        path: impl AsRef<std::path::Path>,
        config: DatabaseConfig,
        hooks: SchemaHooks,
    ) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let hooks = Arc::new(hooks);

        let conn = schema::open_handle(&path, &config)?;
        let watermark = schema::initialize(&conn, &hooks)?;

        debug!(
            path = %path,
            watermark = watermark.as_raw(),
            "database opened"
        );

        let snapshot_lane = Lane::spawn(
            "snapdb-snapshot",
            SnapshotState {
                conn,
                last_write_timestamp: WriteTimestamp::ZERO,
                states: Vec::new(),
                pending: Vec::new(),
                committed: Vec::new(),
            },
        );
        let snapshot = snapshot_lane.sender();
        drop(snapshot_lane); // detached; lives while senders do

        // The prepare hook is warm-up, run asynchronously on the snapshot
        // lane like everything else that touches the coordinator's handle.
        {
            let hooks = Arc::clone(&hooks);
            snapshot.submit(move |state| {
                if let Err(err) = (hooks.prepare)(&state.conn) {
                    warn!(%err, "prepare hook failed");
                }
            })?;
        }

        let checkpoint = match config.checkpoint_mode {
            CheckpointMode::Inline => None,
            CheckpointMode::Dedicated => Some(CheckpointWorker::spawn(&path, &config)?),
        };

        let cache = SharedCache::new(config.object_cache_limit, config.metadata_cache_limit);

        Ok(Self {
            shared: Arc::new(DatabaseShared {
                path,
                config,
                hooks,
                cache,
                clock: MonotonicClock::new(),
                snapshot,
                write_gate: Mutex::new(()),
                closed: AtomicBool::new(false),
                previous_write_watermark: watermark,
                checkpoint,
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    /// Creates a fresh connection against the same file.
    ///
    /// The connection gets its own SQLite handle, its own serial lane, and
    /// fresh (empty) cache views; the coordinator registers its bookkeeping
    /// record on the snapshot lane.
    pub fn new_connection(&self) -> Result<Connection> {
        self.shared.check_open()?;
        let id = self
            .shared
            .next_connection_id
            .fetch_add(1, Ordering::Relaxed);
        Connection::open(Arc::clone(&self.shared), id)
    }

    /// The filesystem path of the SQLite file.
    pub fn path(&self) -> &str {
        &self.shared.path
    }

    /// The configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.shared.config
    }

    /// The current yap-level snapshot: stamp of the newest committed write,
    /// zero if this process hasn't written yet.
    pub fn last_write_timestamp(&self) -> Result<WriteTimestamp> {
        self.shared
            .snapshot
            .run(|state| state.last_write_timestamp())
    }

    /// The persisted `lastWriteTimestamp` found at open time, before it was
    /// reset — i.e. the last process's final write stamp. Diagnostics only.
    pub fn previous_write_watermark(&self) -> WriteTimestamp {
        self.shared.previous_write_watermark
    }

    /// Forces a synchronous checkpoint pass. Debugging aid; only meaningful
    /// in [`CheckpointMode::Dedicated`] (inline mode checkpoints by itself).
    pub fn sync_checkpoint(&self) -> Result<()> {
        match &self.shared.checkpoint {
            Some(worker) => worker.sync_checkpoint(),
            None => Ok(()),
        }
    }

    /// Number of changesets currently in the committed log. Introspection
    /// for tests and debugging; the log prunes as connections advance.
    pub fn committed_changeset_count(&self) -> Result<usize> {
        self.shared.snapshot.run(|state| state.committed.len())
    }

    /// Number of changesets currently pending (reported but not yet
    /// committed). Introspection for tests and debugging.
    pub fn pending_changeset_count(&self) -> Result<usize> {
        self.shared.snapshot.run(|state| state.pending.len())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

// Registration is in database.rs rather than connection.rs so that all
// mutation of the states list stays next to the rest of the snapshot-lane
// code.
impl DatabaseShared {
    /// Registers a freshly created connection's bookkeeping record.
    pub(crate) fn register_connection(
        &self,
        id: u64,
        lane: LaneSender<ConnectionCore>,
    ) -> Result<()> {
        self.snapshot.run(move |state| {
            let snapshot = state.last_write_timestamp;
            state.states.push(ConnectionState {
                id,
                lane,
                phase: TransactionPhase::Idle,
                snapshot,
            });
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_state() -> SnapshotState {
        SnapshotState {
            conn: rusqlite::Connection::open_in_memory().unwrap(),
            last_write_timestamp: WriteTimestamp::ZERO,
            states: Vec::new(),
            pending: Vec::new(),
            committed: Vec::new(),
        }
    }

    fn changeset(ts: f64) -> Arc<Changeset> {
        let mut cs = Changeset::new();
        cs.record_set("c", "k");
        cs.last_write_timestamp = WriteTimestamp::from_raw(ts);
        Arc::new(cs)
    }

    #[test]
    fn test_pending_to_committed_flow() {
        let mut state = snapshot_state();

        state.note_pending_changes(changeset(1.0), 7);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.committed.len(), 0);
        assert!(state.last_write_timestamp().is_zero());

        state.note_committed_changes(&changeset(1.0), 7);
        assert_eq!(state.pending.len(), 0);
        assert_eq!(state.committed.len(), 1);
        assert_eq!(state.last_write_timestamp().as_raw(), 1.0);
    }

    #[test]
    fn test_rolled_back_discards_pending() {
        let mut state = snapshot_state();
        state.note_pending_changes(changeset(1.0), 7);
        state.note_rolled_back(WriteTimestamp::from_raw(1.0), 7);
        assert!(state.pending.is_empty());
        assert!(state.last_write_timestamp().is_zero());
    }

    /// The race-repair fetch returns `(since, until]`, pending included,
    /// in stamp order.
    #[test]
    fn test_changes_since_window() {
        let mut state = snapshot_state();
        state.note_pending_changes(changeset(1.0), 1);
        state.note_committed_changes(&changeset(1.0), 1);
        state.note_pending_changes(changeset(2.0), 1);
        state.note_committed_changes(&changeset(2.0), 1);
        state.note_pending_changes(changeset(3.0), 1);

        let window = state.pending_and_committed_changes_since(
            WriteTimestamp::from_raw(1.0),
            WriteTimestamp::from_raw(3.0),
        );
        let stamps: Vec<f64> = window
            .iter()
            .map(|cs| cs.last_write_timestamp.as_raw())
            .collect();
        assert_eq!(stamps, vec![2.0, 3.0]);

        // The lower bound is exclusive, the upper inclusive.
        let none = state.pending_and_committed_changes_since(
            WriteTimestamp::from_raw(3.0),
            WriteTimestamp::from_raw(3.0),
        );
        assert!(none.is_empty());
    }

    /// With no live connections, the whole committed log is unreachable
    /// and pruning clears it. (Retention against a slow reader is covered
    /// end-to-end in the integration tests, where real connections exist.)
    #[test]
    fn test_prune_without_connections_clears_log() {
        let mut state = snapshot_state();
        for ts in [1.0, 2.0, 3.0] {
            state.note_pending_changes(changeset(ts), 1);
            state.note_committed_changes(&changeset(ts), 1);
        }
        assert_eq!(state.committed.len(), 3);

        state.prune();
        assert_eq!(state.committed.len(), 0);
    }
}
