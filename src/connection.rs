//! # Connections
//!
//! A [`Connection`] is one reader-or-writer view onto the database: a
//! private SQLite handle bound to its own serial lane, plus cache views
//! that stay coherent with the coordinator's committed history.
//!
//! ## The Pre-Read Protocol
//!
//! Beginning a transaction is where the engine earns its keep. The
//! connection must end up with (a) a SQLite snapshot, (b) caches coherent
//! with that snapshot, and (c) the coordinator knowing which snapshot it
//! sits on:
//!
//! ```text
//! 1. snapshot lane:  T_yap = coordinator's lastWriteTimestamp
//! 2. this lane:      BEGIN DEFERRED
//! 3. this lane:      T_sql = SELECT lastWriteTimestamp FROM yap
//! 4. T_sql > T_yap   -> commit race: a writer committed between 1 and 2.
//!                       Replay the intermediate changesets onto the caches.
//! 5. T_sql == cache  -> caches still valid, keep them
//! 6. T_sql < cache   -> snapshots ran backwards: corruption, fatal
//! 7. otherwise       -> caches stale with no replayable gap: flush
//! ```
//!
//! The write path is symmetric, plus the write gate acquired up front and
//! the changeset publication on the way out (pending before `COMMIT`,
//! committed after — see [`crate::database`] for why that order matters).
//!
//! ## Threading
//!
//! Every operation that touches the SQLite handle or the cache views runs
//! as one job on the connection's lane: `read`/`read_write` ship the whole
//! pre → block → post span as a single closure and wait for it, the async
//! variants ship the same closure and resolve a oneshot instead.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::cache::CacheView;
use crate::codec::{self, LAST_WRITE_TIMESTAMP_KEY};
use crate::database::{DatabaseShared, TransactionPhase};
use crate::error::{Error, Result};
use crate::lane::{Lane, LaneSender};
use crate::schema;
use crate::transaction::{Transaction, TransactionKind};
use crate::types::{CacheKey, ChangeHint, Changeset, FlushLevel, WriteTimestamp};

// =============================================================================
// Connection Core (lane-owned state)
// =============================================================================

/// Everything the connection's lane owns. Only lane jobs ever see this.
pub(crate) struct ConnectionCore {
    pub(crate) id: u64,
    pub(crate) shared: Arc<DatabaseShared>,

    /// The private SQLite handle.
    pub(crate) conn: rusqlite::Connection,

    /// Cached user values.
    pub(crate) object_cache: CacheView<Vec<u8>>,

    /// Cached per-row metadata sidecars (`None` = row has no metadata).
    pub(crate) metadata_cache: CacheView<Option<Vec<u8>>>,

    /// The snapshot the caches are coherent with. Zero until the first
    /// transaction or broadcast.
    pub(crate) cache_last_write_timestamp: WriteTimestamp,

    /// Whether the current transaction has taken its SQL-level shared read
    /// lock (the snapshot SELECT guarantees it). Once set, no further race
    /// checks are needed within the transaction.
    pub(crate) has_marked_sql_level_shared_read_lock: bool,

    /// Fault injection: one-shot pause between the snapshot-lane probe and
    /// `BEGIN DEFERRED`, widening the commit-race window for tests.
    pre_begin_pause: Option<Duration>,

    /// Fault injection: one-shot forced commit failure.
    fail_next_commit: bool,
}

impl ConnectionCore {
    // -------------------------------------------------------------------------
    // Statement helpers
    // -------------------------------------------------------------------------
    // BEGIN/COMMIT/ROLLBACK and the yap accessors all go through rusqlite's
    // prepared-statement cache: prepared once, reused, finalized when the
    // handle drops or the LRU evicts them.

    fn execute_begin(&self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("BEGIN DEFERRED")?;
        stmt.execute([]).map_err(map_busy)?;
        Ok(())
    }

    fn execute_commit(&self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("COMMIT")?;
        stmt.execute([]).map_err(map_busy)?;
        Ok(())
    }

    fn execute_rollback(&self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached("ROLLBACK")?;
        stmt.execute([])?;
        Ok(())
    }

    /// Reads the SQL-level snapshot from inside the open transaction.
    fn read_sql_snapshot(&self) -> Result<WriteTimestamp> {
        match schema::yap_get(&self.conn, LAST_WRITE_TIMESTAMP_KEY)? {
            Some(blob) => codec::decode_timestamp(&blob),
            None => Err(Error::Corrupt(
                "yap table has no lastWriteTimestamp row".to_string(),
            )),
        }
    }

    /// Rewrites the SQL-level snapshot from inside the open transaction.
    fn write_sql_snapshot(&self, ts: WriteTimestamp) -> Result<()> {
        schema::yap_set(
            &self.conn,
            LAST_WRITE_TIMESTAMP_KEY,
            &codec::encode_timestamp(ts),
        )
    }

    // -------------------------------------------------------------------------
    // Pre/Post Protocols
    // -------------------------------------------------------------------------

    /// Steps 1–7: align the SQLite snapshot, the caches, and the
    /// coordinator's view of this connection.
    fn pre_transaction(&mut self, phase: TransactionPhase) -> Result<()> {
        // Step 1: the yap-level snapshot, from the snapshot lane.
        let t_yap = self.shared.begin_transaction(self.id, phase)?;

        if let Some(pause) = self.pre_begin_pause.take() {
            // Test instrumentation: sit in the race window.
            std::thread::sleep(pause);
        }

        // Step 2: begin. DEFERRED — no locks yet.
        self.has_marked_sql_level_shared_read_lock = false;
        self.execute_begin()?;

        // Step 3: the sql-level snapshot. This SELECT takes the shared read
        // lock, pinning the WAL snapshot for the rest of the transaction.
        let t_sql = self.read_sql_snapshot()?;
        self.has_marked_sql_level_shared_read_lock = true;

        self.align_caches(t_yap, t_sql)
    }

    /// Steps 4–7 of the pre-read protocol.
    fn align_caches(&mut self, t_yap: WriteTimestamp, t_sql: WriteTimestamp) -> Result<()> {
        let cache_ts = self.cache_last_write_timestamp;

        // Step 6 first: it is the invariant everything else relies on.
        if t_sql < cache_ts {
            return Err(Error::Corrupt(format!(
                "sql snapshot {t_sql} is older than cache snapshot {cache_ts}"
            )));
        }
        if t_sql < t_yap {
            return Err(Error::Corrupt(format!(
                "sql snapshot {t_sql} is older than yap snapshot {t_yap}"
            )));
        }

        // Step 5: caches already coherent with this snapshot.
        if t_sql == cache_ts {
            return Ok(());
        }

        if t_sql > t_yap && cache_ts == t_yap {
            // Step 4, the commit race: a writer committed between our probe
            // and our BEGIN. Our caches are current to t_yap, and the log
            // still holds everything after it — replay instead of flushing.
            trace!(
                id = self.id,
                t_yap = t_yap.as_raw(),
                t_sql = t_sql.as_raw(),
                "commit race detected, replaying changesets"
            );
            let gap = self
                .shared
                .pending_and_committed_changes_since(t_yap, t_sql)?;
            for changeset in gap {
                let block = (self.shared.hooks.cache_changeset_block)(&changeset);
                self.object_cache.apply(&block);
                self.metadata_cache.apply(&block);
            }
        } else {
            // Step 7: the caches are behind with no gap we can replay from
            // a known-coherent base (broadcasts still queued behind this
            // job, or a race on top of them). Flush outright.
            self.object_cache.drop_all();
            self.metadata_cache.drop_all();
        }

        self.cache_last_write_timestamp = t_sql;
        Ok(())
    }

    /// Cleanup when the pre-phase itself failed partway.
    fn abort_failed_pre(&mut self, err: &Error) {
        if err.is_fatal() {
            self.shared.mark_corrupt(&err.to_string());
        }
        // BEGIN may or may not have happened; a spurious ROLLBACK is a
        // harmless error.
        let _ = self.execute_rollback();
        self.has_marked_sql_level_shared_read_lock = false;
        let _ = self
            .shared
            .end_transaction(self.id, self.cache_last_write_timestamp);
    }

    /// Post-phase of a read transaction: end the SQLite snapshot, report
    /// idle.
    fn post_read_transaction(&mut self) -> Result<()> {
        // Every transaction pinned its snapshot during the pre-phase.
        debug_assert!(self.has_marked_sql_level_shared_read_lock);
        let commit = self.execute_commit();
        self.has_marked_sql_level_shared_read_lock = false;
        self.shared
            .end_transaction(self.id, self.cache_last_write_timestamp)?;
        commit
    }

    // -------------------------------------------------------------------------
    // Transaction Execution
    // -------------------------------------------------------------------------

    /// The whole read span: pre, block, post.
    pub(crate) fn execute_read<R>(
        &mut self,
        block: impl FnOnce(&mut Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        self.shared.check_open()?;
        if let Err(err) = self.pre_transaction(TransactionPhase::Read) {
            self.abort_failed_pre(&err);
            return Err(err);
        }

        let result = {
            let mut tx = Transaction::new(self, TransactionKind::Read);
            let r = block(&mut tx);
            tx.expire();
            r
        };

        let post = self.post_read_transaction();
        match (result, post) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// The whole read-write span: gate, pre, block, publish/commit or
    /// rollback, release.
    pub(crate) fn execute_read_write<R>(
        &mut self,
        block: impl FnOnce(&mut Transaction<'_>) -> Result<R>,
    ) -> Result<R> {
        self.shared.check_open()?;

        // The write lane: held from here to commit/rollback. A poisoned
        // gate means a previous writer's thread died mid-transaction; its
        // handle was dropped, which rolled its work back, so the gate
        // itself is safe to reuse.
        let shared = Arc::clone(&self.shared);
        let _gate = shared
            .write_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Err(err) = self.pre_transaction(TransactionPhase::ReadWrite) {
            self.abort_failed_pre(&err);
            return Err(err);
        }

        let (result, changeset) = {
            let mut tx = Transaction::new(self, TransactionKind::ReadWrite);
            let r = block(&mut tx);
            let changeset = tx.take_changeset();
            tx.expire();
            (r, changeset)
        };

        match result {
            Ok(value) => {
                self.commit_read_write(changeset)?;
                Ok(value)
            }
            Err(err) => {
                // Automatic rollback; the changeset is never published.
                self.rollback_read_write(&changeset);
                Err(err)
            }
        }
    }

    /// Post-read-write, success path: stamp, publish pending, `COMMIT`,
    /// publish committed.
    fn commit_read_write(&mut self, mut changeset: Changeset) -> Result<()> {
        if changeset.is_empty() {
            // Nothing was written: end the SQLite transaction without
            // minting a snapshot or waking the siblings.
            let commit = self.execute_commit();
            self.has_marked_sql_level_shared_read_lock = false;
            self.shared
                .end_transaction(self.id, self.cache_last_write_timestamp)?;
            return commit;
        }

        // Step 1: stamp with a fresh monotonic timestamp.
        let ts = self.shared.clock.next();
        changeset.last_write_timestamp = ts;
        let changeset = Arc::new(changeset);

        // Step 2: pending, before the commit is visible at the SQL level.
        self.shared
            .note_pending_changes(Arc::clone(&changeset), self.id)?;

        // Step 3: persist the new sql-level snapshot inside the
        // transaction, then commit.
        let commit_result = self
            .write_sql_snapshot(ts)
            .and_then(|()| {
                if self.fail_next_commit {
                    self.fail_next_commit = false;
                    Err(Error::Sqlite(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                        Some("injected commit failure".to_string()),
                    )))
                } else {
                    self.execute_commit()
                }
            });

        match commit_result {
            Ok(()) => {
                // Step 4: committed; the coordinator broadcasts to siblings.
                self.cache_last_write_timestamp = ts;
                self.has_marked_sql_level_shared_read_lock = false;
                self.shared
                    .note_committed_changes(Arc::clone(&changeset), self.id)?;
                self.shared.end_transaction(self.id, ts)?;
                trace!(id = self.id, ts = ts.as_raw(), "read-write committed");
                Ok(())
            }
            Err(err) => {
                let _ = self.execute_rollback();
                self.has_marked_sql_level_shared_read_lock = false;
                self.shared.note_rolled_back(ts, self.id)?;
                self.shared
                    .end_transaction(self.id, self.cache_last_write_timestamp)?;
                // The caches absorbed this transaction's writes as they
                // happened; those entries are now lies.
                self.evict_changeset_entries(&changeset);
                let source = match err {
                    Error::Sqlite(e) => e,
                    other => {
                        // Snapshot write failed before COMMIT was attempted.
                        return Err(other);
                    }
                };
                Err(Error::CommitFailed(source))
            }
        }
    }

    /// Post-read-write, error path: roll back and scrub the caches.
    fn rollback_read_write(&mut self, changeset: &Changeset) {
        let _ = self.execute_rollback();
        self.has_marked_sql_level_shared_read_lock = false;
        let _ = self
            .shared
            .end_transaction(self.id, self.cache_last_write_timestamp);
        self.evict_changeset_entries(changeset);
    }

    /// Drops every cache entry a (now rolled-back) changeset touched.
    fn evict_changeset_entries(&mut self, changeset: &Changeset) {
        self.object_cache.apply(|k| changeset.hint_for(k));
        self.metadata_cache.apply(|k| changeset.hint_for(k));
    }

    // -------------------------------------------------------------------------
    // Broadcast Receiver
    // -------------------------------------------------------------------------

    /// Applies a sibling's committed changeset to this connection's caches.
    ///
    /// Submitted by the coordinator after every commit; FIFO lane order
    /// means changesets arrive in commit order, strictly between this
    /// connection's own transactions.
    pub(crate) fn apply_committed_changes(
        &mut self,
        changeset: &Arc<Changeset>,
        block: &Arc<dyn Fn(&CacheKey) -> ChangeHint + Send + Sync>,
    ) {
        let ts = changeset.last_write_timestamp;
        if ts <= self.cache_last_write_timestamp {
            // Already accounted for: the race-repair replay (or our own
            // pre-read flush) beat this broadcast to it.
            return;
        }
        self.object_cache.apply(|k| block(k));
        self.metadata_cache.apply(|k| block(k));
        self.cache_last_write_timestamp = ts;
        // Tell the coordinator so the changeset log can be pruned.
        self.shared.note_processed(self.id, ts);
    }
}

/// SQLite busy errors get their own variant: they mean cross-process
/// contention the engine's own write gate cannot prevent.
fn map_busy(err: rusqlite::Error) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy =>
        {
            Error::Busy
        }
        other => Error::Sqlite(other),
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One reader-or-writer view onto a [`Database`](crate::Database).
///
/// A connection owns a private SQLite handle, a serial lane, and private
/// cache views. It may hold at most one transaction at a time; transactions
/// from different connections run concurrently under SQLite's WAL rules,
/// with read-write transactions serialized by the database's write lane.
///
/// `Connection` is `Send + Sync`; wrap it in an `Arc` to share across
/// threads. Work submitted to one connection executes in strict submission
/// order.
///
/// # Example
///
/// ```rust,ignore
/// let conn = db.new_connection()?;
///
/// conn.read_write(|tx| {
///     tx.set("people", "alice", b"{...}".to_vec())?;
///     tx.remove("people", "bob")?;
///     Ok(())
/// })?;
///
/// let alice = conn.read(|tx| tx.get("people", "alice"))?;
/// ```
pub struct Connection {
    id: u64,
    lane: LaneSender<ConnectionCore>,
    shared: Arc<DatabaseShared>,
}

impl Connection {
    /// Opens a fresh handle and registers with the coordinator. Called by
    /// [`Database::new_connection`](crate::Database::new_connection).
    pub(crate) fn open(shared: Arc<DatabaseShared>, id: u64) -> Result<Self> {
        let conn = schema::open_handle(&shared.path, &shared.config)?;

        let core = ConnectionCore {
            id,
            shared: Arc::clone(&shared),
            conn,
            object_cache: shared.cache.object_view(),
            metadata_cache: shared.cache.metadata_view(),
            cache_last_write_timestamp: WriteTimestamp::ZERO,
            has_marked_sql_level_shared_read_lock: false,
            pre_begin_pause: None,
            fail_next_commit: false,
        };

        let lane = Lane::spawn(&format!("snapdb-conn-{id}"), core);
        let sender = lane.sender();
        drop(lane); // detached; exits when the senders drop

        shared.register_connection(id, sender.clone())?;
        debug!(id, "connection opened");

        Ok(Self {
            id,
            lane: sender,
            shared,
        })
    }

    /// Guard against calling back into the same connection from inside one
    /// of its own transaction blocks: the lane would wait on itself.
    fn assert_not_reentrant(&self) {
        assert!(
            !self.lane.is_current(),
            "connection {} used from inside its own transaction block; \
             use the transaction instead",
            self.id
        );
    }

    /// Runs a read transaction synchronously.
    ///
    /// The block sees a stable snapshot of the database: writes committed
    /// by other connections after this transaction began are not visible.
    ///
    /// # Errors
    ///
    /// Errors returned by the block propagate unchanged; the read
    /// transaction is ended either way.
    pub fn read<F, R>(&self, block: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.assert_not_reentrant();
        self.lane.run(move |core| core.execute_read(block))?
    }

    /// Runs a read-write transaction synchronously.
    ///
    /// At most one read-write transaction exists in the whole database at
    /// any instant; this call blocks while another connection holds the
    /// write lane.
    ///
    /// # Errors
    ///
    /// - An `Err` from the block rolls the transaction back and propagates;
    ///   nothing is published.
    /// - [`Error::CommitFailed`] if SQLite rejected the commit; the
    ///   transaction is rolled back and its changeset discarded.
    pub fn read_write<F, R>(&self, block: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.assert_not_reentrant();
        self.lane.run(move |core| core.execute_read_write(block))?
    }

    /// Runs a read transaction asynchronously.
    ///
    /// The block is enqueued on the connection's lane *at call time* — two
    /// `async_read_write` calls made back to back execute in that order,
    /// awaited or not. The returned future resolves after the post-phase
    /// completes. Dropping the future does not cancel the block —
    /// cancellation is cooperative at lane-task boundaries — it only
    /// discards the result.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] if the connection closed before the block ran.
    pub fn async_read<F, R>(&self, block: F) -> impl std::future::Future<Output = Result<R>>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let submitted = self.lane.submit(move |core| {
            let result = core.execute_read(block);
            let _ = done_tx.send(result);
        });
        async move {
            submitted?;
            done_rx.await.map_err(|_| Error::Cancelled)?
        }
    }

    /// Runs a read-write transaction asynchronously. See
    /// [`Connection::async_read`] for enqueue, completion, and cancellation
    /// semantics.
    pub fn async_read_write<F, R>(&self, block: F) -> impl std::future::Future<Output = Result<R>>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let submitted = self.lane.submit(move |core| {
            let result = core.execute_read_write(block);
            let _ = done_tx.send(result);
        });
        async move {
            submitted?;
            done_rx.await.map_err(|_| Error::Cancelled)?
        }
    }

    /// Sheds cached memory: level 0 keeps everything, 1 trims each cache
    /// view to half, 2 drops every entry.
    pub fn flush_memory(&self, level: FlushLevel) -> Result<()> {
        self.assert_not_reentrant();
        self.lane.run(move |core| {
            core.object_cache.shrink(level);
            core.metadata_cache.shrink(level);
        })
    }

    /// The snapshot this connection's caches are coherent with.
    pub fn cache_last_write_timestamp(&self) -> Result<WriteTimestamp> {
        self.assert_not_reentrant();
        self.lane.run(|core| core.cache_last_write_timestamp)
    }

    /// Number of entries currently held in the object cache. Introspection
    /// for tests and debugging.
    pub fn object_cache_len(&self) -> Result<usize> {
        self.assert_not_reentrant();
        self.lane.run(|core| core.object_cache.len())
    }

    /// One-shot test hook: pause between the snapshot-lane probe and
    /// `BEGIN DEFERRED` on the next transaction, widening the commit-race
    /// window so it can be hit deterministically.
    #[doc(hidden)]
    pub fn inject_pre_begin_pause(&self, pause: Duration) -> Result<()> {
        self.lane.run(move |core| core.pre_begin_pause = Some(pause))
    }

    /// One-shot test hook: force the next read-write commit to fail,
    /// exercising the rollback path.
    #[doc(hidden)]
    pub fn fail_next_commit(&self) -> Result<()> {
        self.lane.run(|core| core.fail_next_commit = true)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Deregister first: the coordinator's record holds a lane sender,
        // and the lane thread only exits once every sender is gone.
        self.shared.drop_connection(self.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
