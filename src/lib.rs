//! # snapdb — Snapshot-Isolated Key/Value Storage on SQLite
//!
//! snapdb is a multi-connection, snapshot-isolated key/value database built
//! on SQLite's WAL mode. It provides:
//!
//! - **Snapshot isolation**: every transaction sees a stable point-in-time
//!   view, however many writers commit meanwhile
//! - **Many readers, one writer**: concurrent read transactions across
//!   connections, read-write transactions serialized by an external write
//!   lane (no BUSY errors between connections)
//! - **Coherent caching**: per-connection object and metadata caches,
//!   invalidated by changesets broadcast after every commit
//! - **Commit-race repair**: the narrow window where a reader begins while
//!   a writer commits is detected and repaired by replaying changesets
//! - **Background checkpointing**: optional dedicated WAL-checkpoint lane
//!   so writers never pay for checkpoint passes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Clients                                │
//! │            (sync + async reads and read-writes)                 │
//! └───────┬─────────────────────┬─────────────────────┬─────────────┘
//!         ▼                     ▼                     ▼
//! ┌───────────────┐     ┌───────────────┐     ┌───────────────┐
//! │  Connection   │     │  Connection   │     │  Connection   │
//! │  (own lane,   │     │  (own lane,   │     │  (own lane,   │
//! │   own handle, │     │   own handle, │     │   own handle, │
//! │   own caches) │     │   own caches) │     │   own caches) │
//! └───────┬───────┘     └───────┬───────┘     └───────┬───────┘
//!         │     snapshots, changesets, invalidation   │
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                      ┌─────────────────┐
//!                      │    Database     │  snapshot lane + write lane
//!                      │  (coordinator)  │  + changeset log
//!                      └────────┬────────┘
//!                               ▼
//!                      ┌─────────────────┐
//!                      │  SQLite (WAL)   │
//!                      └─────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! Everything in the engine leans on four guarantees; code that would bend
//! any of them is a bug wherever it appears:
//!
//! 1. **Monotonic snapshots**: `lastWriteTimestamp` never decreases; each
//!    commit's stamp is strictly greater than the last
//! 2. **Single writer**: at most one read-write transaction exists in the
//!    database at any instant
//! 3. **Cache coherence**: a cache entry on a connection whose snapshot
//!    equals the coordinator's is guaranteed to match SQLite
//! 4. **Changeset retention**: the log keeps every changeset some live
//!    connection might still need
//!
//! ## Example
//!
//! ```rust,ignore
//! use snapdb::{Database, DatabaseConfig};
//!
//! let db = Database::open("app.db", DatabaseConfig::default())?;
//!
//! let conn = db.new_connection()?;
//! conn.read_write(|tx| {
//!     tx.set("settings", "theme", b"dark".to_vec())?;
//!     Ok(())
//! })?;
//!
//! let theme = conn.read(|tx| tx.get("settings", "theme"))?;
//! # Ok::<(), snapdb::Error>(())
//! ```
//!
//! ## Module Organization
//!
//! - [`error`]: every way the engine can fail, as one enum
//! - [`types`]: timestamps, changesets, configuration
//! - [`codec`]: blob encodings for the engine's metadata table
//! - [`lane`]: serial execution lanes (the scheduling primitive)
//! - [`schema`]: DDL, pragmas, the `user_version` probe, schema hooks
//! - [`cache`]: the shared object/metadata cache and its per-connection views
//! - [`database`]: the coordinator — snapshot lane, write lane, changeset log
//! - [`connection`]: connections and the pre/post transaction protocols
//! - [`transaction`]: the read/read-write operation surface
//! - `checkpoint` (internal): the optional background checkpoint worker

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for snapdb operations.
pub mod error;

/// Domain types: timestamps, cache keys, changesets, configuration.
pub mod types;

/// Blob encodings for the `yap` metadata table.
pub mod codec;

/// Serial execution lanes.
///
/// The scheduling primitive behind connections, the coordinator, and the
/// checkpoint worker: a dedicated thread owning state and draining a FIFO
/// channel of jobs.
pub mod lane;

/// SQLite schema, pragmas, and the schema-hooks capability record.
pub mod schema;

/// The shared two-tier cache and its per-connection LRU views.
pub mod cache;

/// The database coordinator.
///
/// Owns the snapshot lane (connection bookkeeping, the changeset log, the
/// snapshot clock), the write lane, and the commit broadcast.
pub mod database;

/// Connections: private SQLite handles on serial lanes, the pre/post
/// transaction protocols, and the sync/async client API.
pub mod connection;

/// Transactions: the read/read-write operation surface and the changeset
/// accumulator.
pub mod transaction;

/// The background checkpoint worker (dedicated checkpoint mode).
mod checkpoint;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{CacheView, SharedCache};
pub use connection::Connection;
pub use database::Database;
pub use error::{Error, Result};
pub use schema::SchemaHooks;
pub use transaction::{Transaction, TransactionKind};
pub use types::{
    CacheKey, ChangeHint, Changeset, CheckpointMode, DatabaseConfig, FlushLevel, WriteTimestamp,
};
