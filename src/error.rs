//! # Error Handling for snapdb
//!
//! One enum, [`Error`], carries every failure the engine can surface, with a
//! crate-wide [`Result`] alias over it.
//!
//! ## Shape of the Taxonomy
//!
//! The taxonomy is organized around what a caller can *do* about a failure,
//! not which module produced it, and in this engine the answers cluster
//! tightly. Two failures belong to open time and mean the file itself is
//! wrong. One is cross-process lock contention, the only variant a retry
//! can help. Three are scoped to a single transaction and leave the rest of
//! the database perfectly healthy. Corruption alone condemns everything;
//! after it, every connection answers [`Error::Cancelled`].
//!
//! Since reads, writes, and async completions all funnel through the same
//! lanes, they also report through this one type; splitting it per module
//! would force the transaction plumbing to translate at every lane
//! boundary for no added information. SQLite's own errors fold in via
//! `#[from]`, so `?` works directly against rusqlite calls.
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Open-time | [`Error::Open`], [`Error::SchemaMismatch`] | Fix the path / upgrade the app |
//! | Contention | [`Error::Busy`] | Retry the transaction |
//! | Fatal | [`Error::Corrupt`] | Close everything, restore from backup |
//! | Per-transaction | [`Error::CommitFailed`], [`Error::ReadOnly`], [`Error::TransactionExpired`] | Fix the caller |
//! | Lifecycle | [`Error::Cancelled`] | Stop issuing work |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in snapdb operations.
///
/// Each variant represents a distinct failure mode. The `#[error(...)]`
/// attribute defines the `Display` message shown when the error is printed.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Open-Time Errors
    // =========================================================================
    /// The database file could not be opened or is not a valid database.
    ///
    /// # When This Happens
    ///
    /// - The path is not writable or its parent directory doesn't exist
    /// - The file exists but is not a SQLite database
    /// - SQLite reports `SQLITE_CANTOPEN` or `SQLITE_NOTADB`
    #[error("cannot open database at '{path}': {source}")]
    Open {
        /// The path that failed to open.
        path: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },

    /// The on-disk `user_version` is newer than this build understands.
    ///
    /// # When This Happens
    ///
    /// The database was last written by a newer version of the library. The
    /// `user_version` stored in the `yap` table is the single source of truth
    /// for schema revision; we refuse to touch a file stamped with a revision
    /// we don't know how to read.
    ///
    /// # Recovery
    ///
    /// Upgrade the application, or restore an older copy of the file.
    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaMismatch {
        /// The `user_version` found in the file.
        found: i32,
        /// The highest version this build understands.
        supported: i32,
    },

    // =========================================================================
    // Contention
    // =========================================================================
    /// Write contention exceeded the configured busy budget.
    ///
    /// The external write gate normally prevents this entirely: only one
    /// read-write transaction traverses SQLite at a time. Seeing `Busy` means
    /// some *other process* holds a conflicting lock on the same file past
    /// the `busy_timeout` budget.
    #[error("database busy: lock not acquired within the configured budget")]
    Busy,

    // =========================================================================
    // Fatal
    // =========================================================================
    /// An engine invariant was violated or SQLite reported corruption.
    ///
    /// # When This Happens
    ///
    /// - The SQL-level snapshot moved *backwards* relative to a connection's
    ///   cache watermark (timestamps are monotonic; this cannot happen on a
    ///   healthy file)
    /// - A value in the `yap` table has the wrong width
    /// - SQLite reports `SQLITE_CORRUPT`
    ///
    /// # Recovery
    ///
    /// None in-process. The database is marked closed, all connections become
    /// invalid, and pending async work completes with [`Error::Cancelled`].
    #[error("database corrupt: {0}")]
    Corrupt(String),

    // =========================================================================
    // Per-Transaction Errors
    // =========================================================================
    /// The SQLite `COMMIT` returned an error.
    ///
    /// The transaction has been rolled back and its changeset discarded.
    /// Sibling connections never observe any of its effects.
    #[error("commit failed, transaction rolled back: {0}")]
    CommitFailed(#[source] rusqlite::Error),

    /// A mutating operation was invoked on a read-only transaction.
    #[error("mutation attempted inside a read-only transaction")]
    ReadOnly,

    /// A transaction reference was used after its enclosing block returned.
    ///
    /// Transactions only live for the duration of the block passed to
    /// `read` / `read_write`; after the block returns the transaction is
    /// defunct and every operation on it fails with this error.
    #[error("transaction used after its block returned")]
    TransactionExpired,

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// An async submission could not run because its connection (or the
    /// whole database) was closed before execution.
    #[error("operation cancelled: connection closed before execution")]
    Cancelled,

    // =========================================================================
    // Carrier
    // =========================================================================
    /// Any other SQLite failure, converted automatically via `?`.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error is fatal to the whole database (not just the
    /// current transaction).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
