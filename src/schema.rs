//! # SQLite Schema for snapdb
//!
//! This module defines the on-disk layout and the per-handle SQLite
//! configuration. The engine itself owns exactly one table:
//!
//! ```text
//! yap(key TEXT PRIMARY KEY, data BLOB)
//!     "user_version"        -> i32 LE blob, schema revision (source of truth)
//!     "lastWriteTimestamp"  -> f64 LE blob, stamped by every read-write commit
//! ```
//!
//! Everything else comes from the [`SchemaHooks`] capability record passed
//! at open time. The default hooks provision a single generic key/value
//! table:
//!
//! ```text
//! kv(collection TEXT, key TEXT, data BLOB, metadata BLOB,
//!    PRIMARY KEY (collection, key))
//! ```
//!
//! ## Why Hooks as Data?
//!
//! Concrete schemas differ, but the coordination machinery (snapshots,
//! changesets, caches) does not. A small record of closures bound to the
//! concrete schema keeps the engine agnostic without an inheritance
//! hierarchy: polymorphism here is data.

use rusqlite::{Connection, OptionalExtension};

use crate::codec::{
    decode_timestamp, decode_version, encode_timestamp, encode_version, LAST_WRITE_TIMESTAMP_KEY,
    USER_VERSION_KEY,
};
use crate::error::{Error, Result};
use crate::types::{Changeset, ChangesetBlock, CheckpointMode, DatabaseConfig, WriteTimestamp};

// =============================================================================
// Schema Version
// =============================================================================

/// Current engine schema revision, stored under `"user_version"` in `yap`.
///
/// Opening a file stamped with a *newer* revision fails with
/// [`Error::SchemaMismatch`]; an older stamp is monotonically advanced.
pub const ENGINE_USER_VERSION: i32 = 1;

// =============================================================================
// DDL
// =============================================================================

/// The engine's own metadata table.
///
/// One row per key; values are opaque blobs whose encoding is fixed per key
/// (see [`crate::codec`]). Subclass hooks may store their own rows here too,
/// under their own keys.
const CREATE_YAP: &str = r#"
CREATE TABLE IF NOT EXISTS yap (
    key  TEXT PRIMARY KEY,
    data BLOB
)
"#;

/// The default key/value storage behind the Transaction operations.
///
/// - `collection` / `key`: opaque strings, composite primary key
/// - `data`: the user value, an opaque blob
/// - `metadata`: optional per-row sidecar, cached separately from `data`
const CREATE_KV: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    collection TEXT NOT NULL,
    key        TEXT NOT NULL,
    data       BLOB NOT NULL,
    metadata   BLOB,
    PRIMARY KEY (collection, key)
)
"#;

// =============================================================================
// Per-Handle Configuration
// =============================================================================

/// Applies the engine's pragmas to a freshly opened handle.
///
/// Every handle against the file — the coordinator's, each connection's, the
/// checkpoint worker's — goes through here so they agree on journal mode and
/// checkpoint policy.
pub fn configure_handle(conn: &Connection, config: &DatabaseConfig) -> Result<()> {
    // WAL mode: readers see a stable snapshot while a writer commits. The
    // whole coordination design assumes it.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;

    // NORMAL is enough: the engine promises no more durability than
    // SQLite's own WAL fsync policy provides.
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;

    conn.busy_timeout(config.busy_timeout)?;
    conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);

    if config.checkpoint_mode == CheckpointMode::Dedicated {
        // The dedicated lane owns all checkpointing; commits must not do it
        // opportunistically.
        conn.execute_batch("PRAGMA wal_autocheckpoint = 0")?;
    }

    Ok(())
}

/// Opens a handle against `path` with the engine's configuration applied.
///
/// SQLite opens lazily; a file that isn't a database only reveals itself at
/// the first pragma, so configuration failures fold into the open error.
pub fn open_handle(path: &str, config: &DatabaseConfig) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|source| Error::Open {
        path: path.to_string(),
        source,
    })?;
    configure_handle(&conn, config).map_err(|err| match err {
        Error::Sqlite(source) => Error::Open {
            path: path.to_string(),
            source,
        },
        other => other,
    })?;
    Ok(conn)
}

// =============================================================================
// yap Accessors
// =============================================================================

/// Reads one blob from the `yap` table.
pub fn yap_get(conn: &Connection, key: &str) -> Result<Option<Vec<u8>>> {
    let mut stmt = conn.prepare_cached("SELECT data FROM yap WHERE key = ?1")?;
    let blob = stmt
        .query_row([key], |row| row.get::<_, Vec<u8>>(0))
        .optional()?;
    Ok(blob)
}

/// Writes one blob into the `yap` table.
pub fn yap_set(conn: &Connection, key: &str, data: &[u8]) -> Result<()> {
    let mut stmt =
        conn.prepare_cached("INSERT OR REPLACE INTO yap (key, data) VALUES (?1, ?2)")?;
    stmt.execute(rusqlite::params![key, data])?;
    Ok(())
}

// =============================================================================
// Initialization
// =============================================================================

/// One-time schema creation and the `user_version` probe.
///
/// Returns the previous persisted `lastWriteTimestamp` (the watermark from
/// the last process to write the file) after resetting the stored value to
/// zero. Timestamps are process-local; a stale stamp surviving into this
/// process would make the first reader's SQL-level snapshot appear newer
/// than anything the coordinator ever issued.
///
/// # Errors
///
/// - [`Error::SchemaMismatch`] if the stored revision is newer than
///   [`ENGINE_USER_VERSION`]
/// - [`Error::Corrupt`] if a `yap` value has the wrong width
pub fn initialize(conn: &Connection, hooks: &SchemaHooks) -> Result<WriteTimestamp> {
    conn.execute_batch(CREATE_YAP)?;

    probe_user_version(conn)?;

    let watermark = match yap_get(conn, LAST_WRITE_TIMESTAMP_KEY)? {
        Some(blob) => decode_timestamp(&blob)?,
        None => WriteTimestamp::ZERO,
    };
    yap_set(
        conn,
        LAST_WRITE_TIMESTAMP_KEY,
        &encode_timestamp(WriteTimestamp::ZERO),
    )?;

    (hooks.create_tables)(conn)?;

    Ok(watermark)
}

/// Verifies or advances the stored schema revision.
fn probe_user_version(conn: &Connection) -> Result<()> {
    match yap_get(conn, USER_VERSION_KEY)? {
        None => {
            // Fresh database: stamp it.
            yap_set(conn, USER_VERSION_KEY, &encode_version(ENGINE_USER_VERSION))
        }
        Some(blob) => {
            let found = decode_version(&blob)?;
            if found > ENGINE_USER_VERSION {
                return Err(Error::SchemaMismatch {
                    found,
                    supported: ENGINE_USER_VERSION,
                });
            }
            if found < ENGINE_USER_VERSION {
                // Monotonic upgrade: the probe only ever moves forward.
                yap_set(conn, USER_VERSION_KEY, &encode_version(ENGINE_USER_VERSION))?;
            }
            Ok(())
        }
    }
}

// =============================================================================
// Schema Hooks
// =============================================================================

/// The capability record binding the engine to a concrete schema.
///
/// # Contract
///
/// - `create_tables` runs once inside [`initialize`], after the `yap` table
///   exists. It must be idempotent (`IF NOT EXISTS`).
/// - `prepare` runs asynchronously on the snapshot lane shortly after open,
///   with the coordinator's own handle. Warm-up work only.
/// - `cache_changeset_block` derives the per-key invalidation function from
///   a committed changeset; it is the only way cache views learn about
///   writes. The block it returns must be cheap — it is consulted once per
///   cached entry per sibling connection.
pub struct SchemaHooks {
    /// Creates the schema's tables. Idempotent.
    pub create_tables: Box<dyn Fn(&Connection) -> Result<()> + Send + Sync>,

    /// Optional warm-up, run async on the snapshot lane after open.
    pub prepare: Box<dyn Fn(&Connection) -> Result<()> + Send + Sync>,

    /// Derives the cache-changeset block from a committed changeset.
    pub cache_changeset_block: Box<dyn Fn(&Changeset) -> ChangesetBlock + Send + Sync>,
}

impl SchemaHooks {
    /// The default hooks: the generic `kv` table and the changeset's own
    /// per-key hints.
    pub fn kv_default() -> Self {
        Self {
            create_tables: Box::new(|conn| {
                conn.execute_batch(CREATE_KV)?;
                Ok(())
            }),
            prepare: Box::new(|_conn| Ok(())),
            cache_changeset_block: Box::new(|changeset| {
                let changeset = changeset.clone();
                Box::new(move |key| changeset.hint_for(key))
            }),
        }
    }
}

impl Default for SchemaHooks {
    fn default() -> Self {
        Self::kv_default()
    }
}

impl std::fmt::Debug for SchemaHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaHooks").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_timestamp;
    use crate::types::{CacheKey, ChangeHint};

    fn test_conn() -> Connection {
        Connection::open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_initialize_creates_tables() {
        let conn = test_conn();
        initialize(&conn, &SchemaHooks::default()).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('yap', 'kv')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = test_conn();
        initialize(&conn, &SchemaHooks::default()).unwrap();
        initialize(&conn, &SchemaHooks::default()).unwrap();
    }

    #[test]
    fn test_user_version_stamped() {
        let conn = test_conn();
        initialize(&conn, &SchemaHooks::default()).unwrap();

        let blob = yap_get(&conn, USER_VERSION_KEY).unwrap().unwrap();
        assert_eq!(decode_version(&blob).unwrap(), ENGINE_USER_VERSION);
    }

    #[test]
    fn test_newer_user_version_rejected() {
        let conn = test_conn();
        initialize(&conn, &SchemaHooks::default()).unwrap();

        yap_set(
            &conn,
            USER_VERSION_KEY,
            &encode_version(ENGINE_USER_VERSION + 5),
        )
        .unwrap();

        let err = initialize(&conn, &SchemaHooks::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaMismatch {
                found,
                supported: ENGINE_USER_VERSION,
            } if found == ENGINE_USER_VERSION + 5
        ));
    }

    #[test]
    fn test_older_user_version_advanced() {
        let conn = test_conn();
        initialize(&conn, &SchemaHooks::default()).unwrap();

        yap_set(&conn, USER_VERSION_KEY, &encode_version(0)).unwrap();
        initialize(&conn, &SchemaHooks::default()).unwrap();

        let blob = yap_get(&conn, USER_VERSION_KEY).unwrap().unwrap();
        assert_eq!(decode_version(&blob).unwrap(), ENGINE_USER_VERSION);
    }

    /// Open resets the persisted timestamp and reports the old watermark.
    #[test]
    fn test_timestamp_reset_reports_watermark() {
        let conn = test_conn();
        let first = initialize(&conn, &SchemaHooks::default()).unwrap();
        assert!(first.is_zero());

        yap_set(
            &conn,
            LAST_WRITE_TIMESTAMP_KEY,
            &encode_timestamp(WriteTimestamp::from_raw(42.5)),
        )
        .unwrap();

        let watermark = initialize(&conn, &SchemaHooks::default()).unwrap();
        assert_eq!(watermark.as_raw(), 42.5);

        let blob = yap_get(&conn, LAST_WRITE_TIMESTAMP_KEY).unwrap().unwrap();
        assert!(decode_timestamp(&blob).unwrap().is_zero());
    }

    #[test]
    fn test_yap_round_trip() {
        let conn = test_conn();
        initialize(&conn, &SchemaHooks::default()).unwrap();

        assert_eq!(yap_get(&conn, "missing").unwrap(), None);
        yap_set(&conn, "k", b"hello").unwrap();
        assert_eq!(yap_get(&conn, "k").unwrap(), Some(b"hello".to_vec()));
        yap_set(&conn, "k", b"replaced").unwrap();
        assert_eq!(yap_get(&conn, "k").unwrap(), Some(b"replaced".to_vec()));
    }

    /// The default block hook mirrors the changeset's own hints.
    #[test]
    fn test_default_changeset_block_hook() {
        let hooks = SchemaHooks::default();
        let mut cs = Changeset::new();
        cs.record_set("c", "k1");
        cs.record_remove("c", "k2");

        let block = (hooks.cache_changeset_block)(&cs);
        assert_eq!(block(&CacheKey::new("c", "k1")), ChangeHint::Updated);
        assert_eq!(block(&CacheKey::new("c", "k2")), ChangeHint::Removed);
        assert_eq!(block(&CacheKey::new("c", "k3")), ChangeHint::Unchanged);
    }
}
