//! # Transactions
//!
//! A [`Transaction`] scopes one read or read-write pass over one
//! connection. It exists only inside the block passed to
//! [`Connection::read`](crate::Connection::read) /
//! [`Connection::read_write`](crate::Connection::read_write): the engine
//! runs its pre-phase before the block and its post-phase after, on the
//! error path too.
//!
//! ## Read-Your-Writes
//!
//! Mutations go to SQLite *and* the connection's cache views immediately,
//! so reads later in the same transaction observe them. If the transaction
//! rolls back, the connection scrubs exactly the entries the accumulated
//! changeset names.
//!
//! ## The Changeset Accumulator
//!
//! Every mutation appends its logical operation (`set` or `remove`) to the
//! transaction's [`Changeset`]. Successive mutations of the same key
//! coalesce — last writer wins — so the published record describes net
//! effects, which is all sibling caches need for invalidation.
//!
//! ## Mode Enforcement
//!
//! One type serves both modes; mutating calls on a read transaction fail
//! with [`Error::ReadOnly`] at runtime. The read/read-write distinction is
//! part of the engine's contract, not the type system — the same choice as
//! the schema hooks, where polymorphism is data.

use rusqlite::{params, OptionalExtension};

use crate::connection::ConnectionCore;
use crate::error::{Error, Result};
use crate::types::{CacheKey, ChangeHint, Changeset};

// =============================================================================
// Kind
// =============================================================================

/// Whether a transaction may mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Snapshot reads only.
    Read,
    /// Reads plus mutations; publishes a changeset on commit.
    ReadWrite,
}

// =============================================================================
// Transaction
// =============================================================================

/// One active read or read-write scope on a connection.
///
/// Borrowed mutably by the block for its whole life, so it cannot escape;
/// after the block returns the engine marks it defunct and any operation on
/// a lingering reference fails with [`Error::TransactionExpired`].
pub struct Transaction<'core> {
    core: &'core mut ConnectionCore,
    kind: TransactionKind,
    changeset: Changeset,
    completed: bool,
}

impl<'core> Transaction<'core> {
    pub(crate) fn new(core: &'core mut ConnectionCore, kind: TransactionKind) -> Self {
        Self {
            core,
            kind,
            changeset: Changeset::new(),
            completed: false,
        }
    }

    /// Hands the accumulated changeset to the commit path.
    pub(crate) fn take_changeset(&mut self) -> Changeset {
        std::mem::take(&mut self.changeset)
    }

    /// Marks the transaction defunct; runs as the block returns.
    pub(crate) fn expire(&mut self) {
        self.completed = true;
    }

    /// Whether this transaction may mutate.
    pub fn is_read_write(&self) -> bool {
        self.kind == TransactionKind::ReadWrite
    }

    fn check_live(&self) -> Result<()> {
        if self.completed {
            Err(Error::TransactionExpired)
        } else {
            Ok(())
        }
    }

    fn check_mutable(&self) -> Result<()> {
        self.check_live()?;
        if self.kind == TransactionKind::Read {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Returns the value stored under `(collection, key)`, or `None`.
    ///
    /// Consults the object cache first; a miss falls through to SQLite and
    /// (for present values) populates the cache.
    pub fn get(&mut self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_live()?;
        let cache_key = CacheKey::new(collection, key);

        if let Some(value) = self.core.object_cache.get(&cache_key) {
            return Ok(Some(value.clone()));
        }

        let row = {
            let mut stmt = self
                .core
                .conn
                .prepare_cached("SELECT data FROM kv WHERE collection = ?1 AND key = ?2")?;
            stmt.query_row(params![collection, key], |row| row.get::<_, Vec<u8>>(0))
                .optional()?
        };

        if let Some(value) = &row {
            self.core.object_cache.put(cache_key, value.clone());
        }
        Ok(row)
    }

    /// Returns the metadata sidecar stored under `(collection, key)`.
    ///
    /// `None` means the row is missing *or* carries no metadata; rows that
    /// exist get their sidecar (present or absent) cached.
    pub fn get_metadata(&mut self, collection: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_live()?;
        let cache_key = CacheKey::new(collection, key);

        if let Some(metadata) = self.core.metadata_cache.get(&cache_key) {
            return Ok(metadata.clone());
        }

        let row = {
            let mut stmt = self
                .core
                .conn
                .prepare_cached("SELECT metadata FROM kv WHERE collection = ?1 AND key = ?2")?;
            stmt.query_row(params![collection, key], |row| {
                row.get::<_, Option<Vec<u8>>>(0)
            })
            .optional()?
        };

        match row {
            Some(metadata) => {
                self.core.metadata_cache.put(cache_key, metadata.clone());
                Ok(metadata)
            }
            None => Ok(None),
        }
    }

    /// Whether `(collection, key)` exists.
    pub fn has(&mut self, collection: &str, key: &str) -> Result<bool> {
        self.check_live()?;
        let cache_key = CacheKey::new(collection, key);
        if self.core.object_cache.contains(&cache_key) {
            return Ok(true);
        }

        let mut stmt = self
            .core
            .conn
            .prepare_cached("SELECT 1 FROM kv WHERE collection = ?1 AND key = ?2")?;
        let present = stmt
            .query_row(params![collection, key], |_| Ok(()))
            .optional()?
            .is_some();
        Ok(present)
    }

    /// Number of rows in `collection`.
    pub fn count(&mut self, collection: &str) -> Result<usize> {
        self.check_live()?;
        let mut stmt = self
            .core
            .conn
            .prepare_cached("SELECT COUNT(*) FROM kv WHERE collection = ?1")?;
        let n: i64 = stmt.query_row([collection], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Passes every key in `collection` to `f`, in key order.
    pub fn enumerate_keys(
        &mut self,
        collection: &str,
        mut f: impl FnMut(&str),
    ) -> Result<()> {
        self.check_live()?;
        let mut stmt = self
            .core
            .conn
            .prepare_cached("SELECT key FROM kv WHERE collection = ?1 ORDER BY key")?;
        let mut rows = stmt.query([collection])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            f(&key);
        }
        Ok(())
    }

    /// Passes every `(key, value)` pair in `collection` to `f`, in key
    /// order. Values come straight from SQLite — enumeration does not churn
    /// the cache.
    pub fn enumerate(
        &mut self,
        collection: &str,
        mut f: impl FnMut(&str, &[u8]),
    ) -> Result<()> {
        self.check_live()?;
        let mut stmt = self
            .core
            .conn
            .prepare_cached("SELECT key, data FROM kv WHERE collection = ?1 ORDER BY key")?;
        let mut rows = stmt.query([collection])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let data: Vec<u8> = row.get(1)?;
            f(&key, &data);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Mutations (read-write only)
    // -------------------------------------------------------------------------

    /// Stores `data` under `(collection, key)`, preserving any existing
    /// metadata sidecar.
    pub fn set(&mut self, collection: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_mutable()?;
        {
            let mut stmt = self.core.conn.prepare_cached(
                "INSERT INTO kv (collection, key, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT (collection, key) DO UPDATE SET data = excluded.data",
            )?;
            stmt.execute(params![collection, key, data])?;
        }
        self.core
            .object_cache
            .put(CacheKey::new(collection, key), data);
        self.changeset.record_set(collection, key);
        Ok(())
    }

    /// Stores `data` and replaces the metadata sidecar in one write.
    pub fn set_with_metadata(
        &mut self,
        collection: &str,
        key: &str,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<()> {
        self.check_mutable()?;
        {
            let mut stmt = self.core.conn.prepare_cached(
                "INSERT OR REPLACE INTO kv (collection, key, data, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            stmt.execute(params![collection, key, data, metadata])?;
        }
        let cache_key = CacheKey::new(collection, key);
        self.core.object_cache.put(cache_key.clone(), data);
        self.core.metadata_cache.put(cache_key, metadata);
        self.changeset.record_set(collection, key);
        Ok(())
    }

    /// Removes `(collection, key)` if present.
    pub fn remove(&mut self, collection: &str, key: &str) -> Result<()> {
        self.check_mutable()?;
        {
            let mut stmt = self
                .core
                .conn
                .prepare_cached("DELETE FROM kv WHERE collection = ?1 AND key = ?2")?;
            stmt.execute(params![collection, key])?;
        }
        let cache_key = CacheKey::new(collection, key);
        self.core.object_cache.remove(&cache_key);
        self.core.metadata_cache.remove(&cache_key);
        self.changeset.record_remove(collection, key);
        Ok(())
    }

    /// Removes every row in `collection`.
    pub fn remove_all(&mut self, collection: &str) -> Result<()> {
        self.check_mutable()?;
        {
            let mut stmt = self
                .core
                .conn
                .prepare_cached("DELETE FROM kv WHERE collection = ?1")?;
            stmt.execute([collection])?;
        }
        let cleared = collection.to_string();
        let hint = move |k: &CacheKey| {
            if k.collection == cleared {
                ChangeHint::Removed
            } else {
                ChangeHint::Unchanged
            }
        };
        self.core.object_cache.apply(&hint);
        self.core.metadata_cache.apply(&hint);
        self.changeset.record_remove_all(collection);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
