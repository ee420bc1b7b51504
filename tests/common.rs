#![allow(dead_code)]

use std::path::{Path, PathBuf};

use snapdb::{Database, DatabaseConfig};

/// Creates a tempdir and returns it together with a database path inside it.
/// The tempdir must stay alive for the duration of the test.
pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Opens a database with default configuration.
pub fn open_db(path: &Path) -> Database {
    Database::open(path, DatabaseConfig::default()).expect("open database")
}

/// Opens a raw read-only SQLite connection for side-channel verification,
/// bypassing the engine entirely.
pub fn open_raw(path: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open raw read-only connection")
}

/// Every row of the kv table, ordered, straight from SQLite.
pub fn all_rows(path: &Path) -> Vec<(String, String, Vec<u8>)> {
    let conn = open_raw(path);
    let mut stmt = conn
        .prepare("SELECT collection, key, data FROM kv ORDER BY collection, key")
        .expect("prepare row dump");
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })
        .expect("query row dump");
    rows.collect::<Result<Vec<_>, _>>().expect("collect rows")
}

/// The persisted user_version blob, raw.
pub fn raw_user_version(path: &Path) -> Vec<u8> {
    let conn = open_raw(path);
    conn.query_row(
        "SELECT data FROM yap WHERE key = 'user_version'",
        [],
        |row| row.get(0),
    )
    .expect("read user_version")
}

/// The persisted lastWriteTimestamp blob, raw.
pub fn raw_last_write_timestamp(path: &Path) -> Vec<u8> {
    let conn = open_raw(path);
    conn.query_row(
        "SELECT data FROM yap WHERE key = 'lastWriteTimestamp'",
        [],
        |row| row.get(0),
    )
    .expect("read lastWriteTimestamp")
}
