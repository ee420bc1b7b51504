//! Checkpoint Policy Tests
//!
//! The two checkpoint modes must be behaviorally identical at the data
//! level; only WAL housekeeping differs.

mod common;

use std::path::Path;

use snapdb::{CheckpointMode, Database, DatabaseConfig};

fn run_workload(db: &Database) {
    let conn = db.new_connection().unwrap();
    for round in 0..5u8 {
        conn.read_write(move |tx| {
            for i in 0..20u8 {
                tx.set("c", &format!("k{i}"), vec![round, i])?;
            }
            tx.remove("c", "k0")?;
            Ok(())
        })
        .unwrap();
    }
}

fn wal_path(db_path: &Path) -> std::path::PathBuf {
    let mut name = db_path.file_name().unwrap().to_os_string();
    name.push("-wal");
    db_path.with_file_name(name)
}

/// The same workload under inline and dedicated checkpointing produces
/// identical database contents.
#[test]
fn modes_produce_identical_contents() {
    let (_dir_a, path_a) = common::temp_db_path("inline.db");
    let (_dir_b, path_b) = common::temp_db_path("dedicated.db");

    {
        let db = Database::open(
            &path_a,
            DatabaseConfig {
                checkpoint_mode: CheckpointMode::Inline,
                ..DatabaseConfig::default()
            },
        )
        .unwrap();
        run_workload(&db);
    }
    {
        let db = Database::open(
            &path_b,
            DatabaseConfig {
                checkpoint_mode: CheckpointMode::Dedicated,
                ..DatabaseConfig::default()
            },
        )
        .unwrap();
        run_workload(&db);
        db.sync_checkpoint().unwrap();
    }

    assert_eq!(common::all_rows(&path_a), common::all_rows(&path_b));
}

/// In dedicated mode the WAL exists while writes flow, and a sync
/// checkpoint truncates it back to nothing.
#[test]
fn sync_checkpoint_truncates_wal() {
    let (_dir, path) = common::temp_db_path("wal.db");
    let db = Database::open(
        &path,
        DatabaseConfig {
            checkpoint_mode: CheckpointMode::Dedicated,
            ..DatabaseConfig::default()
        },
    )
    .unwrap();

    run_workload(&db);

    let wal = wal_path(&path);
    assert!(wal.exists(), "WAL file should exist under write load");

    db.sync_checkpoint().unwrap();
    let len = std::fs::metadata(&wal).map(|m| m.len()).unwrap_or(0);
    assert_eq!(len, 0, "TRUNCATE checkpoint should empty the WAL");

    // Data intact after the checkpoint.
    let conn = db.new_connection().unwrap();
    assert_eq!(
        conn.read(|tx| tx.get("c", "k1")).unwrap(),
        Some(vec![4, 1])
    );
}
