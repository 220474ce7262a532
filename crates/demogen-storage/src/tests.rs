//! Warehouse behaviour: replace semantics, catalog persistence, pruning, locking
//! and stale-lock recovery

use super::*;
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Row {
    id: String,
    value: f64,
}

fn rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| Row {
            id: format!("r{i}"),
            value: i as f64,
        })
        .collect()
}

/// Helper to create a throwaway warehouse
fn test_warehouse() -> (Warehouse, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let warehouse = Warehouse::open(dir.path().join("wh")).unwrap();
    (warehouse, dir)
}

#[test]
fn table_roundtrips_through_disk() {
    let (wh, _dir) = test_warehouse();
    let table = Table::from_records("metrics", &rows(3)).unwrap();
    assert_eq!(table.columns, vec!["id", "value"]);
    wh.create_or_replace_table(&table).unwrap();

    let loaded = wh.table("metrics").unwrap();
    assert_eq!(loaded, table);
    let back: Vec<Row> = loaded.records().unwrap();
    assert_eq!(back, rows(3));
    assert_eq!(wh.entry("metrics").unwrap().row_count, Some(3));
}

#[test]
fn replace_leaves_exactly_one_copy() {
    let (wh, _dir) = test_warehouse();
    wh.create_or_replace_table(&Table::from_records("metrics", &rows(5)).unwrap())
        .unwrap();
    wh.create_or_replace_table(&Table::from_records("metrics", &rows(2)).unwrap())
        .unwrap();

    assert_eq!(wh.objects(ObjectKind::Table).len(), 1);
    assert_eq!(wh.table("metrics").unwrap().len(), 2);
    let files: Vec<_> = std::fs::read_dir(wh.root().join("tables"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(files.len(), 1, "no temp or stale files: {files:?}");
}

#[test]
fn catalog_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let wh = Warehouse::open(dir.path()).unwrap();
        wh.create_or_replace_table(&Table::from_records("entities", &rows(1)).unwrap())
            .unwrap();
        wh.put_definition(ObjectKind::AnalyticView, "company_view", &"def")
            .unwrap();
    }
    let wh = Warehouse::open(dir.path()).unwrap();
    assert!(wh.contains("entities"));
    let def: String = wh.definition(ObjectKind::AnalyticView, "company_view").unwrap();
    assert_eq!(def, "def");
}

#[test]
fn kind_conflicts_and_bad_names_are_rejected() {
    let (wh, _dir) = test_warehouse();
    wh.create_or_replace_table(&Table::from_records("docs", &rows(1)).unwrap())
        .unwrap();
    let err = wh
        .put_definition(ObjectKind::SearchIndex, "docs", &"x")
        .unwrap_err();
    assert!(matches!(err, StorageError::KindConflict { .. }));

    let err = wh
        .create_or_replace_table(&Table::new("Bad-Name", vec![]))
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidName(_)));
}

#[test]
fn missing_objects_are_not_found() {
    let (wh, _dir) = test_warehouse();
    assert!(matches!(wh.table("nope"), Err(StorageError::NotFound(_))));
    wh.put_definition(ObjectKind::SearchIndex, "idx", &1u32).unwrap();
    // Wrong kind reads as absent.
    assert!(matches!(wh.table("idx"), Err(StorageError::NotFound(_))));
}

#[test]
fn prune_drops_only_orphans() {
    let (wh, _dir) = test_warehouse();
    for name in ["a_search", "b_search", "old_search"] {
        wh.put_definition(ObjectKind::SearchIndex, name, &name).unwrap();
    }
    wh.create_or_replace_table(&Table::from_records("old_table", &rows(1)).unwrap())
        .unwrap();

    let keep: BTreeSet<String> = ["a_search", "b_search"].iter().map(|s| s.to_string()).collect();
    let dropped = wh.prune(ObjectKind::SearchIndex, &keep).unwrap();
    assert_eq!(dropped, vec!["old_search".to_string()]);
    assert!(!wh.root().join("indexes/old_search.json").exists());
    assert!(wh.contains("old_table"), "other kinds are untouched");
    assert!(!wh.drop_object("old_search").unwrap());
}

#[test]
fn second_lock_is_rejected_until_release() {
    let (wh, _dir) = test_warehouse();
    let lock = wh.lock("run-1").unwrap();
    assert_eq!(lock.owner(), "run-1");

    match wh.lock("run-2") {
        Err(StorageError::Locked { owner, .. }) => assert_eq!(owner, "run-1"),
        other => panic!("expected Locked, got {other:?}"),
    }

    drop(lock);
    assert!(wh.lock("run-2").is_ok());
}

struct BrokenWriter;

impl std::io::Write for BrokenWriter {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn failed_lock_write_leaves_no_lock_file() {
    let (wh, _dir) = test_warehouse();
    let path = wh.root().join(lock::LOCK_FILE);
    std::fs::write(&path, b"").unwrap();

    match RunLock::claim(path.clone(), "run-1", BrokenWriter) {
        Err(StorageError::Io { .. }) => {}
        other => panic!("expected Io, got {other:?}"),
    }
    assert!(!path.exists());
    assert!(wh.lock("run-2").is_ok());
}

#[test]
fn unreadable_lock_file_still_blocks() {
    let (wh, _dir) = test_warehouse();
    std::fs::write(wh.root().join(lock::LOCK_FILE), b"").unwrap();
    match wh.lock("run-1") {
        Err(StorageError::Locked { owner, .. }) => assert_eq!(owner, "unknown"),
        other => panic!("expected Locked, got {other:?}"),
    }
}

#[cfg(target_os = "linux")]
#[test]
fn lock_of_a_dead_process_is_reclaimed() {
    let (wh, _dir) = test_warehouse();
    let path = wh.root().join(lock::LOCK_FILE);
    std::fs::write(
        &path,
        r#"{"owner":"crashed-run","pid":4294967295,"acquired_at":"2024-01-01T00:00:00Z"}"#,
    )
    .unwrap();

    let lock = wh.lock("run-2").unwrap();
    assert_eq!(lock.owner(), "run-2");
    let recorded = std::fs::read_to_string(&path).unwrap();
    assert!(recorded.contains("\"owner\":\"run-2\""), "{recorded}");

    match wh.lock("run-3") {
        Err(StorageError::Locked { owner, .. }) => assert_eq!(owner, "run-2"),
        other => panic!("expected Locked, got {other:?}"),
    }
}

#[test]
fn run_summaries_update_latest() {
    let (wh, _dir) = test_warehouse();
    assert!(wh.read_latest_run::<serde_json::Value>().unwrap().is_none());

    wh.write_run_summary("run-1", &serde_json::json!({"status": "FAILED"}))
        .unwrap();
    let path = wh
        .write_run_summary("run-2", &serde_json::json!({"status": "READY"}))
        .unwrap();
    assert!(path.ends_with("run-2.json"));

    let latest: serde_json::Value = wh.read_latest_run().unwrap().unwrap();
    assert_eq!(latest["status"], "READY");
}
