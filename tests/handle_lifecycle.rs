//! Handle lifecycle against the real bundled SQLite build

#![cfg(feature = "bundled")]

use rusqlite::{Connection, DatabaseName};
use sqlite_interop::{
    open_flags, BackupHandle, BackupStep, BundledApi, ConnectionHandle, NativeApi, NativeHandle,
    ReleaseOutcome,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn api() -> Arc<dyn NativeApi> {
    Arc::new(BundledApi)
}

fn open(path: &str) -> ConnectionHandle {
    ConnectionHandle::open(api(), path, open_flags::READ_WRITE | open_flags::CREATE).unwrap()
}

/// Database authored with rusqlite: one table, one 4 KiB blob
fn fixture(dir: &TempDir) -> String {
    let path = dir.path().join("fixture.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE files (id INTEGER PRIMARY KEY, content BLOB);
         INSERT INTO files (id, content) VALUES (1, zeroblob(4096));
         INSERT INTO files (id, content) VALUES (2, x'DEADBEEF');",
    )
    .unwrap();
    path.to_str().unwrap().to_string()
}

/// Descriptors this process holds on `path`
#[cfg(target_os = "linux")]
fn open_descriptors(path: &Path) -> usize {
    let target = path.canonicalize().unwrap();
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .filter(|link| *link == target)
        .count()
}

/// The library really closed the file, not just parked it as a zombie
fn assert_file_released(path: &Path) {
    #[cfg(target_os = "linux")]
    assert_eq!(open_descriptors(path), 0, "{} still open", path.display());
    #[cfg(not(target_os = "linux"))]
    let _ = path;
}

#[cfg(target_os = "linux")]
fn assert_file_held(path: &Path) {
    assert!(open_descriptors(path) > 0, "{} not open", path.display());
}

#[cfg(not(target_os = "linux"))]
fn assert_file_held(_path: &Path) {}

#[test]
fn test_statement_released_twice_finalizes_once() {
    let conn = open(":memory:");
    let stmt = conn.prepare("SELECT 1").unwrap();
    assert!(stmt.step().unwrap());

    assert_eq!(stmt.release(), ReleaseOutcome::Released);
    assert_eq!(stmt.release(), ReleaseOutcome::AlreadyClosed);
    assert!(stmt.as_raw().is_null());
    drop(stmt);

    assert_eq!(conn.close(), ReleaseOutcome::Released);
}

#[test]
fn test_force_close_before_statement_release() {
    let conn = open(":memory:");
    let first = conn.prepare("SELECT 1").unwrap();
    let second = conn.prepare("SELECT 2").unwrap();
    assert!(first.step().unwrap());

    // Force-close finalizes both statements natively
    assert_eq!(conn.close(), ReleaseOutcome::Released);
    assert_eq!(conn.generation(), 1);

    assert_eq!(first.release(), ReleaseOutcome::Stale);
    assert!(first.is_closed());
    drop(second);
}

#[test]
fn test_blob_on_rusqlite_fixture() {
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir);

    let conn = open(&path);
    let big = conn.open_blob("main", "files", "content", 1, false).unwrap();
    let small = conn.open_blob("main", "files", "content", 2, false).unwrap();
    assert_eq!(big.len().unwrap(), 4096);
    assert_eq!(small.len().unwrap(), 4);

    assert_eq!(big.release(), ReleaseOutcome::Released);
    drop(small);
    assert_eq!(conn.close(), ReleaseOutcome::Released);
}

#[test]
fn test_blob_missing_row_is_native_error() {
    let dir = TempDir::new().unwrap();
    let conn = open(&fixture(&dir));
    let err = conn.open_blob("main", "files", "content", 99, false).err().unwrap();
    assert!(matches!(err, sqlite_interop::InteropError::Native { .. }));
}

#[test]
fn test_backup_to_file_readable_by_rusqlite() {
    let dir = TempDir::new().unwrap();
    let source = open(&fixture(&dir));
    let target_path = dir.path().join("copy.db");
    let target = open(target_path.to_str().unwrap());

    let backup = BackupHandle::init(&target, "main", &source, "main").unwrap();
    assert_eq!(backup.step(1).unwrap(), BackupStep::More);
    while backup.step(1).unwrap() != BackupStep::Done {}
    assert_eq!(backup.release(), ReleaseOutcome::Released);

    target.close();
    source.close();

    let check = Connection::open(&target_path).unwrap();
    let mut blob = check
        .blob_open(DatabaseName::Main, "files", "content", 2, true)
        .unwrap();
    let mut bytes = Vec::new();
    std::io::Read::read_to_end(&mut blob, &mut bytes).unwrap();
    assert_eq!(bytes, [0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn test_children_dropped_after_connection_drop() {
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir);
    let conn = open(&path);
    let stmt = conn.prepare("SELECT id FROM files").unwrap();
    assert!(stmt.step().unwrap());
    let blob = conn.open_blob("main", "files", "content", 1, false).unwrap();
    assert_file_held(Path::new(&path));

    drop(conn);
    assert_file_released(Path::new(&path));

    assert!(stmt.is_stale());
    assert!(blob.is_stale());
    assert_eq!(stmt.release(), ReleaseOutcome::Stale);
    assert_eq!(blob.release(), ReleaseOutcome::Stale);
}

/// File-backed source and destination with one page already copied
fn started_backup(dir: &TempDir) -> (ConnectionHandle, ConnectionHandle, BackupHandle) {
    let source = open(&fixture(dir));
    let dest = open(dir.path().join("copy.db").to_str().unwrap());
    let backup = source.backup_into(&dest).unwrap();
    assert_eq!(backup.step(1).unwrap(), BackupStep::More);
    (source, dest, backup)
}

#[test]
fn test_backup_destination_closed_first_releases_both_files() {
    let dir = TempDir::new().unwrap();
    let (source, dest, backup) = started_backup(&dir);
    let source_path = dir.path().join("fixture.db");
    assert_file_held(&source_path);

    assert_eq!(dest.close(), ReleaseOutcome::Released);
    assert!(backup.is_closed());
    assert_eq!(backup.release(), ReleaseOutcome::AlreadyClosed);
    assert_file_released(&dir.path().join("copy.db"));

    assert_eq!(source.close(), ReleaseOutcome::Released);
    assert_file_released(&source_path);
}

#[test]
fn test_backup_source_closed_first_releases_both_files() {
    let dir = TempDir::new().unwrap();
    let (source, dest, backup) = started_backup(&dir);
    let source_path = dir.path().join("fixture.db");

    assert_eq!(source.close(), ReleaseOutcome::Released);
    assert_file_released(&source_path);
    assert!(backup.is_stale());
    assert!(backup.step(1).is_err());

    // Destination stays usable after the aborted copy
    assert!(!dest.query_row_exists("SELECT 1 FROM sqlite_master WHERE name = 'nope'").unwrap());
    drop(backup);
    assert_eq!(dest.close(), ReleaseOutcome::Released);
    assert_file_released(&dir.path().join("copy.db"));
}

#[test]
fn test_statement_on_dropped_alias_still_finalizes() {
    let dir = TempDir::new().unwrap();
    let path = fixture(&dir);
    let owner = open(&path);
    let alias = ConnectionHandle::new(owner.api().clone(), owner.as_raw(), false);
    let stmt = alias.prepare("SELECT id FROM files").unwrap();

    drop(alias);
    assert!(stmt.step().unwrap());
    assert_eq!(stmt.release(), ReleaseOutcome::Released);

    // Nothing left for the owner's close to clean up
    assert_eq!(owner.close(), ReleaseOutcome::Released);
    assert_file_released(Path::new(&path));
}

#[test]
fn test_handles_move_across_threads() {
    let conn = Arc::new(open(":memory:"));
    conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1)")
        .unwrap();
    let stmt = conn.prepare("SELECT x FROM t").unwrap();

    let worker = std::thread::spawn(move || {
        assert!(stmt.step().unwrap());
        stmt.release()
    });
    assert_eq!(worker.join().unwrap(), ReleaseOutcome::Released);
    assert_eq!(conn.close(), ReleaseOutcome::Released);
}
