//! End-to-end scenarios against real files and a real budget.

use std::io::Write;
use std::path::Path;

use nix::errno::Errno;

use ssw_memman::{handle, LockType, MemMan, MemManNone, MemManReal, TableInfo};

const FILE_LEN: u64 = 4096;

/// Lay out `<dir>/<table>_<chunk>.MYD` the way the database engine would.
fn make_chunk_file(dir: &Path, table: &str, chunk: i32, len: u64) {
    let path = dir.join(format!("{}_{}.MYD", table, chunk));
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(&vec![0u8; len as usize]).unwrap();
}

fn required(table: &str) -> TableInfo {
    TableInfo::new(table, LockType::Required, LockType::NoLock)
}

fn flexible(table: &str) -> TableInfo {
    TableInfo::new(table, LockType::Flexible, LockType::NoLock)
}

#[test]
fn simple_lock_and_release() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "t", 100, FILE_LEN);
    let mm = MemManReal::new(1_000_000, dir.path());

    let h = mm.prepare(&[required("t")], 100).unwrap();
    assert!(h > handle::ISEMPTY);
    mm.lock(h, true).unwrap();

    let status = mm.status(h);
    assert_eq!(status.bytes_locked, FILE_LEN);
    assert_eq!(status.num_files, 1);
    assert_eq!(status.chunk, 100);

    let stats = mm.statistics();
    assert_eq!(stats.bytes_locked, FILE_LEN);
    assert_eq!(stats.bytes_reserved, 0);
    assert_eq!(stats.num_locks, 1);

    assert!(mm.unlock(h));
    assert_eq!(mm.statistics().bytes_locked, 0);
    assert_eq!(mm.statistics().bytes_reserved, 0);
}

#[test]
fn required_table_over_budget() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "t", 100, FILE_LEN);
    let mm = MemManReal::new(1000, dir.path());

    assert_eq!(mm.prepare(&[required("t")], 100), Err(Errno::ENOMEM));
    let stats = mm.statistics();
    assert_eq!(stats.bytes_locked, 0);
    assert_eq!(stats.bytes_reserved, 0);
    assert_eq!(stats.num_errors, 1);
}

#[test]
fn flexible_table_over_budget_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "t", 100, FILE_LEN);
    let mm = MemManReal::new(1000, dir.path());

    let h = mm.prepare(&[flexible("t")], 100).unwrap();
    assert!(h > handle::ISEMPTY);
    // Nothing fit, nothing locked, but the lock call succeeds anyway.
    mm.lock(h, true).unwrap();
    assert_eq!(mm.status(h).bytes_locked, 0);

    let stats = mm.statistics();
    assert_eq!(stats.bytes_locked, 0);
    assert_eq!(stats.bytes_reserved, 0);
    assert_eq!(stats.num_flex_lock, 0);

    assert!(mm.unlock(h));
}

#[test]
fn concurrent_tasks_share_one_file() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "shared", 100, FILE_LEN);
    let mm = MemManReal::new(1_000_000, dir.path());

    let h1 = mm.prepare(&[required("shared")], 100).unwrap();
    let h2 = mm.prepare(&[required("shared")], 100).unwrap();
    assert_ne!(h1, h2);

    mm.lock(h1, true).unwrap();
    mm.lock(h2, true).unwrap();

    // One underlying file, one set of locked pages.
    assert_eq!(mm.statistics().bytes_locked, FILE_LEN);
    assert_eq!(mm.status(h1).bytes_locked, FILE_LEN);
    assert_eq!(mm.status(h2).bytes_locked, FILE_LEN);

    // The first release must not unmap what the second task still uses.
    assert!(mm.unlock(h1));
    assert_eq!(mm.statistics().bytes_locked, FILE_LEN);
    assert!(mm.unlock(h2));
    assert_eq!(mm.statistics().bytes_locked, 0);
}

#[test]
fn prepare_then_unlock_leaves_budget_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "t", 42, FILE_LEN);
    make_chunk_file(dir.path(), "u", 42, FILE_LEN);
    let mm = MemManReal::new(1_000_000, dir.path());

    let h = mm
        .prepare(&[required("t"), flexible("u")], 42)
        .unwrap();
    let stats = mm.statistics();
    assert_eq!(stats.bytes_reserved, 2 * FILE_LEN);
    assert_eq!(stats.bytes_locked, 0);

    assert!(mm.unlock(h));
    let stats = mm.statistics();
    assert_eq!(stats.bytes_reserved, 0);
    assert_eq!(stats.bytes_locked, 0);
}

#[test]
fn index_and_data_policies_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "t", 7, FILE_LEN);
    let path = dir.path().join("t_7.MYI");
    std::fs::File::create(path)
        .unwrap()
        .write_all(&vec![0u8; 4096])
        .unwrap();
    let mm = MemManReal::new(1_000_000, dir.path());

    let h = mm
        .prepare(
            &[TableInfo::new("t", LockType::Required, LockType::Flexible)],
            7,
        )
        .unwrap();
    mm.lock(h, true).unwrap();
    let status = mm.status(h);
    assert_eq!(status.num_files, 2);
    assert_eq!(status.bytes_locked, FILE_LEN + 4096);
    assert!(mm.unlock(h));
}

#[test]
fn missing_chunk_file() {
    let dir = tempfile::tempdir().unwrap();
    let mm = MemManReal::new(1_000_000, dir.path());
    assert_eq!(mm.prepare(&[required("absent")], 5), Err(Errno::ENOENT));
    assert_eq!(mm.statistics().num_errors, 1);
}

#[test]
fn empty_request_gets_the_empty_handle() {
    let dir = tempfile::tempdir().unwrap();
    let mm = MemManReal::new(1_000_000, dir.path());

    let tables = [
        TableInfo::new("a", LockType::NoLock, LockType::NoLock),
        TableInfo::new("b", LockType::Optional, LockType::NoLock),
    ];
    assert_eq!(mm.prepare(&tables, 3).unwrap(), handle::ISEMPTY);
    mm.lock(handle::ISEMPTY, true).unwrap();
    assert!(mm.unlock(handle::ISEMPTY));
}

#[test]
fn handle_sentinels() {
    let dir = tempfile::tempdir().unwrap();
    let mm = MemManReal::new(1_000_000, dir.path());

    assert_eq!(mm.lock(handle::INVALID, true), Err(Errno::EINVAL));
    assert!(!mm.unlock(handle::INVALID));
    // Idempotent from any caller.
    assert!(mm.unlock(handle::ISEMPTY));
    assert!(mm.unlock(handle::ISEMPTY));
    // A never-issued handle is not found.
    assert_eq!(mm.lock(99999, true), Err(Errno::ENOENT));
    assert!(!mm.unlock(99999));
}

#[test]
fn zero_length_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "empty", 1, 0);
    let mm = MemManReal::new(1_000_000, dir.path());
    assert_eq!(mm.prepare(&[required("empty")], 1), Err(Errno::ESPIPE));
}

#[test]
fn unlock_all_releases_everything() {
    let dir = tempfile::tempdir().unwrap();
    make_chunk_file(dir.path(), "t", 1, FILE_LEN);
    make_chunk_file(dir.path(), "t", 2, FILE_LEN);
    let mm = MemManReal::new(1_000_000, dir.path());

    let h1 = mm.prepare(&[required("t")], 1).unwrap();
    let h2 = mm.prepare(&[required("t")], 2).unwrap();
    mm.lock(h1, true).unwrap();
    mm.lock(h2, true).unwrap();
    assert_eq!(mm.statistics().num_fsets, 2);

    mm.unlock_all();
    let stats = mm.statistics();
    assert_eq!(stats.num_fsets, 0);
    assert_eq!(stats.bytes_locked, 0);
    assert_eq!(stats.bytes_reserved, 0);
}

#[test]
fn none_variant_policies() {
    let mm = MemManNone::new(1, false);
    assert_eq!(mm.prepare(&[required("t")], 1), Err(Errno::ENOMEM));
    assert_eq!(mm.prepare(&[flexible("t")], 1).unwrap(), handle::ISEMPTY);
    assert!(mm.unlock(handle::ISEMPTY));

    let always = MemManNone::new(1, true);
    assert_eq!(always.prepare(&[required("t")], 1).unwrap(), handle::ISEMPTY);
}
