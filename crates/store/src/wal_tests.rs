// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use shep_core::{FakeClock, Task, TaskConfig};
use std::io::Write as _;

fn op(id: &str) -> LedgerOp {
    LedgerOp::TaskSaved {
        task: Task::new(TaskConfig::new(id, id, "true"), &FakeClock::default()),
    }
}

fn task_id(entry: &WalEntry) -> String {
    match &entry.op {
        LedgerOp::TaskSaved { task } => task.id.clone(),
        other => panic!("unexpected op: {other:?}"),
    }
}

#[test]
fn append_assigns_increasing_seqs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut wal = Wal::open(&path).unwrap();

    assert_eq!(wal.append(&op("a")).unwrap(), 1);
    assert_eq!(wal.append(&op("b")).unwrap(), 2);
    assert_eq!(wal.write_seq(), 2);
}

#[test]
fn reopen_continues_the_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&op("a")).unwrap();
    }
    let mut wal = Wal::open(&path).unwrap();
    assert_eq!(wal.append(&op("b")).unwrap(), 2);
}

#[test]
fn entries_after_filters_by_seq() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut wal = Wal::open(&path).unwrap();
    wal.append(&op("a")).unwrap();
    wal.append(&op("b")).unwrap();
    wal.append(&op("c")).unwrap();

    let entries = wal.entries_after(1).unwrap();
    let ids: Vec<String> = entries.iter().map(task_id).collect();
    assert_eq!(ids, vec!["b", "c"]);
}

#[test]
fn torn_tail_is_repaired_and_rotated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&op("a")).unwrap();
        wal.append(&op("b")).unwrap();
    }
    // Simulate a crash mid-append
    {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(b"{\"seq\":3,\"op\":{\"TaskSav").unwrap();
    }

    let wal = Wal::open(&path).unwrap();
    let ids: Vec<String> = wal.entries_after(0).unwrap().iter().map(task_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(wal.write_seq(), 2);
    assert!(path.with_extension("bak").exists());
}

#[test]
fn mid_file_damage_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&op("a")).unwrap();
    }
    // Damage the first line, then append a valid-looking second line
    let text = std::fs::read_to_string(&path).unwrap();
    let valid_line = text.lines().next().unwrap().to_string();
    std::fs::write(&path, format!("garbage\n{valid_line}\n")).unwrap();

    assert!(matches!(
        Wal::open(&path),
        Err(WalError::Corrupt { line: 1, .. })
    ));
}

#[test]
fn truncate_through_drops_old_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut wal = Wal::open(&path).unwrap();
    wal.append(&op("a")).unwrap();
    wal.append(&op("b")).unwrap();
    wal.append(&op("c")).unwrap();

    wal.truncate_through(2).unwrap();
    let ids: Vec<String> = wal.entries_after(0).unwrap().iter().map(task_id).collect();
    assert_eq!(ids, vec!["c"]);

    // Sequence keeps counting after truncation
    assert_eq!(wal.append(&op("d")).unwrap(), 4);
}

#[test]
fn bump_seq_never_lowers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut wal = Wal::open(&path).unwrap();
    wal.append(&op("a")).unwrap();

    wal.bump_seq(10);
    assert_eq!(wal.write_seq(), 10);
    wal.bump_seq(3);
    assert_eq!(wal.write_seq(), 10);
}
