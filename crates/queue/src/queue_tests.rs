// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use shep_core::{Clock, FakeClock, TaskConfig, TaskPriority};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn queue(dir: &Path) -> DirQueue {
    DirQueue::open(&dir.join("queue")).unwrap()
}

fn task(id: &str, priority: TaskPriority, clock: &FakeClock) -> Task {
    Task::new(
        TaskConfig::new(id, id, "true").priority(priority),
        clock,
    )
}

#[test]
fn claim_returns_none_when_empty() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    assert!(q.claim(Utc::now()).unwrap().is_none());
}

#[test]
fn claim_moves_entry_to_processing() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    q.enqueue(&task("t1", TaskPriority::Normal, &clock)).unwrap();
    assert!(q.is_pending("t1"));

    let claimed = q.claim(clock.now()).unwrap().unwrap();
    assert_eq!(claimed.id, "t1");
    assert!(!q.is_pending("t1"));
    assert!(q.is_processing("t1"));
}

#[test]
fn claim_order_is_priority_then_age() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    q.enqueue(&task("low", TaskPriority::Low, &clock)).unwrap();
    clock.advance_millis(20);
    q.enqueue(&task("urgent", TaskPriority::Urgent, &clock)).unwrap();
    clock.advance_millis(20);
    q.enqueue(&task("normal", TaskPriority::Normal, &clock)).unwrap();

    let mut order = Vec::new();
    while let Some(t) = q.claim(clock.now()).unwrap() {
        order.push(t.id.clone());
        q.finalize(&t.id).unwrap();
    }
    assert_eq!(order, vec!["urgent", "normal", "low"]);
}

#[test]
fn equal_priority_dispatches_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    q.enqueue(&task("older", TaskPriority::Normal, &clock)).unwrap();
    clock.advance_millis(20);
    q.enqueue(&task("newer", TaskPriority::Normal, &clock)).unwrap();

    assert_eq!(q.claim(clock.now()).unwrap().unwrap().id, "older");
}

#[test]
fn deferred_entry_is_renamed_back() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    let mut deferred = task("deferred", TaskPriority::Urgent, &clock);
    deferred.next_allowed_at = Some(clock.now() + chrono::Duration::seconds(60));
    q.enqueue(&deferred).unwrap();
    clock.advance_millis(5);
    q.enqueue(&task("ready", TaskPriority::Low, &clock)).unwrap();

    // The deferred urgent task is skipped and put back
    let claimed = q.claim(clock.now()).unwrap().unwrap();
    assert_eq!(claimed.id, "ready");
    assert!(q.is_pending("deferred"));

    clock.advance_secs(61);
    assert_eq!(q.claim(clock.now()).unwrap().unwrap().id, "deferred");
}

#[test]
fn release_refreshes_entry_contents() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    q.enqueue(&task("t1", TaskPriority::Normal, &clock)).unwrap();
    let mut claimed = q.claim(clock.now()).unwrap().unwrap();

    claimed.retry_count = 2;
    claimed.next_allowed_at = Some(clock.now() + chrono::Duration::seconds(4));
    q.release(&claimed).unwrap();

    assert!(q.is_pending("t1"));
    assert!(!q.is_processing("t1"));

    clock.advance_secs(5);
    let again = q.claim(clock.now()).unwrap().unwrap();
    assert_eq!(again.retry_count, 2);
}

#[test]
fn finalize_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    q.enqueue(&task("t1", TaskPriority::Normal, &clock)).unwrap();
    q.claim(clock.now()).unwrap().unwrap();

    q.finalize("t1").unwrap();
    q.finalize("t1").unwrap();
    assert!(!q.is_processing("t1"));
}

#[test]
fn one_file_per_task_across_both_directories() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    let t = task("t1", TaskPriority::Normal, &clock);
    q.enqueue(&t).unwrap();

    let count = |q: &DirQueue| {
        usize::from(q.is_pending("t1")) + usize::from(q.is_processing("t1"))
    };
    assert_eq!(count(&q), 1);

    let claimed = q.claim(clock.now()).unwrap().unwrap();
    assert_eq!(count(&q), 1);

    q.release(&claimed).unwrap();
    assert_eq!(count(&q), 1);

    q.claim(clock.now()).unwrap().unwrap();
    q.finalize("t1").unwrap();
    assert_eq!(count(&q), 0);
}

#[test]
fn concurrent_claims_produce_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();
    q.enqueue(&task("contested", TaskPriority::Normal, &clock)).unwrap();

    let wins = Arc::new(AtomicUsize::new(0));
    let now = clock.now();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let q = q.clone();
            let wins = Arc::clone(&wins);
            std::thread::spawn(move || {
                if let Ok(Some(_)) = q.claim(now) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(wins.load(Ordering::SeqCst), 1);
    assert!(q.is_processing("contested"));
}

#[test]
fn scan_processing_lists_stale_entries() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    q.enqueue(&task("a", TaskPriority::Normal, &clock)).unwrap();
    q.enqueue(&task("b", TaskPriority::Normal, &clock)).unwrap();
    q.claim(clock.now()).unwrap().unwrap();
    q.claim(clock.now()).unwrap().unwrap();

    let stale: Vec<String> = q
        .scan_processing()
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(stale, vec!["a", "b"]);
}

#[test]
fn unreadable_pending_entry_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let clock = FakeClock::default();

    std::fs::write(dir.path().join("queue/pending/broken.json"), "{torn").unwrap();
    q.enqueue(&task("good", TaskPriority::Normal, &clock)).unwrap();

    assert_eq!(q.claim(clock.now()).unwrap().unwrap().id, "good");
}
