// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use shep_core::{Clock, FakeClock, TaskConfig, TaskPriority};

fn saved(id: &str, state: TaskState, clock: &FakeClock) -> LedgerOp {
    let mut task = Task::new(TaskConfig::new(id, id, "true"), clock);
    task.task_state = state;
    LedgerOp::TaskSaved { task }
}

fn saved_with_priority(id: &str, priority: TaskPriority, clock: &FakeClock) -> LedgerOp {
    let task = Task::new(TaskConfig::new(id, id, "true").priority(priority), clock);
    LedgerOp::TaskSaved { task }
}

#[test]
fn task_saved_upserts_and_indexes() {
    let clock = FakeClock::default();
    let mut state = LedgerState::default();
    state.apply_op(&saved("t1", TaskState::Pending, &clock));

    assert!(state.tasks.contains_key("t1"));
    assert_eq!(state.ids_in_state(TaskState::Pending).count(), 1);

    state.apply_op(&saved("t1", TaskState::Processing, &clock));
    assert_eq!(state.ids_in_state(TaskState::Pending).count(), 0);
    assert_eq!(state.ids_in_state(TaskState::Processing).count(), 1);
}

#[test]
fn applying_the_same_op_twice_is_idempotent() {
    let clock = FakeClock::default();
    let mut state = LedgerState::default();
    let op = saved("t1", TaskState::Pending, &clock);
    state.apply_op(&op);
    state.apply_op(&op);

    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.ids_in_state(TaskState::Pending).count(), 1);
}

#[test]
fn idempotency_record_is_write_once_under_replay() {
    let mut state = LedgerState::default();
    let first = LedgerOp::IdempotencyMarked {
        record: IdempotencyRecord {
            key: "k".into(),
            task_id: "t1".into(),
            executed_at: Utc::now(),
            result: Some("done".into()),
        },
    };
    let second = LedgerOp::IdempotencyMarked {
        record: IdempotencyRecord {
            key: "k".into(),
            task_id: "t2".into(),
            executed_at: Utc::now(),
            result: None,
        },
    };
    state.apply_op(&first);
    state.apply_op(&second);

    assert_eq!(state.idempotency["k"].task_id, "t1");
}

#[test]
fn latest_snapshot_is_overwritten_per_save() {
    let mut state = LedgerState::default();
    for data in [b"one".to_vec(), b"two".to_vec()] {
        state.apply_op(&LedgerOp::SnapshotSaved {
            task_id: "t1".into(),
            snapshot_id: "latest".into(),
            data,
        });
    }
    assert_eq!(state.task_snapshots["t1"]["latest"], b"two");
}

#[test]
fn purge_removes_tasks_snapshots_and_alerts() {
    let clock = FakeClock::default();
    let mut state = LedgerState::default();
    state.apply_op(&saved("t1", TaskState::Completed, &clock));
    state.apply_op(&LedgerOp::SnapshotSaved {
        task_id: "t1".into(),
        snapshot_id: "latest".into(),
        data: b"x".to_vec(),
    });
    state.apply_op(&LedgerOp::AlertSaved {
        alert: Alert::new("a1", shep_core::AlertLevel::P3, "t", "m", clock.now()),
    });

    state.apply_op(&LedgerOp::Purged {
        task_ids: vec!["t1".into()],
        alert_ids: vec!["a1".into()],
    });

    assert!(state.tasks.is_empty());
    assert!(state.task_snapshots.is_empty());
    assert!(state.alerts.is_empty());
    assert_eq!(state.ids_in_state(TaskState::Completed).count(), 0);
}

#[test]
fn pending_ready_orders_by_priority_then_age() {
    let clock = FakeClock::default();
    let mut state = LedgerState::default();
    state.apply_op(&saved_with_priority("low", TaskPriority::Low, &clock));
    clock.advance_millis(20);
    state.apply_op(&saved_with_priority("urgent", TaskPriority::Urgent, &clock));
    clock.advance_millis(20);
    state.apply_op(&saved_with_priority("normal", TaskPriority::Normal, &clock));

    let order: Vec<String> = state
        .pending_ready(10, clock.now())
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(order, vec!["urgent", "normal", "low"]);
}

#[test]
fn pending_ready_skips_backoff_and_honors_limit() {
    let clock = FakeClock::default();
    let mut state = LedgerState::default();

    let mut deferred = Task::new(TaskConfig::new("deferred", "d", "true"), &clock);
    deferred.next_allowed_at = Some(clock.now() + chrono::Duration::seconds(60));
    state.apply_op(&LedgerOp::TaskSaved { task: deferred });

    clock.advance_millis(5);
    state.apply_op(&saved("ready-1", TaskState::Pending, &clock));
    clock.advance_millis(5);
    state.apply_op(&saved("ready-2", TaskState::Pending, &clock));

    let ready = state.pending_ready(1, clock.now());
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "ready-1");

    clock.advance_secs(61);
    let ready: Vec<String> = state
        .pending_ready(10, clock.now())
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec!["deferred", "ready-1", "ready-2"]);
}

#[test]
fn rebuild_indexes_recovers_from_serde() {
    let clock = FakeClock::default();
    let mut state = LedgerState::default();
    state.apply_op(&saved("t1", TaskState::Pending, &clock));
    state.apply_op(&saved("t2", TaskState::Failed, &clock));

    let json = serde_json::to_string(&state).unwrap();
    let mut restored: LedgerState = serde_json::from_str(&json).unwrap();
    // the index is #[serde(skip)]
    assert_eq!(restored.ids_in_state(TaskState::Pending).count(), 0);

    restored.rebuild_indexes();
    assert_eq!(restored.ids_in_state(TaskState::Pending).count(), 1);
    assert_eq!(restored.ids_in_state(TaskState::Failed).count(), 1);
}
