// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::transitions::TaskEngine;
use shep_adapters::ScriptedProber;
use shep_core::{Config, Clock, FakeClock, RateLimitKind, Task, TaskConfig};
use shep_queue::DirQueue;
use shep_store::Store;

struct Harness {
    engine: Arc<TaskEngine>,
    clock: FakeClock,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default().with_base_dir(dir.path());
    let store = Store::open(&config.ledger_path(), &config.ledger_snapshot_path()).unwrap();
    let queue = DirQueue::open(&config.queue_dir()).unwrap();
    let clock = FakeClock::default();
    let alerts = crate::alerts::AlertSink::new(store.clone(), config.alerts_path());
    let engine = Arc::new(TaskEngine::new(
        store,
        queue,
        config,
        Arc::new(clock.clone()),
        alerts,
    ));
    Harness {
        engine,
        clock,
        _dir: dir,
    }
}

fn coordinator(
    h: &Harness,
    prober: ScriptedProber,
) -> (RateLimitCoordinator, CoordinatorHandle, Arc<ScriptedProber>) {
    let prober = Arc::new(prober);
    let (coord, handle) =
        RateLimitCoordinator::new(Arc::clone(&h.engine), Arc::clone(&prober) as _);
    (coord, handle, prober)
}

fn limit_info(retry_after: u64, clock: &FakeClock) -> RateLimitInfo {
    RateLimitInfo {
        kind: RateLimitKind::RequestRate,
        retry_after_seconds: retry_after,
        detected_at: clock.now(),
        raw_message: "rate limit exceeded".into(),
        confidence: 0.85,
    }
}

async fn waiting_task(h: &Harness, id: &str, wait_secs: u64) -> Task {
    let task = h
        .engine
        .admit(Task::new(TaskConfig::new(id, id, "true"), &h.clock))
        .await
        .unwrap();
    let mut claimed = h.engine.queue().claim(h.clock.now()).unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
    h.engine.mark_processing(&mut claimed, "w1").await.unwrap();
    let info = limit_info(wait_secs, &h.clock);
    h.engine
        .mark_waiting_unban(&mut claimed, Some(&info), "rate limit")
        .await
        .unwrap();
    claimed
}

#[tokio::test]
async fn recording_raises_the_global_ban_once() {
    let h = harness();
    let (mut coord, handle, _prober) = coordinator(&h, ScriptedProber::always_available());

    coord.record_rate_limit("t1", limit_info(600, &h.clock));
    let first = handle.global_unban_time().unwrap();
    assert_eq!(first, h.clock.now() + chrono::Duration::seconds(600));
    assert!(!handle.globally_ready(h.clock.now()));

    // an earlier window does not shrink the ban
    coord.record_rate_limit("t2", limit_info(60, &h.clock));
    assert_eq!(handle.global_unban_time().unwrap(), first);

    // a later one extends it
    coord.record_rate_limit("t3", limit_info(1200, &h.clock));
    assert!(handle.global_unban_time().unwrap() > first);
}

#[tokio::test]
async fn recording_emits_a_p2_alert() {
    let h = harness();
    let (mut coord, _handle, _prober) = coordinator(&h, ScriptedProber::always_available());

    coord.record_rate_limit("t1", limit_info(600, &h.clock));

    let alerts = h.engine.store().get_unresolved_alerts();
    assert!(alerts
        .iter()
        .any(|a| a.level == shep_core::AlertLevel::P2
            && a.title.contains("rate limited")));
}

#[tokio::test]
async fn globally_ready_after_the_window() {
    let h = harness();
    let (mut coord, handle, _prober) = coordinator(&h, ScriptedProber::always_available());
    coord.record_rate_limit("t1", limit_info(100, &h.clock));

    assert!(!handle.globally_ready(h.clock.now()));
    h.clock.advance_secs(101);
    assert!(handle.globally_ready(h.clock.now()));
}

#[tokio::test]
async fn step_does_not_probe_when_idle() {
    let h = harness();
    let (mut coord, _handle, prober) = coordinator(&h, ScriptedProber::always_available());

    coord.step().await.unwrap();
    // no waiting tasks, no ban: the prober is never invoked
    assert_eq!(prober.calls(), 0);
}

#[tokio::test]
async fn step_probes_when_tasks_wait() {
    let h = harness();
    waiting_task(&h, "t1", 30).await;
    let (mut coord, _handle, prober) = coordinator(&h, ScriptedProber::always_available());

    coord.step().await.unwrap();
    assert_eq!(prober.calls(), 1);

    // min probe gap applies on the next step
    h.clock.advance_secs(5);
    coord.step().await.unwrap();
    assert_eq!(prober.calls(), 1);
}

#[tokio::test]
async fn available_probe_clears_the_ban() {
    let h = harness();
    waiting_task(&h, "t1", 30).await;
    let (mut coord, handle, _prober) = coordinator(&h, ScriptedProber::always_available());
    coord.record_rate_limit("t1", limit_info(600, &h.clock));

    coord.step().await.unwrap();
    assert!(handle.global_unban_time().is_none());
}

#[tokio::test]
async fn still_limited_probe_extends_the_ban() {
    let h = harness();
    waiting_task(&h, "t1", 30).await;
    let limited = limit_info(2400, &h.clock);
    let (mut coord, handle, _prober) =
        coordinator(&h, ScriptedProber::new([ProbeOutcome::StillLimited(limited)]));
    coord.record_rate_limit("t1", limit_info(600, &h.clock));
    let before = handle.global_unban_time().unwrap();

    coord.step().await.unwrap();
    assert!(handle.global_unban_time().unwrap() > before);
}

#[tokio::test]
async fn release_honors_both_gates() {
    let h = harness();
    let task = waiting_task(&h, "t1", 50).await;
    // probes stay inconclusive so only the recorded window can open the gate
    let (mut coord, _handle, _prober) =
        coordinator(&h, ScriptedProber::new([ProbeOutcome::Inconclusive]));
    coord.record_rate_limit("t1", limit_info(100, &h.clock));

    // own window not yet elapsed
    h.clock.advance_secs(20);
    coord.step().await.unwrap();
    assert_eq!(
        h.engine.store().get_task(&task.id).unwrap().task_state,
        TaskState::WaitingUnban
    );

    // own window elapsed but global ban still active
    h.clock.advance_secs(40); // t=60
    coord.step().await.unwrap();
    assert_eq!(
        h.engine.store().get_task(&task.id).unwrap().task_state,
        TaskState::WaitingUnban
    );

    // both gates open
    h.clock.advance_secs(50); // t=110
    coord.step().await.unwrap();
    let released = h.engine.store().get_task(&task.id).unwrap();
    assert_eq!(released.task_state, TaskState::Pending);
    assert!(released.next_allowed_at.is_none());
    assert!(h.engine.queue().is_pending(&task.id));
}

#[tokio::test]
async fn release_emits_a_recovery_alert() {
    let h = harness();
    let task = waiting_task(&h, "t1", 10).await;
    let (mut coord, _handle, _prober) = coordinator(&h, ScriptedProber::always_available());

    h.clock.advance_secs(11);
    coord.step().await.unwrap();

    let alerts = h.engine.store().get_unresolved_alerts();
    assert!(alerts.iter().any(|a| {
        a.level == shep_core::AlertLevel::P3 && a.task_id.as_deref() == Some(task.id.as_str())
    }));
}

#[tokio::test]
async fn stale_ban_expires_without_a_probe() {
    let h = harness();
    let (mut coord, handle, _prober) = coordinator(&h, ScriptedProber::new([ProbeOutcome::Inconclusive]));
    coord.record_rate_limit("t1", limit_info(60, &h.clock));

    // window + five-minute grace
    h.clock.advance_secs(60 + 301);
    coord.step().await.unwrap();
    assert!(handle.global_unban_time().is_none());
}

#[tokio::test]
async fn estimated_recovery_prefers_task_history() {
    let h = harness();
    let (mut coord, _handle, _prober) = coordinator(&h, ScriptedProber::always_available());
    coord.record_rate_limit("t1", limit_info(600, &h.clock));

    let per_task = coord.estimated_recovery("t1").unwrap();
    assert_eq!(per_task, h.clock.now() + chrono::Duration::seconds(600));
    // unknown tasks fall back to the global window
    assert_eq!(coord.estimated_recovery("other").unwrap(), per_task);
}

// ── probe cadence ────────────────────────────────────────────────────────

#[test]
fn probe_wait_base_without_ban() {
    let now = Utc::now();
    assert_eq!(probe_wait(now, None, 0), Duration::from_secs(300));
}

#[test]
fn probe_wait_shortens_near_release() {
    let now = Utc::now();
    let unban = now + chrono::Duration::seconds(500);
    assert_eq!(probe_wait(now, Some(unban), 0), Duration::from_secs(60));
}

#[test]
fn probe_wait_mid_window_uses_a_sixth() {
    let now = Utc::now();
    let unban = now + chrono::Duration::seconds(1200);
    assert_eq!(probe_wait(now, Some(unban), 0), Duration::from_secs(200));
}

#[test]
fn probe_wait_backs_off_after_failures() {
    let now = Utc::now();
    assert_eq!(probe_wait(now, None, 4), Duration::from_secs(600));
}
