//! S5 — orphaned task: a crash mid-PROCESSING is repaired by the startup
//! orphan scan and the task is claimable again.

use crate::prelude::*;
use shep_adapters::ScriptedDetector;
use shep_core::{Config, Task, TaskConfig, TaskState};
use shep_daemon::Daemon;
use shep_queue::DirQueue;
use shep_store::Store;
use std::time::Duration;

/// Leave behind exactly what a crashed supervisor leaves: a PROCESSING
/// store row, a stale `processing/` entry, and no live worker.
fn crash_state(config: &Config, command: &str) -> Task {
    config.ensure_layout().unwrap();
    let store = Store::open(&config.ledger_path(), &config.ledger_snapshot_path()).unwrap();
    let queue = DirQueue::open(&config.queue_dir()).unwrap();

    let mut task = Task::new(
        TaskConfig::new("orphaned", "orphaned", command),
        &shep_core::SystemClock,
    );
    queue.enqueue(&task).unwrap();
    queue.claim(chrono::Utc::now()).unwrap().unwrap();
    task.task_state = TaskState::Processing;
    task.assigned_worker = Some("worker_gone".into());
    task.started_at = Some(chrono::Utc::now());
    store.save_task(&task).unwrap();
    task
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_scan_requeues_the_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let config = {
        let mut config = Config::default().with_base_dir(dir.path());
        config.num_workers = 1;
        config
    };
    let task = crash_state(&config, "true");

    let daemon = Daemon::startup(config, "claude").await.unwrap();

    let recovered = daemon.store.get_task(&task.id).unwrap();
    assert_eq!(recovered.task_state, TaskState::Pending);
    assert!(recovered.assigned_worker.is_none());
    assert!(daemon.engine.queue().is_pending(&task.id));
    assert!(!daemon.engine.queue().is_processing(&task.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn recovered_orphan_is_claimed_and_completed() {
    let mut spec = Spec::new(|_| {});

    // crash artifacts inside the spec's own layout
    {
        let mut task = Task::new(
            TaskConfig::new("orphaned", "orphaned", marker_command()),
            &shep_core::SystemClock,
        );
        spec.engine.queue().enqueue(&task).unwrap();
        spec.engine.queue().claim(chrono::Utc::now()).unwrap().unwrap();
        task.task_state = TaskState::Processing;
        task.assigned_worker = Some("worker_gone".into());
        task.started_at = Some(chrono::Utc::now());
        spec.engine.store().save_task(&task).unwrap();
        std::fs::create_dir_all(spec.engine.config().task_dir(&task.id)).unwrap();
    }

    // the recovery path a running system would take
    let mut stored = spec.engine.store().get_task("orphaned").unwrap();
    spec.engine.recover_orphan(&mut stored).await.unwrap();

    spec.start_worker(ScriptedDetector::silent());
    let done = spec
        .wait_for_state("orphaned", TaskState::Completed, Duration::from_secs(15))
        .await;
    assert_eq!(done.retry_count, 0);

    spec.stop().await;
}
