//! S1 — a task that prints the completion marker completes in one spawn.

use crate::prelude::*;
use shep_adapters::ScriptedDetector;
use shep_core::{TaskConfig, TaskState};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn echo_task_completes_in_one_spawn() {
    let mut spec = Spec::new(|_| {});
    spec.start_worker(ScriptedDetector::silent());

    let task = spec
        .admit(TaskConfig::new("echo", "echo", marker_command()))
        .await;

    let done = spec
        .wait_for_state(&task.id, TaskState::Completed, Duration::from_secs(15))
        .await;

    assert_eq!(done.retry_count, 0);
    assert!(done.completed_at.unwrap() > done.started_at.unwrap());

    let log = spec.output_log(&task.id);
    assert!(log.contains("✅ TASK_COMPLETED"));
    assert!(log.contains("=== TASK EXECUTION LOG ==="));
    assert!(log.contains("Exit Code: 0"));

    // queue is fully drained
    assert!(!spec.engine.queue().is_pending(&task.id));
    assert!(!spec.engine.queue().is_processing(&task.id));

    spec.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn task_json_mirror_tracks_the_record() {
    let mut spec = Spec::new(|_| {});
    spec.start_worker(ScriptedDetector::silent());

    let task = spec
        .admit(TaskConfig::new("mirrored", "mirrored", marker_command()))
        .await;
    spec.wait_for_state(&task.id, TaskState::Completed, Duration::from_secs(15))
        .await;

    let mirror = spec.engine.config().task_dir(&task.id).join("task.json");
    let on_disk: shep_core::Task =
        serde_json::from_str(&std::fs::read_to_string(mirror).unwrap()).unwrap();
    assert_eq!(on_disk.task_state, TaskState::Completed);

    spec.stop().await;
}
