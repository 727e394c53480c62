//! S2 — rate limit with recovery: the first run trips the limit, the
//! coordinator gates release, the second run completes.

use crate::prelude::*;
use shep_adapters::{ProbeOutcome, ScriptedDetector, ScriptedProber};
use shep_core::{TaskConfig, TaskState};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_task_waits_and_recovers() {
    let mut spec = Spec::new(|_| {});
    spec.with_prober(ScriptedProber::new([
        ProbeOutcome::Inconclusive,
        ProbeOutcome::Available,
    ]));

    // First run: rate limit and die. Second run: complete.
    let flag = spec.scratch("ran-once");
    let command = format!(
        "if [ -f {flag} ]; then {done}; else touch {flag}; \
         printf '%s\\n' 'Error: Rate limit exceeded. Retry after 2 seconds.'; exit 1; fi",
        flag = flag.display(),
        done = marker_command(),
    );
    let task = spec.admit(TaskConfig::new("limited", "limited", command)).await;

    spec.start_worker(ScriptedDetector::silent());
    spec.start_coordinator();

    // The task parks with the parsed two-second window
    let waiting = spec
        .wait_for_state(&task.id, TaskState::WaitingUnban, Duration::from_secs(15))
        .await;
    let wait = waiting.next_allowed_at.unwrap() - waiting.started_at.unwrap();
    assert!(wait <= chrono::Duration::seconds(3), "window was {wait}");

    // The coordinator recorded a global ban
    spec.wait_until("global ban", Duration::from_secs(10), || {
        spec.coordinator_handle.global_unban_time().is_some()
    })
    .await;

    // After the window the task is released and the retry completes
    let done = spec
        .wait_for_state(&task.id, TaskState::Completed, Duration::from_secs(30))
        .await;
    assert_eq!(done.task_state, TaskState::Completed);

    // Both the P2 (limit) and P3 (release) alerts exist
    let alerts = spec.engine.store().get_unresolved_alerts();
    assert!(alerts.iter().any(|a| a.level == shep_core::AlertLevel::P2));
    assert!(alerts.iter().any(|a| a.level == shep_core::AlertLevel::P3));

    spec.stop().await;
}
