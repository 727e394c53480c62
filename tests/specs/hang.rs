//! S4 — hang then recover: silence trips the no-output timeout, the retry
//! completes normally.

use crate::prelude::*;
use shep_adapters::ScriptedDetector;
use shep_core::{TaskConfig, TaskState};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn hung_run_retries_and_completes() {
    let mut spec = Spec::new(|cfg| cfg.claude_cli_timeout = 2);

    // First run: swallow the missing-binary error and go silent. Second
    // run: complete. The `claude -p` prefix keeps the short prompt-only
    // no-output ceiling in force.
    let flag = spec.scratch("hung-once");
    let command = format!(
        "claude -p hi 2>/dev/null; if [ -f {flag} ]; then {done}; else touch {flag}; sleep 30; fi",
        flag = flag.display(),
        done = marker_command(),
    );
    let task = spec.admit(TaskConfig::new("hangs", "hangs", command)).await;

    spec.start_worker(ScriptedDetector::silent());

    // The retry records the hang
    spec.wait_until("hang retry", Duration::from_secs(15), || {
        spec.engine
            .store()
            .get_task(&task.id)
            .is_some_and(|t| t.retry_count == 1)
    })
    .await;
    let retried = spec.engine.store().get_task(&task.id).unwrap();
    assert!(retried
        .error_history
        .iter()
        .any(|e| e.kind == "hung"), "{:?}", retried.error_history);

    // Second attempt completes
    let done = spec
        .wait_for_state(&task.id, TaskState::Completed, Duration::from_secs(30))
        .await;
    assert_eq!(done.retry_count, 1);

    spec.stop().await;
}
