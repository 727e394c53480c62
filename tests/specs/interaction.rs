//! S3 — interaction-needed: the detector's auto-response is captured and
//! the next run resumes the session carrying the prompt and the response.

use crate::prelude::*;
use shep_adapters::detector::Detection;
use shep_adapters::ScriptedDetector;
use shep_core::{TaskConfig, TaskState};
use std::time::Duration;

const SESSION: &str = "4c1ddad2-88f7-4f2b-9a6d-0123456789ab";

#[tokio::test(flavor = "multi_thread")]
async fn confirmation_prompt_resumes_with_the_answer() {
    let mut spec = Spec::new(|_| {});

    // The "assistant" used for the resume invocation: echoes its args so
    // the resume query is observable, then completes.
    let resume_bin = spec.write_stub(
        "assistant-stub.sh",
        &format!("echo \"RESUME ARGS: $*\"\n{}", marker_command()),
    );

    // First run emits a session id and a confirmation request, exits 0.
    let command = format!(
        "printf '%s\\n' '{{\"type\":\"system\",\"session_id\":\"{SESSION}\"}}'; \
         printf '%s\\n' '{{\"type\":\"result\",\"result\":\"Please confirm (y/n)\"}}'"
    );
    let task = spec
        .admit(TaskConfig::new("confirm", "confirm", command))
        .await;

    spec.start_worker_with_bin(
        ScriptedDetector::new([Detection::respond("y")]),
        resume_bin.to_str().unwrap(),
    );

    // The retry carries the interaction state
    spec.wait_until("interaction checkpoint", Duration::from_secs(15), || {
        spec.engine
            .store()
            .get_task(&task.id)
            .is_some_and(|t| t.checkpoint_data.needs_interaction)
    })
    .await;
    let retrying = spec.engine.store().get_task(&task.id).unwrap();
    assert_eq!(
        retrying.checkpoint_data.interaction_prompt.as_deref(),
        Some("Please confirm (y/n)")
    );
    assert_eq!(retrying.checkpoint_data.auto_response.as_deref(), Some("y"));
    assert_eq!(retrying.checkpoint_data.session_id.as_deref(), Some(SESSION));

    // The second run resumes the session and completes
    let done = spec
        .wait_for_state(&task.id, TaskState::Completed, Duration::from_secs(30))
        .await;
    assert_eq!(done.retry_count, 1);

    let log = spec.output_log(&task.id);
    // the resume invocation targeted the captured session ...
    assert!(log.contains(&format!("-r \"{SESSION}\"")), "{log}");
    // ... and the first user input carried the prompt and the answer
    let resume_echo = log
        .lines()
        .find(|l| l.starts_with("RESUME ARGS:"))
        .expect("resume run did not echo its arguments");
    assert!(resume_echo.contains("Please confirm (y/n)"));

    spec.stop().await;
}
