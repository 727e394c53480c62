//! S6 — priority ordering: a single worker dispatches urgent before
//! normal before low, regardless of arrival order.

use crate::prelude::*;
use shep_adapters::ScriptedDetector;
use shep_core::{TaskPriority, TaskState};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_order_follows_priority() {
    let mut spec = Spec::new(|_| {});
    let order = spec.scratch("order.txt");

    let command = |name: &str| {
        format!(
            "echo {name} >> {order}; {done}",
            order = order.display(),
            done = marker_command()
        )
    };

    // arrival order: low, urgent, normal (20 ms apart)
    spec.admit_with_priority("low", &command("low"), TaskPriority::Low)
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    spec.admit_with_priority("urgent", &command("urgent"), TaskPriority::Urgent)
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    spec.admit_with_priority("normal", &command("normal"), TaskPriority::Normal)
        .await;

    // single worker drains the queue
    spec.start_worker(ScriptedDetector::silent());
    for id in ["low", "urgent", "normal"] {
        spec.wait_for_state(id, TaskState::Completed, Duration::from_secs(30))
            .await;
    }

    let recorded = std::fs::read_to_string(order).unwrap();
    let sequence: Vec<&str> = recorded.split_whitespace().collect();
    assert_eq!(sequence, vec!["urgent", "normal", "low"]);

    spec.stop().await;
}
