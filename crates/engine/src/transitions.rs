// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The task state machine.
//!
//! All transitions happen here, and every one follows the same ordering:
//! mutate the record, write it durably to the store, mirror it to
//! `tasks/<id>/task.json`, and only then touch the queue directory. A
//! crash between the store write and the queue rename leaves a stale
//! `processing/` entry, which the recovery loop re-enqueues as an orphan.

use crate::alerts::AlertSink;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shep_core::backoff;
use shep_core::{AlertLevel, Checkpoint, Clock, Config, RateLimitInfo, Task, TaskState};
use shep_queue::DirQueue;
use shep_store::{Store, StoreError};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Durable representation of a task's recoverable state at a point in
/// time. Saved on every transition that requires resume context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_state: TaskState,
    pub retry_count: u32,
    pub checkpoint_data: Checkpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskSnapshot {
    fn capture(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            task_state: task.task_state,
            retry_count: task.retry_count,
            checkpoint_data: task.checkpoint_data.clone(),
            last_error: task.last_error.clone(),
            created_at: now,
        }
    }
}

/// Single owner of task state transitions.
pub struct TaskEngine {
    store: Store,
    queue: DirQueue,
    config: Config,
    clock: Arc<dyn Clock>,
    alerts: AlertSink,
}

impl TaskEngine {
    pub fn new(
        store: Store,
        queue: DirQueue,
        config: Config,
        clock: Arc<dyn Clock>,
        alerts: AlertSink,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            clock,
            alerts,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &DirQueue {
        &self.queue
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn alerts(&self) -> &AlertSink {
        &self.alerts
    }

    // ── Admission ────────────────────────────────────────────────────────

    /// Store a newly created task and enqueue it as PENDING.
    pub async fn admit(&self, task: Task) -> Result<Task, EngineError> {
        std::fs::create_dir_all(self.config.task_dir(&task.id))?;
        self.persist(&task).await?;
        self.queue.enqueue(&task)?;
        info!(task_id = %task.id, name = %task.name, priority = %task.priority, "task admitted");
        Ok(task)
    }

    // ── Transitions ──────────────────────────────────────────────────────

    /// PENDING/RETRYING → PROCESSING after a successful claim.
    pub async fn mark_processing(
        &self,
        task: &mut Task,
        worker_id: &str,
    ) -> Result<(), EngineError> {
        let from = task.task_state;
        task.task_state = TaskState::Processing;
        task.started_at = Some(self.clock.now());
        task.assigned_worker = Some(worker_id.to_string());
        self.persist(task).await?;
        debug!(task_id = %task.id, %from, worker_id, "processing");
        Ok(())
    }

    /// PROCESSING → COMPLETED once the completion marker was seen and the
    /// child exited cleanly.
    pub async fn mark_completed(&self, task: &mut Task) -> Result<(), EngineError> {
        task.task_state = TaskState::Completed;
        task.completed_at = Some(self.clock.now());
        self.persist(task).await?;
        self.queue.finalize(&task.id)?;
        info!(task_id = %task.id, retries = task.retry_count, "task completed");
        Ok(())
    }

    /// PROCESSING → WAITING_UNBAN on a rate-limit signal.
    ///
    /// The wait is the parsed/estimated window when one is available, the
    /// session-wait backoff otherwise. The queue entry stays in
    /// `processing/` until the coordinator promotes the task.
    pub async fn mark_waiting_unban(
        &self,
        task: &mut Task,
        info: Option<&RateLimitInfo>,
        reason: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let wait = match info {
            Some(info) => Duration::from_secs(info.retry_after_seconds),
            None => backoff::unban_wait(&self.config, task.retry_count),
        };

        task.task_state = TaskState::WaitingUnban;
        task.next_allowed_at = Some(now + chrono::Duration::from_std(wait).unwrap_or_default());
        task.assigned_worker = None;
        task.add_error("rate_limit", reason, now);

        self.save_snapshot(task)?;
        self.persist(task).await?;

        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P3,
                    format!("Task {} hit rate limit", task.id),
                    format!(
                        "Task '{}' hit rate limit, waiting until {:?}",
                        task.name, task.next_allowed_at
                    ),
                    now,
                )
                .task(&task.id),
        );
        Ok(())
    }

    /// PROCESSING → RETRYING on session-expiry, interaction-needed, a
    /// hang, or a retryable child failure. Forces FAILED once the retry
    /// budget is spent. Returns the state actually reached.
    pub async fn mark_retrying(
        &self,
        task: &mut Task,
        kind: &str,
        reason: &str,
    ) -> Result<TaskState, EngineError> {
        task.task_state = TaskState::Retrying;
        task.retry_count += 1;

        if task.retry_count >= task.max_retries {
            self.mark_failed(task, kind, reason).await?;
            return Ok(TaskState::Failed);
        }

        let now = self.clock.now();
        let delay = backoff::retry_delay(&self.config, task.retry_count);
        task.next_allowed_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        task.assigned_worker = None;
        task.add_error(kind, reason, now);

        self.save_snapshot(task)?;
        self.persist(task).await?;
        self.queue.release(task)?;

        info!(
            task_id = %task.id,
            retry = task.retry_count,
            delay_secs = delay.as_secs_f64(),
            kind,
            "task will retry"
        );
        Ok(TaskState::Retrying)
    }

    /// Any non-terminal state → FAILED.
    pub async fn mark_failed(
        &self,
        task: &mut Task,
        kind: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        task.task_state = TaskState::Failed;
        task.completed_at = Some(now);
        task.add_error(kind, reason, now);
        self.persist(task).await?;
        self.queue.finalize(&task.id)?;

        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P2,
                    format!("Task {} failed", task.id),
                    format!(
                        "Task '{}' failed after {} retries: {}",
                        task.name, task.retry_count, reason
                    ),
                    now,
                )
                .task(&task.id),
        );
        warn!(task_id = %task.id, kind, reason, "task failed");
        Ok(())
    }

    /// PROCESSING → PAUSED (output overflow, network loss). Requires an
    /// operator or recovery action to resume; the queue entry stays in
    /// `processing/`.
    pub async fn mark_paused(
        &self,
        task: &mut Task,
        kind: &str,
        reason: &str,
    ) -> Result<(), EngineError> {
        task.task_state = TaskState::Paused;
        task.assigned_worker = None;
        task.add_error(kind, reason, self.clock.now());
        self.save_snapshot(task)?;
        self.persist(task).await?;
        warn!(task_id = %task.id, kind, reason, "task paused");
        Ok(())
    }

    /// PROCESSING → NEEDS_HUMAN_REVIEW on an external security signal.
    /// Terminal for automated processing.
    pub async fn mark_needs_review(
        &self,
        task: &mut Task,
        reason: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        task.task_state = TaskState::NeedsHumanReview;
        task.assigned_worker = None;
        task.add_error("security", reason, now);
        self.persist(task).await?;
        self.queue.finalize(&task.id)?;

        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P2,
                    format!("Task {} needs human review", task.id),
                    reason.to_string(),
                    now,
                )
                .task(&task.id),
        );
        Ok(())
    }

    /// WAITING_UNBAN → PENDING, once the task's own window has elapsed
    /// and the coordinator reports global readiness.
    pub async fn release_waiting(&self, task: &mut Task) -> Result<(), EngineError> {
        let now = self.clock.now();
        task.task_state = TaskState::Pending;
        task.next_allowed_at = None;
        task.assigned_worker = None;
        self.persist(task).await?;
        self.queue.release(task)?;

        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P3,
                    format!("Task {} recovered", task.id),
                    format!(
                        "Task '{}' recovered from rate limit and ready for processing",
                        task.name
                    ),
                    now,
                )
                .task(&task.id),
        );
        info!(task_id = %task.id, "released from waiting_unban");
        Ok(())
    }

    /// Reset an orphaned PROCESSING task to PENDING.
    pub async fn recover_orphan(&self, task: &mut Task) -> Result<(), EngineError> {
        task.task_state = TaskState::Pending;
        task.assigned_worker = None;
        task.next_allowed_at = None;
        self.save_snapshot(task)?;
        self.persist(task).await?;
        if self.queue.is_processing(&task.id) {
            self.queue.release(task)?;
        } else if !self.queue.is_pending(&task.id) {
            self.queue.enqueue(task)?;
        }
        info!(task_id = %task.id, "orphaned task re-enqueued");
        Ok(())
    }

    /// Requeue the in-flight task during shutdown: RETRYING without
    /// consuming retry budget, ready immediately on restart.
    pub async fn requeue_for_shutdown(&self, task: &mut Task) -> Result<(), EngineError> {
        task.task_state = TaskState::Retrying;
        task.assigned_worker = None;
        task.next_allowed_at = None;
        self.save_snapshot(task)?;
        self.persist(task).await?;
        self.queue.release(task)?;
        info!(task_id = %task.id, "requeued for shutdown");
        Ok(())
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    /// Save the latest recovery snapshot: store row plus the
    /// `snapshots/<id>_snapshot.json` mirror.
    pub fn save_snapshot(&self, task: &Task) -> Result<(), EngineError> {
        let snapshot = TaskSnapshot::capture(task, self.clock.now());
        let bytes = serde_json::to_vec(&snapshot)?;

        self.store.save_snapshot(&task.id, "latest", bytes.clone())?;

        let dir = self.config.snapshots_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_snapshot.json", task.id));
        atomic_write(&path, &bytes)?;
        Ok(())
    }

    /// Load the latest snapshot, store first, filesystem mirror second.
    pub fn load_snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        if let Some(bytes) = self.store.get_snapshot(task_id, "latest") {
            if let Ok(snapshot) = serde_json::from_slice(&bytes) {
                return Some(snapshot);
            }
        }
        let path = self
            .config
            .snapshots_dir()
            .join(format!("{task_id}_snapshot.json"));
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    // ── Durable writes ───────────────────────────────────────────────────

    /// Store write with bounded retries on transient failures, then the
    /// `task.json` mirror. Corruption propagates untouched.
    async fn persist(&self, task: &Task) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            match self.store.save_task(task) {
                Ok(()) => break,
                Err(StoreError::Unavailable(e)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(task_id = %task.id, attempt, error = %e, "store write retry");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let dir = self.config.task_dir(&task.id);
        if dir.exists() {
            atomic_write(
                &dir.join("task.json"),
                &serde_json::to_vec_pretty(task)?,
            )?;
        }
        Ok(())
    }
}

/// Write a file atomically (tmp + fsync + rename).
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
#[path = "transitions_tests.rs"]
mod tests;
