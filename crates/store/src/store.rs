// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The public store: single-writer transactional semantics over the JSONL
//! ledger, with any number of readers served from the materialized state.

use crate::ledger::{IdempotencyRecord, LedgerOp, LedgerState};
use crate::snapshot::{LedgerSnapshot, SnapshotError};
use crate::wal::{Wal, WalError};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use shep_core::{Alert, Task, TaskState, WorkerStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O failure; the operation may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backing file is damaged beyond tail repair. Fatal.
    #[error("store corrupt: {0}")]
    Corrupt(String),
    #[error("idempotency key already recorded: {0}")]
    IdempotencyConflict(String),
}

impl From<WalError> for StoreError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Corrupt { .. } => StoreError::Corrupt(e.to_string()),
            WalError::Io(_) | WalError::Json(_) => StoreError::Unavailable(e.to_string()),
        }
    }
}

impl From<SnapshotError> for StoreError {
    fn from(e: SnapshotError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// What `cleanup` removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub purged_tasks: Vec<String>,
    pub purged_alerts: Vec<String>,
}

/// Task counts by coarse state, for health reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

struct Inner {
    wal: Wal,
    state: LedgerState,
    snapshot_path: PathBuf,
    ops_since_snapshot: u64,
}

/// Durable store of tasks, heartbeats, the idempotency ledger, recovery
/// snapshots, and alerts.
///
/// Writers serialize through a single mutex; every write is appended to
/// the ledger and fsync'd before it is applied to the materialized state,
/// so readers observe either the pre- or post-write value, never torn.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
}

impl Store {
    /// Open the store: load the snapshot (if any), replay the ledger
    /// suffix, and rebuild the indexes.
    pub fn open(ledger_path: &Path, snapshot_path: &Path) -> Result<Self, StoreError> {
        let mut wal = Wal::open(ledger_path)?;

        let (mut state, snapshot_seq) = match LedgerSnapshot::load(snapshot_path)? {
            Some(snapshot) => (snapshot.state, snapshot.seq),
            None => (LedgerState::default(), 0),
        };
        wal.bump_seq(snapshot_seq);

        let replayed = wal.entries_after(snapshot_seq)?;
        for entry in &replayed {
            state.apply_op(&entry.op);
        }
        state.rebuild_indexes();

        info!(
            ledger = %ledger_path.display(),
            snapshot_seq,
            replayed = replayed.len(),
            "store opened"
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                wal,
                state,
                snapshot_path: snapshot_path.to_owned(),
                ops_since_snapshot: replayed.len() as u64,
            })),
        })
    }

    fn write(&self, op: LedgerOp) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.wal.append(&op)?;
        inner.state.apply_op(&op);
        inner.ops_since_snapshot += 1;
        Ok(())
    }

    // ── Tasks ────────────────────────────────────────────────────────────

    /// Upsert a task record.
    pub fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.write(LedgerOp::TaskSaved { task: task.clone() })
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.lock().state.tasks.get(id).cloned()
    }

    /// Tasks in any of `states`, ordered by creation time.
    pub fn get_tasks_by_state(&self, states: &[TaskState]) -> Vec<Task> {
        self.inner.lock().state.tasks_in_states(states)
    }

    /// PENDING tasks whose `next_allowed_at` is absent or elapsed, ordered
    /// by (priority, created_at).
    pub fn get_pending_ready(&self, limit: usize, now: DateTime<Utc>) -> Vec<Task> {
        self.inner.lock().state.pending_ready(limit, now)
    }

    pub fn task_counts(&self) -> TaskCounts {
        let inner = self.inner.lock();
        TaskCounts {
            pending: inner.state.ids_in_state(TaskState::Pending).count(),
            processing: inner.state.ids_in_state(TaskState::Processing).count(),
            completed: inner.state.ids_in_state(TaskState::Completed).count(),
            failed: inner.state.ids_in_state(TaskState::Failed).count(),
        }
    }

    // ── Idempotency ledger ───────────────────────────────────────────────

    /// Record a key as executed. Fails with `IdempotencyConflict` if the
    /// key already exists; the ledger is write-once per key.
    pub fn mark_idempotent(
        &self,
        key: &str,
        task_id: &str,
        result: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        {
            let inner = self.inner.lock();
            if inner.state.idempotency.contains_key(key) {
                return Err(StoreError::IdempotencyConflict(key.to_string()));
            }
        }
        self.write(LedgerOp::IdempotencyMarked {
            record: IdempotencyRecord {
                key: key.to_string(),
                task_id: task_id.to_string(),
                executed_at: now,
                result,
            },
        })
    }

    pub fn check_idempotent(&self, key: &str) -> Option<IdempotencyRecord> {
        self.inner.lock().state.idempotency.get(key).cloned()
    }

    // ── Workers ──────────────────────────────────────────────────────────

    pub fn save_worker_status(&self, status: &WorkerStatus) -> Result<(), StoreError> {
        self.write(LedgerOp::WorkerSaved {
            status: status.clone(),
        })
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.inner.lock().state.workers.get(worker_id).cloned()
    }

    /// Workers whose heartbeat is younger than `max_age`.
    pub fn get_active_workers(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<WorkerStatus> {
        self.inner
            .lock()
            .state
            .workers
            .values()
            .filter(|w| now - w.last_heartbeat <= max_age)
            .cloned()
            .collect()
    }

    // ── Recovery snapshots ───────────────────────────────────────────────

    /// Save a recovery snapshot. The "latest" snapshot id is overwritten
    /// per save.
    pub fn save_snapshot(
        &self,
        task_id: &str,
        snapshot_id: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        self.write(LedgerOp::SnapshotSaved {
            task_id: task_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            data,
        })
    }

    pub fn get_snapshot(&self, task_id: &str, snapshot_id: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .state
            .task_snapshots
            .get(task_id)
            .and_then(|m| m.get(snapshot_id))
            .cloned()
    }

    // ── Alerts ───────────────────────────────────────────────────────────

    pub fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.write(LedgerOp::AlertSaved {
            alert: alert.clone(),
        })
    }

    pub fn get_unresolved_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .inner
            .lock()
            .state
            .alerts
            .values()
            .filter(|a| !a.is_resolved())
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Purge COMPLETED/FAILED tasks older than the retention window along
    /// with their recovery snapshots, plus resolved alerts older than the
    /// window. Returns what was removed so the caller can delete the
    /// matching on-disk directories.
    pub fn cleanup(&self, retention_days: u32, now: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        let cutoff = now - Duration::days(retention_days as i64);

        let (task_ids, alert_ids) = {
            let inner = self.inner.lock();
            let task_ids: Vec<String> = inner
                .state
                .tasks
                .values()
                .filter(|t| {
                    matches!(t.task_state, TaskState::Completed | TaskState::Failed)
                        && t.completed_at.unwrap_or(t.created_at) < cutoff
                })
                .map(|t| t.id.clone())
                .collect();
            let alert_ids: Vec<String> = inner
                .state
                .alerts
                .values()
                .filter(|a| a.resolved_at.is_some_and(|at| at < cutoff))
                .map(|a| a.id.clone())
                .collect();
            (task_ids, alert_ids)
        };

        if task_ids.is_empty() && alert_ids.is_empty() {
            return Ok(CleanupReport::default());
        }

        debug!(
            tasks = task_ids.len(),
            alerts = alert_ids.len(),
            "purging expired records"
        );
        self.write(LedgerOp::Purged {
            task_ids: task_ids.clone(),
            alert_ids: alert_ids.clone(),
        })?;

        Ok(CleanupReport {
            purged_tasks: task_ids,
            purged_alerts: alert_ids,
        })
    }

    /// Write a snapshot of the current state and truncate the ledger
    /// through it. Called periodically by the supervisor.
    pub fn checkpoint(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.ops_since_snapshot == 0 {
            return Ok(());
        }

        let seq = inner.wal.write_seq();
        let snapshot = LedgerSnapshot::new(seq, inner.state.clone(), now);
        snapshot.save(&inner.snapshot_path)?;
        // Only truncate after the snapshot is durable
        inner.wal.truncate_through(seq)?;
        inner.ops_since_snapshot = 0;

        debug!(seq, "store checkpoint complete");
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
