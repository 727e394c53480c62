// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state from ledger replay.
//!
//! Every op handler is idempotent: applying the same op twice produces the
//! same state as applying it once, because ops may be applied both when
//! written and again during replay after a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shep_core::{Alert, Task, TaskState, WorkerStatus};
use std::collections::{BTreeSet, HashMap};

/// One entry in the write-once idempotency ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub task_id: String,
    pub executed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Record-level operations appended to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LedgerOp {
    TaskSaved {
        task: Task,
    },
    WorkerSaved {
        status: WorkerStatus,
    },
    IdempotencyMarked {
        record: IdempotencyRecord,
    },
    SnapshotSaved {
        task_id: String,
        snapshot_id: String,
        data: Vec<u8>,
    },
    AlertSaved {
        alert: Alert,
    },
    Purged {
        task_ids: Vec<String>,
        alert_ids: Vec<String>,
    },
}

/// Materialized state built from ledger replay.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LedgerState {
    pub tasks: HashMap<String, Task>,
    pub workers: HashMap<String, WorkerStatus>,
    pub idempotency: HashMap<String, IdempotencyRecord>,
    /// task_id → snapshot_id → opaque bytes ("latest" is overwritten per save)
    pub task_snapshots: HashMap<String, HashMap<String, Vec<u8>>>,
    pub alerts: HashMap<String, Alert>,
    /// Secondary index by task state; rebuilt on load, never serialized.
    #[serde(skip)]
    by_state: HashMap<TaskState, BTreeSet<String>>,
}

impl LedgerState {
    /// Apply an op to derive state changes.
    pub fn apply_op(&mut self, op: &LedgerOp) {
        match op {
            LedgerOp::TaskSaved { task } => {
                self.index_task(task);
                self.tasks.insert(task.id.clone(), task.clone());
            }

            LedgerOp::WorkerSaved { status } => {
                self.workers.insert(status.worker_id.clone(), status.clone());
            }

            LedgerOp::IdempotencyMarked { record } => {
                // Write-once: replay must not clobber the first record
                self.idempotency
                    .entry(record.key.clone())
                    .or_insert_with(|| record.clone());
            }

            LedgerOp::SnapshotSaved {
                task_id,
                snapshot_id,
                data,
            } => {
                self.task_snapshots
                    .entry(task_id.clone())
                    .or_default()
                    .insert(snapshot_id.clone(), data.clone());
            }

            LedgerOp::AlertSaved { alert } => {
                self.alerts.insert(alert.id.clone(), alert.clone());
            }

            LedgerOp::Purged {
                task_ids,
                alert_ids,
            } => {
                for id in task_ids {
                    if let Some(task) = self.tasks.remove(id) {
                        if let Some(ids) = self.by_state.get_mut(&task.task_state) {
                            ids.remove(id);
                        }
                    }
                    self.task_snapshots.remove(id);
                }
                for id in alert_ids {
                    self.alerts.remove(id);
                }
            }
        }
    }

    /// Maintain the by-state index for an incoming task upsert.
    fn index_task(&mut self, task: &Task) {
        if let Some(previous) = self.tasks.get(&task.id) {
            if previous.task_state != task.task_state {
                if let Some(ids) = self.by_state.get_mut(&previous.task_state) {
                    ids.remove(&task.id);
                }
            }
        }
        self.by_state
            .entry(task.task_state)
            .or_default()
            .insert(task.id.clone());
    }

    /// Rebuild the by-state index after deserializing a snapshot.
    pub fn rebuild_indexes(&mut self) {
        self.by_state.clear();
        for (id, task) in &self.tasks {
            self.by_state
                .entry(task.task_state)
                .or_default()
                .insert(id.clone());
        }
    }

    /// Ids of tasks currently in `state` (unordered beyond id order).
    pub fn ids_in_state(&self, state: TaskState) -> impl Iterator<Item = &String> {
        self.by_state.get(&state).into_iter().flatten()
    }

    /// Tasks in any of `states`, ordered by `created_at`.
    pub fn tasks_in_states(&self, states: &[TaskState]) -> Vec<Task> {
        let mut tasks: Vec<Task> = states
            .iter()
            .flat_map(|s| self.ids_in_state(*s))
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// PENDING tasks ready at `now`, ordered by (priority rank, created_at),
    /// truncated to `limit`.
    pub fn pending_ready(&self, limit: usize, now: DateTime<Utc>) -> Vec<Task> {
        let mut ready: Vec<Task> = self
            .ids_in_state(TaskState::Pending)
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready.truncate(limit);
        ready
    }
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
