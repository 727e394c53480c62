// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auto-recovery: periodic health checks producing an ordered list of
//! remediation actions, plus the executors for those actions.

use crate::alerts::AlertSink;
use crate::error::EngineError;
use crate::transitions::TaskEngine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use shep_adapters::{terminate_pid, ConnectivityProbe, SystemMonitor};
use shep_adapters::subprocess::GRACEFUL_EXIT_WINDOW;
use shep_core::{AlertLevel, TaskState, WorkerStatus};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Heartbeat age beyond which an otherwise-live worker counts as stuck.
const STUCK_HEARTBEAT_AGE: ChronoDuration = ChronoDuration::minutes(10);

/// How long a PROCESSING task may run before the orphan rule applies.
const ORPHAN_PROCESSING_AGE: ChronoDuration = ChronoDuration::hours(6);

/// Sustained-CPU threshold for the stuck-worker rule.
const STUCK_CPU_PERCENT: f32 = 95.0;

/// RSS threshold paired with the CPU rule.
const STUCK_RSS_BYTES: u64 = 1024 * 1024 * 1024;

/// RSS above which a worker is a candidate for memory-pressure restart.
const MEMORY_HOG_RSS: u64 = 500 * 1024 * 1024;

/// System memory percentage that triggers the pressure action.
const MEMORY_PRESSURE_PERCENT: f64 = 90.0;

/// What a detection produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryActionKind {
    CleanupDiskSpace,
    ManageMemoryPressure,
    RestartWorker,
    RecoverOrphanedTask,
    PauseAllProcessing,
    Diagnose,
}

impl RecoveryActionKind {
    fn name(&self) -> &'static str {
        match self {
            RecoveryActionKind::CleanupDiskSpace => "cleanup_disk_space",
            RecoveryActionKind::ManageMemoryPressure => "manage_memory_pressure",
            RecoveryActionKind::RestartWorker => "restart_worker",
            RecoveryActionKind::RecoverOrphanedTask => "recover_orphaned_task",
            RecoveryActionKind::PauseAllProcessing => "pause_all_processing",
            RecoveryActionKind::Diagnose => "diagnose",
        }
    }
}

/// One remediation to execute. Lower priority value runs first.
#[derive(Debug, Clone)]
pub struct RecoveryAction {
    pub kind: RecoveryActionKind,
    pub priority: u8,
    pub description: String,
    pub params: serde_json::Value,
}

impl RecoveryAction {
    /// Dedup key: action name + hash of its parameters.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.params.to_string().as_bytes());
        format!("{}_{:x}", self.kind.name(), hasher.finalize())
    }
}

/// Periodic health check and remediation executor.
pub struct RecoveryLoop {
    engine: Arc<TaskEngine>,
    system: Arc<dyn SystemMonitor>,
    connectivity: Arc<dyn ConnectivityProbe>,
    alerts: AlertSink,
    in_flight: HashSet<String>,
}

impl RecoveryLoop {
    pub fn new(
        engine: Arc<TaskEngine>,
        system: Arc<dyn SystemMonitor>,
        connectivity: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let alerts = engine.alerts().clone();
        Self {
            engine,
            system,
            connectivity,
            alerts,
            in_flight: HashSet::new(),
        }
    }

    /// Drive the loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("recovery loop started");
        let period = self.engine.config().health_check_period();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(e) = self.step().await {
                        warn!(error = %e, "recovery step failed");
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("recovery loop stopped");
    }

    /// One health-check pass: detect, order, dedup, execute.
    pub async fn step(&mut self) -> Result<(), EngineError> {
        let mut actions = self.check_system_health().await;
        actions.sort_by_key(|a| a.priority);

        let mut seen = HashSet::new();
        for action in actions {
            let key = action.dedup_key();
            if !seen.insert(key.clone()) || self.in_flight.contains(&key) {
                debug!(action = action.kind.name(), "skipping duplicate action");
                continue;
            }

            self.in_flight.insert(key.clone());
            let result = self.execute(&action).await;
            self.in_flight.remove(&key);

            match result {
                Ok(done) => {
                    if done {
                        info!(action = action.kind.name(), "recovery action completed");
                    } else {
                        warn!(action = action.kind.name(), "recovery action fell short");
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(action = action.kind.name(), error = %e, "recovery action error"),
            }
        }
        Ok(())
    }

    // ── Detection ────────────────────────────────────────────────────────

    /// Evaluate every detection rule and collect remediations.
    pub async fn check_system_health(&self) -> Vec<RecoveryAction> {
        let mut actions = Vec::new();
        let config = self.engine.config();
        let now = self.engine.clock().now();

        if let Some(free_gb) = self.system.disk_free_gb(&config.base_dir) {
            if free_gb < config.min_disk_space_gb as f64 {
                actions.push(RecoveryAction {
                    kind: RecoveryActionKind::CleanupDiskSpace,
                    priority: 1,
                    description: format!("Low disk space: {free_gb:.1}GB remaining"),
                    params: json!({ "threshold_gb": config.min_disk_space_gb }),
                });
            }
        }

        let memory = self.system.memory_used_percent();
        if memory >= MEMORY_PRESSURE_PERCENT {
            actions.push(RecoveryAction {
                kind: RecoveryActionKind::ManageMemoryPressure,
                priority: 2,
                description: format!("High memory usage: {memory:.1}%"),
                params: json!({ "usage_percent": memory.round() }),
            });
        }

        for worker in self.stuck_workers(now) {
            actions.push(RecoveryAction {
                kind: RecoveryActionKind::RestartWorker,
                priority: 1,
                description: format!("Worker {} appears stuck", worker.worker_id),
                params: json!({ "worker_id": worker.worker_id, "pid": worker.pid }),
            });
        }

        for task_id in self.orphaned_tasks(now) {
            actions.push(RecoveryAction {
                kind: RecoveryActionKind::RecoverOrphanedTask,
                priority: 2,
                description: format!("Task {task_id} appears orphaned"),
                params: json!({ "task_id": task_id }),
            });
        }

        if !self.connectivity.is_connected().await {
            actions.push(RecoveryAction {
                kind: RecoveryActionKind::PauseAllProcessing,
                priority: 1,
                description: "Network connectivity issues detected".to_string(),
                params: json!({}),
            });
        }

        actions
    }

    /// A worker is stuck when its pid is dead, its heartbeat is stale, or
    /// it burns CPU while holding a large RSS.
    fn stuck_workers(&self, now: DateTime<Utc>) -> Vec<WorkerStatus> {
        let recent = self
            .engine
            .store()
            .get_active_workers(ChronoDuration::hours(1), now);

        recent
            .into_iter()
            .filter(|worker| {
                let Some(pid) = worker.pid else {
                    return false;
                };
                if !self.system.pid_alive(pid) {
                    return true;
                }
                if now - worker.last_heartbeat > STUCK_HEARTBEAT_AGE {
                    return true;
                }
                if let Some(stats) = self.system.process_stats(pid) {
                    if stats.cpu_percent > STUCK_CPU_PERCENT && stats.rss_bytes > STUCK_RSS_BYTES {
                        return true;
                    }
                }
                false
            })
            .collect()
    }

    /// PROCESSING for over six hours with no active worker behind it.
    fn orphaned_tasks(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale_window =
            ChronoDuration::seconds(self.engine.config().worker_stale_secs as i64);
        let active: HashSet<String> = self
            .engine
            .store()
            .get_active_workers(stale_window, now)
            .into_iter()
            .map(|w| w.worker_id)
            .collect();

        self.engine
            .store()
            .get_tasks_by_state(&[TaskState::Processing])
            .into_iter()
            .filter(|task| {
                let old = task
                    .started_at
                    .is_some_and(|at| now - at > ORPHAN_PROCESSING_AGE);
                let ownerless = match &task.assigned_worker {
                    Some(worker) => !active.contains(worker),
                    None => true,
                };
                old && ownerless
            })
            .map(|task| task.id)
            .collect()
    }

    /// Boot-time reconciliation: a `processing/` entry whose task is still
    /// PROCESSING with no active worker is an orphan from a crash and is
    /// re-enqueued immediately, without the six-hour wait.
    pub async fn reconcile_orphans(&self) -> Result<usize, EngineError> {
        let now = self.engine.clock().now();
        let stale_window =
            ChronoDuration::seconds(self.engine.config().worker_stale_secs as i64);
        let active: HashSet<String> = self
            .engine
            .store()
            .get_active_workers(stale_window, now)
            .into_iter()
            .map(|w| w.worker_id)
            .collect();

        let mut recovered = 0;
        for entry in self.engine.queue().scan_processing()? {
            let Some(mut task) = self.engine.store().get_task(&entry.id) else {
                continue;
            };
            if task.task_state != TaskState::Processing {
                continue;
            }
            let ownerless = match &task.assigned_worker {
                Some(worker) => !active.contains(worker),
                None => true,
            };
            if !ownerless {
                continue;
            }

            info!(task_id = %task.id, "recovering orphan at startup");
            self.engine.recover_orphan(&mut task).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    // ── Remediation ──────────────────────────────────────────────────────

    async fn execute(&self, action: &RecoveryAction) -> Result<bool, EngineError> {
        info!(action = action.kind.name(), description = %action.description, "executing recovery action");
        match &action.kind {
            RecoveryActionKind::CleanupDiskSpace => self.cleanup_disk_space().await,
            RecoveryActionKind::ManageMemoryPressure => self.manage_memory_pressure().await,
            RecoveryActionKind::RestartWorker => self.restart_worker(action).await,
            RecoveryActionKind::RecoverOrphanedTask => self.recover_orphaned_task(action).await,
            RecoveryActionKind::PauseAllProcessing => self.pause_all_processing().await,
            RecoveryActionKind::Diagnose => self.diagnose(action),
        }
    }

    /// Purge expired logs, snapshots, completed-task directories, `.tmp`
    /// files, and empty directories; re-check the threshold afterwards.
    async fn cleanup_disk_space(&self) -> Result<bool, EngineError> {
        let config = self.engine.config();
        let now = self.engine.clock().now();
        let cutoff = now - ChronoDuration::days(config.retention_days as i64);

        remove_files_older_than(&config.logs_dir(), "log", cutoff);
        remove_files_older_than(&config.snapshots_dir(), "json", cutoff);

        let report = self.engine.store().cleanup(config.retention_days, now)?;
        for task_id in &report.purged_tasks {
            let dir = config.task_dir(task_id);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(task_id, error = %e, "failed to remove task directory");
                }
            }
        }

        remove_tmp_files(&config.base_dir);
        remove_empty_dirs(&config.base_dir);
        // The empty-dir sweep may have taken the managed layout with it
        config.ensure_layout()?;

        let free = self.system.disk_free_gb(&config.base_dir).unwrap_or(0.0);
        if free >= config.min_disk_space_gb as f64 {
            return Ok(true);
        }

        self.alerts.emit(
            AlertLevel::P1,
            "Critical disk space",
            format!("Disk space still low after cleanup: {free:.1}GB remaining"),
            now,
        );
        Ok(false)
    }

    /// Restart up to two of the largest workers above the RSS threshold.
    async fn manage_memory_pressure(&self) -> Result<bool, EngineError> {
        let now = self.engine.clock().now();
        let mut hogs: Vec<WorkerStatus> = self
            .engine
            .store()
            .get_active_workers(ChronoDuration::hours(1), now)
            .into_iter()
            .filter(|w| w.rss_bytes.is_some_and(|rss| rss > MEMORY_HOG_RSS))
            .collect();
        hogs.sort_by_key(|w| std::cmp::Reverse(w.rss_bytes.unwrap_or(0)));

        let mut restarted = 0;
        for worker in hogs.into_iter().take(2) {
            if self.terminate_worker(&worker).await {
                restarted += 1;
            }
        }

        if restarted > 0 {
            info!(restarted, "restarted memory-intensive workers");
        }
        Ok(restarted > 0)
    }

    async fn restart_worker(&self, action: &RecoveryAction) -> Result<bool, EngineError> {
        let worker_id = action.params["worker_id"].as_str().unwrap_or_default();
        let Some(worker) = self.engine.store().get_worker(worker_id) else {
            return Ok(false);
        };
        Ok(self.terminate_worker(&worker).await)
    }

    /// Kill the worker's recorded pid (the assistant child it is running);
    /// the worker loop requeues the task and keeps serving.
    async fn terminate_worker(&self, worker: &WorkerStatus) -> bool {
        let now = self.engine.clock().now();
        if let Some(pid) = worker.pid {
            if self.system.pid_alive(pid) {
                terminate_pid(self.system.as_ref(), pid, GRACEFUL_EXIT_WINDOW).await;
            }
        }

        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P2,
                    format!("Worker {} restarted", worker.worker_id),
                    format!(
                        "Restarted stuck worker {} (PID: {:?})",
                        worker.worker_id, worker.pid
                    ),
                    now,
                )
                .worker(&worker.worker_id),
        );
        true
    }

    async fn recover_orphaned_task(&self, action: &RecoveryAction) -> Result<bool, EngineError> {
        let task_id = action.params["task_id"].as_str().unwrap_or_default();
        let Some(mut task) = self.engine.store().get_task(task_id) else {
            return Ok(false);
        };
        if task.task_state != TaskState::Processing {
            return Ok(false);
        }
        self.engine.recover_orphan(&mut task).await?;
        Ok(true)
    }

    /// Network loss: park every PROCESSING task as PAUSED.
    async fn pause_all_processing(&self) -> Result<bool, EngineError> {
        let now = self.engine.clock().now();
        let processing = self
            .engine
            .store()
            .get_tasks_by_state(&[TaskState::Processing]);
        let count = processing.len();

        for mut task in processing {
            self.engine
                .mark_paused(&mut task, "network", "Network connectivity issues detected")
                .await?;
        }

        self.alerts.emit(
            AlertLevel::P1,
            "Network connectivity failure",
            format!("Paused {count} tasks due to network issues"),
            now,
        );
        Ok(true)
    }

    fn diagnose(&self, action: &RecoveryAction) -> Result<bool, EngineError> {
        let now = self.engine.clock().now();
        let counts = self.engine.store().task_counts();
        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P1,
                    "System diagnostic required",
                    action.description.clone(),
                    now,
                )
                .meta("pending_tasks", json!(counts.pending))
                .meta("processing_tasks", json!(counts.processing))
                .meta("failed_tasks", json!(counts.failed))
                .meta(
                    "memory_used_percent",
                    json!(self.system.memory_used_percent()),
                ),
        );
        Ok(true)
    }
}

// ── Filesystem sweeps ────────────────────────────────────────────────────

fn remove_files_older_than(dir: &Path, extension: &str, cutoff: DateTime<Utc>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if DateTime::<Utc>::from(modified) < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove expired file");
            }
        }
    }
}

fn remove_tmp_files(base: &Path) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            remove_tmp_files(&path);
        } else if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
            let _ = std::fs::remove_file(&path);
        }
    }
}

fn remove_empty_dirs(base: &Path) {
    let Ok(entries) = std::fs::read_dir(base) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        remove_empty_dirs(&path);
        if std::fs::read_dir(&path).map(|mut d| d.next().is_none()).unwrap_or(false) {
            let _ = std::fs::remove_dir(&path);
        }
    }
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
