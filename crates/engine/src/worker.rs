// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The worker: claims one task at a time, runs the assistant as a child
//! process, streams its output through the [`OutputMonitor`], and turns
//! verdicts into state transitions.
//!
//! Two cooperating loops per worker: the heartbeat loop (status row every
//! `heartbeat_interval`) and the claim/execute loop. Both stop promptly on
//! shutdown; an in-flight task persists its resume patch and is requeued
//! without consuming retry budget.

use crate::coordinator::CoordinatorHandle;
use crate::error::EngineError;
use crate::monitor::{MonitorVerdict, OutputMonitor};
use crate::resume::{self, Invocation};
use crate::transitions::{atomic_write, TaskEngine};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shep_adapters::subprocess::{
    run_with_timeout, shell_command, spawn_streaming, FALLBACK_CAPTURE_TIMEOUT,
    GRACEFUL_EXIT_WINDOW,
};
use shep_adapters::{InteractionDetector, SystemMonitor};
use shep_core::{Task, TaskState, WorkerState, WorkerStatus};
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sleep between claim attempts when the queue is empty.
const CLAIM_POLL: Duration = Duration::from_secs(5);

/// Pause after an unexpected execution error before claiming again.
const ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Read chunk size for the streaming loop.
const READ_CHUNK: usize = 4096;

/// Per-read deadline; expiry drives the monitor's tick checks.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// What the streaming loop ended with.
enum StreamEnd {
    /// Child closed its output; exit adjudication follows.
    Eof,
    /// The monitor reached a decision mid-stream.
    Verdict(MonitorVerdict),
    /// Shutdown was requested.
    Shutdown,
    /// Reading failed.
    ReadError(std::io::Error),
}

pub struct Worker {
    id: String,
    engine: Arc<TaskEngine>,
    detector: Arc<dyn InteractionDetector>,
    system: Arc<dyn SystemMonitor>,
    coordinator: CoordinatorHandle,
    assistant_bin: String,
    status: Arc<Mutex<WorkerStatus>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        engine: Arc<TaskEngine>,
        detector: Arc<dyn InteractionDetector>,
        system: Arc<dyn SystemMonitor>,
        coordinator: CoordinatorHandle,
        assistant_bin: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let status = WorkerStatus::new(&id, engine.clock().now());
        Self {
            id,
            engine,
            detector,
            system,
            coordinator,
            assistant_bin: assistant_bin.into(),
            status: Arc::new(Mutex::new(status)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until shutdown. Returns an error only for fatal (store
    /// corruption) failures.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(worker_id = %self.id, "worker started");
        {
            let mut status = self.status.lock();
            status.state = WorkerState::Running;
            status.last_heartbeat = self.engine.clock().now();
        }
        let _ = self.engine.store().save_worker_status(&self.status.lock().clone());

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.status),
            Arc::clone(&self.system),
            shutdown.clone(),
        ));

        let result = self.claim_loop(shutdown).await;

        heartbeat.abort();
        info!(worker_id = %self.id, "worker stopped");
        result
    }

    async fn claim_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let claimed = match self.engine.queue().claim(self.engine.clock().now()) {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim failed");
                    None
                }
            };

            let Some(task) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(CLAIM_POLL) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
                continue;
            };

            match self.execute(task, &mut shutdown).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    error!(worker_id = %self.id, error = %e, "fatal store failure");
                    return Err(e);
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "task execution error");
                    self.status.lock().state = WorkerState::Restarting;
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    self.status.lock().state = WorkerState::Running;
                }
            }
        }
    }

    /// Execute one claimed task to a transition.
    async fn execute(
        &self,
        mut task: Task,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        info!(worker_id = %self.id, task_id = %task.id, name = %task.name, "executing task");

        let task_dir = self.engine.config().task_dir(&task.id);
        std::fs::create_dir_all(&task_dir)?;

        // Resume context is assembled from the PRE-transition state
        let resume_context = if task.task_state == TaskState::Retrying {
            resume::generate_resume_context(&task, &task_dir)
        } else {
            String::new()
        };

        // Skip execution entirely when an idempotency key already ran
        if let Some(key) = self.executed_idempotency_key(&task) {
            info!(task_id = %task.id, key, "idempotency key already executed");
            self.engine.mark_completed(&mut task).await?;
            return Ok(());
        }

        self.engine.mark_processing(&mut task, &self.id).await?;
        self.status.lock().current_task_id = Some(task.id.clone());

        let invocation = resume::plan_invocation(
            &task,
            &resume_context,
            &self.assistant_bin,
            &task_dir,
        );
        if let Invocation::LegacyResume { context, .. } = &invocation {
            atomic_write(&task_dir.join("resume_context.txt"), context.as_bytes())?;
        }
        if let Invocation::SessionResume(_) = &invocation {
            info!(task_id = %task.id, "resuming assistant session");
        }

        let result = self
            .run_child(&mut task, &task_dir, invocation.command(), shutdown)
            .await;

        {
            let mut status = self.status.lock();
            status.current_task_id = None;
            status.pid = None;
        }
        result
    }

    async fn run_child(
        &self,
        task: &mut Task,
        task_dir: &Path,
        command: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let cwd = task
            .working_dir
            .clone()
            .unwrap_or_else(|| task_dir.to_path_buf());
        std::fs::create_dir_all(&cwd)?;

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(task_dir.join("output.log"))?;
        let started = self.engine.clock().now();
        write_log_header(&mut log, task, command, &cwd, started)?;

        let mut child = spawn_streaming(command, Some(&cwd), &task.environment)
            .map_err(|e| EngineError::SpawnFailed(e.to_string()))?;
        self.status.lock().pid = child.id();

        let mut monitor = OutputMonitor::new(self.engine.config(), &task.command, started);
        let end = self
            .stream(task, &mut child, &mut monitor, &mut log, shutdown)
            .await;

        match end {
            StreamEnd::Verdict(verdict) => {
                self.save_resume_patch(task, &monitor, task_dir);
                self.terminate_child(&mut child).await;
                write_log_footer(&mut log, &monitor, None, started, self.engine.clock().now())?;
                self.apply_verdict(task, verdict).await
            }

            StreamEnd::Shutdown => {
                info!(task_id = %task.id, "shutdown during execution, requeueing");
                self.save_resume_patch(task, &monitor, task_dir);
                self.terminate_child(&mut child).await;
                write_log_footer(&mut log, &monitor, None, started, self.engine.clock().now())?;
                self.engine.requeue_for_shutdown(task).await
            }

            StreamEnd::ReadError(e) => {
                warn!(task_id = %task.id, error = %e, "output stream failed");
                self.save_resume_patch(task, &monitor, task_dir);
                self.terminate_child(&mut child).await;
                write_log_footer(&mut log, &monitor, None, started, self.engine.clock().now())?;
                self.count_retry_outcome(
                    self.engine
                        .mark_retrying(task, "stream_error", &e.to_string())
                        .await?,
                );
                Ok(())
            }

            StreamEnd::Eof => {
                let exit = match tokio::time::timeout(GRACEFUL_EXIT_WINDOW, child.wait()).await {
                    Ok(Ok(status)) => status.code().unwrap_or(-1),
                    Ok(Err(e)) => {
                        warn!(task_id = %task.id, error = %e, "wait failed");
                        -1
                    }
                    Err(_) => {
                        self.terminate_child(&mut child).await;
                        -1
                    }
                };

                // Nothing streamed but a clean exit: recapture once
                if exit == 0 && monitor.total_bytes() == 0 {
                    if let Some(recaptured) = self.fallback_capture(task, &cwd).await {
                        writeln!(log, "\n=== FALLBACK OUTPUT CAPTURE ===")?;
                        log.write_all(recaptured.as_bytes())?;
                        let report = monitor.on_chunk(self.engine.clock().now(), &recaptured);
                        for sid in report.session_ids {
                            self.adopt_session_id(task, &sid);
                        }
                    }
                }

                self.save_resume_patch(task, &monitor, task_dir);
                write_log_footer(
                    &mut log,
                    &monitor,
                    Some(exit),
                    started,
                    self.engine.clock().now(),
                )?;
                self.adjudicate_exit(task, exit, &monitor).await
            }
        }
    }

    /// The streaming loop: 4 KiB reads on a 1 s deadline, chunks into the
    /// monitor, ticks on silence.
    async fn stream(
        &self,
        task: &mut Task,
        child: &mut Child,
        monitor: &mut OutputMonitor,
        log: &mut std::fs::File,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let Some(mut stdout) = child.stdout.take() else {
            return StreamEnd::ReadError(std::io::Error::other("child stdout not captured"));
        };
        let mut buf = [0u8; READ_CHUNK];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return StreamEnd::Shutdown;
                    }
                }
                read = tokio::time::timeout(READ_TIMEOUT, stdout.read(&mut buf)) => {
                    let now = self.engine.clock().now();
                    match read {
                        Ok(Ok(0)) => return StreamEnd::Eof,
                        Ok(Ok(n)) => {
                            if let Err(e) = log.write_all(&buf[..n]).and_then(|()| log.flush()) {
                                warn!(task_id = %task.id, error = %e, "output log write failed");
                            }
                            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                            let report = monitor.on_chunk(now, &chunk);
                            for sid in report.session_ids {
                                self.adopt_session_id(task, &sid);
                            }
                            if let Some(verdict) = report.verdict {
                                return StreamEnd::Verdict(verdict);
                            }
                        }
                        Ok(Err(e)) => return StreamEnd::ReadError(e),
                        Err(_elapsed) => {
                            if let Some(verdict) = monitor.on_tick(now) {
                                return StreamEnd::Verdict(verdict);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Turn a mid-stream verdict into the matching transition.
    async fn apply_verdict(
        &self,
        task: &mut Task,
        verdict: MonitorVerdict,
    ) -> Result<(), EngineError> {
        match verdict {
            MonitorVerdict::RateLimited(info) => {
                info!(task_id = %task.id, kind = %info.kind, "rate limit detected");
                self.coordinator.post_rate_limit(&task.id, info.clone());
                self.engine
                    .mark_waiting_unban(
                        task,
                        Some(&info),
                        &format!("Rate limit: {}", info.kind),
                    )
                    .await
            }
            MonitorVerdict::SessionExpired => {
                info!(task_id = %task.id, "session expired");
                self.count_retry_outcome(
                    self.engine
                        .mark_retrying(task, "session_expired", "Session expired")
                        .await?,
                );
                Ok(())
            }
            MonitorVerdict::Hung { silent_secs } => {
                warn!(task_id = %task.id, silent_secs, "task hung");
                self.status.lock().state = WorkerState::Hung;
                let outcome = self
                    .engine
                    .mark_retrying(
                        task,
                        "hung",
                        &format!("No output for {silent_secs}s"),
                    )
                    .await?;
                self.status.lock().state = WorkerState::Running;
                self.count_retry_outcome(outcome);
                Ok(())
            }
            MonitorVerdict::SessionLimit => {
                info!(task_id = %task.id, "absolute session limit reached");
                self.engine
                    .mark_waiting_unban(task, None, "5-hour session limit reached")
                    .await
            }
            MonitorVerdict::OutputOverflow { bytes } => {
                warn!(task_id = %task.id, bytes, "output size limit exceeded");
                self.engine
                    .mark_paused(task, "output_too_large", "Output size limit exceeded")
                    .await
            }
        }
    }

    /// Completion adjudication after a clean EOF.
    async fn adjudicate_exit(
        &self,
        task: &mut Task,
        exit: i32,
        monitor: &OutputMonitor,
    ) -> Result<(), EngineError> {
        if exit != 0 {
            debug!(task_id = %task.id, exit, "child exited non-zero");
            self.count_retry_outcome(
                self.engine
                    .mark_retrying(task, "exit", &format!("Process exited with code {exit}"))
                    .await?,
            );
            return Ok(());
        }

        if monitor.saw_marker() {
            self.engine.mark_completed(task).await?;
            self.record_idempotency(task, monitor.last_result());
            self.status.lock().tasks_completed += 1;
            return Ok(());
        }

        if let Some(result) = monitor.last_result() {
            let detection = self.detector.detect(result).await;
            if detection.needs_interaction {
                info!(task_id = %task.id, "final result needs interaction");
                task.checkpoint_data
                    .record_interaction(result, &detection.auto_response);
                self.count_retry_outcome(
                    self.engine
                        .mark_retrying(
                            task,
                            "interaction",
                            &format!("Interaction needed: {result}"),
                        )
                        .await?,
                );
                return Ok(());
            }
        }

        self.engine
            .mark_failed(
                task,
                "incomplete",
                "Process completed but no completion marker found",
            )
            .await?;
        self.status.lock().tasks_failed += 1;
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn adopt_session_id(&self, task: &mut Task, candidate: &str) {
        if task.checkpoint_data.adopt_session_id(candidate) {
            debug!(task_id = %task.id, session_id = candidate, "session id adopted");
        }
    }

    fn count_retry_outcome(&self, reached: TaskState) {
        if reached == TaskState::Failed {
            self.status.lock().tasks_failed += 1;
        }
    }

    /// Persist the sanitized rolling tail as the resume patch and stamp
    /// the checkpoint. Best-effort: failures must not mask the transition
    /// that follows.
    fn save_resume_patch(&self, task: &mut Task, monitor: &OutputMonitor, task_dir: &Path) {
        let patch = monitor.tail_text();
        let path = task_dir.join("resume_patch.txt");
        if let Err(e) = atomic_write(&path, patch.as_bytes()) {
            warn!(task_id = %task.id, error = %e, "failed to save resume patch");
            return;
        }
        task.checkpoint_data.record_patch(
            monitor.tail_line_count() as u64,
            patch.len() as u64,
            self.engine.clock().now(),
        );
        task.resume_hint_file = Some("resume_patch.txt".to_string());
        debug!(task_id = %task.id, bytes = patch.len(), "resume patch saved");
    }

    async fn terminate_child(&self, child: &mut Child) {
        self.status.lock().state = WorkerState::Terminating;
        if let Some(pid) = child.id() {
            self.system.signal_terminate(pid);
        }
        match tokio::time::timeout(GRACEFUL_EXIT_WINDOW, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "force kill failed");
                }
            }
        }
        self.status.lock().state = WorkerState::Running;
    }

    async fn fallback_capture(&self, task: &Task, cwd: &Path) -> Option<String> {
        info!(task_id = %task.id, "no output captured, attempting fallback capture");
        let cmd = shell_command(&task.command, Some(cwd), &task.environment);
        match run_with_timeout(cmd, FALLBACK_CAPTURE_TIMEOUT, "fallback capture").await {
            Ok(output) if output.status.success() && !output.stdout.is_empty() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "fallback capture failed");
                None
            }
        }
    }

    fn executed_idempotency_key(&self, task: &Task) -> Option<String> {
        task.idempotency_keys
            .iter()
            .find(|key| self.engine.store().check_idempotent(key).is_some())
            .cloned()
    }

    fn record_idempotency(&self, task: &Task, result: Option<&str>) {
        let now = self.engine.clock().now();
        for key in &task.idempotency_keys {
            match self.engine.store().mark_idempotent(
                key,
                &task.id,
                result.map(str::to_string),
                now,
            ) {
                Ok(()) => {}
                Err(shep_store::StoreError::IdempotencyConflict(_)) => {}
                Err(e) => warn!(task_id = %task.id, key, error = %e, "idempotency write failed"),
            }
        }
    }
}

/// Heartbeat loop: status row with pid, CPU%, RSS every
/// `heartbeat_interval`.
async fn heartbeat_loop(
    engine: Arc<TaskEngine>,
    status: Arc<Mutex<WorkerStatus>>,
    system: Arc<dyn SystemMonitor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = engine.config().heartbeat_period();
    let started = engine.clock().now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }

        let now = engine.clock().now();
        let row = {
            let mut row = status.lock();
            row.last_heartbeat = now;
            row.uptime_seconds = (now - started).num_seconds().max(0) as u64;
            let pid = row.pid.unwrap_or_else(std::process::id);
            if let Some(stats) = system.process_stats(pid) {
                row.cpu_percent = Some(stats.cpu_percent);
                row.rss_bytes = Some(stats.rss_bytes);
            }
            row.clone()
        };

        if let Err(e) = engine.store().save_worker_status(&row) {
            warn!(worker_id = %row.worker_id, error = %e, "heartbeat write failed");
        }
    }
}

// ── Output log bracketing ────────────────────────────────────────────────

fn write_log_header(
    log: &mut std::fs::File,
    task: &Task,
    command: &str,
    cwd: &std::path::Path,
    started: DateTime<Utc>,
) -> std::io::Result<()> {
    writeln!(log, "=== TASK EXECUTION LOG ===")?;
    writeln!(log, "Task ID: {}", task.id)?;
    writeln!(log, "Task Name: {}", task.name)?;
    writeln!(log, "Command: {command}")?;
    writeln!(log, "Started: {}", started.to_rfc3339())?;
    writeln!(log, "Working Directory: {}", cwd.display())?;
    writeln!(log)?;
    writeln!(log, "=== COMMAND OUTPUT ===")?;
    log.flush()
}

fn write_log_footer(
    log: &mut std::fs::File,
    monitor: &OutputMonitor,
    exit: Option<i32>,
    started: DateTime<Utc>,
    finished: DateTime<Utc>,
) -> std::io::Result<()> {
    writeln!(log)?;
    writeln!(log)?;
    writeln!(log, "=== TASK EXECUTION COMPLETED ===")?;
    match exit {
        Some(code) => writeln!(log, "Exit Code: {code}")?,
        None => writeln!(log, "Exit Code: terminated")?,
    }
    writeln!(
        log,
        "Duration: {}s",
        (finished - started).num_seconds().max(0)
    )?;
    writeln!(log, "Total Output Bytes: {}", monitor.total_bytes())?;
    writeln!(log, "Completed: {}", finished.to_rfc3339())?;
    log.flush()
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
