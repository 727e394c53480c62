//! Shared harness for the behavioral specs.

use shep_adapters::{ScriptedDetector, ScriptedProber, SysMonitor};
use shep_core::{Config, SystemClock, Task, TaskConfig, TaskPriority, TaskState};
use shep_engine::{
    AlertSink, CoordinatorHandle, RateLimitCoordinator, TaskEngine, Worker,
};
use shep_queue::DirQueue;
use shep_store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Spec {
    pub dir: tempfile::TempDir,
    pub engine: Arc<TaskEngine>,
    pub coordinator_handle: CoordinatorHandle,
    coordinator: Option<RateLimitCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    joined: Vec<JoinHandle<()>>,
}

impl Spec {
    /// Build the system in a tempdir with spec-friendly timeouts.
    pub fn new(mutate: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default().with_base_dir(dir.path());
        config.claude_cli_timeout = 30;
        mutate(&mut config);
        config.ensure_layout().unwrap();

        let store =
            Store::open(&config.ledger_path(), &config.ledger_snapshot_path()).unwrap();
        let queue = DirQueue::open(&config.queue_dir()).unwrap();
        let alerts = AlertSink::new(store.clone(), config.alerts_path());
        let engine = Arc::new(TaskEngine::new(
            store,
            queue,
            config,
            Arc::new(SystemClock),
            alerts,
        ));

        let (coordinator, coordinator_handle) = RateLimitCoordinator::new(
            Arc::clone(&engine),
            Arc::new(ScriptedProber::always_available()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            dir,
            engine,
            coordinator_handle,
            coordinator: Some(coordinator),
            shutdown_tx,
            shutdown_rx,
            joined: Vec::new(),
        }
    }

    /// Replace the default prober before starting the coordinator.
    pub fn with_prober(&mut self, prober: ScriptedProber) {
        let (coordinator, handle) =
            RateLimitCoordinator::new(Arc::clone(&self.engine), Arc::new(prober));
        self.coordinator = Some(coordinator);
        self.coordinator_handle = handle;
    }

    /// Spawn a worker with the default assistant binary name.
    pub fn start_worker(&mut self, detector: ScriptedDetector) {
        self.start_worker_with_bin(detector, "claude");
    }

    /// Spawn a worker whose session resumes call `assistant_bin`.
    pub fn start_worker_with_bin(&mut self, detector: ScriptedDetector, assistant_bin: &str) {
        let worker = Worker::new(
            format!("worker_{:02}", self.joined.len()),
            Arc::clone(&self.engine),
            Arc::new(detector),
            Arc::new(SysMonitor::new()),
            self.coordinator_handle.clone(),
            assistant_bin,
        );
        let rx = self.shutdown_rx.clone();
        self.joined.push(tokio::spawn(async move {
            let _ = worker.run(rx).await;
        }));
    }

    /// Spawn the coordinator loop.
    pub fn start_coordinator(&mut self) {
        let coordinator = self.coordinator.take().expect("coordinator already started");
        let rx = self.shutdown_rx.clone();
        self.joined.push(tokio::spawn(async move {
            coordinator.run(rx).await;
        }));
    }

    pub async fn admit(&self, config: TaskConfig) -> Task {
        let task = Task::new(config, self.engine.clock());
        self.engine.admit(task).await.unwrap()
    }

    pub async fn admit_with_priority(
        &self,
        id: &str,
        command: &str,
        priority: TaskPriority,
    ) -> Task {
        self.admit(TaskConfig::new(id, id, command).priority(priority))
            .await
    }

    /// Poll the store until the task reaches `state`.
    pub async fn wait_for_state(&self, task_id: &str, state: TaskState, timeout: Duration) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.engine.store().get_task(task_id) {
                if task.task_state == state {
                    return task;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} did not reach {state} within {timeout:?}: currently {:?}",
                self.engine.store().get_task(task_id).map(|t| t.task_state)
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll until the predicate holds.
    pub async fn wait_until(&self, what: &str, timeout: Duration, mut pred: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + timeout;
        while !pred() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Write an executable stub script into the tempdir.
    pub fn write_stub(&self, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn output_log(&self, task_id: &str) -> String {
        std::fs::read_to_string(self.engine.config().task_dir(task_id).join("output.log"))
            .unwrap_or_default()
    }

    /// Broadcast shutdown and join everything.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.joined {
            let _ = tokio::time::timeout(Duration::from_secs(15), handle).await;
        }
    }
}

/// A stub command that emits a result event carrying the completion marker.
pub fn marker_command() -> String {
    r#"printf '%s\n' '{"type":"result","result":"done ✅ TASK_COMPLETED"}'"#.to_string()
}
