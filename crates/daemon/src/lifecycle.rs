// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup and shutdown.
//!
//! Startup order matters: directory layout, store (fatal on corruption),
//! engine, boot-time orphan reconciliation, then the long-running
//! components. Shutdown broadcasts over a watch channel; workers snapshot
//! and requeue their in-flight task before returning.

use fs2::FileExt as _;
use shep_adapters::{
    CliInteractionDetector, CliProber, PingProbe, SysMonitor, SystemMonitor,
};
use shep_core::{Config, ConfigError};
use shep_engine::{
    AlertSink, CoordinatorHandle, RateLimitCoordinator, RecoveryLoop, TaskEngine, Worker,
};
use shep_queue::{DirQueue, QueueError};
use shep_store::{Store, StoreError};
use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Cadence of periodic store checkpoints.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of retention cleanup sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// How long shutdown waits for components before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("engine error: {0}")]
    Engine(#[from] shep_engine::EngineError),
    #[error("another shepd already holds {0}")]
    LockFailed(PathBuf),
}

/// The assembled system, ready to run.
pub struct Daemon {
    pub config: Config,
    pub store: Store,
    pub engine: Arc<TaskEngine>,
    pub coordinator_handle: CoordinatorHandle,
    coordinator: RateLimitCoordinator,
    recovery: RecoveryLoop,
    workers: Vec<Worker>,
    // Held for the process lifetime; dropping releases the flock
    _lock_file: File,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    pub fn lock_path(config: &Config) -> PathBuf {
        config.base_dir.join("shepd.lock")
    }

    pub fn log_path(config: &Config) -> PathBuf {
        config.logs_dir().join("shepd.log")
    }

    /// Build every component and reconcile state left by a previous run.
    pub async fn startup(config: Config, assistant_bin: &str) -> Result<Self, LifecycleError> {
        config.ensure_layout()?;

        let lock_file = acquire_lock(&Self::lock_path(&config))?;

        let store = Store::open(&config.ledger_path(), &config.ledger_snapshot_path())?;
        let alerts = AlertSink::new(store.clone(), config.alerts_path());
        let queue = DirQueue::open(&config.queue_dir())?;
        let engine = Arc::new(TaskEngine::new(
            store.clone(),
            queue,
            config.clone(),
            Arc::new(shep_core::SystemClock),
            alerts,
        ));

        let system: Arc<dyn SystemMonitor> = Arc::new(SysMonitor::new());
        let (coordinator, coordinator_handle) = RateLimitCoordinator::new(
            Arc::clone(&engine),
            Arc::new(CliProber::new(assistant_bin, config.default_unban_wait)),
        );
        let recovery = RecoveryLoop::new(
            Arc::clone(&engine),
            Arc::clone(&system),
            Arc::new(PingProbe),
        );

        // Repair whatever a crash left in processing/ before anyone claims
        let recovered = recovery.reconcile_orphans().await?;
        if recovered > 0 {
            info!(recovered, "recovered orphaned tasks at startup");
        }

        let detector = Arc::new(CliInteractionDetector::new(assistant_bin));
        let workers = (0..config.num_workers)
            .map(|n| {
                Worker::new(
                    format!("worker_{n:02}"),
                    Arc::clone(&engine),
                    detector.clone(),
                    Arc::clone(&system),
                    coordinator_handle.clone(),
                    assistant_bin,
                )
            })
            .collect();

        Ok(Self {
            config,
            store,
            engine,
            coordinator_handle,
            coordinator,
            recovery,
            workers,
            _lock_file: lock_file,
        })
    }

    /// Run all components until `shutdown` flips. Returns an error when a
    /// worker died of store corruption.
    pub async fn run(
        self,
        shutdown_tx: Arc<watch::Sender<bool>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), LifecycleError> {
        let Daemon {
            store,
            engine,
            coordinator,
            recovery,
            workers,
            // held until run returns so the flock survives the process
            _lock_file,
            ..
        } = self;

        let mut join_set: JoinSet<Result<(), shep_engine::EngineError>> = JoinSet::new();

        for worker in workers {
            let rx = shutdown.clone();
            join_set.spawn(async move { worker.run(rx).await });
        }

        let coordinator_rx = shutdown.clone();
        join_set.spawn(async move {
            coordinator.run(coordinator_rx).await;
            Ok(())
        });

        let recovery_rx = shutdown.clone();
        join_set.spawn(async move {
            recovery.run(recovery_rx).await;
            Ok(())
        });

        spawn_checkpoint_loop(store.clone(), Arc::clone(&engine), shutdown.clone());
        spawn_cleanup_loop(Arc::clone(&engine), shutdown.clone());

        let mut fatal: Option<LifecycleError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "component failed");
                    fatal = Some(e.into());
                    break;
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(error = %e, "component panicked");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        // Broadcast shutdown (idempotent) and drain the rest
        let _ = shutdown_tx.send(true);
        let drain = async {
            while let Some(joined) = join_set.join_next().await {
                if let Ok(Err(e)) = joined {
                    warn!(error = %e, "component error during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("shutdown grace elapsed, aborting remaining components");
            join_set.abort_all();
        }

        // Final durability point
        if let Err(e) = store.checkpoint(chrono::Utc::now()) {
            warn!(error = %e, "final checkpoint failed");
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn acquire_lock(path: &std::path::Path) -> Result<File, LifecycleError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(LifecycleError::LockFailed(path.to_owned()));
    }
    // Record our pid for operator diagnostics
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(file)
}

/// Periodic store snapshot + ledger truncation.
fn spawn_checkpoint_loop(store: Store, engine: Arc<TaskEngine>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CHECKPOINT_INTERVAL) => {
                    if let Err(e) = store.checkpoint(engine.clock().now()) {
                        warn!(error = %e, "store checkpoint failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

/// Hourly retention sweep: purge expired store records and their task
/// directories.
fn spawn_cleanup_loop(engine: Arc<TaskEngine>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                    let config = engine.config();
                    let now = engine.clock().now();
                    match engine.store().cleanup(config.retention_days, now) {
                        Ok(report) => {
                            for task_id in &report.purged_tasks {
                                let dir = config.task_dir(task_id);
                                if dir.exists() {
                                    if let Err(e) = std::fs::remove_dir_all(&dir) {
                                        warn!(task_id, error = %e, "failed to remove task directory");
                                    }
                                }
                            }
                            if !report.purged_tasks.is_empty() {
                                info!(purged = report.purged_tasks.len(), "retention cleanup");
                            }
                        }
                        Err(e) => warn!(error = %e, "retention cleanup failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
