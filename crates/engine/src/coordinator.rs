// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limit coordination: one global ban window, active probing, and
//! staggered release of waiting tasks.
//!
//! The coordinator is the single owner of the ban state. Workers post
//! observations over a channel; everyone else reads through the narrow
//! [`CoordinatorHandle`] accessor.

use crate::alerts::AlertSink;
use crate::error::EngineError;
use crate::transitions::TaskEngine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use shep_adapters::{AvailabilityProber, ProbeOutcome};
use shep_core::{AlertLevel, RateLimitInfo, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Base gap between probes.
const PROBE_BASE_WAIT: Duration = Duration::from_secs(300);

/// Probe gap when release is imminent (within ten minutes).
const PROBE_NEAR_WAIT: Duration = Duration::from_secs(60);

/// A ban whose window expired this long ago is cleared without a probe.
const STALE_BAN_GRACE: ChronoDuration = ChronoDuration::minutes(5);

/// Per-task history entries older than this are dropped.
const HISTORY_RETENTION: ChronoDuration = ChronoDuration::hours(24);

/// Extra wait applied when releasing a task fails.
const RELEASE_FAILURE_BACKOFF: ChronoDuration = ChronoDuration::minutes(30);

/// Messages workers post to the coordinator.
#[derive(Debug)]
pub enum CoordinatorMsg {
    RateLimitObserved {
        task_id: String,
        info: RateLimitInfo,
    },
}

#[derive(Default)]
struct BanState {
    global_unban_time: Option<DateTime<Utc>>,
    last_probe_time: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    rate_limit_history: HashMap<String, RateLimitInfo>,
}

/// Cheap clonable view + inbox for the coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorMsg>,
    shared: Arc<Mutex<BanState>>,
}

impl CoordinatorHandle {
    /// Post a rate-limit observation from a worker. Non-blocking; a full
    /// inbox drops the message (the next probe converges anyway).
    pub fn post_rate_limit(&self, task_id: &str, info: RateLimitInfo) {
        let msg = CoordinatorMsg::RateLimitObserved {
            task_id: task_id.to_string(),
            info,
        };
        if self.tx.try_send(msg).is_err() {
            warn!(task_id, "coordinator inbox full, dropping observation");
        }
    }

    /// Whether the global ban window has passed at `now`.
    pub fn globally_ready(&self, now: DateTime<Utc>) -> bool {
        match self.shared.lock().global_unban_time {
            Some(at) => now >= at,
            None => true,
        }
    }

    pub fn global_unban_time(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().global_unban_time
    }
}

/// Owner of the global ban window.
pub struct RateLimitCoordinator {
    engine: Arc<TaskEngine>,
    prober: Arc<dyn AvailabilityProber>,
    alerts: AlertSink,
    rx: mpsc::Receiver<CoordinatorMsg>,
    shared: Arc<Mutex<BanState>>,
}

impl RateLimitCoordinator {
    pub fn new(
        engine: Arc<TaskEngine>,
        prober: Arc<dyn AvailabilityProber>,
    ) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::new(Mutex::new(BanState::default()));
        let alerts = engine.alerts().clone();
        let handle = CoordinatorHandle {
            tx,
            shared: Arc::clone(&shared),
        };
        (
            Self {
                engine,
                prober,
                alerts,
                rx,
                shared,
            },
            handle,
        )
    }

    /// Drive the coordinator until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("rate-limit coordinator started");
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },
                _ = tick.tick() => {
                    if let Err(e) = self.step().await {
                        warn!(error = %e, "coordinator step failed");
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("rate-limit coordinator stopped");
    }

    fn handle_msg(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::RateLimitObserved { task_id, info } => {
                self.record_rate_limit(&task_id, info);
            }
        }
    }

    /// Record an observation and, if it extends the window, raise the
    /// global ban and a P2 alert.
    pub fn record_rate_limit(&mut self, task_id: &str, info: RateLimitInfo) {
        let unban = info.unban_time();
        let mut state = self.shared.lock();
        state
            .rate_limit_history
            .insert(task_id.to_string(), info.clone());

        let extends = match state.global_unban_time {
            Some(current) => unban > current,
            None => true,
        };
        if !extends {
            return;
        }
        state.global_unban_time = Some(unban);
        drop(state);

        warn!(kind = %info.kind, %unban, "global rate limit raised");
        self.alerts.emit_alert(
            self.alerts
                .build(
                    AlertLevel::P2,
                    "Assistant service rate limited",
                    format!(
                        "Rate limit detected: {}. Expected recovery: {}",
                        info.kind,
                        unban.format("%H:%M:%S")
                    ),
                    self.engine.clock().now(),
                )
                .task(task_id)
                .meta("limit_type", serde_json::json!(info.kind.to_string()))
                .meta(
                    "retry_after_seconds",
                    serde_json::json!(info.retry_after_seconds),
                )
                .meta("confidence", serde_json::json!(info.confidence)),
        );
    }

    /// One coordination pass: probe when due, release eligible waiting
    /// tasks, expire a stale ban, and prune old history.
    pub async fn step(&mut self) -> Result<(), EngineError> {
        let now = self.engine.clock().now();

        let waiting = self
            .engine
            .store()
            .get_tasks_by_state(&[TaskState::WaitingUnban]);

        if self.should_probe(now, !waiting.is_empty()) {
            self.probe(now, waiting.len()).await;
        }

        self.release_pass(now).await?;
        self.expire_stale_ban(now);
        self.prune_history(now);
        Ok(())
    }

    fn should_probe(&self, now: DateTime<Utc>, have_waiting: bool) -> bool {
        let state = self.shared.lock();
        if !have_waiting && state.global_unban_time.is_none() {
            return false;
        }

        let gap = match state.last_probe_time {
            Some(last) => (now - last).to_std().unwrap_or(Duration::ZERO),
            None => return true,
        };
        gap >= probe_wait(
            now,
            state.global_unban_time,
            state.consecutive_failures,
        )
    }

    async fn probe(&mut self, now: DateTime<Utc>, waiting_count: usize) {
        self.shared.lock().last_probe_time = Some(now);
        debug!("probing assistant availability");

        match self.prober.probe().await {
            ProbeOutcome::Available => {
                let had_ban = {
                    let mut state = self.shared.lock();
                    state.consecutive_failures = 0;
                    state.global_unban_time.take().is_some()
                };
                if had_ban || waiting_count > 0 {
                    info!(waiting_count, "assistant available again");
                    self.alerts.emit_alert(
                        self.alerts
                            .build(
                                AlertLevel::P3,
                                "Assistant service recovered",
                                format!(
                                    "Service is available again. {waiting_count} tasks ready for recovery"
                                ),
                                now,
                            )
                            .meta("waiting_task_count", serde_json::json!(waiting_count)),
                    );
                }
            }
            ProbeOutcome::StillLimited(info) => {
                self.record_rate_limit("probe", info);
            }
            ProbeOutcome::Inconclusive => {
                let mut state = self.shared.lock();
                state.consecutive_failures += 1;
                debug!(
                    consecutive_failures = state.consecutive_failures,
                    "probe inconclusive"
                );
            }
        }
    }

    /// Promote WAITING_UNBAN tasks whose own window elapsed, provided the
    /// coordinator is globally ready. A task is never released before its
    /// own `next_allowed_at`, regardless of global readiness.
    async fn release_pass(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let globally_ready = match self.shared.lock().global_unban_time {
            Some(at) => now >= at,
            None => true,
        };
        if !globally_ready {
            return Ok(());
        }

        let waiting = self
            .engine
            .store()
            .get_tasks_by_state(&[TaskState::WaitingUnban]);
        for mut task in waiting {
            if !task.is_ready(now) {
                continue;
            }
            match self.engine.release_waiting(&mut task).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "release failed, extending wait");
                    task.next_allowed_at = Some(now + RELEASE_FAILURE_BACKOFF);
                    if let Err(save_err) = self.engine.store().save_task(&task) {
                        warn!(task_id = %task.id, error = %save_err, "failed to extend wait");
                    }
                }
            }
        }
        Ok(())
    }

    /// A ban that expired more than [`STALE_BAN_GRACE`] ago clears itself
    /// even without a successful probe.
    fn expire_stale_ban(&mut self, now: DateTime<Utc>) {
        let mut state = self.shared.lock();
        if let Some(at) = state.global_unban_time {
            if now > at + STALE_BAN_GRACE {
                info!("stale global rate limit expired, clearing");
                state.global_unban_time = None;
            }
        }
    }

    fn prune_history(&mut self, now: DateTime<Utc>) {
        let cutoff = now - HISTORY_RETENTION;
        self.shared
            .lock()
            .rate_limit_history
            .retain(|_, info| info.detected_at > cutoff);
    }

    /// Estimated recovery time for a task, falling back to the global ban.
    pub fn estimated_recovery(&self, task_id: &str) -> Option<DateTime<Utc>> {
        let state = self.shared.lock();
        state
            .rate_limit_history
            .get(task_id)
            .map(RateLimitInfo::unban_time)
            .or(state.global_unban_time)
    }
}

/// How long to wait between probes: shorter as the expected release
/// approaches, longer after repeated inconclusive probes.
fn probe_wait(
    now: DateTime<Utc>,
    global_unban_time: Option<DateTime<Utc>>,
    consecutive_failures: u32,
) -> Duration {
    if let Some(unban) = global_unban_time {
        let remaining = (unban - now).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            if remaining < Duration::from_secs(600) {
                return PROBE_NEAR_WAIT.min(remaining / 5).max(Duration::from_secs(1));
            }
            if remaining < Duration::from_secs(1800) {
                return PROBE_BASE_WAIT.min(remaining / 6);
            }
        }
    }

    if consecutive_failures > 3 {
        PROBE_BASE_WAIT * 2
    } else {
        PROBE_BASE_WAIT
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
