// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker identifier and heartbeat record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for a worker instance.
    pub struct WorkerId;
}

/// Process-level state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Running,
    Hung,
    Terminating,
    Killed,
    Restarting,
}

/// Durable heartbeat row, keyed by `worker_id`.
///
/// A worker is considered active while `last_heartbeat` is within the
/// configured staleness window (default 120 s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
}

impl WorkerStatus {
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            pid: None,
            state: WorkerState::Spawning,
            current_task_id: None,
            last_heartbeat: now,
            cpu_percent: None,
            rss_bytes: None,
            uptime_seconds: 0,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    /// Heartbeat age at `now`, saturating at zero for clock skew.
    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.last_heartbeat).num_seconds().max(0) as u64
    }
}
