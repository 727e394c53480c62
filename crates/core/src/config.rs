// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor configuration.
//!
//! Every field has an independent default so a partial TOML file only
//! overrides what it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for tasks/, queue/, snapshots/, logs/, db/
    pub base_dir: PathBuf,

    // Assistant CLI
    /// Seconds of output silence before a run is considered hung
    pub claude_cli_timeout: u64,
    /// Absolute per-run ceiling in seconds (the provider's 5-hour session)
    pub claude_session_limit: u64,
    /// Output byte cap per run
    pub max_output_size: u64,

    // Retry and backoff
    pub max_retries: u32,
    pub base_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,

    // Rate limiting
    pub default_unban_wait: u64,
    pub rate_limit_backoff_multiplier: f64,

    // Resources
    pub min_disk_space_gb: u64,
    pub max_log_size_mb: u64,
    pub max_log_files: u32,
    /// Days before completed/failed task records are purged
    pub retention_days: u32,

    // Monitoring
    pub heartbeat_interval: u64,
    pub health_check_interval: u64,
    /// Heartbeat age in seconds beyond which a worker no longer counts
    /// as active
    pub worker_stale_secs: u64,

    pub num_workers: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            claude_cli_timeout: 6000,
            claude_session_limit: 18000,
            max_output_size: 50 * 1024 * 1024,
            max_retries: 5,
            base_delay: 1.0,
            max_delay: 300.0,
            exponential_base: 2.0,
            default_unban_wait: 3600,
            rate_limit_backoff_multiplier: 1.5,
            min_disk_space_gb: 5,
            max_log_size_mb: 50,
            max_log_files: 7,
            retention_days: 7,
            heartbeat_interval: 30,
            health_check_interval: 60,
            worker_stale_secs: 120,
            num_workers: 2,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing path yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn with_base_dir(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_dir = base.into();
        self
    }

    // ── Directory layout ─────────────────────────────────────────────────

    pub fn tasks_dir(&self) -> PathBuf {
        self.base_dir.join("tasks")
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(task_id)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.base_dir.join("queue")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.queue_dir().join("pending")
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.queue_dir().join("processing")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn alerts_path(&self) -> PathBuf {
        self.logs_dir().join("alerts.jsonl")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.db_dir().join("ledger.jsonl")
    }

    pub fn ledger_snapshot_path(&self) -> PathBuf {
        self.db_dir().join("ledger.snapshot.json")
    }

    /// Create the standard directory layout under `base_dir`.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.tasks_dir(),
            self.pending_dir(),
            self.processing_dir(),
            self.snapshots_dir(),
            self.logs_dir(),
            self.db_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    // ── Durations ────────────────────────────────────────────────────────

    pub fn no_output_timeout(&self) -> Duration {
        Duration::from_secs(self.claude_cli_timeout)
    }

    pub fn session_limit(&self) -> Duration {
        Duration::from_secs(self.claude_session_limit)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn health_check_period(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
