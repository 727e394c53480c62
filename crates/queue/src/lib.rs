// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! File-backed priority queue with rename-as-lock claims.
//!
//! Each task has exactly one file named `<task_id>.json` in either
//! `pending/` or `processing/`. A rename on a single filesystem is the
//! synchronization primitive: whichever worker wins the rename owns the
//! task, no lock service needed, and the layout survives crashes (a stale
//! `processing/` entry is an orphan the recovery loop re-enqueues).

use chrono::{DateTime, Utc};
use shep_core::Task;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad queue entry {path}: {source}")]
    BadEntry {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The coordination surface between the engine and the workers.
#[derive(Debug, Clone)]
pub struct DirQueue {
    pending: PathBuf,
    processing: PathBuf,
}

impl DirQueue {
    /// Open (and create) the two queue directories under `queue_dir`.
    pub fn open(queue_dir: &Path) -> Result<Self, QueueError> {
        let pending = queue_dir.join("pending");
        let processing = queue_dir.join("processing");
        fs::create_dir_all(&pending)?;
        fs::create_dir_all(&processing)?;
        Ok(Self {
            pending,
            processing,
        })
    }

    fn pending_path(&self, task_id: &str) -> PathBuf {
        self.pending.join(format!("{task_id}.json"))
    }

    fn processing_path(&self, task_id: &str) -> PathBuf {
        self.processing.join(format!("{task_id}.json"))
    }

    /// Write the entry atomically (tmp + rename) into `pending/`.
    pub fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        write_entry(&self.pending_path(&task.id), task)?;
        trace!(task_id = %task.id, "enqueued");
        Ok(())
    }

    /// Claim the oldest highest-priority ready entry.
    ///
    /// Losing a rename race is not an error: the next candidate is tried.
    /// A claimed entry whose `next_allowed_at` is still in the future is
    /// renamed back and skipped.
    pub fn claim(&self, now: DateTime<Utc>) -> Result<Option<Task>, QueueError> {
        let mut candidates: Vec<Task> = Vec::new();
        for dirent in fs::read_dir(&self.pending)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Ok(task) => candidates.push(task),
                Err(e) => {
                    // A half-written entry from a concurrent enqueue; skip it
                    trace!(path = %path.display(), error = %e, "skipping unreadable entry");
                }
            }
        }

        candidates.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        for candidate in candidates {
            let from = self.pending_path(&candidate.id);
            let to = self.processing_path(&candidate.id);
            if fs::rename(&from, &to).is_err() {
                // Another worker won the race
                continue;
            }

            // Re-read after winning: the rename, not the listing, is
            // authoritative
            let task = match read_entry(&to) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %candidate.id, error = %e, "claimed entry unreadable, releasing");
                    let _ = fs::rename(&to, &from);
                    continue;
                }
            };

            if !task.is_ready(now) {
                let _ = fs::rename(&to, &from);
                continue;
            }

            debug!(task_id = %task.id, priority = %task.priority, "claimed");
            return Ok(Some(task));
        }

        Ok(None)
    }

    /// Move an entry back from `processing/` to `pending/`, refreshing its
    /// contents from `task` first so backoff fields are honored by the
    /// next claim. The content rewrite happens while the file is still in
    /// `processing/`; a crash in between leaves an orphan, not a loss.
    pub fn release(&self, task: &Task) -> Result<(), QueueError> {
        let held = self.processing_path(&task.id);
        write_entry(&held, task)?;
        fs::rename(&held, self.pending_path(&task.id))?;
        trace!(task_id = %task.id, "released to pending");
        Ok(())
    }

    /// Delete the `processing/` entry of a finished task. Idempotent.
    pub fn finalize(&self, task_id: &str) -> Result<(), QueueError> {
        match fs::remove_file(self.processing_path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Entries currently in `processing/`, for the orphan scan.
    pub fn scan_processing(&self) -> Result<Vec<Task>, QueueError> {
        let mut tasks = Vec::new();
        for dirent in fs::read_dir(&self.processing)? {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_entry(&path) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable processing entry"),
            }
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    /// Whether the task has an entry in `pending/`.
    pub fn is_pending(&self, task_id: &str) -> bool {
        self.pending_path(task_id).exists()
    }

    /// Whether the task has an entry in `processing/`.
    pub fn is_processing(&self, task_id: &str) -> bool {
        self.processing_path(task_id).exists()
    }

    pub fn pending_len(&self) -> Result<usize, QueueError> {
        Ok(fs::read_dir(&self.pending)?
            .filter_map(|d| d.ok())
            .filter(|d| d.path().extension().and_then(|e| e.to_str()) == Some("json"))
            .count())
    }
}

fn write_entry(path: &Path, task: &Task) -> Result<(), QueueError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(task)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_entry(path: &Path) -> Result<Task, QueueError> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| QueueError::BadEntry {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
