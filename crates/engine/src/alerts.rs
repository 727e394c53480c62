// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert emission: every alert is written to the store and appended as
//! one JSON line to `logs/alerts.jsonl`.

use chrono::{DateTime, Utc};
use shep_core::{Alert, AlertLevel};
use shep_store::Store;
use std::io::Write as _;
use std::path::PathBuf;
use tracing::warn;

/// Sink that double-writes alerts (store row + JSONL stream).
///
/// Emission is best-effort by design: a failing alert write must never
/// take down the transition that raised it.
#[derive(Clone)]
pub struct AlertSink {
    store: Store,
    jsonl_path: PathBuf,
}

impl AlertSink {
    pub fn new(store: Store, jsonl_path: PathBuf) -> Self {
        Self { store, jsonl_path }
    }

    fn next_id() -> String {
        shep_core::short_id("alert")
    }

    /// Build and emit an alert, returning it for further decoration by
    /// callers that keep metadata.
    pub fn emit(
        &self,
        level: AlertLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Alert {
        let alert = Alert::new(Self::next_id(), level, title, message, now);
        self.write(&alert);
        alert
    }

    /// Emit a pre-built alert (for callers attaching task/worker ids or
    /// metadata).
    pub fn emit_alert(&self, alert: Alert) -> Alert {
        self.write(&alert);
        alert
    }

    /// An alert skeleton stamped with a fresh id, for decoration before
    /// `emit_alert`.
    pub fn build(
        &self,
        level: AlertLevel,
        title: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Alert {
        Alert::new(Self::next_id(), level, title, message, now)
    }

    fn write(&self, alert: &Alert) {
        warn!(
            level = %alert.level,
            title = %alert.title,
            message = %alert.message,
            "alert"
        );

        if let Err(e) = self.store.save_alert(alert) {
            warn!(error = %e, "failed to persist alert to store");
        }

        if let Err(e) = self.append_jsonl(alert) {
            warn!(error = %e, "failed to append alert to alerts.jsonl");
        }
    }

    fn append_jsonl(&self, alert: &Alert) -> std::io::Result<()> {
        if let Some(parent) = self.jsonl_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.jsonl_path)?;
        let line = serde_json::to_string(alert)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{line}")
    }
}

#[cfg(test)]
#[path = "alerts_tests.rs"]
mod tests;
