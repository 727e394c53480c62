// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Availability probing: a minimal no-op invocation of the assistant to
//! check whether rate limits have lifted, without burning real work.

use crate::subprocess::{run_with_timeout, PROBE_TIMEOUT};
use async_trait::async_trait;
use chrono::Utc;
use shep_core::signal::rate_limit_info;
use shep_core::RateLimitInfo;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The service answered; waiting tasks may be released.
    Available,
    /// The service is still limited; carries the parsed window.
    StillLimited(RateLimitInfo),
    /// The probe failed for an unrelated reason (timeout, spawn error).
    Inconclusive,
}

#[async_trait]
pub trait AvailabilityProber: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// Prober that shells out to the assistant CLI.
pub struct CliProber {
    assistant_bin: String,
    default_unban_wait: u64,
}

impl CliProber {
    pub fn new(assistant_bin: impl Into<String>, default_unban_wait: u64) -> Self {
        Self {
            assistant_bin: assistant_bin.into(),
            default_unban_wait,
        }
    }
}

impl Default for CliProber {
    fn default() -> Self {
        Self::new("claude", 3600)
    }
}

#[async_trait]
impl AvailabilityProber for CliProber {
    async fn probe(&self) -> ProbeOutcome {
        let mut cmd = Command::new(&self.assistant_bin);
        cmd.arg("-p").arg("reply with the single word: ok");

        let output = match run_with_timeout(cmd, PROBE_TIMEOUT, "availability probe").await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "availability probe inconclusive");
                return ProbeOutcome::Inconclusive;
            }
        };

        if output.status.success() {
            info!("availability probe succeeded");
            return ProbeOutcome::Available;
        }

        let text = String::from_utf8_lossy(&output.stdout);
        match rate_limit_info(&text, Utc::now(), self.default_unban_wait) {
            Some(info) => {
                debug!(kind = %info.kind, retry_after = info.retry_after_seconds, "probe saw rate limit");
                ProbeOutcome::StillLimited(info)
            }
            None => {
                warn!(code = ?output.status.code(), "probe failed without a recognizable limit");
                ProbeOutcome::Inconclusive
            }
        }
    }
}

/// Scripted prober for tests: plays back a fixed sequence of outcomes,
/// then keeps returning the last one.
#[cfg(any(test, feature = "test-support"))]
pub struct ScriptedProber {
    outcomes: parking_lot::Mutex<std::collections::VecDeque<ProbeOutcome>>,
    last: parking_lot::Mutex<ProbeOutcome>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-support"))]
impl ScriptedProber {
    pub fn new(outcomes: impl IntoIterator<Item = ProbeOutcome>) -> Self {
        Self {
            outcomes: parking_lot::Mutex::new(outcomes.into_iter().collect()),
            last: parking_lot::Mutex::new(ProbeOutcome::Available),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn always_available() -> Self {
        Self::new([ProbeOutcome::Available])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl AvailabilityProber for ScriptedProber {
    async fn probe(&self) -> ProbeOutcome {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let next = self.outcomes.lock().pop_front();
        match next {
            Some(outcome) => {
                *self.last.lock() = outcome.clone();
                outcome
            }
            None => self.last.lock().clone(),
        }
    }
}

#[cfg(test)]
#[path = "probe_tests.rs"]
mod tests;
