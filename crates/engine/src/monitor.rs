// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pure output-monitoring state machine.
//!
//! The worker's read loop feeds chunks and clock ticks into
//! [`OutputMonitor`]; every decision (hang, rate limit, session expiry,
//! overflow) comes back as a [`MonitorVerdict`]. Nothing here touches a
//! process or the filesystem, so tests drive it with a fake clock and
//! string chunks.
//!
//! Signal precedence within one chunk: rate-limit beats session-expiry
//! beats result events. A rate limit is global (it gates every task), so
//! it must not be burned as a task-local retry.

use chrono::{DateTime, Utc};
use shep_core::sanitize::sanitize_output;
use shep_core::signal::{classify_output, rate_limit_info};
use shep_core::{events, Config, RateLimitInfo};
use std::collections::VecDeque;
use std::time::Duration;

/// Lines kept for the resume patch.
const TAIL_LINES: usize = 500;

/// Ceiling for prompt-only invocations, floor for the warm-up window.
const PROMPT_ONLY_TIMEOUT: Duration = Duration::from_secs(900);

/// Warm-up window during which the floor applies.
const WARMUP_WINDOW: Duration = Duration::from_secs(120);

/// A decision reached while monitoring the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorVerdict {
    /// Rate-limit phrase seen in the output.
    RateLimited(RateLimitInfo),
    /// Session-expiry/authentication phrase seen in the output.
    SessionExpired,
    /// No output for longer than the effective no-output timeout.
    Hung { silent_secs: u64 },
    /// The absolute per-run ceiling elapsed.
    SessionLimit,
    /// The output byte cap was exceeded.
    OutputOverflow { bytes: u64 },
}

/// What one chunk produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChunkReport {
    pub verdict: Option<MonitorVerdict>,
    /// Session-id candidates, freshest last.
    pub session_ids: Vec<String>,
}

/// Rolling state over (tail buffer, last-output time, deadlines, byte
/// count).
pub struct OutputMonitor {
    prompt_only: bool,
    no_output_timeout: Duration,
    session_limit: Duration,
    max_output_bytes: u64,
    default_unban_wait: u64,
    started_at: DateTime<Utc>,
    last_output_at: DateTime<Utc>,
    total_bytes: u64,
    tail: VecDeque<String>,
    partial_line: String,
    last_result: Option<String>,
    saw_marker: bool,
}

/// Heuristic for one-shot prompt invocations, which should finish fast
/// and therefore fail fast on silence.
pub fn is_prompt_only(command: &str) -> bool {
    let trimmed = command.trim_start();
    trimmed.starts_with("claude -p")
        && !["--watch", "--server", "-f ", "--file", "--stdin"]
            .iter()
            .any(|flag| trimmed.contains(flag))
}

impl OutputMonitor {
    pub fn new(config: &Config, command: &str, now: DateTime<Utc>) -> Self {
        Self {
            prompt_only: is_prompt_only(command),
            no_output_timeout: config.no_output_timeout(),
            session_limit: config.session_limit(),
            max_output_bytes: config.max_output_size,
            default_unban_wait: config.default_unban_wait,
            started_at: now,
            last_output_at: now,
            total_bytes: 0,
            tail: VecDeque::new(),
            partial_line: String::new(),
            last_result: None,
            saw_marker: false,
        }
    }

    /// Feed one chunk of combined output.
    pub fn on_chunk(&mut self, now: DateTime<Utc>, chunk: &str) -> ChunkReport {
        self.last_output_at = now;
        self.total_bytes += chunk.len() as u64;

        self.absorb_lines(chunk);
        if events::contains_completion_marker(chunk) {
            self.saw_marker = true;
        }
        let session_ids = events::scan_session_ids(chunk);

        let signals = classify_output(chunk);
        let verdict = if signals.rate_limited {
            rate_limit_info(chunk, now, self.default_unban_wait).map(MonitorVerdict::RateLimited)
        } else if signals.session_expired {
            Some(MonitorVerdict::SessionExpired)
        } else if self.elapsed(now) > self.session_limit {
            // A chatty child never hits the tick path, so the absolute
            // ceiling is enforced here too
            Some(MonitorVerdict::SessionLimit)
        } else if self.total_bytes > self.max_output_bytes {
            Some(MonitorVerdict::OutputOverflow {
                bytes: self.total_bytes,
            })
        } else {
            None
        };

        ChunkReport {
            verdict,
            session_ids,
        }
    }

    /// Check deadlines on a read-timeout tick.
    pub fn on_tick(&self, now: DateTime<Utc>) -> Option<MonitorVerdict> {
        let silent = (now - self.last_output_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if silent > self.effective_timeout(now) {
            return Some(MonitorVerdict::Hung {
                silent_secs: silent.as_secs(),
            });
        }

        if self.elapsed(now) > self.session_limit {
            return Some(MonitorVerdict::SessionLimit);
        }

        None
    }

    /// The no-output timeout in force right now: prompt-only runs get a
    /// short ceiling, heavier runs get a floor while they warm up.
    fn effective_timeout(&self, now: DateTime<Utc>) -> Duration {
        if self.prompt_only {
            self.no_output_timeout.min(PROMPT_ONLY_TIMEOUT)
        } else if self.elapsed(now) < WARMUP_WINDOW {
            self.no_output_timeout.max(PROMPT_ONLY_TIMEOUT)
        } else {
            self.no_output_timeout
        }
    }

    fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    fn absorb_lines(&mut self, chunk: &str) {
        self.partial_line.push_str(chunk);
        while let Some(pos) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=pos).collect();
            let line = line.trim_end_matches('\n');
            if let Some(result) = events::extract_result(line) {
                self.last_result = Some(result);
            }
            self.push_tail(line);
        }
    }

    fn push_tail(&mut self, line: &str) {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(sanitize_output(line));
    }

    /// The most recent `result` event text, if any.
    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    /// Whether the completion marker appeared anywhere in the stream.
    pub fn saw_marker(&self) -> bool {
        self.saw_marker
            || self
                .last_result
                .as_deref()
                .is_some_and(events::contains_completion_marker)
    }

    /// The sanitized rolling tail, for the resume patch.
    pub fn tail_text(&self) -> String {
        let mut text: String = self
            .tail
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !self.partial_line.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&sanitize_output(&self.partial_line));
        }
        text
    }

    pub fn tail_line_count(&self) -> usize {
        self.tail.len() + usize::from(!self.partial_line.is_empty())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
