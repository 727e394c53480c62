// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Classification of assistant output into rate-limit and session-expiry
//! signals.
//!
//! Matching is case-insensitive substring/pattern matching over raw output
//! chunks. Some phrases are plausible content words, so a false positive is
//! possible; the cost is bounded (the task waits and the prober recovers).

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"(?i)rate limit.*?exceeded",
    r"(?i)quota.*?exceeded",
    r"(?i)too many requests",
    r"(?i)5-hour limit.*?reached",
    r"(?i)usage limit.*?reached",
];

const SESSION_EXPIRED_PATTERNS: &[&str] = &[
    r"(?i)session.*?expired",
    r"(?i)authentication.*?failed",
    r"(?i)login.*?required",
    r"(?i)unauthorized",
];

const RETRY_AFTER_PATTERN: &str = r"(?i)retry.*?after.*?(\d+).*?(second|minute|hour)";

fn compiled(patterns: &'static [&'static str], slot: &'static OnceLock<Vec<Regex>>) -> &'static [Regex] {
    slot.get_or_init(|| {
        patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn rate_limit_res() -> &'static [Regex] {
    static SLOT: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(RATE_LIMIT_PATTERNS, &SLOT)
}

fn session_expired_res() -> &'static [Regex] {
    static SLOT: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(SESSION_EXPIRED_PATTERNS, &SLOT)
}

#[allow(clippy::unwrap_used)] // the pattern is a compile-time constant
fn retry_after_re() -> &'static Regex {
    static SLOT: OnceLock<Regex> = OnceLock::new();
    SLOT.get_or_init(|| Regex::new(RETRY_AFTER_PATTERN).unwrap())
}

/// Kind of rate limit in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKind {
    /// The provider's rolling 5-hour session window
    SessionLimit,
    /// Too many requests in a short period
    RequestRate,
    /// Daily/monthly quota
    QuotaExceeded,
    Unknown,
}

impl RateLimitKind {
    /// Wait estimate in seconds when the output carries no explicit
    /// retry-after.
    pub fn estimated_wait(&self, default_unban_wait: u64) -> u64 {
        match self {
            RateLimitKind::SessionLimit => 18_000,
            RateLimitKind::QuotaExceeded => 86_400,
            RateLimitKind::RequestRate => 3_600,
            RateLimitKind::Unknown => default_unban_wait,
        }
    }
}

impl fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RateLimitKind::SessionLimit => "session_limit",
            RateLimitKind::RequestRate => "request_rate",
            RateLimitKind::QuotaExceeded => "quota_exceeded",
            RateLimitKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A recorded rate-limit observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub kind: RateLimitKind,
    pub retry_after_seconds: u64,
    pub detected_at: DateTime<Utc>,
    /// First 500 chars of the triggering output
    pub raw_message: String,
    pub confidence: f64,
}

impl RateLimitInfo {
    /// The effective unban time for this observation.
    pub fn unban_time(&self) -> DateTime<Utc> {
        self.detected_at + chrono::Duration::seconds(self.retry_after_seconds as i64)
    }
}

/// Raw classification of one output chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSignals {
    pub rate_limited: bool,
    pub session_expired: bool,
    /// Parsed `retry after N <unit>` override, in seconds
    pub retry_after: Option<u64>,
}

/// Scan output for the recognized assistant error phrases.
pub fn classify_output(output: &str) -> ErrorSignals {
    let mut signals = ErrorSignals::default();

    if rate_limit_res().iter().any(|re| re.is_match(output)) {
        signals.rate_limited = true;
        signals.retry_after = parse_retry_after(output);
    }

    if session_expired_res().iter().any(|re| re.is_match(output)) {
        signals.session_expired = true;
    }

    signals
}

/// Parse a `retry ... after ... N (second|minute|hour)` phrase into seconds.
pub fn parse_retry_after(output: &str) -> Option<u64> {
    let caps = retry_after_re().captures(output)?;
    let value: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    Some(match unit.as_str() {
        "minute" => value * 60,
        "hour" => value * 3600,
        _ => value,
    })
}

/// Classify the kind of rate limit from the surrounding text.
fn classify_kind(output: &str) -> (RateLimitKind, f64) {
    let lower = output.to_ascii_lowercase();
    if lower.contains("5-hour") || lower.contains("session") {
        (RateLimitKind::SessionLimit, 0.95)
    } else if lower.contains("quota") {
        (RateLimitKind::QuotaExceeded, 0.9)
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        (RateLimitKind::RequestRate, 0.85)
    } else {
        (RateLimitKind::Unknown, 0.7)
    }
}

/// Build a [`RateLimitInfo`] from output that classified as rate-limited
/// (or session-expired during a probe). Returns `None` when neither signal
/// is present.
pub fn rate_limit_info(
    output: &str,
    detected_at: DateTime<Utc>,
    default_unban_wait: u64,
) -> Option<RateLimitInfo> {
    let signals = classify_output(output);
    if !signals.rate_limited && !signals.session_expired {
        return None;
    }

    let (kind, confidence) = classify_kind(output);
    let retry_after_seconds = signals
        .retry_after
        .unwrap_or_else(|| kind.estimated_wait(default_unban_wait));

    Some(RateLimitInfo {
        kind,
        retry_after_seconds,
        detected_at,
        raw_message: output.chars().take(500).collect(),
        confidence,
    })
}

#[cfg(test)]
#[path = "signal_tests.rs"]
mod tests;
