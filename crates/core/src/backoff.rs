// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Retry and rate-limit backoff math.

use crate::config::Config;
use std::time::Duration;

/// Delay before the Nth retry: `base_delay · exponential_base^(N−1)`,
/// capped at `max_delay`. `retry_count` is the value AFTER the increment,
/// so the first retry uses `base_delay` exactly.
pub fn retry_delay(cfg: &Config, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1);
    let raw = cfg.base_delay * cfg.exponential_base.powi(exponent as i32);
    Duration::from_secs_f64(raw.min(cfg.max_delay).max(0.0))
}

/// Session-wait when entering WAITING_UNBAN without a parsed retry-after:
/// `default_unban_wait · rate_limit_backoff_multiplier^retry_count`,
/// capped at `max_delay`.
pub fn unban_wait(cfg: &Config, retry_count: u32) -> Duration {
    let raw =
        cfg.default_unban_wait as f64 * cfg.rate_limit_backoff_multiplier.powi(retry_count as i32);
    Duration::from_secs_f64(raw.min(cfg.max_delay).max(0.0))
}

#[cfg(test)]
#[path = "backoff_tests.rs"]
mod tests;
