// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use shep_core::RateLimitKind;

#[tokio::test]
async fn scripted_prober_plays_back_then_repeats_last() {
    let limited = RateLimitInfo {
        kind: RateLimitKind::RequestRate,
        retry_after_seconds: 60,
        detected_at: Utc::now(),
        raw_message: "rate limit exceeded".into(),
        confidence: 0.85,
    };
    let prober = ScriptedProber::new([
        ProbeOutcome::StillLimited(limited.clone()),
        ProbeOutcome::Available,
    ]);

    assert_eq!(prober.probe().await, ProbeOutcome::StillLimited(limited));
    assert_eq!(prober.probe().await, ProbeOutcome::Available);
    assert_eq!(prober.probe().await, ProbeOutcome::Available);
    assert_eq!(prober.calls(), 3);
}

#[tokio::test]
async fn cli_prober_missing_binary_is_inconclusive() {
    let prober = CliProber::new("/nonexistent/assistant-bin", 3600);
    assert_eq!(prober.probe().await, ProbeOutcome::Inconclusive);
}
