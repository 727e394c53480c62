// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interaction detection over the assistant's final `result` text.
//!
//! The reference implementation delegates the judgment to the assistant
//! itself through a short side-channel prompt that must answer in exactly
//! two lines (`JUDGMENT:` then `RESPONSE:`). A YES judgment only counts
//! when the response is concrete; generic "you decide" responses are
//! rejected so the resumed run is never fed a non-answer.

use crate::subprocess::{run_with_timeout, DETECTOR_TIMEOUT};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// Verdict of an interaction check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub needs_interaction: bool,
    pub auto_response: String,
}

impl Detection {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn respond(auto_response: impl Into<String>) -> Self {
        Self {
            needs_interaction: true,
            auto_response: auto_response.into(),
        }
    }
}

/// Pluggable predicate over the last `result` string.
#[async_trait]
pub trait InteractionDetector: Send + Sync {
    async fn detect(&self, result_text: &str) -> Detection;
}

/// Responses that merely hand the decision back are useless as resume
/// input and void a YES judgment.
const GENERIC_MARKERS: &[&str] = &[
    "autonom",
    "best choice",
    "choose the best option",
    "make the best decision",
    "you can decide",
];

fn is_generic(response: &str) -> bool {
    let lower = response.to_lowercase();
    response.is_empty() || GENERIC_MARKERS.iter().any(|m| lower.contains(m))
}

/// Parse the two-line protocol. Returns `(judgment_is_yes, response)`.
fn parse_protocol(text: &str) -> (bool, String) {
    let mut judgment = String::new();
    let mut response = String::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("JUDGMENT:") {
            judgment = rest.trim().to_uppercase();
        } else if let Some(rest) = line.strip_prefix("RESPONSE:") {
            response = rest.trim().to_string();
        }
    }
    (judgment == "YES", response)
}

/// Detector backed by a side-channel invocation of the assistant CLI.
pub struct CliInteractionDetector {
    assistant_bin: String,
}

impl CliInteractionDetector {
    pub fn new(assistant_bin: impl Into<String>) -> Self {
        Self {
            assistant_bin: assistant_bin.into(),
        }
    }

    fn prompt(result_text: &str) -> String {
        format!(
            "Decide whether the following text is asking us to confirm or choose \
             something, and produce a reply that can be sent back verbatim.\n\n\
             TEXT: {result_text}\n\n\
             Rules:\n\
             1. If the text needs a confirmation or choice, output JUDGMENT: YES and put \
             the exact reply in RESPONSE. If the text offers numbered options (\"1.\", \
             \"2.\"), answer with the matching number or letter alone. Otherwise answer \
             briefly and concretely, e.g. \"Yes, please proceed.\" No explanations.\n\
             2. If it is not a confirmation request, output JUDGMENT: NO with an empty \
             RESPONSE.\n\n\
             The output must be exactly:\n\
             JUDGMENT: YES/NO\n\
             RESPONSE: <reply or empty>\n\n\
             Output nothing else."
        )
    }
}

impl Default for CliInteractionDetector {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl InteractionDetector for CliInteractionDetector {
    async fn detect(&self, result_text: &str) -> Detection {
        let mut cmd = Command::new(&self.assistant_bin);
        cmd.arg("-p").arg(Self::prompt(result_text));

        let output = match run_with_timeout(cmd, DETECTOR_TIMEOUT, "interaction probe").await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(code = ?output.status.code(), "interaction probe exited non-zero");
                return Detection::none();
            }
            Err(e) => {
                warn!(error = %e, "interaction probe failed");
                return Detection::none();
            }
        };

        let text = String::from_utf8_lossy(&output.stdout);
        let (yes, response) = parse_protocol(&text);
        if !yes {
            return Detection::none();
        }
        if is_generic(&response) {
            debug!(response, "discarding non-actionable interaction response");
            return Detection::none();
        }
        Detection::respond(response)
    }
}

/// Scripted detector for tests: answers from a fixed queue, falling back
/// to "no interaction".
#[cfg(any(test, feature = "test-support"))]
pub struct ScriptedDetector {
    answers: parking_lot::Mutex<std::collections::VecDeque<Detection>>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(any(test, feature = "test-support"))]
impl ScriptedDetector {
    pub fn new(answers: impl IntoIterator<Item = Detection>) -> Self {
        Self {
            answers: parking_lot::Mutex::new(answers.into_iter().collect()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// A detector that never reports interaction.
    pub fn silent() -> Self {
        Self::new([])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl InteractionDetector for ScriptedDetector {
    async fn detect(&self, _result_text: &str) -> Detection {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.answers.lock().pop_front().unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "detector_tests.rs"]
mod tests;
