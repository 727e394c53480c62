// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Parsing of the assistant's newline-delimited JSON event stream.
//!
//! Each line is a single JSON object or an array of objects. Event objects
//! carry `type` (`system`, `result`, ...), an optional `session_id`, and —
//! for `result` events — the textual answer in `result`. Output that is not
//! valid JSON is passed through untouched; parsing is best effort.

use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Marker whose presence authorizes the COMPLETED transition.
pub const COMPLETION_MARKER: &str = "✅ TASK_COMPLETED";

/// One decoded assistant event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssistantEvent {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

impl AssistantEvent {
    pub fn is_result(&self) -> bool {
        self.kind.as_deref() == Some("result")
    }
}

/// Parse one output line into events. Arrays flatten to their object
/// elements; anything unparseable yields an empty vec.
pub fn parse_line_events(line: &str) -> Vec<AssistantEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<AssistantEvent>>(trimmed).unwrap_or_default()
    } else {
        serde_json::from_str::<AssistantEvent>(trimmed)
            .map(|e| vec![e])
            .unwrap_or_default()
    }
}

/// Extract the `result` string from a line holding a `type == "result"`
/// event (object or array form).
pub fn extract_result(line: &str) -> Option<String> {
    // Cheap pre-filter before paying for a JSON parse
    if !(line.contains("\"type\":\"result\"") || line.contains("\"type\": \"result\"")) {
        return None;
    }
    parse_line_events(line)
        .into_iter()
        .find(|e| e.is_result())
        .and_then(|e| e.result)
}

#[allow(clippy::unwrap_used)] // the pattern is a compile-time constant
fn embedded_session_re() -> &'static Regex {
    static SLOT: OnceLock<Regex> = OnceLock::new();
    SLOT.get_or_init(|| Regex::new(r#"\{[^{}]*"session_id"[^{}]*\}"#).unwrap())
}

/// Collect session-id candidates from a chunk, freshest last.
///
/// Handles three shapes: whole lines that are event objects or arrays, and
/// flat JSON objects embedded mid-line (the assistant sometimes wraps its
/// own events in prose).
pub fn scan_session_ids(chunk: &str) -> Vec<String> {
    let mut found = Vec::new();

    if !chunk.contains("\"session_id\"") {
        return found;
    }

    for line in chunk.lines() {
        for event in parse_line_events(line) {
            if let Some(sid) = event.session_id {
                if !sid.is_empty() {
                    found.push(sid);
                }
            }
        }
    }

    for m in embedded_session_re().find_iter(chunk) {
        if let Ok(event) = serde_json::from_str::<AssistantEvent>(m.as_str()) {
            if let Some(sid) = event.session_id {
                if !sid.is_empty() && !found.contains(&sid) {
                    found.push(sid);
                }
            }
        }
    }

    found
}

/// Whether `text` carries the completion marker.
pub fn contains_completion_marker(text: &str) -> bool {
    text.contains(COMPLETION_MARKER)
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
