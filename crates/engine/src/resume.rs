// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resume-context assembly for interrupted tasks.
//!
//! The context is a deterministic text block fed to the assistant when a
//! RETRYING task is picked up again: what the task is, how far it got,
//! what interaction was pending, and the reminder to end with the
//! completion marker.

use shep_core::{Task, COMPLETION_MARKER};
use std::path::Path;

/// Cap on how much previous output is replayed into the resume context.
const MAX_PATCH_BYTES: usize = 50_000;

/// Fallback when the detector produced a YES judgment without a usable
/// reply.
const DEFAULT_AUTO_RESPONSE: &str =
    "I have full autonomous authority for this task; no human input is needed. \
     Continuing with the remaining work.";

/// Assemble the resume context for a RETRYING task.
pub fn generate_resume_context(task: &Task, task_dir: &Path) -> String {
    let mut parts: Vec<String> = vec![
        "=== TASK RESUME CONTEXT ===".to_string(),
        format!("Task: {}", task.name),
        format!("Retry Count: {}", task.retry_count),
    ];

    let checkpoint = &task.checkpoint_data;
    if checkpoint.needs_interaction {
        if let Some(prompt) = &checkpoint.interaction_prompt {
            parts.push(format!("Previous interaction detected: {prompt}"));
        }
        let response = checkpoint
            .auto_response
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_AUTO_RESPONSE);
        parts.push(format!("Auto-response content: {response}"));
        parts.push("Please continue with the task after this response.".to_string());
    }

    if let Some(session_id) = &checkpoint.session_id {
        parts.push(format!("Session ID: {session_id}"));
    }

    if let Some(patch) = read_patch_tail(task_dir) {
        parts.push("=== PREVIOUS OUTPUT (Last 500 lines) ===".to_string());
        parts.push(patch);
        parts.push("=== END PREVIOUS OUTPUT ===".to_string());
        parts.push(String::new());
    }

    parts.push("Continue from where we left off.".to_string());
    parts.push(String::new());
    parts.push("=== COMPLETION REMINDER ===".to_string());
    parts.push("Do not repeat actions that already succeeded.".to_string());
    parts.push(format!(
        "When the task is fully complete, end your final response with the exact line: {COMPLETION_MARKER}"
    ));
    parts.push(
        "Place the marker on its own line as the last content and do not add text after it."
            .to_string(),
    );

    parts.join("\n")
}

fn read_patch_tail(task_dir: &Path) -> Option<String> {
    let text = std::fs::read_to_string(task_dir.join("resume_patch.txt")).ok()?;
    if text.len() <= MAX_PATCH_BYTES {
        return Some(text);
    }
    // Keep the tail, aligned to a character boundary
    let mut start = text.len() - MAX_PATCH_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    Some(text[start..].to_string())
}

/// Build the first user input of a session-resume run. The captured
/// interaction prompt and its auto-response come first so the assistant
/// answers the pending question before continuing.
pub fn build_resume_query(task: &Task, resume_context: &str) -> String {
    let checkpoint = &task.checkpoint_data;
    if !checkpoint.needs_interaction {
        return resume_context.to_string();
    }

    let mut segments: Vec<&str> = Vec::new();
    let prompt = checkpoint
        .interaction_prompt
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if !prompt.is_empty() {
        segments.push(prompt);
    }
    let response = checkpoint
        .auto_response
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_AUTO_RESPONSE);
    segments.push(response);
    let context = resume_context.trim();
    if !context.is_empty() {
        segments.push(context);
    }

    segments.join("\n\n").trim().to_string()
}

/// How a task's next run is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Fresh run of the task command.
    Fresh(String),
    /// Session resume: `<bin> -r "<session_id>" "<query>"`.
    SessionResume(String),
    /// No session id known: replay the context through a file prefix.
    LegacyResume { command: String, context: String },
}

impl Invocation {
    pub fn command(&self) -> &str {
        match self {
            Invocation::Fresh(cmd) => cmd,
            Invocation::SessionResume(cmd) => cmd,
            Invocation::LegacyResume { command, .. } => command,
        }
    }
}

/// Decide the invocation for a task, given the assembled resume context
/// (empty for fresh runs) and the task directory holding
/// `resume_context.txt` for the legacy path.
pub fn plan_invocation(
    task: &Task,
    resume_context: &str,
    assistant_bin: &str,
    task_dir: &Path,
) -> Invocation {
    if resume_context.is_empty() {
        return Invocation::Fresh(task.command.clone());
    }

    match &task.checkpoint_data.session_id {
        Some(session_id) => {
            let query = build_resume_query(task, resume_context);
            Invocation::SessionResume(format!(
                "{} -r \"{}\" \"{}\"",
                assistant_bin,
                session_id,
                shell_escape(&query)
            ))
        }
        None => {
            // Legacy path: the worker writes resume_context.txt and
            // prefixes the command with a cat of it
            let context_file = task_dir.join("resume_context.txt");
            Invocation::LegacyResume {
                command: format!("cat {} && {}", context_file.display(), task.command),
                context: resume_context.to_string(),
            }
        }
    }
}

/// Escape a string for embedding inside double quotes in a shell line.
fn shell_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' | '\\' | '$' | '`' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
#[path = "resume_tests.rs"]
mod tests;
