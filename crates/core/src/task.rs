// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task record and state machine vocabulary.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

crate::define_id! {
    /// Unique identifier for a task.
    ///
    /// Each admitted task gets an opaque id used to key its store row, its
    /// queue entry, and its on-disk directory.
    #[derive(Default)]
    pub struct TaskId;
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Processing,
    Paused,
    WaitingUnban,
    Retrying,
    Completed,
    Failed,
    NeedsHumanReview,
    /// Reserved: present in stored records but never produced by a
    /// transition. See DESIGN.md.
    AwaitingConfirmation,
}

impl TaskState {
    /// Terminal states are never re-dispatched automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::NeedsHumanReview
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Processing => "processing",
            TaskState::Paused => "paused",
            TaskState::WaitingUnban => "waiting_unban",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::NeedsHumanReview => "needs_human_review",
            TaskState::AwaitingConfirmation => "awaiting_confirmation",
        };
        write!(f, "{}", s)
    }
}

/// Dispatch priority. Lower rank dispatches first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// Advises timeouts and the externally selected permission tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Simple tasks that can restart from the beginning
    #[default]
    Lightweight,
    /// Needs partial history for recovery
    MediumContext,
    /// Large files/data, needs chunked processing
    HeavyContext,
}

/// One entry in a task's append-only error history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

/// Resume state accumulated across retries.
///
/// The session id follows an upgrade-only policy: once a UUID-formatted
/// value is stored, a non-UUID candidate never replaces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub needs_interaction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved: Option<DateTime<Utc>>,
    /// Line count of the last saved resume patch
    #[serde(default)]
    pub output_lines: u64,
    /// Byte size of the last saved resume patch
    #[serde(default)]
    pub patch_size: u64,
}

fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

impl Checkpoint {
    /// Adopt a session-id candidate when it is at least as good as the
    /// stored one. Returns true when the stored value changed.
    pub fn adopt_session_id(&mut self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return false;
        }

        if self.session_id.as_deref() == Some(candidate) {
            return false;
        }

        let current_is_uuid = self.session_id.as_deref().is_some_and(is_uuid);
        // Never downgrade an existing UUID to a non-UUID candidate
        if current_is_uuid && !is_uuid(candidate) {
            return false;
        }

        self.session_id = Some(candidate.to_string());
        true
    }

    pub fn has_uuid_session(&self) -> bool {
        self.session_id.as_deref().is_some_and(is_uuid)
    }

    /// Record a detected interaction prompt and its auto-response.
    pub fn record_interaction(&mut self, prompt: &str, auto_response: &str) {
        self.needs_interaction = true;
        self.interaction_prompt = Some(prompt.trim().to_string());
        self.auto_response = Some(auto_response.to_string());
    }

    /// Record the metadata of a freshly saved resume patch.
    pub fn record_patch(&mut self, lines: u64, bytes: u64, now: DateTime<Utc>) {
        self.output_lines = lines;
        self.patch_size = bytes;
        self.last_saved = Some(now);
    }
}

fn default_max_retries() -> u32 {
    5
}

/// Configuration for creating a new task
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub command: String,
    pub description: Option<String>,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub working_dir: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub tags: Vec<String>,
    pub max_retries: u32,
}

impl TaskConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command: command.into(),
            description: None,
            task_type: TaskType::default(),
            priority: TaskPriority::default(),
            working_dir: None,
            environment: HashMap::new(),
            tags: Vec::new(),
            max_retries: default_max_retries(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }
}

/// A task instance: the durable record behind `tasks/<id>/task.json`, the
/// store row, and the queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The shell line executed for this task
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_task_state")]
    pub task_state: TaskState,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the task may be re-dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_allowed_at: Option<DateTime<Utc>>,
    /// Worker currently holding the task; cleared whenever the task
    /// returns to the pending queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub checkpoint_data: Checkpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_history: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub idempotency_keys: Vec<String>,
    /// Relative filename of the saved resume patch, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_hint_file: Option<String>,
}

fn default_task_state() -> TaskState {
    TaskState::Pending
}

impl Task {
    pub fn new(config: TaskConfig, clock: &dyn Clock) -> Self {
        Self {
            id: config.id,
            name: config.name,
            description: config.description,
            command: config.command,
            working_dir: config.working_dir,
            environment: config.environment,
            task_type: config.task_type,
            priority: config.priority,
            task_state: TaskState::Pending,
            retry_count: 0,
            max_retries: config.max_retries,
            created_at: clock.now(),
            started_at: None,
            completed_at: None,
            next_allowed_at: None,
            assigned_worker: None,
            checkpoint_data: Checkpoint::default(),
            last_error: None,
            error_history: Vec::new(),
            tags: config.tags,
            idempotency_keys: Vec::new(),
            resume_hint_file: None,
        }
    }

    /// Append to the error history and mirror into `last_error`.
    pub fn add_error(&mut self, kind: impl Into<String>, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        self.last_error = Some(message.clone());
        self.error_history.push(ErrorRecord {
            timestamp: now,
            kind: kind.into(),
            message,
        });
    }

    /// A task can be retried while it has budget left and has not reached
    /// a state that forbids automated retries.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
            && !matches!(
                self.task_state,
                TaskState::Completed | TaskState::NeedsHumanReview
            )
    }

    /// Whether the task is ready for dispatch at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.next_allowed_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
