// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for the engine

use shep_queue::QueueError;
use shep_store::StoreError;
use thiserror::Error;

/// Errors that can occur in the engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("failed to spawn assistant: {0}")]
    SpawnFailed(String),
}

impl EngineError {
    /// Whether the failure is worth a short-backoff retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Unavailable(_)))
    }

    /// Store corruption is unrecoverable; the process must exit non-zero.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Corrupt(_)))
    }
}
