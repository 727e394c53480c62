// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! shep-engine: the task lifecycle engine, workers, rate-limit
//! coordinator, and auto-recovery loop.

pub mod alerts;
pub mod coordinator;
mod error;
pub mod monitor;
pub mod recovery;
pub mod resume;
pub mod transitions;
pub mod worker;

pub use alerts::AlertSink;
pub use coordinator::{CoordinatorHandle, CoordinatorMsg, RateLimitCoordinator};
pub use error::EngineError;
pub use monitor::{MonitorVerdict, OutputMonitor};
pub use recovery::{RecoveryAction, RecoveryActionKind, RecoveryLoop};
pub use transitions::{TaskEngine, TaskSnapshot};
pub use worker::Worker;
