// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Adapters between the engine and the outside world: assistant
//! subprocesses, the availability prober, the interaction detector, and
//! process/system health.

pub mod detector;
pub mod probe;
pub mod subprocess;
pub mod system;

pub use detector::{CliInteractionDetector, Detection, InteractionDetector};
pub use probe::{AvailabilityProber, CliProber, ProbeOutcome};
pub use subprocess::{run_with_timeout, shell_command, spawn_streaming};
pub use system::{
    terminate_pid, ConnectivityProbe, PingProbe, ProcessStats, SysMonitor, SystemMonitor,
};

#[cfg(any(test, feature = "test-support"))]
pub use detector::ScriptedDetector;
#[cfg(any(test, feature = "test-support"))]
pub use probe::ScriptedProber;
#[cfg(any(test, feature = "test-support"))]
pub use system::{FakeConnectivity, FakeSystemMonitor};
