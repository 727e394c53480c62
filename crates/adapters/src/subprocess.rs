// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subprocess execution helpers.
//!
//! Quoting policy: a task's `command` is passed verbatim as the single
//! argument of `sh -c`, wrapped as `{ <command>\n} 2>&1` so stderr merges
//! into the stdout pipe. The supervisor never interpolates user input into
//! the wrapper beyond those braces; quoting inside the command line is the
//! task author's contract, as it is for any shell line.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Hard deadline for the interaction-detector side channel.
pub const DETECTOR_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for an availability probe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the fallback output recapture pass.
pub const FALLBACK_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace window between SIGTERM and SIGKILL.
pub const GRACEFUL_EXIT_WINDOW: Duration = Duration::from_secs(5);

/// Run a subprocess command with a timeout.
///
/// Wraps `Command::output()` with `tokio::time::timeout`, converting
/// timeout expiration into a descriptive error message. The child process
/// is killed automatically if the timeout elapses (via the tokio `Child`
/// drop implementation).
pub async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    description: &str,
) -> Result<std::process::Output, String> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(io_err)) => Err(format!("{} failed: {}", description, io_err)),
        Err(_elapsed) => Err(format!(
            "{} timed out after {}s",
            description,
            timeout.as_secs()
        )),
    }
}

/// Build the `sh -c` invocation for a task command with merged
/// stdout+stderr, a null stdin, and unbuffered output.
pub fn shell_command(
    command: &str,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Command {
    let mut cmd = Command::new("sh");
    // The trailing newline closes a command ending in a comment
    cmd.arg("-c").arg(format!("{{ {command}\n}} 2>&1"));
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    // The assistant buffers aggressively when not on a tty
    cmd.env("PYTHONUNBUFFERED", "1");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    cmd
}

/// Spawn a task command for streaming reads.
pub fn spawn_streaming(
    command: &str,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let mut cmd = shell_command(command, cwd, env);
    cmd.kill_on_drop(true);
    cmd.spawn()
}

#[cfg(test)]
#[path = "subprocess_tests.rs"]
mod tests;
