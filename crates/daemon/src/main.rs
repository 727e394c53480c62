// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shepherd daemon (shepd)
//!
//! Process root for the unattended execution supervisor: owns the store,
//! the workers, the rate-limit coordinator, and the recovery loop.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use shep_core::{AlertLevel, Config};
use shep_daemon::lifecycle::{Daemon, LifecycleError};
use shep_daemon::env;
use shep_engine::AlertSink;
use shep_store::Store;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(arg) = std::env::args().nth(1) {
        match arg.as_str() {
            "--version" | "-V" | "-v" => {
                println!("shepd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                println!("shepd {}", env!("CARGO_PKG_VERSION"));
                println!("Shepherd daemon - unattended execution supervisor for the assistant CLI");
                println!();
                println!("USAGE:");
                println!("    shepd");
                println!();
                println!("Configuration comes from shepd.toml (override with SHEPD_CONFIG).");
                println!("SHEPD_BASE_DIR overrides the base directory; SHEPD_ASSISTANT_BIN");
                println!("overrides the assistant binary (default: claude).");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version information");
                return Ok(());
            }
            _ => {
                eprintln!("error: unexpected argument '{arg}'");
                eprintln!("Usage: shepd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let mut config = Config::load(&env::config_path())?;
    if let Some(base) = env::base_dir() {
        config.base_dir = base;
    }
    if let Some(workers) = env::num_workers() {
        config.num_workers = workers;
    }
    let assistant_bin = env::assistant_bin();

    config.ensure_layout()?;
    let log_path = Daemon::log_path(&config);
    rotate_log_if_needed(&log_path, config.max_log_size_mb, config.max_log_files);
    let _log_guard = setup_logging(&log_path)?;

    info!(
        base_dir = %config.base_dir.display(),
        num_workers = config.num_workers,
        assistant_bin = %assistant_bin,
        "starting shepd"
    );

    let daemon = match Daemon::startup(config.clone(), &assistant_bin).await {
        Ok(daemon) => daemon,
        Err(LifecycleError::LockFailed(path)) => {
            let pid = std::fs::read_to_string(&path).unwrap_or_default();
            eprintln!("shepd is already running");
            if !pid.trim().is_empty() {
                eprintln!("  pid: {}", pid.trim());
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "failed to start daemon");
            report_fatal(&config, &e);
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!("shepd ready");

    let mut run = tokio::spawn(daemon.run(Arc::clone(&shutdown_tx), shutdown_rx));

    let result = tokio::select! {
        joined = &mut run => flatten(joined),
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            let _ = shutdown_tx.send(true);
            flatten(run.await)
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
            flatten(run.await)
        }
    };

    match result {
        Ok(()) => {
            info!("shepd stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "shepd stopped with failure");
            report_fatal(&config, &e);
            std::process::exit(1);
        }
    }
}

fn flatten(
    joined: Result<Result<(), LifecycleError>, tokio::task::JoinError>,
) -> Result<(), LifecycleError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(LifecycleError::Io(std::io::Error::other(e))),
    }
}

/// Best-effort P1 alert for a fatal failure. Store corruption means the
/// primary store may be unwritable, so the JSONL stream is the one durable
/// channel we still try.
fn report_fatal(config: &Config, error: &LifecycleError) {
    // A corrupt store cannot take the row; the JSONL stream alone still
    // records the alert in that case.
    match Store::open(&config.ledger_path(), &config.ledger_snapshot_path()) {
        Ok(store) => {
            let sink = AlertSink::new(store, config.alerts_path());
            sink.emit(
                AlertLevel::P1,
                "Supervisor fatal failure",
                error.to_string(),
                chrono::Utc::now(),
            );
        }
        Err(_) => {
            let line = serde_json::json!({
                "level": "P1",
                "title": "Supervisor fatal failure",
                "message": error.to_string(),
                "created_at": chrono::Utc::now().to_rfc3339(),
            });
            if let Ok(mut file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.alerts_path())
            {
                use std::io::Write as _;
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

/// Rotate the daemon log when it exceeds the configured size. Shifts
/// `shepd.log` → `.1` → `.2` → ..., deleting the oldest. Best-effort.
fn rotate_log_if_needed(log_path: &std::path::Path, max_size_mb: u64, max_files: u32) {
    let size = match std::fs::metadata(log_path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < max_size_mb * 1024 * 1024 {
        return;
    }

    let log_str = log_path.display().to_string();
    let keep = max_files.max(1);
    for i in (1..keep).rev() {
        let from = format!("{log_str}.{i}");
        let to = format!("{log_str}.{}", i + 1);
        let _ = std::fs::rename(&from, &to);
    }
    let _ = std::fs::rename(log_path, format!("{log_str}.1"));
}

fn setup_logging(
    log_path: &std::path::Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, std::io::Error> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let dir = log_path
        .parent()
        .ok_or_else(|| std::io::Error::other("log path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let file_name = log_path
        .file_name()
        .ok_or_else(|| std::io::Error::other("log path has no file name"))?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .init();

    Ok(guard)
}
