// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment overrides for the daemon.

use std::path::PathBuf;

/// Config file path (`SHEPD_CONFIG`, default `shepd.toml`).
pub fn config_path() -> PathBuf {
    std::env::var_os("SHEPD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("shepd.toml"))
}

/// Base directory override (`SHEPD_BASE_DIR`).
pub fn base_dir() -> Option<PathBuf> {
    std::env::var_os("SHEPD_BASE_DIR").map(PathBuf::from)
}

/// Assistant binary override (`SHEPD_ASSISTANT_BIN`, default `claude`).
pub fn assistant_bin() -> String {
    std::env::var("SHEPD_ASSISTANT_BIN").unwrap_or_else(|_| "claude".to_string())
}

/// Worker count override (`SHEPD_NUM_WORKERS`).
pub fn num_workers() -> Option<u32> {
    std::env::var("SHEPD_NUM_WORKERS").ok()?.parse().ok()
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
