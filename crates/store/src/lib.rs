// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Durable store for Shepherd: an append-only JSONL ledger of record
//! operations, a materialized in-memory state with secondary indexes, and
//! an atomically replaced snapshot for bounded recovery.

mod ledger;
mod snapshot;
mod store;
mod wal;

pub use ledger::{IdempotencyRecord, LedgerOp, LedgerState};
pub use snapshot::{LedgerSnapshot, SnapshotError};
pub use store::{CleanupReport, Store, StoreError, TaskCounts};
pub use wal::{Wal, WalEntry, WalError};
