// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL ledger file.
//!
//! Each entry is a single line of JSON: `{"seq":N,"op":{...}}\n`. Appends
//! are fsync'd before the caller's save returns, which makes every record
//! write crash-atomic: a torn final line is the only possible crash
//! artifact, and it is dropped at open (the original file is rotated to a
//! `.bak` first). An unparseable line anywhere before the tail means real
//! corruption and is surfaced to the caller.

use crate::ledger::LedgerOp;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors that can occur in ledger-file operations
#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corrupt entry at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

/// Serialization helper for writing entries without cloning the op.
#[derive(Serialize)]
struct WalRecordRef<'a> {
    seq: u64,
    op: &'a LedgerOp,
}

/// Deserialization helper for reading entries.
#[derive(Deserialize)]
struct WalRecord {
    seq: u64,
    op: LedgerOp,
}

/// A single ledger entry with sequence number
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub seq: u64,
    pub op: LedgerOp,
}

/// Append-only JSONL ledger with per-append fsync.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Highest sequence number written
    write_seq: u64,
}

impl Wal {
    /// Open or create the ledger at `path`.
    ///
    /// A torn final line (crash artifact) is repaired by rewriting the file
    /// without it; the damaged original is kept as `.bak`. A bad line
    /// earlier in the file is corruption and is returned as
    /// [`WalError::Corrupt`].
    pub fn open(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let scan = Self::scan(&file)?;

        let file = match scan.damage {
            None => file,
            Some(_) if !scan.content_after_damage => {
                // Torn tail from a crash mid-append: keep the valid prefix
                drop(file);
                let bak = crate::snapshot::rotate_bak_path(path);
                warn!(
                    path = %path.display(),
                    bak = %bak.display(),
                    kept_entries = scan.valid_lines.len(),
                    "torn ledger tail detected, rotating original to .bak",
                );
                std::fs::copy(path, &bak)?;
                rewrite_lines(path, &scan.valid_lines)?;
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .append(true)
                    .open(path)?
            }
            Some(damage) => {
                return Err(WalError::Corrupt {
                    line: damage.line,
                    message: damage.message,
                });
            }
        };

        Ok(Self {
            file,
            path: path.to_owned(),
            write_seq: scan.max_seq,
        })
    }

    /// Append an op and fsync. Returns the assigned sequence number; once
    /// this returns, the record is durable.
    pub fn append(&mut self, op: &LedgerOp) -> Result<u64, WalError> {
        self.write_seq += 1;
        let seq = self.write_seq;
        let mut line = serde_json::to_vec(&WalRecordRef { seq, op })?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(seq)
    }

    /// Highest sequence number written so far.
    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// Raise the sequence counter to at least `seq`.
    ///
    /// Called at open with the snapshot's sequence: after a truncation the
    /// file alone may under-count, and new appends must never reuse a
    /// sequence the snapshot already covers.
    pub fn bump_seq(&mut self, seq: u64) {
        self.write_seq = self.write_seq.max(seq);
    }

    /// All entries with seq strictly greater than `seq`, in order.
    ///
    /// Used for recovery: replaying the suffix after a snapshot.
    pub fn entries_after(&self, seq: u64) -> Result<Vec<WalEntry>, WalError> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: WalRecord = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    // open() repaired the tail already; stopping here keeps
                    // replay consistent with what open() accepted.
                    warn!(error = %e, "unparseable ledger entry during replay, stopping");
                    break;
                }
            };
            if record.seq > seq {
                entries.push(WalEntry {
                    seq: record.seq,
                    op: record.op,
                });
            }
        }

        Ok(entries)
    }

    /// Drop all entries with seq ≤ `seq`, reclaiming disk space after a
    /// snapshot has made them redundant. Atomic (tmp + rename).
    pub fn truncate_through(&mut self, seq: u64) -> Result<(), WalError> {
        let kept: Vec<String> = {
            let mut reader = BufReader::new(self.file.try_clone()?);
            reader.seek(SeekFrom::Start(0))?;
            let mut kept = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line)? == 0 {
                    break;
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let record: WalRecord = match serde_json::from_str(trimmed) {
                    Ok(r) => r,
                    Err(_) => break,
                };
                if record.seq > seq {
                    kept.push(trimmed.to_string());
                }
            }
            kept
        };

        rewrite_lines(&self.path, &kept)?;

        self.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        Ok(())
    }
}

/// Result of scanning the ledger file at open.
struct ScanResult {
    max_seq: u64,
    valid_lines: Vec<String>,
    damage: Option<Damage>,
    /// True when readable content follows the damaged line: that is real
    /// corruption, not a torn tail.
    content_after_damage: bool,
}

struct Damage {
    /// 1-based line number of the first unparseable line
    line: usize,
    message: String,
}

impl Wal {
    fn scan(file: &File) -> Result<ScanResult, WalError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut max_seq = 0u64;
        let mut valid_lines = Vec::new();
        let mut damage: Option<Damage> = None;
        let mut content_after_damage = false;
        let mut line_no = 0usize;
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    line_no += 1;
                    if damage.is_some() {
                        content_after_damage = true;
                        break;
                    }
                    damage = Some(Damage {
                        line: line_no,
                        message: "invalid UTF-8".to_string(),
                    });
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if damage.is_some() {
                // Anything readable past a bad line rules out a torn tail
                content_after_damage = true;
                break;
            }

            match serde_json::from_str::<WalRecord>(trimmed) {
                Ok(record) => {
                    max_seq = max_seq.max(record.seq);
                    valid_lines.push(trimmed.to_string());
                }
                Err(e) => {
                    damage = Some(Damage {
                        line: line_no,
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(ScanResult {
            max_seq,
            valid_lines,
            damage,
            content_after_damage,
        })
    }
}

/// Rewrite `path` to hold exactly `lines`, atomically.
fn rewrite_lines(path: &Path, lines: &[String]) -> Result<(), WalError> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        for line in lines {
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
        }
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
