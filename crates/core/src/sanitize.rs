// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Masking of sensitive substrings before output is persisted.
//!
//! Applied to the rolling tail saved as `resume_patch.txt` and to any text
//! that leaves the task directory. Matches are replaced with `***` plus the
//! last four characters so operators can still correlate values.

use regex::Regex;
use std::sync::OnceLock;

const SENSITIVE_PATTERNS: &[&str] = &[
    // email addresses
    r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
    // provider API keys
    r"sk-[a-zA-Z0-9]{20,64}",
    // bearer tokens in headers
    r"(?i)bearer\s+[A-Za-z0-9._~+/-]{16,}=*",
    // long base64 blobs (likely tokens)
    r"[A-Za-z0-9+/]{40,}={0,2}",
];

fn sensitive_res() -> &'static [Regex] {
    static SLOT: OnceLock<Vec<Regex>> = OnceLock::new();
    SLOT.get_or_init(|| {
        SENSITIVE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn mask(value: &str) -> String {
    if value.len() > 4 {
        format!("***{}", &value[value.len() - 4..])
    } else {
        "***".to_string()
    }
}

/// Mask all sensitive substrings in `text`.
pub fn sanitize_output(text: &str) -> String {
    let mut out = text.to_string();
    for re in sensitive_res() {
        out = re
            .replace_all(&out, |caps: &regex::Captures<'_>| mask(&caps[0]))
            .into_owned();
    }
    out
}

#[cfg(test)]
#[path = "sanitize_tests.rs"]
mod tests;
