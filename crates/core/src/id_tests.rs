// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

crate::define_id! {
    /// Test-only identifier.
    pub struct ProbeId;
}

#[test]
fn short_id_has_prefix_and_hex_tail() {
    let id = short_id("task");
    let (prefix, tail) = id.split_once('_').unwrap();
    assert_eq!(prefix, "task");
    assert_eq!(tail.len(), 8);
    assert!(tail.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn short_ids_are_unique() {
    assert_ne!(short_id("task"), short_id("task"));
}

#[test]
fn defined_id_compares_with_str() {
    let id = ProbeId::new("abc-123");
    assert_eq!(id, *"abc-123");
    assert_eq!(id.as_str(), "abc-123");
    assert_eq!(id.short(3), "abc");
    assert_eq!(id.to_string(), "abc-123");
}

#[test]
fn defined_id_short_handles_short_input() {
    let id = ProbeId::new("ab");
    assert_eq!(id.short(8), "ab");
}

#[test]
fn defined_id_roundtrips_through_serde() {
    let id = ProbeId::new("task_9f3a11bc");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"task_9f3a11bc\"");
    let back: ProbeId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}
