// SPDX-FileCopyrightText: Copyright (c) 2024-2025 gpupool contributors
// SPDX-License-Identifier: Apache-2.0

//! Structural diff/patch over JSON trees.
//!
//! The only contract the rest of the crate relies on is the inverse law:
//! `patch(A, diff(A, B))` structurally equals `B`. Deltas are minimal at the
//! object-field level; arrays and scalars are replaced wholesale. The wire
//! format is crate-internal:
//!
//! - objects recurse field by field,
//! - a changed leaf becomes `{"$set": <new value>}`,
//! - a removed field becomes `{"$unset": true}`.
//!
//! A `$set`/`$unset` key can therefore never collide with state data, which
//! only uses plain identifier keys and URLs.

use serde_json::{Map, Value, json};

const SET: &str = "$set";
const UNSET: &str = "$unset";

/// Compute the delta that transforms `a` into `b`. `None` means equal.
pub fn diff(a: &Value, b: &Value) -> Option<Value> {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut delta = Map::new();
            for (key, vb) in mb {
                match ma.get(key) {
                    Some(va) => {
                        if let Some(child) = diff(va, vb) {
                            delta.insert(key.clone(), child);
                        }
                    }
                    None => {
                        delta.insert(key.clone(), json!({ SET: vb }));
                    }
                }
            }
            for key in ma.keys() {
                if !mb.contains_key(key) {
                    delta.insert(key.clone(), json!({ UNSET: true }));
                }
            }
            if delta.is_empty() {
                None
            } else {
                Some(Value::Object(delta))
            }
        }
        _ => {
            if a == b {
                None
            } else {
                Some(json!({ SET: b }))
            }
        }
    }
}

/// Apply `delta` to `target` in place.
pub fn patch(target: &mut Value, delta: &Value) {
    let Value::Object(ops) = delta else {
        return;
    };

    if let Some(replacement) = ops.get(SET) {
        *target = replacement.clone();
        return;
    }

    if !target.is_object() {
        // A recursive delta against a non-object target can only come from
        // mismatched inputs; install an empty object and apply into it.
        *target = Value::Object(Map::new());
    }
    let map = target.as_object_mut().expect("target coerced to object");

    for (key, child) in ops {
        let is_unset = child
            .get(UNSET)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_unset {
            map.remove(key);
        } else if let Some(set_value) = child.get(SET) {
            map.insert(key.clone(), set_value.clone());
        } else {
            let slot = map.entry(key.clone()).or_insert(Value::Object(Map::new()));
            patch(slot, child);
        }
    }
}

/// Convenience: clone `a`, apply `delta`, return the result.
pub fn patched(a: &Value, delta: &Value) -> Value {
    let mut out = a.clone();
    patch(&mut out, delta);
    out
}
