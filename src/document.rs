// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shadow document algebra: normalize, merge and diff.
//!
//! Documents are [`serde_json::Value`] trees of string keys. The cloud-side
//! shadow protocol cannot express "delete this key" natively, so a reserved
//! sentinel value (`"DELETE"`, optionally also the empty array) is used as a
//! delete request. [`normalize`] rewrites every delete request into an
//! explicit `null` leaf; [`merge`] and [`diff`] operate on that uniform
//! representation.
//!
//! The delete-request convention is an explicit [`DeleteMode`] argument
//! threaded through each call, never process-global state.
//!
//! The three shadow operations obey a round-trip law (modulo `null` leaves,
//! which shadow semantics treat as deleted keys):
//!
//! ```
//! use shadow_gateway::document::{diff, merge, normalize, DeleteMode};
//! use serde_json::json;
//!
//! let old = json!({"svc1": {"value": 42}});
//! let new = json!({"svc1": {"value": 43}});
//!
//! let delta = diff(&old, &new, DeleteMode::Sentinel).unwrap();
//! assert_eq!(delta, json!({"svc1": {"value": 43}}));
//! assert_eq!(
//!     merge(old, delta, DeleteMode::Sentinel),
//!     normalize(new, DeleteMode::Sentinel),
//! );
//! ```
//!
//! [`overlay`] is the plain deep-merge with *no* delete-request handling,
//! used by the letterhead pipeline where `"DELETE"` is just a string.

use serde_json::{Map, Value};

/// Reserved sentinel requesting deletion of the key it is assigned to.
pub const DELETE_SENTINEL: &str = "DELETE";

/// Which leaf values count as a delete request during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Only the `"DELETE"` string sentinel requests deletion.
    #[default]
    Sentinel,
    /// The sentinel or an empty array requests deletion.
    SentinelOrEmptyArray,
}

fn is_delete_request(value: &Value, mode: DeleteMode) -> bool {
    match value {
        Value::String(s) => s == DELETE_SENTINEL,
        Value::Array(a) => mode == DeleteMode::SentinelOrEmptyArray && a.is_empty(),
        _ => false,
    }
}

/// Rewrite every delete-request leaf into an explicit `null`.
///
/// Recurses into nested maps; arrays and other non-map values pass through
/// unchanged (except when the whole value is itself a delete request).
#[must_use]
pub fn normalize(value: Value, mode: DeleteMode) -> Value {
    if is_delete_request(&value, mode) {
        return Value::Null;
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize(v, mode)))
                .collect(),
        ),
        other => other,
    }
}

/// Plain deep-merge of `source` onto `target`, with no delete semantics.
///
/// Maps merge key-wise recursively; any other source value (including
/// arrays, which are never merged element-wise) replaces the target value
/// wholesale.
#[must_use]
pub fn overlay(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut t), Value::Object(s)) => {
            for (k, sv) in s {
                let tv = t.remove(&k).unwrap_or(Value::Null);
                if tv.is_object() && sv.is_object() {
                    t.insert(k, overlay(tv, sv));
                } else {
                    t.insert(k, sv);
                }
            }
            Value::Object(t)
        }
        (_, source) => source,
    }
}

/// Deep-merge `source` onto `target` with shadow semantics.
///
/// Equivalent to [`overlay`] followed by [`normalize`]: delete requests in
/// either input come out as `null` leaves. Merging an empty map is the
/// identity modulo normalization.
#[must_use]
pub fn merge(target: Value, source: Value, mode: DeleteMode) -> Value {
    normalize(overlay(target, source), mode)
}

/// Compute the shadow delta turning `old` into `new`.
///
/// Returns `None` when the documents are deep-equal (no change). Otherwise:
/// - `Some(Value::Null)` means whole-subtree deletion,
/// - a non-map value means full replacement (type changes and array changes
///   are always wholesale),
/// - a map contains only the changed/added/removed keys, with removed keys
///   as `null`. Keys present only in `new` are copied through [`normalize`]
///   so embedded delete requests become uniform `null` leaves. Nested
///   subdiffs that come out empty are stripped.
#[must_use]
pub fn diff(old: &Value, new: &Value, mode: DeleteMode) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut out = Map::new();
            for (k, a) in o {
                match n.get(k) {
                    None => {
                        // Removal translates to an explicit null leaf
                        out.insert(k.clone(), Value::Null);
                    }
                    Some(b) if a == b => {}
                    Some(b) => {
                        if a.is_object() && b.is_object() {
                            if let Some(d) = diff(a, b, mode) {
                                out.insert(k.clone(), d);
                            }
                        } else {
                            // Scalar mismatch, type change, or array change:
                            // always a wholesale replacement
                            out.insert(k.clone(), b.clone());
                        }
                    }
                }
            }
            for (k, b) in n {
                if !o.contains_key(k) {
                    out.insert(k.clone(), normalize(b.clone(), mode));
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        _ => Some(new.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_rewrites_sentinels() {
        let doc = json!({
            "a": "DELETE",
            "b": {"c": "DELETE", "d": 1},
            "e": "keep",
        });
        assert_eq!(
            normalize(doc, DeleteMode::Sentinel),
            json!({"a": null, "b": {"c": null, "d": 1}, "e": "keep"})
        );
    }

    #[test]
    fn test_normalize_empty_array_mode() {
        let doc = json!({"a": [], "b": [1]});
        assert_eq!(
            normalize(doc.clone(), DeleteMode::Sentinel),
            json!({"a": [], "b": [1]})
        );
        assert_eq!(
            normalize(doc, DeleteMode::SentinelOrEmptyArray),
            json!({"a": null, "b": [1]})
        );
    }

    #[test]
    fn test_normalize_passthrough() {
        assert_eq!(normalize(Value::Null, DeleteMode::Sentinel), Value::Null);
        assert_eq!(normalize(json!(42), DeleteMode::Sentinel), json!(42));
        // Arrays are not recursed into
        assert_eq!(
            normalize(json!(["DELETE", 1]), DeleteMode::Sentinel),
            json!(["DELETE", 1])
        );
    }

    #[test]
    fn test_merge_typical() {
        let merged = merge(
            json!({
                "a": 1,
                "b": 2,
                "c": {"d": "str", "e": [1, 2], "f": {}},
                "x": 42,
            }),
            json!({
                "a": 2,
                "c": {"d": 11, "e": [2, 4], "f": false},
                "x": "DELETE",
            }),
            DeleteMode::Sentinel,
        );
        assert_eq!(
            merged,
            json!({
                "a": 2,
                "b": 2,
                "c": {"d": 11, "e": [2, 4], "f": false},
                "x": null,
            })
        );
    }

    #[test]
    fn test_merge_empty_array_modes() {
        assert_eq!(
            merge(json!({"a": 1}), json!({"a": []}), DeleteMode::Sentinel),
            json!({"a": []})
        );
        assert_eq!(
            merge(
                json!({"a": 1}),
                json!({"a": []}),
                DeleteMode::SentinelOrEmptyArray
            ),
            json!({"a": null})
        );
    }

    #[test]
    fn test_merge_empty_source_is_identity() {
        let doc = json!({"a": 1, "b": {"c": [1, 2]}});
        assert_eq!(
            merge(doc.clone(), json!({}), DeleteMode::Sentinel),
            normalize(doc, DeleteMode::Sentinel)
        );
    }

    #[test]
    fn test_merge_replaces_arrays_wholesale() {
        assert_eq!(
            merge(json!({"a": [1, 2, 3]}), json!({"a": [9]}), DeleteMode::Sentinel),
            json!({"a": [9]})
        );
    }

    #[test]
    fn test_merge_non_map_source_replaces() {
        assert_eq!(
            merge(json!({"a": 1}), json!([1, 2]), DeleteMode::Sentinel),
            json!([1, 2])
        );
        assert_eq!(merge(json!({"a": 1}), Value::Null, DeleteMode::Sentinel), Value::Null);
    }

    #[test]
    fn test_overlay_keeps_sentinel_strings() {
        // The letterhead path must not interpret delete requests
        assert_eq!(
            overlay(json!({"a": 1}), json!({"a": "DELETE", "b": {"c": 2}})),
            json!({"a": "DELETE", "b": {"c": 2}})
        );
    }

    #[test]
    fn test_diff_multi_service_document() {
        let old = json!({
            "svc1": {
                "obj": {"key": "value", "arr": [1, 2], "value": 42},
                "value": 2,
                "string": "str",
                "array": ["a", "b"],
            },
            "svc2": {"key2": "value"},
            "svc3": false,
            "svc4": [23, 34],
            "svc5": {"key5": "value"},
            "svc6": false,
            "svc7": {"untouched": true},
            "svc8": {"not": "present"},
        });
        let new = json!({
            "svc1": {
                "obj": {"key": "value", "arr": [1, 2], "value": 43},
                "value": 3,
                "string": "str2",
                "array": ["a", "c"],
            },
            "svc2": {"newkey": "value", "key2": null},
            "svc3": true,
            "svc4": [23, 34, 56],
            "svc5": "type-change",
            "svc6": null,
            "svc7": {"untouched": true},
        });
        assert_eq!(
            diff(&old, &new, DeleteMode::Sentinel),
            Some(json!({
                "svc1": {
                    "obj": {"value": 43},
                    "value": 3,
                    "string": "str2",
                    "array": ["a", "c"],
                },
                "svc2": {"newkey": "value", "key2": null},
                "svc3": true,
                "svc4": [23, 34, 56],
                "svc5": "type-change",
                "svc6": null,
                "svc8": null,
            }))
        );
    }

    #[test]
    fn test_diff_no_change_is_none() {
        assert_eq!(diff(&json!({}), &json!({}), DeleteMode::Sentinel), None);
        assert_eq!(diff(&json!("xyz"), &json!("xyz"), DeleteMode::Sentinel), None);
        assert_eq!(diff(&json!(42), &json!(42), DeleteMode::Sentinel), None);
        assert_eq!(diff(&json!(true), &json!(true), DeleteMode::Sentinel), None);
        assert_eq!(diff(&Value::Null, &Value::Null, DeleteMode::Sentinel), None);
        assert_eq!(diff(&json!([]), &json!([]), DeleteMode::Sentinel), None);
    }

    #[test]
    fn test_diff_key_removal() {
        assert_eq!(
            diff(&json!({"a": {"going": true}}), &json!({"a": {}}), DeleteMode::Sentinel),
            Some(json!({"a": {"going": null}}))
        );
    }

    #[test]
    fn test_diff_type_changes_replace_wholesale() {
        assert_eq!(
            diff(&json!({"a": 1}), &json!([1, 2, 3]), DeleteMode::Sentinel),
            Some(json!([1, 2, 3]))
        );
        assert_eq!(
            diff(&json!({"a": {"b": 1}}), &json!({"a": "str"}), DeleteMode::Sentinel),
            Some(json!({"a": "str"}))
        );
        assert_eq!(
            diff(&json!({"key": [1, 2, 3]}), &json!({"key": {"a": 1, "b": 2}}), DeleteMode::Sentinel),
            Some(json!({"key": {"a": 1, "b": 2}}))
        );
    }

    #[test]
    fn test_diff_whole_document_deletion() {
        assert_eq!(
            diff(&json!({"a": 1}), &Value::Null, DeleteMode::Sentinel),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_diff_new_only_subtree_is_normalized() {
        // A delete request for a key that never existed comes out as the
        // uniform null representation
        assert_eq!(
            diff(
                &json!({}),
                &json!({"svc": {"gone": "DELETE", "kept": 1}}),
                DeleteMode::Sentinel
            ),
            Some(json!({"svc": {"gone": null, "kept": 1}}))
        );
    }

    #[test]
    fn test_diff_null_leaf_regressions() {
        // null treated as a leaf, not an empty subtree
        assert_eq!(
            diff(
                &json!({"svc": {"key": {}}}),
                &json!({"svc": {"key": {"sub": null}}}),
                DeleteMode::Sentinel
            ),
            Some(json!({"svc": {"key": {"sub": null}}}))
        );
        assert_eq!(
            diff(
                &json!({"key": {"sub": null}}),
                &json!({"key": {"sub": [{}]}}),
                DeleteMode::Sentinel
            ),
            Some(json!({"key": {"sub": [{}]}}))
        );
    }

    #[test]
    fn test_round_trip_law() {
        let old = json!({
            "svc1": {"value": 42, "keep": true},
            "svc2": [1, 2],
        });
        let new = json!({
            "svc1": {"value": 43, "keep": true, "fresh": "DELETE"},
            "svc2": [1, 2, 3],
            "svc3": {"x": 1},
        });
        let delta = diff(&old, &new, DeleteMode::Sentinel).unwrap();
        assert_eq!(
            merge(old, delta, DeleteMode::Sentinel),
            normalize(new, DeleteMode::Sentinel)
        );
    }
}
