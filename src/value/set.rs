//! `set<T>` diff/patch/merge3: `(a ∪ b) \ (base \ a) \ (base \ b)` — additions
//! from both sides preserved, deletions on either side honoured.

use std::collections::BTreeMap;

use super::{FieldChange, Value};
use crate::error::{GoatError, Result};

/// Canonical-encoding-keyed multiset used for equality/membership tests,
/// since `Value` isn't `Ord`/`Hash` for arbitrary nested content.
pub fn as_multiset(items: &[Value]) -> BTreeMap<Vec<u8>, Value> {
    items
        .iter()
        .map(|v| {
            let key = crate::commit::canonical::to_canonical_bytes(v)
                .expect("Value always canonicalizes");
            (key, v.clone())
        })
        .collect()
}

fn unwrap_set(v: &Value) -> &[Value] {
    match v {
        Value::Set(items) => items,
        _ => &[],
    }
}

pub fn diff(src: &Value, dst: &Value) -> Vec<FieldChange> {
    let src_set = as_multiset(unwrap_set(src));
    let dst_set = as_multiset(unwrap_set(dst));
    let mut changes = Vec::new();
    for (key, v) in &dst_set {
        if !src_set.contains_key(key) {
            changes.push(FieldChange::SetAdd(v.clone()));
        }
    }
    for (key, v) in &src_set {
        if !dst_set.contains_key(key) {
            changes.push(FieldChange::SetRemove(v.clone()));
        }
    }
    changes
}

pub fn patch(src: &Value, changes: &[FieldChange]) -> Result<Value> {
    let mut set = as_multiset(unwrap_set(src));
    for change in changes {
        match change {
            FieldChange::SetAdd(v) => {
                let key = crate::commit::canonical::to_canonical_bytes(v)?;
                set.insert(key, v.clone());
            }
            FieldChange::SetRemove(v) => {
                let key = crate::commit::canonical::to_canonical_bytes(v)?;
                set.remove(&key);
            }
            FieldChange::Replace(Value::Set(items)) => {
                set = as_multiset(items);
            }
            _ => return Err(GoatError::InvalidPatch),
        }
    }
    Ok(Value::Set(set.into_values().collect()))
}

/// `(a ∪ b) \ (base \ a) \ (base \ b)`.
pub fn merge3(base: &Value, a: &Value, b: &Value) -> Result<Value> {
    let base_set = as_multiset(unwrap_set(base));
    let a_set = as_multiset(unwrap_set(a));
    let b_set = as_multiset(unwrap_set(b));

    let mut result: BTreeMap<Vec<u8>, Value> = a_set.clone();
    for (k, v) in &b_set {
        result.insert(k.clone(), v.clone());
    }

    // deletions honoured on either side: remove anything present in base
    // but dropped by a or by b, unless the other side re-added it.
    for (k, _) in &base_set {
        let removed_by_a = !a_set.contains_key(k);
        let removed_by_b = !b_set.contains_key(k);
        if removed_by_a || removed_by_b {
            result.remove(k);
        }
    }

    Ok(Value::Set(result.into_values().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_of(items: &[&str]) -> Value {
        Value::Set(items.iter().map(|s| Value::String(s.to_string())).collect())
    }

    #[test]
    fn union_merge() {
        let base = set_of(&["a"]);
        let a = set_of(&["a", "b"]);
        let b = set_of(&["a", "c"]);
        let merged = merge3(&base, &a, &b).unwrap();
        let Value::Set(items) = merged else { panic!() };
        let mut names: Vec<_> = items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                _ => unreachable!(),
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn deletion_honoured() {
        let base = set_of(&["a", "b"]);
        let a = set_of(&["a"]); // removed b
        let b = set_of(&["a", "b", "c"]); // added c, kept b
        let merged = merge3(&base, &a, &b).unwrap();
        let Value::Set(items) = merged else { panic!() };
        let mut names: Vec<_> = items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                _ => unreachable!(),
            })
            .collect();
        names.sort();
        // b's removal is honoured even though b's branch kept it — wait,
        // a removed "b", base had "b": removed_by_a is true so it drops,
        // regardless of b keeping it. This matches "deletions honoured".
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn diff_patch_roundtrip() {
        let src = set_of(&["a", "b"]);
        let dst = set_of(&["b", "c"]);
        let changes = diff(&src, &dst);
        let patched = patch(&src, &changes).unwrap();
        assert_eq!(as_multiset(unwrap_set(&patched)), as_multiset(unwrap_set(&dst)));
    }
}
