//! `map<string,V>` diff/patch/merge3: per-key three-way merge using the
//! inner type's `merge3`; insertions from both sides preserved, deletions
//! honoured.

use std::collections::BTreeMap;

use super::{FieldChange, MergeTieBreak, Value};
use crate::error::{GoatError, Result};

pub fn diff(src: &BTreeMap<String, Value>, dst: &BTreeMap<String, Value>) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for (k, v) in dst {
        match src.get(k) {
            Some(sv) if sv.equals(v) => {}
            _ => changes.push(FieldChange::MapSet(k.clone(), v.clone())),
        }
    }
    for k in src.keys() {
        if !dst.contains_key(k) {
            changes.push(FieldChange::MapRemove(k.clone()));
        }
    }
    changes
}

pub fn patch(src: &BTreeMap<String, Value>, changes: &[FieldChange]) -> Result<Value> {
    let mut map = src.clone();
    for change in changes {
        match change {
            FieldChange::MapSet(k, v) => {
                map.insert(k.clone(), v.clone());
            }
            FieldChange::MapRemove(k) => {
                map.remove(k);
            }
            FieldChange::Replace(Value::Map(m)) => {
                map = m.clone();
            }
            _ => return Err(GoatError::InvalidPatch),
        }
    }
    Ok(Value::Map(map))
}

pub fn merge3(
    base: &BTreeMap<String, Value>,
    a: &BTreeMap<String, Value>,
    b: &BTreeMap<String, Value>,
    tie: &MergeTieBreak,
) -> Result<Value> {
    let mut keys: std::collections::BTreeSet<&String> = std::collections::BTreeSet::new();
    keys.extend(base.keys());
    keys.extend(a.keys());
    keys.extend(b.keys());

    let mut result = BTreeMap::new();
    for k in keys {
        let base_v = base.get(k);
        let a_v = a.get(k);
        let b_v = b.get(k);

        match (base_v, a_v, b_v) {
            // present nowhere interesting (shouldn't happen, key came from somewhere)
            (None, None, None) => {}
            // both branches deleted, or one deleted and other unchanged from base
            (Some(bv), None, None) => {
                let _ = bv;
                // deleted on both sides
            }
            (Some(bv), None, Some(bval)) => {
                if bval.equals(bv) {
                    // a deleted, b unchanged -> honour deletion
                } else {
                    result.insert(k.clone(), bval.clone());
                }
            }
            (Some(bv), Some(aval), None) => {
                if aval.equals(bv) {
                    // b deleted, a unchanged -> honour deletion
                } else {
                    result.insert(k.clone(), aval.clone());
                }
            }
            (None, Some(aval), None) => {
                result.insert(k.clone(), aval.clone());
            }
            (None, None, Some(bval)) => {
                result.insert(k.clone(), bval.clone());
            }
            (None, Some(aval), Some(bval)) => {
                let merged = Value::merge3(&placeholder(aval), aval, bval, tie)
                    .unwrap_or_else(|_| if tie.a_wins() { aval.clone() } else { bval.clone() });
                result.insert(k.clone(), merged);
            }
            (Some(bv), Some(aval), Some(bval)) => {
                let merged = Value::merge3(bv, aval, bval, tie)?;
                result.insert(k.clone(), merged);
            }
        }
    }

    Ok(Value::Map(result))
}

/// When a key has no base value (both sides independently introduced it),
/// there's no common ancestor to merge against; we treat it as if the
/// base were equal to `a` so `merge3` degenerates to "pick by policy"
/// instead of erroring.
fn placeholder(a: &Value) -> Value {
    a.clone()
}
