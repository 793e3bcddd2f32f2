//! Typed field values: equality, diff/patch, checksum, and three-way merge
//! per type, per §4.1.

mod map;
mod richtext;
mod scalar;
mod set;

pub use richtext::{Mark, RichText, RichTextOp};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GoatError, Result};

/// A tagged value of one type from the closed set the spec names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    String(String),
    Number(f64),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    RichText(RichText),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Boolean(_) => "boolean",
            Value::Date(_) => "date",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::RichText(_) => "richtext",
        }
    }

    /// Structural equality, per §4.1 `equals(a,b)`.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Set(a), Value::Set(b)) => set::as_multiset(a) == set::as_multiset(b),
            _ => self == other,
        }
    }

    /// Deterministic 64-bit checksum over the canonical encoding, stable
    /// across platforms for the same canonical encoding.
    pub fn checksum(&self) -> u64 {
        let canon = crate::commit::canonical::to_canonical_bytes(self)
            .expect("Value always canonicalizes");
        let hash = blake3::hash(&canon);
        let bytes = hash.as_bytes();
        u64::from_le_bytes(bytes[0..8].try_into().unwrap())
    }

    /// Produces a compact operation list that `patch` can apply to turn
    /// `src` into `dst`. A no-op diff is the empty list.
    pub fn diff(src: &Value, dst: &Value) -> Vec<FieldChange> {
        if src.equals(dst) {
            return Vec::new();
        }
        match (src, dst) {
            (Value::Set(_), Value::Set(_)) => set::diff(src, dst),
            (Value::Map(a), Value::Map(b)) => map::diff(a, b),
            (Value::RichText(a), Value::RichText(b)) => richtext::diff(a, b),
            _ => vec![FieldChange::Replace(dst.clone())],
        }
    }

    /// Applies `changes` to `src`, producing the value they describe.
    /// Must satisfy `patch(src, diff(src, dst)) == dst`.
    pub fn patch(src: &Value, changes: &[FieldChange]) -> Result<Value> {
        if changes.is_empty() {
            return Ok(src.clone());
        }
        match src {
            Value::Set(_) => set::patch(src, changes),
            Value::Map(a) => map::patch(a, changes),
            Value::RichText(a) => richtext::patch(a, changes),
            _ => match changes {
                [FieldChange::Replace(v)] => Ok(v.clone()),
                _ => Err(GoatError::InvalidPatch),
            },
        }
    }

    /// Three-way merge per the type-specific policy in §4.1. `tie` breaks
    /// scalar last-write-wins ties (by commit timestamp, then commit id).
    pub fn merge3(base: &Value, a: &Value, b: &Value, tie: &MergeTieBreak) -> Result<Value> {
        if a.equals(b) {
            return Ok(a.clone());
        }
        if a.equals(base) {
            return Ok(b.clone());
        }
        if b.equals(base) {
            return Ok(a.clone());
        }
        match (base, a, b) {
            (Value::Set(_), Value::Set(_), Value::Set(_)) => set::merge3(base, a, b),
            (Value::Map(base_m), Value::Map(a_m), Value::Map(b_m)) => {
                map::merge3(base_m, a_m, b_m, tie)
            }
            (Value::RichText(base_r), Value::RichText(a_r), Value::RichText(b_r)) => {
                richtext::merge3(base_r, a_r, b_r)
            }
            _ => scalar::merge3(a, b, tie),
        }
    }
}

/// Tie-break context for scalar last-write-wins: the timestamp and commit
/// id of each branch being merged. Swapping `a`/`b` and re-running must
/// produce the same winner (commutativity), which is why `a_wins` is
/// defined symmetrically rather than favouring either side.
#[derive(Debug, Clone)]
pub struct MergeTieBreak {
    pub a_timestamp: i64,
    pub a_commit_id: String,
    pub b_timestamp: i64,
    pub b_commit_id: String,
}

impl MergeTieBreak {
    pub fn new(
        a_timestamp: i64,
        a_commit_id: impl Into<String>,
        b_timestamp: i64,
        b_commit_id: impl Into<String>,
    ) -> Self {
        Self {
            a_timestamp,
            a_commit_id: a_commit_id.into(),
            b_timestamp,
            b_commit_id: b_commit_id.into(),
        }
    }

    /// `true` if branch `a` should win the tie-break.
    pub fn a_wins(&self) -> bool {
        match self.a_timestamp.cmp(&self.b_timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.a_commit_id < self.b_commit_id,
        }
    }

    /// The same tie-break with the two sides swapped; used to prove
    /// `merge3(base, a, b) == merge3(base, b, a)`.
    pub fn swapped(&self) -> Self {
        Self {
            a_timestamp: self.b_timestamp,
            a_commit_id: self.b_commit_id.clone(),
            b_timestamp: self.a_timestamp,
            b_commit_id: self.a_commit_id.clone(),
        }
    }
}

/// A single field-level change produced by `diff` and consumed by `patch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldChange {
    /// Wholesale replacement (scalars, or a type-changing write).
    Replace(Value),
    /// Set insertion of an element.
    SetAdd(Value),
    /// Set removal of an element.
    SetRemove(Value),
    /// Map key insertion or replacement.
    MapSet(String, Value),
    /// Map key removal.
    MapRemove(String),
    /// Richtext operational-transform op.
    RichTextOp(RichTextOp),
    /// A whole item field was removed (§4.2). Handled by `Item::patch`
    /// directly, never reaching `Value::patch` — there is no value left
    /// on the destination side to dispatch on.
    Remove,
}
