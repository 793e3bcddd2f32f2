//! Scalar (string/number/boolean/date) three-way merge: last-write-wins
//! by commit timestamp, tie-broken by commit id, per §4.1.

use super::{MergeTieBreak, Value};
use crate::error::Result;

pub fn merge3(a: &Value, b: &Value, tie: &MergeTieBreak) -> Result<Value> {
    Ok(if tie.a_wins() { a.clone() } else { b.clone() })
}
