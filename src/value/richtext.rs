//! Rich text: a node tree (root → paragraphs → leaves with text and
//! formatting marks). Diff/merge treats the document as a linearised
//! character stream and applies classic operational-transform
//! against-rules, then reconciles mark attributes by per-span union.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{FieldChange, Value};
use crate::error::{GoatError, Result};

/// A formatting mark. Free-form tag plus optional value (e.g.
/// `Mark::new("link", Some("https://..."))`, `Mark::new("bold", None)`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mark {
    pub tag: String,
    pub value: Option<String>,
}

impl Mark {
    pub fn new(tag: impl Into<String>, value: Option<String>) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    pub text: String,
    pub marks: BTreeSet<Mark>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    pub leaves: Vec<Leaf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RichText {
    pub paragraphs: Vec<Paragraph>,
}

/// A character in the linearised stream: the paragraph-boundary marker
/// carries no marks and is never merged across.
#[derive(Clone, PartialEq)]
struct Char {
    ch: char,
    marks: BTreeSet<Mark>,
    is_boundary: bool,
}

const BOUNDARY: char = '\u{2029}'; // PARAGRAPH SEPARATOR

impl RichText {
    fn linearise(&self) -> Vec<Char> {
        let mut out = Vec::new();
        for (i, p) in self.paragraphs.iter().enumerate() {
            if i > 0 {
                out.push(Char {
                    ch: BOUNDARY,
                    marks: BTreeSet::new(),
                    is_boundary: true,
                });
            }
            for leaf in &p.leaves {
                for ch in leaf.text.chars() {
                    out.push(Char {
                        ch,
                        marks: leaf.marks.clone(),
                        is_boundary: false,
                    });
                }
            }
        }
        out
    }

    fn from_chars(chars: Vec<Char>) -> RichText {
        let mut paragraphs = Vec::new();
        let mut leaves: Vec<Leaf> = Vec::new();
        for c in chars {
            if c.is_boundary {
                paragraphs.push(Paragraph {
                    leaves: std::mem::take(&mut leaves),
                });
                continue;
            }
            if let Some(last) = leaves.last_mut() {
                if last.marks == c.marks {
                    last.text.push(c.ch);
                    continue;
                }
            }
            let mut marks = BTreeSet::new();
            marks.extend(c.marks.iter().cloned());
            leaves.push(Leaf {
                text: c.ch.to_string(),
                marks,
            });
        }
        paragraphs.push(Paragraph { leaves });
        RichText { paragraphs }
    }
}

/// Operational-transform op over the linearised stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RichTextOp {
    Insert {
        pos: usize,
        ch: char,
        marks: BTreeSet<Mark>,
    },
    Delete {
        pos: usize,
    },
}

/// Minimal common-prefix/common-suffix diff; sufficient for the CRDT
/// convergence properties §8 tests (it need not be a minimal edit script).
fn diff_chars(src: &[Char], dst: &[Char]) -> Vec<RichTextOp> {
    let mut prefix = 0;
    while prefix < src.len() && prefix < dst.len() && src[prefix].ch == dst[prefix].ch {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < src.len() - prefix
        && suffix < dst.len() - prefix
        && src[src.len() - 1 - suffix].ch == dst[dst.len() - 1 - suffix].ch
    {
        suffix += 1;
    }

    let mut ops = Vec::new();
    let del_count = src.len() - prefix - suffix;
    for i in 0..del_count {
        // deletes always target `prefix`: once a char is removed, the
        // next char to delete shifts into that position.
        let _ = i;
        ops.push(RichTextOp::Delete { pos: prefix });
    }
    for (offset, c) in dst[prefix..dst.len() - suffix].iter().enumerate() {
        ops.push(RichTextOp::Insert {
            pos: prefix + offset,
            ch: c.ch,
            marks: c.marks.clone(),
        });
    }
    ops
}

pub fn diff(src: &RichText, dst: &RichText) -> Vec<FieldChange> {
    diff_chars(&src.linearise(), &dst.linearise())
        .into_iter()
        .map(FieldChange::RichTextOp)
        .collect()
}

fn apply_ops(base: &[Char], ops: &[RichTextOp]) -> Vec<Char> {
    let mut out = base.to_vec();
    for op in ops {
        match op {
            RichTextOp::Insert { pos, ch, marks } => {
                let pos = (*pos).min(out.len());
                out.insert(
                    pos,
                    Char {
                        ch: *ch,
                        marks: marks.clone(),
                        is_boundary: *ch == BOUNDARY,
                    },
                );
            }
            RichTextOp::Delete { pos } => {
                if *pos < out.len() {
                    out.remove(*pos);
                }
            }
        }
    }
    out
}

pub fn patch(src: &RichText, changes: &[FieldChange]) -> Result<Value> {
    let mut chars = src.linearise();
    for change in changes {
        match change {
            FieldChange::RichTextOp(op) => {
                chars = apply_ops(&chars, std::slice::from_ref(op));
            }
            FieldChange::Replace(Value::RichText(rt)) => {
                return Ok(Value::RichText(rt.clone()));
            }
            _ => return Err(GoatError::InvalidPatch),
        }
    }
    Ok(Value::RichText(RichText::from_chars(chars)))
}

/// The base-index span `other` changed relative to `base` (a common
/// prefix/suffix trim, two-way), plus `other`'s replacement content for
/// that span. An unchanged branch yields an empty, zero-width span.
struct EditRegion {
    start: usize,
    end: usize,
    replacement: Vec<Char>,
}

fn edit_region(base: &[Char], other: &[Char]) -> EditRegion {
    let mut prefix = 0;
    while prefix < base.len() && prefix < other.len() && base[prefix].ch == other[prefix].ch {
        prefix += 1;
    }
    let bound = (base.len() - prefix).min(other.len() - prefix);
    let mut suffix = 0;
    while suffix < bound
        && base[base.len() - 1 - suffix].ch == other[other.len() - 1 - suffix].ch
    {
        suffix += 1;
    }
    EditRegion {
        start: prefix,
        end: base.len() - suffix,
        replacement: other[prefix..other.len() - suffix].to_vec(),
    }
}

/// Three-way merge over the linearised stream: compute each branch's
/// edit region against `base` independently (per §4.1, diffing each
/// branch against base as a sequence of insert/delete spans), then
/// splice both regions into `base`. Disjoint regions apply independently
/// — this is what makes non-conflicting concurrent edits converge.
/// Overlapping regions have no clean resolution; both replacements are
/// kept, `a` before `b`, so the merge stays deterministic.
fn splice_merge(base: &[Char], a: &[Char], b: &[Char]) -> Vec<Char> {
    let ra = edit_region(base, a);
    let rb = edit_region(base, b);

    let disjoint = ra.end <= rb.start || rb.end <= ra.start;
    let (lo, hi, combined): (usize, usize, Vec<Char>) = if disjoint {
        // Apply independently: walk `base`, splicing each region's
        // replacement in at its start and skipping the replaced span.
        let mut merged = Vec::with_capacity(base.len());
        let mut i = 0;
        while i <= base.len() {
            if i == ra.start {
                merged.extend(ra.replacement.iter().cloned());
            }
            if i == rb.start {
                merged.extend(rb.replacement.iter().cloned());
            }
            if i == base.len() {
                break;
            }
            if i >= ra.start && i < ra.end {
                i = ra.end;
                continue;
            }
            if i >= rb.start && i < rb.end {
                i = rb.end;
                continue;
            }
            merged.push(base[i].clone());
            i += 1;
        }
        return merged;
    } else {
        let lo = ra.start.min(rb.start);
        let hi = ra.end.max(rb.end);
        let mut combined = ra.replacement.clone();
        combined.extend(rb.replacement.iter().cloned());
        (lo, hi, combined)
    };

    let mut merged: Vec<Char> = base[..lo].to_vec();
    merged.extend(combined);
    merged.extend(base[hi..].to_vec());
    merged
}

pub fn merge3(base: &RichText, a: &RichText, b: &RichText) -> Result<Value> {
    let base_chars = base.linearise();
    let a_chars = a.linearise();
    let b_chars = b.linearise();

    let merged_chars = splice_merge(&base_chars, &a_chars, &b_chars);

    // Reconcile mark attributes: for any text position that exists in
    // both `a` and `b` unchanged relative to base, union their marks.
    let merged_chars = reconcile_marks(&base_chars, &a_chars, &b_chars, merged_chars);

    Ok(Value::RichText(RichText::from_chars(merged_chars)))
}

/// Per-span mark union: positions whose character appears in both `a`'s
/// and `b`'s mark maps (keyed by character identity in the base stream)
/// get the union of marks from both branches.
fn reconcile_marks(base: &[Char], a: &[Char], b: &[Char], mut merged: Vec<Char>) -> Vec<Char> {
    let base_marks: std::collections::HashMap<char, &BTreeSet<Mark>> =
        base.iter().map(|c| (c.ch, &c.marks)).collect();
    let a_marks: std::collections::HashMap<char, &BTreeSet<Mark>> =
        a.iter().map(|c| (c.ch, &c.marks)).collect();
    let b_marks: std::collections::HashMap<char, &BTreeSet<Mark>> =
        b.iter().map(|c| (c.ch, &c.marks)).collect();

    for c in merged.iter_mut() {
        if c.is_boundary {
            continue;
        }
        let changed_in_a = a_marks.get(&c.ch).map(|m| *m) != base_marks.get(&c.ch).map(|m| *m);
        let changed_in_b = b_marks.get(&c.ch).map(|m| *m) != base_marks.get(&c.ch).map(|m| *m);
        if changed_in_a || changed_in_b {
            let mut union = BTreeSet::new();
            if let Some(m) = a_marks.get(&c.ch) {
                union.extend((*m).iter().cloned());
            }
            if let Some(m) = b_marks.get(&c.ch) {
                union.extend((*m).iter().cloned());
            }
            c.marks = union;
        }
    }
    merged
}
