//! Operational transform over a linear text buffer.
//!
//! An [`Operation`] is an ordered list of segments (retain / insert / delete)
//! describing one edit against a document at a known base revision. Indices
//! count Unicode scalar values, not bytes.
//!
//! ```text
//! base:    "hello world"
//! op:      retain(6) · delete(5) · insert("tandem")
//! result:  "hello tandem"
//! ```
//!
//! Two operations generated against the same base can be reconciled with
//! [`Operation::transform`], which satisfies the TP1 convergence property:
//! applying `a` then `b'` yields the same text as applying `b` then `a'`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One segment of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpSeg {
    /// Keep the next `n` scalar values unchanged.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` scalar values.
    Delete(usize),
}

/// An edit against a text buffer at a known base revision.
///
/// Segments are kept normalized: no zero-length segments, and adjacent
/// segments of the same kind are merged on construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    segs: Vec<OpSeg>,
}

/// Transform / apply errors.
#[derive(Debug, Clone)]
pub enum OtError {
    /// Operation base length does not match the document length.
    LengthMismatch { expected: usize, got: usize },
    /// `compose(a, b)` called where `a.target_len() != b.base_len()`.
    ComposeMismatch { left_target: usize, right_base: usize },
    /// `transform(a, b)` called on operations with different base lengths.
    TransformMismatch { left_base: usize, right_base: usize },
}

impl std::fmt::Display for OtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OtError::LengthMismatch { expected, got } => {
                write!(f, "Operation expects base length {expected}, document has {got}")
            }
            OtError::ComposeMismatch { left_target, right_base } => {
                write!(f, "Cannot compose: left target length {left_target} != right base length {right_base}")
            }
            OtError::TransformMismatch { left_base, right_base } => {
                write!(f, "Cannot transform: base lengths differ ({left_base} vs {right_base})")
            }
        }
    }
}

impl std::error::Error for OtError {}

/// Split a string at a scalar-value index.
fn char_split(s: &str, at_chars: usize) -> (String, String) {
    let byte_idx = s
        .char_indices()
        .nth(at_chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    (s[..byte_idx].to_string(), s[byte_idx..].to_string())
}

impl Operation {
    /// Create an empty operation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity operation over a document of `len` scalar values.
    pub fn noop(len: usize) -> Self {
        Self::new().retain(len)
    }

    /// Append a retain segment (builder style).
    pub fn retain(mut self, n: usize) -> Self {
        self.push_retain(n);
        self
    }

    /// Append an insert segment (builder style).
    pub fn insert(mut self, text: impl AsRef<str>) -> Self {
        self.push_insert(text.as_ref());
        self
    }

    /// Append a delete segment (builder style).
    pub fn delete(mut self, n: usize) -> Self {
        self.push_delete(n);
        self
    }

    fn push_retain(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(OpSeg::Retain(last)) = self.segs.last_mut() {
            *last += n;
        } else {
            self.segs.push(OpSeg::Retain(n));
        }
    }

    fn push_insert(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(OpSeg::Insert(last)) = self.segs.last_mut() {
            last.push_str(text);
        } else {
            self.segs.push(OpSeg::Insert(text.to_string()));
        }
    }

    fn push_delete(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(OpSeg::Delete(last)) = self.segs.last_mut() {
            *last += n;
        } else {
            self.segs.push(OpSeg::Delete(n));
        }
    }

    /// The segments of this operation.
    pub fn segments(&self) -> &[OpSeg] {
        &self.segs
    }

    /// Length of the document this operation applies to (retain + delete).
    pub fn base_len(&self) -> usize {
        self.segs
            .iter()
            .map(|s| match s {
                OpSeg::Retain(n) | OpSeg::Delete(n) => *n,
                OpSeg::Insert(_) => 0,
            })
            .sum()
    }

    /// Length of the document after applying this operation (retain + insert).
    pub fn target_len(&self) -> usize {
        self.segs
            .iter()
            .map(|s| match s {
                OpSeg::Retain(n) => *n,
                OpSeg::Insert(t) => t.chars().count(),
                OpSeg::Delete(_) => 0,
            })
            .sum()
    }

    /// Whether the operation changes nothing (retains only, or empty).
    pub fn is_noop(&self) -> bool {
        self.segs
            .iter()
            .all(|s| matches!(s, OpSeg::Retain(_)))
    }

    /// Apply this operation to `content`, producing the new text.
    ///
    /// Fails with [`OtError::LengthMismatch`] when the operation's base
    /// length does not cover `content` exactly.
    pub fn apply(&self, content: &str) -> Result<String, OtError> {
        let content_len = content.chars().count();
        if self.base_len() != content_len {
            return Err(OtError::LengthMismatch {
                expected: self.base_len(),
                got: content_len,
            });
        }

        let mut out = String::with_capacity(content.len());
        let mut chars = content.chars();
        for seg in &self.segs {
            match seg {
                OpSeg::Retain(n) => {
                    for _ in 0..*n {
                        // base_len was checked above; the iterator cannot
                        // run dry here.
                        if let Some(c) = chars.next() {
                            out.push(c);
                        }
                    }
                }
                OpSeg::Insert(text) => out.push_str(text),
                OpSeg::Delete(n) => {
                    for _ in 0..*n {
                        chars.next();
                    }
                }
            }
        }
        Ok(out)
    }

    /// Merge two sequential operations into one equivalent operation.
    ///
    /// `apply(apply(s, a), b) == apply(s, a.compose(b))`. Used to collapse a
    /// burst of rapid edits before transforming against them.
    pub fn compose(&self, other: &Operation) -> Result<Operation, OtError> {
        if self.target_len() != other.base_len() {
            return Err(OtError::ComposeMismatch {
                left_target: self.target_len(),
                right_base: other.base_len(),
            });
        }

        let mut result = Operation::new();
        let mut qa: VecDeque<OpSeg> = self.segs.iter().cloned().collect();
        let mut qb: VecDeque<OpSeg> = other.segs.iter().cloned().collect();
        let mut a = qa.pop_front();
        let mut b = qb.pop_front();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                // Deletes from the first operation pass through untouched.
                (Some(OpSeg::Delete(n)), ob) => {
                    result.push_delete(n);
                    a = qa.pop_front();
                    b = ob;
                }
                // Inserts from the second operation pass through untouched.
                (oa, Some(OpSeg::Insert(text))) => {
                    result.push_insert(&text);
                    a = oa;
                    b = qb.pop_front();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::ComposeMismatch {
                        left_target: self.target_len(),
                        right_base: other.base_len(),
                    });
                }
                (Some(OpSeg::Retain(n)), Some(OpSeg::Retain(m))) => {
                    let k = n.min(m);
                    result.push_retain(k);
                    a = leftover_retain(n - k, &mut qa);
                    b = leftover_retain(m - k, &mut qb);
                }
                (Some(OpSeg::Retain(n)), Some(OpSeg::Delete(m))) => {
                    let k = n.min(m);
                    result.push_delete(k);
                    a = leftover_retain(n - k, &mut qa);
                    b = leftover_delete(m - k, &mut qb);
                }
                (Some(OpSeg::Insert(text)), Some(OpSeg::Retain(m))) => {
                    let n = text.chars().count();
                    if n <= m {
                        result.push_insert(&text);
                        a = qa.pop_front();
                        b = leftover_retain(m - n, &mut qb);
                    } else {
                        let (head, tail) = char_split(&text, m);
                        result.push_insert(&head);
                        a = Some(OpSeg::Insert(tail));
                        b = qb.pop_front();
                    }
                }
                (Some(OpSeg::Insert(text)), Some(OpSeg::Delete(m))) => {
                    // Inserted-then-deleted text cancels out entirely.
                    let n = text.chars().count();
                    if n <= m {
                        a = qa.pop_front();
                        b = leftover_delete(m - n, &mut qb);
                    } else {
                        let (_, tail) = char_split(&text, m);
                        a = Some(OpSeg::Insert(tail));
                        b = qb.pop_front();
                    }
                }
            }
        }

        Ok(result)
    }

    /// Transform two operations generated against the same base.
    ///
    /// Returns `(a', b')` such that `apply(apply(base, a), b') ==
    /// apply(apply(base, b), a')`. When both insert at the same position,
    /// `a`'s insert takes the left position; callers pass the
    /// earlier-accepted operation first so the tie-break is acceptance order
    /// at the document's sequencer, identical on every replica.
    pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
        if a.base_len() != b.base_len() {
            return Err(OtError::TransformMismatch {
                left_base: a.base_len(),
                right_base: b.base_len(),
            });
        }

        let mut a_prime = Operation::new();
        let mut b_prime = Operation::new();
        let mut qa: VecDeque<OpSeg> = a.segs.iter().cloned().collect();
        let mut qb: VecDeque<OpSeg> = b.segs.iter().cloned().collect();
        let mut sa = qa.pop_front();
        let mut sb = qb.pop_front();

        loop {
            match (sa.take(), sb.take()) {
                (None, None) => break,
                // a's insert wins the left position on ties.
                (Some(OpSeg::Insert(text)), ob) => {
                    let n = text.chars().count();
                    a_prime.push_insert(&text);
                    b_prime.push_retain(n);
                    sa = qa.pop_front();
                    sb = ob;
                }
                (oa, Some(OpSeg::Insert(text))) => {
                    let n = text.chars().count();
                    a_prime.push_retain(n);
                    b_prime.push_insert(&text);
                    sa = oa;
                    sb = qb.pop_front();
                }
                (None, Some(_)) | (Some(_), None) => {
                    return Err(OtError::TransformMismatch {
                        left_base: a.base_len(),
                        right_base: b.base_len(),
                    });
                }
                (Some(OpSeg::Retain(n)), Some(OpSeg::Retain(m))) => {
                    let k = n.min(m);
                    a_prime.push_retain(k);
                    b_prime.push_retain(k);
                    sa = leftover_retain(n - k, &mut qa);
                    sb = leftover_retain(m - k, &mut qb);
                }
                (Some(OpSeg::Delete(n)), Some(OpSeg::Delete(m))) => {
                    // Both sides deleted the same range; nothing left to do.
                    let k = n.min(m);
                    sa = leftover_delete(n - k, &mut qa);
                    sb = leftover_delete(m - k, &mut qb);
                }
                (Some(OpSeg::Delete(n)), Some(OpSeg::Retain(m))) => {
                    let k = n.min(m);
                    a_prime.push_delete(k);
                    sa = leftover_delete(n - k, &mut qa);
                    sb = leftover_retain(m - k, &mut qb);
                }
                (Some(OpSeg::Retain(n)), Some(OpSeg::Delete(m))) => {
                    let k = n.min(m);
                    b_prime.push_delete(k);
                    sa = leftover_retain(n - k, &mut qa);
                    sb = leftover_delete(m - k, &mut qb);
                }
            }
        }

        Ok((a_prime, b_prime))
    }
}

fn leftover_retain(rest: usize, queue: &mut VecDeque<OpSeg>) -> Option<OpSeg> {
    if rest > 0 {
        Some(OpSeg::Retain(rest))
    } else {
        queue.pop_front()
    }
}

fn leftover_delete(rest: usize, queue: &mut VecDeque<OpSeg>) -> Option<OpSeg> {
    if rest > 0 {
        Some(OpSeg::Delete(rest))
    } else {
        queue.pop_front()
    }
}

/// Derive the minimal retain/delete/insert operation turning `before` into
/// `after` via common prefix/suffix trimming.
///
/// Used by the merge hook to express a CRDT-derived text change as a
/// canonical operation.
pub fn diff_operation(before: &str, after: &str) -> Operation {
    let before_chars: Vec<char> = before.chars().collect();
    let after_chars: Vec<char> = after.chars().collect();

    let mut prefix = 0;
    while prefix < before_chars.len()
        && prefix < after_chars.len()
        && before_chars[prefix] == after_chars[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < before_chars.len() - prefix
        && suffix < after_chars.len() - prefix
        && before_chars[before_chars.len() - 1 - suffix] == after_chars[after_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let deleted = before_chars.len() - prefix - suffix;
    let inserted: String = after_chars[prefix..after_chars.len() - suffix].iter().collect();

    Operation::new()
        .retain(prefix)
        .delete(deleted)
        .insert(inserted)
        .retain(suffix)
}
