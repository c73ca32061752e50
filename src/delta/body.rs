//! Plain-text OT algebra for the document body.
//!
//! A [`BodyDelta`] is a run of [`BodyOp`]s — `Retain(n)`, `Insert(s)`,
//! `Delete(n)` — over character counts, with an implicit trailing retain
//! to the end of the base. A delta consisting only of inserts is a
//! document (the full text); the empty delta is the empty document.
//!
//! Compose and transform use the standard two-cursor sweep: ops are
//! consumed in lockstep slices, with an exhausted side treated as an
//! infinite retain. Normalization merges adjacent same-kind ops, drops
//! zero-length ops, and chops trailing retains, so equal effects encode
//! identically and `PartialEq` is semantic equality.

use serde::{Deserialize, Serialize};

use super::Delta;
use crate::error::{ControlError, Result};

/// One body edit operation. Counts are in characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyOp {
    /// Keep the next `n` characters of the base.
    Retain(u64),
    /// Insert the given text at the current position.
    Insert(String),
    /// Remove the next `n` characters of the base.
    Delete(u64),
}

impl BodyOp {
    fn len(&self) -> u64 {
        match self {
            BodyOp::Retain(n) | BodyOp::Delete(n) => *n,
            BodyOp::Insert(s) => s.chars().count() as u64,
        }
    }
}

/// A normalized run of body ops.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BodyDelta {
    ops: Vec<BodyOp>,
}

impl BodyDelta {
    /// Fluent construction; ops are merged and normalized on `build`.
    pub fn builder() -> BodyDeltaBuilder {
        BodyDeltaBuilder { sink: OpSink::new() }
    }

    /// A document delta holding exactly `text`.
    pub fn document(text: &str) -> Self {
        let mut sink = OpSink::new();
        sink.insert(text);
        sink.finish()
    }

    /// The ops of this delta.
    pub fn ops(&self) -> &[BodyOp] {
        &self.ops
    }

    /// Characters of base state this delta consumes (retains + deletes).
    pub fn base_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                BodyOp::Retain(n) | BodyOp::Delete(n) => *n,
                BodyOp::Insert(_) => 0,
            })
            .sum()
    }

    /// Characters of result state this delta produces (retains + inserts).
    pub fn target_len(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                BodyOp::Retain(n) => *n,
                BodyOp::Insert(s) => s.chars().count() as u64,
                BodyOp::Delete(_) => 0,
            })
            .sum()
    }

    /// The full text of a document delta.
    pub fn text(&self) -> Result<String> {
        if !self.is_document() {
            return Err(ControlError::bad_value(
                "text() requires a document delta",
            ));
        }
        let mut out = String::new();
        for op in &self.ops {
            if let BodyOp::Insert(s) = op {
                out.push_str(s);
            }
        }
        Ok(out)
    }
}

impl Delta for BodyDelta {
    fn empty() -> Self {
        Self { ops: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, BodyOp::Insert(_)))
    }

    fn compose(&self, other: &Self) -> Result<Self> {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = OpSink::new();

        while a.has_next() || b.has_next() {
            if b.peek_is_insert() {
                out.push(b.next_slice(b.peek_len()));
            } else if a.peek_is_delete() {
                out.push(a.next_slice(a.peek_len()));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let a_op = a.next_slice(len);
                let b_op = b.next_slice(len);
                match b_op {
                    // Retain over whatever `self` produced here.
                    BodyOp::Retain(_) => out.push(a_op),
                    BodyOp::Delete(n) => {
                        // Deleting retained base survives; deleting
                        // freshly inserted text cancels out.
                        if matches!(a_op, BodyOp::Retain(_)) {
                            out.delete(n);
                        }
                    }
                    BodyOp::Insert(_) => unreachable!("inserts handled above"),
                }
            }
        }
        Ok(out.finish())
    }

    fn transform(&self, other: &Self, self_first: bool) -> Result<Self> {
        let mut a = OpCursor::new(&self.ops);
        let mut b = OpCursor::new(&other.ops);
        let mut out = OpSink::new();

        while a.has_next() || b.has_next() {
            if a.peek_is_insert() && (self_first || !b.peek_is_insert()) {
                // `self` inserted here first: step over it.
                out.retain(a.peek_len());
                a.next_slice(a.peek_len());
            } else if b.peek_is_insert() {
                out.push(b.next_slice(b.peek_len()));
            } else {
                let len = a.peek_len().min(b.peek_len());
                let a_op = a.next_slice(len);
                let b_op = b.next_slice(len);
                match (a_op, b_op) {
                    // Base text `self` deleted is gone; drop `other`'s op.
                    (BodyOp::Delete(_), _) => {}
                    (_, BodyOp::Delete(n)) => out.delete(n),
                    _ => out.retain(len),
                }
            }
        }
        Ok(out.finish())
    }

    fn diff(&self, other: &Self) -> Result<Self> {
        if !self.is_document() || !other.is_document() {
            return Err(ControlError::bad_value(
                "diff requires two document deltas",
            ));
        }
        let a: Vec<char> = self.text()?.chars().collect();
        let b: Vec<char> = other.text()?.chars().collect();

        let mut prefix = 0;
        while prefix < a.len() && prefix < b.len() && a[prefix] == b[prefix] {
            prefix += 1;
        }
        let mut suffix = 0;
        while suffix < a.len() - prefix
            && suffix < b.len() - prefix
            && a[a.len() - 1 - suffix] == b[b.len() - 1 - suffix]
        {
            suffix += 1;
        }

        let mut out = OpSink::new();
        out.retain(prefix as u64);
        let inserted: String = b[prefix..b.len() - suffix].iter().collect();
        out.insert(&inserted);
        out.delete((a.len() - prefix - suffix) as u64);
        Ok(out.finish())
    }

    fn invert(&self, base: &Self) -> Result<Self> {
        if !base.is_document() {
            return Err(ControlError::bad_value(
                "invert requires a document base",
            ));
        }
        let base_chars: Vec<char> = base.text()?.chars().collect();
        let mut pos: usize = 0;
        let mut out = OpSink::new();

        for op in &self.ops {
            match op {
                BodyOp::Retain(n) => {
                    out.retain(*n);
                    pos += *n as usize;
                }
                BodyOp::Insert(s) => {
                    out.delete(s.chars().count() as u64);
                }
                BodyOp::Delete(n) => {
                    let end = pos + *n as usize;
                    if end > base_chars.len() {
                        return Err(ControlError::bad_value(
                            "delta reaches past the end of its base",
                        ));
                    }
                    let restored: String = base_chars[pos..end].iter().collect();
                    out.insert(&restored);
                    pos = end;
                }
            }
        }
        Ok(out.finish())
    }
}

/// Builder for [`BodyDelta`].
pub struct BodyDeltaBuilder {
    sink: OpSink,
}

impl BodyDeltaBuilder {
    /// Append a retain.
    pub fn retain(mut self, n: u64) -> Self {
        self.sink.retain(n);
        self
    }

    /// Append an insert.
    pub fn insert(mut self, s: &str) -> Self {
        self.sink.insert(s);
        self
    }

    /// Append a delete.
    pub fn delete(mut self, n: u64) -> Self {
        self.sink.delete(n);
        self
    }

    /// Normalize and finish.
    pub fn build(self) -> BodyDelta {
        self.sink.finish()
    }
}

/// Accumulates ops with adjacent-merge; `finish` chops trailing retains.
struct OpSink {
    ops: Vec<BodyOp>,
}

impl OpSink {
    fn new() -> Self {
        Self { ops: Vec::new() }
    }

    fn retain(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(BodyOp::Retain(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(BodyOp::Retain(n));
        }
    }

    fn insert(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if let Some(BodyOp::Insert(last)) = self.ops.last_mut() {
            last.push_str(s);
        } else {
            self.ops.push(BodyOp::Insert(s.to_string()));
        }
    }

    fn delete(&mut self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(BodyOp::Delete(last)) = self.ops.last_mut() {
            *last += n;
        } else {
            self.ops.push(BodyOp::Delete(n));
        }
    }

    fn push(&mut self, op: BodyOp) {
        match op {
            BodyOp::Retain(n) => self.retain(n),
            BodyOp::Insert(s) => self.insert(&s),
            BodyOp::Delete(n) => self.delete(n),
        }
    }

    fn finish(mut self) -> BodyDelta {
        while matches!(self.ops.last(), Some(BodyOp::Retain(_))) {
            self.ops.pop();
        }
        BodyDelta { ops: self.ops }
    }
}

/// Cursor over an op run, yielding arbitrary-length slices. An
/// exhausted cursor reads as an infinite retain.
struct OpCursor<'a> {
    ops: &'a [BodyOp],
    index: usize,
    /// Characters of `ops[index]` already consumed.
    offset: u64,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [BodyOp]) -> Self {
        let mut cursor = Self { ops, index: 0, offset: 0 };
        cursor.skip_empty();
        cursor
    }

    /// Step past zero-length ops so the sweep always makes progress,
    /// even on unnormalized decoded input.
    fn skip_empty(&mut self) {
        while self
            .ops
            .get(self.index)
            .is_some_and(|op| op.len() - self.offset == 0)
        {
            self.index += 1;
            self.offset = 0;
        }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> u64 {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => u64::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        matches!(self.ops.get(self.index), Some(BodyOp::Insert(_)))
    }

    fn peek_is_delete(&self) -> bool {
        matches!(self.ops.get(self.index), Some(BodyOp::Delete(_)))
    }

    /// Take up to `len` characters from the current op.
    fn next_slice(&mut self, len: u64) -> BodyOp {
        let Some(op) = self.ops.get(self.index) else {
            return BodyOp::Retain(len);
        };
        let available = op.len() - self.offset;
        let take = len.min(available);
        let out = match op {
            BodyOp::Retain(_) => BodyOp::Retain(take),
            BodyOp::Delete(_) => BodyOp::Delete(take),
            BodyOp::Insert(s) => {
                let piece: String = s
                    .chars()
                    .skip(self.offset as usize)
                    .take(take as usize)
                    .collect();
                BodyOp::Insert(piece)
            }
        };
        if take == available {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        self.skip_empty();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> BodyDelta {
        BodyDelta::document(text)
    }

    #[test]
    fn test_empty_is_document_and_empty() {
        let e = BodyDelta::empty();
        assert!(e.is_empty());
        assert!(e.is_document());
        assert_eq!(e.text().unwrap(), "");
    }

    #[test]
    fn test_normalization_merges_and_chops() {
        let d = BodyDelta::builder()
            .retain(1)
            .retain(2)
            .insert("a")
            .insert("b")
            .delete(1)
            .delete(0)
            .retain(5)
            .build();
        assert_eq!(
            d.ops(),
            &[
                BodyOp::Retain(3),
                BodyOp::Insert("ab".into()),
                BodyOp::Delete(1),
            ]
        );
    }

    #[test]
    fn test_compose_document_with_edit() {
        let d = doc("hi");
        let edit = BodyDelta::builder().retain(2).insert("!").build();
        let composed = d.compose(&edit).unwrap();
        assert_eq!(composed.text().unwrap(), "hi!");
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = BodyDelta::builder().retain(1).insert("xyz").build();
        let b = BodyDelta::builder().retain(1).delete(3).build();
        let composed = a.compose(&b).unwrap();
        assert!(composed.is_empty());
    }

    #[test]
    fn test_compose_edit_edit_middle() {
        let base = doc("hello");
        let a = BodyDelta::builder().retain(5).insert(" world").build();
        let b = BodyDelta::builder().delete(1).insert("H").build();
        let ab = a.compose(&b).unwrap();
        assert_eq!(base.compose(&ab).unwrap().text().unwrap(), "Hello world");
    }

    #[test]
    fn test_compose_associative() {
        let a = doc("abc");
        let b = BodyDelta::builder().retain(1).delete(1).insert("X").build();
        let c = BodyDelta::builder().retain(2).insert("YZ").build();
        let left = a.compose(&b).unwrap().compose(&c).unwrap();
        let right = a.compose(&b.compose(&c).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left.text().unwrap(), "aXYZc");
    }

    #[test]
    fn test_compose_identity() {
        let a = BodyDelta::builder().retain(2).insert("q").delete(1).build();
        assert_eq!(a.compose(&BodyDelta::empty()).unwrap(), a);
        assert_eq!(BodyDelta::empty().compose(&a).unwrap(), a);
    }

    #[test]
    fn test_overreaching_edit_is_not_document() {
        // Retaining past the end of the base leaves a retain behind, so
        // the composition is visibly not a document.
        let d = doc("hi");
        let edit = BodyDelta::builder().retain(10).insert("!").build();
        let composed = d.compose(&edit).unwrap();
        assert!(!composed.is_document());
    }

    #[test]
    fn test_transform_concurrent_inserts_priority() {
        let base = doc("");
        let server = BodyDelta::builder().insert("X").build();
        let client = BodyDelta::builder().insert("Y").build();

        let rebased = server.transform(&client, true).unwrap();
        assert_eq!(
            rebased.ops(),
            &[BodyOp::Retain(1), BodyOp::Insert("Y".into())]
        );
        let converged = base
            .compose(&server)
            .unwrap()
            .compose(&rebased)
            .unwrap();
        assert_eq!(converged.text().unwrap(), "XY");

        // Without priority, the other side's insert lands first.
        let rebased = server.transform(&client, false).unwrap();
        let converged = base
            .compose(&server)
            .unwrap()
            .compose(&rebased)
            .unwrap();
        assert_eq!(converged.text().unwrap(), "YX");
    }

    #[test]
    fn test_transform_convergence_tp1() {
        // a and b concurrent against "abcd"; both application orders
        // must converge on the same text.
        let base = doc("abcd");
        let a = BodyDelta::builder().retain(1).delete(2).insert("Q").build();
        let b = BodyDelta::builder().retain(3).insert("zz").build();

        let b_after_a = a.transform(&b, true).unwrap();
        let a_after_b = b.transform(&a, false).unwrap();

        let via_a = base
            .compose(&a)
            .unwrap()
            .compose(&b_after_a)
            .unwrap();
        let via_b = base
            .compose(&b)
            .unwrap()
            .compose(&a_after_b)
            .unwrap();
        assert_eq!(via_a.text().unwrap(), via_b.text().unwrap());
    }

    #[test]
    fn test_transform_delete_overlap() {
        let base = doc("abcdef");
        let a = BodyDelta::builder().retain(1).delete(3).build(); // drop bcd
        let b = BodyDelta::builder().retain(2).delete(3).build(); // drop cde

        let b_after_a = a.transform(&b, true).unwrap();
        let result = base.compose(&a).unwrap().compose(&b_after_a).unwrap();
        assert_eq!(result.text().unwrap(), "af");
    }

    #[test]
    fn test_transform_to_empty() {
        // Both sides delete the same character: the rebased edit is a no-op.
        let a = BodyDelta::builder().delete(1).build();
        let b = BodyDelta::builder().delete(1).build();
        assert!(a.transform(&b, true).unwrap().is_empty());
    }

    #[test]
    fn test_diff_law() {
        let cases = [("", "XY"), ("Y", "XY"), ("hello", "help"), ("same", "same")];
        for (from, to) in cases {
            let a = doc(from);
            let b = doc(to);
            let d = a.diff(&b).unwrap();
            assert_eq!(
                a.compose(&d).unwrap().text().unwrap(),
                to,
                "diff({from:?}, {to:?})"
            );
        }
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let a = doc("stable");
        assert!(a.diff(&a).unwrap().is_empty());
    }

    #[test]
    fn test_diff_requires_documents() {
        let a = doc("x");
        let edit = BodyDelta::builder().retain(1).build();
        assert!(a.diff(&edit).is_err());
    }

    #[test]
    fn test_invert_round_trip() {
        let base = doc("hello world");
        let edit = BodyDelta::builder()
            .retain(6)
            .delete(5)
            .insert("bayou")
            .build();
        let inv = edit.invert(&base).unwrap();
        let forward = base.compose(&edit).unwrap();
        assert_eq!(forward.text().unwrap(), "hello bayou");
        let back = forward.compose(&inv).unwrap();
        assert_eq!(back.text().unwrap(), "hello world");
    }

    #[test]
    fn test_multibyte_characters_count_as_one() {
        let base = doc("héllo");
        let edit = BodyDelta::builder().retain(2).delete(1).insert("L").build();
        let result = base.compose(&edit).unwrap();
        assert_eq!(result.text().unwrap(), "héLlo");
    }
}
