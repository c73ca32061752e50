//! Session/caret OT algebra.
//!
//! A caret stream delta is a run of [`CaretOp`]s — `Begin`, `Set`,
//! `End` — over a caret map. A document delta begins every caret it
//! sets and never ends one; materializing it yields the full
//! caretId→[`Caret`] map. Ops on distinct carets commute; conflicts on
//! the same caret resolve by transform priority, with `End` winning
//! over `Set`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Delta;
use crate::error::{ControlError, Result};
use crate::types::{AuthorId, CaretId, RevNum};

/// One live caret: a session's cursor/selection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caret {
    /// Short opaque session token, unique per document.
    pub caret_id: CaretId,
    /// The author who owns the session.
    pub author_id: AuthorId,
    /// Body revision the caret was last updated against. Monotonically
    /// non-decreasing per caret.
    pub doc_rev: RevNum,
    /// Selection start, in characters. 0-based.
    pub index: u64,
    /// Selection length in characters; 0 is a bare cursor.
    pub length: u64,
    /// Stable per-session CSS hex color (`#rrggbb`).
    pub color: String,
}

/// Field selector for [`CaretOp::Set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CaretField {
    Index,
    Length,
    DocRev,
    Color,
}

/// A field value; numeric for index/length/docRev, text for color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Num(u64),
    Color(String),
}

/// One caret stream operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaretOp {
    /// Start a session: a fresh caret at index 0, length 0.
    Begin {
        caret_id: CaretId,
        author_id: AuthorId,
        doc_rev: RevNum,
        color: String,
    },
    /// Update one field of a live caret.
    Set {
        caret_id: CaretId,
        field: CaretField,
        value: FieldValue,
    },
    /// End a session, removing its caret.
    End { caret_id: CaretId },
}

/// A run of caret ops.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaretDelta {
    ops: Vec<CaretOp>,
}

impl CaretDelta {
    /// A delta from a raw op run (normalized).
    pub fn from_ops(ops: Vec<CaretOp>) -> Self {
        normalize(ops)
    }

    /// The canonical document delta for a caret map.
    pub fn from_carets(carets: &BTreeMap<CaretId, Caret>) -> Self {
        let mut ops = Vec::new();
        for caret in carets.values() {
            push_caret_ops(&mut ops, caret);
        }
        CaretDelta { ops }
    }

    /// The ops of this delta.
    pub fn ops(&self) -> &[CaretOp] {
        &self.ops
    }

    /// Materialize a document delta into its caret map.
    pub fn carets(&self) -> Result<BTreeMap<CaretId, Caret>> {
        if !self.is_document() {
            return Err(ControlError::bad_value(
                "carets() requires a caret document delta",
            ));
        }
        let mut map = BTreeMap::new();
        for op in &self.ops {
            apply_op(&mut map, op)?;
        }
        Ok(map)
    }
}

/// Apply one op to a caret map. Ops against absent carets are inert.
fn apply_op(map: &mut BTreeMap<CaretId, Caret>, op: &CaretOp) -> Result<()> {
    match op {
        CaretOp::Begin {
            caret_id,
            author_id,
            doc_rev,
            color,
        } => {
            map.insert(
                caret_id.clone(),
                Caret {
                    caret_id: caret_id.clone(),
                    author_id: author_id.clone(),
                    doc_rev: *doc_rev,
                    index: 0,
                    length: 0,
                    color: color.clone(),
                },
            );
        }
        CaretOp::Set {
            caret_id,
            field,
            value,
        } => {
            let Some(caret) = map.get_mut(caret_id) else {
                return Ok(());
            };
            match (field, value) {
                (CaretField::Index, FieldValue::Num(n)) => caret.index = *n,
                (CaretField::Length, FieldValue::Num(n)) => caret.length = *n,
                (CaretField::DocRev, FieldValue::Num(n)) => {
                    // docRev never moves backwards for a caret.
                    caret.doc_rev = caret.doc_rev.max(*n);
                }
                (CaretField::Color, FieldValue::Color(c)) => {
                    caret.color = c.clone();
                }
                _ => {
                    return Err(ControlError::bad_value(format!(
                        "value kind does not match caret field {field:?}"
                    )));
                }
            }
        }
        CaretOp::End { caret_id } => {
            map.remove(caret_id);
        }
    }
    Ok(())
}

/// Emit the canonical op run for one caret: Begin, then Set for each
/// non-default field Begin does not carry.
fn push_caret_ops(ops: &mut Vec<CaretOp>, caret: &Caret) {
    ops.push(CaretOp::Begin {
        caret_id: caret.caret_id.clone(),
        author_id: caret.author_id.clone(),
        doc_rev: caret.doc_rev,
        color: caret.color.clone(),
    });
    if caret.index != 0 {
        ops.push(CaretOp::Set {
            caret_id: caret.caret_id.clone(),
            field: CaretField::Index,
            value: FieldValue::Num(caret.index),
        });
    }
    if caret.length != 0 {
        ops.push(CaretOp::Set {
            caret_id: caret.caret_id.clone(),
            field: CaretField::Length,
            value: FieldValue::Num(caret.length),
        });
    }
}

/// Per-caret net effect, used for normalization.
enum NetEffect {
    /// Only sets; last value per field, in first-set order.
    Sets(Vec<(CaretField, FieldValue)>),
    /// A begin (with field overrides applied on top).
    Begun {
        author_id: AuthorId,
        doc_rev: RevNum,
        color: String,
        sets: Vec<(CaretField, FieldValue)>,
    },
    /// Net removal.
    Ended,
}

/// Canonicalize an op run: one net effect per caret, carets in sorted
/// order, superseded sets dropped, Begin…End collapsed to End.
fn normalize(ops: Vec<CaretOp>) -> CaretDelta {
    let mut effects: BTreeMap<CaretId, NetEffect> = BTreeMap::new();

    for op in ops {
        match op {
            CaretOp::Begin {
                caret_id,
                author_id,
                doc_rev,
                color,
            } => {
                effects.insert(
                    caret_id,
                    NetEffect::Begun {
                        author_id,
                        doc_rev,
                        color,
                        sets: Vec::new(),
                    },
                );
            }
            CaretOp::Set {
                caret_id,
                field,
                value,
            } => {
                let effect = effects
                    .entry(caret_id)
                    .or_insert_with(|| NetEffect::Sets(Vec::new()));
                match effect {
                    NetEffect::Sets(sets) | NetEffect::Begun { sets, .. } => {
                        if let Some(slot) =
                            sets.iter_mut().find(|(f, _)| *f == field)
                        {
                            slot.1 = value;
                        } else {
                            sets.push((field, value));
                        }
                    }
                    // Set after End within one delta targets a dead
                    // caret; inert.
                    NetEffect::Ended => {}
                }
            }
            CaretOp::End { caret_id } => {
                effects.insert(caret_id, NetEffect::Ended);
            }
        }
    }

    let mut out = Vec::new();
    for (caret_id, effect) in effects {
        match effect {
            NetEffect::Sets(sets) => {
                for (field, value) in sets {
                    out.push(CaretOp::Set {
                        caret_id: caret_id.clone(),
                        field,
                        value,
                    });
                }
            }
            NetEffect::Begun {
                author_id,
                doc_rev,
                color,
                sets,
            } => {
                out.push(CaretOp::Begin {
                    caret_id: caret_id.clone(),
                    author_id,
                    doc_rev,
                    color,
                });
                for (field, value) in sets {
                    out.push(CaretOp::Set {
                        caret_id: caret_id.clone(),
                        field,
                        value,
                    });
                }
            }
            NetEffect::Ended => {
                out.push(CaretOp::End { caret_id: caret_id.clone() });
            }
        }
    }
    CaretDelta { ops: out }
}

impl Delta for CaretDelta {
    fn empty() -> Self {
        Self { ops: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        let mut begun = std::collections::BTreeSet::new();
        for op in &self.ops {
            match op {
                CaretOp::Begin { caret_id, .. } => {
                    begun.insert(caret_id.clone());
                }
                CaretOp::Set { caret_id, .. } => {
                    if !begun.contains(caret_id) {
                        return false;
                    }
                }
                CaretOp::End { .. } => return false,
            }
        }
        true
    }

    fn compose(&self, other: &Self) -> Result<Self> {
        // The empty delta is the identity in both directions. The
        // document branch below must not swallow it: empty∘edit is the
        // edit, not the edit applied to an empty caret map.
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_document() {
            // Canonical path: apply and re-emit the full map.
            let mut map = self.carets()?;
            for op in &other.ops {
                apply_op(&mut map, op)?;
            }
            Ok(Self::from_carets(&map))
        } else {
            let mut ops = self.ops.clone();
            ops.extend(other.ops.iter().cloned());
            Ok(normalize(ops))
        }
    }

    fn transform(&self, other: &Self, self_first: bool) -> Result<Self> {
        use std::collections::BTreeSet;

        let mut ended: BTreeSet<&CaretId> = BTreeSet::new();
        let mut begun: BTreeSet<&CaretId> = BTreeSet::new();
        let mut set_fields: BTreeSet<(&CaretId, CaretField)> = BTreeSet::new();
        for op in &self.ops {
            match op {
                CaretOp::Begin { caret_id, .. } => {
                    begun.insert(caret_id);
                }
                CaretOp::Set { caret_id, field, .. } => {
                    set_fields.insert((caret_id, *field));
                }
                CaretOp::End { caret_id } => {
                    ended.insert(caret_id);
                }
            }
        }

        let mut kept = Vec::new();
        for op in &other.ops {
            let keep = match op {
                // A later begin recreates the caret wholesale; it only
                // yields to a priority begin from `self`.
                CaretOp::Begin { caret_id, .. } => {
                    !(self_first && begun.contains(caret_id))
                }
                CaretOp::Set { caret_id, field, .. } => {
                    !ended.contains(caret_id)
                        && !(self_first
                            && (begun.contains(caret_id)
                                || set_fields.contains(&(caret_id, *field))))
                }
                CaretOp::End { caret_id } => !ended.contains(caret_id),
            };
            if keep {
                kept.push(op.clone());
            }
        }
        Ok(normalize(kept))
    }

    fn diff(&self, other: &Self) -> Result<Self> {
        let from = self.carets()?;
        let to = other.carets()?;
        let mut ops = Vec::new();

        for (caret_id, caret) in &to {
            match from.get(caret_id) {
                None => push_caret_ops(&mut ops, caret),
                Some(old) if old == caret => {}
                Some(old) => {
                    if old.author_id != caret.author_id {
                        // Ownership never changes in place; re-begin.
                        push_caret_ops(&mut ops, caret);
                        continue;
                    }
                    for (field, changed, value) in [
                        (
                            CaretField::Index,
                            old.index != caret.index,
                            FieldValue::Num(caret.index),
                        ),
                        (
                            CaretField::Length,
                            old.length != caret.length,
                            FieldValue::Num(caret.length),
                        ),
                        (
                            CaretField::DocRev,
                            old.doc_rev != caret.doc_rev,
                            FieldValue::Num(caret.doc_rev),
                        ),
                        (
                            CaretField::Color,
                            old.color != caret.color,
                            FieldValue::Color(caret.color.clone()),
                        ),
                    ] {
                        if changed {
                            ops.push(CaretOp::Set {
                                caret_id: caret_id.clone(),
                                field,
                                value,
                            });
                        }
                    }
                }
            }
        }
        for caret_id in from.keys() {
            if !to.contains_key(caret_id) {
                ops.push(CaretOp::End { caret_id: caret_id.clone() });
            }
        }
        Ok(normalize(ops))
    }

    fn invert(&self, base: &Self) -> Result<Self> {
        base.compose(self)?.diff(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin(id: &str, author: &str) -> CaretOp {
        CaretOp::Begin {
            caret_id: id.into(),
            author_id: author.into(),
            doc_rev: 0,
            color: "#e83b3b".into(),
        }
    }

    fn set_index(id: &str, n: u64) -> CaretOp {
        CaretOp::Set {
            caret_id: id.into(),
            field: CaretField::Index,
            value: FieldValue::Num(n),
        }
    }

    #[test]
    fn test_empty_is_document() {
        let d = CaretDelta::empty();
        assert!(d.is_empty());
        assert!(d.is_document());
        assert!(d.carets().unwrap().is_empty());
    }

    #[test]
    fn test_document_shape() {
        let doc = CaretDelta::from_ops(vec![begin("c1", "alice"), set_index("c1", 4)]);
        assert!(doc.is_document());

        let dangling_set = CaretDelta::from_ops(vec![set_index("c9", 4)]);
        assert!(!dangling_set.is_document());

        let with_end = CaretDelta::from_ops(vec![CaretOp::End { caret_id: "c1".into() }]);
        assert!(!with_end.is_document());
    }

    #[test]
    fn test_compose_begin_then_update() {
        let doc = CaretDelta::empty();
        let begin_delta = CaretDelta::from_ops(vec![begin("c1", "alice")]);
        let update = CaretDelta::from_ops(vec![set_index("c1", 7)]);

        let snapshot = doc
            .compose(&begin_delta)
            .unwrap()
            .compose(&update)
            .unwrap();
        let carets = snapshot.carets().unwrap();
        assert_eq!(carets.len(), 1);
        assert_eq!(carets["c1"].index, 7);
        assert_eq!(carets["c1"].author_id, "alice");
    }

    #[test]
    fn test_compose_identity_both_sides() {
        let edit = CaretDelta::from_ops(vec![
            set_index("c1", 4),
            CaretOp::End { caret_id: "c2".into() },
        ]);
        assert_eq!(CaretDelta::empty().compose(&edit).unwrap(), edit);
        assert_eq!(edit.compose(&CaretDelta::empty()).unwrap(), edit);
    }

    #[test]
    fn test_compose_end_removes() {
        let doc = CaretDelta::from_ops(vec![begin("c1", "alice"), begin("c2", "bob")]);
        let end = CaretDelta::from_ops(vec![CaretOp::End { caret_id: "c1".into() }]);
        let carets = doc.compose(&end).unwrap().carets().unwrap();
        assert!(!carets.contains_key("c1"));
        assert!(carets.contains_key("c2"));
    }

    #[test]
    fn test_doc_rev_never_regresses() {
        let doc = CaretDelta::from_ops(vec![CaretOp::Begin {
            caret_id: "c1".into(),
            author_id: "alice".into(),
            doc_rev: 9,
            color: "#e83b3b".into(),
        }]);
        let stale = CaretDelta::from_ops(vec![CaretOp::Set {
            caret_id: "c1".into(),
            field: CaretField::DocRev,
            value: FieldValue::Num(3),
        }]);
        let carets = doc.compose(&stale).unwrap().carets().unwrap();
        assert_eq!(carets["c1"].doc_rev, 9);
    }

    #[test]
    fn test_normalize_collapses_superseded_sets() {
        let d = CaretDelta::from_ops(vec![
            begin("c1", "alice"),
            set_index("c1", 1),
            set_index("c1", 2),
            set_index("c1", 3),
        ]);
        let sets = d
            .ops()
            .iter()
            .filter(|op| matches!(op, CaretOp::Set { .. }))
            .count();
        assert_eq!(sets, 1);
        assert_eq!(d.carets().unwrap()["c1"].index, 3);
    }

    #[test]
    fn test_normalize_begin_end_collapses() {
        let d = CaretDelta::from_ops(vec![
            begin("c1", "alice"),
            CaretOp::End { caret_id: "c1".into() },
        ]);
        assert_eq!(d.ops(), &[CaretOp::End { caret_id: "c1".into() }]);
    }

    #[test]
    fn test_transform_distinct_carets_commute() {
        let a = CaretDelta::from_ops(vec![set_index("c1", 5)]);
        let b = CaretDelta::from_ops(vec![set_index("c2", 9)]);
        assert_eq!(a.transform(&b, true).unwrap(), b);
        assert_eq!(b.transform(&a, false).unwrap(), a);
    }

    #[test]
    fn test_transform_conflicting_sets_converge() {
        let base = CaretDelta::from_ops(vec![begin("c1", "alice")]);
        let a = CaretDelta::from_ops(vec![set_index("c1", 5)]);
        let b = CaretDelta::from_ops(vec![set_index("c1", 9)]);

        let b_after_a = a.transform(&b, true).unwrap();
        let a_after_b = b.transform(&a, false).unwrap();

        let via_a = base.compose(&a).unwrap().compose(&b_after_a).unwrap();
        let via_b = base.compose(&b).unwrap().compose(&a_after_b).unwrap();
        assert_eq!(via_a.carets().unwrap(), via_b.carets().unwrap());
        assert_eq!(via_a.carets().unwrap()["c1"].index, 5);
    }

    #[test]
    fn test_transform_end_wins_over_set() {
        let base = CaretDelta::from_ops(vec![begin("c1", "alice")]);
        let ender = CaretDelta::from_ops(vec![CaretOp::End { caret_id: "c1".into() }]);
        let setter = CaretDelta::from_ops(vec![set_index("c1", 5)]);

        let set_after_end = ender.transform(&setter, true).unwrap();
        assert!(set_after_end.is_empty());

        let end_after_set = setter.transform(&ender, false).unwrap();
        let final_map = base
            .compose(&setter)
            .unwrap()
            .compose(&end_after_set)
            .unwrap()
            .carets()
            .unwrap();
        assert!(final_map.is_empty());
    }

    #[test]
    fn test_diff_emits_begin_set_end() {
        let from = CaretDelta::from_ops(vec![begin("c1", "alice"), begin("c2", "bob")]);
        let mut to_map = from.carets().unwrap();
        to_map.remove("c2");
        to_map.get_mut("c1").unwrap().index = 12;
        to_map.insert(
            "c3".into(),
            Caret {
                caret_id: "c3".into(),
                author_id: "eve".into(),
                doc_rev: 4,
                index: 2,
                length: 0,
                color: "#3be85e".into(),
            },
        );
        let to = CaretDelta::from_carets(&to_map);

        let d = from.diff(&to).unwrap();
        let rebuilt = from.compose(&d).unwrap().carets().unwrap();
        assert_eq!(rebuilt, to_map);
    }

    #[test]
    fn test_invert_restores_base() {
        let base = CaretDelta::from_ops(vec![begin("c1", "alice")]);
        let edit = CaretDelta::from_ops(vec![
            set_index("c1", 8),
            begin("c2", "bob"),
        ]);
        let inv = edit.invert(&base).unwrap();
        let restored = base
            .compose(&edit)
            .unwrap()
            .compose(&inv)
            .unwrap();
        assert_eq!(restored.carets().unwrap(), base.carets().unwrap());
    }
}
