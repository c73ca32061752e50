//! Key/value document-property OT algebra.
//!
//! A property delta is a run of `Set`/`Delete` ops over opaque string
//! scalars. A document delta is all sets; materializing it yields the
//! name→value map. Ops on distinct names commute; same-name conflicts
//! resolve by transform priority.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Delta;
use crate::error::{ControlError, Result};

/// One property operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyOp {
    /// Bind `name` to `value`.
    Set { name: String, value: String },
    /// Remove `name`.
    Delete { name: String },
}

impl PropertyOp {
    fn name(&self) -> &str {
        match self {
            PropertyOp::Set { name, .. } | PropertyOp::Delete { name } => name,
        }
    }
}

/// A run of property ops.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PropertyDelta {
    ops: Vec<PropertyOp>,
}

impl PropertyDelta {
    /// A delta from a raw op run (normalized: one op per name, names
    /// sorted).
    pub fn from_ops(ops: Vec<PropertyOp>) -> Self {
        normalize(ops)
    }

    /// The canonical document delta for a property map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let ops = map
            .iter()
            .map(|(name, value)| PropertyOp::Set {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        PropertyDelta { ops }
    }

    /// The ops of this delta.
    pub fn ops(&self) -> &[PropertyOp] {
        &self.ops
    }

    /// Materialize a document delta into its property map.
    pub fn properties(&self) -> Result<BTreeMap<String, String>> {
        if !self.is_document() {
            return Err(ControlError::bad_value(
                "properties() requires a property document delta",
            ));
        }
        let mut map = BTreeMap::new();
        for op in &self.ops {
            if let PropertyOp::Set { name, value } = op {
                map.insert(name.clone(), value.clone());
            }
        }
        Ok(map)
    }
}

/// One op per name (last wins), names sorted.
fn normalize(ops: Vec<PropertyOp>) -> PropertyDelta {
    let mut last: BTreeMap<String, PropertyOp> = BTreeMap::new();
    for op in ops {
        last.insert(op.name().to_string(), op);
    }
    PropertyDelta {
        ops: last.into_values().collect(),
    }
}

impl Delta for PropertyDelta {
    fn empty() -> Self {
        Self { ops: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, PropertyOp::Set { .. }))
    }

    fn compose(&self, other: &Self) -> Result<Self> {
        // empty∘edit is the edit itself, not the edit applied to an
        // empty property map.
        if self.is_empty() {
            return Ok(other.clone());
        }
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_document() {
            let mut map = self.properties()?;
            for op in &other.ops {
                match op {
                    PropertyOp::Set { name, value } => {
                        map.insert(name.clone(), value.clone());
                    }
                    PropertyOp::Delete { name } => {
                        map.remove(name);
                    }
                }
            }
            Ok(Self::from_map(&map))
        } else {
            let mut ops = self.ops.clone();
            ops.extend(other.ops.iter().cloned());
            Ok(normalize(ops))
        }
    }

    fn transform(&self, other: &Self, self_first: bool) -> Result<Self> {
        if !self_first {
            // `other` applies after `self` and overwrites; everything
            // survives.
            return Ok(other.clone());
        }
        let touched: std::collections::BTreeSet<&str> =
            self.ops.iter().map(|op| op.name()).collect();
        let kept = other
            .ops
            .iter()
            .filter(|op| !touched.contains(op.name()))
            .cloned()
            .collect();
        Ok(normalize(kept))
    }

    fn diff(&self, other: &Self) -> Result<Self> {
        let from = self.properties()?;
        let to = other.properties()?;
        let mut ops = Vec::new();
        for (name, value) in &to {
            if from.get(name) != Some(value) {
                ops.push(PropertyOp::Set {
                    name: name.clone(),
                    value: value.clone(),
                });
            }
        }
        for name in from.keys() {
            if !to.contains_key(name) {
                ops.push(PropertyOp::Delete { name: name.clone() });
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

    fn set(name: &str, value: &str) -> PropertyOp {
        PropertyOp::Set {
            name: name.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_empty_is_document() {
        let d = PropertyDelta::empty();
        assert!(d.is_empty());
        assert!(d.is_document());
    }

    #[test]
    fn test_compose_identity_both_sides() {
        let edit = PropertyDelta::from_ops(vec![
            set("a", "1"),
            PropertyOp::Delete { name: "b".into() },
        ]);
        assert_eq!(PropertyDelta::empty().compose(&edit).unwrap(), edit);
        assert_eq!(edit.compose(&PropertyDelta::empty()).unwrap(), edit);
    }

    #[test]
    fn test_compose_set_and_delete() {
        let doc = PropertyDelta::from_ops(vec![set("title", "draft"), set("lang", "en")]);
        let edit = PropertyDelta::from_ops(vec![
            set("title", "final"),
            PropertyOp::Delete { name: "lang".into() },
        ]);
        let map = doc.compose(&edit).unwrap().properties().unwrap();
        assert_eq!(map.get("title").map(String::as_str), Some("final"));
        assert!(!map.contains_key("lang"));
    }

    #[test]
    fn test_delete_on_document_is_not_document() {
        let d = PropertyDelta::from_ops(vec![PropertyOp::Delete { name: "x".into() }]);
        assert!(!d.is_document());
        assert!(d.properties().is_err());
    }

    #[test]
    fn test_normalize_last_wins() {
        let d = PropertyDelta::from_ops(vec![
            set("k", "a"),
            set("k", "b"),
            PropertyOp::Delete { name: "k".into() },
        ]);
        assert_eq!(d.ops(), &[PropertyOp::Delete { name: "k".into() }]);
    }

    #[test]
    fn test_transform_converges_on_conflict() {
        let base = PropertyDelta::from_ops(vec![set("k", "old")]);
        let a = PropertyDelta::from_ops(vec![set("k", "server")]);
        let b = PropertyDelta::from_ops(vec![set("k", "client")]);

        let b_after_a = a.transform(&b, true).unwrap();
        let a_after_b = b.transform(&a, false).unwrap();

        let via_a = base.compose(&a).unwrap().compose(&b_after_a).unwrap();
        let via_b = base.compose(&b).unwrap().compose(&a_after_b).unwrap();
        assert_eq!(via_a, via_b);
        assert_eq!(
            via_a.properties().unwrap().get("k").map(String::as_str),
            Some("server")
        );
    }

    #[test]
    fn test_diff_law() {
        let from = PropertyDelta::from_ops(vec![set("a", "1"), set("b", "2")]);
        let to = PropertyDelta::from_ops(vec![set("b", "3"), set("c", "4")]);
        let d = from.diff(&to).unwrap();
        assert_eq!(
            from.compose(&d).unwrap().properties().unwrap(),
            to.properties().unwrap()
        );
    }

    #[test]
    fn test_invert_restores_base() {
        let base = PropertyDelta::from_ops(vec![set("a", "1")]);
        let edit = PropertyDelta::from_ops(vec![
            set("a", "2"),
            set("b", "9"),
        ]);
        let inv = edit.invert(&base).unwrap();
        let restored = base.compose(&edit).unwrap().compose(&inv).unwrap();
        assert_eq!(restored.properties().unwrap(), base.properties().unwrap());
    }
}
