//! Property stream adapter: the document's key/value log.

use super::body::validate_shape;
use super::{ControlStream, StreamAdapter};
use crate::change::Change;
use crate::delta::{PropertyDelta, PropertyOp};
use crate::error::{ControlError, Result};

/// Adapter for the `/property` stream.
pub struct PropertyAdapter;

impl StreamAdapter for PropertyAdapter {
    type Delta = PropertyDelta;
    const PREFIX: &'static str = "property";

    fn validate_change(change: &Change<PropertyDelta>) -> Result<()> {
        validate_shape(change)?;
        for op in change.delta.ops() {
            let name = match op {
                PropertyOp::Set { name, .. } | PropertyOp::Delete { name } => name,
            };
            if name.is_empty() {
                return Err(ControlError::bad_value(
                    "property names must be non-empty",
                ));
            }
        }
        Ok(())
    }
}

/// The property control: a [`ControlStream`] over key/value deltas.
pub type PropertyControl = ControlStream<PropertyAdapter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::PropertyDelta;

    #[test]
    fn test_rejects_empty_names() {
        let change = Change {
            rev_num: 1,
            delta: PropertyDelta::from_ops(vec![PropertyOp::Set {
                name: String::new(),
                value: "v".to_string(),
            }]),
            timestamp: Some(5),
            author_id: None,
        };
        assert!(PropertyAdapter::validate_change(&change).is_err());
    }

    #[test]
    fn test_accepts_well_formed() {
        let change = Change {
            rev_num: 1,
            delta: PropertyDelta::from_ops(vec![PropertyOp::Set {
                name: "title".to_string(),
                value: "Untitled".to_string(),
            }]),
            timestamp: Some(5),
            author_id: Some("a1".to_string()),
        };
        assert!(PropertyAdapter::validate_change(&change).is_ok());
    }
}
