//! Body stream adapter: the document text log.

use super::{ControlStream, StreamAdapter};
use crate::change::Change;
use crate::delta::BodyDelta;
use crate::error::{ControlError, Result};

/// Adapter for the `/body` stream.
pub struct BodyAdapter;

impl StreamAdapter for BodyAdapter {
    type Delta = BodyDelta;
    const PREFIX: &'static str = "body";

    fn validate_change(change: &Change<BodyDelta>) -> Result<()> {
        validate_shape(change)
    }
}

/// The body control: a [`ControlStream`] over text deltas.
pub type BodyControl = ControlStream<BodyAdapter>;

/// Shape checks common to every stream: change 0 is the empty,
/// authorless, timestampless change; later changes are timestamped.
pub(crate) fn validate_shape<D: crate::delta::Delta>(change: &Change<D>) -> Result<()> {
    if change.rev_num == 0 {
        if !change.delta.is_empty() || change.timestamp.is_some() || change.author_id.is_some()
        {
            return Err(ControlError::bad_value(
                "change 0 must be the empty change",
            ));
        }
    } else if change.timestamp.is_none() {
        return Err(ControlError::bad_value(format!(
            "change {} is missing its timestamp",
            change.rev_num
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Delta;

    #[test]
    fn test_change_zero_must_be_empty() {
        let good: Change<BodyDelta> = Change::first();
        assert!(BodyAdapter::validate_change(&good).is_ok());

        let bad = Change {
            rev_num: 0,
            delta: BodyDelta::document("oops"),
            timestamp: None,
            author_id: None,
        };
        assert!(BodyAdapter::validate_change(&bad).is_err());

        let stamped = Change {
            rev_num: 0,
            delta: BodyDelta::empty(),
            timestamp: Some(1),
            author_id: None,
        };
        assert!(BodyAdapter::validate_change(&stamped).is_err());
    }

    #[test]
    fn test_later_changes_need_timestamps() {
        let missing = Change {
            rev_num: 2,
            delta: BodyDelta::builder().insert("x").build(),
            timestamp: None,
            author_id: None,
        };
        assert!(BodyAdapter::validate_change(&missing).is_err());

        let good = Change {
            rev_num: 2,
            delta: BodyDelta::builder().insert("x").build(),
            timestamp: Some(12),
            author_id: Some("a1".to_string()),
        };
        assert!(BodyAdapter::validate_change(&good).is_ok());
    }
}
