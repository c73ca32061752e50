//! Changes and snapshots: the revisioned units of every stream.

use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::error::{ControlError, ErrorKind, Result};
use crate::types::{AuthorId, RevNum, Timestamp};

/// One appended change: the delta taking a stream from revision
/// `rev_num - 1` to `rev_num`.
///
/// Change 0 of every stream is the empty change — identity delta, no
/// timestamp, no author. Later changes carry a per-stream monotonically
/// non-decreasing timestamp and an optional author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "D: Delta"))]
pub struct Change<D: Delta> {
    /// Revision this change produces.
    pub rev_num: RevNum,
    /// The delta applied on top of revision `rev_num - 1`.
    pub delta: D,
    /// Msec since epoch; absent only on change 0.
    pub timestamp: Option<Timestamp>,
    /// The author responsible, when known.
    pub author_id: Option<AuthorId>,
}

impl<D: Delta> Change<D> {
    /// The canonical change 0.
    pub fn first() -> Self {
        Self {
            rev_num: 0,
            delta: D::empty(),
            timestamp: None,
            author_id: None,
        }
    }

    /// Encode for the file store.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
            ControlError::new(
                ErrorKind::InvariantViolation,
                format!("change {} failed to encode: {e}", self.rev_num),
            )
        })
    }

    /// Decode from the file store. Failure means the log is corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (change, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map_err(
                |e| {
                    ControlError::new(
                        ErrorKind::StorageCorrupt,
                        format!("stored change failed to decode: {e}"),
                    )
                },
            )?;
        Ok(change)
    }
}

/// The composed state of a stream at one revision.
///
/// Invariant: composing the deltas of changes `0..=rev_num` yields
/// `contents`, and `contents` is a document delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "D: Delta"))]
pub struct Snapshot<D: Delta> {
    /// Revision this snapshot reflects.
    pub rev_num: RevNum,
    /// Full document state.
    pub contents: D,
}

impl<D: Delta> Snapshot<D> {
    /// Revision 0: the empty document.
    pub fn base() -> Self {
        Self {
            rev_num: 0,
            contents: D::empty(),
        }
    }
}

/// Encode a revision number for the file store.
pub fn encode_rev_num(rev: RevNum) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(rev, bincode::config::standard()).map_err(|e| {
        ControlError::new(
            ErrorKind::InvariantViolation,
            format!("revision number failed to encode: {e}"),
        )
    })
}

/// Decode a stored revision number.
pub fn decode_rev_num(bytes: &[u8]) -> Result<RevNum> {
    let (rev, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| {
            ControlError::new(
                ErrorKind::StorageCorrupt,
                format!("stored revision number failed to decode: {e}"),
            )
        })?;
    Ok(rev)
}
