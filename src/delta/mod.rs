//! OT delta algebras.
//!
//! The engine is generic over the [`Delta`] trait and assumes nothing
//! about a delta's structure beyond the algebraic laws:
//!
//! | Operation                         | Law                               |
//! |-----------------------------------|-----------------------------------|
//! | `a.compose(b).compose(c)`         | `= a.compose(b.compose(c))`       |
//! | `a.compose(empty)`                | `= a`                             |
//! | `transform` + `compose`           | TP1 two-sided convergence         |
//! | `a.diff(b)` for documents `a`,`b` | `a.compose(a.diff(b)) = b`        |
//! | `a.is_document()`                 | `a` can be a full document state  |
//!
//! Three reference algebras live here: [`body`] (plain-text
//! retain/insert/delete OT), [`caret`] (session begin/set/end over a
//! caret map), and [`property`] (set/delete over a key/value map).

pub mod body;
pub mod caret;
pub mod property;

pub use body::{BodyDelta, BodyOp};
pub use caret::{Caret, CaretDelta, CaretField, CaretOp, FieldValue};
pub use property::{PropertyDelta, PropertyOp};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::error::Result;

/// One OT delta algebra.
///
/// `transform` rebases `other` over `self`: given concurrent deltas
/// `self` and `other` against the same base, the result applies after
/// `self`. `self_first == true` gives `self`'s insertions priority at
/// equal positions.
pub trait Delta:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The identity delta.
    fn empty() -> Self;

    /// Whether this delta is the identity.
    fn is_empty(&self) -> bool;

    /// Whether this delta can stand as a full document (no retain or
    /// delete against prior state). The empty delta is the empty
    /// document and satisfies this.
    fn is_document(&self) -> bool;

    /// `self` then `other`, as one delta. An edit reaching past the
    /// state its base produces leaves a visibly non-document
    /// composition for the caller's `is_document` validation to catch.
    fn compose(&self, other: &Self) -> Result<Self>;

    /// Rebase `other` over `self` (both relative to the same base).
    fn transform(&self, other: &Self, self_first: bool) -> Result<Self>;

    /// The delta taking document `self` to document `other`. Fails
    /// `bad_value` unless both are documents.
    fn diff(&self, other: &Self) -> Result<Self>;

    /// The delta undoing `self` when applied against document `base`
    /// (`base.compose(self).compose(self.invert(base)) == base`).
    fn invert(&self, base: &Self) -> Result<Self>;
}
