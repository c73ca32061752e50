//! # bayou-control — document control engine for the Bayou editor
//!
//! Server-side core for collaborative rich-text editing: per-document
//! append-only change logs with revision-numbered reads, OT-based write
//! rebasing with correction deltas, long-poll change waits, and
//! caret/session coordination.
//!
//! ## Architecture
//!
//! ```text
//! Client edit ──► Session ──► DocComplex ─────┬── BodyControl ────┐
//!                               │             ├── CaretControl    │ OT apply
//!                               │             └── PropertyControl │ + rebase
//!                               │                     │           ▼
//!                        SessionRegistry              │   conditional append
//!                                                     ▼           │
//!                                              FileAccess (transactional
//!                                              path→bytes file, per doc)
//!                                                     │
//! Long poll  ◄── get_change_after ◄── commit events ──┘
//! ```
//!
//! Each stream is an append-only log: `change/0` is always the empty
//! change, `change/N` moves revision `N-1` to `N`, and
//! `revision_number` tracks the head. A client edit against an older
//! base is rebased over the concurrent changes with the delta algebra's
//! `transform`, then committed with a conditional append; the caller
//! gets back a **correction delta** reconciling its optimistic result
//! with the authoritative head. Lost append races retry with
//! exponential backoff inside a fixed budget.
//!
//! ## Modules
//!
//! - [`delta`] — the OT algebra trait plus body/caret/property algebras
//! - [`change`] — revisioned changes and snapshots
//! - [`file`] — the transactional storage contract + in-memory file
//! - [`control`] — the generic control stream, cache, reader, adapters
//! - [`session`] — author-facing session handles and registry
//! - [`complex`] — per-document lifecycle and the process registry
//! - [`color`] — caret color allocation
//!
//! All tunables live in [`EngineConfig`], threaded explicitly through
//! construction; there are no process-wide globals.

pub mod change;
pub mod color;
pub mod complex;
pub mod config;
pub mod control;
pub mod delta;
pub mod error;
pub mod file;
pub mod session;
pub mod types;

pub use change::{Change, Snapshot};
pub use complex::{ComplexRegistry, DocComplex, DocStatus, OpenOutcome};
pub use config::EngineConfig;
pub use control::{
    BodyControl, CaretControl, ControlStream, FailureFlag, PropertyControl, StreamAdapter,
};
pub use delta::{BodyDelta, BodyOp, Caret, CaretDelta, CaretOp, Delta, PropertyDelta, PropertyOp};
pub use error::{ControlError, ErrorKind, Result};
pub use file::{FileAccess, FileSource, MemoryFile, MemoryStore};
pub use session::{Session, SessionRegistry};
pub use types::{AuthorId, CancelHandle, CancelToken, CaretId, DocId, RevNum, StoragePath};
