//! Storage layer contract consumed by the control engine.
//!
//! ```text
//! ┌──────────────┐   TransactionSpec    ┌──────────────┐
//! │ ControlStream│ ───────────────────► │  FileAccess  │
//! │ (per stream) │ ◄─────────────────── │ (per doc)    │
//! └──────┬───────┘   TransactionResult  └──────┬───────┘
//!        │                                     │ commit
//!        │ when_change(path)                   ▼
//!        └───────────────────────────── FileEvent broadcast
//! ```
//!
//! A transaction wholly commits or fails with a typed [`FileError`];
//! the `path_not_empty` kind is the conditional-append conflict signal
//! and is distinguishable from every other failure. Waiting never rides
//! inside `transact`: it lives solely in [`when_change`], so a spec can
//! never mix wait ops with reads or writes.

pub mod memory;
pub mod spec;

pub use memory::{MemoryFile, MemoryStore};
pub use spec::{FileError, TransactionOp, TransactionResult, TransactionSpec};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::types::{CancelToken, DocId, StoragePath};

/// Broadcast on every committed mutating transaction.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// File revision the commit produced.
    pub file_rev: u64,
    /// Paths the commit wrote or deleted.
    pub paths: Arc<BTreeSet<StoragePath>>,
}

/// One transactional document file.
///
/// Object-safe; the engine holds `Arc<dyn FileAccess>`. The handle is
/// thread-safe and may be used from any task.
pub trait FileAccess: Send + Sync {
    /// Whether the file currently exists.
    fn exists(&self) -> bool;

    /// Create the file if absent; idempotent.
    fn create(&self) -> Result<(), FileError>;

    /// Delete the file and all its paths.
    fn delete(&self) -> Result<(), FileError>;

    /// The file revision: bumped once per committed mutation.
    fn file_rev(&self) -> u64;

    /// File revision at which `path` was last written or deleted.
    fn last_modified(&self, path: &StoragePath) -> Option<u64>;

    /// Run a transaction.
    fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult, FileError>;

    /// Subscribe to commit events.
    fn subscribe(&self) -> broadcast::Receiver<FileEvent>;
}

/// Obtains the file for a document; the seam between the complex
/// registry and whatever backend the process runs on.
pub trait FileSource: Send + Sync {
    /// The (possibly not-yet-created) file for `doc_id`. Repeated calls
    /// return handles to the same underlying file.
    fn file_for(&self, doc_id: DocId) -> Arc<dyn FileAccess>;
}

/// Suspend until `path` is mutated after file revision `after_file_rev`.
///
/// `timeout == None` waits forever. Returns the file revision of the
/// observed mutation; fails `TimedOut` / `TransactionAborted` on
/// deadline or cancellation.
pub async fn when_change(
    file: &dyn FileAccess,
    after_file_rev: u64,
    path: &StoragePath,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<u64, FileError> {
    // Subscribe before the initial probe so a commit between the two is
    // never missed.
    let mut rx = file.subscribe();

    if let Some(rev) = file.last_modified(path) {
        if rev > after_file_rev {
            return Ok(rev);
        }
    }

    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(FileError::TransactionAborted("cancelled".to_string()));
            }
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending().await,
                }
            } => {
                return Err(FileError::TimedOut);
            }
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => {
                if event.file_rev > after_file_rev && event.paths.contains(path) {
                    return Ok(event.file_rev);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // Missed events; fall back to the probe.
                if let Some(rev) = file.last_modified(path) {
                    if rev > after_file_rev {
                        return Ok(rev);
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(FileError::TransactionAborted(
                    "file event channel closed".to_string(),
                ));
            }
        }
    }
}
