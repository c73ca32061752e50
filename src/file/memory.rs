//! In-memory transactional file: the reference [`FileAccess`]
//! implementation and the test double for the engine.
//!
//! A mutex-guarded path→bytes map with a per-commit file revision,
//! per-path last-modified tracking, and a broadcast of commit events.
//! Transactions run against a working copy and commit atomically, so a
//! failed op leaves no partial state.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::spec::{FileError, TransactionOp, TransactionResult, TransactionSpec};
use super::{FileAccess, FileEvent, FileSource};
use crate::types::{DocId, StoragePath};

/// Commit events buffered per subscriber.
const EVENT_CAPACITY: usize = 256;

struct Inner {
    /// `None` until `create`, and again after `delete`.
    data: Option<HashMap<StoragePath, Vec<u8>>>,
    file_rev: u64,
    modified: HashMap<StoragePath, u64>,
}

/// One in-memory document file.
pub struct MemoryFile {
    inner: Mutex<Inner>,
    events: broadcast::Sender<FileEvent>,
}

impl MemoryFile {
    /// A new, not-yet-created file.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                data: None,
                file_rev: 0,
                modified: HashMap::new(),
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryFile {
    fn default() -> Self {
        Self::new()
    }
}

impl FileAccess for MemoryFile {
    fn exists(&self) -> bool {
        self.lock().data.is_some()
    }

    fn create(&self) -> Result<(), FileError> {
        let mut inner = self.lock();
        if inner.data.is_none() {
            inner.data = Some(HashMap::new());
        }
        Ok(())
    }

    fn delete(&self) -> Result<(), FileError> {
        let mut inner = self.lock();
        if inner.data.take().is_none() {
            return Err(FileError::FileNotFound);
        }
        inner.modified.clear();
        Ok(())
    }

    fn file_rev(&self) -> u64 {
        self.lock().file_rev
    }

    fn last_modified(&self, path: &StoragePath) -> Option<u64> {
        self.lock().modified.get(path).copied()
    }

    fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult, FileError> {
        let mut inner = self.lock();
        let Some(data) = inner.data.as_ref() else {
            return Err(FileError::FileNotFound);
        };

        let mut working = data.clone();
        let mut result = TransactionResult::default();
        let mut touched: BTreeSet<StoragePath> = BTreeSet::new();

        for op in spec.ops() {
            match op {
                TransactionOp::CheckPathExists(path) => {
                    if !working.contains_key(path) {
                        return Err(FileError::PathNotFound(path.clone()));
                    }
                }
                TransactionOp::CheckPathEmpty(path) => {
                    if working.contains_key(path) {
                        return Err(FileError::PathNotEmpty(path.clone()));
                    }
                }
                TransactionOp::CheckPathIs(path, expected) => {
                    match working.get(path) {
                        None => return Err(FileError::PathNotFound(path.clone())),
                        Some(value) if value != expected => {
                            return Err(FileError::PathHashMismatch(path.clone()));
                        }
                        Some(_) => {}
                    }
                }
                TransactionOp::ReadPath(path) => match working.get(path) {
                    None => return Err(FileError::PathNotFound(path.clone())),
                    Some(value) => {
                        result.data.insert(path.clone(), value.clone());
                    }
                },
                TransactionOp::WritePath(path, value) => {
                    working.insert(path.clone(), value.clone());
                    touched.insert(path.clone());
                }
                TransactionOp::DeletePath(path) => {
                    working.remove(path);
                    touched.insert(path.clone());
                }
                TransactionOp::ListPath(prefix) => {
                    for path in working.keys() {
                        if path.is_child_of(prefix) {
                            result.paths.insert(path.clone());
                        }
                    }
                }
                // In-memory transactions are instantaneous; the
                // advisory timeout never fires.
                TransactionOp::Timeout(_) => {}
            }
        }

        if !touched.is_empty() {
            inner.file_rev += 1;
            let rev = inner.file_rev;
            for path in &touched {
                inner.modified.insert(path.clone(), rev);
            }
            inner.data = Some(working);
            let _ = self.events.send(FileEvent {
                file_rev: rev,
                paths: Arc::new(touched),
            });
        } else {
            inner.data = Some(working);
        }
        result.file_rev = inner.file_rev;
        Ok(result)
    }

    fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.events.subscribe()
    }
}

/// In-memory docId→file map: the reference [`FileSource`].
pub struct MemoryStore {
    files: Mutex<HashMap<Uuid, Arc<MemoryFile>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSource for MemoryStore {
    fn file_for(&self, doc_id: DocId) -> Arc<dyn FileAccess> {
        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files
            .entry(doc_id)
            .or_insert_with(|| Arc::new(MemoryFile::new()))
            .clone()
    }
}
