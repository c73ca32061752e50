//! Batched change reads and change-wait against the file store.
//!
//! Reads are grouped into transactions of at most
//! `EngineConfig::max_reads_per_tx` changes so a long catch-up never
//! turns into one giant transaction. Waiting rides the file's commit
//! events via [`when_change`] on the stream's `revision_number` path.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::change::{decode_rev_num, Change};
use crate::delta::Delta;
use crate::error::{ControlError, ErrorKind, Result};
use crate::file::{when_change, FileAccess, FileError, TransactionSpec};
use crate::types::{CancelToken, RevNum, StoragePath};

/// Reader for one stream's change log.
pub struct ChangeReader<D: Delta> {
    file: Arc<dyn FileAccess>,
    prefix: &'static str,
    max_reads_per_tx: usize,
    _delta: PhantomData<fn() -> D>,
}

impl<D: Delta> ChangeReader<D> {
    /// A reader over `/<prefix>/…` in `file`.
    pub fn new(file: Arc<dyn FileAccess>, prefix: &'static str, max_reads_per_tx: usize) -> Self {
        Self {
            file,
            prefix,
            max_reads_per_tx: max_reads_per_tx.max(1),
            _delta: PhantomData,
        }
    }

    /// `/<prefix>/revision_number`.
    pub fn rev_num_path(&self) -> StoragePath {
        StoragePath::parse(&format!("/{}/revision_number", self.prefix))
            .unwrap_or_else(|_| unreachable!("prefix is a fixed identifier"))
    }

    /// `/<prefix>/change/<rev>`.
    pub fn change_path(&self, rev: RevNum) -> StoragePath {
        StoragePath::parse(&format!("/{}/change/{rev}", self.prefix))
            .unwrap_or_else(|_| unreachable!("prefix is a fixed identifier"))
    }

    /// `/<prefix>/change`.
    pub fn change_prefix(&self) -> StoragePath {
        StoragePath::parse(&format!("/{}/change", self.prefix))
            .unwrap_or_else(|_| unreachable!("prefix is a fixed identifier"))
    }

    /// The stream's current head revision.
    pub fn current_rev_num(&self) -> Result<RevNum> {
        let path = self.rev_num_path();
        let result = self
            .file
            .transact(TransactionSpec::new().read_path(path.clone()))
            .map_err(|e| match e {
                FileError::PathNotFound(_) => ControlError::new(
                    ErrorKind::StorageCorrupt,
                    format!("{path} is missing"),
                ),
                other => other.into(),
            })?;
        let bytes = result.data.get(&path).ok_or_else(|| {
            ControlError::new(ErrorKind::StorageCorrupt, format!("{path} read returned nothing"))
        })?;
        decode_rev_num(bytes)
    }

    /// Read changes `start_inc..end_exc`, in order.
    ///
    /// An empty range is always valid. Any absent change fails
    /// `revision_not_available`; a change that does not decode or whose
    /// stored revision disagrees with its key fails `storage_corrupt`.
    pub fn read_range(&self, start_inc: RevNum, end_exc: RevNum) -> Result<Vec<Change<D>>> {
        if start_inc > end_exc {
            return Err(ControlError::bad_value(format!(
                "invalid change range {start_inc}..{end_exc}"
            )));
        }
        if start_inc == end_exc {
            return Ok(Vec::new());
        }
        let head = self.current_rev_num()?;
        if end_exc > head + 1 {
            return Err(ControlError::revision_not_available(end_exc - 1, head));
        }

        let mut changes = Vec::with_capacity((end_exc - start_inc) as usize);
        let mut rev = start_inc;
        while rev < end_exc {
            let batch_end = end_exc.min(rev + self.max_reads_per_tx as RevNum);
            let mut spec = TransactionSpec::new();
            for r in rev..batch_end {
                spec = spec.read_path(self.change_path(r));
            }
            let result = self.file.transact(spec)?;
            for r in rev..batch_end {
                let path = self.change_path(r);
                let bytes = result.data.get(&path).ok_or_else(|| {
                    ControlError::revision_not_available(r, head)
                })?;
                let change = Change::<D>::decode(bytes)
                    .map_err(|e| e.context(format!("{path}")))?;
                if change.rev_num != r {
                    return Err(ControlError::new(
                        ErrorKind::StorageCorrupt,
                        format!("{path} holds revision {}", change.rev_num),
                    ));
                }
                changes.push(change);
            }
            rev = batch_end;
        }
        Ok(changes)
    }

    /// Suspend until the stream's head exceeds `base_rev`.
    ///
    /// Resolves immediately if it already does. `timeout == None` waits
    /// forever; fails `timed_out` / `aborted` otherwise.
    pub async fn wait_for_change_after(
        &self,
        base_rev: RevNum,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let path = self.rev_num_path();
        loop {
            // Observe the file revision before the head read so a
            // commit landing in between still wakes the wait.
            let observed = self.file.file_rev();
            if self.current_rev_num()? > base_rev {
                return Ok(());
            }
            let remaining = match deadline {
                None => None,
                Some(d) => {
                    let now = tokio::time::Instant::now();
                    if d <= now {
                        return Err(ControlError::new(
                            ErrorKind::TimedOut,
                            format!("no change after revision {base_rev} in time"),
                        ));
                    }
                    Some(d - now)
                }
            };
            when_change(&*self.file, observed, &path, remaining, cancel)
                .await
                .map_err(|e| match e {
                    FileError::TimedOut => ControlError::new(
                        ErrorKind::TimedOut,
                        format!("no change after revision {base_rev} in time"),
                    ),
                    FileError::TransactionAborted(_) => ControlError::new(
                        ErrorKind::Aborted,
                        format!("wait after revision {base_rev} cancelled"),
                    ),
                    other => other.into(),
                })?;
        }
    }
}
