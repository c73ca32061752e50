//! Revisioned control streams.
//!
//! One [`ControlStream`] per stream (body, caret, property) of a live
//! document:
//!
//! ```text
//!            apply_change(base, delta)          get_change_after(base)
//!                    │                                  │
//!                    ▼                                  ▼
//!            ┌──────────────┐  snapshots  ┌───────────────────────┐
//!            │ writer mutex │ ◄────────── │  waiters (long poll)  │
//!            └──────┬───────┘             └───────────▲───────────┘
//!                   │ conditional append              │ commit events
//!                   ▼                                 │
//!            /<stream>/change/<N+1>  ─────────────────┘
//!            /<stream>/revision_number
//! ```
//!
//! The stream differences (delta algebra, path prefix, extra change
//! validation) live behind [`StreamAdapter`]; the log discipline, the
//! OT apply loop, the snapshot cache, and the long-poll machinery are
//! shared here.

pub mod body;
pub mod cache;
pub mod caret;
pub mod property;
pub mod reader;

pub use body::{BodyAdapter, BodyControl};
pub use caret::{CaretAdapter, CaretControl};
pub use property::{PropertyAdapter, PropertyControl};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;

use crate::change::{encode_rev_num, Change, Snapshot};
use crate::config::EngineConfig;
use crate::delta::Delta;
use crate::error::{ControlError, ErrorKind, Result};
use crate::file::{FileAccess, FileError, TransactionSpec};
use crate::types::{AuthorId, CancelToken, RevNum, Timestamp};

use cache::SnapshotCache;
use reader::ChangeReader;

/// What makes one stream different from the others.
pub trait StreamAdapter: Send + Sync + 'static {
    /// The stream's delta algebra.
    type Delta: Delta;

    /// Path prefix under the document file (`body`, `caret`,
    /// `property`).
    const PREFIX: &'static str;

    /// Stream-specific validation of a change about to be appended or
    /// read back during full-log validation.
    fn validate_change(change: &Change<Self::Delta>) -> Result<()>;
}

/// Shared fatal-failure marker for one document.
///
/// Set on `storage_corrupt` / `invariant_violation`; every later call
/// on any of the document's controls fails fast with the recorded kind
/// until the document is reopened.
#[derive(Debug, Default)]
pub struct FailureFlag {
    kind: Mutex<Option<ErrorKind>>,
}

impl FailureFlag {
    /// A fresh, unfailed flag.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a fatal kind; the first one wins.
    pub fn fail(&self, kind: ErrorKind) {
        let mut slot = self.kind.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            log::warn!("document marked failed: {kind}");
            *slot = Some(kind);
        }
    }

    /// Fail fast if a fatal kind has been recorded.
    pub fn check(&self) -> Result<()> {
        match *self.kind.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(kind) => Err(ControlError::new(
                kind,
                "document is unusable until reopened",
            )),
            None => Ok(()),
        }
    }

    /// Whether a fatal kind has been recorded.
    pub fn is_failed(&self) -> bool {
        self.kind
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

/// One revisioned, OT-rebasing change log.
pub struct ControlStream<A: StreamAdapter> {
    file: Arc<dyn FileAccess>,
    config: EngineConfig,
    reader: ChangeReader<A::Delta>,
    cache: SnapshotCache<A::Delta>,
    /// Single-writer discipline: one attempt-and-commit loop at a time.
    writer: AsyncMutex<()>,
    failure: Arc<FailureFlag>,
    /// Largest timestamp appended or observed; appends clamp to it.
    last_timestamp: AtomicU64,
}

impl<A: StreamAdapter> ControlStream<A> {
    /// A control over `/<A::PREFIX>/…` of `file`.
    pub fn new(file: Arc<dyn FileAccess>, config: EngineConfig, failure: Arc<FailureFlag>) -> Self {
        let reader = ChangeReader::new(file.clone(), A::PREFIX, config.max_reads_per_tx);
        let cache = SnapshotCache::new(config.snapshot_cache_cap);
        Self {
            file,
            config,
            reader,
            cache,
            writer: AsyncMutex::new(()),
            failure,
            last_timestamp: AtomicU64::new(0),
        }
    }

    /// Record fatal error kinds on the shared flag as they pass by.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.kind().is_fatal() {
                self.failure.fail(e.kind());
            }
        }
        result
    }

    /// The stream's current head revision.
    pub fn current_rev_num(&self) -> Result<RevNum> {
        self.failure.check()?;
        self.track(self.reader.current_rev_num())
    }

    /// Snapshot at `rev` (default: current head). Fails
    /// `revision_not_available` past the head.
    pub async fn get_snapshot(&self, rev: Option<RevNum>) -> Result<Snapshot<A::Delta>> {
        self.failure.check()?;
        let head = self.track(self.reader.current_rev_num())?;
        let rev = rev.unwrap_or(head);
        if rev > head {
            return Err(ControlError::revision_not_available(rev, head));
        }
        self.snapshot_at(rev, head).await
    }

    /// The single change producing revision `rev`.
    pub fn get_change(&self, rev: RevNum) -> Result<Change<A::Delta>> {
        self.failure.check()?;
        let mut changes = self.track(self.reader.read_range(rev, rev + 1))?;
        Ok(changes.remove(0))
    }

    /// `base` composed with the deltas of changes
    /// `start_inc..end_exc`. The empty range returns `base` unchanged.
    pub fn get_composed_changes(
        &self,
        base: &A::Delta,
        start_inc: RevNum,
        end_exc: RevNum,
    ) -> Result<A::Delta> {
        self.failure.check()?;
        let changes = self.track(self.reader.read_range(start_inc, end_exc))?;
        let mut composed = base.clone();
        for change in &changes {
            composed = composed.compose(&change.delta)?;
        }
        Ok(composed)
    }

    /// A change taking revision `base_rev` to the current head.
    ///
    /// If the head is already past `base_rev`, returns at once;
    /// otherwise suspends until the head advances, the timeout elapses
    /// (`timed_out`), or `cancel` fires (`aborted`). `timeout == None`
    /// never times out. The returned revision is the head at the moment
    /// the wait resolved and is always strictly greater than
    /// `base_rev`.
    pub async fn get_change_after(
        &self,
        base_rev: RevNum,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Change<A::Delta>> {
        self.failure.check()?;
        let head = self.track(self.reader.current_rev_num())?;
        if base_rev > head {
            return Err(ControlError::revision_not_available(base_rev, head));
        }

        self.track(
            self.reader
                .wait_for_change_after(base_rev, timeout, cancel)
                .await,
        )?;
        self.failure.check()?;

        let head = self.track(self.reader.current_rev_num())?;
        let mut changes = self.track(self.reader.read_range(base_rev + 1, head + 1))?;
        if changes.len() == 1 {
            return Ok(changes.remove(0));
        }
        let timestamp = changes.last().and_then(|c| c.timestamp);
        let mut delta = A::Delta::empty();
        for change in &changes {
            delta = delta.compose(&change.delta)?;
        }
        Ok(Change {
            rev_num: head,
            delta,
            timestamp,
            author_id: None,
        })
    }

    /// Apply a client edit via OT.
    ///
    /// `delta` is taken against revision `base_rev`. On success the
    /// returned change carries the new head revision and the
    /// **correction delta**: composing the client's expected result
    /// with it yields the authoritative head contents. The correction
    /// is empty on the fast path (no concurrent changes).
    ///
    /// An empty `delta` short-circuits to `(base_rev, empty)` without
    /// writing. A delta rebased away entirely by concurrent changes
    /// yields `(current_head, empty)` without writing. Lost append
    /// races retry with exponential backoff inside a fixed budget;
    /// exhausting it fails `too_many_retries`.
    pub async fn apply_change(
        &self,
        base_rev: RevNum,
        delta: A::Delta,
        author_id: Option<AuthorId>,
        cancel: &CancelToken,
    ) -> Result<Change<A::Delta>> {
        self.failure.check()?;

        let head = self.track(self.reader.current_rev_num())?;
        if base_rev > head {
            return Err(ControlError::revision_not_available(base_rev, head));
        }

        if delta.is_empty() {
            return Ok(Change {
                rev_num: base_rev,
                delta: A::Delta::empty(),
                timestamp: None,
                author_id: None,
            });
        }

        let base = self.snapshot_at(base_rev, head).await?;
        let expected = base.contents.compose(&delta)?;
        if !expected.is_document() {
            return Err(ControlError::bad_value(format!(
                "delta does not apply cleanly to revision {base_rev}"
            )));
        }

        let _writer = self.writer.lock().await;
        let started = tokio::time::Instant::now();
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ControlError::new(
                    ErrorKind::Aborted,
                    "apply_change cancelled",
                ));
            }

            let current_rev = self.track(self.reader.current_rev_num())?;
            let current = self.snapshot_at(current_rev, current_rev).await?;

            let (to_append, rebased) = if current.rev_num == base.rev_num {
                (delta.clone(), false)
            } else {
                let server_delta = self.get_composed_changes(
                    &A::Delta::empty(),
                    base.rev_num + 1,
                    current.rev_num + 1,
                )?;
                let rebased_delta = server_delta.transform(&delta, true)?;
                if rebased_delta.is_empty() {
                    // The concurrent changes subsumed this edit.
                    return Ok(Change {
                        rev_num: current.rev_num,
                        delta: A::Delta::empty(),
                        timestamp: None,
                        author_id: None,
                    });
                }
                (rebased_delta, true)
            };

            let new_rev = current.rev_num + 1;
            let timestamp = self.next_timestamp();
            let change = Change {
                rev_num: new_rev,
                delta: to_append,
                timestamp: Some(timestamp),
                author_id: author_id.clone(),
            };
            A::validate_change(&change)?;

            match self.append(&change) {
                Ok(()) => {
                    let contents = current.contents.compose(&change.delta)?;
                    if !contents.is_document() {
                        let e = ControlError::new(
                            ErrorKind::InvariantViolation,
                            format!(
                                "{} revision {new_rev} composed to a non-document",
                                A::PREFIX
                            ),
                        );
                        self.failure.fail(e.kind());
                        return Err(e);
                    }
                    self.commit_timestamp(timestamp);
                    let snapshot = Snapshot {
                        rev_num: new_rev,
                        contents,
                    };
                    self.cache.insert(snapshot.clone(), true);

                    let correction = if rebased {
                        expected.diff(&snapshot.contents)?
                    } else {
                        A::Delta::empty()
                    };
                    log::debug!(
                        "{} appended revision {new_rev} (rebased: {rebased}, attempts: {})",
                        A::PREFIX,
                        attempt + 1
                    );
                    return Ok(Change {
                        rev_num: new_rev,
                        delta: correction,
                        timestamp: Some(timestamp),
                        author_id,
                    });
                }
                Err(FileError::PathNotEmpty(_)) => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.config.retry_budget {
                        return Err(ControlError::new(
                            ErrorKind::TooManyRetries,
                            format!(
                                "{} append at revision {new_rev} lost {} races over {elapsed:?}",
                                A::PREFIX,
                                attempt + 1
                            ),
                        ));
                    }
                    attempt += 1;
                    let sleep = backoff.min(self.config.retry_budget - elapsed);
                    log::debug!(
                        "{} append race at revision {new_rev}; retrying in {sleep:?}",
                        A::PREFIX
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(ControlError::new(
                                ErrorKind::Aborted,
                                "apply_change cancelled during backoff",
                            ));
                        }
                        _ = tokio::time::sleep(sleep) => {}
                    }
                    backoff *= self.config.retry_backoff_factor;
                }
                Err(other) => {
                    let e = ControlError::from(other);
                    if e.kind().is_fatal() {
                        self.failure.fail(e.kind());
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Validate the full log: every change `0..=head` present and
    /// well-formed, no keys past the head. Returns the head. Seeds the
    /// timestamp clamp and warms the head snapshot.
    pub async fn validate(&self) -> Result<RevNum> {
        let head = self.track(self.reader.current_rev_num())?;

        let listing = self
            .file
            .transact(TransactionSpec::new().list_path(self.reader.change_prefix()))
            .map_err(ControlError::from)?;
        let mut found = std::collections::BTreeSet::new();
        for path in &listing.paths {
            let rev: RevNum = path.last_component().parse().map_err(|_| {
                ControlError::new(
                    ErrorKind::StorageCorrupt,
                    format!("{path} is not a change revision"),
                )
            })?;
            found.insert(rev);
        }
        let expect: std::collections::BTreeSet<RevNum> = (0..=head).collect();
        if found != expect {
            let e = ControlError::new(
                ErrorKind::StorageCorrupt,
                format!(
                    "{} log keys disagree with head {head} ({} keys found)",
                    A::PREFIX,
                    found.len()
                ),
            );
            self.failure.fail(e.kind());
            return Err(e);
        }

        let changes = self.track(self.reader.read_range(0, head + 1))?;
        let first = &changes[0];
        if !first.delta.is_empty() || first.timestamp.is_some() || first.author_id.is_some() {
            let e = ControlError::new(
                ErrorKind::StorageCorrupt,
                format!("{} change 0 is not the empty change", A::PREFIX),
            );
            self.failure.fail(e.kind());
            return Err(e);
        }

        let mut contents = A::Delta::empty();
        let mut last_ts: Timestamp = 0;
        for change in &changes {
            if let Err(e) = A::validate_change(change) {
                let e = ControlError::new(
                    ErrorKind::StorageCorrupt,
                    format!("{} change {}: {e}", A::PREFIX, change.rev_num),
                );
                self.failure.fail(e.kind());
                return Err(e);
            }
            if let Some(ts) = change.timestamp {
                if ts < last_ts {
                    let e = ControlError::new(
                        ErrorKind::StorageCorrupt,
                        format!(
                            "{} change {} timestamp regressed",
                            A::PREFIX, change.rev_num
                        ),
                    );
                    self.failure.fail(e.kind());
                    return Err(e);
                }
                last_ts = ts;
            }
            contents = contents.compose(&change.delta).map_err(|e| {
                let e = ControlError::new(
                    ErrorKind::StorageCorrupt,
                    format!("{} change {}: {e}", A::PREFIX, change.rev_num),
                );
                self.failure.fail(e.kind());
                e
            })?;
        }
        if !contents.is_document() {
            let e = ControlError::new(
                ErrorKind::StorageCorrupt,
                format!("{} log composes to a non-document", A::PREFIX),
            );
            self.failure.fail(e.kind());
            return Err(e);
        }

        self.last_timestamp.fetch_max(last_ts, Ordering::Relaxed);
        self.cache.insert(
            Snapshot {
                rev_num: head,
                contents,
            },
            true,
        );
        log::info!("{} stream validated at revision {head}", A::PREFIX);
        Ok(head)
    }

    /// Snapshot at `rev`, via the cache: nearest cached base at or
    /// below, forward-composed through the log. At most one concurrent
    /// compute per revision; late arrivals join the cached result.
    async fn snapshot_at(&self, rev: RevNum, head: RevNum) -> Result<Snapshot<A::Delta>> {
        if let Some(snapshot) = self.cache.get(rev) {
            return Ok(snapshot);
        }
        let guard = self.cache.guard(rev);
        let _computing = guard.lock().await;
        if let Some(snapshot) = self.cache.get(rev) {
            self.cache.release_guard(rev);
            return Ok(snapshot);
        }

        let result = self.compute_snapshot(rev).await;
        self.cache.release_guard(rev);
        let snapshot = self.track(result)?;
        self.cache.insert(snapshot.clone(), rev >= head);
        Ok(snapshot)
    }

    async fn compute_snapshot(&self, rev: RevNum) -> Result<Snapshot<A::Delta>> {
        let base = self
            .cache
            .nearest_at_or_below(rev)
            .unwrap_or_else(Snapshot::base);
        let changes = self.reader.read_range(base.rev_num + 1, rev + 1)?;
        let mut contents = base.contents;
        for change in &changes {
            contents = contents.compose(&change.delta)?;
        }
        if !contents.is_document() {
            return Err(ControlError::new(
                ErrorKind::InvariantViolation,
                format!("{} revision {rev} composed to a non-document", A::PREFIX),
            ));
        }
        Ok(Snapshot { rev_num: rev, contents })
    }

    /// Conditional append of `change` as the new head.
    fn append(&self, change: &Change<A::Delta>) -> std::result::Result<(), FileError> {
        let change_path = self.reader.change_path(change.rev_num);
        let encoded = change
            .encode()
            .map_err(|e| FileError::TransactionAborted(e.to_string()))?;
        let rev_bytes = encode_rev_num(change.rev_num)
            .map_err(|e| FileError::TransactionAborted(e.to_string()))?;
        let spec = TransactionSpec::new()
            .check_path_empty(change_path.clone())
            .write_path(change_path, encoded)
            .write_path(self.reader.rev_num_path(), rev_bytes);
        self.file.transact(spec).map(|_| ())
    }

    fn next_timestamp(&self) -> Timestamp {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp;
        now.max(self.last_timestamp.load(Ordering::Relaxed))
    }

    fn commit_timestamp(&self, ts: Timestamp) {
        self.last_timestamp.fetch_max(ts, Ordering::Relaxed);
    }
}
