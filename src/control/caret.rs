//! Caret stream adapter and session surface.
//!
//! [`CaretControl`] wraps the generic caret [`ControlStream`] with the
//! session lifecycle: fresh caret allocation (collision-free ID, spread
//! color), liveness checks, field updates, idle reaping, and the
//! denormalized `/session/<caretId>` records mirroring live carets.
//!
//! Idle tracking runs on the tokio clock so paused-clock tests can
//! drive the reaper deterministically.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::body::validate_shape;
use super::{ControlStream, FailureFlag, StreamAdapter};
use crate::change::Change;
use crate::color::{is_valid_color, pick_caret_color};
use crate::config::EngineConfig;
use crate::delta::{Caret, CaretDelta, CaretField, CaretOp, FieldValue};
use crate::error::{ControlError, ErrorKind, Result};
use crate::file::{FileAccess, TransactionSpec};
use crate::types::{AuthorId, CancelToken, CaretId, RevNum, StoragePath};

/// Characters in a generated caret ID.
const CARET_ID_LEN: usize = 8;

/// Adapter for the `/caret` stream.
pub struct CaretAdapter;

impl StreamAdapter for CaretAdapter {
    type Delta = CaretDelta;
    const PREFIX: &'static str = "caret";

    fn validate_change(change: &Change<CaretDelta>) -> Result<()> {
        validate_shape(change)?;
        for op in change.delta.ops() {
            match op {
                CaretOp::Begin { caret_id, color, .. } => {
                    validate_caret_id(caret_id)?;
                    if !is_valid_color(color) {
                        return Err(ControlError::bad_value(format!(
                            "invalid caret color {color:?}"
                        )));
                    }
                }
                CaretOp::Set { caret_id, field, value } => {
                    validate_caret_id(caret_id)?;
                    if let (CaretField::Color, FieldValue::Color(color)) = (field, value) {
                        if !is_valid_color(color) {
                            return Err(ControlError::bad_value(format!(
                                "invalid caret color {color:?}"
                            )));
                        }
                    }
                }
                CaretOp::End { caret_id } => validate_caret_id(caret_id)?,
            }
        }
        Ok(())
    }
}

fn validate_caret_id(caret_id: &str) -> Result<()> {
    if caret_id.is_empty()
        || !caret_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(ControlError::bad_value(format!(
            "invalid caret id {caret_id:?}"
        )));
    }
    Ok(())
}

/// The caret control: change log plus session lifecycle.
pub struct CaretControl {
    stream: ControlStream<CaretAdapter>,
    file: Arc<dyn FileAccess>,
    idle_threshold: Duration,
    /// Last update instant per live caret, on the tokio clock.
    activity: Mutex<HashMap<CaretId, Instant>>,
}

impl CaretControl {
    /// A caret control over `file`.
    pub fn new(
        file: Arc<dyn FileAccess>,
        config: EngineConfig,
        failure: Arc<FailureFlag>,
    ) -> Self {
        let idle_threshold = config.caret_idle_threshold;
        Self {
            stream: ControlStream::new(file.clone(), config, failure),
            file,
            idle_threshold,
            activity: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying change log.
    pub fn stream(&self) -> &ControlStream<CaretAdapter> {
        &self.stream
    }

    /// Live carets at `rev` (default: current head).
    pub async fn carets(&self, rev: Option<RevNum>) -> Result<BTreeMap<CaretId, Caret>> {
        let snapshot = self.stream.get_snapshot(rev).await?;
        snapshot.contents.carets()
    }

    /// Start a session for `author_id`: fresh caret ID, spread color,
    /// begin-session change. `doc_rev` is the body head the caller
    /// observed.
    pub async fn make_new_session(
        &self,
        author_id: AuthorId,
        doc_rev: RevNum,
        cancel: &CancelToken,
    ) -> Result<Caret> {
        let snapshot = self.stream.get_snapshot(None).await?;
        let carets = snapshot.contents.carets()?;

        let mut caret_id = new_caret_id();
        while carets.contains_key(&caret_id) {
            caret_id = new_caret_id();
        }
        let in_use: Vec<String> = carets.values().map(|c| c.color.clone()).collect();
        let color = pick_caret_color(&in_use);

        let delta = CaretDelta::from_ops(vec![CaretOp::Begin {
            caret_id: caret_id.clone(),
            author_id: author_id.clone(),
            doc_rev,
            color: color.clone(),
        }]);
        self.stream
            .apply_change(snapshot.rev_num, delta, Some(author_id.clone()), cancel)
            .await?;

        let caret = Caret {
            caret_id: caret_id.clone(),
            author_id,
            doc_rev,
            index: 0,
            length: 0,
            color,
        };
        self.note_activity(&caret_id);
        self.write_session_record(&caret)?;
        log::info!("session {caret_id} begun for author {}", caret.author_id);
        Ok(caret)
    }

    /// Look up a live session, enforcing ownership. Fails
    /// `unknown_session` / `wrong_author`.
    pub async fn find_existing_session(
        &self,
        author_id: &str,
        caret_id: &str,
    ) -> Result<Caret> {
        let carets = self.carets(None).await?;
        let caret = carets.get(caret_id).ok_or_else(|| {
            ControlError::new(
                ErrorKind::UnknownSession,
                format!("no live session {caret_id}"),
            )
        })?;
        if caret.author_id != author_id {
            return Err(ControlError::new(
                ErrorKind::WrongAuthor,
                format!("session {caret_id} belongs to another author"),
            ));
        }
        Ok(caret.clone())
    }

    /// Update a live caret's selection and observed body revision.
    pub async fn update_caret(
        &self,
        caret_id: &str,
        index: u64,
        length: u64,
        doc_rev: RevNum,
        cancel: &CancelToken,
    ) -> Result<RevNum> {
        let snapshot = self.stream.get_snapshot(None).await?;
        let carets = snapshot.contents.carets()?;
        let caret = carets.get(caret_id).ok_or_else(|| {
            ControlError::new(
                ErrorKind::UnknownSession,
                format!("no live session {caret_id}"),
            )
        })?;

        let delta = CaretDelta::from_ops(vec![
            CaretOp::Set {
                caret_id: caret_id.to_string(),
                field: CaretField::Index,
                value: FieldValue::Num(index),
            },
            CaretOp::Set {
                caret_id: caret_id.to_string(),
                field: CaretField::Length,
                value: FieldValue::Num(length),
            },
            CaretOp::Set {
                caret_id: caret_id.to_string(),
                field: CaretField::DocRev,
                value: FieldValue::Num(doc_rev),
            },
        ]);
        let result = self
            .stream
            .apply_change(
                snapshot.rev_num,
                delta,
                Some(caret.author_id.clone()),
                cancel,
            )
            .await?;

        self.note_activity(caret_id);
        let updated = Caret {
            index,
            length,
            doc_rev: caret.doc_rev.max(doc_rev),
            ..caret.clone()
        };
        self.write_session_record(&updated)?;
        Ok(result.rev_num)
    }

    /// End a session. A no-op if the caret is already gone.
    pub async fn end_session(&self, caret_id: &str, cancel: &CancelToken) -> Result<()> {
        let snapshot = self.stream.get_snapshot(None).await?;
        if !snapshot.contents.carets()?.contains_key(caret_id) {
            return Ok(());
        }
        let delta = CaretDelta::from_ops(vec![CaretOp::End {
            caret_id: caret_id.to_string(),
        }]);
        self.stream
            .apply_change(snapshot.rev_num, delta, None, cancel)
            .await?;
        self.forget_activity(caret_id);
        self.delete_session_record(caret_id)?;
        log::info!("session {caret_id} ended");
        Ok(())
    }

    /// End every caret idle longer than the threshold. Returns the
    /// reaped IDs so callers can drop their session bindings.
    pub async fn reap_idle(&self, cancel: &CancelToken) -> Result<Vec<CaretId>> {
        let snapshot = self.stream.get_snapshot(None).await?;
        let carets = snapshot.contents.carets()?;
        let now = Instant::now();

        let stale: Vec<CaretId> = {
            let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            carets
                .keys()
                .filter(|id| {
                    // A caret with no recorded activity (e.g. right
                    // after reopen) starts its idle clock now.
                    let last = *activity.entry((*id).clone()).or_insert(now);
                    now.saturating_duration_since(last) > self.idle_threshold
                })
                .cloned()
                .collect()
        };
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let delta = CaretDelta::from_ops(
            stale
                .iter()
                .map(|id| CaretOp::End { caret_id: id.clone() })
                .collect(),
        );
        self.stream
            .apply_change(snapshot.rev_num, delta, None, cancel)
            .await?;
        for id in &stale {
            self.forget_activity(id);
            self.delete_session_record(id)?;
        }
        log::info!("reaped {} idle caret(s): {stale:?}", stale.len());
        Ok(stale)
    }

    /// Rebuild `/session/<caretId>` records from the current snapshot;
    /// called at open so the mirror agrees with the log.
    pub async fn sync_session_records(&self) -> Result<()> {
        let carets = self.carets(None).await?;

        let listed = self
            .file
            .transact(TransactionSpec::new().list_path(session_prefix()))
            .map_err(ControlError::from)?;
        let mut spec = TransactionSpec::new();
        for path in &listed.paths {
            if !carets.contains_key(path.last_component()) {
                spec = spec.delete_path(path.clone());
            }
        }
        for caret in carets.values() {
            spec = spec.write_path(session_path(&caret.caret_id)?, encode_caret(caret)?);
        }
        self.file.transact(spec).map_err(ControlError::from)?;

        let now = Instant::now();
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        activity.clear();
        for id in carets.keys() {
            activity.insert(id.clone(), now);
        }
        Ok(())
    }

    fn note_activity(&self, caret_id: &str) {
        self.activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(caret_id.to_string(), Instant::now());
    }

    fn forget_activity(&self, caret_id: &str) {
        self.activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(caret_id);
    }

    fn write_session_record(&self, caret: &Caret) -> Result<()> {
        self.file
            .transact(
                TransactionSpec::new()
                    .write_path(session_path(&caret.caret_id)?, encode_caret(caret)?),
            )
            .map_err(ControlError::from)?;
        Ok(())
    }

    fn delete_session_record(&self, caret_id: &str) -> Result<()> {
        self.file
            .transact(TransactionSpec::new().delete_path(session_path(caret_id)?))
            .map_err(ControlError::from)?;
        Ok(())
    }
}

fn session_prefix() -> StoragePath {
    StoragePath::parse("/session").unwrap_or_else(|_| unreachable!("fixed path"))
}

fn session_path(caret_id: &str) -> Result<StoragePath> {
    session_prefix().join(caret_id)
}

fn encode_caret(caret: &Caret) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(caret, bincode::config::standard()).map_err(|e| {
        ControlError::new(
            ErrorKind::InvariantViolation,
            format!("caret record failed to encode: {e}"),
        )
    })
}

fn new_caret_id() -> CaretId {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CARET_ID_LEN)
        .map(char::from)
        .collect()
}
