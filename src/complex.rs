//! Per-document coordination and lifecycle.
//!
//! ```text
//! ComplexRegistry ── docId ──► DocComplex
//!                              ├── BodyControl      /body/…
//!                              ├── CaretControl     /caret/…, /session/…
//!                              ├── PropertyControl  /property/…
//!                              ├── SessionRegistry
//!                              └── idle reaper task
//! ```
//!
//! The registry guarantees at most one live [`DocComplex`] per document
//! ID; concurrent opens share the instance. A complex whose failure
//! flag is set is dropped and re-validated on the next open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::task::JoinHandle;

use crate::change::Change;
use crate::config::EngineConfig;
use crate::control::{
    BodyControl, CaretControl, FailureFlag, PropertyControl,
};
use crate::delta::{BodyDelta, Delta};
use crate::error::{ControlError, ErrorKind, Result};
use crate::file::{FileAccess, FileError, FileSource, TransactionSpec};
use crate::session::{Session, SessionRegistry};
use crate::types::{AuthorId, CancelToken, DocId, StoragePath, Timestamp};

/// Outcome of opening a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    /// No file exists for the document.
    NotFound,
    /// The document is valid and usable.
    Ok,
    /// The file's format version is not this engine's; the document
    /// needs migration and refuses mutations.
    Migrate,
    /// The file exists but failed validation.
    Error,
}

/// One document's in-memory coordinator.
pub struct DocComplex {
    doc_id: DocId,
    file: Arc<dyn FileAccess>,
    config: EngineConfig,
    body: Arc<BodyControl>,
    caret: Arc<CaretControl>,
    property: Arc<PropertyControl>,
    registry: Arc<SessionRegistry>,
    failure: Arc<FailureFlag>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl DocComplex {
    fn new(doc_id: DocId, file: Arc<dyn FileAccess>, config: EngineConfig) -> Arc<Self> {
        let failure = FailureFlag::new();
        let body = Arc::new(BodyControl::new(
            file.clone(),
            config.clone(),
            failure.clone(),
        ));
        let caret = Arc::new(CaretControl::new(
            file.clone(),
            config.clone(),
            failure.clone(),
        ));
        let property = Arc::new(PropertyControl::new(
            file.clone(),
            config.clone(),
            failure.clone(),
        ));
        Arc::new(Self {
            doc_id,
            file,
            config,
            body,
            caret,
            property,
            registry: SessionRegistry::new(),
            failure,
            reaper: Mutex::new(None),
        })
    }

    /// The document ID.
    pub fn doc_id(&self) -> DocId {
        self.doc_id
    }

    /// The body control.
    pub fn body(&self) -> &Arc<BodyControl> {
        &self.body
    }

    /// The caret control.
    pub fn caret(&self) -> &Arc<CaretControl> {
        &self.caret
    }

    /// The property control.
    pub fn property(&self) -> &Arc<PropertyControl> {
        &self.property
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether a fatal failure has been recorded.
    pub fn is_failed(&self) -> bool {
        self.failure.is_failed()
    }

    /// Initialize the document file.
    ///
    /// One atomic transaction requiring the format version and all
    /// three stream heads to be absent: writes the format version, the
    /// empty change 0 per stream, and — when non-empty initial body
    /// content (a document delta) is supplied — the body's change 1.
    pub async fn create(&self, initial_body: Option<BodyDelta>) -> Result<()> {
        let initial_body = initial_body.filter(|d| !d.is_empty());
        if let Some(d) = &initial_body {
            if !d.is_document() {
                return Err(ControlError::bad_value(
                    "initial body content must be a document delta",
                ));
            }
        }

        self.file.create().map_err(ControlError::from)?;

        let mut spec = TransactionSpec::new().check_path_empty(format_version_path());
        for prefix in STREAM_PREFIXES {
            spec = spec.check_path_empty(rev_num_path(prefix)?);
        }
        spec = spec.write_path(
            format_version_path(),
            self.config.format_version.as_bytes().to_vec(),
        );
        let body_head = if initial_body.is_some() { 1 } else { 0 };
        spec = spec
            .write_path(
                change_path("body", 0)?,
                Change::<BodyDelta>::first().encode()?,
            )
            .write_path(
                rev_num_path("body")?,
                crate::change::encode_rev_num(body_head)?,
            )
            .write_path(
                change_path("caret", 0)?,
                Change::<crate::delta::CaretDelta>::first().encode()?,
            )
            .write_path(rev_num_path("caret")?, crate::change::encode_rev_num(0)?)
            .write_path(
                change_path("property", 0)?,
                Change::<crate::delta::PropertyDelta>::first().encode()?,
            )
            .write_path(
                rev_num_path("property")?,
                crate::change::encode_rev_num(0)?,
            );
        if let Some(delta) = initial_body {
            let change = Change {
                rev_num: 1,
                delta,
                timestamp: Some(now_ms()),
                author_id: None,
            };
            spec = spec.write_path(change_path("body", 1)?, change.encode()?);
        }

        self.file.transact(spec).map_err(|e| match e {
            FileError::PathNotEmpty(path) => ControlError::new(
                ErrorKind::PathNotEmpty,
                format!("document already initialized ({path})"),
            ),
            other => other.into(),
        })?;
        log::info!("document {} created", self.doc_id);
        Ok(())
    }

    /// Probe and validate the document without mutating it.
    pub async fn open_status(&self) -> DocStatus {
        if !self.file.exists() {
            return DocStatus::NotFound;
        }

        let version = self
            .file
            .transact(TransactionSpec::new().read_path(format_version_path()));
        match version {
            Ok(result) => {
                let stored = result
                    .data
                    .get(&format_version_path())
                    .map(|bytes| String::from_utf8_lossy(bytes).to_string());
                if stored.as_deref() != Some(self.config.format_version.as_str()) {
                    log::warn!(
                        "document {} has format version {stored:?}, engine wants {:?}",
                        self.doc_id,
                        self.config.format_version
                    );
                    return DocStatus::Migrate;
                }
            }
            Err(_) => {
                self.failure.fail(ErrorKind::StorageCorrupt);
                return DocStatus::Error;
            }
        }

        if let Err(e) = self.validate_all().await {
            log::error!("document {} failed validation: {e}", self.doc_id);
            return DocStatus::Error;
        }
        log::info!("document {} opened", self.doc_id);
        DocStatus::Ok
    }

    async fn validate_all(&self) -> Result<()> {
        self.body.validate().await?;
        self.caret.stream().validate().await?;
        self.property.validate().await?;
        self.caret.sync_session_records().await?;
        Ok(())
    }

    /// Begin a session for `author_id`.
    pub async fn make_new_session(
        &self,
        author_id: AuthorId,
        cancel: &CancelToken,
    ) -> Result<Session> {
        let body_head = self.body.current_rev_num()?;
        let caret = self
            .caret
            .make_new_session(author_id.clone(), body_head, cancel)
            .await?;
        self.registry.insert(&author_id, &caret.caret_id);
        Ok(self.session_handle(author_id, caret.caret_id))
    }

    /// Re-attach to a live session. Fails `unknown_session` /
    /// `wrong_author`.
    pub async fn find_existing_session(
        &self,
        author_id: &str,
        caret_id: &str,
    ) -> Result<Session> {
        let caret = self
            .caret
            .find_existing_session(author_id, caret_id)
            .await?;
        // Re-bind: the caret may predate this process's registry.
        self.registry.insert(author_id, &caret.caret_id);
        Ok(self.session_handle(author_id.to_string(), caret.caret_id))
    }

    fn session_handle(&self, author_id: AuthorId, caret_id: String) -> Session {
        Session::new(
            author_id,
            caret_id,
            self.body.clone(),
            self.caret.clone(),
            self.property.clone(),
            self.registry.clone(),
        )
    }

    /// Reap idle carets once and drop their registry bindings.
    /// The background reaper calls this on every tick.
    pub async fn reap_idle_sessions(&self) -> Result<Vec<String>> {
        let reaped = self.caret.reap_idle(&CancelToken::never()).await?;
        for caret_id in &reaped {
            self.registry.remove_caret(caret_id);
        }
        Ok(reaped)
    }

    /// Delete the document file and discard in-memory state. Handles
    /// still pointing at this complex fail fast afterwards.
    pub async fn delete(&self) -> Result<()> {
        self.file.delete().map_err(ControlError::from)?;
        self.registry.clear();
        self.failure.fail(ErrorKind::StorageCorrupt);
        log::info!("document {} deleted", self.doc_id);
        Ok(())
    }

    fn start_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.reaper_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(complex) = weak.upgrade() else { break };
                match complex.reap_idle_sessions().await {
                    Ok(reaped) if !reaped.is_empty() => {
                        log::debug!(
                            "reaper dropped {} session(s) on document {}",
                            reaped.len(),
                            complex.doc_id
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!(
                            "reaper failed on document {}: {e}",
                            complex.doc_id
                        );
                        if e.kind().is_fatal() {
                            break;
                        }
                    }
                }
            }
        });
        let mut slot = self.reaper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }
}

impl Drop for DocComplex {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Outcome of [`ComplexRegistry::open`].
pub struct OpenOutcome {
    /// What the probe found.
    pub status: DocStatus,
    /// The usable complex; `Some` only when `status` is
    /// [`DocStatus::Ok`], so migrate/error documents structurally
    /// refuse mutations.
    pub complex: Option<Arc<DocComplex>>,
}

/// Process-owned map of live document complexes.
pub struct ComplexRegistry {
    source: Arc<dyn FileSource>,
    config: EngineConfig,
    complexes: tokio::sync::Mutex<HashMap<DocId, Arc<DocComplex>>>,
}

impl ComplexRegistry {
    /// A registry over `source`.
    pub fn new(source: Arc<dyn FileSource>, config: EngineConfig) -> Self {
        Self {
            source,
            config,
            complexes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Open (or share) the complex for `doc_id`.
    ///
    /// At most one live complex exists per document; concurrent opens
    /// share it. A previously failed instance is discarded and the
    /// document re-validated.
    pub async fn open(&self, doc_id: DocId) -> OpenOutcome {
        let mut complexes = self.complexes.lock().await;
        if let Some(existing) = complexes.get(&doc_id) {
            if !existing.is_failed() {
                return OpenOutcome {
                    status: DocStatus::Ok,
                    complex: Some(existing.clone()),
                };
            }
            complexes.remove(&doc_id);
        }

        let complex = DocComplex::new(doc_id, self.source.file_for(doc_id), self.config.clone());
        let status = complex.open_status().await;
        if status == DocStatus::Ok {
            complex.start_reaper();
            complexes.insert(doc_id, complex.clone());
            OpenOutcome {
                status,
                complex: Some(complex),
            }
        } else {
            OpenOutcome {
                status,
                complex: None,
            }
        }
    }

    /// Create and open a new document.
    pub async fn create(
        &self,
        doc_id: DocId,
        initial_body: Option<BodyDelta>,
    ) -> Result<Arc<DocComplex>> {
        let mut complexes = self.complexes.lock().await;
        if complexes.contains_key(&doc_id) {
            return Err(ControlError::bad_value(format!(
                "document {doc_id} is already open"
            )));
        }

        let complex = DocComplex::new(doc_id, self.source.file_for(doc_id), self.config.clone());
        complex.create(initial_body).await?;
        match complex.open_status().await {
            DocStatus::Ok => {
                complex.start_reaper();
                complexes.insert(doc_id, complex.clone());
                Ok(complex)
            }
            status => Err(ControlError::new(
                ErrorKind::StorageCorrupt,
                format!("freshly created document {doc_id} opened as {status:?}"),
            )),
        }
    }

    /// Delete a document: storage-layer delete plus in-memory discard.
    pub async fn delete(&self, doc_id: DocId) -> Result<()> {
        let mut complexes = self.complexes.lock().await;
        if let Some(complex) = complexes.remove(&doc_id) {
            complex.delete().await
        } else {
            let file = self.source.file_for(doc_id);
            file.delete().map_err(ControlError::from)
        }
    }

    /// Number of live complexes.
    pub async fn live_count(&self) -> usize {
        self.complexes.lock().await.len()
    }
}

const STREAM_PREFIXES: &[&str] = &["body", "caret", "property"];

fn format_version_path() -> StoragePath {
    StoragePath::parse("/format_version").unwrap_or_else(|_| unreachable!("fixed path"))
}

fn rev_num_path(prefix: &str) -> Result<StoragePath> {
    StoragePath::parse(&format!("/{prefix}/revision_number"))
}

fn change_path(prefix: &str, rev: u64) -> Result<StoragePath> {
    StoragePath::parse(&format!("/{prefix}/change/{rev}"))
}

fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
