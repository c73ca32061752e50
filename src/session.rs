//! Author-facing session handles and the per-document registry.
//!
//! A [`Session`] is a live `(authorId, caretId)` binding: every edit
//! submitted through it is stamped with the session's author. The
//! [`SessionRegistry`] tracks which bindings are live; it is pruned
//! alongside caret reaping.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::change::{Change, Snapshot};
use crate::control::{BodyControl, CaretControl, PropertyControl};
use crate::delta::{BodyDelta, PropertyDelta, PropertyOp};
use crate::error::Result;
use crate::types::{AuthorId, CancelToken, CaretId, RevNum};

/// A live editing session.
#[derive(Clone)]
pub struct Session {
    author_id: AuthorId,
    caret_id: CaretId,
    body: Arc<BodyControl>,
    caret: Arc<CaretControl>,
    property: Arc<PropertyControl>,
    registry: Arc<SessionRegistry>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("author_id", &self.author_id)
            .field("caret_id", &self.caret_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        author_id: AuthorId,
        caret_id: CaretId,
        body: Arc<BodyControl>,
        caret: Arc<CaretControl>,
        property: Arc<PropertyControl>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            author_id,
            caret_id,
            body,
            caret,
            property,
            registry,
        }
    }

    /// The owning author.
    pub fn author_id(&self) -> &AuthorId {
        &self.author_id
    }

    /// This session's caret token.
    pub fn caret_id(&self) -> &CaretId {
        &self.caret_id
    }

    /// Body snapshot at `rev` (default: head).
    pub async fn get_snapshot(&self, rev: Option<RevNum>) -> Result<Snapshot<BodyDelta>> {
        self.body.get_snapshot(rev).await
    }

    /// Long-poll the body log past `base_rev`.
    pub async fn get_change_after(
        &self,
        base_rev: RevNum,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<Change<BodyDelta>> {
        self.body.get_change_after(base_rev, timeout, cancel).await
    }

    /// Apply a body edit, stamped with this session's author.
    pub async fn apply_change(
        &self,
        base_rev: RevNum,
        delta: BodyDelta,
        cancel: &CancelToken,
    ) -> Result<Change<BodyDelta>> {
        self.body
            .apply_change(base_rev, delta, Some(self.author_id.clone()), cancel)
            .await
    }

    /// Move this session's caret.
    pub async fn update_caret(
        &self,
        index: u64,
        length: u64,
        doc_rev: RevNum,
        cancel: &CancelToken,
    ) -> Result<RevNum> {
        self.caret
            .update_caret(&self.caret_id, index, length, doc_rev, cancel)
            .await
    }

    /// Set a document property, stamped with this session's author.
    pub async fn set_property(
        &self,
        name: &str,
        value: &str,
        cancel: &CancelToken,
    ) -> Result<Change<PropertyDelta>> {
        let head = self.property.current_rev_num()?;
        let delta = PropertyDelta::from_ops(vec![PropertyOp::Set {
            name: name.to_string(),
            value: value.to_string(),
        }]);
        self.property
            .apply_change(head, delta, Some(self.author_id.clone()), cancel)
            .await
    }

    /// Delete a document property.
    pub async fn delete_property(
        &self,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<Change<PropertyDelta>> {
        let head = self.property.current_rev_num()?;
        let delta = PropertyDelta::from_ops(vec![PropertyOp::Delete {
            name: name.to_string(),
        }]);
        self.property
            .apply_change(head, delta, Some(self.author_id.clone()), cancel)
            .await
    }

    /// End this session and drop its registry binding.
    pub async fn end_session(&self, cancel: &CancelToken) -> Result<()> {
        self.caret.end_session(&self.caret_id, cancel).await?;
        self.registry.remove(&self.author_id, &self.caret_id);
        Ok(())
    }
}

/// Live `(authorId, caretId)` bindings for one document.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    map: Mutex<HashMap<AuthorId, BTreeSet<CaretId>>>,
}

impl SessionRegistry {
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<AuthorId, BTreeSet<CaretId>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a live binding.
    pub fn insert(&self, author_id: &str, caret_id: &str) {
        self.lock()
            .entry(author_id.to_string())
            .or_default()
            .insert(caret_id.to_string());
    }

    /// Whether the binding is live.
    pub fn contains(&self, author_id: &str, caret_id: &str) -> bool {
        self.lock()
            .get(author_id)
            .is_some_and(|set| set.contains(caret_id))
    }

    /// Drop one binding.
    pub fn remove(&self, author_id: &str, caret_id: &str) {
        let mut map = self.lock();
        if let Some(set) = map.get_mut(author_id) {
            set.remove(caret_id);
            if set.is_empty() {
                map.remove(author_id);
            }
        }
    }

    /// Drop a binding by caret alone (author unknown, e.g. the
    /// reaper). Returns the author it belonged to, if any.
    pub fn remove_caret(&self, caret_id: &str) -> Option<AuthorId> {
        let mut map = self.lock();
        let author = map
            .iter()
            .find(|(_, set)| set.contains(caret_id))
            .map(|(author, _)| author.clone())?;
        if let Some(set) = map.get_mut(&author) {
            set.remove(caret_id);
            if set.is_empty() {
                map.remove(&author);
            }
        }
        Some(author)
    }

    /// Caret IDs bound to `author_id`.
    pub fn carets_for(&self, author_id: &str) -> Vec<CaretId> {
        self.lock()
            .get(author_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total live bindings.
    pub fn session_count(&self) -> usize {
        self.lock().values().map(BTreeSet::len).sum()
    }

    /// Drop everything (document deleted).
    pub fn clear(&self) {
        self.lock().clear();
    }
}
