//! Shared primitive types: revision numbers, identifiers, storage paths,
//! and the cancellation token used by suspending operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{ControlError, ErrorKind};

/// Revision number of a change stream. Revision 0 of the body is the
/// empty document.
pub type RevNum = u64;

/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Document identifier.
pub type DocId = Uuid;

/// Author identifier, minted by the surrounding auth layer and treated
/// as opaque here.
pub type AuthorId = String;

/// Short opaque caret/session token, unique per document.
pub type CaretId = String;

/// A validated storage key: slash-prefixed, `/`-separated components of
/// `[a-zA-Z0-9_]+`. No empty components, no trailing slash, and the bare
/// `/` is forbidden.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoragePath(String);

impl StoragePath {
    /// Parse and validate a path string.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        let Some(rest) = s.strip_prefix('/') else {
            return Err(ControlError::new(
                ErrorKind::BadValue,
                format!("storage path must start with '/': {s:?}"),
            ));
        };
        if rest.is_empty() {
            return Err(ControlError::new(
                ErrorKind::BadValue,
                "storage path must have at least one component",
            ));
        }
        for component in rest.split('/') {
            if component.is_empty() {
                return Err(ControlError::new(
                    ErrorKind::BadValue,
                    format!("empty component in storage path {s:?}"),
                ));
            }
            if !component
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(ControlError::new(
                    ErrorKind::BadValue,
                    format!("invalid component {component:?} in storage path"),
                ));
            }
        }
        Ok(Self(s.to_string()))
    }

    /// Append one component, which must itself be valid.
    pub fn join(&self, component: &str) -> Result<Self, ControlError> {
        Self::parse(&format!("{}/{}", self.0, component))
    }

    /// The full path string, including the leading slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` is a direct child of `prefix`.
    pub fn is_child_of(&self, prefix: &StoragePath) -> bool {
        match self.0.strip_prefix(&prefix.0) {
            Some(rest) => {
                rest.len() > 1 && rest.starts_with('/') && !rest[1..].contains('/')
            }
            None => false,
        }
    }

    /// The final path component.
    pub fn last_component(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cancellation token for suspending operations.
///
/// Cloned freely; all clones observe the same cancellation. The
/// [`CancelToken::never`] token never fires and is the default for
/// callers that rely on dropping the future instead.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// The owning side of a [`CancelToken`]. Dropping the handle does NOT
/// cancel; only [`CancelHandle::cancel`] does.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    /// A token that never cancels.
    pub fn never() -> Self {
        static NEVER: std::sync::OnceLock<watch::Receiver<bool>> = std::sync::OnceLock::new();
        let rx = NEVER
            .get_or_init(|| {
                let (tx, rx) = watch::channel(false);
                // One process-lifetime sender keeps every clone pending.
                std::mem::forget(tx);
                rx
            })
            .clone();
        Self { rx }
    }

    /// Create a cancellable token plus its handle.
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested; pends forever on a
    /// never-token.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: treat as never.
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl CancelHandle {
    /// Request cancellation. All token clones observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}
