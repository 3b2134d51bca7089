//! JSON snapshot document and the pending change queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

/// Snapshot read/write failures.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Filesystem failure.
    #[error("snapshot I/O on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Document is not valid JSON of the expected shape.
    #[error("snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// An entity entry is missing a field or has the wrong type.
    #[error("bad {entity} entry: {reason}")]
    Field {
        /// Entity kind.
        entity: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl SnapshotError {
    pub(crate) fn field(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::Field {
            entity,
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The three persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// `principals`, keyed by hex id.
    Principals,
    /// `images`, keyed by hash.
    Images,
    /// `accessors`, keyed by object name.
    Accessors,
}

/// One queued mutation. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Target collection.
    pub collection: Collection,
    /// Entry key.
    pub key: String,
    /// New entry, or `None` to delete.
    pub value: Option<Value>,
}

impl Change {
    /// Insert or replace an entry.
    pub fn upsert(collection: Collection, key: impl Into<String>, value: Value) -> Self {
        Self {
            collection,
            key: key.into(),
            value: Some(value),
        }
    }

    /// Remove an entry.
    pub fn delete(collection: Collection, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
            value: None,
        }
    }
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Principal entries.
    #[serde(default)]
    pub principals: BTreeMap<String, Value>,
    /// Image entries.
    #[serde(default)]
    pub images: BTreeMap<String, Value>,
    /// Accessor entries.
    #[serde(default)]
    pub accessors: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Read a snapshot file. A missing file yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Io`] on read failure, [`SnapshotError::Json`] if the
    /// content does not parse.
    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapshotError::io(path, e)),
        }
    }

    /// Apply one change in place.
    pub fn apply(&mut self, change: Change) {
        let map = match change.collection {
            Collection::Principals => &mut self.principals,
            Collection::Images => &mut self.images,
            Collection::Accessors => &mut self.accessors,
        };
        match change.value {
            Some(value) => {
                map.insert(change.key, value);
            }
            None => {
                map.remove(&change.key);
            }
        }
    }

    /// Total entries across all collections.
    pub fn len(&self) -> usize {
        self.principals
            .len()
            .saturating_add(self.images.len())
            .saturating_add(self.accessors.len())
    }

    /// Whether all collections are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write `contents` to `path` via a sibling temp file and rename.
///
/// # Errors
///
/// [`SnapshotError::Io`] on any filesystem failure.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SnapshotError::io(parent, e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| SnapshotError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SnapshotError::io(path, e))
}

/// Ordered pending changes plus a wake-up signal for the flush loop.
#[derive(Debug, Default)]
pub struct ChangeQueue {
    pending: Mutex<Vec<Change>>,
    notify: Notify,
}

impl ChangeQueue {
    /// Append a change and wake the flush loop.
    pub fn push(&self, change: Change) {
        match self.pending.lock() {
            Ok(mut pending) => pending.push(change),
            Err(poisoned) => poisoned.into_inner().push(change),
        }
        self.notify.notify_one();
    }

    /// Swap out everything queued so far.
    pub fn take(&self) -> Vec<Change> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Number of queued changes.
    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the flush loop without queueing anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves once a push or wake happens. A wake issued while nobody
    /// waits is kept for the next call.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}
