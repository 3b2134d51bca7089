//! Background flush loop.
//!
//! Wakes when a change is queued, when the interval elapses, or on
//! shutdown. Each wake swaps out the queue, folds it into the in-memory
//! document and rewrites the snapshot file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::snapshot::{write_atomic, ChangeQueue, Snapshot, SnapshotError};

/// State shared between the registry and its flush task.
#[derive(Debug)]
pub(crate) struct SyncState {
    pub(crate) queue: ChangeQueue,
    pub(crate) snapshot: Mutex<Snapshot>,
    pub(crate) path: PathBuf,
    pub(crate) interval: Duration,
    write_lock: tokio::sync::Mutex<()>,
}

impl SyncState {
    pub(crate) fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            queue: ChangeQueue::default(),
            snapshot: Mutex::new(Snapshot::default()),
            path,
            interval,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Drain the queue and write the document. Returns the number of
    /// changes applied.
    pub(crate) async fn flush(&self) -> Result<usize, SnapshotError> {
        let _writer = self.write_lock.lock().await;

        let changes = self.queue.take();
        let applied = changes.len();
        let contents = {
            let mut snapshot = match self.snapshot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for change in changes {
                snapshot.apply(change);
            }
            serde_json::to_string_pretty(&*snapshot)?
        };

        write_atomic(&self.path, &contents).await?;
        debug!(path = %self.path.display(), applied, "snapshot written");
        Ok(applied)
    }
}

/// Handle to a running flush task.
#[derive(Debug)]
pub(crate) struct SyncHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub(crate) fn spawn(state: Arc<SyncState>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_sync(state, shutdown_rx));
        Self { shutdown_tx, task }
    }

    /// Signal shutdown and wait for the final flush.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "flush task did not exit cleanly");
        }
    }

    /// Signal shutdown without waiting.
    pub(crate) fn signal(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Kill the task outright; queued changes stay queued.
    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

async fn run_sync(state: Arc<SyncState>, mut shutdown_rx: watch::Receiver<bool>) {
    info!(path = %state.path.display(), interval_secs = state.interval.as_secs(), "snapshot sync started");

    loop {
        tokio::select! {
            _ = state.queue.notified() => {}
            _ = tokio::time::sleep(state.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        if let Err(err) = state.flush().await {
            warn!(error = %err, "snapshot flush failed, retrying next cycle");
        }
    }

    if let Err(err) = state.flush().await {
        warn!(error = %err, "final snapshot flush failed");
    }
    info!("snapshot sync stopped");
}
