//! Capability contracts the orchestrator is built on.
//!
//! The concrete implementations live in `excel` (file watching and sheet
//! reading) and `sheets` (the Google Sheets destination). Tests substitute
//! in-memory doubles.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::excel::{ChangeNotification, RowSet};
use crate::excel::watcher::WatchError;
use super::SyncError;

/// Receiving end of a watcher's notifications.
///
/// Cloning yields another handle to the same queue, which is what an
/// idempotent `start` hands back. Only one task should read from it.
#[derive(Debug, Clone)]
pub struct ChangeStream {
    rx: Arc<Mutex<mpsc::Receiver<ChangeNotification>>>,
}

impl ChangeStream {
    pub fn new(rx: mpsc::Receiver<ChangeNotification>) -> Self {
        ChangeStream {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Next notification, or `None` once the producer has gone away
    pub async fn next(&self) -> Option<ChangeNotification> {
        self.rx.lock().await.recv().await
    }

    #[cfg(test)]
    pub(crate) fn same_queue(&self, other: &ChangeStream) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

/// Watches a single file and reports writes to it
pub trait FileWatcher: Send + Sync + 'static {
    /// Start watching. Calling again while running returns the same stream.
    fn start(&self, cancel: CancellationToken) -> Result<ChangeStream, WatchError>;

    /// Stop watching and release the OS handle. Safe to call at any time.
    fn stop(&self) -> Result<(), WatchError>;
}

/// Reads a named table out of a tabular file
pub trait TableSource: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read_table(&self, path: &Path, table: &str) -> Result<RowSet, Self::Error>;
}

/// Start/stop pair a service host drives
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start(&self, cancel: CancellationToken) -> Result<(), SyncError>;

    async fn stop(&self) -> Result<(), SyncError>;

    /// Resolves once the running system has stopped. An error means it
    /// stopped on its own and can no longer make progress.
    async fn wait(&self) -> Result<(), SyncError>;
}

/// Destination that can have whole tables replaced
#[async_trait]
pub trait TableSink: Send + Sync + 'static {
    type Session: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Authenticate with the credential material at `credentials`
    async fn connect(&self, credentials: &Path) -> Result<Self::Session, Self::Error>;

    /// Clear every value in `table`, then write `rows` into it
    async fn replace(
        &self,
        session: &mut Self::Session,
        container_id: &str,
        table: &str,
        rows: &RowSet,
    ) -> Result<(), Self::Error>;
}
