use crate::excel::WatchError;

/// Failure reported by a `TableSource` or `TableSink`
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("failed to connect to destination: {0}")]
    Connect(#[source] BoxError),
    #[error("file watcher error: {0}")]
    Watch(#[from] WatchError),
    #[error("failed to read table '{table}': {source}")]
    Read {
        table: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to update table '{table}': {source}")]
    Replace {
        table: String,
        #[source]
        source: BoxError,
    },
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("change stream closed unexpectedly; no further syncs will run")]
    WatchClosed,
    #[error("not started")]
    NotStarted,
    #[error("already started")]
    AlreadyStarted,
    #[error("cancelled during startup")]
    Cancelled,
}
