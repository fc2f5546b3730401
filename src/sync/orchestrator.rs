use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::error::SyncError;
use super::state::OrchestratorState;
use super::traits::{ChangeStream, FileWatcher, Lifecycle, TableSink, TableSource};
use crate::excel::{ChangeNotification, RowSet, WatchTarget};

/// What to watch and where to send it
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub target: WatchTarget,
    pub credentials_path: PathBuf,
    /// Destination spreadsheet
    pub spreadsheet_id: String,
    /// Synced in this order, same names on both sides
    pub tables: [String; 2],
}

/// Result of handling one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The notification was for some other file
    Skipped,
    Synced { rows: [usize; 2] },
}

/// Why the processing loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    StreamClosed,
}

/// Connects to the destination, starts the watcher and runs the sync loop.
///
/// All syncs run on one task, one notification at a time, so the session is
/// never shared.
pub struct Orchestrator<W, R, K> {
    settings: Arc<SyncSettings>,
    watcher: Arc<W>,
    source: Arc<R>,
    sink: Arc<K>,
    state: Arc<watch::Sender<OrchestratorState>>,
    cancel: Mutex<Option<CancellationToken>>,
    exit: Arc<OnceLock<LoopExit>>,
    span: Span,
}

impl<W, R, K> Orchestrator<W, R, K>
where
    W: FileWatcher,
    R: TableSource,
    K: TableSink,
{
    /// `span` carries all of the orchestrator's log output
    pub fn new(settings: SyncSettings, watcher: W, source: R, sink: K, span: Span) -> Self {
        let (state, _) = watch::channel(OrchestratorState::NotStarted);
        Orchestrator {
            settings: Arc::new(settings),
            watcher: Arc::new(watcher),
            source: Arc::new(source),
            sink: Arc::new(sink),
            state: Arc::new(state),
            cancel: Mutex::new(None),
            exit: Arc::new(OnceLock::new()),
            span,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Connect, start watching, and spawn the processing loop.
    ///
    /// Calling this while running is a no-op. A failed connect or watcher
    /// start leaves the orchestrator `Stopped`. A `stop` or cancellation
    /// during connect abandons the connect and returns `Cancelled`.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        let token = cancel.child_token();

        // Claim and publish the token together so a concurrent `stop` always finds it
        let claimed = {
            let mut slot = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            let claimed = self.state.send_if_modified(|s| {
                if *s == OrchestratorState::NotStarted {
                    *s = OrchestratorState::Connecting;
                    true
                } else {
                    false
                }
            });
            if claimed {
                *slot = Some(token.clone());
            }
            claimed
        };
        if !claimed {
            return if self.state().is_running() {
                Ok(())
            } else {
                Err(SyncError::AlreadyStarted)
            };
        }

        self.span.in_scope(|| tracing::info!("starting sync service"));

        let connect = self
            .sink
            .connect(&self.settings.credentials_path)
            .instrument(self.span.clone());
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = connect => Some(result),
        };

        let session = match connected {
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                self.span.in_scope(|| {
                    tracing::error!(error = %e, "failed to connect to destination")
                });
                transition(&self.state, OrchestratorState::Stopped);
                return Err(SyncError::Connect(Box::new(e)));
            }
            None => {
                self.span.in_scope(|| tracing::info!("cancelled while connecting"));
                transition(&self.state, OrchestratorState::Stopping);
                transition(&self.state, OrchestratorState::Stopped);
                return Err(SyncError::Cancelled);
            }
        };

        if token.is_cancelled() {
            transition(&self.state, OrchestratorState::Stopping);
            transition(&self.state, OrchestratorState::Stopped);
            return Err(SyncError::Cancelled);
        }

        let stream = match self.watcher.start(token.clone()) {
            Ok(stream) => stream,
            Err(e) => {
                self.span.in_scope(|| {
                    tracing::error!(error = %e, "failed to start file watcher")
                });
                transition(&self.state, OrchestratorState::Stopped);
                return Err(e.into());
            }
        };

        transition(&self.state, OrchestratorState::Watching);

        let worker = Worker {
            settings: self.settings.clone(),
            watcher: self.watcher.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            session,
            stream,
            cancel: token,
            state: self.state.clone(),
            exit: self.exit.clone(),
        };
        tokio::spawn(worker.run().instrument(self.span.clone()));

        Ok(())
    }

    /// Cancel the loop and stop the watcher, then wait for `Stopped`.
    ///
    /// A sync already in flight is allowed to finish. Safe to call before
    /// `start` and more than once.
    pub async fn stop(&self) -> Result<(), SyncError> {
        if matches!(self.state(), OrchestratorState::NotStarted | OrchestratorState::Stopped) {
            return Ok(());
        }

        self.span.in_scope(|| tracing::info!("stopping sync service"));
        transition(&self.state, OrchestratorState::Stopping);

        let token = self.cancel.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(token) = token {
            token.cancel();
        }
        let stopped = self.watcher.stop();

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == OrchestratorState::Stopped).await;

        stopped.map_err(SyncError::from)
    }

    /// Wait for the loop to end; `Err(WatchClosed)` if it ended on its own
    pub async fn wait(&self) -> Result<(), SyncError> {
        let mut rx = self.state.subscribe();
        if *rx.borrow() == OrchestratorState::NotStarted {
            return Err(SyncError::NotStarted);
        }
        let _ = rx.wait_for(|s| *s == OrchestratorState::Stopped).await;

        match self.exit.get() {
            Some(LoopExit::StreamClosed) => Err(SyncError::WatchClosed),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<W, R, K> Lifecycle for Orchestrator<W, R, K>
where
    W: FileWatcher,
    R: TableSource,
    K: TableSink,
{
    async fn start(&self, cancel: CancellationToken) -> Result<(), SyncError> {
        Orchestrator::start(self, cancel).await
    }

    async fn stop(&self) -> Result<(), SyncError> {
        Orchestrator::stop(self).await
    }

    async fn wait(&self) -> Result<(), SyncError> {
        Orchestrator::wait(self).await
    }
}

/// Apply a lifecycle edge, ignoring ones the state machine does not allow
fn transition(state: &watch::Sender<OrchestratorState>, next: OrchestratorState) {
    state.send_if_modified(|current| {
        if *current == next || !current.can_transition_to(next) {
            return false;
        }
        let busy = OrchestratorState::Processing;
        if next == busy || *current == busy {
            tracing::debug!(from = %current, to = %next, "state changed");
        } else {
            tracing::info!(from = %current, to = %next, "state changed");
        }
        *current = next;
        true
    });
}

/// The processing loop and everything it owns
struct Worker<W, R, K: TableSink> {
    settings: Arc<SyncSettings>,
    watcher: Arc<W>,
    source: Arc<R>,
    sink: Arc<K>,
    session: K::Session,
    stream: ChangeStream,
    cancel: CancellationToken,
    state: Arc<watch::Sender<OrchestratorState>>,
    exit: Arc<OnceLock<LoopExit>>,
}

impl<W, R, K> Worker<W, R, K>
where
    W: FileWatcher,
    R: TableSource,
    K: TableSink,
{
    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break LoopExit::Cancelled,
                next = self.stream.next() => match next {
                    None => break LoopExit::StreamClosed,
                    Some(notification) => {
                        transition(&self.state, OrchestratorState::Processing);
                        tracing::info!(
                            path = %notification.path.display(),
                            "detected change in file"
                        );
                        match self.process(&notification).await {
                            Ok(SyncOutcome::Synced { rows }) => {
                                tracing::info!(
                                    first = rows[0],
                                    second = rows[1],
                                    "destination updated"
                                );
                            }
                            Ok(SyncOutcome::Skipped) => {}
                            Err(e) => tracing::error!(error = %e, "error processing file change"),
                        }
                        transition(&self.state, OrchestratorState::Watching);
                    }
                }
            }
        };

        match exit {
            LoopExit::Cancelled => tracing::info!("cancellation requested, processing stopped"),
            LoopExit::StreamClosed => {
                tracing::error!("file watcher channel closed, processing stopped")
            }
        }
        let _ = self.exit.set(exit);

        if let Err(e) = self.watcher.stop() {
            tracing::warn!(error = %e, "failed to stop file watcher");
        }

        if exit == LoopExit::Cancelled {
            transition(&self.state, OrchestratorState::Stopping);
        }
        transition(&self.state, OrchestratorState::Stopped);
    }

    /// Read both tables, then replace both, in configured order
    async fn process(
        &mut self,
        notification: &ChangeNotification,
    ) -> Result<SyncOutcome, SyncError> {
        if !self.settings.target.matches(&notification.path) {
            tracing::debug!(
                path = %notification.path.display(),
                "ignoring change to another file"
            );
            return Ok(SyncOutcome::Skipped);
        }

        let settings = self.settings.clone();
        let [first, second] = &settings.tables;

        let first_rows = read_table(self.source.clone(), first, &notification.path).await?;
        let second_rows = read_table(self.source.clone(), second, &notification.path).await?;

        self.replace(first, &first_rows).await?;
        self.replace(second, &second_rows).await?;

        Ok(SyncOutcome::Synced {
            rows: [first_rows.len(), second_rows.len()],
        })
    }

    async fn replace(&mut self, table: &str, rows: &RowSet) -> Result<(), SyncError> {
        self.sink
            .replace(&mut self.session, &self.settings.spreadsheet_id, table, rows)
            .await
            .map_err(|source| SyncError::Replace {
                table: table.to_string(),
                source: Box::new(source),
            })
    }
}

/// Run a blocking sheet read off the async threads
async fn read_table<R: TableSource>(
    source: Arc<R>,
    table: &str,
    path: &Path,
) -> Result<RowSet, SyncError> {
    let path = path.to_path_buf();
    let name = table.to_string();

    tokio::task::spawn_blocking(move || source.read_table(&path, &name))
        .await?
        .map_err(|source| SyncError::Read {
            table: table.to_string(),
            source: Box::new(source),
        })
}
