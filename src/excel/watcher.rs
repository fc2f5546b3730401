use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use super::reader::compute_checksum;
use super::types::ChangeNotification;
use crate::sync::{ChangeStream, FileWatcher};

/// Notifications buffered between the watcher and its consumer
const NOTIFICATION_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid watch target: {0}")]
    InvalidTarget(PathBuf),
    #[error("failed to resolve working directory: {0}")]
    CurrentDir(#[source] std::io::Error),
    #[error("failed to create watcher: {0}")]
    Init(#[source] notify::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("watcher state lock poisoned")]
    LockPoisoned,
}

/// The file to watch and how eagerly to report on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
}

impl WatchTarget {
    /// Resolve `path` to an absolute, normalized path.
    ///
    /// The parent directory is canonicalized when it exists, so the target
    /// compares equal to the paths the OS reports for events in it.
    pub fn new(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self, WatchError> {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(WatchError::CurrentDir)?
                .join(path)
        };
        let absolute = normalize_path(&absolute);

        let (parent, file_name) = match (absolute.parent(), absolute.file_name()) {
            (Some(parent), Some(name)) => (parent, name),
            _ => return Err(WatchError::InvalidTarget(absolute)),
        };
        let parent = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());

        Ok(WatchTarget {
            path: parent.join(file_name),
            poll_interval,
            debounce: Duration::ZERO,
        })
    }

    /// Fold events that arrive within `debounce` of the first one into a
    /// single notification. A steady stream of writes still yields one
    /// notification per window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("/"))
    }

    pub fn file_name(&self) -> OsString {
        self.path.file_name().map(OsString::from).unwrap_or_default()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// True if `path` names this target once normalized
    pub fn matches(&self, path: &Path) -> bool {
        normalize_path(path) == self.path
    }
}

/// Lexically clean a path: drop `.` and fold `..` into its parent
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Watches one workbook by watching its directory.
///
/// Editors and exporters often save by writing a temp file and renaming it
/// over the original, which changes the file's identity. Watching the parent
/// directory and filtering on the file name survives that.
pub struct ExcelWatcher {
    target: WatchTarget,
    skip_unchanged: bool,
    span: Span,
    running: Mutex<Option<Running>>,
}

struct Running {
    stream: ChangeStream,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ExcelWatcher {
    /// Create a new watcher; `span` carries all of its log output
    pub fn new(target: WatchTarget, span: Span) -> Self {
        ExcelWatcher {
            target,
            skip_unchanged: false,
            span,
            running: Mutex::new(None),
        }
    }

    /// Suppress notifications when the file content hash has not changed
    pub fn skip_unchanged_content(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Check if the reception task is alive
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.task.is_finished()))
            .unwrap_or(false)
    }
}

impl FileWatcher for ExcelWatcher {
    fn start(&self, cancel: CancellationToken) -> Result<ChangeStream, WatchError> {
        let mut running = self.running.lock().map_err(|_| WatchError::LockPoisoned)?;

        // If already watching, hand back the same stream
        if let Some(r) = running.as_ref() {
            if !r.task.is_finished() {
                return Ok(r.stream.clone());
            }
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            Config::default().with_poll_interval(self.target.poll_interval()),
        )
        .map_err(WatchError::Init)?;

        let dir = self.target.dir().to_path_buf();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch { path: dir.clone(), source })?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let stop = CancellationToken::new();
        let pump = Pump {
            watcher,
            raw_rx,
            tx,
            file_name: self.target.file_name(),
            debounce: self.target.debounce(),
            skip_unchanged: self.skip_unchanged,
            last_checksum: None,
        };
        let task = tokio::spawn(pump.run(cancel, stop.clone()).instrument(self.span.clone()));

        self.span.in_scope(|| {
            tracing::info!(
                dir = %dir.display(),
                file = %self.target.path().display(),
                "file watcher started"
            );
        });

        let stream = ChangeStream::new(rx);
        *running = Some(Running {
            stream: stream.clone(),
            stop,
            task,
        });
        Ok(stream)
    }

    fn stop(&self) -> Result<(), WatchError> {
        let mut running = self.running.lock().map_err(|_| WatchError::LockPoisoned)?;
        if let Some(r) = running.take() {
            r.stop.cancel();
        }
        Ok(())
    }
}

/// State owned by the reception task
struct Pump {
    // Dropping the watcher releases the OS handle
    #[allow(dead_code)]
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    tx: mpsc::Sender<ChangeNotification>,
    file_name: OsString,
    debounce: Duration,
    skip_unchanged: bool,
    last_checksum: Option<String>,
}

impl Pump {
    async fn run(mut self, cancel: CancellationToken, stop: CancellationToken) {
        let mut pending: Option<(PathBuf, Instant)> = None;

        loop {
            let deadline = pending.as_ref().map(|(_, at)| *at);
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("cancellation requested, stopping file watcher");
                    break;
                }
                _ = stop.cancelled() => {
                    tracing::info!("file watcher stopped");
                    break;
                }
                _ = sleep_until(deadline) => {
                    if let Some((path, _)) = pending.take() {
                        if !self.emit(path, &cancel, &stop).await {
                            break;
                        }
                    }
                }
                res = self.raw_rx.recv() => match res {
                    None => {
                        tracing::warn!("watch handle closed, no further changes will be reported");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "error watching file");
                    }
                    Some(Ok(event)) => {
                        let matched: Vec<PathBuf> = changed_paths(&event)
                            .filter(|p| p.file_name() == Some(self.file_name.as_os_str()))
                            .cloned()
                            .collect();
                        for path in matched {
                            tracing::debug!(
                                path = %path.display(),
                                kind = ?event.kind,
                                "file changed"
                            );
                            if self.debounce.is_zero() {
                                if !self.emit(path, &cancel, &stop).await {
                                    return;
                                }
                            } else {
                                // The window opens at the first event and is not extended
                                let deadline = match pending.take() {
                                    Some((_, at)) => at,
                                    None => Instant::now() + self.debounce,
                                };
                                pending = Some((path, deadline));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Send one notification; false means the task should exit
    async fn emit(
        &mut self,
        path: PathBuf,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> bool {
        let checksum = if self.skip_unchanged {
            match compute_checksum(&path) {
                Ok(sum) if self.last_checksum.as_deref() == Some(sum.as_str()) => {
                    tracing::debug!(path = %path.display(), "content unchanged, skipping");
                    return true;
                }
                Ok(sum) => {
                    self.last_checksum = Some(sum.clone());
                    Some(sum)
                }
                // Unreadable right now; let the consumer find out
                Err(_) => None,
            }
        } else {
            None
        };

        let notification = ChangeNotification { path, checksum };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = stop.cancelled() => false,
            sent = self.tx.send(notification) => {
                if sent.is_err() {
                    tracing::debug!("notification receiver dropped");
                }
                sent.is_ok()
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Paths in `event` that now hold new content.
///
/// Only in-place modification and creation count. A rename onto the path is
/// treated as a create; a rename away, removal, or metadata change is not.
fn changed_paths(event: &Event) -> Box<dyn Iterator<Item = &PathBuf> + '_> {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Other)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Box::new(event.paths.iter()),
        // paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            Box::new(event.paths.get(1).into_iter())
        }
        _ => Box::new(std::iter::empty()),
    }
}
