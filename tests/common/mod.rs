//! In-memory doubles for the sync capabilities.
//!
//! The source and sink report every call on one shared event channel, so a
//! test can assert the exact order of reads, clears and writes.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use sheetsync::excel::{ChangeNotification, RowSet, WatchError, WatchTarget};
use sheetsync::sync::{ChangeStream, FileWatcher, SyncSettings, TableSink, TableSource};

pub const WAIT: Duration = Duration::from_secs(5);

pub type Events = mpsc::UnboundedReceiver<String>;

pub fn rows(data: &[&[&str]]) -> RowSet {
    data.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

pub fn settings(dir: &Path) -> SyncSettings {
    SyncSettings {
        target: WatchTarget::new(dir.join("export.xlsx"), Duration::from_secs(1)).unwrap(),
        credentials_path: PathBuf::from("creds.json"),
        spreadsheet_id: "sheet-id".to_string(),
        tables: ["A".to_string(), "B".to_string()],
    }
}

/// Next logged call, failing the test if none arrives in time
pub async fn next_event(events: &mut Events) -> String {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect exactly `n` events
pub async fn take_events(events: &mut Events, n: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(next_event(events).await);
    }
    out
}

/// Assert nothing further is logged within a short window
pub async fn assert_quiet(events: &mut Events) {
    let extra = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(extra.is_err(), "unexpected event: {:?}", extra);
}

/// Failure raised by the in-memory doubles
#[derive(Debug, thiserror::Error)]
pub enum DoubleError {
    #[error("simulated read failure of '{0}'")]
    Read(String),
    #[error("no table named '{0}'")]
    Missing(String),
    #[error("simulated authorization failure")]
    Refused,
    #[error("simulated outage writing '{0}'")]
    Outage(String),
}

/// Watcher whose notifications are pushed by the test
#[derive(Clone, Default)]
pub struct ChannelWatcher {
    inner: Arc<WatcherInner>,
}

#[derive(Default)]
struct WatcherInner {
    tx: Mutex<Option<mpsc::Sender<ChangeNotification>>>,
    stream: Mutex<Option<ChangeStream>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl ChannelWatcher {
    pub async fn push(&self, path: impl Into<PathBuf>) {
        let tx = self.inner.tx.lock().unwrap().clone();
        tx.expect("watcher not started")
            .send(ChangeNotification::new(path))
            .await
            .expect("stream dropped");
    }

    /// Simulate the OS handle going away
    pub fn close(&self) {
        self.inner.tx.lock().unwrap().take();
    }

    pub fn starts(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }
}

impl FileWatcher for ChannelWatcher {
    fn start(&self, _cancel: CancellationToken) -> Result<ChangeStream, WatchError> {
        let mut stream = self.inner.stream.lock().unwrap();
        if let Some(existing) = stream.as_ref() {
            return Ok(existing.clone());
        }
        self.inner.starts.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        *self.inner.tx.lock().unwrap() = Some(tx);
        let created = ChangeStream::new(rx);
        *stream = Some(created.clone());
        Ok(created)
    }

    fn stop(&self) -> Result<(), WatchError> {
        self.inner.stops.fetch_add(1, Ordering::SeqCst);
        self.close();
        Ok(())
    }
}

/// Tables held in memory, keyed by name
#[derive(Clone)]
pub struct MemorySource {
    tables: Arc<Mutex<HashMap<String, RowSet>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    events: mpsc::UnboundedSender<String>,
}

impl MemorySource {
    pub fn new(events: mpsc::UnboundedSender<String>) -> Self {
        MemorySource {
            tables: Arc::default(),
            failing: Arc::default(),
            events,
        }
    }

    pub fn set(&self, table: &str, data: RowSet) {
        self.tables.lock().unwrap().insert(table.to_string(), data);
    }

    pub fn fail(&self, table: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(table.to_string());
        } else {
            set.remove(table);
        }
    }
}

impl TableSource for MemorySource {
    type Error = DoubleError;

    fn read_table(&self, _path: &Path, table: &str) -> Result<RowSet, DoubleError> {
        let _ = self.events.send(format!("read:{}", table));
        if self.failing.lock().unwrap().contains(table) {
            return Err(DoubleError::Read(table.to_string()));
        }
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| DoubleError::Missing(table.to_string()))
    }
}

pub struct MemorySession {
    pub connected_with: PathBuf,
}

/// Destination that stores replaced tables in memory
#[derive(Clone)]
pub struct MemorySink {
    tables: Arc<Mutex<HashMap<String, RowSet>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    refuse_connect: bool,
    /// When set, connect waits for a permit before returning
    connect_gate: Option<Arc<Semaphore>>,
    /// When set, each replace waits for a permit before writing
    gate: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<String>,
}

impl MemorySink {
    pub fn new(events: mpsc::UnboundedSender<String>) -> Self {
        MemorySink {
            tables: Arc::default(),
            failing: Arc::default(),
            refuse_connect: false,
            connect_gate: None,
            gate: None,
            active: Arc::default(),
            max_active: Arc::default(),
            events,
        }
    }

    pub fn refusing_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn slow_connect(mut self, gate: Arc<Semaphore>) -> Self {
        self.connect_gate = Some(gate);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fail(&self, table: &str) {
        self.failing.lock().unwrap().insert(table.to_string());
    }

    pub fn contents(&self, table: &str) -> Option<RowSet> {
        self.tables.lock().unwrap().get(table).cloned()
    }

    /// Most replaces ever observed running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableSink for MemorySink {
    type Session = MemorySession;
    type Error = DoubleError;

    async fn connect(&self, credentials: &Path) -> Result<MemorySession, DoubleError> {
        let _ = self.events.send("connect".to_string());
        if let Some(gate) = &self.connect_gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.refuse_connect {
            return Err(DoubleError::Refused);
        }
        Ok(MemorySession {
            connected_with: credentials.to_path_buf(),
        })
    }

    async fn replace(
        &self,
        _session: &mut MemorySession,
        _container_id: &str,
        table: &str,
        rows: &RowSet,
    ) -> Result<(), DoubleError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let result = self.replace_inner(table, rows).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MemorySink {
    async fn replace_inner(&self, table: &str, rows: &RowSet) -> Result<(), DoubleError> {
        if self.failing.lock().unwrap().contains(table) {
            let _ = self.events.send(format!("fail:{}", table));
            return Err(DoubleError::Outage(table.to_string()));
        }

        let _ = self.events.send(format!("clear:{}", table));
        self.tables.lock().unwrap().remove(table);

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        // Give an overlapping caller a chance to show up
        tokio::time::sleep(Duration::from_millis(2)).await;

        self.tables.lock().unwrap().insert(table.to_string(), rows.clone());
        let _ = self.events.send(format!("write:{}", table));
        Ok(())
    }
}
