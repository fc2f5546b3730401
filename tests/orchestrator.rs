mod common;

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use common::{
    assert_quiet, next_event, rows, settings, take_events, ChannelWatcher, DoubleError, Events,
    MemorySink, MemorySource, WAIT,
};
use sheetsync::sync::{Orchestrator, OrchestratorState, SyncError};

type TestSync = Orchestrator<ChannelWatcher, MemorySource, MemorySink>;

const FULL_CYCLE: [&str; 6] = ["read:A", "read:B", "clear:A", "write:A", "clear:B", "write:B"];

struct Harness {
    orchestrator: Arc<TestSync>,
    watcher: ChannelWatcher,
    source: MemorySource,
    sink: MemorySink,
    events: Events,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_sink(|sink| sink)
    }

    fn with_sink(configure: impl FnOnce(MemorySink) -> MemorySink) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let (tx, events) = mpsc::unbounded_channel();

        let watcher = ChannelWatcher::default();
        let source = MemorySource::new(tx.clone());
        source.set("A", rows(&[&["x", "1"], &["y", "2"]]));
        source.set("B", rows(&[&["z", "3"]]));
        let sink = configure(MemorySink::new(tx));

        let orchestrator = Orchestrator::new(
            settings(dir.path()),
            watcher.clone(),
            source.clone(),
            sink.clone(),
            Span::none(),
        );

        Harness {
            orchestrator: Arc::new(orchestrator),
            watcher,
            source,
            sink,
            events,
            _dir: dir,
        }
    }

    fn target(&self) -> PathBuf {
        self.orchestrator.settings().target.path().to_path_buf()
    }

    async fn start(&mut self) {
        self.orchestrator.start(CancellationToken::new()).await.unwrap();
        assert_eq!(next_event(&mut self.events).await, "connect");
    }

    async fn touch(&self) {
        self.watcher.push(self.target()).await;
    }

    async fn wait_for_state(&self, state: OrchestratorState) {
        let mut rx = self.orchestrator.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }
}

#[tokio::test]
async fn test_change_replaces_both_tables_in_order() {
    let mut h = Harness::new();
    let first = rows(&[&["id", "name", ""], &["", "", "x"], &["naïve", "Ünïcode", "'quoted"]]);
    h.source.set("A", first.clone());

    h.start().await;
    assert_eq!(h.orchestrator.state(), OrchestratorState::Watching);

    h.touch().await;
    assert_eq!(take_events(&mut h.events, 6).await, FULL_CYCLE);
    assert_quiet(&mut h.events).await;

    assert_eq!(h.sink.contents("A"), Some(first));
    assert_eq!(h.sink.contents("B"), Some(rows(&[&["z", "3"]])));

    h.orchestrator.stop().await.unwrap();
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
}

#[tokio::test]
async fn test_notifications_are_processed_one_at_a_time() {
    let mut h = Harness::new();
    h.start().await;

    for _ in 0..3 {
        h.touch().await;
    }

    let events = take_events(&mut h.events, 18).await;
    for cycle in events.chunks(6) {
        assert_eq!(cycle, FULL_CYCLE);
    }
    assert_eq!(h.sink.max_concurrent(), 1);
    assert_eq!(h.sink.contents("A"), Some(rows(&[&["x", "1"], &["y", "2"]])));
    assert_eq!(h.sink.contents("B"), Some(rows(&[&["z", "3"]])));

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_destination_holds_latest_content() {
    let mut h = Harness::new();
    h.start().await;

    h.touch().await;
    take_events(&mut h.events, 6).await;

    let updated = rows(&[&["id", "name"], &["1", "alpha"], &["2", "beta"]]);
    h.source.set("A", updated.clone());
    h.touch().await;
    take_events(&mut h.events, 6).await;

    assert_eq!(h.sink.contents("A"), Some(updated));
    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_change_to_other_file_is_ignored() {
    let mut h = Harness::new();
    h.start().await;

    let target = h.target();
    let same_name_elsewhere = target
        .parent()
        .unwrap()
        .join("sub")
        .join(target.file_name().unwrap());
    h.watcher.push(same_name_elsewhere).await;
    h.watcher.push(target.with_file_name("other.xlsx")).await;
    h.touch().await;

    // Nothing is logged for the other file, so the first event belongs to the target
    assert_eq!(take_events(&mut h.events, 6).await, FULL_CYCLE);
    assert_quiet(&mut h.events).await;

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_failure_skips_cycle_and_keeps_watching() {
    let mut h = Harness::new();
    h.start().await;

    h.source.fail("A", true);
    h.touch().await;
    assert_eq!(next_event(&mut h.events).await, "read:A");
    assert_quiet(&mut h.events).await;
    assert_eq!(h.sink.contents("A"), None);
    assert_eq!(h.sink.contents("B"), None);
    assert!(h.orchestrator.state().is_running());

    h.source.fail("A", false);
    h.source.fail("B", true);
    h.touch().await;
    assert_eq!(take_events(&mut h.events, 2).await, ["read:A", "read:B"]);
    assert_quiet(&mut h.events).await;
    assert_eq!(h.sink.contents("A"), None);

    h.source.fail("B", false);
    h.touch().await;
    assert_eq!(take_events(&mut h.events, 6).await, FULL_CYCLE);

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_first_replace_failure_skips_second() {
    let mut h = Harness::with_sink(|sink| {
        sink.fail("A");
        sink
    });
    h.start().await;

    h.touch().await;
    assert_eq!(take_events(&mut h.events, 3).await, ["read:A", "read:B", "fail:A"]);
    assert_quiet(&mut h.events).await;
    assert_eq!(h.sink.contents("B"), None);
    assert!(h.orchestrator.state().is_running());

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_replace_failure_leaves_first_updated() {
    let mut h = Harness::with_sink(|sink| {
        sink.fail("B");
        sink
    });
    h.start().await;

    h.touch().await;
    assert_eq!(
        take_events(&mut h.events, 5).await,
        ["read:A", "read:B", "clear:A", "write:A", "fail:B"]
    );
    assert!(h.sink.contents("A").is_some());
    assert_eq!(h.sink.contents("B"), None);

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    let mut h = Harness::with_sink(MemorySink::refusing_connect);

    let err = h.orchestrator.start(CancellationToken::new()).await.unwrap_err();
    match &err {
        SyncError::Connect(source) => {
            assert!(matches!(source.downcast_ref::<DoubleError>(), Some(DoubleError::Refused)));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(h.watcher.starts(), 0);

    assert_eq!(next_event(&mut h.events).await, "connect");
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_start_twice_is_a_noop() {
    let mut h = Harness::new();
    h.start().await;

    h.orchestrator.start(CancellationToken::new()).await.unwrap();
    assert_eq!(h.watcher.starts(), 1);
    assert_quiet(&mut h.events).await;

    h.orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_before_start_and_twice() {
    let mut h = Harness::new();

    h.orchestrator.stop().await.unwrap();
    assert_eq!(h.orchestrator.state(), OrchestratorState::NotStarted);
    assert!(matches!(h.orchestrator.wait().await, Err(SyncError::NotStarted)));

    h.start().await;
    h.orchestrator.stop().await.unwrap();
    h.orchestrator.stop().await.unwrap();

    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert!(h.watcher.stops() >= 1);
    h.orchestrator.wait().await.unwrap();

    let err = h.orchestrator.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyStarted));
}

#[tokio::test]
async fn test_stop_while_connecting_cancels_start() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = Harness::with_sink(|sink| sink.slow_connect(gate.clone()));

    let orchestrator = h.orchestrator.clone();
    let starting = tokio::spawn(async move {
        orchestrator.start(CancellationToken::new()).await
    });
    assert_eq!(next_event(&mut h.events).await, "connect");
    assert_eq!(h.orchestrator.state(), OrchestratorState::Connecting);

    // Connect never completes; stop must not wait for it
    tokio::time::timeout(WAIT, h.orchestrator.stop()).await.unwrap().unwrap();

    let started = tokio::time::timeout(WAIT, starting).await.unwrap().unwrap();
    assert!(matches!(started, Err(SyncError::Cancelled)));
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(h.watcher.starts(), 0);

    gate.add_permits(1);
    assert_quiet(&mut h.events).await;
}

#[tokio::test]
async fn test_stop_lets_in_flight_sync_finish() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = Harness::with_sink(|sink| sink.gated(gate.clone()));
    h.start().await;

    h.touch().await;
    assert_eq!(take_events(&mut h.events, 3).await, ["read:A", "read:B", "clear:A"]);
    assert_eq!(h.orchestrator.state(), OrchestratorState::Processing);

    let orchestrator = h.orchestrator.clone();
    let stopping = tokio::spawn(async move { orchestrator.stop().await });
    h.wait_for_state(OrchestratorState::Stopping).await;
    assert!(!stopping.is_finished());

    gate.add_permits(2);
    assert_eq!(take_events(&mut h.events, 3).await, ["write:A", "clear:B", "write:B"]);

    tokio::time::timeout(WAIT, stopping).await.unwrap().unwrap().unwrap();
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(h.sink.contents("B"), Some(rows(&[&["z", "3"]])));
}

#[tokio::test]
async fn test_external_cancellation_stops_loop() {
    let mut h = Harness::new();
    let cancel = CancellationToken::new();
    h.orchestrator.start(cancel.clone()).await.unwrap();
    assert_eq!(next_event(&mut h.events).await, "connect");

    cancel.cancel();
    tokio::time::timeout(WAIT, h.orchestrator.wait()).await.unwrap().unwrap();

    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert!(h.watcher.stops() >= 1);
}

#[tokio::test]
async fn test_cancelled_before_start_never_watches() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.orchestrator.start(cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);
    assert_eq!(h.watcher.starts(), 0);
}

#[tokio::test]
async fn test_closed_watch_stream_surfaces_from_wait() {
    let mut h = Harness::new();
    h.start().await;

    h.watcher.close();
    let result = tokio::time::timeout(WAIT, h.orchestrator.wait()).await.unwrap();
    assert!(matches!(result, Err(SyncError::WatchClosed)));
    assert_eq!(h.orchestrator.state(), OrchestratorState::Stopped);

    // Stopping after the loop already ended is still fine
    h.orchestrator.stop().await.unwrap();
}
