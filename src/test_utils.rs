use crate::ambassador::AmbassadorError;
use crate::commitlog::{InMemoryLogStore, Index, Term};
use crate::leader::{LeaderContext, StepDownReason};
use bytes::Bytes;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub(crate) fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// A logger that keeps every message it is given, for tests that assert on what was logged.
pub(crate) fn recording_logger() -> (slog::Logger, Arc<Mutex<Vec<String>>>) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let drain = RecordingDrain {
        messages: messages.clone(),
    };
    (slog::Logger::root(drain, slog::o!()), messages)
}

struct RecordingDrain {
    messages: Arc<Mutex<Vec<String>>>,
}

impl slog::Drain for RecordingDrain {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &slog::Record, _values: &slog::OwnedKVList) -> Result<(), slog::Never> {
        self.messages.lock().unwrap().push(record.msg().to_string());
        Ok(())
    }
}

/// One entry per term, in order, starting at index 1.
pub(crate) fn store_with_terms(terms: &[u64]) -> InMemoryLogStore {
    let store = InMemoryLogStore::new();
    for (i, term) in terms.iter().enumerate() {
        store.append(Term::new(*term), Bytes::from(format!("entry-{}", i + 1)));
    }
    store
}

/// Poll `condition` until it holds, for at most 5 seconds.
pub(crate) async fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub(crate) struct TestUtilReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T: Debug> TestUtilReceiver<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>) -> Self {
        TestUtilReceiver { rx }
    }

    pub(crate) async fn recv(&mut self) -> T {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("Unexpected timeout")
            .expect("Expected value")
    }

    /// Everything received so far, without waiting.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Ok(value) = self.rx.try_recv() {
            values.push(value);
        }
        values
    }
}

/// A leader that only records what its ambassadors tell it.
pub(crate) struct FakeLeader {
    term: Term,
    running: AtomicBool,
    shutdown: CancellationToken,
    last_index: watch::Sender<Index>,
    step_downs: Mutex<Vec<StepDownReason>>,
    exceptions: Mutex<Vec<String>>,
    progress_notifications: AtomicUsize,
}

impl FakeLeader {
    pub(crate) fn new(term: u64) -> Self {
        let (last_index, _) = watch::channel(Index::zero());
        FakeLeader {
            term: Term::new(term),
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
            last_index,
            step_downs: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
            progress_notifications: AtomicUsize::new(0),
        }
    }

    pub(crate) fn publish_last_index(&self, index: Index) {
        let _ = self.last_index.send(index);
    }

    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.cancel();
    }

    pub(crate) fn step_downs(&self) -> Vec<StepDownReason> {
        self.step_downs.lock().unwrap().clone()
    }

    pub(crate) fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().unwrap().clone()
    }

    pub(crate) fn progress_notifications(&self) -> usize {
        self.progress_notifications.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl LeaderContext for FakeLeader {
    fn term(&self) -> Term {
        self.term
    }

    fn leader_tag(&self) -> String {
        "A".to_string()
    }

    fn leader_url(&self) -> String {
        "mem://a".to_string()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn time_as_leader(&self) -> Duration {
        Duration::from_millis(0)
    }

    async fn wait_for_new_entries(&self, known_last_index: Index, timeout: Duration) -> bool {
        let mut rx = self.last_index.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() > known_last_index {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn lowest_index_required_cluster_wide(&self) -> Index {
        Index::zero()
    }

    fn notify_progress(&self, _follower_tag: &str) {
        self.progress_notifications.fetch_add(1, Ordering::AcqRel);
    }

    fn notify_exception(&self, _follower_tag: &str, error: &AmbassadorError) {
        self.exceptions.lock().unwrap().push(error.to_string());
    }

    fn step_down(&self, reason: StepDownReason) {
        self.running.store(false, Ordering::Release);
        self.step_downs.lock().unwrap().push(reason);
    }
}
