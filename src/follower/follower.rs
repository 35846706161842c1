use crate::commitlog::{Index, InMemoryLogStore, Term};
use crate::connection::{Connection, ConnectionError, ConnectionExt, Listener};
use crate::follower::session::FollowerSession;
use crate::topology::ClusterTopology;
use crate::wire::ProtoHello;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum FollowerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Log store failure: {0}")]
    Storage(#[from] io::Error),
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// What a follower observed, in the order it observed it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FollowerEvent {
    Hello {
        leader_tag: String,
    },
    Negotiated {
        match_index: Index,
    },
    SnapshotInstalled {
        last_included_index: Index,
        records: u64,
    },
    AppendEntries {
        prev_log_index: Index,
        entries: usize,
        leader_commit: Index,
        force_elections: bool,
    },
}

/// The receiving end of replication: applies what a leader's ambassador sends to a local
/// `InMemoryLogStore`.
///
/// It does not vote or time out; it only follows. Good enough to run a leader against, in tests
/// and in the demo binary.
#[derive(Clone)]
pub struct FollowerNode {
    pub(super) shared: Arc<FollowerShared>,
}

pub(super) struct FollowerShared {
    pub(super) logger: slog::Logger,
    pub(super) tag: String,
    pub(super) store: Arc<InMemoryLogStore>,
    current_term: AtomicU64,
    pending_replies: AtomicUsize,
    topology: Mutex<Option<ClusterTopology>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FollowerEvent>>>,
}

impl FollowerNode {
    pub fn new(tag: impl Into<String>, logger: slog::Logger) -> Self {
        Self::with_store(tag, Arc::new(InMemoryLogStore::new()), logger)
    }

    pub fn with_store(tag: impl Into<String>, store: Arc<InMemoryLogStore>, logger: slog::Logger) -> Self {
        let tag = tag.into();
        FollowerNode {
            shared: Arc::new(FollowerShared {
                logger: logger.new(slog::o!("Node" => tag.clone())),
                tag,
                store,
                current_term: AtomicU64::new(0),
                pending_replies: AtomicUsize::new(0),
                topology: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    pub fn store(&self) -> Arc<InMemoryLogStore> {
        self.shared.store.clone()
    }

    pub fn current_term(&self) -> Term {
        Term::new(self.shared.current_term.load(Ordering::Acquire))
    }

    /// Move to a newer term, as if an election had happened without us hearing of it.
    pub fn set_term(&self, term: Term) {
        self.shared.current_term.fetch_max(term.as_u64(), Ordering::AcqRel);
    }

    /// Number of `pending` replies sent ahead of every terminal AppendEntries and
    /// InstallSnapshot reply.
    pub fn set_pending_replies(&self, count: usize) {
        self.shared.pending_replies.store(count, Ordering::Release);
    }

    /// The topology delivered with the last InstallSnapshot.
    pub fn topology(&self) -> Option<ClusterTopology> {
        self.shared
            .topology
            .lock()
            .expect("FollowerNode topology mutex guard poison")
            .clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FollowerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subscribers
            .lock()
            .expect("FollowerNode subscribers mutex guard poison")
            .push(tx);
        rx
    }

    /// Accept leader connections until the listener fails. Each connection gets its own task.
    pub fn serve<L: Listener + 'static>(&self, mut listener: L) -> JoinHandle<()> {
        let node = self.clone();
        tokio::task::spawn(async move {
            slog::info!(node.shared.logger, "Serving replication at {}", listener.url());
            loop {
                let connection = match listener.accept().await {
                    Ok(connection) => connection,
                    Err(e) => {
                        slog::info!(node.shared.logger, "Listener at {} stopped: {}", listener.url(), e);
                        return;
                    }
                };
                let session_node = node.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = session_node.handle_connection(connection).await {
                        slog::warn!(session_node.shared.logger, "Replication session ended: {}", e);
                    }
                });
            }
        })
    }

    /// Run the follower side of one replication connection until the leader goes away.
    pub async fn handle_connection(&self, mut connection: Box<dyn Connection>) -> Result<(), FollowerError> {
        let hello = connection.read::<ProtoHello>().await?;
        let logger = self.shared.logger.new(slog::o!("Leader" => hello.leader_tag.clone()));
        slog::info!(
            logger,
            "Leader {} connected for topology {:?}",
            hello.leader_url,
            hello.topology_id
        );
        self.shared.emit(FollowerEvent::Hello {
            leader_tag: hello.leader_tag,
        });

        let result = FollowerSession::new(&self.shared, logger.clone(), connection.as_mut())
            .run()
            .await;
        match result {
            Err(FollowerError::Connection(ConnectionError::PeerDisconnected))
            | Err(FollowerError::Connection(ConnectionError::Closed)) => {
                slog::info!(logger, "Leader disconnected");
                Ok(())
            }
            other => other,
        }
    }
}

impl FollowerShared {
    /// Returns our term after observing `term`, and whether `term` is current.
    pub(super) fn observe_term(&self, term: u64) -> (u64, bool) {
        let previous = self.current_term.fetch_max(term, Ordering::AcqRel);
        let current = previous.max(term);
        (current, term == current)
    }

    pub(super) fn pending_replies(&self) -> usize {
        self.pending_replies.load(Ordering::Acquire)
    }

    pub(super) fn set_topology(&self, topology: ClusterTopology) {
        self.topology
            .lock()
            .expect("FollowerNode topology mutex guard poison")
            .replace(topology);
    }

    pub(super) fn emit(&self, event: FollowerEvent) {
        self.subscribers
            .lock()
            .expect("FollowerNode subscribers mutex guard poison")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
