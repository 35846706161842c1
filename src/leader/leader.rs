use crate::ambassador::{
    AmbassadorConfig, AmbassadorError, AmbassadorProgress, AmbassadorStatus, FollowerAmbassador, SnapshotInclusion,
};
use crate::api::ReplicationOptionsValidated;
use crate::commitlog::{Index, LogStore, Term};
use crate::connection::Connector;
use crate::leader::commit::get_cluster_commit_index;
use crate::leader::context::{LeaderContext, StepDownReason};
use crate::leader::listener::{self, LeadershipListener, LeadershipNotifier, LeadershipState};
use crate::topology::{FollowerInfo, TopologyStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Everything the leader needs to replicate, already validated.
pub(crate) struct LeaderParts {
    pub(crate) logger: slog::Logger,
    pub(crate) term: Term,
    pub(crate) leader_tag: String,
    pub(crate) leader_url: String,
    pub(crate) followers: Vec<FollowerInfo>,
    pub(crate) options: ReplicationOptionsValidated,
    pub(crate) snapshot_inclusion: SnapshotInclusion,
    pub(crate) log_store: Arc<dyn LogStore>,
    pub(crate) topology_store: Arc<dyn TopologyStore>,
    pub(crate) connector: Arc<dyn Connector>,
}

/// Health of one follower, as the leader sees it.
#[derive(Clone, Debug)]
pub struct FollowerHealth {
    pub tag: String,
    pub url: String,
    pub status: AmbassadorStatus,
    pub status_message: String,
    pub match_index: Index,
    pub last_send: Option<DateTime<Utc>>,
    pub last_contact: Option<DateTime<Utc>>,
    pub last_exception: Option<String>,
}

/// Leadership over the cluster for one term: one ambassador per follower plus a task that turns
/// their progress into a commit index.
pub struct Leader {
    logger: slog::Logger,
    shared: Arc<LeaderShared>,
    ambassadors: Vec<FollowerAmbassador>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    commit_index_rx: watch::Receiver<Index>,
    leadership_listener: LeadershipListener,
}

impl Leader {
    pub(crate) fn start(parts: LeaderParts) -> Result<Leader, io::Error> {
        let logger = parts
            .logger
            .new(slog::o!("Leader" => parts.leader_tag.clone(), "Term" => parts.term.as_u64()));
        let (last_index, committed_index) = {
            let txn = parts.log_store.read_transaction()?;
            (txn.last_entry_index(), txn.committed_index())
        };
        let (notifier, leadership_listener) = listener::new(LeadershipState::Leading { term: parts.term });
        let (last_index_tx, _) = watch::channel(last_index);
        let (commit_index_tx, commit_index_rx) = watch::channel(committed_index);

        let shared = Arc::new(LeaderShared {
            logger: logger.clone(),
            term: parts.term,
            tag: parts.leader_tag,
            url: parts.leader_url,
            started_at: Instant::now(),
            running: AtomicBool::new(true),
            stepped_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            last_index_tx,
            lowest_index_required: AtomicU64::new(0),
            progress_notify: Notify::new(),
            last_exceptions: Mutex::new(HashMap::new()),
            state_notifier: notifier,
        });

        let mut ambassadors = Vec::with_capacity(parts.followers.len());
        for follower in parts.followers {
            let config = AmbassadorConfig {
                logger: logger.clone(),
                follower,
                options: parts.options.clone(),
                snapshot_inclusion: parts.snapshot_inclusion.clone(),
            };
            ambassadors.push(FollowerAmbassador::new(
                config,
                shared.clone(),
                parts.log_store.clone(),
                parts.topology_store.clone(),
                parts.connector.clone(),
            ));
        }

        let aggregator = CommitAggregator {
            shared: shared.clone(),
            log_store: parts.log_store,
            followers: ambassadors
                .iter()
                .map(|a| (a.tag().to_string(), a.progress().clone()))
                .collect(),
            commit_index_tx,
            election_timeout: parts.options.election_timeout,
        };
        let aggregator = tokio::task::spawn(aggregator.run());

        for ambassador in &ambassadors {
            // Freshly created, so they cannot have been started yet.
            if let Err(e) = ambassador.start() {
                slog::error!(logger, "Failed to start ambassador for {}: {}", ambassador.tag(), e);
            }
        }
        slog::info!(logger, "Leading {} followers from index {:?}", ambassadors.len(), last_index);

        Ok(Leader {
            logger,
            shared,
            ambassadors,
            aggregator: Mutex::new(Some(aggregator)),
            commit_index_rx,
            leadership_listener,
        })
    }

    pub fn term(&self) -> Term {
        self.shared.term
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Wake the ambassadors after appending to the log.
    pub fn notify_new_entries(&self, last_index: Index) {
        self.shared.last_index_tx.send_if_modified(|current| {
            if last_index > *current {
                *current = last_index;
                true
            } else {
                false
            }
        });
    }

    pub fn commit_index(&self) -> Index {
        *self.commit_index_rx.borrow()
    }

    pub fn commit_index_listener(&self) -> watch::Receiver<Index> {
        self.commit_index_rx.clone()
    }

    pub fn lowest_index_required_cluster_wide(&self) -> Index {
        self.shared.lowest_index_required_cluster_wide()
    }

    pub fn leadership_listener(&self) -> LeadershipListener {
        self.leadership_listener.clone()
    }

    pub fn ambassador(&self, follower_tag: &str) -> Option<&FollowerAmbassador> {
        self.ambassadors.iter().find(|a| a.tag() == follower_tag)
    }

    pub fn cluster_health(&self) -> Vec<FollowerHealth> {
        let exceptions = self
            .shared
            .last_exceptions
            .lock()
            .expect("Leader exceptions mutex guard poison");
        self.ambassadors
            .iter()
            .map(|a| FollowerHealth {
                tag: a.tag().to_string(),
                url: a.url().to_string(),
                status: a.status(),
                status_message: a.status_message(),
                match_index: a.match_index(),
                last_send: a.last_send(),
                last_contact: a.last_contact(),
                last_exception: exceptions.get(a.tag()).cloned(),
            })
            .collect()
    }

    pub fn force_elections(&self) {
        for ambassador in &self.ambassadors {
            ambassador.force_elections();
        }
    }

    pub fn step_down(&self) {
        self.shared.step_down(StepDownReason::Requested);
    }

    /// Stop every ambassador and the aggregator.
    pub async fn dispose(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.cancel();

        for ambassador in &self.ambassadors {
            ambassador.dispose().await;
        }
        let aggregator = self
            .aggregator
            .lock()
            .expect("Leader aggregator mutex guard poison")
            .take();
        if let Some(aggregator) = aggregator {
            if let Err(e) = aggregator.await {
                slog::error!(self.logger, "Commit aggregator failed: {:?}", e);
            }
        }

        if !self.shared.stepped_down.load(Ordering::Acquire) {
            self.shared
                .state_notifier
                .notify_new_state(LeadershipState::Disposed { term: self.shared.term });
        }
        slog::info!(self.logger, "Leader disposed");
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

struct LeaderShared {
    logger: slog::Logger,
    term: Term,
    tag: String,
    url: String,
    started_at: Instant,
    running: AtomicBool,
    stepped_down: AtomicBool,
    shutdown: CancellationToken,
    last_index_tx: watch::Sender<Index>,
    lowest_index_required: AtomicU64,
    progress_notify: Notify,
    last_exceptions: Mutex<HashMap<String, String>>,
    state_notifier: LeadershipNotifier,
}

#[async_trait::async_trait]
impl LeaderContext for LeaderShared {
    fn term(&self) -> Term {
        self.term
    }

    fn leader_tag(&self) -> String {
        self.tag.clone()
    }

    fn leader_url(&self) -> String {
        self.url.clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn time_as_leader(&self) -> Duration {
        self.started_at.elapsed()
    }

    async fn wait_for_new_entries(&self, known_last_index: Index, timeout: Duration) -> bool {
        let mut rx = self.last_index_tx.subscribe();
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
        Index::new(self.lowest_index_required.load(Ordering::Acquire))
    }

    fn notify_progress(&self, _follower_tag: &str) {
        self.progress_notify.notify_one();
    }

    fn notify_exception(&self, follower_tag: &str, error: &AmbassadorError) {
        slog::warn!(self.logger, "Replication to {} failed: {}", follower_tag, error);
        self.last_exceptions
            .lock()
            .expect("Leader exceptions mutex guard poison")
            .insert(follower_tag.to_string(), error.to_string());
    }

    fn step_down(&self, reason: StepDownReason) {
        if self.stepped_down.swap(true, Ordering::AcqRel) {
            slog::debug!(self.logger, "Already stepped down, ignoring: {}", reason);
            return;
        }
        slog::warn!(self.logger, "Stepping down: {}", reason);
        self.running.store(false, Ordering::Release);
        self.state_notifier.notify_new_state(LeadershipState::SteppedDown {
            term: self.term,
            reason,
        });
        self.shutdown.cancel();
    }
}

/// Turns the followers' published match indexes into the cluster commit index, and watches for
/// a lost quorum.
struct CommitAggregator {
    shared: Arc<LeaderShared>,
    log_store: Arc<dyn LogStore>,
    followers: Vec<(String, Arc<AmbassadorProgress>)>,
    commit_index_tx: watch::Sender<Index>,
    election_timeout: Duration,
}

impl CommitAggregator {
    async fn run(self) {
        let period = self.election_timeout / 3;
        loop {
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break,
                _ = self.shared.progress_notify.notified() => {}
                _ = tokio::time::sleep(period) => {}
            }

            if let Err(e) = self.advance_commit_index() {
                slog::warn!(self.shared.logger, "IO failure while advancing commit index: {:?}", e);
            }
            self.check_quorum();
        }
        slog::debug!(self.shared.logger, "Commit aggregator stopped");
    }

    fn advance_commit_index(&self) -> Result<(), io::Error> {
        let txn = self.log_store.read_transaction()?;
        let matches: Vec<Index> = self.followers.iter().map(|(_, p)| p.match_index()).collect();
        let candidate = get_cluster_commit_index(matches.clone(), txn.last_entry_index());
        let mut committed = txn.committed_index();

        // > If there exists an N such that N > commitIndex, a majority of matchIndex[i] ≥ N, and
        // > log[N].term == currentTerm: set commitIndex = N (§5.3, §5.4).
        if candidate > committed && txn.term_at(candidate)? == Some(self.shared.term) {
            self.log_store.set_committed_index(candidate)?;
            slog::debug!(self.shared.logger, "Commit index advanced to {:?}", candidate);
            committed = candidate;
        }
        self.commit_index_tx.send_if_modified(|current| {
            if committed > *current {
                *current = committed;
                true
            } else {
                false
            }
        });

        let lowest = matches.into_iter().fold(committed, Index::min);
        self.shared
            .lowest_index_required
            .store(lowest.as_u64(), Ordering::Release);

        Ok(())
    }

    fn check_quorum(&self) {
        if self.shared.started_at.elapsed() < self.election_timeout {
            return;
        }
        let cluster_size = self.followers.len() + 1;
        let required = cluster_size / 2 + 1;
        let now = Utc::now().timestamp_millis();
        let window = self.election_timeout.as_millis() as i64;
        let contacted = 1 + self
            .followers
            .iter()
            .filter(|(_, p)| {
                let last_contact = p.last_contact_millis();
                last_contact != 0 && now - last_contact <= window
            })
            .count();

        if contacted < required {
            self.shared.step_down(StepDownReason::LostQuorum { contacted, required });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLogStore;
    use crate::connection::MemoryNetwork;
    use crate::follower::FollowerNode;
    use crate::test_utils::{eventually, store_with_terms, test_logger};
    use crate::topology::{ClusterTopology, InMemoryTopologyStore};
    use bytes::Bytes;

    struct Cluster {
        network: MemoryNetwork,
        store: Arc<InMemoryLogStore>,
        followers: Vec<FollowerNode>,
        leader: Leader,
    }

    fn start_cluster(term: u64, store: InMemoryLogStore, follower_tags: &[&str], serving: usize) -> Cluster {
        let network = MemoryNetwork::new();
        let store = Arc::new(store);
        let mut infos = Vec::new();
        let mut members = vec![("A".to_string(), "mem://a".to_string())];
        let mut followers = Vec::new();
        for (i, tag) in follower_tags.iter().enumerate() {
            let url = format!("mem://{}", tag);
            infos.push(FollowerInfo::new(*tag, url.clone()));
            members.push((tag.to_string(), url.clone()));
            let follower = FollowerNode::new(*tag, test_logger());
            if i < serving {
                follower.serve(network.listen(url).unwrap());
            }
            followers.push(follower);
        }
        let topology = ClusterTopology {
            topology_id: "cluster".into(),
            leader_tag: "A".into(),
            members,
        };

        let leader = Leader::start(LeaderParts {
            logger: test_logger(),
            term: Term::new(term),
            leader_tag: "A".into(),
            leader_url: "mem://a".into(),
            followers: infos,
            options: ReplicationOptionsValidated::default(),
            snapshot_inclusion: SnapshotInclusion::all(),
            log_store: store.clone(),
            topology_store: Arc::new(InMemoryTopologyStore::new(topology)),
            connector: Arc::new(network.clone()),
        })
        .unwrap();

        Cluster {
            network,
            store,
            followers,
            leader,
        }
    }

    #[tokio::test]
    async fn commit_index_follows_the_majority() {
        // -- setup --
        let cluster = start_cluster(2, store_with_terms(&[2, 2]), &["b", "c"], 1);

        // -- execute --
        for i in 0..5 {
            cluster.store.append(Term::new(2), Bytes::from(format!("w{}", i)));
        }
        cluster.leader.notify_new_entries(cluster.store.last_entry_index());

        // -- verify --
        assert!(eventually(|| cluster.leader.commit_index() == Index::new(7)).await);
        assert_eq!(Index::new(7), cluster.store.committed_index());
        assert!(eventually(|| cluster.followers[0].store().committed_index() == Index::new(7)).await);
        let health = cluster.leader.cluster_health();
        assert_eq!(AmbassadorStatus::Connected, health[0].status);
        assert_eq!(AmbassadorStatus::FailedToConnect, health[1].status);
        assert!(health[1].last_exception.is_some());
        cluster.leader.dispose().await;
    }

    #[tokio::test]
    async fn entries_from_older_terms_are_not_committed_by_count() {
        // -- setup --
        let cluster = start_cluster(3, store_with_terms(&[1, 1, 2]), &["b", "c"], 2);

        // -- execute --
        assert!(eventually(|| cluster.leader.ambassador("b").unwrap().match_index() == Index::new(3)).await);
        assert!(eventually(|| cluster.leader.ambassador("c").unwrap().match_index() == Index::new(3)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // -- verify --
        assert_eq!(Index::zero(), cluster.leader.commit_index());

        cluster.store.append(Term::new(3), Bytes::from("current"));
        cluster.leader.notify_new_entries(Index::new(4));
        assert!(eventually(|| cluster.leader.commit_index() == Index::new(4)).await);
        cluster.leader.dispose().await;
    }

    #[tokio::test]
    async fn term_supersession_is_announced_once() {
        // -- setup --
        let cluster = start_cluster(2, store_with_terms(&[2]), &["b", "c"], 2);
        let mut listener = cluster.leader.leadership_listener();
        assert!(eventually(|| cluster.leader.commit_index() == Index::new(1)).await);

        // -- execute --
        cluster.followers[0].set_term(Term::new(5));
        cluster.followers[1].set_term(Term::new(5));

        // -- verify --
        match listener.next().await {
            Some(LeadershipState::SteppedDown {
                reason: StepDownReason::TermSuperseded { their_term, .. },
                ..
            }) => assert_eq!(Term::new(5), their_term),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(!cluster.leader.is_running());
        cluster.leader.dispose().await;
        assert!(matches!(listener.current(), LeadershipState::SteppedDown { .. }));
    }

    #[tokio::test]
    async fn unreachable_majority_loses_leadership() {
        let cluster = start_cluster(1, store_with_terms(&[1]), &["b", "c"], 0);
        let mut listener = cluster.leader.leadership_listener();

        let state = tokio::time::timeout(Duration::from_secs(5), listener.next()).await.unwrap();

        assert_eq!(
            Some(LeadershipState::SteppedDown {
                term: Term::new(1),
                reason: StepDownReason::LostQuorum {
                    contacted: 1,
                    required: 2,
                },
            }),
            state
        );
        cluster.leader.dispose().await;
    }

    #[tokio::test]
    async fn truncation_hint_trails_the_slowest_follower() {
        // -- setup --
        let cluster = start_cluster(1, store_with_terms(&[1, 1, 1]), &["b", "c"], 1);

        // -- execute --
        assert!(eventually(|| cluster.leader.commit_index() == Index::new(3)).await);

        // -- verify --
        assert_eq!(Index::zero(), cluster.leader.lowest_index_required_cluster_wide());
        cluster.followers[1].serve(cluster.network.listen("mem://c").unwrap());
        assert!(eventually(|| cluster.leader.lowest_index_required_cluster_wide() == Index::new(3)).await);
        cluster.leader.dispose().await;
    }

    #[tokio::test]
    async fn dispose_closes_every_ambassador() {
        let cluster = start_cluster(1, store_with_terms(&[1]), &["b", "c"], 1);
        assert!(eventually(|| cluster.leader.commit_index() == Index::new(1)).await);

        cluster.leader.dispose().await;

        assert!(cluster
            .leader
            .cluster_health()
            .iter()
            .all(|h| h.status == AmbassadorStatus::Closed));
        assert_eq!(
            LeadershipState::Disposed { term: Term::new(1) },
            cluster.leader.leadership_listener().current()
        );
    }
}
