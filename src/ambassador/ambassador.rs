use crate::ambassador::append_entries::{self, BatchLimits, RoundHints};
use crate::ambassador::error::AmbassadorError;
use crate::ambassador::negotiation;
use crate::ambassador::progress::{AmbassadorProgress, AmbassadorStatus};
use crate::ambassador::session::Session;
use crate::ambassador::shared_option::SharedOption;
use crate::ambassador::snapshot::{SnapshotInclusion, SnapshotSender};
use crate::ambassador::stop_signal::{self, Stopper};
use crate::api::ReplicationOptionsValidated;
use crate::commitlog::{Index, LogStore, Term};
use crate::connection::{Connection, ConnectionCloser, Connector};
use crate::leader::{LeaderContext, StepDownReason};
use crate::topology::{FollowerInfo, TopologyStore};
use crate::wire::ProtoHello;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub struct AmbassadorConfig {
    pub logger: slog::Logger,
    pub follower: FollowerInfo,
    pub options: ReplicationOptionsValidated,
    pub snapshot_inclusion: SnapshotInclusion,
}

/// Replicates the leader's log to a single follower for one leadership term.
///
/// All protocol work happens on a dedicated task started by `start()`. The handle only publishes
/// what that task learns (see `AmbassadorProgress`) and knows how to stop it.
pub struct FollowerAmbassador {
    logger: slog::Logger,
    follower: FollowerInfo,
    term: Term,
    progress: Arc<AmbassadorProgress>,
    stopper: Stopper,
    wake: Arc<Notify>,
    connection_closer: SharedOption<ConnectionCloser>,
    dispose_retry_interval: Duration,
    pending_task: Mutex<Option<AmbassadorTask>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FollowerAmbassador {
    pub fn new(
        config: AmbassadorConfig,
        leader: Arc<dyn LeaderContext>,
        log_store: Arc<dyn LogStore>,
        topology_store: Arc<dyn TopologyStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let logger = config.logger.new(slog::o!("Follower" => config.follower.tag.clone()));
        let term = leader.term();
        let progress = Arc::new(AmbassadorProgress::default());
        let (stopper, stop_check) = stop_signal::new(&leader.shutdown_signal());
        let wake = Arc::new(Notify::new());
        let connection_closer = SharedOption::new();

        let task = AmbassadorTask {
            session: Session {
                logger: logger.clone(),
                term,
                progress: progress.clone(),
                stop_check,
            },
            follower: config.follower.clone(),
            options: config.options.clone(),
            snapshot_inclusion: config.snapshot_inclusion,
            leader,
            log_store,
            topology_store,
            connector,
            connection_closer: connection_closer.clone(),
            wake: wake.clone(),
        };

        FollowerAmbassador {
            logger,
            follower: config.follower,
            term,
            progress,
            stopper,
            wake,
            connection_closer,
            dispose_retry_interval: config.options.dispose_retry_interval(),
            pending_task: Mutex::new(Some(task)),
            join_handle: Mutex::new(None),
        }
    }

    /// Spawn the replication task. Only the first call does anything.
    pub fn start(&self) -> Result<(), AmbassadorError> {
        let task = self
            .pending_task
            .lock()
            .expect("FollowerAmbassador pending task mutex guard poison")
            .take()
            .ok_or(AmbassadorError::AlreadyStarted)?;

        self.progress.set_status(AmbassadorStatus::Started, "Started");
        let handle = tokio::task::spawn(task.run());
        self.join_handle
            .lock()
            .expect("FollowerAmbassador join handle mutex guard poison")
            .replace(handle);

        Ok(())
    }

    /// Stop replicating and wait for the task to exit.
    ///
    /// Closing the connection is what unblocks a task stuck reading from a silent follower. The
    /// task may have opened a new connection in the meantime, so the close is repeated every
    /// time the wait runs out.
    pub async fn dispose(&self) {
        self.stopper.stop();
        self.close_connection();

        let handle = self
            .join_handle
            .lock()
            .expect("FollowerAmbassador join handle mutex guard poison")
            .take();
        if let Some(mut handle) = handle {
            loop {
                match tokio::time::timeout(self.dispose_retry_interval, &mut handle).await {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => {
                        slog::error!(self.logger, "Ambassador task failed: {:?}", e);
                        break;
                    }
                    Err(_) => {
                        slog::warn!(
                            self.logger,
                            "Ambassador task did not exit within {:?}, closing its connection again",
                            self.dispose_retry_interval
                        );
                        self.close_connection();
                    }
                }
            }
        }
        // Never started.
        self.pending_task
            .lock()
            .expect("FollowerAmbassador pending task mutex guard poison")
            .take();

        self.progress.set_status(AmbassadorStatus::Closed, "Disposed");
        slog::info!(self.logger, "Ambassador disposed");
    }

    /// Ask the follower to start an election as soon as possible. Sent with the next
    /// AppendEntries.
    pub fn force_elections(&self) {
        self.progress.request_force_elections();
        self.wake.notify_one();
    }

    fn close_connection(&self) {
        if let Some(closer) = self.connection_closer.get() {
            closer.close();
        }
    }

    pub fn tag(&self) -> &str {
        &self.follower.tag
    }

    pub fn url(&self) -> &str {
        &self.follower.url
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn match_index(&self) -> Index {
        self.progress.match_index()
    }

    pub fn status(&self) -> AmbassadorStatus {
        self.progress.status()
    }

    pub fn status_message(&self) -> String {
        self.progress.status_message()
    }

    pub fn last_send(&self) -> Option<DateTime<Utc>> {
        self.progress.last_send()
    }

    pub fn last_contact(&self) -> Option<DateTime<Utc>> {
        self.progress.last_contact()
    }

    pub(crate) fn progress(&self) -> &Arc<AmbassadorProgress> {
        &self.progress
    }
}

struct AmbassadorTask {
    session: Session,
    follower: FollowerInfo,
    options: ReplicationOptionsValidated,
    snapshot_inclusion: SnapshotInclusion,
    leader: Arc<dyn LeaderContext>,
    log_store: Arc<dyn LogStore>,
    topology_store: Arc<dyn TopologyStore>,
    connector: Arc<dyn Connector>,
    connection_closer: SharedOption<ConnectionCloser>,
    wake: Arc<Notify>,
}

impl AmbassadorTask {
    async fn run(self) {
        let logger = self.session.logger.clone();
        slog::info!(logger, "Replicating to {} in term {:?}", self.follower.url, self.session.term);

        loop {
            if self.session.should_stop() || !self.leader.is_running() {
                break;
            }

            let mut connected = false;
            let result = self.replicate_over_new_connection(&mut connected).await;
            self.close_current_connection();

            match result {
                Ok(()) => break,
                Err(e) if e.is_cancellation() || self.session.should_stop() => break,
                Err(AmbassadorError::TermChanged { ours, theirs }) => {
                    slog::warn!(
                        logger,
                        "Follower reported term {:?} while we lead in {:?}, stepping down",
                        theirs,
                        ours
                    );
                    self.session.progress.set_status(
                        AmbassadorStatus::Closed,
                        format!("Term superseded: follower is at term {:?}, we are at {:?}", theirs, ours),
                    );
                    self.leader.step_down(StepDownReason::TermSuperseded {
                        follower_tag: self.follower.tag.clone(),
                        our_term: ours,
                        their_term: theirs,
                    });
                    return;
                }
                Err(e) => {
                    self.report_failure(&e, connected);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.session.progress.set_status(AmbassadorStatus::Closed, "Closed");
        slog::info!(logger, "Ambassador stopped");
    }

    fn report_failure(&self, error: &AmbassadorError, connected: bool) {
        let logger = &self.session.logger;
        if error.is_protocol_violation() {
            slog::error!(logger, "Replication failed: {}", error);
        } else {
            slog::warn!(logger, "Replication failed: {}", error);
        }

        let (status, message) = if connected {
            (AmbassadorStatus::Disconnected, format!("Disconnected due to: {}", error))
        } else {
            (
                AmbassadorStatus::FailedToConnect,
                format!("Failed to connect to {}: {}", self.follower.url, error),
            )
        };
        self.session.progress.set_status(status, message);
        self.leader.notify_exception(&self.follower.tag, error);
    }

    /// Returns false if we were asked to stop while waiting.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.session.stop_check.stopped() => false,
            _ = tokio::time::sleep(self.options.reconnect_backoff()) => true,
        }
    }

    fn close_current_connection(&self) {
        if let Some(closer) = self.connection_closer.take() {
            closer.close();
        }
    }

    async fn replicate_over_new_connection(&self, connected: &mut bool) -> Result<(), AmbassadorError> {
        let session = &self.session;
        let mut connection = session
            .guarded(async {
                Ok(self
                    .connector
                    .connect(&self.follower.url, self.follower.certificate.as_ref())
                    .await?)
            })
            .await?;

        // dispose() may have run between the connect and the registration; it would have
        // missed this connection.
        self.connection_closer.replace(connection.closer());
        if session.should_stop() {
            return Err(AmbassadorError::Cancelled);
        }

        let hello = ProtoHello {
            topology_id: self.topology_store.current_topology().topology_id,
            leader_tag: self.leader.leader_tag(),
            follower_tag: self.follower.tag.clone(),
            election_timeout_ms: self.options.election_timeout.as_millis() as u64,
            leader_url: self.leader.leader_url(),
            follower_url: self.follower.url.clone(),
        };
        session.send(connection.as_mut(), hello).await?;
        *connected = true;
        session
            .progress
            .set_status(AmbassadorStatus::Connected, format!("Connected to {}", self.follower.url));
        slog::info!(session.logger, "Connected to {}", self.follower.url);

        let negotiated = negotiation::negotiate(session, &*self.log_store, connection.as_mut()).await?;
        let mut match_index = self.advance_match_index(Index::zero(), negotiated.match_index);

        let snapshot = SnapshotSender {
            session,
            inclusion: &self.snapshot_inclusion,
            liveness_check_every_records: self.options.snapshot_liveness_check_every_records,
            liveness_interval: self.options.snapshot_liveness_interval(),
        }
        .send(
            connection.as_mut(),
            &*self.log_store,
            &*self.topology_store,
            match_index,
        )
        .await?;
        match_index = self.advance_match_index(match_index, snapshot.last_log_index);

        self.replicate_entries(connection.as_mut(), match_index).await
    }

    async fn replicate_entries(
        &self,
        connection: &mut dyn Connection,
        mut match_index: Index,
    ) -> Result<(), AmbassadorError> {
        let session = &self.session;
        let limits = BatchLimits {
            max_bytes: self.options.max_append_entries_batch_bytes,
            time_box: self.options.append_entries_round_time_box,
        };

        loop {
            if session.should_stop() || !self.leader.is_running() {
                return Ok(());
            }

            let force_elections = session.progress.force_elections_requested();
            let hints = RoundHints {
                truncate_log_before: self.leader.lowest_index_required_cluster_wide(),
                force_elections,
                time_as_leader: self.leader.time_as_leader(),
            };
            let request = {
                let txn = self.log_store.read_transaction()?;
                append_entries::build_batch(&*txn, match_index, session.term, limits, hints)?
            };
            let sent = request.entries.len();

            let follower_last = append_entries::replicate_round(session, connection, request).await?;
            slog::debug!(
                session.logger,
                "Follower acknowledged {} entries after {:?}, now at {:?}",
                sent,
                match_index,
                follower_last
            );
            match_index = self.advance_match_index(match_index, follower_last);
            if force_elections {
                session.progress.clear_force_elections();
            }
            self.leader.notify_progress(&self.follower.tag);

            let leader_last = self.log_store.read_transaction()?.last_entry_index();
            if match_index >= leader_last {
                tokio::select! {
                    biased;
                    _ = session.stop_check.stopped() => return Err(AmbassadorError::Cancelled),
                    _ = self.wake.notified() => {}
                    _ = self
                        .leader
                        .wait_for_new_entries(match_index, self.options.heartbeat_interval()) => {}
                }
            }
        }
    }

    fn advance_match_index(&self, current: Index, reported: Index) -> Index {
        if reported < current {
            slog::warn!(
                self.session.logger,
                "Follower went back from {:?} to {:?}",
                current,
                reported
            );
        }
        self.session.progress.publish_match_index(reported);
        reported
    }
}
