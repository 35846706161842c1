use crate::ambassador::error::AmbassadorError;
use crate::ambassador::session::Session;
use crate::commitlog::{Index, LogStore, PersistedStructure, ReadTransaction, StructureKind};
use crate::connection::Connection;
use crate::topology::TopologyStore;
use crate::wire::{
    ProtoInstallSnapshot, ProtoInstallSnapshotResponse, ProtoSnapshotMapEntry, ProtoSnapshotStructure,
    ProtoSnapshotTableRow, ProtoStructureKind,
};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Decides which persisted structures are shipped in a full state transfer.
#[derive(Clone)]
pub struct SnapshotInclusion(Arc<dyn Fn(&PersistedStructure) -> bool + Send + Sync>);

impl SnapshotInclusion {
    pub fn new(predicate: impl Fn(&PersistedStructure) -> bool + Send + Sync + 'static) -> Self {
        SnapshotInclusion(Arc::new(predicate))
    }

    pub fn all() -> Self {
        Self::new(|_| true)
    }

    pub fn includes(&self, structure: &PersistedStructure) -> bool {
        (self.0)(structure)
    }
}

impl Default for SnapshotInclusion {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for SnapshotInclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotInclusion")
    }
}

/// Entries are only shippable from `first_entry_index - 1` on, since that is the oldest index we
/// still know the term of.
pub(super) fn transfer_needed(match_index: Index, txn: &dyn ReadTransaction) -> bool {
    match_index.plus(1) < txn.first_entry_index()
}

pub(super) struct SnapshotSender<'a> {
    pub(super) session: &'a Session,
    pub(super) inclusion: &'a SnapshotInclusion,
    pub(super) liveness_check_every_records: u64,
    pub(super) liveness_interval: Duration,
}

#[derive(Debug, PartialEq)]
pub(super) struct SnapshotOutcome {
    pub(super) last_log_index: Index,
    pub(super) records_sent: u64,
}

impl SnapshotSender<'_> {
    /// Always sends an InstallSnapshot. It only carries state when the follower is behind the
    /// leader's retained history; otherwise it just delivers the topology.
    pub(super) async fn send(
        &self,
        connection: &mut dyn Connection,
        log_store: &dyn LogStore,
        topology_store: &dyn TopologyStore,
        match_index: Index,
    ) -> Result<SnapshotOutcome, AmbassadorError> {
        let session = self.session;
        let topology = topology_store.raw_topology_bytes().to_vec();

        let (leader_last_index, records_sent) = {
            let txn = log_store.read_transaction()?;
            let leader_last_index = txn.last_entry_index();

            if transfer_needed(match_index, &*txn) {
                let last_included_index = txn.committed_index();
                let last_included_term = txn
                    .term_at(last_included_index)?
                    .ok_or(AmbassadorError::MissingLogEntry(last_included_index))?;
                slog::info!(
                    session.logger,
                    "Follower match index {:?} precedes our retained log starting at {:?}, sending snapshot up to {:?}",
                    match_index,
                    txn.first_entry_index(),
                    last_included_index
                );
                session
                    .progress
                    .set_status_message(format!("Sending snapshot up to {:?}", last_included_index));

                let request = ProtoInstallSnapshot {
                    term: session.term.as_u64(),
                    last_included_index: last_included_index.as_u64(),
                    last_included_term: last_included_term.as_u64(),
                    topology,
                };
                session.send(connection, request).await?;
                let records_sent = self.stream_structures(connection, &*txn, match_index).await?;
                slog::info!(session.logger, "Streamed {} snapshot records", records_sent);

                (leader_last_index, records_sent)
            } else {
                slog::debug!(session.logger, "No state transfer needed at match index {:?}", match_index);
                let request = ProtoInstallSnapshot {
                    term: session.term.as_u64(),
                    last_included_index: 0,
                    last_included_term: 0,
                    topology,
                };
                session.send(connection, request).await?;
                session.send(connection, terminator()).await?;

                (leader_last_index, 0)
            }
        };

        let last_log_index = self.await_completion(connection).await?;
        if last_log_index > leader_last_index {
            return Err(AmbassadorError::ProtocolViolation(format!(
                "Follower reported index {:?} after snapshot, beyond our last index {:?}",
                last_log_index, leader_last_index
            )));
        }

        Ok(SnapshotOutcome {
            last_log_index,
            records_sent,
        })
    }

    async fn stream_structures(
        &self,
        connection: &mut dyn Connection,
        txn: &dyn ReadTransaction,
        match_index: Index,
    ) -> Result<u64, AmbassadorError> {
        let mut liveness = LivenessGate::new(self.liveness_check_every_records, self.liveness_interval);

        for structure in txn.persisted_structures()? {
            if !self.inclusion.includes(&structure) {
                continue;
            }
            let count = txn.structure_len(&structure)?;
            let header = ProtoSnapshotStructure {
                kind: match structure.kind {
                    StructureKind::OrderedMap => ProtoStructureKind::OrderedMap,
                    StructureKind::Table => ProtoStructureKind::Table,
                } as i32,
                key: structure.key.to_vec(),
                count,
            };
            self.session.send(connection, header).await?;

            let mut sent = 0u64;
            match structure.kind {
                StructureKind::OrderedMap => {
                    for item in txn.map_entries(&structure) {
                        let (key, value) = item?;
                        let entry = ProtoSnapshotMapEntry {
                            key: key.to_vec(),
                            value: value.to_vec(),
                        };
                        self.session.send(connection, entry).await?;
                        sent += 1;
                        self.report_liveness_if_due(&mut liveness, match_index);
                    }
                }
                StructureKind::Table => {
                    for row in txn.table_rows(&structure) {
                        let row = ProtoSnapshotTableRow { data: row?.to_vec() };
                        self.session.send(connection, row).await?;
                        sent += 1;
                        self.report_liveness_if_due(&mut liveness, match_index);
                    }
                }
            }

            if sent != count {
                return Err(AmbassadorError::Storage(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Structure {:?} announced {} items but yielded {}", structure.key, count, sent),
                )));
            }
        }

        self.session.send(connection, terminator()).await?;
        Ok(liveness.records)
    }

    fn report_liveness_if_due(&self, liveness: &mut LivenessGate, match_index: Index) {
        if liveness.record() {
            let progress = &self.session.progress;
            progress.publish_match_index(match_index);
            progress.touch_contact();
            progress.set_status_message(format!("Sending snapshot, {} records sent", liveness.records));
            slog::debug!(self.session.logger, "Snapshot still streaming, {} records sent", liveness.records);
        }
    }

    async fn await_completion(&self, connection: &mut dyn Connection) -> Result<Index, AmbassadorError> {
        loop {
            let response = self.session.read::<ProtoInstallSnapshotResponse>(connection).await?;
            self.session.check_term(response.current_term)?;
            if response.done {
                return Ok(Index::new(response.last_log_index));
            }
            slog::debug!(self.session.logger, "Follower is still applying the snapshot");
        }
    }
}

fn terminator() -> ProtoSnapshotStructure {
    ProtoSnapshotStructure {
        kind: ProtoStructureKind::None as i32,
        key: Vec::new(),
        count: 0,
    }
}

/// Reading the clock for every record is wasteful, so only every `every`th record checks whether
/// `interval` has passed since the last report.
struct LivenessGate {
    every: u64,
    interval: Duration,
    last_report: Instant,
    records: u64,
}

impl LivenessGate {
    fn new(every: u64, interval: Duration) -> Self {
        LivenessGate {
            every: every.max(1),
            interval,
            last_report: Instant::now(),
            records: 0,
        }
    }

    fn record(&mut self) -> bool {
        self.records += 1;
        if self.records % self.every != 0 {
            return false;
        }
        if self.last_report.elapsed() < self.interval {
            return false;
        }
        self.last_report = Instant::now();
        true
    }
}
