use crate::commitlog::{Index, LogEntry, LogStore, StructureData, Term};
use crate::connection::{Connection, ConnectionExt};
use crate::follower::follower::{FollowerError, FollowerEvent, FollowerShared};
use crate::topology::ClusterTopology;
use crate::wire::{
    ProtoAppendEntries, ProtoAppendEntriesResponse, ProtoInstallSnapshot, ProtoInstallSnapshotResponse,
    ProtoLogLengthNegotiation, ProtoLogLengthNegotiationResponse, ProtoNegotiationStatus, ProtoSnapshotMapEntry,
    ProtoSnapshotStructure, ProtoSnapshotTableRow, ProtoStructureKind, RaftMessage,
};
use bytes::Bytes;
use std::collections::BTreeMap;

pub(super) struct FollowerSession<'a> {
    node: &'a FollowerShared,
    logger: slog::Logger,
    connection: &'a mut dyn Connection,
}

impl<'a> FollowerSession<'a> {
    pub(super) fn new(node: &'a FollowerShared, logger: slog::Logger, connection: &'a mut dyn Connection) -> Self {
        FollowerSession {
            node,
            logger,
            connection,
        }
    }

    pub(super) async fn run(mut self) -> Result<(), FollowerError> {
        loop {
            match self.connection.read_message().await? {
                RaftMessage::LogLengthNegotiation(request) => self.negotiate(request).await?,
                RaftMessage::InstallSnapshot(request) => self.install_snapshot(request).await?,
                RaftMessage::AppendEntries(request) => self.append_entries(request).await?,
                other => {
                    return Err(FollowerError::Protocol(format!(
                        "Unexpected {} outside of a request",
                        other.kind_name()
                    )))
                }
            }
        }
    }

    /// Binary search over `[lo, hi]`: everything below `lo` is known to agree with the leader,
    /// everything above `hi` is known not to. Each leader probe also tells us what the leader
    /// concluded about our previous midpoint, since it only probes above it on agreement.
    async fn negotiate(&mut self, first: ProtoLogLengthNegotiation) -> Result<(), FollowerError> {
        let store = self.node.store.clone();
        let committed = store.committed_index().as_u64();
        let last = store.last_entry_index().as_u64();
        let leader_last = first.prev_log_index;

        let mut lo = committed + 1;
        let mut hi = last.min(leader_last);
        let mut previous_midpoint: Option<u64> = None;
        let mut request = first;

        loop {
            let (current_term, accepted) = self.node.observe_term(request.term);
            if !accepted {
                return self
                    .send_negotiation(ProtoLogLengthNegotiationResponse {
                        current_term,
                        status: ProtoNegotiationStatus::Rejected as i32,
                        message: format!("Term {} is stale, we are at {}", request.term, current_term),
                        ..Default::default()
                    })
                    .await;
            }

            let probe = request.prev_log_index;
            if let Some(midpoint) = previous_midpoint {
                if probe >= midpoint {
                    lo = lo.max(midpoint + 1);
                } else {
                    hi = hi.min(midpoint - 1);
                }
            }

            if !request.truncated {
                let agrees = probe <= committed
                    || store.term_at(Index::new(probe)) == Some(Term::new(request.prev_log_term));
                if agrees {
                    lo = lo.max(probe + 1);
                } else {
                    hi = hi.min(probe.saturating_sub(1));
                }
            }

            if request.truncated || lo > hi {
                let agreed = (lo - 1).min(leader_last).min(last);
                return self.accept(agreed, committed, last, current_term).await;
            }

            let midpoint = (lo + hi) / 2;
            let midpoint_term = store.term_at(Index::new(midpoint)).ok_or_else(|| {
                FollowerError::Protocol(format!("No local term for uncommitted index {}", midpoint))
            })?;
            slog::debug!(self.logger, "Negotiating within [{}, {}], midpoint {}", lo, hi, midpoint);
            self.send_negotiation(ProtoLogLengthNegotiationResponse {
                current_term,
                status: ProtoNegotiationStatus::Negotiate as i32,
                min_index: lo,
                max_index: hi,
                midpoint_index: midpoint,
                midpoint_term: midpoint_term.as_u64(),
                ..Default::default()
            })
            .await?;
            previous_midpoint = Some(midpoint);

            request = self.connection.read::<ProtoLogLengthNegotiation>().await?;
        }
    }

    async fn accept(&mut self, agreed: u64, committed: u64, last: u64, current_term: u64) -> Result<(), FollowerError> {
        if agreed < committed {
            slog::warn!(
                self.logger,
                "Leader's log agrees only up to {}, but we committed {}",
                agreed,
                committed
            );
            return self
                .send_negotiation(ProtoLogLengthNegotiationResponse {
                    current_term,
                    status: ProtoNegotiationStatus::Rejected as i32,
                    message: format!(
                        "Agreement point {} precedes our committed index {}",
                        agreed, committed
                    ),
                    ..Default::default()
                })
                .await;
        }

        if agreed < last {
            slog::info!(self.logger, "Dropping entries after {} that the leader does not have", agreed);
            self.node.store.truncate_from(Index::new(agreed + 1))?;
        }
        slog::info!(self.logger, "Agreed with leader up to {}", agreed);
        self.node.emit(FollowerEvent::Negotiated {
            match_index: Index::new(agreed),
        });
        self.send_negotiation(ProtoLogLengthNegotiationResponse {
            current_term,
            status: ProtoNegotiationStatus::Acceptable as i32,
            last_log_index: agreed,
            ..Default::default()
        })
        .await
    }

    async fn send_negotiation(&mut self, response: ProtoLogLengthNegotiationResponse) -> Result<(), FollowerError> {
        Ok(self.connection.send(response.into()).await?)
    }

    async fn install_snapshot(&mut self, request: ProtoInstallSnapshot) -> Result<(), FollowerError> {
        let (current_term, accepted) = self.node.observe_term(request.term);
        let topology = ClusterTopology::from_bytes(&request.topology)
            .map_err(|e| FollowerError::Protocol(format!("Bad topology in snapshot: {}", e)))?;

        let mut structures = BTreeMap::new();
        let mut records: u64 = 0;
        loop {
            let header = self.connection.read::<ProtoSnapshotStructure>().await?;
            let key = Bytes::from(header.key.clone());
            let data = match header.kind() {
                ProtoStructureKind::None => break,
                ProtoStructureKind::OrderedMap => {
                    let mut map = BTreeMap::new();
                    for _ in 0..header.count {
                        let entry = self.connection.read::<ProtoSnapshotMapEntry>().await?;
                        map.insert(Bytes::from(entry.key), Bytes::from(entry.value));
                    }
                    StructureData::OrderedMap(map)
                }
                ProtoStructureKind::Table => {
                    // The count comes off the wire, so it is never used to size an allocation.
                    let mut rows = Vec::new();
                    for _ in 0..header.count {
                        let row = self.connection.read::<ProtoSnapshotTableRow>().await?;
                        rows.push(Bytes::from(row.data));
                    }
                    StructureData::Table(rows)
                }
            };
            records = records.saturating_add(header.count);
            structures.insert(key, data);
        }

        if accepted {
            self.node.set_topology(topology);
            if request.last_included_index > 0 {
                let last_included_index = Index::new(request.last_included_index);
                self.node.store.install_snapshot(
                    last_included_index,
                    Term::new(request.last_included_term),
                    structures,
                );
                slog::info!(
                    self.logger,
                    "Installed snapshot up to {:?} with {} records",
                    last_included_index,
                    records
                );
                self.node.emit(FollowerEvent::SnapshotInstalled {
                    last_included_index,
                    records,
                });
            }
        }

        for _ in 0..self.node.pending_replies() {
            let pending = ProtoInstallSnapshotResponse {
                current_term,
                done: false,
                last_log_index: 0,
            };
            self.connection.send(pending.into()).await?;
        }
        let done = ProtoInstallSnapshotResponse {
            current_term,
            done: true,
            last_log_index: self.node.store.last_entry_index().as_u64(),
        };
        Ok(self.connection.send(done.into()).await?)
    }

    async fn append_entries(&mut self, request: ProtoAppendEntries) -> Result<(), FollowerError> {
        let (current_term, accepted) = self.node.observe_term(request.term);
        if !accepted {
            return self
                .reply_append(ProtoAppendEntriesResponse {
                    current_term,
                    message: format!("Term {} is stale, we are at {}", request.term, current_term),
                    ..Default::default()
                })
                .await;
        }

        let prev_log_index = Index::new(request.prev_log_index);
        self.node.emit(FollowerEvent::AppendEntries {
            prev_log_index,
            entries: request.entries.len(),
            leader_commit: Index::new(request.leader_commit),
            force_elections: request.force_elections,
        });
        if request.force_elections {
            slog::info!(self.logger, "Leader asked us to start an election");
        }

        let store = self.node.store.clone();
        if store.term_at(prev_log_index) != Some(Term::new(request.prev_log_term)) {
            return self
                .reply_append(ProtoAppendEntriesResponse {
                    current_term,
                    last_log_index: store.last_entry_index().as_u64(),
                    message: format!(
                        "No entry {:?} with term {}",
                        prev_log_index, request.prev_log_term
                    ),
                    ..Default::default()
                })
                .await;
        }

        let sent = request.entries.len() as u64;
        for entry in request.entries {
            let index = Index::new(entry.index);
            if index <= store.last_entry_index() {
                if index <= store.committed_index() || store.term_at(index) == Some(Term::new(entry.term)) {
                    continue;
                }
                slog::info!(self.logger, "Conflict at {:?}, dropping our entries from there", index);
                store.truncate_from(index)?;
            }
            store.append_entry(LogEntry {
                index,
                term: Term::new(entry.term),
                data: Bytes::from(entry.data),
                flags: entry.flags,
            })?;
        }

        let last_verified = request.prev_log_index + sent;
        let commit = request.leader_commit.min(last_verified);
        if commit > store.committed_index().as_u64() {
            store.set_committed_index(Index::new(commit))?;
        }
        let compact_before = request.truncate_log_before.min(store.committed_index().as_u64() + 1);
        if compact_before > store.first_entry_index().as_u64() {
            store.compact_before(Index::new(compact_before))?;
        }

        for _ in 0..self.node.pending_replies() {
            let pending = ProtoAppendEntriesResponse {
                current_term,
                pending: true,
                message: "Applying".to_string(),
                ..Default::default()
            };
            self.connection.send(pending.into()).await?;
        }
        self.reply_append(ProtoAppendEntriesResponse {
            current_term,
            last_log_index: last_verified,
            success: true,
            ..Default::default()
        })
        .await
    }

    async fn reply_append(&mut self, response: ProtoAppendEntriesResponse) -> Result<(), FollowerError> {
        Ok(self.connection.send(response.into()).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::commitlog::{Index, LogStore, Term};
    use crate::connection::{Connection, ConnectionExt, Connector, Listener, MemoryNetwork};
    use crate::follower::FollowerNode;
    use crate::test_utils::{store_with_terms, test_logger};
    use crate::topology::ClusterTopology;
    use crate::wire::*;
    use std::sync::Arc;

    async fn connect(follower: &FollowerNode) -> Box<dyn Connection> {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("mem://b").unwrap();
        let mut connection = network.connect("mem://b", None).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        let node = follower.clone();
        tokio::spawn(async move {
            let _ = node.handle_connection(accepted).await;
        });
        connection
            .send(
                ProtoHello {
                    leader_tag: "A".into(),
                    ..Default::default()
                }
                .into(),
            )
            .await
            .unwrap();
        connection
    }

    fn entry(index: u64, term: u64) -> ProtoLogEntry {
        ProtoLogEntry {
            index,
            term,
            data: format!("leader-{}", index).into_bytes(),
            flags: 0,
        }
    }

    #[tokio::test]
    async fn conflicting_uncommitted_suffix_is_replaced() {
        // -- setup --
        let store = Arc::new(store_with_terms(&[1, 1, 2, 2]));
        store.set_committed_index(Index::new(2)).unwrap();
        let follower = FollowerNode::with_store("B", store.clone(), test_logger());
        let mut connection = connect(&follower).await;

        // -- execute --
        let request = ProtoAppendEntries {
            term: 3,
            prev_log_index: 2,
            prev_log_term: 1,
            leader_commit: 3,
            entries: vec![entry(3, 3)],
            ..Default::default()
        };
        connection.send(request.into()).await.unwrap();
        let response = connection.read::<ProtoAppendEntriesResponse>().await.unwrap();

        // -- verify --
        assert!(response.success);
        assert_eq!((3, 3), (response.current_term, response.last_log_index));
        assert_eq!(Index::new(3), store.last_entry_index());
        assert_eq!(Some(Term::new(3)), store.term_at(Index::new(3)));
        assert_eq!(Index::new(3), store.committed_index());
    }

    #[tokio::test]
    async fn missing_previous_entry_fails_the_append() {
        let follower = FollowerNode::with_store("B", Arc::new(store_with_terms(&[1])), test_logger());
        let mut connection = connect(&follower).await;

        let request = ProtoAppendEntries {
            term: 1,
            prev_log_index: 5,
            prev_log_term: 1,
            entries: vec![entry(6, 1)],
            ..Default::default()
        };
        connection.send(request.into()).await.unwrap();
        let response = connection.read::<ProtoAppendEntriesResponse>().await.unwrap();

        assert!(!response.success);
        assert!(!response.pending);
        assert_eq!(1, response.last_log_index);
    }

    #[tokio::test]
    async fn stale_leader_learns_the_newer_term() {
        let follower = FollowerNode::new("B", test_logger());
        follower.set_term(Term::new(7));
        let mut connection = connect(&follower).await;

        let request = ProtoAppendEntries {
            term: 6,
            ..Default::default()
        };
        connection.send(request.into()).await.unwrap();
        let response = connection.read::<ProtoAppendEntriesResponse>().await.unwrap();

        assert_eq!(7, response.current_term);
        assert!(!response.success);
    }

    #[tokio::test]
    async fn pending_replies_precede_the_terminal_one() {
        let follower = FollowerNode::new("B", test_logger());
        follower.set_pending_replies(2);
        let mut connection = connect(&follower).await;

        let request = ProtoAppendEntries {
            term: 1,
            entries: vec![entry(1, 1)],
            ..Default::default()
        };
        connection.send(request.into()).await.unwrap();

        for _ in 0..2 {
            assert!(connection.read::<ProtoAppendEntriesResponse>().await.unwrap().pending);
        }
        let terminal = connection.read::<ProtoAppendEntriesResponse>().await.unwrap();
        assert!(terminal.success);
        assert_eq!(1, terminal.last_log_index);
    }

    #[tokio::test]
    async fn truncation_hint_compacts_committed_prefix() {
        let store = Arc::new(store_with_terms(&[1, 1, 1, 1]));
        let follower = FollowerNode::with_store("B", store.clone(), test_logger());
        let mut connection = connect(&follower).await;

        let request = ProtoAppendEntries {
            term: 1,
            prev_log_index: 4,
            prev_log_term: 1,
            leader_commit: 3,
            truncate_log_before: 10,
            ..Default::default()
        };
        connection.send(request.into()).await.unwrap();
        connection.read::<ProtoAppendEntriesResponse>().await.unwrap();

        assert_eq!(Index::new(3), store.committed_index());
        assert_eq!(Index::new(4), store.first_entry_index());
        assert_eq!(Some(Term::new(1)), store.term_at(Index::new(3)));
    }

    #[tokio::test]
    async fn snapshot_replaces_state_and_records_topology() {
        // -- setup --
        let store = Arc::new(store_with_terms(&[1, 1]));
        let follower = FollowerNode::with_store("B", store.clone(), test_logger());
        let mut connection = connect(&follower).await;
        let topology = ClusterTopology {
            topology_id: "t".into(),
            leader_tag: "A".into(),
            members: vec![("A".into(), "mem://a".into())],
        };

        // -- execute --
        let frames: Vec<RaftMessage> = vec![
            ProtoInstallSnapshot {
                term: 2,
                last_included_index: 40,
                last_included_term: 2,
                topology: topology.to_bytes().to_vec(),
            }
            .into(),
            ProtoSnapshotStructure {
                kind: ProtoStructureKind::Table as i32,
                key: b"rows".to_vec(),
                count: 2,
            }
            .into(),
            ProtoSnapshotTableRow { data: b"r1".to_vec() }.into(),
            ProtoSnapshotTableRow { data: b"r2".to_vec() }.into(),
            ProtoSnapshotStructure::default().into(),
        ];
        for frame in frames {
            connection.send(frame).await.unwrap();
        }
        let response = connection.read::<ProtoInstallSnapshotResponse>().await.unwrap();

        // -- verify --
        assert!(response.done);
        assert_eq!(40, response.last_log_index);
        assert_eq!(Index::new(40), store.committed_index());
        assert!(store.entries().is_empty());
        assert_eq!(Some(topology), follower.topology());
        assert_eq!(1, store.structures().len());
    }

    #[tokio::test]
    async fn absurd_structure_count_fails_the_session_without_panicking() {
        // -- setup --
        let follower = FollowerNode::new("B", test_logger());
        let network = MemoryNetwork::new();
        let mut listener = network.listen("mem://b").unwrap();
        let mut connection = network.connect("mem://b", None).await.unwrap();
        let accepted = listener.accept().await.unwrap();
        let node = follower.clone();
        let session = tokio::spawn(async move { node.handle_connection(accepted).await });

        // -- execute --
        let frames: Vec<RaftMessage> = vec![
            ProtoHello {
                leader_tag: "A".into(),
                ..Default::default()
            }
            .into(),
            ProtoInstallSnapshot {
                term: 1,
                last_included_index: 5,
                last_included_term: 1,
                topology: ClusterTopology::default().to_bytes().to_vec(),
            }
            .into(),
            ProtoSnapshotStructure {
                kind: ProtoStructureKind::Table as i32,
                key: b"rows".to_vec(),
                count: u64::MAX,
            }
            .into(),
            ProtoSnapshotTableRow { data: b"r1".to_vec() }.into(),
            ProtoSnapshotMapEntry {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }
            .into(),
        ];
        for frame in frames {
            connection.send(frame).await.unwrap();
        }
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), session)
            .await
            .expect("Session did not end");

        // -- verify --
        let result = outcome.expect("Session task panicked");
        assert!(matches!(
            result,
            Err(crate::follower::FollowerError::Connection(
                crate::connection::ConnectionError::UnexpectedMessage { .. }
            ))
        ));
        assert!(follower.store().structures().is_empty());
    }
}
