use crate::ambassador::error::AmbassadorError;
use crate::ambassador::session::Session;
use crate::commitlog::{Index, ReadTransaction, Term};
use crate::connection::Connection;
use crate::wire::{ProtoAppendEntries, ProtoAppendEntriesResponse, ProtoLogEntry};
use prost::Message;
use tokio::time::{Duration, Instant};

#[derive(Copy, Clone, Debug)]
pub(super) struct BatchLimits {
    pub(super) max_bytes: usize,
    pub(super) time_box: Duration,
}

/// Leader state piggybacked on every AppendEntries.
#[derive(Copy, Clone, Debug, Default)]
pub(super) struct RoundHints {
    pub(super) truncate_log_before: Index,
    pub(super) force_elections: bool,
    pub(super) time_as_leader: Duration,
}

/// Collect the entries after `match_index`. The first entry always goes in, so a single oversized
/// entry can still be replicated; after that, entries are added while the batch stays under
/// `max_bytes` and the time box has not run out. An empty batch is a heartbeat.
pub(super) fn build_batch(
    txn: &dyn ReadTransaction,
    match_index: Index,
    term: Term,
    limits: BatchLimits,
    hints: RoundHints,
) -> Result<ProtoAppendEntries, AmbassadorError> {
    let started = Instant::now();
    let prev_log_term = txn
        .term_at(match_index)?
        .ok_or(AmbassadorError::MissingLogEntry(match_index))?;

    let mut entries = Vec::new();
    let mut total_bytes = 0;
    for entry in txn.entries_from(match_index.plus(1)) {
        let entry = entry?;
        let proto = ProtoLogEntry {
            index: entry.index.as_u64(),
            term: entry.term.as_u64(),
            data: entry.data.to_vec(),
            flags: entry.flags,
        };
        let size = proto.encoded_len();
        if !entries.is_empty() && total_bytes + size > limits.max_bytes {
            break;
        }
        total_bytes += size;
        entries.push(proto);

        if started.elapsed() >= limits.time_box {
            break;
        }
    }

    Ok(ProtoAppendEntries {
        term: term.as_u64(),
        prev_log_index: match_index.as_u64(),
        prev_log_term: prev_log_term.as_u64(),
        leader_commit: txn.committed_index().as_u64(),
        truncate_log_before: hints.truncate_log_before.as_u64(),
        entries,
        force_elections: hints.force_elections,
        time_as_leader_ms: hints.time_as_leader.as_millis() as u64,
    })
}

/// Send one batch and wait for the follower to finish with it. Returns the follower's last log
/// index, which becomes the new match index.
pub(super) async fn replicate_round(
    session: &Session,
    connection: &mut dyn Connection,
    request: ProtoAppendEntries,
) -> Result<Index, AmbassadorError> {
    let prev_log_index = request.prev_log_index;
    let sent = request.entries.len() as u64;
    session.send(connection, request).await?;

    loop {
        let response = session.read::<ProtoAppendEntriesResponse>(connection).await?;
        session.check_term(response.current_term)?;

        if response.pending {
            slog::debug!(session.logger, "Follower is still applying entries: {}", response.message);
            continue;
        }
        if !response.success {
            return Err(AmbassadorError::ProtocolViolation(format!(
                "Follower rejected entries after {}: {}",
                prev_log_index, response.message
            )));
        }
        if response.last_log_index > prev_log_index + sent {
            return Err(AmbassadorError::ProtocolViolation(format!(
                "Follower claims last index {} but only {} entries were sent after {}",
                response.last_log_index, sent, prev_log_index
            )));
        }

        return Ok(Index::new(response.last_log_index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambassador::session::test_session;
    use crate::commitlog::{InMemoryLogStore, LogStore};
    use crate::connection::{ConnectionExt, Connector, Listener, MemoryNetwork};
    use crate::test_utils::store_with_terms;
    use bytes::Bytes;

    const MIB: usize = 1024 * 1024;

    fn limits() -> BatchLimits {
        BatchLimits {
            max_bytes: MIB,
            time_box: Duration::from_secs(60),
        }
    }

    #[test]
    fn batch_is_capped_by_encoded_size() {
        // -- setup --
        let store = InMemoryLogStore::new();
        for _ in 0..200 {
            store.append(Term::new(2), Bytes::from(vec![7u8; 10_000]));
        }
        let txn = store.read_transaction().unwrap();

        // -- execute --
        let batch = build_batch(&*txn, Index::zero(), Term::new(2), limits(), RoundHints::default()).unwrap();

        // -- verify --
        assert_eq!(104, batch.entries.len());
        assert_eq!(1, batch.entries[0].index);
        assert_eq!(104, batch.entries[103].index);
        let total: usize = batch.entries.iter().map(|e| e.encoded_len()).sum();
        assert!(total <= MIB);
    }

    #[test]
    fn oversized_first_entry_is_sent_alone() {
        let store = InMemoryLogStore::new();
        store.append(Term::new(1), Bytes::from(vec![0u8; 2 * MIB]));
        store.append(Term::new(1), Bytes::from("small"));
        let txn = store.read_transaction().unwrap();

        let batch = build_batch(&*txn, Index::zero(), Term::new(1), limits(), RoundHints::default()).unwrap();

        assert_eq!(1, batch.entries.len());
    }

    #[test]
    fn expired_time_box_still_ships_one_entry() {
        let store = store_with_terms(&[1, 1, 1, 1]);
        let txn = store.read_transaction().unwrap();
        let limits = BatchLimits {
            max_bytes: MIB,
            time_box: Duration::from_millis(0),
        };

        let batch = build_batch(&*txn, Index::new(1), Term::new(1), limits, RoundHints::default()).unwrap();

        assert_eq!(1, batch.entries.len());
        assert_eq!(2, batch.entries[0].index);
    }

    #[test]
    fn batch_carries_previous_entry_and_leader_state() {
        // -- setup --
        let store = store_with_terms(&[1, 1, 2, 3, 3]);
        store.set_committed_index(Index::new(4)).unwrap();
        let txn = store.read_transaction().unwrap();
        let hints = RoundHints {
            truncate_log_before: Index::new(2),
            force_elections: true,
            time_as_leader: Duration::from_millis(1500),
        };

        // -- execute --
        let batch = build_batch(&*txn, Index::new(3), Term::new(3), limits(), hints).unwrap();

        // -- verify --
        assert_eq!((3, 2), (batch.prev_log_index, batch.prev_log_term));
        assert_eq!(vec![4, 5], batch.entries.iter().map(|e| e.index).collect::<Vec<_>>());
        assert_eq!(4, batch.leader_commit);
        assert_eq!(2, batch.truncate_log_before);
        assert!(batch.force_elections);
        assert_eq!(1500, batch.time_as_leader_ms);
    }

    #[test]
    fn caught_up_follower_gets_heartbeat() {
        let store = store_with_terms(&[1, 1]);
        let txn = store.read_transaction().unwrap();

        let batch = build_batch(&*txn, Index::new(2), Term::new(1), limits(), RoundHints::default()).unwrap();

        assert!(batch.entries.is_empty());
        assert_eq!(2, batch.prev_log_index);
    }

    #[test]
    fn unknown_previous_term_is_an_error() {
        let store = store_with_terms(&[1, 1, 1, 1]);
        store.set_committed_index(Index::new(3)).unwrap();
        store.compact_before(Index::new(4)).unwrap();
        let txn = store.read_transaction().unwrap();

        let error = build_batch(&*txn, Index::new(1), Term::new(1), limits(), RoundHints::default()).unwrap_err();

        assert!(matches!(error, AmbassadorError::MissingLogEntry(i) if i == Index::new(1)));
    }

    async fn scripted_round(
        term: u64,
        request: ProtoAppendEntries,
        responses: Vec<ProtoAppendEntriesResponse>,
    ) -> Result<Index, AmbassadorError> {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("mem://b").unwrap();
        let mut client = network.connect("mem://b", None).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let _ = server.read::<ProtoAppendEntries>().await;
            for response in responses {
                let _ = server.send(response.into()).await;
            }
            // Hold the connection open until the leader is done with it.
            let _ = server.read_message().await;
        });

        replicate_round(&test_session(term), client.as_mut(), request).await
    }

    fn request(prev: u64, entries: u64) -> ProtoAppendEntries {
        ProtoAppendEntries {
            term: 4,
            prev_log_index: prev,
            entries: (prev + 1..=prev + entries)
                .map(|index| ProtoLogEntry {
                    index,
                    term: 4,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn response(term: u64, last: u64, success: bool, pending: bool) -> ProtoAppendEntriesResponse {
        ProtoAppendEntriesResponse {
            current_term: term,
            last_log_index: last,
            success,
            pending,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn pending_responses_are_read_through() {
        let result = scripted_round(
            4,
            request(10, 3),
            vec![
                response(4, 0, false, true),
                response(4, 0, false, true),
                response(4, 13, true, false),
            ],
        )
        .await;

        assert_eq!(Index::new(13), result.unwrap());
    }

    #[tokio::test]
    async fn failed_append_is_a_protocol_violation() {
        let result = scripted_round(4, request(10, 3), vec![response(4, 10, false, false)]).await;

        assert!(result.unwrap_err().is_protocol_violation());
    }

    #[tokio::test]
    async fn follower_cannot_claim_more_than_was_sent() {
        let result = scripted_round(4, request(10, 3), vec![response(4, 14, true, false)]).await;

        assert!(result.unwrap_err().is_protocol_violation());
    }

    #[tokio::test]
    async fn newer_term_while_pending_is_fatal() {
        let result = scripted_round(
            4,
            request(10, 0),
            vec![response(4, 0, false, true), response(5, 10, true, false)],
        )
        .await;

        assert!(result.unwrap_err().is_term_superseded());
    }
}
