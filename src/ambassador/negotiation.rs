use crate::ambassador::error::AmbassadorError;
use crate::ambassador::session::Session;
use crate::commitlog::{Index, LogStore, ReadTransaction, Term};
use crate::connection::Connection;
use crate::wire::{ProtoLogLengthNegotiation, ProtoLogLengthNegotiationResponse, ProtoNegotiationStatus};

#[derive(Debug, PartialEq)]
pub(super) struct NegotiationOutcome {
    pub(super) match_index: Index,
    pub(super) round_trips: u32,
}

/// Find the highest index at which the leader's and the follower's logs agree.
///
/// The follower proposes a bracket and a midpoint from its own log; the leader narrows the bracket
/// by comparing the midpoint against its own log and probes the middle of what is left. Both sides
/// halve the search space every round trip.
pub(super) async fn negotiate(
    session: &Session,
    log_store: &dyn LogStore,
    connection: &mut dyn Connection,
) -> Result<NegotiationOutcome, AmbassadorError> {
    let txn = log_store.read_transaction()?;
    let last_index = txn.last_entry_index();
    let last_term = txn
        .term_at(last_index)?
        .ok_or(AmbassadorError::MissingLogEntry(last_index))?;

    let mut request = ProtoLogLengthNegotiation {
        term: session.term.as_u64(),
        prev_log_index: last_index.as_u64(),
        prev_log_term: last_term.as_u64(),
        truncated: false,
    };
    let mut previous_width = None;
    let mut round_trips = 0;

    loop {
        session.send(connection, request.clone()).await?;
        let response = session.read::<ProtoLogLengthNegotiationResponse>(connection).await?;
        round_trips += 1;
        session.check_term(response.current_term)?;

        match ProtoNegotiationStatus::from_i32(response.status) {
            Some(ProtoNegotiationStatus::Acceptable) => {
                let match_index = Index::new(response.last_log_index);
                if match_index > last_index {
                    return Err(AmbassadorError::ProtocolViolation(format!(
                        "Follower accepted index {:?} beyond our last index {:?}",
                        match_index, last_index
                    )));
                }
                slog::info!(
                    session.logger,
                    "Negotiated match index {:?} after {} round trips",
                    match_index,
                    round_trips
                );
                return Ok(NegotiationOutcome {
                    match_index,
                    round_trips,
                });
            }
            Some(ProtoNegotiationStatus::Rejected) => {
                return Err(AmbassadorError::NegotiationRejected(response.message));
            }
            Some(ProtoNegotiationStatus::Negotiate) => {
                validate_bracket(&response, last_index, previous_width)?;
                previous_width = Some(response.max_index - response.min_index);

                let agrees = txn.term_at(Index::new(response.midpoint_index))?
                    == Some(Term::new(response.midpoint_term));
                let (min_index, max_index) =
                    narrow(response.min_index, response.max_index, response.midpoint_index, agrees);
                request = probe(session.term, &*txn, min_index, max_index)?;

                slog::debug!(
                    session.logger,
                    "Negotiating: follower midpoint {} agrees={}, next probe {} (truncated={})",
                    response.midpoint_index,
                    agrees,
                    request.prev_log_index,
                    request.truncated
                );
            }
            _ => {
                return Err(AmbassadorError::ProtocolViolation(format!(
                    "Unknown negotiation status {}",
                    response.status
                )));
            }
        }
    }
}

fn validate_bracket(
    response: &ProtoLogLengthNegotiationResponse,
    last_index: Index,
    previous_width: Option<u64>,
) -> Result<(), AmbassadorError> {
    let well_formed = 1 <= response.min_index
        && response.min_index <= response.midpoint_index
        && response.midpoint_index <= response.max_index
        && response.max_index <= last_index.as_u64();
    if !well_formed {
        return Err(AmbassadorError::ProtocolViolation(format!(
            "Bad negotiation bracket [{}, {}] with midpoint {} against last index {:?}",
            response.min_index, response.max_index, response.midpoint_index, last_index
        )));
    }

    let width = response.max_index - response.min_index;
    if let Some(previous_width) = previous_width {
        if width >= previous_width {
            return Err(AmbassadorError::ProtocolViolation(format!(
                "Negotiation bracket did not narrow: width {} after {}",
                width, previous_width
            )));
        }
    }

    Ok(())
}

/// Agreement at the midpoint means everything up to it agrees as well.
fn narrow(min_index: u64, max_index: u64, midpoint_index: u64, agrees: bool) -> (u64, u64) {
    if agrees {
        (midpoint_index + 1, max_index)
    } else {
        (min_index, midpoint_index - 1)
    }
}

fn probe(
    term: Term,
    txn: &dyn ReadTransaction,
    min_index: u64,
    max_index: u64,
) -> Result<ProtoLogLengthNegotiation, AmbassadorError> {
    let prev_log_index = (min_index + max_index) / 2;
    let (prev_log_term, truncated) = match txn.term_at(Index::new(prev_log_index))? {
        Some(term) => (term.as_u64(), false),
        None => (0, Index::new(prev_log_index) < txn.first_entry_index()),
    };

    Ok(ProtoLogLengthNegotiation {
        term: term.as_u64(),
        prev_log_index,
        prev_log_term,
        truncated,
    })
}
