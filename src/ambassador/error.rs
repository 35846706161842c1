use crate::commitlog::{Index, Term};
use crate::connection::ConnectionError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum AmbassadorError {
    #[error("Connection failure: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Term superseded: replicating on term {ours:?} but follower reported term {theirs:?}")]
    TermChanged { ours: Term, theirs: Term },
    #[error("Follower rejected log negotiation: {0}")]
    NegotiationRejected(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Log store failure: {0}")]
    Storage(#[from] io::Error),
    #[error("Log entry {0:?} is no longer retained")]
    MissingLogEntry(Index),
    #[error("Ambassador is shutting down")]
    Cancelled,
    #[error("Ambassador was already started")]
    AlreadyStarted,
}

impl AmbassadorError {
    /// Cancellation is how the run loop learns it should exit. It is never retried or reported.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            AmbassadorError::Cancelled | AmbassadorError::Connection(ConnectionError::Closed)
        )
    }

    pub fn is_term_superseded(&self) -> bool {
        matches!(self, AmbassadorError::TermChanged { .. })
    }

    pub fn is_protocol_violation(&self) -> bool {
        match self {
            AmbassadorError::ProtocolViolation(_) | AmbassadorError::NegotiationRejected(_) => true,
            AmbassadorError::Connection(e) => e.is_protocol_violation(),
            _ => false,
        }
    }
}
