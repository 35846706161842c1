use crate::wire::{DecodeError, ExpectMessage, RaftMessage};
use bytes::Bytes;
use std::io;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection was closed locally")]
    Closed,
    #[error("Peer disconnected")]
    PeerDisconnected,
    #[error("Connection refused: {0}")]
    Refused(String),
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Expected {expected} but received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },
    #[error("Frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),
}

impl ConnectionError {
    /// True when the connection failed because the peer sent something it should not have,
    /// rather than because the network failed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ConnectionError::Decode(_) | ConnectionError::UnexpectedMessage { .. } | ConnectionError::FrameTooLarge(..)
        )
    }
}

/// Closes a connection from any task, including while another task is blocked reading from it.
/// Once closed, every pending and future operation on the connection fails with
/// `ConnectionError::Closed`.
#[derive(Clone, Debug, Default)]
pub struct ConnectionCloser {
    token: CancellationToken,
}

impl ConnectionCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// An ordered, bidirectional stream of `RaftMessage`s with a single peer.
#[async_trait::async_trait]
pub trait Connection: Send {
    async fn send(&mut self, message: RaftMessage) -> Result<(), ConnectionError>;

    async fn read_message(&mut self) -> Result<RaftMessage, ConnectionError>;

    fn closer(&self) -> ConnectionCloser;
}

#[async_trait::async_trait]
pub trait ConnectionExt {
    /// Read the next message, failing if it is not a `T`.
    async fn read<T: ExpectMessage + 'static>(&mut self) -> Result<T, ConnectionError>;
}

#[async_trait::async_trait]
impl<C: Connection + ?Sized> ConnectionExt for C {
    async fn read<T: ExpectMessage + 'static>(&mut self) -> Result<T, ConnectionError> {
        let message = self.read_message().await?;
        T::from_message(message).map_err(|other| ConnectionError::UnexpectedMessage {
            expected: T::KIND,
            received: other.kind_name(),
        })
    }
}

/// Opens connections to followers.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str, certificate: Option<&Bytes>) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Accepts connections from leaders.
#[async_trait::async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Box<dyn Connection>, ConnectionError>;

    fn url(&self) -> String;
}
