use crate::wire::messages::*;
use prost::Message;

/// Every frame on a replication connection is one envelope. The oneof field number is the
/// discriminant, and it is written ahead of the payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoEnvelope {
    #[prost(oneof = "RaftMessage", tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10")]
    pub message: Option<RaftMessage>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum RaftMessage {
    #[prost(message, tag = "1")]
    Hello(ProtoHello),
    #[prost(message, tag = "2")]
    LogLengthNegotiation(ProtoLogLengthNegotiation),
    #[prost(message, tag = "3")]
    LogLengthNegotiationResponse(ProtoLogLengthNegotiationResponse),
    #[prost(message, tag = "4")]
    AppendEntries(ProtoAppendEntries),
    #[prost(message, tag = "5")]
    AppendEntriesResponse(ProtoAppendEntriesResponse),
    #[prost(message, tag = "6")]
    InstallSnapshot(ProtoInstallSnapshot),
    #[prost(message, tag = "7")]
    InstallSnapshotResponse(ProtoInstallSnapshotResponse),
    #[prost(message, tag = "8")]
    SnapshotStructure(ProtoSnapshotStructure),
    #[prost(message, tag = "9")]
    SnapshotMapEntry(ProtoSnapshotMapEntry),
    #[prost(message, tag = "10")]
    SnapshotTableRow(ProtoSnapshotTableRow),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("Frame carries no message")]
    Empty,
}

impl RaftMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RaftMessage::Hello(_) => "Hello",
            RaftMessage::LogLengthNegotiation(_) => "LogLengthNegotiation",
            RaftMessage::LogLengthNegotiationResponse(_) => "LogLengthNegotiationResponse",
            RaftMessage::AppendEntries(_) => "AppendEntries",
            RaftMessage::AppendEntriesResponse(_) => "AppendEntriesResponse",
            RaftMessage::InstallSnapshot(_) => "InstallSnapshot",
            RaftMessage::InstallSnapshotResponse(_) => "InstallSnapshotResponse",
            RaftMessage::SnapshotStructure(_) => "SnapshotStructure",
            RaftMessage::SnapshotMapEntry(_) => "SnapshotMapEntry",
            RaftMessage::SnapshotTableRow(_) => "SnapshotTableRow",
        }
    }

    pub fn encode_frame(self) -> Vec<u8> {
        ProtoEnvelope { message: Some(self) }.encode_to_vec()
    }

    /// The single dispatch point for bytes coming off the wire.
    pub fn decode_frame(frame: &[u8]) -> Result<RaftMessage, DecodeError> {
        ProtoEnvelope::decode(frame)?.message.ok_or(DecodeError::Empty)
    }
}

/// A concrete message type that can be pulled out of a `RaftMessage`.
pub trait ExpectMessage: Sized + Send {
    const KIND: &'static str;

    /// Returns the original message back when it is of a different kind.
    fn from_message(message: RaftMessage) -> Result<Self, RaftMessage>;

    fn into_message(self) -> RaftMessage;
}

macro_rules! expect_message {
    ($variant:ident, $ty:ty) => {
        impl ExpectMessage for $ty {
            const KIND: &'static str = stringify!($variant);

            fn from_message(message: RaftMessage) -> Result<Self, RaftMessage> {
                match message {
                    RaftMessage::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }

            fn into_message(self) -> RaftMessage {
                RaftMessage::$variant(self)
            }
        }

        impl From<$ty> for RaftMessage {
            fn from(inner: $ty) -> Self {
                RaftMessage::$variant(inner)
            }
        }
    };
}

expect_message!(Hello, ProtoHello);
expect_message!(LogLengthNegotiation, ProtoLogLengthNegotiation);
expect_message!(LogLengthNegotiationResponse, ProtoLogLengthNegotiationResponse);
expect_message!(AppendEntries, ProtoAppendEntries);
expect_message!(AppendEntriesResponse, ProtoAppendEntriesResponse);
expect_message!(InstallSnapshot, ProtoInstallSnapshot);
expect_message!(InstallSnapshotResponse, ProtoInstallSnapshotResponse);
expect_message!(SnapshotStructure, ProtoSnapshotStructure);
expect_message!(SnapshotMapEntry, ProtoSnapshotMapEntry);
expect_message!(SnapshotTableRow, ProtoSnapshotTableRow);
