// Wire messages exchanged between a leader and a follower.
//
// These are plain prost messages, declared by hand instead of generated from a .proto file. The
// field tags are part of the wire format and must never be renumbered.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoHello {
    #[prost(string, tag = "1")]
    pub topology_id: String,
    #[prost(string, tag = "2")]
    pub leader_tag: String,
    #[prost(string, tag = "3")]
    pub follower_tag: String,
    #[prost(uint64, tag = "4")]
    pub election_timeout_ms: u64,
    #[prost(string, tag = "5")]
    pub leader_url: String,
    #[prost(string, tag = "6")]
    pub follower_url: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogLengthNegotiation {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "3")]
    pub prev_log_term: u64,
    /// Set when the leader no longer has the term at `prev_log_index`, because it was compacted.
    #[prost(bool, tag = "4")]
    pub truncated: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoNegotiationStatus {
    Unspecified = 0,
    Acceptable = 1,
    Rejected = 2,
    Negotiate = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogLengthNegotiationResponse {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
    #[prost(enumeration = "ProtoNegotiationStatus", tag = "2")]
    pub status: i32,
    #[prost(uint64, tag = "3")]
    pub min_index: u64,
    #[prost(uint64, tag = "4")]
    pub max_index: u64,
    #[prost(uint64, tag = "5")]
    pub midpoint_index: u64,
    #[prost(uint64, tag = "6")]
    pub midpoint_term: u64,
    #[prost(uint64, tag = "7")]
    pub last_log_index: u64,
    #[prost(string, tag = "8")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogEntry {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntries {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub prev_log_index: u64,
    #[prost(uint64, tag = "3")]
    pub prev_log_term: u64,
    #[prost(uint64, tag = "4")]
    pub leader_commit: u64,
    /// Lowest index any member of the cluster still needs. Followers may compact below it.
    #[prost(uint64, tag = "5")]
    pub truncate_log_before: u64,
    #[prost(message, repeated, tag = "6")]
    pub entries: Vec<ProtoLogEntry>,
    #[prost(bool, tag = "7")]
    pub force_elections: bool,
    #[prost(uint64, tag = "8")]
    pub time_as_leader_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesResponse {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
    #[prost(uint64, tag = "2")]
    pub last_log_index: u64,
    #[prost(bool, tag = "3")]
    pub success: bool,
    /// The follower is still applying; another response will follow.
    #[prost(bool, tag = "4")]
    pub pending: bool,
    #[prost(string, tag = "5")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshot {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// Zero when no state transfer follows and only the topology is being delivered.
    #[prost(uint64, tag = "2")]
    pub last_included_index: u64,
    #[prost(uint64, tag = "3")]
    pub last_included_term: u64,
    #[prost(bytes = "vec", tag = "4")]
    pub topology: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotResponse {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
    #[prost(bool, tag = "2")]
    pub done: bool,
    #[prost(uint64, tag = "3")]
    pub last_log_index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProtoStructureKind {
    /// Terminates the snapshot stream.
    None = 0,
    OrderedMap = 1,
    Table = 2,
}

/// Header of one structure in the snapshot stream; `count` items of the matching kind follow.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotStructure {
    #[prost(enumeration = "ProtoStructureKind", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotMapEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotTableRow {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTopologyMember {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(string, tag = "2")]
    pub url: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoTopology {
    #[prost(string, tag = "1")]
    pub topology_id: String,
    #[prost(string, tag = "2")]
    pub leader_tag: String,
    #[prost(message, repeated, tag = "3")]
    pub members: Vec<ProtoTopologyMember>,
}
