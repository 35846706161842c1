mod ambassador;
mod api;
mod commitlog;
mod connection;
mod follower;
mod leader;
mod topology;
mod wire;

#[cfg(test)]
mod test_utils;

pub use ambassador::AmbassadorConfig;
pub use ambassador::AmbassadorError;
pub use ambassador::AmbassadorProgress;
pub use ambassador::AmbassadorStatus;
pub use ambassador::FollowerAmbassador;
pub use ambassador::SnapshotInclusion;
pub use api::try_start_leader;
pub use api::LeaderConfig;
pub use api::LeaderCreationError;
pub use api::ReplicationOptions;
pub use api::ReplicationOptionsValidated;
pub use commitlog::InMemoryLogStore;
pub use commitlog::Index;
pub use commitlog::LogEntry;
pub use commitlog::LogStore;
pub use commitlog::PersistedStructure;
pub use commitlog::ReadTransaction;
pub use commitlog::StructureData;
pub use commitlog::StructureKind;
pub use commitlog::Term;
pub use connection::Connection;
pub use connection::ConnectionError;
pub use connection::Connector;
pub use connection::Listener;
pub use connection::MemoryListener;
pub use connection::MemoryNetwork;
pub use connection::TcpConnectionListener;
pub use connection::TcpConnector;
pub use follower::FollowerError;
pub use follower::FollowerEvent;
pub use follower::FollowerNode;
pub use leader::FollowerHealth;
pub use leader::Leader;
pub use leader::LeaderContext;
pub use leader::LeadershipListener;
pub use leader::LeadershipState;
pub use leader::StepDownReason;
pub use topology::ClusterTopology;
pub use topology::FollowerInfo;
pub use topology::InMemoryTopologyStore;
pub use topology::TopologyStore;

// The root module only declares modules and re-exports. Submodules stay private and each one
// chooses what it exposes through its own `pub use` list, so internals can move freely.
