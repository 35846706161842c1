mod topology;

pub use topology::ClusterTopology;
pub use topology::FollowerInfo;
pub use topology::InMemoryTopologyStore;
pub use topology::TopologyStore;
