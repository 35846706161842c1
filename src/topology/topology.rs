use crate::wire::{ProtoTopology, ProtoTopologyMember};
use bytes::Bytes;
use prost::Message;
use std::sync::RwLock;

/// How to reach one member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowerInfo {
    pub tag: String,
    pub url: String,
    /// Client certificate presented when connecting, if the transport is authenticated.
    pub certificate: Option<Bytes>,
}

impl FollowerInfo {
    pub fn new(tag: impl Into<String>, url: impl Into<String>) -> Self {
        FollowerInfo {
            tag: tag.into(),
            url: url.into(),
            certificate: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    pub topology_id: String,
    pub leader_tag: String,
    /// (tag, url) for every voting member, the leader included.
    pub members: Vec<(String, String)>,
}

impl ClusterTopology {
    pub fn to_bytes(&self) -> Bytes {
        let proto = ProtoTopology {
            topology_id: self.topology_id.clone(),
            leader_tag: self.leader_tag.clone(),
            members: self
                .members
                .iter()
                .map(|(tag, url)| ProtoTopologyMember {
                    tag: tag.clone(),
                    url: url.clone(),
                })
                .collect(),
        };
        Bytes::from(proto.encode_to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        let proto = ProtoTopology::decode(bytes)?;
        Ok(ClusterTopology {
            topology_id: proto.topology_id,
            leader_tag: proto.leader_tag,
            members: proto.members.into_iter().map(|m| (m.tag, m.url)).collect(),
        })
    }
}

/// Where the current cluster membership is kept. Replication only reads it.
pub trait TopologyStore: Send + Sync + 'static {
    fn current_topology(&self) -> ClusterTopology;

    /// The topology in the encoding shipped to followers inside InstallSnapshot.
    fn raw_topology_bytes(&self) -> Bytes {
        self.current_topology().to_bytes()
    }
}

pub struct InMemoryTopologyStore {
    topology: RwLock<ClusterTopology>,
}

impl InMemoryTopologyStore {
    pub fn new(topology: ClusterTopology) -> Self {
        InMemoryTopologyStore {
            topology: RwLock::new(topology),
        }
    }

    pub fn replace(&self, topology: ClusterTopology) {
        *self.topology.write().expect("InMemoryTopologyStore lock poison") = topology;
    }
}

impl TopologyStore for InMemoryTopologyStore {
    fn current_topology(&self) -> ClusterTopology {
        self.topology.read().expect("InMemoryTopologyStore lock poison").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_decode_back_to_current_topology() {
        let store = InMemoryTopologyStore::new(ClusterTopology {
            topology_id: "topology-1".into(),
            leader_tag: "A".into(),
            members: vec![("A".into(), "mem://a".into()), ("B".into(), "mem://b".into())],
        });
        store.replace(ClusterTopology {
            topology_id: "topology-2".into(),
            ..store.current_topology()
        });

        let decoded = ClusterTopology::from_bytes(&store.raw_topology_bytes()).unwrap();

        assert_eq!(store.current_topology(), decoded);
        assert_eq!("topology-2", decoded.topology_id);
    }
}
