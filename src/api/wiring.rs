use crate::ambassador::SnapshotInclusion;
use crate::api::options::{ReplicationOptions, ReplicationOptionsValidated};
use crate::commitlog::{LogStore, Term};
use crate::connection::Connector;
use crate::leader::{Leader, LeaderParts};
use crate::topology::{FollowerInfo, TopologyStore};
use std::collections::HashSet;
use std::convert::TryFrom;
use std::io;
use std::sync::Arc;

pub struct LeaderConfig {
    pub logger: slog::Logger,
    /// The term this node won its election in.
    pub term: Term,
    pub leader_tag: String,
    pub leader_url: String,
    /// Every other voting member. The leader itself must not be listed.
    pub followers: Vec<FollowerInfo>,
    pub options: ReplicationOptions,
    pub snapshot_inclusion: SnapshotInclusion,
    pub log_store: Arc<dyn LogStore>,
    pub topology_store: Arc<dyn TopologyStore>,
    pub connector: Arc<dyn Connector>,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaderCreationError {
    #[error("Illegal options for replication: {0}")]
    IllegalOptions(String),
    #[error("Follower {0} is listed more than once")]
    DuplicateFollower(String),
    #[error("Leader {0} is listed as its own follower")]
    LeaderIsFollower(String),
    #[error("Term 0 cannot have a leader")]
    InvalidTerm,
    #[error("Log initialization failure")]
    LogInitialization(#[from] io::Error),
}

/// Start replicating to every follower. Must be called from within a tokio runtime.
pub fn try_start_leader(config: LeaderConfig) -> Result<Leader, LeaderCreationError> {
    let options = ReplicationOptionsValidated::try_from(config.options)
        .map_err(|e| LeaderCreationError::IllegalOptions(e.to_string()))?;

    if config.term == Term::default() {
        return Err(LeaderCreationError::InvalidTerm);
    }
    let mut seen = HashSet::new();
    for follower in &config.followers {
        if follower.tag == config.leader_tag {
            return Err(LeaderCreationError::LeaderIsFollower(follower.tag.clone()));
        }
        if !seen.insert(follower.tag.as_str()) {
            return Err(LeaderCreationError::DuplicateFollower(follower.tag.clone()));
        }
    }

    let leader = Leader::start(LeaderParts {
        logger: config.logger,
        term: config.term,
        leader_tag: config.leader_tag,
        leader_url: config.leader_url,
        followers: config.followers,
        options,
        snapshot_inclusion: config.snapshot_inclusion,
        log_store: config.log_store,
        topology_store: config.topology_store,
        connector: config.connector,
    })?;

    Ok(leader)
}
