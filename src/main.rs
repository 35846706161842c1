use bytes::Bytes;
use raft_ambassador::{
    try_start_leader, ClusterTopology, FollowerInfo, FollowerNode, InMemoryLogStore, InMemoryTopologyStore,
    LeaderConfig, Listener, ReplicationOptions, SnapshotInclusion, TcpConnectionListener, TcpConnector, Term,
};
use slog::Drain;
use std::error::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;

/// Local three node demo over TCP: one leader replicating to two followers.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let logger = create_root_logger_for_stdout();
    let term = Term::new(1);

    let mut followers = Vec::new();
    let mut members = vec![("A".to_string(), "tcp://leader".to_string())];
    for tag in &["B", "C"] {
        let listener = TcpConnectionListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let node = FollowerNode::new(*tag, logger.new(slog::o!("Follower" => *tag)));
        node.set_term(term);
        members.push((tag.to_string(), listener.url()));
        followers.push(FollowerInfo::new(*tag, listener.url()));
        node.serve(listener);
    }

    let log_store = Arc::new(InMemoryLogStore::new());
    log_store.put_map_entry(Bytes::from("users"), Bytes::from("ada"), Bytes::from("admin"));
    for i in 0..10 {
        log_store.append(term, Bytes::from(format!("command-{}", i)));
    }
    let topology_store = Arc::new(InMemoryTopologyStore::new(ClusterTopology {
        topology_id: "demo".into(),
        leader_tag: "A".into(),
        members,
    }));

    let leader = try_start_leader(LeaderConfig {
        logger: logger.clone(),
        term,
        leader_tag: "A".into(),
        leader_url: "tcp://leader".into(),
        followers,
        options: ReplicationOptions::default(),
        snapshot_inclusion: SnapshotInclusion::all(),
        log_store: log_store.clone(),
        topology_store,
        connector: Arc::new(TcpConnector),
    })?;

    for round in 0..5 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let index = log_store.append(term, Bytes::from(format!("late-command-{}", round)));
        leader.notify_new_entries(index);

        for health in leader.cluster_health() {
            slog::info!(
                logger,
                "{} at {:?}: {:?} ({})",
                health.tag,
                health.match_index,
                health.status,
                health.status_message
            );
        }
        slog::info!(logger, "Commit index {:?}", leader.commit_index());
    }

    leader.dispose().await;
    Ok(())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("Node" => "A"))
}
