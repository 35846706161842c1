use crate::ambassador::AmbassadorError;
use crate::commitlog::{Index, Term};
use std::fmt;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepDownReason {
    /// A follower answered with a term other than the one we lead in.
    TermSuperseded {
        follower_tag: String,
        our_term: Term,
        their_term: Term,
    },
    /// Not enough of the cluster has heard from us within an election timeout.
    LostQuorum { contacted: usize, required: usize },
    Requested,
}

impl fmt::Display for StepDownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepDownReason::TermSuperseded {
                follower_tag,
                our_term,
                their_term,
            } => write!(
                f,
                "Follower {} reported term {:?} while we lead in term {:?}",
                follower_tag, their_term, our_term
            ),
            StepDownReason::LostQuorum { contacted, required } => write!(
                f,
                "Only {} of the required {} members were contacted within the election timeout",
                contacted, required
            ),
            StepDownReason::Requested => write!(f, "Step down requested"),
        }
    }
}

/// What an ambassador needs from the leader that owns it.
///
/// Implementations are shared by every ambassador of a leader, so all methods take `&self` and
/// must be cheap.
#[async_trait::async_trait]
pub trait LeaderContext: Send + Sync + 'static {
    /// The term this leadership was won in. Constant for the lifetime of the leader.
    fn term(&self) -> Term;

    fn leader_tag(&self) -> String;

    fn leader_url(&self) -> String;

    /// False once the leader stepped down or was disposed.
    fn is_running(&self) -> bool;

    /// Cancelled when the leader shuts down.
    fn shutdown_signal(&self) -> CancellationToken;

    fn time_as_leader(&self) -> Duration;

    /// Resolves when the log grows past `known_last_index`, or after `timeout`. Returns true if
    /// new entries are available.
    async fn wait_for_new_entries(&self, known_last_index: Index, timeout: Duration) -> bool;

    /// Followers may compact their logs below this index.
    fn lowest_index_required_cluster_wide(&self) -> Index;

    /// A follower's published match index may have changed.
    fn notify_progress(&self, follower_tag: &str);

    fn notify_exception(&self, follower_tag: &str, error: &AmbassadorError);

    /// Must take effect at most once, no matter how many callers ask.
    fn step_down(&self, reason: StepDownReason);
}
