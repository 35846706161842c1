mod commit;
mod context;
mod leader;
mod listener;

pub use context::LeaderContext;
pub use context::StepDownReason;
pub use leader::FollowerHealth;
pub use leader::Leader;
pub use listener::LeadershipListener;
pub use listener::LeadershipState;

pub(crate) use leader::LeaderParts;
