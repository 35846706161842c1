mod follower;
mod session;

pub use follower::FollowerError;
pub use follower::FollowerEvent;
pub use follower::FollowerNode;
