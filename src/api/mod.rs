//! Entry points for embedding a leader: options and wiring.
mod options;
mod wiring;

pub use options::ReplicationOptions;
pub use options::ReplicationOptionsValidated;
pub use wiring::try_start_leader;
pub use wiring::LeaderConfig;
pub use wiring::LeaderCreationError;
