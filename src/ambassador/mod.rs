mod ambassador;
mod append_entries;
mod error;
mod negotiation;
mod progress;
mod session;
mod shared_option;
mod snapshot;
mod stop_signal;

pub use ambassador::AmbassadorConfig;
pub use ambassador::FollowerAmbassador;
pub use error::AmbassadorError;
pub use progress::AmbassadorProgress;
pub use progress::AmbassadorStatus;
pub use snapshot::SnapshotInclusion;
