mod envelope;
mod messages;

pub use envelope::DecodeError;
pub use envelope::ExpectMessage;
pub use envelope::RaftMessage;
pub use messages::*;
