use crate::ambassador::error::AmbassadorError;
use crate::ambassador::progress::AmbassadorProgress;
use crate::ambassador::stop_signal::StopCheck;
use crate::commitlog::Term;
use crate::connection::{Connection, ConnectionExt};
use crate::wire::{ExpectMessage, RaftMessage};
use std::future::Future;
use std::sync::Arc;

/// Everything one replication attempt needs to talk to its follower: who we are, the term we are
/// pinned to, where progress is published, and when to give up.
pub(super) struct Session {
    pub(super) logger: slog::Logger,
    pub(super) term: Term,
    pub(super) progress: Arc<AmbassadorProgress>,
    pub(super) stop_check: StopCheck,
}

impl Session {
    pub(super) async fn guarded<T, F>(&self, operation: F) -> Result<T, AmbassadorError>
    where
        F: Future<Output = Result<T, AmbassadorError>>,
    {
        tokio::select! {
            biased;
            _ = self.stop_check.stopped() => Err(AmbassadorError::Cancelled),
            result = operation => result,
        }
    }

    pub(super) async fn send(
        &self,
        connection: &mut dyn Connection,
        message: impl Into<RaftMessage>,
    ) -> Result<(), AmbassadorError> {
        let message = message.into();
        self.guarded(async { Ok(connection.send(message).await?) }).await?;
        self.progress.touch_send();
        Ok(())
    }

    pub(super) async fn read<T: ExpectMessage + 'static>(
        &self,
        connection: &mut dyn Connection,
    ) -> Result<T, AmbassadorError> {
        let message = self.guarded(async { Ok(connection.read::<T>().await?) }).await?;
        self.progress.touch_contact();
        Ok(message)
    }

    /// Must run before any other field of a response is looked at.
    pub(super) fn check_term(&self, reported: u64) -> Result<(), AmbassadorError> {
        let theirs = Term::new(reported);
        if theirs != self.term {
            return Err(AmbassadorError::TermChanged { ours: self.term, theirs });
        }
        Ok(())
    }

    pub(super) fn should_stop(&self) -> bool {
        self.stop_check.should_stop()
    }
}

#[cfg(test)]
pub(super) fn test_session(term: u64) -> Session {
    Session {
        logger: crate::test_utils::test_logger(),
        term: Term::new(term),
        progress: Arc::new(AmbassadorProgress::default()),
        stop_check: crate::ambassador::stop_signal::never_stopping(),
    }
}
