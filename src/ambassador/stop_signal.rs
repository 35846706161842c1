use tokio_util::sync::CancellationToken;

/// Owned by the ambassador handle. Stopping, or dropping the handle, cancels every wait the
/// ambassador's task is blocked on.
pub(super) struct Stopper {
    stop_signal: CancellationToken,
}

#[derive(Clone)]
pub(super) struct StopCheck {
    stop_signal: CancellationToken,
}

impl Stopper {
    pub(super) fn stop(&self) {
        self.stop_signal.cancel();
    }
}

impl Drop for Stopper {
    fn drop(&mut self) {
        self.stop_signal.cancel();
    }
}

impl StopCheck {
    pub(super) fn should_stop(&self) -> bool {
        self.stop_signal.is_cancelled()
    }

    pub(super) async fn stopped(&self) {
        self.stop_signal.cancelled().await
    }
}

/// The returned pair also trips when `parent` is cancelled, so a leader-wide shutdown reaches
/// every ambassador.
pub(super) fn new(parent: &CancellationToken) -> (Stopper, StopCheck) {
    let stop_signal = parent.child_token();

    let stopper = Stopper {
        stop_signal: stop_signal.clone(),
    };
    let stop_check = StopCheck { stop_signal };

    (stopper, stop_check)
}

#[cfg(test)]
pub(super) fn never_stopping() -> StopCheck {
    StopCheck {
        stop_signal: CancellationToken::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_stops() {
        let parent = CancellationToken::new();
        let (stopper, stop_check) = new(&parent);
        assert!(!stop_check.should_stop());

        drop(stopper);

        assert!(stop_check.should_stop());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn parent_cancellation_stops() {
        let parent = CancellationToken::new();
        let (_stopper, stop_check) = new(&parent);

        parent.cancel();

        assert!(stop_check.should_stop());
    }
}
