use crate::commitlog::Term;
use crate::leader::context::StepDownReason;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeadershipState {
    Leading { term: Term },
    SteppedDown { term: Term, reason: StepDownReason },
    Disposed { term: Term },
}

pub(super) fn new(initial_state: LeadershipState) -> (LeadershipNotifier, LeadershipListener) {
    let (snd, rcv) = watch::channel(initial_state);

    (LeadershipNotifier { snd }, LeadershipListener { rcv })
}

pub(super) struct LeadershipNotifier {
    snd: watch::Sender<LeadershipState>,
}

impl LeadershipNotifier {
    pub(super) fn notify_new_state(&self, new_state: LeadershipState) {
        let _ = self.snd.send(new_state);
    }
}

#[derive(Clone)]
pub struct LeadershipListener {
    rcv: watch::Receiver<LeadershipState>,
}

impl LeadershipListener {
    /// Waits for the next change. `None` once the leader is gone.
    pub async fn next(&mut self) -> Option<LeadershipState> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    pub fn current(&self) -> LeadershipState {
        self.rcv.borrow().clone()
    }
}
