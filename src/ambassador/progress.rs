use crate::commitlog::Index;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AmbassadorStatus {
    None = 0,
    Started = 1,
    Connected = 2,
    Disconnected = 3,
    FailedToConnect = 4,
    Closed = 5,
}

impl AmbassadorStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AmbassadorStatus::Started,
            2 => AmbassadorStatus::Connected,
            3 => AmbassadorStatus::Disconnected,
            4 => AmbassadorStatus::FailedToConnect,
            5 => AmbassadorStatus::Closed,
            _ => AmbassadorStatus::None,
        }
    }
}

/// Progress an ambassador publishes about its follower.
///
/// The ambassador's task is the only writer. The leader, health views and tests read it
/// concurrently, and never need a lock for anything but the status message.
#[derive(Debug)]
pub struct AmbassadorProgress {
    match_index: AtomicU64,
    // Unix millis, 0 when it never happened.
    last_send_ms: AtomicI64,
    last_contact_ms: AtomicI64,
    status: AtomicU8,
    status_message: Mutex<String>,
    force_elections: AtomicBool,
}

impl Default for AmbassadorProgress {
    fn default() -> Self {
        AmbassadorProgress {
            match_index: AtomicU64::new(0),
            last_send_ms: AtomicI64::new(0),
            last_contact_ms: AtomicI64::new(0),
            status: AtomicU8::new(AmbassadorStatus::None as u8),
            status_message: Mutex::new(String::new()),
            force_elections: AtomicBool::new(false),
        }
    }
}

impl AmbassadorProgress {
    pub fn match_index(&self) -> Index {
        Index::new(self.match_index.load(Ordering::Acquire))
    }

    pub fn status(&self) -> AmbassadorStatus {
        AmbassadorStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn status_message(&self) -> String {
        self.status_message
            .lock()
            .expect("AmbassadorProgress status message mutex guard poison")
            .clone()
    }

    pub fn last_send(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.last_send_ms.load(Ordering::Acquire))
    }

    pub fn last_contact(&self) -> Option<DateTime<Utc>> {
        millis_to_time(self.last_contact_ms.load(Ordering::Acquire))
    }

    pub(crate) fn last_contact_millis(&self) -> i64 {
        self.last_contact_ms.load(Ordering::Acquire)
    }

    /// Returns the value that is published after the update. The published match index never
    /// moves backwards.
    pub(crate) fn publish_match_index(&self, index: Index) -> Index {
        let previous = self.match_index.fetch_max(index.as_u64(), Ordering::AcqRel);
        Index::new(previous.max(index.as_u64()))
    }

    pub(crate) fn set_status(&self, status: AmbassadorStatus, message: impl Into<String>) {
        let mut guard = self
            .status_message
            .lock()
            .expect("AmbassadorProgress status message mutex guard poison");
        *guard = message.into();
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn set_status_message(&self, message: impl Into<String>) {
        *self
            .status_message
            .lock()
            .expect("AmbassadorProgress status message mutex guard poison") = message.into();
    }

    pub(crate) fn touch_send(&self) {
        self.last_send_ms.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub(crate) fn touch_contact(&self) {
        self.last_contact_ms.store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub(crate) fn request_force_elections(&self) {
        self.force_elections.store(true, Ordering::Release);
    }

    pub(crate) fn force_elections_requested(&self) -> bool {
        self.force_elections.load(Ordering::Acquire)
    }

    pub(crate) fn clear_force_elections(&self) {
        self.force_elections.store(false, Ordering::Release);
    }
}

fn millis_to_time(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        None
    } else {
        Utc.timestamp_millis_opt(millis).single()
    }
}
