use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs for replication. Every field is optional; `None` picks the default.
#[derive(Clone, Debug, Default)]
pub struct ReplicationOptions {
    /// Default 300ms. Drives reconnect backoff, heartbeat cadence and staleness detection.
    pub election_timeout: Option<Duration>,
    /// Default 1 MiB. A single entry larger than this is still sent, alone.
    pub max_append_entries_batch_bytes: Option<usize>,
    /// Default 1000ms.
    pub append_entries_round_time_box: Option<Duration>,
    /// Default 1024.
    pub snapshot_liveness_check_every_records: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ReplicationOptionsValidated {
    pub election_timeout: Duration,
    pub max_append_entries_batch_bytes: usize,
    pub append_entries_round_time_box: Duration,
    pub snapshot_liveness_check_every_records: u64,
}

impl ReplicationOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.election_timeout < Duration::from_millis(3) {
            return Err("Election timeout must be at least 3ms");
        }
        if self.max_append_entries_batch_bytes == 0 {
            return Err("AppendEntries batch size limit must be positive");
        }
        if self.append_entries_round_time_box == Duration::from_millis(0) {
            return Err("AppendEntries round time box must be positive");
        }
        if self.snapshot_liveness_check_every_records == 0 {
            return Err("Snapshot liveness check interval must be at least one record");
        }

        Ok(())
    }

    pub fn reconnect_backoff(&self) -> Duration {
        self.election_timeout / 2
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.election_timeout / 3
    }

    pub fn snapshot_liveness_interval(&self) -> Duration {
        self.election_timeout / 2
    }

    pub fn dispose_retry_interval(&self) -> Duration {
        self.election_timeout
    }
}

impl Default for ReplicationOptionsValidated {
    fn default() -> Self {
        ReplicationOptionsValidated {
            election_timeout: Duration::from_millis(300),
            max_append_entries_batch_bytes: 1024 * 1024,
            append_entries_round_time_box: Duration::from_millis(1000),
            snapshot_liveness_check_every_records: 1024,
        }
    }
}

impl TryFrom<ReplicationOptions> for ReplicationOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ReplicationOptions) -> Result<Self, Self::Error> {
        let defaults = ReplicationOptionsValidated::default();
        let values = ReplicationOptionsValidated {
            election_timeout: options.election_timeout.unwrap_or(defaults.election_timeout),
            max_append_entries_batch_bytes: options
                .max_append_entries_batch_bytes
                .unwrap_or(defaults.max_append_entries_batch_bytes),
            append_entries_round_time_box: options
                .append_entries_round_time_box
                .unwrap_or(defaults.append_entries_round_time_box),
            snapshot_liveness_check_every_records: options
                .snapshot_liveness_check_every_records
                .unwrap_or(defaults.snapshot_liveness_check_every_records),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ReplicationOptionsValidated::try_from(ReplicationOptions::default()).unwrap();

        assert_eq!(Duration::from_millis(300), options.election_timeout);
        assert_eq!(1024 * 1024, options.max_append_entries_batch_bytes);
        assert_eq!(Duration::from_millis(100), options.heartbeat_interval());
        assert_eq!(Duration::from_millis(150), options.reconnect_backoff());
        assert_eq!(Duration::from_millis(150), options.snapshot_liveness_interval());
    }

    #[test]
    fn rejects_degenerate_values() {
        let zero_batch = ReplicationOptions {
            max_append_entries_batch_bytes: Some(0),
            ..Default::default()
        };
        assert!(ReplicationOptionsValidated::try_from(zero_batch).is_err());

        let tiny_timeout = ReplicationOptions {
            election_timeout: Some(Duration::from_millis(1)),
            ..Default::default()
        };
        assert!(ReplicationOptionsValidated::try_from(tiny_timeout).is_err());
    }
}
