//! Session mode and the statistics exposed through `getStatus`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle mode of a provider session.
///
/// Only these transitions happen: `Idle -> Connecting -> Snapshot -> Realtime`,
/// `Connecting -> Realtime` for stream-only providers, and
/// `Realtime -> Snapshot` on an explicit refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionMode {
    #[default]
    Idle,
    Connecting,
    Snapshot,
    Realtime,
}

impl SessionMode {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: SessionMode) -> bool {
        use SessionMode::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Snapshot)
                | (Connecting, Realtime)
                | (Snapshot, Realtime)
                | (Realtime, Snapshot)
                | (Snapshot, Snapshot)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BytesReceived {
    pub total: u64,
    pub snapshot: u64,
    pub update: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub snapshot_rows_received: u64,
    pub update_rows_received: u64,
    pub connection_count: u64,
    pub disconnection_count: u64,
    pub bytes_received: BytesReceived,
    pub mode: SessionMode,
    pub is_connected: bool,
    /// Whether the current snapshot phase finished (end-token or row cap).
    pub snapshot_complete: bool,
    /// Distinct keys currently cached.
    pub row_count: usize,
    pub subscriber_count: usize,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub snapshot_started_at: Option<DateTime<Utc>>,
    pub snapshot_ended_at: Option<DateTime<Utc>>,
}

impl Statistics {
    pub(crate) fn record_bytes(&mut self, bytes: usize, snapshot: bool) {
        let bytes = bytes as u64;
        self.bytes_received.total += bytes;
        if snapshot {
            self.bytes_received.snapshot += bytes;
        } else {
            self.bytes_received.update += bytes;
        }
    }

    /// Clears the per-snapshot counters ahead of a refresh.
    pub(crate) fn reset_snapshot(&mut self) {
        self.snapshot_rows_received = 0;
        self.bytes_received.snapshot = 0;
        self.snapshot_complete = false;
        self.snapshot_started_at = None;
        self.snapshot_ended_at = None;
    }

    /// Wall-clock duration of the last finished snapshot.
    pub fn snapshot_duration_ms(&self) -> Option<i64> {
        match (self.snapshot_started_at, self.snapshot_ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_law_rejects_skips_and_reversals() {
        use SessionMode::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Snapshot));
        assert!(Realtime.can_transition_to(Snapshot));
        assert!(!Idle.can_transition_to(Realtime));
        assert!(!Realtime.can_transition_to(Idle));
        assert!(!Snapshot.can_transition_to(Connecting));
    }

    #[test]
    fn statistics_serialize_camel_case() {
        let mut stats = Statistics::default();
        stats.record_bytes(10, true);
        stats.record_bytes(5, false);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["bytesReceived"]["total"], 15);
        assert_eq!(json["bytesReceived"]["snapshot"], 10);
        assert_eq!(json["mode"], "idle");
        assert_eq!(json["isConnected"], false);
    }
}
