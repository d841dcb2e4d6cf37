//! # Provider Configuration
//!
//! Everything a session needs to open and drive one provider's transport.
//! The struct is deserialized from the camelCase JSON that collaborators send
//! in `subscribe`/`configure` requests or that the server loads from its
//! providers file.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

const DEFAULT_SNAPSHOT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HEARTBEAT_MS: u64 = 10_000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

fn default_snapshot_timeout_ms() -> u64 {
    DEFAULT_SNAPSHOT_TIMEOUT_MS
}
fn default_heartbeat_ms() -> u64 {
    DEFAULT_HEARTBEAT_MS
}
fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}
fn default_reconnect_max_delay_ms() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}
fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider id. Sessions are keyed by it.
    #[serde(default)]
    pub id: String,
    /// Human readable name, only used in logs.
    #[serde(default)]
    pub name: String,
    /// Transport URL (e.g. `wss://broker.example.com/stomp`).
    #[serde(default)]
    pub url: String,
    /// Topic the session listens on. May contain `{sessionId}`/`{providerId}`.
    #[serde(default)]
    pub listener_topic: String,
    /// Topic the snapshot trigger is published to.
    #[serde(default)]
    pub request_message: Option<String>,
    /// Body of the snapshot trigger.
    #[serde(default)]
    pub request_body: Option<String>,
    /// Plain-text sentinel marking the end of the snapshot phase.
    #[serde(default)]
    pub snapshot_end_token: Option<String>,
    /// Field whose value identifies a row.
    #[serde(default)]
    pub key_column: String,
    /// Realtime conflation window in milliseconds.
    #[serde(default)]
    pub message_rate: Option<u64>,
    /// Snapshot rows per emitted batch.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
    /// Completes the snapshot early once this many rows arrived.
    #[serde(default)]
    pub max_rows: Option<usize>,
    /// Request a snapshot on the first successful connect.
    #[serde(default = "default_true")]
    pub auto_snapshot: bool,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Extra headers sent with the transport handshake.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            url: String::new(),
            listener_topic: String::new(),
            request_message: None,
            request_body: None,
            snapshot_end_token: None,
            key_column: String::new(),
            message_rate: None,
            batch_size: None,
            snapshot_timeout_ms: DEFAULT_SNAPSHOT_TIMEOUT_MS,
            max_rows: None,
            auto_snapshot: true,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            headers: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Rejects a config that lacks a field the session cannot run without.
    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("id", self.id.trim().is_empty()),
            ("url", self.url.trim().is_empty()),
            ("listenerTopic", self.listener_topic.trim().is_empty()),
            ("keyColumn", self.key_column.trim().is_empty()),
        ];
        if let Some((field, _)) = missing.iter().find(|(_, empty)| *empty) {
            return Err(FeedError::Configuration(format!(
                "provider config is missing required field '{}'",
                field
            )));
        }
        if self.max_rows == Some(0) {
            return Err(FeedError::Configuration(
                "maxRows must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// A session requests a snapshot only if something can delimit it.
    pub fn wants_snapshot(&self) -> bool {
        self.auto_snapshot && (self.request_message.is_some() || self.snapshot_end_token.is_some())
    }

    /// Whether a manual refresh has anything that can end the snapshot it
    /// starts: a trigger, an end-token or a row cap.
    pub fn can_end_snapshot(&self) -> bool {
        self.request_message.is_some() || self.snapshot_end_token.is_some() || self.max_rows.is_some()
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Display label for logs.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Returns a copy with every topic template resolved for one session.
    pub fn resolve_for_session(&self, session_id: &str) -> ResolvedTopics {
        let resolve = |template: &str| {
            template
                .replace("{sessionId}", session_id)
                .replace("{providerId}", &self.id)
        };
        ResolvedTopics {
            listener_topic: resolve(&self.listener_topic),
            trigger_topic: self.request_message.as_deref().map(resolve),
            trigger_body: resolve(self.request_body.as_deref().unwrap_or_default()),
        }
    }
}

/// Topics after per-session template resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTopics {
    pub listener_topic: String,
    pub trigger_topic: Option<String>,
    pub trigger_body: String,
}
