//! # Transport Module
//!
//! The leaf of the ingestion pipeline: one physical pub/sub connection per
//! provider session. The module is split in two layers:
//!
//! - **`Link`**: the raw pub/sub seam (handshake, topic subscribe, topic
//!   publish, heartbeats, inbound frames). A concrete STOMP-over-WebSocket
//!   link lives in `ws_link` behind the `ws` feature; tests plug in scripted
//!   links through the same trait.
//! - **`connection`**: `TransportConnection` drives a link through the
//!   "request snapshot, then stream" protocol. It owns end-token detection,
//!   frame decoding, the row cap, the snapshot timer, heartbeats and the
//!   inactivity watchdog, and reports everything as `TransportEvent`s.
//!   `ConnectionHandle` runs it on its own task with reconnect backoff.

#![forbid(unsafe_code)]

use async_trait::async_trait;

use crate::error::{FeedError, Result};
use crate::model::{ProviderConfig, Row};

/// The transport connection, its snapshot tracker and the reconnecting driver.
pub mod connection;
/// STOMP 1.2 frame codec used by the WebSocket link.
pub mod stomp;
/// STOMP-over-WebSocket link.
#[cfg(feature = "ws")]
pub mod ws_link;

pub use connection::{ConnectionHandle, ConnectionSettings, TransportConnection};
#[cfg(feature = "ws")]
pub use ws_link::{StompWsLink, StompWsLinkFactory};

/// One inbound unit read from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFrame {
    /// A message delivered on a subscribed topic.
    Message { topic: String, body: String },
    /// A heartbeat or other liveness signal without payload.
    Heartbeat,
    /// The link dropped. No further frames follow until the next `open`.
    Closed(String),
}

/// A raw publish/subscribe connection.
///
/// `recv` must be cancel safe: it is polled inside `tokio::select!` and a
/// frame must never be lost when another branch wins.
#[async_trait]
pub trait Link: Send {
    /// Performs the transport handshake.
    async fn open(&mut self) -> Result<()>;
    async fn subscribe(&mut self, topic: &str) -> Result<()>;
    async fn publish(&mut self, topic: &str, body: &str) -> Result<()>;
    /// Sends an outbound heartbeat.
    async fn heartbeat(&mut self) -> Result<()>;
    async fn recv(&mut self) -> LinkFrame;
    /// Closes the link. Calling it on a closed link is a no-op.
    async fn close(&mut self);
}

/// Builds one link per provider session.
pub trait LinkFactory: Send + Sync {
    fn create(&self, config: &ProviderConfig) -> Result<Box<dyn Link>>;
}

/// How a snapshot phase ended successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEnd {
    EndToken,
    MaxRows,
}

/// Lifecycle and data notifications from a transport connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Error { error: FeedError },
    /// Rows decoded from one frame. `snapshot` tells which phase they belong to.
    Data { rows: Vec<Row>, snapshot: bool, bytes: usize },
    /// The trigger was published and the snapshot timer started. `epoch` is
    /// the value passed to the request and tags every event of that run.
    SnapshotStarted { epoch: u64 },
    SnapshotComplete {
        epoch: u64,
        rows_received: usize,
        duration_ms: u64,
        end: SnapshotEnd,
    },
    /// The trigger could not be published, or the deadline passed without
    /// end-token or row cap.
    SnapshotFailed { epoch: u64, error: FeedError },
}
