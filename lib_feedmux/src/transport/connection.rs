//! # Transport Connection
//!
//! Drives one `Link` through the provider protocol:
//!
//! 1. **Connect**: handshake under a timeout, then subscribe to the session's
//!    listener topic.
//! 2. **Snapshot**: optionally publish the trigger and start the snapshot
//!    timer. Every inbound body is first tested against the end-token (a
//!    case-insensitive substring match on the raw text, because the sentinel
//!    is usually not JSON). A match completes the snapshot but the listener
//!    subscription stays open. A configured row cap completes it early.
//! 3. **Realtime**: frames keep flowing on the same subscription and are
//!    reported as update rows.
//!
//! Malformed bodies are logged and dropped here; they never reach the session.
//!
//! `ConnectionHandle` owns the task that runs a connection. It reconnects
//! with exponential backoff after a drop and re-subscribes the listener, but
//! never re-triggers a snapshot on its own.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{FeedError, Result};
use crate::model::{parse_rows, ProviderConfig, ResolvedTopics};
use crate::transport::{Link, LinkFrame, SnapshotEnd, TransportEvent};

/// Missed heartbeat periods tolerated before the link is declared dead.
const WATCHDOG_MULTIPLIER: u32 = 3;

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}

/// Everything a connection needs, already resolved for one session.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub provider_id: String,
    pub topics: ResolvedTopics,
    pub end_token: Option<String>,
    pub max_rows: Option<usize>,
    pub snapshot_timeout: Duration,
    pub connect_timeout: Duration,
    /// Zero disables both outbound heartbeats and the inactivity watchdog.
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ProviderConfig, session_id: &str) -> Self {
        Self {
            provider_id: config.id.clone(),
            topics: config.resolve_for_session(session_id),
            end_token: config
                .snapshot_end_token
                .as_ref()
                .filter(|token| !token.is_empty())
                .cloned(),
            max_rows: config.max_rows,
            snapshot_timeout: config.snapshot_timeout(),
            connect_timeout: config.connect_timeout(),
            heartbeat: config.heartbeat(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms.max(1)),
            reconnect_max_delay: Duration::from_millis(
                config.reconnect_max_delay_ms.max(config.reconnect_delay_ms),
            ),
        }
    }
}

struct SnapshotTracker {
    epoch: u64,
    started: Instant,
    deadline: Instant,
    rows: usize,
    /// The deadline passed. Rows keep counting and a late end-token still
    /// completes the phase, but the timer is not re-armed.
    timed_out: bool,
}

pub struct TransportConnection {
    link: Box<dyn Link>,
    settings: ConnectionSettings,
    end_token_lower: Option<String>,
    connected: bool,
    /// Present exactly while the connection is in snapshot mode.
    tracker: Option<SnapshotTracker>,
    last_inbound: Instant,
    next_heartbeat: Instant,
}

impl TransportConnection {
    pub fn new(link: Box<dyn Link>, settings: ConnectionSettings) -> Self {
        let end_token_lower = settings.end_token.as_ref().map(|t| t.to_lowercase());
        let now = Instant::now();
        Self {
            link,
            settings,
            end_token_lower,
            connected: false,
            tracker: None,
            last_inbound: now,
            next_heartbeat: now,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_snapshot_mode(&self) -> bool {
        self.tracker.is_some()
    }

    /// Handshakes and subscribes to the listener topic.
    pub async fn connect(&mut self) -> Result<()> {
        match timeout(self.settings.connect_timeout, self.link.open()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.link.close().await;
                return Err(as_connection_error(e));
            }
            Err(_) => {
                self.link.close().await;
                return Err(FeedError::Connection(format!(
                    "handshake with provider '{}' timed out after {}ms",
                    self.settings.provider_id,
                    self.settings.connect_timeout.as_millis()
                )));
            }
        }

        if let Err(e) = self.link.subscribe(&self.settings.topics.listener_topic).await {
            self.link.close().await;
            return Err(as_connection_error(e));
        }

        let now = Instant::now();
        self.connected = true;
        self.last_inbound = now;
        self.next_heartbeat = now + self.settings.heartbeat;
        log::info!(
            "[{}] Connected, listening on '{}'",
            self.settings.provider_id,
            self.settings.topics.listener_topic
        );
        Ok(())
    }

    /// Publishes the trigger (if any) and enters snapshot mode. Completion
    /// and timeout events of this run carry `epoch`.
    ///
    /// Calling it again while a snapshot is running restarts the phase.
    pub async fn request_snapshot(&mut self, epoch: u64) -> Result<()> {
        if !self.connected {
            return Err(FeedError::Connection(format!(
                "provider '{}' is not connected",
                self.settings.provider_id
            )));
        }
        if let Some(topic) = self.settings.topics.trigger_topic.as_deref() {
            self.link
                .publish(topic, &self.settings.topics.trigger_body)
                .await
                .map_err(as_connection_error)?;
            log::debug!("[{}] Published snapshot trigger to '{}'", self.settings.provider_id, topic);
        }
        let now = Instant::now();
        self.tracker = Some(SnapshotTracker {
            epoch,
            started: now,
            deadline: now + self.settings.snapshot_timeout,
            rows: 0,
            timed_out: false,
        });
        Ok(())
    }

    fn matches_end_token(&self, body: &str) -> bool {
        match &self.end_token_lower {
            Some(token) => body.to_lowercase().contains(token.as_str()),
            None => false,
        }
    }

    /// Turns one inbound body into events.
    pub fn handle_frame(&mut self, body: &str) -> Vec<TransportEvent> {
        let bytes = body.len();

        // The sentinel is usually plain text, so it must be checked before parsing.
        if self.tracker.is_some() && self.matches_end_token(body) {
            return vec![self.finish_snapshot(SnapshotEnd::EndToken)];
        }

        let mut rows = match parse_rows(body) {
            Ok(rows) => rows,
            Err(e) => {
                if self.matches_end_token(body) {
                    log::debug!("[{}] Ignoring end-token outside snapshot mode", self.settings.provider_id);
                } else {
                    log::warn!("[{}] Dropping malformed frame ({} bytes): {}", self.settings.provider_id, bytes, e);
                }
                return Vec::new();
            }
        };
        if rows.is_empty() {
            return Vec::new();
        }

        let received = match self.tracker.as_ref() {
            Some(tracker) => tracker.rows,
            None => return vec![TransportEvent::Data { rows, snapshot: false, bytes }],
        };

        let cap_reached = self
            .settings
            .max_rows
            .filter(|max| received + rows.len() >= *max);

        let mut events = Vec::with_capacity(3);
        match cap_reached {
            Some(max) => {
                let overflow = rows.split_off(max.saturating_sub(received));
                let taken = rows.len();
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.rows += taken;
                }
                if taken > 0 {
                    events.push(TransportEvent::Data { rows, snapshot: true, bytes });
                }
                events.push(self.finish_snapshot(SnapshotEnd::MaxRows));
                if !overflow.is_empty() {
                    events.push(TransportEvent::Data { rows: overflow, snapshot: false, bytes: 0 });
                }
            }
            None => {
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.rows += rows.len();
                }
                events.push(TransportEvent::Data { rows, snapshot: true, bytes });
            }
        }
        events
    }

    fn finish_snapshot(&mut self, end: SnapshotEnd) -> TransportEvent {
        let (epoch, rows_received, duration_ms, late) = match self.tracker.take() {
            Some(t) => (t.epoch, t.rows, t.started.elapsed().as_millis() as u64, t.timed_out),
            None => (0, 0, 0, false),
        };
        if late {
            log::warn!("[{}] Snapshot completed after its deadline ({:?})", self.settings.provider_id, end);
        }
        log::info!(
            "[{}] Snapshot complete via {:?}: {} rows in {}ms",
            self.settings.provider_id,
            end,
            rows_received,
            duration_ms
        );
        TransportEvent::SnapshotComplete { epoch, rows_received, duration_ms, end }
    }

    fn expire_snapshot(&mut self) -> TransportEvent {
        let mut epoch = 0;
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.timed_out = true;
            epoch = tracker.epoch;
        }
        let timeout_ms = self.settings.snapshot_timeout.as_millis() as u64;
        log::warn!("[{}] Snapshot timed out after {}ms", self.settings.provider_id, timeout_ms);
        TransportEvent::SnapshotFailed {
            epoch,
            error: FeedError::SnapshotTimeout {
                provider_id: self.settings.provider_id.clone(),
                timeout_ms,
            },
        }
    }

    async fn drop_link(&mut self, reason: String) -> Vec<TransportEvent> {
        self.link.close().await;
        self.connected = false;
        vec![TransportEvent::Disconnected { reason }]
    }

    /// Waits for the next batch of events.
    ///
    /// Heartbeats, the watchdog and the snapshot deadline are serviced while
    /// waiting. Never resolves while disconnected.
    pub async fn next_events(&mut self) -> Vec<TransportEvent> {
        loop {
            if !self.connected {
                return std::future::pending().await;
            }

            let snapshot_deadline = self
                .tracker
                .as_ref()
                .filter(|t| !t.timed_out)
                .map(|t| t.deadline);
            let heartbeat_on = !self.settings.heartbeat.is_zero();
            let watchdog_at = self.last_inbound + self.settings.heartbeat * WATCHDOG_MULTIPLIER;

            tokio::select! {
                frame = self.link.recv() => match frame {
                    LinkFrame::Message { body, .. } => {
                        self.last_inbound = Instant::now();
                        let events = self.handle_frame(&body);
                        if !events.is_empty() {
                            return events;
                        }
                    }
                    LinkFrame::Heartbeat => {
                        self.last_inbound = Instant::now();
                    }
                    LinkFrame::Closed(reason) => {
                        self.connected = false;
                        log::warn!("[{}] Link closed: {}", self.settings.provider_id, reason);
                        return vec![TransportEvent::Disconnected { reason }];
                    }
                },
                _ = sleep_until(snapshot_deadline.unwrap_or_else(far_future)), if snapshot_deadline.is_some() => {
                    return vec![self.expire_snapshot()];
                }
                _ = sleep_until(self.next_heartbeat), if heartbeat_on => {
                    self.next_heartbeat = Instant::now() + self.settings.heartbeat;
                    if let Err(e) = self.link.heartbeat().await {
                        return self.drop_link(format!("heartbeat failed: {}", e)).await;
                    }
                }
                _ = sleep_until(watchdog_at), if heartbeat_on => {
                    log::warn!(
                        "[{}] No inbound traffic for {}ms, dropping link",
                        self.settings.provider_id,
                        (self.settings.heartbeat * WATCHDOG_MULTIPLIER).as_millis()
                    );
                    return self.drop_link("inactivity timeout".to_string()).await;
                }
            }
        }
    }

    /// Closes the link. Safe to call any number of times.
    pub async fn disconnect(&mut self) {
        if self.connected {
            log::info!("[{}] Disconnecting", self.settings.provider_id);
        }
        self.link.close().await;
        self.connected = false;
        self.tracker = None;
    }
}

fn as_connection_error(error: FeedError) -> FeedError {
    match error {
        FeedError::Connection(_) => error,
        other => FeedError::Connection(other.to_string()),
    }
}

// ── Driver task ─────────────────────────────────────────────────────────────

/// Receives every event of a running connection. Returning `false` stops the
/// connection (the consumer is gone).
pub type EventSink = Box<dyn FnMut(TransportEvent) -> bool + Send>;

enum Command {
    RequestSnapshot { epoch: u64 },
}

/// Owner of a running connection task.
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Starts `connection` on its own task. With `snapshot_on_connect` the
    /// snapshot is requested right after the first successful handshake,
    /// under epoch 0.
    pub fn spawn(connection: TransportConnection, snapshot_on_connect: bool, sink: EventSink) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(connection, command_rx, cancel.clone(), snapshot_on_connect, sink));
        Self { commands, cancel, task }
    }

    /// Queues a snapshot run tagged with `epoch`.
    pub fn request_snapshot(&self, epoch: u64) -> Result<()> {
        self.commands
            .send(Command::RequestSnapshot { epoch })
            .map_err(|_| FeedError::ChannelClosed("transport task has stopped".to_string()))
    }

    /// Stops the task and closes the link. Idempotent.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::rng().random_range(0..spread))
}

async fn start_snapshot(conn: &mut TransportConnection, epoch: u64) -> TransportEvent {
    match conn.request_snapshot(epoch).await {
        Ok(()) => TransportEvent::SnapshotStarted { epoch },
        Err(error) => TransportEvent::SnapshotFailed { epoch, error },
    }
}

async fn drive(
    mut conn: TransportConnection,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    snapshot_on_connect: bool,
    mut emit: EventSink,
) {
    let provider_id = conn.settings().provider_id.clone();
    let mut delay = conn.settings().reconnect_delay;
    let mut first_connect = true;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => {
                conn.disconnect().await;
                return;
            }
            result = conn.connect() => result,
        };

        match attempt {
            Ok(()) => {
                delay = conn.settings().reconnect_delay;
                if !emit(TransportEvent::Connected) {
                    conn.disconnect().await;
                    return;
                }
                if first_connect && snapshot_on_connect {
                    if !emit(start_snapshot(&mut conn, 0).await) {
                        conn.disconnect().await;
                        return;
                    }
                }
                first_connect = false;

                // Streaming phase: runs until the link drops or we are told to stop.
                'stream: loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            conn.disconnect().await;
                            return;
                        }
                        command = commands.recv() => match command {
                            Some(Command::RequestSnapshot { epoch }) => {
                                if !emit(start_snapshot(&mut conn, epoch).await) {
                                    conn.disconnect().await;
                                    return;
                                }
                            }
                            None => {
                                conn.disconnect().await;
                                return;
                            }
                        },
                        events = conn.next_events() => {
                            for event in events {
                                let dropped = matches!(event, TransportEvent::Disconnected { .. });
                                if !emit(event) {
                                    conn.disconnect().await;
                                    return;
                                }
                                if dropped {
                                    break 'stream;
                                }
                            }
                        }
                    }
                }
            }
            Err(error) => {
                log::warn!("[{}] Connect failed: {}", provider_id, error);
                if !emit(TransportEvent::Error { error }) {
                    return;
                }
            }
        }

        let wait = with_jitter(delay);
        log::info!("[{}] Reconnecting in {}ms", provider_id, wait.as_millis());
        tokio::select! {
            _ = cancel.cancelled() => {
                conn.disconnect().await;
                return;
            }
            _ = sleep(wait) => {}
        }
        delay = (delay * 2).min(conn.settings().reconnect_max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Link that replays queued bodies and records what was published.
    #[derive(Default)]
    struct ScriptedLink {
        inbound: VecDeque<LinkFrame>,
        published: Arc<Mutex<Vec<(String, String)>>>,
        fail_open: bool,
    }

    #[async_trait]
    impl Link for ScriptedLink {
        async fn open(&mut self) -> Result<()> {
            if self.fail_open {
                Err(FeedError::Connection("refused".into()))
            } else {
                Ok(())
            }
        }
        async fn subscribe(&mut self, _topic: &str) -> Result<()> {
            Ok(())
        }
        async fn publish(&mut self, topic: &str, body: &str) -> Result<()> {
            self.published.lock().unwrap().push((topic.into(), body.into()));
            Ok(())
        }
        async fn heartbeat(&mut self) -> Result<()> {
            Ok(())
        }
        async fn recv(&mut self) -> LinkFrame {
            match self.inbound.pop_front() {
                Some(frame) => frame,
                None => std::future::pending().await,
            }
        }
        async fn close(&mut self) {}
    }

    fn settings(max_rows: Option<usize>) -> ConnectionSettings {
        let config = ProviderConfig {
            id: "abc".into(),
            url: "ws://broker".into(),
            listener_topic: "/snap/pos/abc".into(),
            request_message: Some("/snap/pos/abc/1000".into()),
            request_body: Some("START".into()),
            snapshot_end_token: Some("Success".into()),
            key_column: "id".into(),
            max_rows,
            heartbeat_ms: 0,
            ..ProviderConfig::default()
        };
        ConnectionSettings::from_config(&config, "abc-1")
    }

    fn message(body: &str) -> LinkFrame {
        LinkFrame::Message { topic: "/snap/pos/abc".into(), body: body.into() }
    }

    fn rows_json(range: std::ops::Range<usize>) -> String {
        let rows: Vec<String> = range.map(|i| format!(r#"{{"id":{},"v":{}}}"#, i, i * 10)).collect();
        format!("[{}]", rows.join(","))
    }

    #[tokio::test]
    async fn trigger_is_published_and_end_token_completes_snapshot() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let link = ScriptedLink {
            inbound: VecDeque::from(vec![message(r#"[{"id":1,"v":10}]"#), message("SUCCESS")]),
            published: published.clone(),
            ..Default::default()
        };
        let mut conn = TransportConnection::new(Box::new(link), settings(None));
        conn.connect().await.unwrap();
        conn.request_snapshot(0).await.unwrap();
        assert_eq!(
            published.lock().unwrap().as_slice(),
            &[("/snap/pos/abc/1000".to_string(), "START".to_string())]
        );

        let first = conn.next_events().await;
        assert!(matches!(&first[0], TransportEvent::Data { snapshot: true, rows, .. } if rows.len() == 1));
        let second = conn.next_events().await;
        assert!(matches!(
            second[0],
            TransportEvent::SnapshotComplete { epoch: 0, rows_received: 1, end: SnapshotEnd::EndToken, .. }
        ));
        assert!(!conn.is_snapshot_mode());
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_silently() {
        let link = ScriptedLink::default();
        let mut conn = TransportConnection::new(Box::new(link), settings(None));
        conn.connect().await.unwrap();
        assert!(conn.handle_frame("{not json").is_empty());
        assert!(conn.handle_frame("Success").is_empty(), "no snapshot running");
    }

    #[tokio::test]
    async fn row_cap_splits_the_frame_and_completes_once() {
        let link = ScriptedLink::default();
        let mut conn = TransportConnection::new(Box::new(link), settings(Some(100)));
        conn.connect().await.unwrap();
        conn.request_snapshot(0).await.unwrap();

        let events = conn.handle_frame(&rows_json(0..150));
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], TransportEvent::Data { snapshot: true, rows, .. } if rows.len() == 100));
        assert!(matches!(
            events[1],
            TransportEvent::SnapshotComplete { rows_received: 100, end: SnapshotEnd::MaxRows, .. }
        ));
        assert!(matches!(&events[2], TransportEvent::Data { snapshot: false, rows, .. } if rows.len() == 50));

        let later = conn.handle_frame("Success");
        assert!(later.is_empty(), "snapshot completes exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_end_token_times_out_without_disconnecting() {
        let link = ScriptedLink::default();
        let mut conn = TransportConnection::new(Box::new(link), settings(None));
        conn.connect().await.unwrap();
        conn.request_snapshot(4).await.unwrap();

        let events = conn.next_events().await;
        assert!(matches!(
            &events[0],
            TransportEvent::SnapshotFailed { epoch: 4, error: FeedError::SnapshotTimeout { timeout_ms: 60_000, .. } }
        ));
        assert!(conn.is_connected());
        assert!(conn.is_snapshot_mode());
    }

    #[tokio::test]
    async fn failed_handshake_is_a_connection_error() {
        let link = ScriptedLink { fail_open: true, ..Default::default() };
        let mut conn = TransportConnection::new(Box::new(link), settings(None));
        let err = conn.connect().await.unwrap_err();
        assert_eq!(err.kind(), "connection");
        conn.disconnect().await;
        conn.disconnect().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn driver_requests_snapshot_after_first_connect() {
        let link = ScriptedLink {
            inbound: VecDeque::from(vec![message(r#"{"id":1}"#), message("Success")]),
            ..Default::default()
        };
        let conn = TransportConnection::new(Box::new(link), settings(None));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::spawn(conn, true, Box::new(move |event| tx.send(event).is_ok()));

        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        assert_eq!(rx.recv().await, Some(TransportEvent::SnapshotStarted { epoch: 0 }));
        assert!(matches!(rx.recv().await, Some(TransportEvent::Data { snapshot: true, .. })));
        assert!(matches!(rx.recv().await, Some(TransportEvent::SnapshotComplete { .. })));

        handle.disconnect();
        handle.disconnect();
    }

    #[tokio::test]
    async fn restarted_snapshot_completes_under_the_latest_epoch() {
        let link = ScriptedLink::default();
        let mut conn = TransportConnection::new(Box::new(link), settings(None));
        conn.connect().await.unwrap();
        conn.request_snapshot(0).await.unwrap();
        conn.handle_frame(r#"{"id":1}"#);
        conn.request_snapshot(1).await.unwrap();

        let events = conn.handle_frame("Success");
        assert!(matches!(
            events[0],
            TransportEvent::SnapshotComplete { epoch: 1, rows_received: 0, end: SnapshotEnd::EndToken, .. }
        ));
    }

    #[tokio::test]
    async fn driver_tags_commanded_snapshots_with_their_epoch() {
        let link = ScriptedLink::default();
        let conn = TransportConnection::new(Box::new(link), settings(None));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::spawn(conn, false, Box::new(move |event| tx.send(event).is_ok()));

        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));
        handle.request_snapshot(3).unwrap();
        assert_eq!(rx.recv().await, Some(TransportEvent::SnapshotStarted { epoch: 3 }));
        handle.disconnect();
    }
}
