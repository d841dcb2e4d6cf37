//! # Provider Session
//!
//! The live state of one provider: its transport, its row cache keyed by the
//! configured key column, its subscribers and the conflator that shapes what
//! they receive.
//!
//! A session is owned by the multiplexer task and is never shared. Transport
//! events and timer fires reach it as `MuxInput` messages tagged with the
//! session's generation, so events from an earlier, torn-down session for the
//! same provider are ignored.
//!
//! Mode transitions follow `SessionMode::can_transition_to`. A snapshot that
//! times out leaves the session in `Snapshot` mode: realtime rows keep flowing
//! and a late end-token still completes it, but `getSnapshot` answers with the
//! timeout error until the next refresh.
//!
//! Each refresh starts a new snapshot epoch. Snapshot events from an earlier
//! run (an end-token that was still in flight when the refresh was issued)
//! are dropped instead of completing the new one.

use chrono::Utc;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::batching::{BatchConflator, BatchSettings, Flush, FlushKind};
use crate::core::dispatcher::{EndpointSink, Fanout};
use crate::core::multiplexer::{MultiplexerSettings, MuxInput};
use crate::core::scheduler::ScheduledTask;
use crate::error::{FeedError, Result};
use crate::model::{row_key, ProviderConfig, Response, ResponseType, Row, SessionMode, Statistics};
use crate::transport::{ConnectionHandle, ConnectionSettings, LinkFactory, TransportConnection, TransportEvent};

/// A point-to-point answer the multiplexer must deliver.
#[derive(Debug, Clone)]
pub struct Directed {
    pub endpoint_id: String,
    pub response: Response,
}

#[derive(Debug, Clone)]
struct PendingSnapshot {
    endpoint_id: String,
    request_id: String,
}

pub struct ProviderSession {
    id: String,
    session_id: String,
    generation: u64,
    config: ProviderConfig,
    mode: SessionMode,
    cache: IndexMap<String, Row>,
    stats: Statistics,
    subscribers: Fanout,
    pending_snapshots: Vec<PendingSnapshot>,
    snapshot_failure: Option<FeedError>,
    /// Epoch of the snapshot run this session is waiting on. The run started
    /// on first connect is 0.
    snapshot_epoch: u64,
    conflator: BatchConflator,
    flush_timer: ScheduledTask,
    connection: Option<ConnectionHandle>,
    inbox: mpsc::UnboundedSender<MuxInput>,
}

impl ProviderSession {
    /// Builds an idle session. `config` must already be validated.
    pub fn new(
        config: ProviderConfig,
        generation: u64,
        settings: &MultiplexerSettings,
        inbox: mpsc::UnboundedSender<MuxInput>,
    ) -> Self {
        let batch = BatchSettings::for_provider(
            &config,
            settings.batch_size,
            settings.snapshot_debounce,
            settings.conflation_window,
        );
        let prefix = Uuid::new_v4().simple().to_string();
        let session_id = format!("{}-{}", config.id, &prefix[..8]);
        Self {
            id: config.id.clone(),
            session_id,
            generation,
            config,
            mode: SessionMode::Idle,
            cache: IndexMap::new(),
            stats: Statistics::default(),
            subscribers: Fanout::new(),
            pending_snapshots: Vec::new(),
            snapshot_failure: None,
            snapshot_epoch: 0,
            conflator: BatchConflator::new(batch),
            flush_timer: ScheduledTask::new(),
            connection: None,
            inbox,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stable id substituted for `{sessionId}` in topics.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn row_count(&self) -> usize {
        self.cache.len()
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = self.stats.clone();
        stats.mode = self.mode;
        stats.row_count = self.cache.len();
        stats.subscriber_count = self.subscribers.len();
        stats
    }

    fn set_mode(&mut self, next: SessionMode) {
        if self.mode == next {
            return;
        }
        if !self.mode.can_transition_to(next) {
            log::warn!("[{}] Ignoring invalid mode transition {:?} -> {:?}", self.id, self.mode, next);
            return;
        }
        log::info!("[{}] Mode {:?} -> {:?}", self.id, self.mode, next);
        self.mode = next;
    }

    // ── Subscribers ─────────────────────────────────────────────────────────

    pub fn add_subscriber(&mut self, endpoint_id: &str, sink: EndpointSink) -> bool {
        let added = self.subscribers.add(endpoint_id, sink);
        if added {
            log::info!("[{}] Endpoint '{}' subscribed ({} total)", self.id, endpoint_id, self.subscribers.len());
        }
        added
    }

    /// Removes the endpoint and forgets any snapshot request it queued.
    pub fn remove_subscriber(&mut self, endpoint_id: &str) -> bool {
        self.pending_snapshots.retain(|p| p.endpoint_id != endpoint_id);
        let removed = self.subscribers.remove(endpoint_id);
        if removed {
            log::info!("[{}] Endpoint '{}' unsubscribed ({} left)", self.id, endpoint_id, self.subscribers.len());
        }
        removed
    }

    pub fn has_subscriber(&self, endpoint_id: &str) -> bool {
        self.subscribers.contains(endpoint_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    fn broadcast(&mut self, response: Response) {
        for endpoint_id in self.subscribers.broadcast(response) {
            log::warn!("[{}] Removed dead endpoint '{}'", self.id, endpoint_id);
            self.pending_snapshots.retain(|p| p.endpoint_id != endpoint_id);
        }
    }

    fn broadcast_status(&mut self) {
        let stats = self.statistics();
        self.broadcast(Response::new(ResponseType::Status, self.id.clone()).with_statistics(stats));
    }

    fn broadcast_flush(&mut self, flush: Flush) {
        let kind = match flush.kind {
            FlushKind::SnapshotBatch => ResponseType::Snapshot,
            FlushKind::RealtimeUpdate => ResponseType::Update,
        };
        let response = Response::new(kind, self.id.clone())
            .with_rows(flush.rows)
            .with_sequence(flush.sequence, flush.timestamp);
        self.broadcast(response);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Creates the link and starts the transport task. Idempotent.
    pub fn start(&mut self, factory: &dyn LinkFactory) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let link = factory.create(&self.config)?;
        let settings = ConnectionSettings::from_config(&self.config, &self.session_id);
        let connection = TransportConnection::new(link, settings);

        let inbox = self.inbox.clone();
        let provider_id = self.id.clone();
        let generation = self.generation;
        let sink = Box::new(move |event: TransportEvent| {
            inbox
                .send(MuxInput::Transport {
                    provider_id: provider_id.clone(),
                    generation,
                    event,
                })
                .is_ok()
        });

        self.set_mode(SessionMode::Connecting);
        self.connection = Some(ConnectionHandle::spawn(connection, self.config.wants_snapshot(), sink));
        log::info!(
            "[{}] Session {} started for '{}' (generation {})",
            self.id,
            self.session_id,
            self.config.label(),
            self.generation
        );
        Ok(())
    }

    /// Closes the transport and stops the timers. Idempotent.
    pub fn teardown(&mut self) {
        self.flush_timer.cancel();
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
            log::info!("[{}] Session {} torn down", self.id, self.session_id);
        }
        self.stats.is_connected = false;
        self.pending_snapshots.clear();
    }

    /// Applies one transport event. Returns the point-to-point answers it
    /// produced.
    pub fn handle_transport(&mut self, event: TransportEvent) -> Vec<Directed> {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { reason } => {
                log::warn!("[{}] Transport dropped: {}", self.id, reason);
                self.stats.is_connected = false;
                self.stats.disconnection_count += 1;
                self.stats.disconnected_at = Some(Utc::now());
                let error = FeedError::Connection(reason);
                self.stats.last_error = Some(error.to_string());
                self.broadcast(Response::new(ResponseType::Error, self.id.clone()).with_error(&error));
                self.broadcast_status();
                Vec::new()
            }
            TransportEvent::Error { error } => {
                log::warn!("[{}] Transport error: {}", self.id, error);
                self.stats.last_error = Some(error.to_string());
                self.broadcast(Response::new(ResponseType::Error, self.id.clone()).with_error(&error));
                self.broadcast_status();
                Vec::new()
            }
            TransportEvent::SnapshotStarted { epoch }
            | TransportEvent::SnapshotComplete { epoch, .. }
            | TransportEvent::SnapshotFailed { epoch, .. }
                if epoch != self.snapshot_epoch =>
            {
                log::debug!(
                    "[{}] Ignoring snapshot event from epoch {} (current {})",
                    self.id,
                    epoch,
                    self.snapshot_epoch
                );
                Vec::new()
            }
            TransportEvent::SnapshotStarted { .. } => {
                self.stats.snapshot_started_at = Some(Utc::now());
                self.stats.snapshot_ended_at = None;
                self.stats.snapshot_complete = false;
                self.snapshot_failure = None;
                self.set_mode(SessionMode::Snapshot);
                Vec::new()
            }
            TransportEvent::Data { rows, snapshot, bytes } => {
                self.on_rows(rows, snapshot, bytes);
                Vec::new()
            }
            TransportEvent::SnapshotComplete { rows_received, duration_ms, end, .. } => {
                log::info!(
                    "[{}] Snapshot finished via {:?}: {} rows in {}ms, {} keys cached",
                    self.id,
                    end,
                    rows_received,
                    duration_ms,
                    self.cache.len()
                );
                if let Some(flush) = self.conflator.flush_snapshot() {
                    self.broadcast_flush(flush);
                }
                if !self.conflator.has_pending_updates() {
                    self.flush_timer.cancel();
                }
                self.stats.snapshot_complete = true;
                self.stats.snapshot_ended_at = Some(Utc::now());
                self.snapshot_failure = None;
                self.set_mode(SessionMode::Realtime);
                self.broadcast_status();
                self.answer_pending_snapshots()
            }
            TransportEvent::SnapshotFailed { error, .. } => {
                log::warn!("[{}] Snapshot failed: {}", self.id, error);
                if let Some(flush) = self.conflator.flush_snapshot() {
                    self.broadcast_flush(flush);
                }
                self.stats.last_error = Some(error.to_string());
                self.broadcast(Response::new(ResponseType::Error, self.id.clone()).with_error(&error));
                let answers = std::mem::take(&mut self.pending_snapshots)
                    .into_iter()
                    .map(|p| Directed {
                        response: Response::new(ResponseType::Error, self.id.clone())
                            .correlate(&p.request_id)
                            .with_error(&error),
                        endpoint_id: p.endpoint_id,
                    })
                    .collect();
                self.snapshot_failure = Some(error);
                answers
            }
        }
    }

    fn on_connected(&mut self) -> Vec<Directed> {
        self.stats.is_connected = true;
        self.stats.connection_count += 1;
        self.stats.connected_at = Some(Utc::now());
        self.stats.last_error = None;

        let mut answers = Vec::new();
        if self.mode == SessionMode::Connecting {
            if self.config.wants_snapshot() {
                self.set_mode(SessionMode::Snapshot);
            } else {
                self.set_mode(SessionMode::Realtime);
                answers = self.answer_pending_snapshots();
            }
        }
        self.broadcast_status();
        answers
    }

    fn on_rows(&mut self, rows: Vec<Row>, snapshot: bool, bytes: usize) {
        self.stats.record_bytes(bytes, snapshot);
        let key_column = self.config.key_column.as_str();

        let mut accepted = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(key) = row_key(&row, key_column) else {
                log::warn!("[{}] Dropping row without usable '{}' key", self.id, key_column);
                continue;
            };
            // IndexMap keeps the first-seen position of an existing key.
            self.cache.insert(key.clone(), row.clone());
            accepted.push((key, row));
        }
        if accepted.is_empty() {
            return;
        }

        if snapshot {
            self.stats.snapshot_rows_received += accepted.len() as u64;
            let flushes = self.conflator.push_snapshot(accepted.into_iter().map(|(_, row)| row));
            for flush in flushes {
                self.broadcast_flush(flush);
            }
            if self.conflator.has_buffered_snapshot() {
                // Debounce: every snapshot write pushes the flush back.
                self.arm_flush_timer(self.conflator.settings().debounce);
            }
        } else {
            self.stats.update_rows_received += accepted.len() as u64;
            for (key, row) in accepted {
                self.conflator.push_update(key, row);
            }
            let window = self.conflator.settings().window;
            if window.is_zero() {
                if let Some(flush) = self.conflator.flush_updates() {
                    self.broadcast_flush(flush);
                }
            } else if !self.flush_timer.is_armed() {
                self.arm_flush_timer(window);
            }
        }
    }

    fn arm_flush_timer(&mut self, delay: std::time::Duration) {
        let inbox = self.inbox.clone();
        let provider_id = self.id.clone();
        let generation = self.generation;
        self.flush_timer.schedule(delay, move |epoch| {
            let _ = inbox.send(MuxInput::FlushDue { provider_id, generation, epoch });
        });
    }

    /// Handles a timer fire scheduled under `epoch`.
    pub fn on_flush_due(&mut self, epoch: u64) {
        if !self.flush_timer.acknowledge(epoch) {
            return;
        }
        for flush in self.conflator.flush_all() {
            self.broadcast_flush(flush);
        }
    }

    fn snapshot_answer(&self, request_id: &str) -> Response {
        Response::new(ResponseType::Snapshot, self.id.clone())
            .correlate(request_id)
            .with_rows(self.rows())
    }

    fn answer_pending_snapshots(&mut self) -> Vec<Directed> {
        let pending = std::mem::take(&mut self.pending_snapshots);
        if pending.is_empty() {
            return Vec::new();
        }
        log::debug!("[{}] Answering {} queued snapshot request(s)", self.id, pending.len());
        pending
            .into_iter()
            .map(|p| Directed {
                response: self.snapshot_answer(&p.request_id),
                endpoint_id: p.endpoint_id,
            })
            .collect()
    }

    /// Answers now from the cache when the snapshot is complete, queues the
    /// request while one is still running.
    pub fn get_snapshot(&mut self, endpoint_id: &str, request_id: &str) -> Option<Directed> {
        if self.mode == SessionMode::Realtime {
            return Some(Directed {
                endpoint_id: endpoint_id.to_string(),
                response: self.snapshot_answer(request_id),
            });
        }
        if let Some(error) = &self.snapshot_failure {
            return Some(Directed {
                endpoint_id: endpoint_id.to_string(),
                response: Response::new(ResponseType::Error, self.id.clone())
                    .correlate(request_id)
                    .with_error(error),
            });
        }
        log::debug!("[{}] Queuing snapshot request '{}' from '{}'", self.id, request_id, endpoint_id);
        self.pending_snapshots.push(PendingSnapshot {
            endpoint_id: endpoint_id.to_string(),
            request_id: request_id.to_string(),
        });
        None
    }

    /// Drops cached rows, tells subscribers to clear theirs and re-triggers
    /// the snapshot on the open connection.
    ///
    /// A provider with no trigger, end-token or row cap is rejected: nothing
    /// could ever end the snapshot.
    pub fn refresh(&mut self) -> Result<()> {
        if !self.config.can_end_snapshot() {
            return Err(FeedError::Configuration(format!(
                "provider '{}' has no trigger, end-token or row cap to end a snapshot",
                self.id
            )));
        }
        let Some(connection) = self.connection.as_ref() else {
            return Err(FeedError::Connection(format!("provider '{}' has no transport", self.id)));
        };
        if !self.stats.is_connected {
            return Err(FeedError::Connection(format!("provider '{}' is not connected", self.id)));
        }
        let epoch = self.snapshot_epoch + 1;
        connection.request_snapshot(epoch)?;
        self.snapshot_epoch = epoch;

        log::info!("[{}] Refresh (epoch {}): dropping {} cached rows", self.id, epoch, self.cache.len());
        self.cache.clear();
        self.conflator.clear();
        self.flush_timer.cancel();
        self.stats.reset_snapshot();
        self.snapshot_failure = None;
        self.set_mode(SessionMode::Snapshot);
        self.broadcast(Response::new(ResponseType::Clear, self.id.clone()));
        Ok(())
    }

    /// Snapshot of the cache in first-seen key order.
    pub fn rows(&self) -> Vec<Row> {
        self.cache.values().cloned().collect()
    }
}

impl Drop for ProviderSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
