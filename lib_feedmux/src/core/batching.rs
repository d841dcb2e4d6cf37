//! # Batch Conflator
//!
//! Shapes the downstream traffic of one provider session.
//!
//! - **Snapshot rows** are appended to a buffer and cut into batches of at
//!   most `batch_size` rows. A partial batch is flushed by the session's
//!   debounce timer or when the snapshot completes.
//! - **Realtime rows** are conflated by key inside a window: only the latest
//!   value of each key survives, in the order keys were first seen in the
//!   window. When the window closes the survivors go out as one update.
//!
//! The conflator holds no timers. The session decides when a flush is due and
//! calls in; this keeps the logic synchronous and directly testable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::model::{ProviderConfig, Row};

/// Flush thresholds for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Quiet period after the last snapshot write before a partial batch goes out.
    pub debounce: Duration,
    /// Realtime conflation window. Zero flushes every update immediately.
    pub window: Duration,
}

impl BatchSettings {
    /// Provider hints (`batchSize`, `messageRate`) over the multiplexer defaults.
    pub fn for_provider(config: &ProviderConfig, default_batch_size: usize, debounce: Duration, default_window: Duration) -> Self {
        Self {
            batch_size: config.batch_size.unwrap_or(default_batch_size).max(1),
            debounce,
            window: config.message_rate.map(Duration::from_millis).unwrap_or(default_window),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    SnapshotBatch,
    RealtimeUpdate,
}

/// One unit of downstream output.
#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub kind: FlushKind,
    /// Strictly increasing per session.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub rows: Vec<Row>,
}

pub struct BatchConflator {
    settings: BatchSettings,
    snapshot_buffer: Vec<Row>,
    pending: IndexMap<String, Row>,
    sequence: u64,
}

impl BatchConflator {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            snapshot_buffer: Vec::with_capacity(settings.batch_size.min(4096)),
            pending: IndexMap::new(),
            sequence: 0,
            settings,
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Last sequence number handed out (0 before the first flush).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn next_flush(&mut self, kind: FlushKind, rows: Vec<Row>) -> Flush {
        self.sequence += 1;
        Flush {
            kind,
            sequence: self.sequence,
            timestamp: Utc::now(),
            rows,
        }
    }

    /// Buffers snapshot rows and returns every full batch they completed.
    pub fn push_snapshot(&mut self, rows: impl IntoIterator<Item = Row>) -> Vec<Flush> {
        let mut flushes = Vec::new();
        for row in rows {
            self.snapshot_buffer.push(row);
            if self.snapshot_buffer.len() >= self.settings.batch_size {
                let batch = std::mem::take(&mut self.snapshot_buffer);
                flushes.push(self.next_flush(FlushKind::SnapshotBatch, batch));
            }
        }
        flushes
    }

    pub fn has_buffered_snapshot(&self) -> bool {
        !self.snapshot_buffer.is_empty()
    }

    /// Emits the partial snapshot batch, if any.
    pub fn flush_snapshot(&mut self) -> Option<Flush> {
        if self.snapshot_buffer.is_empty() {
            return None;
        }
        let batch = std::mem::take(&mut self.snapshot_buffer);
        Some(self.next_flush(FlushKind::SnapshotBatch, batch))
    }

    /// Records a realtime row. A newer value replaces an older one for the
    /// same key without changing the key's position.
    pub fn push_update(&mut self, key: String, row: Row) {
        self.pending.insert(key, row);
    }

    pub fn has_pending_updates(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Emits the conflated update, if any.
    pub fn flush_updates(&mut self) -> Option<Flush> {
        if self.pending.is_empty() {
            return None;
        }
        let rows = std::mem::take(&mut self.pending).into_values().collect();
        Some(self.next_flush(FlushKind::RealtimeUpdate, rows))
    }

    /// Snapshot rows first, then the conflated update.
    pub fn flush_all(&mut self) -> Vec<Flush> {
        self.flush_snapshot().into_iter().chain(self.flush_updates()).collect()
    }

    /// Drops buffered rows. The sequence keeps counting.
    pub fn clear(&mut self) {
        self.snapshot_buffer.clear();
        self.pending.clear();
    }
}
