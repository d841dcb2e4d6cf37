//! # Scheduled Task
//!
//! A single-shot timer with cancel-and-reschedule semantics. Scheduling
//! again cancels the previous timer, which is what a debounce needs; checking
//! `is_armed` first gives a fixed window instead.
//!
//! The timer runs as a small task that races a `CancellationToken` against
//! the delay. When it fires it calls back with the epoch it was scheduled
//! under, so the owner can tell a current fire from one that raced with a
//! reschedule.
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct ScheduledTask {
    token: Option<CancellationToken>,
    epoch: u64,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any pending fire and schedules `fire(epoch)` after `delay`.
    pub fn schedule<F>(&mut self, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.epoch += 1;
        let epoch = self.epoch;

        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = child.cancelled() => {
                    log::trace!("Scheduled task {} cancelled", epoch);
                },
                _ = sleep(delay) => fire(epoch),
            }
        });
        self.token = Some(token);
        epoch
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.token.is_some()
    }

    /// Consumes a fire notification. Returns `false` for a stale epoch.
    pub fn acknowledge(&mut self, epoch: u64) -> bool {
        if self.token.is_some() && epoch == self.epoch {
            self.token = None;
            true
        } else {
            false
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
