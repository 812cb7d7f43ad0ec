//! Per-channel rate limiter and batcher
//!
//! Smooths bursts (a bulk update touching many rows) into bounded batches
//! without dropping or reordering events. The batcher is a plain state
//! machine; the registry owns the flush timer and acts on [`Admission`].

use crate::config::RateLimitConfig;
use crate::event::ChangeEvent;
use std::collections::VecDeque;
use tokio::time::Instant;

/// What the caller must do with an inbound event
#[derive(Debug, PartialEq)]
pub enum Admission {
    /// Under the rate limit: deliver now
    Deliver(ChangeEvent),
    /// Queued; queue is full, flush now
    FlushNow,
    /// Queued; start the batch-window timer
    ScheduleFlush,
    /// Queued; a flush is already pending
    Queued,
}

/// Rate limiting state for one channel
#[derive(Debug)]
pub struct EventBatcher {
    config: RateLimitConfig,
    last_event: Option<Instant>,
    queue: VecDeque<ChangeEvent>,
    flush_pending: bool,
}

impl EventBatcher {
    /// Create batcher
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            last_event: None,
            queue: VecDeque::new(),
            flush_pending: false,
        }
    }

    /// Admit one inbound event arriving at `now`
    ///
    /// An event is only delivered immediately when nothing is queued, so a
    /// quiet moment in the middle of a burst cannot overtake queued events.
    pub fn admit(&mut self, now: Instant, event: ChangeEvent) -> Admission {
        if self.queue.is_empty() && self.under_limit(now) {
            self.last_event = Some(now);
            return Admission::Deliver(event);
        }

        self.queue.push_back(event);

        if self.queue.len() >= self.config.max_batch_size {
            Admission::FlushNow
        } else if self.flush_pending {
            Admission::Queued
        } else {
            self.flush_pending = true;
            Admission::ScheduleFlush
        }
    }

    /// Dequeue up to `max_batch_size` events in arrival order
    ///
    /// Clears the pending-flush flag; the caller must re-arm the timer when
    /// [`Self::has_queued`] is still true.
    pub fn drain(&mut self, now: Instant) -> Vec<ChangeEvent> {
        self.flush_pending = false;
        let count = self.queue.len().min(self.config.max_batch_size);
        let batch: Vec<ChangeEvent> = self.queue.drain(..count).collect();
        if !batch.is_empty() {
            self.last_event = Some(now);
        }
        batch
    }

    /// Mark a follow-up flush as scheduled
    #[inline]
    pub fn mark_flush_pending(&mut self) {
        self.flush_pending = true;
    }

    /// Events waiting for a flush
    #[inline]
    #[must_use]
    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Queue length
    #[inline]
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether a flush timer is armed
    #[inline]
    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.flush_pending
    }

    /// Batch window
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Drop all queued events and timer state (channel teardown)
    pub fn clear(&mut self) {
        self.queue.clear();
        self.flush_pending = false;
    }

    fn under_limit(&self, now: Instant) -> bool {
        let Some(last) = self.last_event else {
            return true;
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        if elapsed == 0.0 {
            return false;
        }
        1.0 / elapsed <= self.config.max_events_per_second
    }
}
