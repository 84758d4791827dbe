//! Dispatch metrics.
//!
//! The dispatcher reports through an injected [`DispatchMetrics`] rather than
//! global recorder handles, so tests can count what happened with
//! [`RecordingMetrics`]. [`MetricsFacade`] forwards to whatever recorder the
//! `metrics` crate has installed (Prometheus in the dispatcher binary).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::dispatcher::PoisonReason;
use crate::message::OutboxKind;

/// Sink for dispatcher metrics.
pub trait DispatchMetrics: Send + Sync {
    /// A message was published and marked processed.
    fn message_processed(&self, event: &str, elapsed: Duration);

    fn message_poisoned(&self, event: &str, reason: PoisonReason);

    /// A publish failed transiently and the message was scheduled for retry.
    /// A failure that uses up the last attempt is reported only through
    /// [`message_poisoned`](Self::message_poisoned).
    fn message_failed(&self, event: &str, elapsed: Duration);

    /// An iteration that claimed work finished.
    fn iteration_completed(&self, claimed: usize, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl DispatchMetrics for NoopMetrics {
    fn message_processed(&self, _event: &str, _elapsed: Duration) {}
    fn message_poisoned(&self, _event: &str, _reason: PoisonReason) {}
    fn message_failed(&self, _event: &str, _elapsed: Duration) {}
    fn iteration_completed(&self, _claimed: usize, _elapsed: Duration) {}
}

/// Point-in-time counters from [`RecordingMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub processed: u64,
    pub poisoned: u64,
    pub failed: u64,
    pub iterations: u64,
    pub claimed: u64,
}

/// Counts events in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    processed: AtomicU64,
    poisoned: AtomicU64,
    failed: AtomicU64,
    iterations: AtomicU64,
    claimed: AtomicU64,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            processed: self.processed.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
        }
    }
}

impl DispatchMetrics for RecordingMetrics {
    fn message_processed(&self, _event: &str, _elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn message_poisoned(&self, _event: &str, _reason: PoisonReason) {
        self.poisoned.fetch_add(1, Ordering::Relaxed);
    }

    fn message_failed(&self, _event: &str, _elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn iteration_completed(&self, claimed: usize, _elapsed: Duration) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        self.claimed.fetch_add(claimed as u64, Ordering::Relaxed);
    }
}

pub const PROCESSED_TOTAL: &str = "outbox_messages_processed_total";
pub const POISONED_TOTAL: &str = "outbox_messages_poisoned_total";
pub const FAILED_TOTAL: &str = "outbox_messages_failed_total";
pub const DISPATCH_DURATION: &str = "outbox_dispatch_duration_seconds";
pub const ITERATION_DURATION: &str = "outbox_iteration_duration_seconds";

/// Forwards to the `metrics` crate, labelled by outbox kind and event name.
#[derive(Debug, Clone, Copy)]
pub struct MetricsFacade {
    outbox: &'static str,
}

impl MetricsFacade {
    pub fn new(kind: OutboxKind) -> Self {
        Self {
            outbox: kind.as_str(),
        }
    }
}

impl DispatchMetrics for MetricsFacade {
    fn message_processed(&self, event: &str, elapsed: Duration) {
        let event = event.to_string();
        ::metrics::counter!(PROCESSED_TOTAL, "outbox" => self.outbox, "event" => event.clone())
            .increment(1);
        ::metrics::histogram!(
            DISPATCH_DURATION,
            "outbox" => self.outbox,
            "event" => event,
            "outcome" => "processed"
        )
        .record(elapsed.as_secs_f64());
    }

    fn message_poisoned(&self, event: &str, reason: PoisonReason) {
        ::metrics::counter!(
            POISONED_TOTAL,
            "outbox" => self.outbox,
            "event" => event.to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);
    }

    fn message_failed(&self, event: &str, elapsed: Duration) {
        let event = event.to_string();
        ::metrics::counter!(FAILED_TOTAL, "outbox" => self.outbox, "event" => event.clone())
            .increment(1);
        ::metrics::histogram!(
            DISPATCH_DURATION,
            "outbox" => self.outbox,
            "event" => event,
            "outcome" => "failed"
        )
        .record(elapsed.as_secs_f64());
    }

    fn iteration_completed(&self, _claimed: usize, elapsed: Duration) {
        ::metrics::histogram!(ITERATION_DURATION, "outbox" => self.outbox)
            .record(elapsed.as_secs_f64());
    }
}
