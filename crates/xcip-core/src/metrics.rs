//! Global atomic counters for traffic execution.
//!
//! Counters are bumped at the call site; [`Metrics::flush`] emits the
//! current values as one `info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    requests_sent: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    cycles_sent: AtomicU64,
    cycles_missed: AtomicU64,
    late_cycles: AtomicU64,
    manifests_validated: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub cycles_sent: u64,
    pub cycles_missed: u64,
    pub late_cycles: u64,
    pub manifests_validated: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            requests_sent: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cycles_sent: AtomicU64::new(0),
            cycles_missed: AtomicU64::new(0),
            late_cycles: AtomicU64::new(0),
            manifests_validated: AtomicU64::new(0),
        }
    }

    pub fn inc_requests(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    pub fn inc_cycles(&self) {
        self.cycles_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cycles_missed(&self) {
        self.cycles_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_late_cycles(&self) {
        self.late_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_manifests(&self) {
        self.manifests_validated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cycles_sent: self.cycles_sent.load(Ordering::Relaxed),
            cycles_missed: self.cycles_missed.load(Ordering::Relaxed),
            late_cycles: self.late_cycles.load(Ordering::Relaxed),
            manifests_validated: self.manifests_validated.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            requests_sent = s.requests_sent,
            retries = s.retries,
            timeouts = s.timeouts,
            cycles_sent = s.cycles_sent,
            cycles_missed = s.cycles_missed,
            late_cycles = s.late_cycles,
            manifests_validated = s.manifests_validated,
        );
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.requests_sent,
            &self.retries,
            &self.timeouts,
            &self.cycles_sent,
            &self.cycles_missed,
            &self.late_cycles,
            &self.manifests_validated,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
