//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does so when a Run settles).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_blocked: AtomicU64,
    runs_aborted: AtomicU64,
    tool_failures: AtomicU64,
    retry_cycles: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            runs_started: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_blocked: AtomicU64::new(0),
            runs_aborted: AtomicU64::new(0),
            tool_failures: AtomicU64::new(0),
            retry_cycles: AtomicU64::new(0),
        }
    }

    pub fn inc_runs_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_started", "counter incremented");
    }

    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_completed", "counter incremented");
    }

    pub fn inc_runs_blocked(&self) {
        self.runs_blocked.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_blocked", "counter incremented");
    }

    pub fn inc_runs_aborted(&self) {
        self.runs_aborted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_aborted", "counter incremented");
    }

    /// Failed or timed-out external calls.
    pub fn inc_tool_failures(&self) {
        self.tool_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "tool_failures", "counter incremented");
    }

    pub fn inc_retry_cycles(&self) {
        self.retry_cycles.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retry_cycles", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            runs_started = self.runs_started(),
            runs_completed = self.runs_completed(),
            runs_blocked = self.runs_blocked(),
            runs_aborted = self.runs_aborted(),
            tool_failures = self.tool_failures(),
            retry_cycles = self.retry_cycles(),
        );
    }

    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn runs_blocked(&self) -> u64 {
        self.runs_blocked.load(Ordering::Relaxed)
    }

    pub fn runs_aborted(&self) -> u64 {
        self.runs_aborted.load(Ordering::Relaxed)
    }

    pub fn tool_failures(&self) -> u64 {
        self.tool_failures.load(Ordering::Relaxed)
    }

    pub fn retry_cycles(&self) -> u64 {
        self.retry_cycles.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.runs_started.store(0, Ordering::Relaxed);
        self.runs_completed.store(0, Ordering::Relaxed);
        self.runs_blocked.store(0, Ordering::Relaxed);
        self.runs_aborted.store(0, Ordering::Relaxed);
        self.tool_failures.store(0, Ordering::Relaxed);
        self.retry_cycles.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_runs_started();
        m.inc_runs_started();
        m.inc_runs_blocked();
        m.inc_tool_failures();
        m.inc_retry_cycles();
        m.inc_retry_cycles();
        m.inc_retry_cycles();
        assert_eq!(m.runs_started(), 2);
        assert_eq!(m.runs_blocked(), 1);
        assert_eq!(m.runs_completed(), 0);
        assert_eq!(m.tool_failures(), 1);
        assert_eq!(m.retry_cycles(), 3);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_runs_started();
        m.inc_runs_completed();
        m.inc_runs_aborted();
        m.reset();
        assert_eq!(m.runs_started(), 0);
        assert_eq!(m.runs_completed(), 0);
        assert_eq!(m.runs_aborted(), 0);
    }
}
