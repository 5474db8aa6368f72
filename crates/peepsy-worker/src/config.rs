//! Worker runtime configuration.

use peepsy_proto::{
    WorkerMode, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_TIMEOUT_MS, MAX_CONCURRENCY_ENV,
};

/// Options for a [`Worker`](crate::Worker).
///
/// The execution mode is normally established by the master's INIT
/// envelope; the mode here only applies to requests that arrive before
/// INIT does.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Fallback mode until INIT arrives.
    pub mode: WorkerMode,
    /// In-flight cap for concurrent mode. `None` falls back to the
    /// `PEEPSY_MAX_CONCURRENCY` environment variable, then to unbounded.
    pub max_concurrency: Option<usize>,
    /// Interval between heartbeat emissions.
    pub heartbeat_interval_ms: u64,
    /// Default timeout for worker-originated requests and for queue
    /// expiry when a REQUEST carries no timeout.
    pub request_timeout_ms: u64,
    /// Pid reported in heartbeats. `None` reports the OS pid; embedded
    /// in-process workers are handed a synthetic one by their host.
    pub reported_pid: Option<u32>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            mode: WorkerMode::Sequential,
            max_concurrency: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            reported_pid: None,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_reported_pid(mut self, pid: u32) -> Self {
        self.reported_pid = Some(pid);
        self
    }

    /// Concurrency cap: explicit option first, then the environment.
    ///
    /// A cap of zero (from either source) means unbounded.
    pub fn resolved_max_concurrency(&self) -> Option<usize> {
        let cap = self.max_concurrency.or_else(|| {
            std::env::var(MAX_CONCURRENCY_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
        })?;
        if cap == 0 {
            None
        } else {
            Some(cap)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = WorkerOptions::default();
        assert_eq!(opts.mode, WorkerMode::Sequential);
        assert_eq!(opts.heartbeat_interval_ms, 2000);
        assert_eq!(opts.request_timeout_ms, 5000);
    }

    #[test]
    fn explicit_cap_wins() {
        let opts = WorkerOptions::new().with_max_concurrency(4);
        assert_eq!(opts.resolved_max_concurrency(), Some(4));
    }

    #[test]
    fn zero_cap_means_unbounded() {
        let opts = WorkerOptions::new().with_max_concurrency(0);
        assert_eq!(opts.resolved_max_concurrency(), None);
    }
}
