//! Master configuration.

use peepsy_proto::{
    PeepsyError, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_MISS_THRESHOLD,
    DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};

/// Options for a [`Master`](crate::Master).
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Default per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Default retry count for `send`.
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds.
    pub retry_delay_ms: u64,
    /// Expected heartbeat cadence; also the health monitor cadence.
    pub heartbeat_interval_ms: u64,
    /// Missed-interval multiplier before a worker is unhealthy.
    pub heartbeat_miss_threshold: u32,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: 0,
            retry_delay_ms: 1_000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_miss_threshold: DEFAULT_HEARTBEAT_MISS_THRESHOLD,
        }
    }
}

impl MasterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    pub fn with_heartbeat_miss_threshold(mut self, threshold: u32) -> Self {
        self.heartbeat_miss_threshold = threshold;
        self
    }

    /// Timeouts must be positive and at most five minutes.
    pub fn validate(&self) -> Result<(), PeepsyError> {
        validate_timeout_ms(self.timeout_ms)
    }
}

pub(crate) fn validate_timeout_ms(timeout_ms: u64) -> Result<(), PeepsyError> {
    if timeout_ms == 0 || timeout_ms > MAX_TIMEOUT_MS {
        return Err(PeepsyError::new(format!(
            "Invalid timeout: {}ms (must be 1..={}ms)",
            timeout_ms, MAX_TIMEOUT_MS
        )));
    }
    Ok(())
}

/// Per-call overrides for [`Master::send`](crate::Master::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the master's default timeout.
    pub timeout_ms: Option<u64>,
    /// Overrides the master's default retry count.
    pub retries: Option<u32>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}
