//! Per-target and per-group statistics.

use serde::Serialize;

use peepsy_proto::now_ms;

/// Smoothing factor for the response-time average.
const EMA_ALPHA: f64 = 0.2;

/// Lifecycle label derived from spawn state and heartbeat recency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
    Gone,
}

/// Counters the master keeps for each worker.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub requests_handled: u64,
    pub requests_active: u64,
    /// Exponential moving average of response times in milliseconds.
    /// The first sample seeds the average directly.
    pub avg_response_time: f64,
    pub errors: u64,
    /// Last send/receive activity, milliseconds since the epoch.
    pub last_activity: u64,
    /// Last heartbeat receipt, milliseconds since the epoch.
    pub last_heartbeat_at: u64,
    pub status: WorkerStatus,
}

impl ProcessStats {
    pub fn new() -> Self {
        let now = now_ms();
        Self {
            requests_handled: 0,
            requests_active: 0,
            avg_response_time: 0.0,
            errors: 0,
            last_activity: now,
            last_heartbeat_at: now,
            status: WorkerStatus::Starting,
        }
    }

    /// Record a completed round-trip with the given duration sample.
    pub fn record_response(&mut self, sample_ms: f64) {
        self.requests_handled += 1;
        self.avg_response_time = if self.avg_response_time == 0.0 {
            sample_ms
        } else {
            EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * self.avg_response_time
        };
        self.last_activity = now_ms();
    }

    /// Most recent sign of life, for unhealthy detection.
    pub fn last_seen(&self) -> u64 {
        self.last_heartbeat_at.max(self.last_activity)
    }
}

impl Default for ProcessStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated view over one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group: String,
    pub strategy: String,
    pub max_concurrency: Option<usize>,
    /// Sum of `requests_active` across members.
    pub requests_active: u64,
    /// Requests parked at the master waiting for group capacity.
    pub pending: usize,
    /// Member stats in group order.
    pub targets: Vec<(String, ProcessStats)>,
}
