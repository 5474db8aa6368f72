//! peepsy-proto - Wire protocol for the peepsy IPC supervisor
//!
//! This crate defines the envelopes exchanged between a master process and
//! its worker children over the parent/child channel, the typed error
//! taxonomy both endpoints surface, the action handler registry, and the
//! channel abstraction the envelopes travel over.
//!
//! Every message on the wire is a single JSON object tagged by `type`:
//! INIT, REQUEST, RESPONSE, HEARTBEAT, or SHUTDOWN. Either side may
//! originate a REQUEST; correlation is by a random 128-bit `id`.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod handler;

pub use channel::{pair, Channel, MemoryChannel, StdioChannel};
pub use envelope::{
    Envelope, ErrorPayload, Heartbeat, Init, Request, Response, WorkerMode, STATUS_HANDLER_ERROR,
    STATUS_NOT_FOUND, STATUS_OK,
};
pub use error::{now_ms, PeepsyError};
pub use handler::{HandlerFuture, HandlerRegistry};

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Upper bound on a configurable timeout (5 minutes).
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// Default interval between worker heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// Missed-heartbeat multiplier before a worker is considered unhealthy.
pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;

/// Environment variable consulted for a worker's concurrency cap.
pub const MAX_CONCURRENCY_ENV: &str = "PEEPSY_MAX_CONCURRENCY";
