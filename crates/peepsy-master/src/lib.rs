//! peepsy-master - Master side of the peepsy IPC supervisor
//!
//! The [`Master`] spawns long-lived worker processes, routes requests to
//! them directly or through load-balanced groups with concurrency caps,
//! correlates responses by id with per-request timeouts and retries,
//! watches worker health via heartbeats, and restarts workers that go
//! quiet. Workers can originate requests of their own, served by handlers
//! registered on the master.
//!
//! Spawning goes through the [`ProcessHost`] seam; the default
//! [`ChildProcessHost`] runs worker binaries as child processes speaking
//! newline-delimited JSON envelopes over piped stdio.

pub mod config;
pub mod events;
pub mod group;
mod health;
pub mod host;
pub mod master;
mod signal;
pub mod stats;

pub use config::{MasterOptions, SendOptions};
pub use events::{ListenerId, MasterEvent};
pub use group::{GroupConfig, Strategy};
pub use host::{ChildControl, ChildProcessHost, ExitInfo, ProcessHost, SpawnSpec, SpawnedChild};
pub use master::{Master, SendResult};
pub use stats::{GroupStats, ProcessStats, WorkerStatus};

pub use peepsy_proto::{HandlerRegistry, PeepsyError, WorkerMode};
