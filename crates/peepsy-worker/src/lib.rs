//! peepsy-worker - Worker-side runtime for the peepsy IPC supervisor
//!
//! A worker process connects to its master over the parent/child channel,
//! registers action handlers, and lets [`Worker::run`] drive the envelope
//! demux loop: requests are executed according to the mode the master
//! initialized (sequential with a priority + expiry queue, or concurrent
//! with an optional in-flight cap), heartbeats are emitted periodically,
//! and a SHUTDOWN envelope drains in-flight work before disconnecting.
//!
//! The hosting binary owns startup:
//!
//! ```ignore
//! let worker = Worker::from_stdio(WorkerOptions::from_env());
//! worker.registry().register("echo", |val: serde_json::Value| async move {
//!     Ok(serde_json::json!({ "echoed": val }))
//! });
//! worker.run().await?;
//! ```

pub mod config;
pub mod queue;
pub mod runtime;

pub use config::WorkerOptions;
pub use queue::PriorityQueue;
pub use runtime::{Worker, WorkerHandle};
