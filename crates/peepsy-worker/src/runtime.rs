//! Worker runtime: envelope demux, mode execution, heartbeats, shutdown.
//!
//! One demux loop owns the channel's read side. Requests either go through
//! the priority queue and a pump that keeps at most `cap` handlers in
//! flight (sequential mode is the `cap == 1` case), or, in unbounded
//! concurrent mode, are dispatched to handler execution immediately.
//! Responses to worker-originated requests resolve a pending table keyed
//! by correlation id; responses nobody is waiting for are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use peepsy_proto::{
    now_ms, Channel, Envelope, HandlerRegistry, Heartbeat, PeepsyError, Request, Response,
    StdioChannel, WorkerMode,
};

use crate::config::WorkerOptions;
use crate::queue::PriorityQueue;

/// Cadence of the expired-item sweep over the request queue.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How long graceful shutdown waits for in-flight handlers to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while draining.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// How requests reach handler execution for the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Queue + pump with an in-flight cap (sequential is cap 1).
    Queue { cap: usize },
    /// Dispatch immediately, no backpressure.
    Immediate,
}

fn resolve_mode(mode: WorkerMode, cap: Option<usize>) -> RunMode {
    match mode {
        WorkerMode::Sequential => RunMode::Queue { cap: 1 },
        WorkerMode::Concurrent => match cap {
            Some(n) => RunMode::Queue { cap: n },
            None => RunMode::Immediate,
        },
    }
}

struct Shared {
    channel: Arc<dyn Channel>,
    registry: HandlerRegistry,
    options: WorkerOptions,
    queue: Mutex<PriorityQueue<Request>>,
    /// Wakes the pump on enqueue and on handler completion.
    wake: Notify,
    requests_active: AtomicUsize,
    shutting_down: AtomicBool,
    /// Worker-originated requests awaiting a master RESPONSE.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Response>>>,
    pid: u32,
}

impl Shared {
    fn queue_timeout(&self, req: &Request) -> Duration {
        Duration::from_millis(req.timeout_ms.unwrap_or(self.options.request_timeout_ms))
    }
}

/// The worker half of the supervisor. Construct, register handlers, then
/// let [`Worker::run`] drive the channel until shutdown or disconnect.
pub struct Worker {
    shared: Arc<Shared>,
}

/// Cloneable handle for originating requests toward the master from
/// handler bodies or other worker tasks.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(
        channel: Arc<dyn Channel>,
        registry: HandlerRegistry,
        options: WorkerOptions,
    ) -> Self {
        let pid = options.reported_pid.unwrap_or_else(std::process::id);
        Self {
            shared: Arc::new(Shared {
                channel,
                registry,
                options,
                queue: Mutex::new(PriorityQueue::new()),
                wake: Notify::new(),
                requests_active: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                pid,
            }),
        }
    }

    /// Worker wired to this process's stdin/stdout, for child binaries
    /// spawned by the default master host.
    pub fn from_stdio(registry: HandlerRegistry, options: WorkerOptions) -> Self {
        let channel = Arc::new(StdioChannel::new(tokio::io::stdin(), tokio::io::stdout()));
        Self::new(channel, registry, options)
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drive the demux loop until the master disconnects or sends
    /// SHUTDOWN. Returns cleanly in both cases; the hosting binary should
    /// simply exit afterwards.
    pub async fn run(self) -> Result<(), PeepsyError> {
        let shared = self.shared;
        let heartbeat = spawn_heartbeat(shared.clone());
        let sweeper = spawn_sweeper(shared.clone());

        let mut run_mode = resolve_mode(
            shared.options.mode,
            shared.options.resolved_max_concurrency(),
        );
        let mut pump: Option<JoinHandle<()>> = None;

        debug!(pid = shared.pid, "Worker runtime started");

        loop {
            let Some(envelope) = shared.channel.recv().await else {
                info!("Channel disconnected, worker runtime exiting");
                break;
            };

            match envelope {
                Envelope::Init(init) => {
                    run_mode =
                        resolve_mode(init.mode, shared.options.resolved_max_concurrency());
                    info!(mode = %init.mode, ?run_mode, "Worker initialized");
                    match run_mode {
                        RunMode::Queue { cap } => ensure_pump(&shared, &mut pump, cap),
                        RunMode::Immediate => {
                            // Requests queued before INIT arrived run now.
                            if let Some(p) = pump.take() {
                                p.abort();
                            }
                            let mut queue = shared.queue.lock().await;
                            while let Some(req) = queue.dequeue() {
                                shared.requests_active.fetch_add(1, Ordering::SeqCst);
                                tokio::spawn(execute(shared.clone(), req));
                            }
                        }
                    }
                }

                Envelope::Request(req) => {
                    if shared.shutting_down.load(Ordering::SeqCst) {
                        debug!(id = %req.id, "Dropping request received during shutdown");
                        continue;
                    }
                    match run_mode {
                        RunMode::Immediate => {
                            shared.requests_active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(execute(shared.clone(), req));
                        }
                        RunMode::Queue { cap } => {
                            ensure_pump(&shared, &mut pump, cap);
                            let timeout = shared.queue_timeout(&req);
                            shared.queue.lock().await.enqueue(req, 0, timeout);
                            shared.wake.notify_one();
                        }
                    }
                }

                Envelope::Response(resp) => {
                    let waiter = shared.pending.lock().await.remove(&resp.id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        }
                        None => debug!(id = %resp.id, "Discarding orphan response"),
                    }
                }

                Envelope::Shutdown => {
                    info!("Shutdown requested, draining in-flight work");
                    graceful_shutdown(&shared, &sweeper).await;
                    break;
                }

                other => {
                    debug!(kind = other.kind(), "Ignoring envelope");
                }
            }
        }

        heartbeat.abort();
        sweeper.abort();
        if let Some(p) = pump {
            p.abort();
        }
        // Anyone still awaiting a master response sees the channel as gone.
        shared.pending.lock().await.clear();
        shared.channel.close().await;
        Ok(())
    }
}

impl WorkerHandle {
    /// Send a request to the master and await its response.
    ///
    /// A response with status >= 400 surfaces as an error carrying the
    /// wire's `error` (or `errorPayload.message`) text.
    pub async fn send(
        &self,
        action: impl Into<String>,
        data: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, PeepsyError> {
        let shared = &self.shared;
        if shared.shutting_down.load(Ordering::SeqCst) {
            return Err(PeepsyError::new("Worker is shutting down"));
        }

        let timeout =
            timeout.unwrap_or(Duration::from_millis(shared.options.request_timeout_ms));
        let req = Request::new(action, data, Some(timeout.as_millis() as u64));
        let id = req.id;

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(id, tx);

        if let Err(e) = shared.channel.send(&Envelope::Request(req)).await {
            shared.pending.lock().await.remove(&id);
            return Err(PeepsyError::process(format!("Failed to send request: {}", e)));
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                shared.pending.lock().await.remove(&id);
                Err(PeepsyError::timeout(format!(
                    "Request {} timed out after {}ms",
                    id,
                    timeout.as_millis()
                )))
            }
            Ok(Err(_)) => Err(PeepsyError::process("Channel closed while awaiting response")),
            Ok(Ok(resp)) => {
                if resp.is_error() {
                    Err(PeepsyError::new(
                        resp.error_message().unwrap_or("Request failed").to_string(),
                    ))
                } else {
                    Ok(resp.data.unwrap_or(Value::Null))
                }
            }
        }
    }

    /// Handlers currently executing.
    pub fn requests_active(&self) -> usize {
        self.shared.requests_active.load(Ordering::SeqCst)
    }
}

fn ensure_pump(shared: &Arc<Shared>, pump: &mut Option<JoinHandle<()>>, cap: usize) {
    if pump.is_none() {
        *pump = Some(tokio::spawn(run_pump(shared.clone(), cap)));
    }
}

/// Launches queued requests until `cap` are in flight; re-runs on every
/// enqueue and completion. With `cap == 1` this is the sequential
/// single-consumer loop.
async fn run_pump(shared: Arc<Shared>, cap: usize) {
    loop {
        loop {
            if shared.requests_active.load(Ordering::SeqCst) >= cap {
                break;
            }
            let next = shared.queue.lock().await.dequeue();
            match next {
                Some(req) => {
                    shared.requests_active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(execute(shared.clone(), req));
                }
                None => break,
            }
        }
        shared.wake.notified().await;
    }
}

/// Run one handler and send its RESPONSE. The caller has already
/// incremented `requests_active`; this decrements on completion.
async fn execute(shared: Arc<Shared>, req: Request) {
    let started = Instant::now();
    let response = match shared.registry.dispatch(&req.action, req.data_or_null()).await {
        None => {
            debug!(action = %req.action, "No handler registered");
            Response::not_found(req.id, &req.action)
        }
        Some(Ok(value)) => Response::ok(req.id, value),
        Some(Err(e)) => {
            let message = e
                .to_string()
                .lines()
                .next()
                .unwrap_or("Handler failed")
                .to_string();
            Response::handler_error(req.id, message, Some(format!("{:?}", e)))
        }
    };

    debug!(
        id = %req.id,
        action = %req.action,
        status = response.status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Handler finished"
    );

    if let Err(e) = shared.channel.send(&Envelope::Response(response)).await {
        warn!(id = %req.id, "Failed to send response: {}", e);
    }

    shared.requests_active.fetch_sub(1, Ordering::SeqCst);
    shared.wake.notify_one();
}

fn spawn_heartbeat(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(shared.options.heartbeat_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if shared.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            let heartbeat = Envelope::Heartbeat(Heartbeat {
                pid: shared.pid,
                timestamp: now_ms(),
                requests_active: Some(shared.requests_active.load(Ordering::SeqCst) as u64),
            });
            if let Err(e) = shared.channel.send(&heartbeat).await {
                debug!("Heartbeat emit failed: {}", e);
            }
        }
    })
}

fn spawn_sweeper(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = shared.queue.lock().await.clean_expired();
            debug!(removed, "Swept expired queue items");
        }
    })
}

/// SHUTDOWN handling: stop accepting work, wait (bounded) for in-flight
/// handlers, clear the queue, stop periodic tasks, disconnect.
async fn graceful_shutdown(shared: &Arc<Shared>, sweeper: &JoinHandle<()>) {
    shared.shutting_down.store(true, Ordering::SeqCst);
    sweeper.abort();

    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while shared.requests_active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        tokio::time::sleep(DRAIN_POLL).await;
    }
    let leftover = shared.requests_active.load(Ordering::SeqCst);
    if leftover > 0 {
        warn!(leftover, "Shutdown drain timed out with handlers still running");
    }

    shared.queue.lock().await.clear();
    debug!("Worker drained and queue cleared");
}
