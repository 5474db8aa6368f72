//! The master: worker registry, request dispatch, and lifecycle.
//!
//! All mutable state lives behind two mutexes: `state` (workers + groups,
//! always locked alone and never across an await that touches `active`)
//! and `active` (the in-flight request table). Correlation follows the
//! resolver-table pattern: each sent request installs a oneshot resolver
//! keyed by its id and arms a timer task; whichever of response, timer,
//! or worker exit removes the entry first settles the request, and the
//! others find the table empty and do nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use peepsy_proto::{
    now_ms, Channel, Envelope, HandlerRegistry, Heartbeat, Init, PeepsyError, Request, Response,
};

use crate::config::{validate_timeout_ms, MasterOptions, SendOptions};
use crate::events::{EventListeners, ListenerId, MasterEvent};
use crate::group::{Group, GroupConfig, PendingSend};
use crate::health;
use crate::host::{ChildControl, ChildProcessHost, ExitInfo, ProcessHost, SpawnSpec};
use crate::signal;
use crate::stats::{GroupStats, ProcessStats, WorkerStatus};

/// Successful outcome of [`Master::send`].
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Correlation id of the attempt that succeeded.
    pub id: Uuid,
    pub status: u16,
    pub data: Option<Value>,
}

pub(crate) struct WorkerRecord {
    pub(crate) spec: SpawnSpec,
    /// Bumped on every (re)spawn; exit handling ignores stale generations.
    pub(crate) generation: u64,
    pub(crate) pid: u32,
    pub(crate) channel: Arc<dyn Channel>,
    pub(crate) control: Arc<dyn ChildControl>,
    pub(crate) stats: ProcessStats,
    pub(crate) group: Option<String>,
    /// Set by a master-initiated shutdown so the exit handler skips the
    /// restart policy for this exit.
    pub(crate) no_restart_once: bool,
    pub(crate) exited_tx: watch::Sender<bool>,
}

pub(crate) struct State {
    pub(crate) workers: HashMap<String, WorkerRecord>,
    pub(crate) groups: HashMap<String, Group>,
}

struct ActiveRequest {
    target: String,
    started: Instant,
    timer: JoinHandle<()>,
    resolver: oneshot::Sender<Result<Response, PeepsyError>>,
}

pub(crate) struct Inner {
    pub(crate) options: MasterOptions,
    pub(crate) host: Arc<dyn ProcessHost>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) state: Mutex<State>,
    active: Mutex<HashMap<Uuid, ActiveRequest>>,
    pub(crate) events: EventListeners,
    pub(crate) shutting_down: AtomicBool,
    generations: AtomicU64,
}

/// Supervisor for a pool of worker processes.
pub struct Master {
    inner: Arc<Inner>,
}

impl Master {
    /// Master backed by the default child-process host.
    pub async fn new(options: MasterOptions) -> Result<Self, PeepsyError> {
        Self::with_host(options, Arc::new(ChildProcessHost::new())).await
    }

    /// Master backed by a caller-supplied process host.
    pub async fn with_host(
        options: MasterOptions,
        host: Arc<dyn ProcessHost>,
    ) -> Result<Self, PeepsyError> {
        options.validate()?;
        let inner = Arc::new(Inner {
            options,
            host,
            registry: HandlerRegistry::new(),
            state: Mutex::new(State {
                workers: HashMap::new(),
                groups: HashMap::new(),
            }),
            active: Mutex::new(HashMap::new()),
            events: EventListeners::default(),
            shutting_down: AtomicBool::new(false),
            generations: AtomicU64::new(0),
        });
        health::spawn_monitor(&inner);
        signal::register(&inner);
        Ok(Self { inner })
    }

    /// Spawn and register a worker under a unique target name.
    ///
    /// Fails if the master is shutting down or the target already exists;
    /// host failures propagate as process errors. The worker joins
    /// `spec.group` (created on first use) and receives INIT with
    /// `spec.mode`.
    pub async fn spawn(&self, target: &str, spec: SpawnSpec) -> Result<(), PeepsyError> {
        spawn_worker(&self.inner, target, spec).await
    }

    /// Send a request to a target or group and await the response.
    ///
    /// Group routing applies the group's strategy, parking the request
    /// when a concurrency cap is reached. Failed attempts retry up to
    /// `retries` times (fresh id, routed again) except for not-found
    /// errors, which never retry.
    pub async fn send(
        &self,
        action: &str,
        destination: &str,
        data: Option<Value>,
        opts: SendOptions,
    ) -> Result<SendResult, PeepsyError> {
        let timeout_ms = opts.timeout_ms.unwrap_or(self.inner.options.timeout_ms);
        validate_timeout_ms(timeout_ms)?;
        let timeout = Duration::from_millis(timeout_ms);
        let retries = opts.retries.unwrap_or(self.inner.options.max_retries);
        let retry_delay = Duration::from_millis(self.inner.options.retry_delay_ms);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match send_once(&self.inner, action, destination, data.clone(), timeout).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    if attempt > retries {
                        return Err(e);
                    }
                    debug!(
                        "Attempt {}/{} for {} on {} failed: {}, retrying",
                        attempt,
                        retries + 1,
                        action,
                        destination,
                        e
                    );
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    /// Register a master-side handler for child-originated requests.
    pub fn register_handler<Req, Resp, F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        Req: serde::de::DeserializeOwned + Send + 'static,
        Resp: serde::Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Resp>> + Send + 'static,
    {
        self.inner.registry.register(action, handler);
    }

    pub fn unregister_handler(&self, action: &str) -> bool {
        self.inner.registry.unregister(action)
    }

    /// The raw registry, for `register_raw` and introspection.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Create or update a group's configuration. Never fails: an unknown
    /// strategy is kept and only errors at the first dispatch through it.
    /// Existing members are not moved.
    pub async fn configure_group(&self, group_id: &str, config: GroupConfig) {
        let mut state = self.inner.state.lock().await;
        state
            .groups
            .entry(group_id.to_string())
            .or_insert_with(Group::new)
            .apply(&config);
    }

    /// Gracefully stop one worker: SHUTDOWN envelope, then a hard kill
    /// after `timeout`. The worker is removed and not restarted.
    pub async fn shutdown_child(&self, target: &str, timeout: Duration) -> Result<(), PeepsyError> {
        shutdown_child_inner(&self.inner, target, timeout).await
    }

    /// Stop every worker and reject parked requests. Spawns and sends
    /// fail from here on.
    pub async fn shutdown_all(&self, timeout: Duration) {
        shutdown_all_inner(&self.inner, timeout).await;
    }

    pub async fn stats(&self, target: &str) -> Option<ProcessStats> {
        let state = self.inner.state.lock().await;
        state.workers.get(target).map(|r| r.stats.clone())
    }

    pub async fn group_stats(&self, group_id: &str) -> Option<GroupStats> {
        let state = self.inner.state.lock().await;
        let group = state.groups.get(group_id)?;
        let targets: Vec<(String, ProcessStats)> = group
            .targets
            .iter()
            .filter_map(|t| state.workers.get(t).map(|r| (t.clone(), r.stats.clone())))
            .collect();
        Some(GroupStats {
            group: group_id.to_string(),
            strategy: group.settings.strategy.as_str().to_string(),
            max_concurrency: group.settings.max_concurrency,
            requests_active: targets.iter().map(|(_, s)| s.requests_active).sum(),
            pending: group.pending.len(),
            targets,
        })
    }

    pub async fn unhealthy_targets(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .workers
            .iter()
            .filter(|(_, r)| r.stats.status == WorkerStatus::Unhealthy)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Requests currently awaiting a response or timeout.
    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    pub async fn alive(&self, target: &str) -> bool {
        self.inner.state.lock().await.workers.contains_key(target)
    }

    /// Pid of the target's current process, if it is registered.
    pub async fn pid(&self, target: &str) -> Option<u32> {
        let state = self.inner.state.lock().await;
        state.workers.get(target).map(|r| r.pid)
    }

    pub async fn targets(&self) -> Vec<String> {
        self.inner.state.lock().await.workers.keys().cloned().collect()
    }

    pub async fn group_targets(&self, group_id: &str) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .groups
            .get(group_id)
            .map(|g| g.targets.clone())
            .unwrap_or_default()
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MasterEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.events.unsubscribe(id)
    }
}

/// Routing decision made under the state lock.
enum Routed {
    /// Parked behind a group concurrency cap; the receiver resolves with
    /// the final outcome once capacity frees and the request completes.
    Parked(oneshot::Receiver<Result<SendResult, PeepsyError>>),
    /// Target selected and its active count already incremented.
    Direct {
        target: String,
        channel: Arc<dyn Channel>,
        data: Option<Value>,
    },
}

async fn send_once(
    inner: &Arc<Inner>,
    action: &str,
    destination: &str,
    data: Option<Value>,
    timeout: Duration,
) -> Result<SendResult, PeepsyError> {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return Err(PeepsyError::new("Master is shutting down"));
    }

    let routed = {
        let mut state = inner.state.lock().await;
        let State { workers, groups } = &mut *state;

        if let Some(group) = groups.get_mut(destination) {
            let at_capacity = group.settings.max_concurrency.is_some_and(|cap| {
                let active: u64 = group
                    .targets
                    .iter()
                    .filter_map(|t| workers.get(t))
                    .map(|r| r.stats.requests_active)
                    .sum();
                active as usize >= cap
            });
            if at_capacity {
                let (tx, rx) = oneshot::channel();
                group.pending.push_back(PendingSend {
                    action: action.to_string(),
                    data,
                    timeout,
                    resolver: tx,
                    enqueued_at: Instant::now(),
                });
                debug!(
                    "Group {} at capacity, queued {} ({} pending)",
                    destination,
                    action,
                    group.pending.len()
                );
                Routed::Parked(rx)
            } else {
                let target =
                    group.select(&|t| workers.get(t).map(|r| r.stats.requests_active).unwrap_or(0))?;
                let record = workers.get_mut(&target).ok_or_else(|| {
                    PeepsyError::not_found(format!("Unknown target: {}", target))
                })?;
                record.stats.requests_active += 1;
                record.stats.last_activity = now_ms();
                Routed::Direct {
                    target,
                    channel: record.channel.clone(),
                    data,
                }
            }
        } else if let Some(record) = workers.get_mut(destination) {
            record.stats.requests_active += 1;
            record.stats.last_activity = now_ms();
            Routed::Direct {
                target: destination.to_string(),
                channel: record.channel.clone(),
                data,
            }
        } else {
            return Err(PeepsyError::not_found(format!(
                "Unknown target or group: {}",
                destination
            )));
        }
    };

    match routed {
        Routed::Parked(rx) => rx
            .await
            .map_err(|_| PeepsyError::new("Master is shutting down"))?,
        Routed::Direct {
            target,
            channel,
            data,
        } => dispatch_prearmed(inner, &target, channel, action, data, timeout).await,
    }
}

/// Moved into its own module so the opaque future type this `async fn`
/// registers has a defining scope separate from `drain_group`'s spawned
/// task that calls back into it — otherwise rustc cannot resolve whether
/// the (mutually-referential) opaque future is `Send`.
mod dispatch_prearmed_mod {
    use super::{
        drain_for_target, fire_timeout, ActiveRequest, Channel, Duration, Envelope, Inner,
        Instant, PeepsyError, Request, SendResult, Value,
    };
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    /// Send to an already-selected target whose active count was incremented
    /// by the caller: install the resolver, arm the timer, write the REQUEST,
    /// await settlement.
    ///
    /// Explicitly boxed (rather than a plain `async fn`) so the returned
    /// future is a concrete `dyn Future` instead of an opaque type — the
    /// body below recurses back into this function indirectly (via
    /// `drain_for_target` -> `drain_group`), and an opaque return type
    /// there creates a cycle rustc cannot resolve the `Send`-ness of.
    pub(crate) fn dispatch_prearmed<'a>(
        inner: &'a Arc<Inner>,
        target: &'a str,
        channel: Arc<dyn Channel>,
        action: &'a str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<SendResult, PeepsyError>> + Send + 'a>> {
        Box::pin(dispatch_prearmed_inner(
            inner, target, channel, action, data, timeout,
        ))
    }

    async fn dispatch_prearmed_inner(
        inner: &Arc<Inner>,
        target: &str,
        channel: Arc<dyn Channel>,
        action: &str,
        data: Option<Value>,
        timeout: Duration,
    ) -> Result<SendResult, PeepsyError> {
        let req = Request::new(action, data, Some(timeout.as_millis() as u64));
        let id = req.id;

        let (tx, rx) = oneshot::channel();
        let timer = {
            let inner = inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                fire_timeout(inner, id, timeout).await;
            })
        };
        inner.active.lock().await.insert(
            id,
            ActiveRequest {
                target: target.to_string(),
                started: Instant::now(),
                timer,
                resolver: tx,
            },
        );

        if let Err(e) = channel.send(&Envelope::Request(req)).await {
            if let Some(entry) = inner.active.lock().await.remove(&id) {
                entry.timer.abort();
            }
            {
                let mut state = inner.state.lock().await;
                if let Some(record) = state.workers.get_mut(target) {
                    record.stats.requests_active = record.stats.requests_active.saturating_sub(1);
                }
            }
            drain_for_target(inner, target).await;
            return Err(PeepsyError::process(format!(
                "Failed to send request to {}: {}",
                target, e
            )));
        }

        match rx.await {
            Err(_) => Err(PeepsyError::process("Request dropped during master shutdown")),
            Ok(Err(e)) => Err(e),
            Ok(Ok(resp)) => {
                if resp.is_error() {
                    Err(PeepsyError::new(
                        resp.error_message().unwrap_or("Request failed").to_string(),
                    ))
                } else {
                    Ok(SendResult {
                        id,
                        status: resp.status,
                        data: resp.data,
                    })
                }
            }
        }
    }
}
use dispatch_prearmed_mod::dispatch_prearmed;

async fn fire_timeout(inner: Arc<Inner>, id: Uuid, timeout: Duration) {
    let Some(entry) = inner.active.lock().await.remove(&id) else {
        return;
    };
    {
        let mut state = inner.state.lock().await;
        if let Some(record) = state.workers.get_mut(&entry.target) {
            record.stats.requests_active = record.stats.requests_active.saturating_sub(1);
            record.stats.errors += 1;
        }
    }
    debug!("Request {} to {} timed out", id, entry.target);
    let _ = entry.resolver.send(Err(PeepsyError::timeout(format!(
        "Request timed out after {}ms",
        timeout.as_millis()
    ))));
    drain_for_target(&inner, &entry.target).await;
}

async fn handle_response(inner: &Arc<Inner>, resp: Response) {
    let Some(entry) = inner.active.lock().await.remove(&resp.id) else {
        // Late reply to a request that already timed out, or a reply this
        // master never sent. Dropped with no side effects.
        debug!("Discarding response {} with no matching request", resp.id);
        return;
    };
    entry.timer.abort();
    let sample_ms = entry.started.elapsed().as_millis() as f64;
    {
        let mut state = inner.state.lock().await;
        if let Some(record) = state.workers.get_mut(&entry.target) {
            record.stats.requests_active = record.stats.requests_active.saturating_sub(1);
            record.stats.record_response(sample_ms);
        }
    }
    let _ = entry.resolver.send(Ok(resp));
    drain_for_target(inner, &entry.target).await;
}

async fn handle_heartbeat(inner: &Arc<Inner>, target: &str, heartbeat: Heartbeat) {
    let mut state = inner.state.lock().await;
    if let Some(record) = state.workers.get_mut(target) {
        let now = now_ms();
        record.stats.last_heartbeat_at = now;
        record.stats.last_activity = now;
        debug!(
            "{}: heartbeat (pid {}, {} active)",
            target,
            heartbeat.pid,
            heartbeat.requests_active.unwrap_or(0)
        );
    }
}

async fn handle_child_request(
    inner: Arc<Inner>,
    target: String,
    channel: Arc<dyn Channel>,
    req: Request,
) {
    let response = match inner.registry.dispatch(&req.action, req.data_or_null()).await {
        None => Response::not_found(req.id, &req.action),
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
    if let Err(e) = channel.send(&Envelope::Response(response)).await {
        warn!("{}: failed to answer child request {}: {}", target, req.id, e);
    }
}

/// A freed slot on any group member may run a queued request on any other
/// member: parked requests are re-routed through the strategy.
async fn drain_for_target(inner: &Arc<Inner>, target: &str) {
    let group_id = {
        let state = inner.state.lock().await;
        state.workers.get(target).and_then(|r| r.group.clone())
    };
    if let Some(group_id) = group_id {
        drain_group(inner, &group_id).await;
    }
}

pub(crate) async fn drain_group(inner: &Arc<Inner>, group_id: &str) {
    loop {
        let dispatched = {
            let mut state = inner.state.lock().await;
            let State { workers, groups } = &mut *state;
            let Some(group) = groups.get_mut(group_id) else {
                return;
            };
            if group.pending.is_empty() {
                return;
            }
            if let Some(cap) = group.settings.max_concurrency {
                let active: u64 = group
                    .targets
                    .iter()
                    .filter_map(|t| workers.get(t))
                    .map(|r| r.stats.requests_active)
                    .sum();
                if active as usize >= cap {
                    return;
                }
            }
            let Some(pending) = group.pending.pop_front() else {
                return;
            };
            match group.select(&|t| workers.get(t).map(|r| r.stats.requests_active).unwrap_or(0)) {
                Ok(target) => match workers.get_mut(&target) {
                    Some(record) => {
                        record.stats.requests_active += 1;
                        record.stats.last_activity = now_ms();
                        Some((pending, target, record.channel.clone()))
                    }
                    None => {
                        let _ = pending.resolver.send(Err(PeepsyError::not_found(format!(
                            "Unknown target: {}",
                            target
                        ))));
                        None
                    }
                },
                Err(e) => {
                    let _ = pending.resolver.send(Err(e));
                    None
                }
            }
        };

        match dispatched {
            Some((pending, target, channel)) => {
                debug!(
                    "Dispatching queued {} to {} after {}ms parked",
                    pending.action,
                    target,
                    pending.enqueued_at.elapsed().as_millis()
                );
                let inner = inner.clone();
                tokio::spawn(async move {
                    let result = dispatch_prearmed(
                        &inner,
                        &target,
                        channel,
                        &pending.action,
                        pending.data,
                        pending.timeout,
                    )
                    .await;
                    let _ = pending.resolver.send(result);
                });
            }
            None => continue,
        }
    }
}

fn spawn_read_loop(
    inner: Arc<Inner>,
    target: String,
    generation: u64,
    channel: Arc<dyn Channel>,
    control: Arc<dyn ChildControl>,
) {
    tokio::spawn(async move {
        loop {
            let Some(envelope) = channel.recv().await else {
                break;
            };
            match envelope {
                Envelope::Response(resp) => handle_response(&inner, resp).await,
                Envelope::Request(req) => {
                    tokio::spawn(handle_child_request(
                        inner.clone(),
                        target.clone(),
                        channel.clone(),
                        req,
                    ));
                }
                Envelope::Heartbeat(hb) => handle_heartbeat(&inner, &target, hb).await,
                other => debug!("{}: ignoring {} envelope", target, other.kind()),
            }
        }
        let info = control.wait().await;
        handle_exit(inner, target, generation, info).await;
    });
}

pub(crate) async fn spawn_worker(
    inner: &Arc<Inner>,
    target: &str,
    spec: SpawnSpec,
) -> Result<(), PeepsyError> {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return Err(PeepsyError::new("Cannot spawn while master is shutting down"));
    }
    if inner.state.lock().await.workers.contains_key(target) {
        return Err(PeepsyError::new(format!("Target already exists: {}", target)));
    }

    let child = inner.host.spawn(target, &spec).await?;
    if let Err(e) = child
        .channel
        .send(&Envelope::Init(Init { mode: spec.mode }))
        .await
    {
        let _ = child.control.kill().await;
        return Err(PeepsyError::process(format!(
            "Failed to initialize {}: {}",
            target, e
        )));
    }

    let generation = inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
    let (exited_tx, _) = watch::channel(false);
    {
        let mut state = inner.state.lock().await;
        if state.workers.contains_key(target) {
            let _ = child.control.kill().await;
            return Err(PeepsyError::new(format!("Target already exists: {}", target)));
        }
        state.workers.insert(
            target.to_string(),
            WorkerRecord {
                spec: spec.clone(),
                generation,
                pid: child.pid,
                channel: child.channel.clone(),
                control: child.control.clone(),
                stats: ProcessStats::new(),
                group: spec.group.clone(),
                no_restart_once: false,
                exited_tx,
            },
        );
        if let Some(group_id) = &spec.group {
            state
                .groups
                .entry(group_id.clone())
                .or_insert_with(Group::new)
                .add_target(target);
        }
    }

    spawn_read_loop(
        inner.clone(),
        target.to_string(),
        generation,
        child.channel,
        child.control,
    );
    info!("Spawned worker {} (pid {})", target, child.pid);
    inner.events.emit(&MasterEvent::Spawn {
        target: target.to_string(),
    });
    Ok(())
}

/// Re-spawn after an exit, replacing the record in place so group
/// membership and list position survive.
async fn respawn_worker(
    inner: &Arc<Inner>,
    target: &str,
    spec: SpawnSpec,
) -> Result<(), PeepsyError> {
    let child = inner.host.spawn(target, &spec).await?;
    if let Err(e) = child
        .channel
        .send(&Envelope::Init(Init { mode: spec.mode }))
        .await
    {
        let _ = child.control.kill().await;
        return Err(PeepsyError::process(format!(
            "Failed to initialize {}: {}",
            target, e
        )));
    }

    let generation = inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
    let (exited_tx, _) = watch::channel(false);
    {
        let mut state = inner.state.lock().await;
        let Some(record) = state.workers.get_mut(target) else {
            let _ = child.control.kill().await;
            return Err(PeepsyError::new(format!(
                "Target {} removed during restart",
                target
            )));
        };
        record.generation = generation;
        record.pid = child.pid;
        record.channel = child.channel.clone();
        record.control = child.control.clone();
        record.stats = ProcessStats::new();
        record.exited_tx = exited_tx;
        record.no_restart_once = false;
    }

    spawn_read_loop(
        inner.clone(),
        target.to_string(),
        generation,
        child.channel,
        child.control,
    );
    info!("Restarted worker {} (pid {})", target, child.pid);
    inner.events.emit(&MasterEvent::Spawn {
        target: target.to_string(),
    });
    Ok(())
}

enum ExitDisposition {
    Restart(SpawnSpec),
    Cleanup,
}

async fn handle_exit(inner: Arc<Inner>, target: String, generation: u64, info: ExitInfo) {
    let disposition = {
        let mut state = inner.state.lock().await;
        let State { workers, groups } = &mut *state;
        let Some(record) = workers.get_mut(&target) else {
            return;
        };
        if record.generation != generation {
            // An exit observed for a process that was already replaced.
            return;
        }
        let _ = record.exited_tx.send(true);

        let group_disabled = record
            .group
            .as_ref()
            .and_then(|g| groups.get(g))
            .map(|g| g.settings.disable_auto_restart)
            .unwrap_or(false);
        let restart = !inner.shutting_down.load(Ordering::SeqCst)
            && !record.no_restart_once
            && !record.spec.disable_auto_restart
            && !group_disabled;

        if restart {
            record.stats.status = WorkerStatus::Restarting;
            ExitDisposition::Restart(record.spec.clone())
        } else {
            record.stats.status = WorkerStatus::Gone;
            remove_worker_locked(workers, groups, &target);
            ExitDisposition::Cleanup
        }
    };

    info!(
        "Worker {} exited (code={:?}, signal={:?})",
        target, info.code, info.signal
    );
    reject_active_for_target(&inner, &target).await;

    match disposition {
        ExitDisposition::Cleanup => {}
        ExitDisposition::Restart(spec) => match respawn_worker(&inner, &target, spec).await {
            Ok(()) => {
                inner.events.emit(&MasterEvent::AutoRestart {
                    target: target.clone(),
                    code: info.code,
                    signal: info.signal,
                });
            }
            Err(e) => {
                error!("{}: restart failed: {}", target, e);
                inner.events.emit(&MasterEvent::Error {
                    target: target.clone(),
                    message: e.to_string(),
                });
                let mut state = inner.state.lock().await;
                let State { workers, groups } = &mut *state;
                remove_worker_locked(workers, groups, &target);
            }
        },
    }
}

/// Remove a worker record and its group membership; deleting a group that
/// became empty rejects anything still parked on it.
fn remove_worker_locked(
    workers: &mut HashMap<String, WorkerRecord>,
    groups: &mut HashMap<String, Group>,
    target: &str,
) {
    let Some(record) = workers.remove(target) else {
        return;
    };
    if let Some(group_id) = record.group {
        let emptied = groups
            .get_mut(&group_id)
            .map(|g| g.remove_target(target))
            .unwrap_or(false);
        if emptied {
            if let Some(mut group) = groups.remove(&group_id) {
                for pending in group.pending.drain(..) {
                    let _ = pending.resolver.send(Err(PeepsyError::not_found(format!(
                        "Group {} has no targets",
                        group_id
                    ))));
                }
            }
        }
    }
}

/// Reject every in-flight request aimed at a target that just exited.
async fn reject_active_for_target(inner: &Arc<Inner>, target: &str) {
    let victims: Vec<ActiveRequest> = {
        let mut active = inner.active.lock().await;
        let ids: Vec<Uuid> = active
            .iter()
            .filter(|(_, a)| a.target == target)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| active.remove(&id)).collect()
    };
    for entry in victims {
        entry.timer.abort();
        let _ = entry.resolver.send(Err(PeepsyError::process(format!(
            "Worker {} exited before responding",
            target
        ))));
    }
}

pub(crate) async fn shutdown_child_inner(
    inner: &Arc<Inner>,
    target: &str,
    timeout: Duration,
) -> Result<(), PeepsyError> {
    let (channel, control, mut exited) = {
        let mut state = inner.state.lock().await;
        let record = state
            .workers
            .get_mut(target)
            .ok_or_else(|| PeepsyError::not_found(format!("Unknown target: {}", target)))?;
        record.no_restart_once = true;
        (
            record.channel.clone(),
            record.control.clone(),
            record.exited_tx.subscribe(),
        )
    };

    if let Err(e) = channel.send(&Envelope::Shutdown).await {
        debug!("{}: SHUTDOWN send failed (already disconnected?): {}", target, e);
    }

    tokio::select! {
        _ = exited.changed() => {}
        _ = tokio::time::sleep(timeout) => {
            warn!("{}: graceful shutdown timed out after {:?}, killing", target, timeout);
            let _ = control.kill().await;
            let _ = exited.changed().await;
        }
    }
    Ok(())
}

pub(crate) async fn shutdown_all_inner(inner: &Arc<Inner>, timeout: Duration) {
    inner.shutting_down.store(true, Ordering::SeqCst);

    let parked: Vec<PendingSend> = {
        let mut state = inner.state.lock().await;
        state
            .groups
            .values_mut()
            .flat_map(|g| g.pending.drain(..))
            .collect()
    };
    for pending in parked {
        let _ = pending
            .resolver
            .send(Err(PeepsyError::new("Master is shutting down")));
    }

    let targets: Vec<String> = {
        let state = inner.state.lock().await;
        state.workers.keys().cloned().collect()
    };
    info!("Shutting down {} workers", targets.len());
    let shutdowns = targets
        .iter()
        .map(|t| shutdown_child_inner(inner, t, timeout));
    for result in futures::future::join_all(shutdowns).await {
        if let Err(e) = result {
            debug!("Shutdown race: {}", e);
        }
    }
}
