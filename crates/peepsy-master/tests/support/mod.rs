//! In-process host: runs real worker runtimes on in-memory channel pairs
//! so the full master/worker protocol is exercised without OS processes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};

use peepsy_master::{ChildControl, ExitInfo, ProcessHost, SpawnSpec, SpawnedChild};
use peepsy_proto::{pair, Channel, HandlerRegistry, PeepsyError};
use peepsy_worker::{Worker, WorkerHandle, WorkerOptions};

type RegistryFactory = Box<dyn Fn(&str) -> HandlerRegistry + Send + Sync>;

pub struct InProcessHost {
    next_pid: AtomicU32,
    factory: RegistryFactory,
    default_options: WorkerOptions,
    options_overrides: Mutex<HashMap<String, WorkerOptions>>,
    handles: Mutex<HashMap<String, WorkerHandle>>,
}

impl InProcessHost {
    pub fn new<F>(factory: F) -> Arc<Self>
    where
        F: Fn(&str) -> HandlerRegistry + Send + Sync + 'static,
    {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            factory: Box::new(factory),
            // Heartbeats off by default; tests that want them opt in.
            default_options: WorkerOptions::new().with_heartbeat_interval_ms(600_000),
            options_overrides: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Worker options for one target (applies to spawns after this call).
    pub fn set_worker_options(&self, target: &str, options: WorkerOptions) {
        self.options_overrides
            .lock()
            .unwrap()
            .insert(target.to_string(), options);
    }

    /// Handle of the most recently spawned worker for a target.
    pub fn worker_handle(&self, target: &str) -> WorkerHandle {
        self.handles
            .lock()
            .unwrap()
            .get(target)
            .expect("worker spawned")
            .clone()
    }
}

#[async_trait]
impl ProcessHost for InProcessHost {
    async fn spawn(&self, target: &str, spec: &SpawnSpec) -> Result<SpawnedChild, PeepsyError> {
        if spec.program.to_string_lossy() == "fail" {
            return Err(PeepsyError::process(format!(
                "Failed to spawn {}: simulated",
                target
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (master_side, worker_side) = pair();
        let master_side: Arc<dyn Channel> = Arc::new(master_side);

        let mut options = self
            .options_overrides
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.default_options.clone());
        options = options.with_reported_pid(pid);
        if let Some(max) = spec.max_concurrency {
            options = options.with_max_concurrency(max);
        }

        let worker = Worker::new(Arc::new(worker_side), (self.factory)(target), options);
        self.handles
            .lock()
            .unwrap()
            .insert(target.to_string(), worker.handle());
        let mut run_task = tokio::spawn(worker.run());

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel(None::<ExitInfo>);
        let channel_for_kill = master_side.clone();
        tokio::spawn(async move {
            let info = tokio::select! {
                _ = &mut run_task => ExitInfo { code: Some(0), signal: None },
                _ = kill_rx.recv() => {
                    run_task.abort();
                    channel_for_kill.close().await;
                    ExitInfo { code: None, signal: Some(9) }
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        Ok(SpawnedChild {
            pid,
            channel: master_side,
            control: Arc::new(InProcessControl { kill_tx, exit_rx }),
        })
    }
}

struct InProcessControl {
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

#[async_trait]
impl ChildControl for InProcessControl {
    async fn kill(&self) -> Result<(), PeepsyError> {
        let _ = self.kill_tx.send(()).await;
        Ok(())
    }

    async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = *rx.borrow() {
                return info;
            }
            if rx.changed().await.is_err() {
                return ExitInfo {
                    code: None,
                    signal: None,
                };
            }
        }
    }
}

/// Handlers every scenario worker carries: `delay {ms}`, `echo` (answers
/// with the payload and which worker served it), and `fail {message}`.
pub fn scenario_registry(target: &str) -> HandlerRegistry {
    let registry = HandlerRegistry::new();
    registry.register_raw("delay", |data| {
        Box::pin(async move {
            let ms = data.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
            sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "delayed": ms }))
        })
    });
    {
        let target = target.to_string();
        registry.register_raw("echo", move |data| {
            let target = target.clone();
            Box::pin(async move { Ok(json!({ "echoed": data, "worker": target })) })
        });
    }
    registry.register_raw("fail", |data| {
        Box::pin(async move {
            let message = data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("handler failed")
                .to_string();
            Err(anyhow::anyhow!(message))
        })
    });
    registry
}

pub fn scenario_host() -> Arc<InProcessHost> {
    InProcessHost::new(scenario_registry)
}

/// Worker spec for in-process spawns; the program path is unused by the
/// host but kept realistic.
pub fn worker_spec() -> SpawnSpec {
    SpawnSpec::new("/opt/peepsy/worker")
}
